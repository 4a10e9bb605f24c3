// Per-game synchronization log.
//
// Two things live here:
//
// - The sync tag counter. Every peer allocates tags in the same order at the
//   same decision points, so tag `n` names the same decision everywhere. The
//   counter starts at zero when the game is created; the first tag is 1 and
//   tags are never reused.
// - The packet log. Inbound packets (relay echoes and reveals) are appended in
//   arrival order and stay unclaimed until a waiter takes them. `expect`
//   hands out the oldest unclaimed packet matching a `TagPattern`, so packets
//   that arrive before anyone waits for them are never lost. Outbound packets
//   get a serial from `feed_send` and are kept for audit.
//
// The inbound log is append-only and serializable; `SyncLog::replay` rebuilds
// a log from it so a finished game can be re-run deterministically.
//
// Malformed and duplicate tags are logged and dropped; neither is fatal.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use gamesync_protocol::{DataTag, SyncTag, TagPattern};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::lock;

/// One tagged payload, inbound or outbound.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub serial: u64,
    pub tag: String,
    pub data: Value,
}

pub struct SyncLog {
    counter: AtomicU64,
    state: Mutex<LogState>,
    arrived: Notify,
}

#[derive(Default)]
struct LogState {
    received: Vec<Packet>,
    /// Indices into `received`, oldest first.
    unclaimed: VecDeque<usize>,
    seen: HashSet<String>,
    sent: Vec<Packet>,
    last_serial: u64,
    closed: bool,
}

impl LogState {
    fn claim(&mut self, pattern: &TagPattern) -> Option<Packet> {
        let pos = self
            .unclaimed
            .iter()
            .position(|&idx| pattern.matches(&self.received[idx].tag))?;
        let idx = self.unclaimed.remove(pos)?;
        Some(self.received[idx].clone())
    }
}

impl Default for SyncLog {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncLog {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            state: Mutex::new(LogState::default()),
            arrived: Notify::new(),
        }
    }

    /// Rebuild a log from a recorded inbound stream.
    pub fn replay(records: impl IntoIterator<Item = Packet>) -> Self {
        let log = Self::new();
        for p in records {
            log.record(p.serial, &p.tag, p.data);
        }
        log
    }

    /// Allocate the next sync tag.
    pub fn next_tag(&self) -> SyncTag {
        SyncTag(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// The most recently allocated tag (0 before the first allocation).
    pub fn current_tag(&self) -> SyncTag {
        SyncTag(self.counter.load(Ordering::SeqCst))
    }

    /// Append an inbound packet and wake waiters. Returns `false` when the
    /// packet was dropped.
    pub fn record(&self, serial: u64, tag: &str, data: Value) -> bool {
        if let Err(err) = tag.parse::<DataTag>() {
            warn!(tag, serial, %err, "dropping packet with malformed tag");
            return false;
        }
        {
            let mut st = lock(&self.state);
            if st.closed {
                debug!(tag, serial, "dropping packet for closed log");
                return false;
            }
            if !st.seen.insert(tag.to_string()) {
                warn!(tag, serial, "dropping duplicate packet");
                return false;
            }
            st.last_serial = st.last_serial.max(serial);
            let idx = st.received.len();
            st.received.push(Packet {
                serial,
                tag: tag.to_string(),
                data,
            });
            st.unclaimed.push_back(idx);
        }
        self.arrived.notify_waiters();
        true
    }

    /// Take the oldest unclaimed packet matching `pattern`, if one is here.
    pub fn try_take(&self, pattern: &TagPattern) -> Option<Packet> {
        lock(&self.state).claim(pattern)
    }

    /// Wait for the oldest unclaimed packet matching `pattern`.
    ///
    /// `deadline: None` waits until a match arrives or the log is closed.
    pub async fn expect(
        &self,
        pattern: &TagPattern,
        deadline: Option<Instant>,
    ) -> Result<Packet, SyncError> {
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = lock(&self.state);
                if let Some(packet) = st.claim(pattern) {
                    return Ok(packet);
                }
                if st.closed {
                    return Err(SyncError::Closed);
                }
            }
            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        return Err(SyncError::Timeout {
                            pattern: pattern.to_string(),
                        });
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Register an outbound packet and give it the next serial.
    pub fn feed_send(&self, tag: &str, data: Value) -> Packet {
        let mut st = lock(&self.state);
        let packet = Packet {
            serial: st.sent.len() as u64 + 1,
            tag: tag.to_string(),
            data,
        };
        st.sent.push(packet.clone());
        packet
    }

    /// Highest inbound serial recorded so far.
    pub fn last_serial(&self) -> u64 {
        lock(&self.state).last_serial
    }

    /// The inbound stream in arrival order.
    pub fn received(&self) -> Vec<Packet> {
        lock(&self.state).received.clone()
    }

    pub fn sent(&self) -> Vec<Packet> {
        lock(&self.state).sent.clone()
    }

    pub fn unclaimed_len(&self) -> usize {
        lock(&self.state).unclaimed.len()
    }

    /// Refuse further packets and fail every waiter with `SyncError::Closed`.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.arrived.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn any_pick() -> TagPattern {
        TagPattern::parse("R&Pick:*")
    }

    #[test]
    fn tags_start_at_one_and_increase() {
        let log = SyncLog::new();
        assert_eq!(log.current_tag(), SyncTag(0));
        assert_eq!(log.next_tag(), SyncTag(1));
        assert_eq!(log.next_tag(), SyncTag(2));
        assert_eq!(log.current_tag(), SyncTag(2));
    }

    #[tokio::test]
    async fn early_arrival_is_kept_for_later_waiter() {
        let log = SyncLog::new();
        assert!(log.record(1, "R&Pick:1", json!(3)));
        let p = log.expect(&any_pick(), None).await.unwrap();
        assert_eq!(p.tag, "R&Pick:1");
        assert_eq!(p.data, json!(3));
        assert_eq!(log.unclaimed_len(), 0);
    }

    #[tokio::test]
    async fn matching_is_fifo_and_pattern_scoped() {
        let log = SyncLog::new();
        log.record(1, "R&Pick:2", json!("b"));
        log.record(2, "R|Other:9", json!("x"));
        log.record(3, "R&Pick:1", json!("a"));

        let first = log.expect(&any_pick(), None).await.unwrap();
        let second = log.expect(&any_pick(), None).await.unwrap();
        assert_eq!((first.serial, second.serial), (1, 3));

        let other = log.try_take(&TagPattern::parse("R|Other:*")).unwrap();
        assert_eq!(other.data, json!("x"));
        assert!(log.try_take(&any_pick()).is_none());
    }

    #[test]
    fn malformed_and_duplicate_tags_are_dropped() {
        let log = SyncLog::new();
        assert!(!log.record(1, "garbage", json!(null)));
        assert!(log.record(2, "Sync:4", json!(1)));
        assert!(!log.record(3, "Sync:4", json!(2)));
        assert_eq!(log.received().len(), 1);
        assert_eq!(log.last_serial(), 2);
    }

    #[tokio::test]
    async fn waiter_wakes_on_later_record() {
        let log = Arc::new(SyncLog::new());
        let waiter = {
            let log = Arc::clone(&log);
            tokio::spawn(async move { log.expect(&TagPattern::reveal(SyncTag(5)), None).await })
        };
        tokio::task::yield_now().await;
        log.record(10, "Sync:4", json!("not this one"));
        log.record(11, "Sync:5", json!(["card"]));
        let p = waiter.await.unwrap().unwrap();
        assert_eq!(p.serial, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn expect_times_out_at_deadline() {
        let log = SyncLog::new();
        let start = Instant::now();
        let err = log
            .expect(&any_pick(), Some(start + Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout { .. }));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let log = Arc::new(SyncLog::new());
        let waiter = {
            let log = Arc::clone(&log);
            tokio::spawn(async move { log.expect(&any_pick(), None).await })
        };
        tokio::task::yield_now().await;
        log.close();
        assert!(matches!(waiter.await.unwrap(), Err(SyncError::Closed)));
        assert!(!log.record(1, "R&Pick:1", json!(1)));
    }

    #[test]
    fn feed_send_numbers_outbound_packets() {
        let log = SyncLog::new();
        assert_eq!(log.feed_send("I&Pick:1", json!(1)).serial, 1);
        assert_eq!(log.feed_send("I&Pick:2", json!(2)).serial, 2);
        assert_eq!(log.sent().len(), 2);
    }

    #[tokio::test]
    async fn replay_rebuilds_claimable_log() {
        let original = SyncLog::new();
        original.record(1, "R&Pick:1", json!(7));
        original.record(2, "Sync:2", json!({"card": 3}));
        let saved = serde_json::to_string(&original.received()).unwrap();

        let records: Vec<Packet> = serde_json::from_str(&saved).unwrap();
        let replayed = SyncLog::replay(records);
        assert_eq!(replayed.last_serial(), 2);
        let reveal = replayed
            .expect(&TagPattern::reveal(SyncTag(2)), None)
            .await
            .unwrap();
        assert_eq!(reveal.data, json!({"card": 3}));
    }

    proptest! {
        #[test]
        fn allocation_is_strictly_increasing(n in 1usize..200) {
            let log = SyncLog::new();
            let tags: Vec<SyncTag> = (0..n).map(|_| log.next_tag()).collect();
            prop_assert!(tags.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(tags.last().copied(), Some(SyncTag(n as u64)));
        }
    }
}
