// Multi-player decision collection.
//
// A decision round asks one or more seated players the same kind of question
// ("which card?", "respond to this attack?") and waits until every target has
// answered or the round's time is up. All peers run the same round in
// lockstep:
//
// 1. One sync tag is allocated per target, in target order, on every peer.
// 2. The peer whose own player is a target (and who is not just observing)
//    spawns a resolver task. It asks the embedder's `InputResolver` (UI or
//    AI) and writes the answer as `I<mode><op>:<tag>` through the game's
//    `Link`. The resolver is bounded by `timeout + RESOLVER_GRACE`; if the
//    embedder does not answer in time it sends `null`.
// 3. The relay echoes the first request for each tag back as
//    `R<mode><op>:<tag>` and drops any later request for it. Every peer
//    consumes those echoes from its sync log in the relay's arrival order,
//    which is the same order everywhere, and matches them to targets by tag.
//    Echoes for tags that are not pending (late answers to an earlier round)
//    are logged and skipped.
// 4. When a peer's own deadline passes it writes a `null` request for every
//    target still missing, and repeats that every `CLAIM_RETRY` in case the
//    write was lost to a dropped connection. Whether the real answer or some
//    peer's claim reached the relay first, every peer sees the same echo, so
//    the timeout is decided once, in the relay's order, for every peer and
//    for seats whose player is gone. The round ends only when every target
//    has its echo. The resolver task is aborted and joined before returning,
//    and is also aborted if the round itself is dropped mid-wait.
//
// In `Any` mode the round still consumes every answer, so no tag lingers,
// and the winner is the first accepted answer in arrival order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use gamesync_protocol::{DataTag, GameId, InputMode, PlayerId, SyncTag, TagPattern};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::{GameError, InputError, SyncError};
use crate::events::{GameEvents, InputFinished, InputStarted, TransactionInfo, TransactionNotice};
use crate::link::Link;
use crate::sync_log::SyncLog;

/// Extra time the local resolver gets beyond the round's own timeout.
pub const RESOLVER_GRACE: Duration = Duration::from_secs(1);

/// How often unanswered targets are claimed again once the deadline passed.
pub const CLAIM_RETRY: Duration = Duration::from_secs(1);

/// A kind of decision: its name on the wire and how to read answers.
pub trait Inputlet: Send + Sync + 'static {
    type Output: Clone + Send + Sync + fmt::Debug + 'static;

    /// Operation name used in tags. Must satisfy `tag::is_valid_op`.
    fn op(&self) -> &str;

    /// Decode one player's answer. `Ok(None)` means the player declined.
    fn parse(&self, actor: PlayerId, data: &Value) -> Result<Option<Self::Output>, InputError>;

    /// Description of the choices, handed to the resolver.
    fn metadata(&self, _actor: PlayerId) -> Value {
        Value::Null
    }

    /// An answer the core can give without asking the embedder.
    fn resolve_locally(&self, _actor: PlayerId) -> Option<Value> {
        None
    }

    /// Last chance to adjust or veto a parsed answer.
    fn post_process(&self, _actor: PlayerId, result: Option<Self::Output>) -> Option<Self::Output> {
        result
    }
}

/// What the local resolver is asked to decide.
#[derive(Clone, Debug)]
pub struct InputRequest {
    pub gid: GameId,
    pub trans: TransactionInfo,
    pub actor: PlayerId,
    pub op: String,
    pub mode: InputMode,
    pub sync: SyncTag,
    pub timeout: Duration,
    pub metadata: Value,
}

/// The embedder's answer source (UI prompt, AI, scripted test player).
#[async_trait]
pub trait InputResolver: Send + Sync + 'static {
    /// Return the answer payload, or `Value::Null` to decline.
    async fn resolve(&self, request: InputRequest) -> Value;
}

/// Declines everything.
pub struct PassResolver;

#[async_trait]
impl InputResolver for PassResolver {
    async fn resolve(&self, _request: InputRequest) -> Value {
        Value::Null
    }
}

static NEXT_TRANSACTION: AtomicU64 = AtomicU64::new(1);

/// Groups the input rounds of one logical interaction for observers.
///
/// Opening emits `transaction_begin`, dropping emits `transaction_end`.
pub struct InputTransaction<'e> {
    events: &'e GameEvents,
    info: TransactionInfo,
}

impl<'e> InputTransaction<'e> {
    pub fn open(
        events: &'e GameEvents,
        name: impl Into<String>,
        players: Vec<PlayerId>,
        mapping: Value,
    ) -> Self {
        let info = TransactionInfo {
            id: NEXT_TRANSACTION.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            players,
            mapping,
        };
        events.transaction_begin.emit(info.clone());
        Self { events, info }
    }

    pub fn info(&self) -> &TransactionInfo {
        &self.info
    }

    /// Tell observers something happened inside this transaction.
    pub fn notify(&self, event: impl Into<String>, payload: Value) {
        self.events.transaction_notice.emit(TransactionNotice {
            trans: self.info.clone(),
            event: event.into(),
            payload,
        });
    }
}

impl Drop for InputTransaction<'_> {
    fn drop(&mut self) {
        self.events.transaction_end.emit(self.info.clone());
    }
}

/// Result of a round, shaped by its mode.
#[derive(Clone, Debug, PartialEq)]
pub enum InputOutcome<T> {
    Single(Option<T>),
    /// The first accepted answer in arrival order.
    Any(Option<(PlayerId, T)>),
    /// Every target in the original order.
    All(Vec<(PlayerId, Option<T>)>),
}

impl<T> InputOutcome<T> {
    pub fn into_single(self) -> Option<T> {
        match self {
            InputOutcome::Single(v) => v,
            _ => None,
        }
    }

    pub fn into_any(self) -> Option<(PlayerId, T)> {
        match self {
            InputOutcome::Any(v) => v,
            _ => None,
        }
    }

    pub fn into_all(self) -> Vec<(PlayerId, Option<T>)> {
        match self {
            InputOutcome::All(v) => v,
            _ => Vec::new(),
        }
    }
}

/// Everything a round needs from its game.
#[derive(Clone, Copy)]
pub struct InputContext<'a> {
    pub gid: GameId,
    pub log: &'a Arc<SyncLog>,
    pub events: &'a GameEvents,
    pub link: &'a Arc<dyn Link>,
    pub resolver: &'a Arc<dyn InputResolver>,
    pub me: Option<PlayerId>,
    pub observe: bool,
    /// Propagate answer parse failures instead of treating them as `None`.
    pub debug: bool,
}

/// Run one decision round. See the module docs for the protocol.
pub async fn collect<I: Inputlet>(
    cx: InputContext<'_>,
    players: &[PlayerId],
    inputlet: I,
    timeout: Duration,
    mode: InputMode,
    trans: Option<&InputTransaction<'_>>,
) -> Result<InputOutcome<I::Output>, GameError> {
    if mode == InputMode::Single && players.len() != 1 {
        return Err(InputError::SingleRequiresOne {
            count: players.len(),
        }
        .into());
    }

    let own;
    let trans = match trans {
        Some(t) => t,
        None => {
            own = InputTransaction::open(cx.events, inputlet.op(), players.to_vec(), Value::Null);
            &own
        }
    };

    let mut pending: BTreeMap<SyncTag, usize> = BTreeMap::new();
    let mut seats: Vec<(PlayerId, SyncTag)> = Vec::with_capacity(players.len());
    for (idx, &actor) in players.iter().enumerate() {
        let sync = cx.log.next_tag();
        pending.insert(sync, idx);
        seats.push((actor, sync));
    }
    for &(actor, sync) in &seats {
        cx.events.input_started.emit(InputStarted {
            trans: trans.info().clone(),
            actor,
            sync,
        });
    }

    let resolver = cx
        .me
        .filter(|_| !cx.observe)
        .and_then(|me| seats.iter().find(|(actor, _)| *actor == me).copied())
        .map(|(me, sync)| {
            let request = InputRequest {
                gid: cx.gid,
                trans: trans.info().clone(),
                actor: me,
                op: inputlet.op().to_string(),
                mode,
                sync,
                timeout,
                metadata: inputlet.metadata(me),
            };
            LocalResolver::spawn(&cx, request, inputlet.resolve_locally(me))
        });

    cx.events.input_waiting.emit(trans.info().clone());

    let mut deadline = Instant::now() + timeout;
    let pattern = TagPattern::responses(mode, inputlet.op());
    let mut results: Vec<Option<I::Output>> = vec![None; seats.len()];
    let mut winner: Option<usize> = None;

    while !pending.is_empty() {
        let packet = match cx.log.expect(&pattern, Some(deadline)).await {
            Ok(packet) => packet,
            Err(SyncError::Timeout { .. }) => {
                claim_timeouts(&cx, mode, inputlet.op(), pending.keys().copied());
                deadline = Instant::now() + CLAIM_RETRY;
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let Ok(tag) = packet.tag.parse::<DataTag>() else {
            continue;
        };
        let Some(idx) = pending.remove(&tag.sync()) else {
            warn!(tag = %packet.tag, "unexpected sync tag in input round");
            continue;
        };
        let (actor, sync) = seats[idx];

        let parsed = match inputlet.parse(actor, &packet.data) {
            Ok(v) => v,
            Err(err) if cx.debug => return Err(err.into()),
            Err(err) => {
                error!(%err, "discarding unparseable answer");
                None
            }
        };
        let result = inputlet.post_process(actor, parsed);

        cx.events.input_finished.emit(InputFinished {
            trans: trans.info().clone(),
            actor,
            sync,
            data: packet.data,
            accepted: result.is_some(),
        });

        if mode == InputMode::Any && winner.is_none() && result.is_some() {
            winner = Some(idx);
        }
        results[idx] = result;
    }

    cx.events.input_waited.emit(trans.info().clone());
    if let Some(resolver) = resolver {
        resolver.finish().await;
    }

    Ok(match mode {
        InputMode::Single => InputOutcome::Single(results.into_iter().next().flatten()),
        InputMode::Any => InputOutcome::Any(winner.and_then(|idx| {
            let value = results.get_mut(idx).and_then(Option::take)?;
            Some((seats[idx].0, value))
        })),
        InputMode::All => InputOutcome::All(
            seats
                .iter()
                .map(|(actor, _)| *actor)
                .zip(results)
                .collect(),
        ),
    })
}

/// Ask the relay to settle every still-missing target as `null`. Whatever
/// it echoes first for a tag, this claim or the real answer, is final.
fn claim_timeouts(
    cx: &InputContext<'_>,
    mode: InputMode,
    op: &str,
    missing: impl Iterator<Item = SyncTag>,
) {
    for sync in missing {
        let tag = DataTag::request(mode, op, sync).to_string();
        debug!(%tag, "claiming timeout");
        let packet = cx.log.feed_send(&tag, Value::Null);
        cx.link.write(cx.gid, packet);
    }
}

/// The task answering on behalf of the local player.
struct LocalResolver {
    handle: JoinHandle<()>,
}

impl LocalResolver {
    fn spawn(cx: &InputContext<'_>, request: InputRequest, answer: Option<Value>) -> Self {
        let gid = cx.gid;
        let log = Arc::clone(cx.log);
        let link = Arc::clone(cx.link);
        let resolver = Arc::clone(cx.resolver);
        let tag = DataTag::request(request.mode, request.op.clone(), request.sync);

        let handle = tokio::spawn(async move {
            let limit = request.timeout + RESOLVER_GRACE;
            let actor = request.actor;
            let data = match answer {
                Some(v) => v,
                None => match tokio::time::timeout(limit, resolver.resolve(request)).await {
                    Ok(v) => v,
                    Err(_) => {
                        debug!(%actor, %tag, "resolver exceeded its time limit");
                        Value::Null
                    }
                },
            };
            let packet = log.feed_send(&tag.to_string(), data);
            link.write(gid, packet);
        });
        Self { handle }
    }

    async fn finish(mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for LocalResolver {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
