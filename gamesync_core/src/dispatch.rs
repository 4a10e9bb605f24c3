// Ordered event dispatch with declared before/after constraints.
//
// Rules code raises named events ("action_before", "action_apply", ...) and
// every handler interested in a kind runs in one fixed order, identical on
// every peer. Each handler names other handlers it must run before or after;
// per event kind, those constraints form a graph over the interested handlers
// and the dispatch order is its stable topological sort, ties broken by
// registration order. Constraints naming handlers that are not registered
// (abilities of characters not in this game) are ignored.
//
// An `OrderedDispatcher` is immutable once built. The owning game rebuilds a
// fresh one from the full handler set whenever that set changes (see
// `Game::refresh_dispatcher`), so a stale cached order is never used.
//
// Cycles are reported at build time as `DispatchError::Cycle`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::error::{DispatchError, GameError};
use crate::event_bus::Flow;

/// A participant in ordered dispatch.
///
/// `C` is the context handed to every handler (the game), `E` the mutable
/// payload threaded through the handlers of one event occurrence.
#[async_trait]
pub trait EventHandler<C, E>: Send + Sync {
    /// Unique name; used by other handlers' constraints.
    fn name(&self) -> &str;

    /// Event kinds this handler receives.
    fn interested(&self) -> &[&str];

    /// Handlers that must run after this one.
    fn execute_before(&self) -> &[&str] {
        &[]
    }

    /// Handlers that must run before this one.
    fn execute_after(&self) -> &[&str] {
        &[]
    }

    async fn handle(&self, ctx: &C, kind: &str, event: E) -> Result<Flow<E>, GameError>;
}

pub type HandlerRef<C, E> = Arc<dyn EventHandler<C, E>>;

pub struct OrderedDispatcher<C, E> {
    handlers: Vec<HandlerRef<C, E>>,
    /// Per event kind, indices into `handlers` in dispatch order.
    orders: BTreeMap<String, Vec<usize>>,
}

impl<C, E> OrderedDispatcher<C, E> {
    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
            orders: BTreeMap::new(),
        }
    }

    /// Compute the dispatch order of every event kind.
    ///
    /// Handlers are taken in registration order; a handler whose name was
    /// already registered is skipped.
    pub fn build(handlers: Vec<HandlerRef<C, E>>) -> Result<Self, DispatchError> {
        let mut unique: Vec<HandlerRef<C, E>> = Vec::with_capacity(handlers.len());
        for handler in handlers {
            if unique.iter().all(|h| h.name() != handler.name()) {
                unique.push(handler);
            }
        }

        let kinds: BTreeSet<String> = unique
            .iter()
            .flat_map(|h| h.interested().iter().map(|k| k.to_string()))
            .collect();

        let mut orders = BTreeMap::new();
        for kind in kinds {
            let members: Vec<usize> = (0..unique.len())
                .filter(|&i| unique[i].interested().iter().any(|k| *k == kind))
                .collect();
            let order = stable_order(&unique, &kind, &members)?;
            orders.insert(kind, order);
        }

        Ok(Self {
            handlers: unique,
            orders,
        })
    }

    /// Handler names in the order they receive `kind`.
    pub fn order_for(&self, kind: &str) -> Vec<&str> {
        self.orders
            .get(kind)
            .map(|order| order.iter().map(|&i| self.handlers[i].name()).collect())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.orders.keys().map(String::as_str)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Run every handler interested in `kind`, in order, threading `event`.
    ///
    /// A handler returning `Flow::Stop` ends this occurrence; an error aborts
    /// it and propagates.
    pub async fn dispatch(&self, ctx: &C, kind: &str, event: E) -> Result<E, GameError> {
        let Some(order) = self.orders.get(kind) else {
            return Ok(event);
        };
        let mut event = event;
        for &i in order {
            let handler = &self.handlers[i];
            match handler.handle(ctx, kind, event).await? {
                Flow::Continue(next) => event = next,
                Flow::Stop(last) => {
                    trace!(kind, handler = handler.name(), "propagation stopped");
                    return Ok(last);
                }
            }
        }
        Ok(event)
    }
}

/// Kahn's algorithm over the constraint graph of one event kind, always
/// releasing the earliest-registered ready handler first.
fn stable_order<C, E>(
    handlers: &[HandlerRef<C, E>],
    kind: &str,
    members: &[usize],
) -> Result<Vec<usize>, DispatchError> {
    let by_name: BTreeMap<&str, usize> = members.iter().map(|&i| (handlers[i].name(), i)).collect();
    let mut successors: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    let mut indegree: BTreeMap<usize, usize> = members.iter().map(|&i| (i, 0)).collect();

    let mut add_edge = |from: usize, to: usize| {
        if from != to && successors.entry(from).or_default().insert(to) {
            *indegree.entry(to).or_default() += 1;
        }
    };
    for &i in members {
        for name in handlers[i].execute_before() {
            if let Some(&j) = by_name.get(name) {
                add_edge(i, j);
            }
        }
        for name in handlers[i].execute_after() {
            if let Some(&j) = by_name.get(name) {
                add_edge(j, i);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .filter(|&(_, &d)| d == 0)
        .map(|(&i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(members.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        let Some(next) = successors.get(&i) else {
            continue;
        };
        for j in next {
            if let Some(d) = indegree.get_mut(j) {
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(*j));
                }
            }
        }
    }

    if order.len() < members.len() {
        let stuck = members
            .iter()
            .filter(|i| !order.contains(*i))
            .map(|&i| handlers[i].name().to_string())
            .collect();
        return Err(DispatchError::Cycle {
            kind: kind.to_string(),
            handlers: stuck,
        });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Table;

    struct Named {
        name: &'static str,
        kinds: Vec<&'static str>,
        before: Vec<&'static str>,
        after: Vec<&'static str>,
        stop: bool,
    }

    fn named(name: &'static str) -> Named {
        Named {
            name,
            kinds: vec!["action_apply"],
            before: vec![],
            after: vec![],
            stop: false,
        }
    }

    impl Named {
        fn before(mut self, other: &'static str) -> Self {
            self.before.push(other);
            self
        }
        fn after(mut self, other: &'static str) -> Self {
            self.after.push(other);
            self
        }
        fn kinds(mut self, kinds: &[&'static str]) -> Self {
            self.kinds = kinds.to_vec();
            self
        }
        fn stopping(mut self) -> Self {
            self.stop = true;
            self
        }
        fn arc(self) -> HandlerRef<Table, Vec<String>> {
            Arc::new(self)
        }
    }

    #[async_trait]
    impl EventHandler<Table, Vec<String>> for Named {
        fn name(&self) -> &str {
            self.name
        }
        fn interested(&self) -> &[&str] {
            &self.kinds
        }
        fn execute_before(&self) -> &[&str] {
            &self.before
        }
        fn execute_after(&self) -> &[&str] {
            &self.after
        }
        async fn handle(
            &self,
            _ctx: &Table,
            _kind: &str,
            mut event: Vec<String>,
        ) -> Result<Flow<Vec<String>>, GameError> {
            event.push(self.name.to_string());
            if self.stop {
                Ok(Flow::Stop(event))
            } else {
                Ok(Flow::Continue(event))
            }
        }
    }

    #[tokio::test]
    async fn constraints_override_registration_order() {
        // Registered C, B, A; A before B, C after B.
        let d = OrderedDispatcher::build(vec![
            named("C").after("B").arc(),
            named("B").arc(),
            named("A").before("B").arc(),
        ])
        .unwrap();
        assert_eq!(d.order_for("action_apply"), vec!["A", "B", "C"]);
        let trace = d.dispatch(&Table, "action_apply", Vec::new()).await.unwrap();
        assert_eq!(trace, vec!["A", "B", "C"]);
    }

    #[test]
    fn unconstrained_handlers_keep_registration_order() {
        let d = OrderedDispatcher::<Table, Vec<String>>::build(vec![
            named("X").arc(),
            named("Y").arc(),
            named("Z").before("X").arc(),
        ])
        .unwrap();
        assert_eq!(d.order_for("action_apply"), vec!["Y", "Z", "X"]);
    }

    #[test]
    fn unknown_constraint_targets_are_ignored() {
        let d = OrderedDispatcher::<Table, Vec<String>>::build(vec![
            named("A").after("Ghost").arc(),
            named("B").before("Phantom").arc(),
        ])
        .unwrap();
        assert_eq!(d.order_for("action_apply"), vec!["A", "B"]);
    }

    #[test]
    fn cycle_is_reported_at_build() {
        let err = OrderedDispatcher::<Table, Vec<String>>::build(vec![
            named("A").before("B").arc(),
            named("B").before("C").arc(),
            named("C").before("A").arc(),
            named("D").arc(),
        ])
        .err()
        .unwrap();
        match err {
            DispatchError::Cycle { kind, handlers } => {
                assert_eq!(kind, "action_apply");
                assert_eq!(handlers, vec!["A", "B", "C"]);
            }
        }
    }

    #[test]
    fn constraints_only_bind_within_an_event_kind() {
        let d = OrderedDispatcher::<Table, Vec<String>>::build(vec![
            named("Late").kinds(&["action_after"]).after("Early").arc(),
            named("Early").kinds(&["action_after", "action_apply"]).arc(),
            named("Solo").kinds(&["action_apply"]).before("Early").arc(),
        ])
        .unwrap();
        assert_eq!(d.order_for("action_after"), vec!["Early", "Late"]);
        assert_eq!(d.order_for("action_apply"), vec!["Solo", "Early"]);
        assert!(d.order_for("game_begin").is_empty());
        assert_eq!(
            d.kinds().collect::<Vec<_>>(),
            vec!["action_after", "action_apply"]
        );
    }

    #[test]
    fn duplicate_names_register_once() {
        let d = OrderedDispatcher::<Table, Vec<String>>::build(vec![
            named("A").arc(),
            named("A").arc(),
        ])
        .unwrap();
        assert_eq!(d.handler_count(), 1);
    }

    #[tokio::test]
    async fn stop_short_circuits_one_occurrence() {
        let d = OrderedDispatcher::build(vec![
            named("A").arc(),
            named("B").stopping().arc(),
            named("C").arc(),
        ])
        .unwrap();
        let first = d.dispatch(&Table, "action_apply", Vec::new()).await.unwrap();
        assert_eq!(first, vec!["A", "B"]);
        let second = d.dispatch(&Table, "action_apply", vec!["x".into()]).await.unwrap();
        assert_eq!(second, vec!["x", "A", "B"]);
    }

    #[tokio::test]
    async fn rebuild_reflects_new_handler_set() {
        let base = vec![named("A").arc(), named("B").after("A").arc()];
        let first = OrderedDispatcher::build(base).unwrap();
        assert_eq!(first.order_for("action_apply"), vec!["A", "B"]);

        let widened = vec![
            named("A").arc(),
            named("B").after("A").arc(),
            named("D").before("A").arc(),
        ];
        let second = OrderedDispatcher::build(widened).unwrap();
        let trace = second.dispatch(&Table, "action_apply", Vec::new()).await.unwrap();
        assert_eq!(trace, vec!["D", "A", "B"]);
    }

    #[tokio::test]
    async fn unknown_kind_passes_event_through() {
        let d = OrderedDispatcher::build(vec![named("A").arc()]).unwrap();
        let out = d
            .dispatch(&Table, "nobody_listens", vec!["keep".into()])
            .await
            .unwrap();
        assert_eq!(out, vec!["keep"]);
    }
}
