//! In-process publish/subscribe hub.
//!
//! An [`EventHub`] maps an optional subtype (for example a transaction id)
//! to an ordered list of subscribers. Emits are synchronous and run in
//! registration order; a subscriber bound to a connection is removed when
//! that connection closes, via a removal hook the transport registers on the
//! connection. The hub owns the subscription table; the connection only
//! observes its own removal, so there is no ownership cycle.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::TransactionInfo;

/// Identifier of a live client connection, allocated by the transport.
pub type ConnId = u64;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Subscriber<T> {
    conn: Option<ConnId>,
    callback: Callback<T>,
}

/// Typed pub/sub keyed by optional subtype.
pub struct EventHub<T> {
    inner: Mutex<HashMap<Option<String>, Vec<Subscriber<T>>>>,
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventHub<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Append a subscriber. A subscriber without a connection is "global"
    /// and only removable through [`EventHub::unsubscribe`].
    pub fn subscribe(
        &self,
        conn: Option<ConnId>,
        subtype: Option<&str>,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) {
        let mut inner = self.inner.lock();
        inner.entry(subtype.map(str::to_owned)).or_default().push(Subscriber {
            conn,
            callback: Arc::new(callback),
        });
    }

    /// Remove every subscriber of `subtype` belonging to `conn`, or every
    /// global subscriber of `subtype` when `conn` is `None`. An emptied
    /// subtype disappears from introspection.
    pub fn unsubscribe(&self, conn: Option<ConnId>, subtype: Option<&str>) {
        let mut inner = self.inner.lock();
        if let Some(list) = inner.get_mut(&subtype.map(str::to_owned)) {
            list.retain(|s| s.conn != conn);
            if list.is_empty() {
                inner.remove(&subtype.map(str::to_owned));
            }
        }
    }

    /// Remove `conn` from every subtype. Used by connection close hooks.
    pub fn remove_connection(&self, conn: ConnId) {
        let mut inner = self.inner.lock();
        inner.retain(|_, list| {
            list.retain(|s| s.conn != Some(conn));
            !list.is_empty()
        });
    }

    /// Invoke every subscriber of `subtype` in registration order. A
    /// panicking callback does not prevent the remaining callbacks from
    /// running. Callbacks registered during an emit see the next emit.
    pub fn emit(&self, data: &T, subtype: Option<&str>) {
        let callbacks: Vec<Callback<T>> = {
            let inner = self.inner.lock();
            match inner.get(&subtype.map(str::to_owned)) {
                Some(list) => list.iter().map(|s| s.callback.clone()).collect(),
                None => return,
            }
        };
        for callback in callbacks {
            let _scope = crate::startup::catch_scope();
            if catch_unwind(AssertUnwindSafe(|| callback(data))).is_err() {
                tracing::error!(subtype, "event subscriber panicked during emit");
            }
        }
    }

    pub fn has_subscribers(&self, subtype: Option<&str>) -> bool {
        self.inner.lock().contains_key(&subtype.map(str::to_owned))
    }

    /// True if any subscriber exists under any subtype.
    pub fn has_any_subscribers(&self) -> bool {
        !self.inner.lock().is_empty()
    }

    pub fn subscribers_count(&self, subtype: Option<&str>) -> usize {
        self.inner
            .lock()
            .get(&subtype.map(str::to_owned))
            .map_or(0, |list| list.len())
    }

    /// Number of distinct subtype keys currently holding subscribers,
    /// the unnamed subtype included.
    pub fn subtype_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// The named subtypes currently holding subscribers.
    pub fn subtypes(&self) -> Vec<String> {
        self.inner.lock().keys().filter_map(|k| k.clone()).collect()
    }
}

/// The event types fed by the notification listener and consumed by the
/// `transaction`/`txStatus` push and wait semantics.
#[derive(Default)]
pub struct TransactionHubs {
    /// Keyed by hex transaction id.
    pub by_id: EventHub<TransactionInfo>,
    /// Keyed by sender or receiver address.
    pub by_address: EventHub<TransactionInfo>,
    /// Keyed by contract type.
    pub by_contract: EventHub<TransactionInfo>,
    /// Every processed transaction, no subtype.
    pub all: EventHub<TransactionInfo>,
}

impl TransactionHubs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// True if anything anywhere is waiting for processed transactions.
    pub fn has_any_subscribers(&self) -> bool {
        self.by_id.has_any_subscribers()
            || self.by_address.has_any_subscribers()
            || self.by_contract.has_any_subscribers()
            || self.all.has_any_subscribers()
    }

    /// Remove a closed connection from all four event types.
    pub fn remove_connection(&self, conn: ConnId) {
        self.by_id.remove_connection(conn);
        self.by_address.remove_connection(conn);
        self.by_contract.remove_connection(conn);
        self.all.remove_connection(conn);
    }

    /// Fan one processed transaction out to every interested subscriber.
    pub fn emit(&self, tx: &TransactionInfo) {
        self.by_id.emit(tx, Some(tx.id.as_str()));
        if let Some(sender) = &tx.sender {
            self.by_address.emit(tx, Some(sender.as_str()));
        }
        if let Some(receiver) = &tx.receiver {
            if tx.sender.as_deref() != Some(receiver.as_str()) {
                self.by_address.emit(tx, Some(receiver.as_str()));
            }
        }
        if let Some(contract_type) = &tx.contract_type {
            self.by_contract.emit(tx, Some(contract_type.as_str()));
        }
        self.all.emit(tx, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn recorder() -> (Arc<Mutex<Vec<i32>>>, impl Fn(i32) -> Box<dyn Fn(&i32) + Send + Sync>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let seen = seen.clone();
            move |tag: i32| -> Box<dyn Fn(&i32) + Send + Sync> {
                let seen = seen.clone();
                Box::new(move |value: &i32| seen.lock().push(tag * 1000 + value))
            }
        };
        (seen, make)
    }

    #[test]
    fn emit_runs_callbacks_in_registration_order() {
        let hub = EventHub::<i32>::new();
        let (seen, make) = recorder();
        hub.subscribe(None, Some("a"), make(1));
        hub.subscribe(None, Some("a"), make(2));
        hub.emit(&7, Some("a"));
        hub.emit(&8, Some("a"));
        assert_eq!(*seen.lock(), vec![1007, 2007, 1008, 2008]);
    }

    #[test]
    fn emit_on_other_subtype_is_silent() {
        let hub = EventHub::<i32>::new();
        let (seen, make) = recorder();
        hub.subscribe(None, Some("a"), make(1));
        hub.emit(&1, Some("b"));
        hub.emit(&1, None);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn closed_connection_is_removed_everywhere() {
        let hub = EventHub::<i32>::new();
        let (seen, make) = recorder();
        hub.subscribe(Some(1), Some("a"), make(1));
        hub.subscribe(Some(1), Some("b"), make(2));
        hub.subscribe(Some(2), Some("a"), make(3));
        hub.remove_connection(1);
        hub.emit(&5, Some("a"));
        hub.emit(&5, Some("b"));
        assert_eq!(*seen.lock(), vec![3005]);
        assert_eq!(hub.subtype_count(), 1);
        assert!(!hub.has_subscribers(Some("b")));
    }

    #[test]
    fn unsubscribe_without_connection_removes_global_entries_only() {
        let hub = EventHub::<i32>::new();
        let (seen, make) = recorder();
        hub.subscribe(None, Some("a"), make(1));
        hub.subscribe(Some(9), Some("a"), make(2));
        hub.unsubscribe(None, Some("a"));
        hub.emit(&1, Some("a"));
        assert_eq!(*seen.lock(), vec![2001]);
    }

    #[test]
    fn panicking_callback_does_not_stop_later_callbacks() {
        let hub = EventHub::<i32>::new();
        let (seen, make) = recorder();
        hub.subscribe(None, None, |_: &i32| panic!("boom"));
        hub.subscribe(None, None, make(1));
        hub.emit(&3, None);
        assert_eq!(*seen.lock(), vec![1003]);
    }

    #[test]
    fn introspection_counts() {
        let hub = EventHub::<i32>::new();
        hub.subscribe(None, Some("x"), |_| {});
        hub.subscribe(None, Some("x"), |_| {});
        hub.subscribe(Some(4), None, |_| {});
        assert_eq!(hub.subscribers_count(Some("x")), 2);
        assert_eq!(hub.subscribers_count(None), 1);
        assert_eq!(hub.subtype_count(), 2);
        assert_eq!(hub.subtypes(), vec!["x".to_owned()]);
        assert!(hub.has_any_subscribers());
    }
}
