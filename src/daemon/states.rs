//! Client-state assertions and the per-root ordered queue.
//!
//! For a given `(root, name)` at most one assertion is active at a time;
//! later assertions queue behind it. Only the front assertion of a name
//! may broadcast; a queued assertion buffers its enter payload until
//! `remove_assertion` promotes it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use thiserror::Error;

use crate::daemon::root::Root;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    PendingEnter,
    Asserted,
    PendingLeave,
    Done,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state {0:?} is already asserted")]
    AlreadyAsserted(String),

    #[error("state {0:?} is not asserted")]
    NotAsserted(String),

    #[error("state {0:?} was implicitly vacated")]
    ImplicitlyVacated(String),
}

#[derive(Debug)]
struct AssertionState {
    disposition: Disposition,
    /// Broadcast payload deferred until this assertion reaches the front.
    enter_payload: Option<Value>,
}

/// One named client-state held at one root.
///
/// Shared between the owning client session (weakly) and the root's
/// queue, so eviction followed by a late client action is a safe no-op.
#[derive(Debug)]
pub struct ClientStateAssertion {
    pub root: Weak<Root>,
    pub name: String,
    pub session_id: u64,
    state: Mutex<AssertionState>,
}

impl ClientStateAssertion {
    pub fn new(root: &Arc<Root>, name: String, session_id: u64) -> Arc<Self> {
        Arc::new(Self {
            root: Arc::downgrade(root),
            name,
            session_id,
            state: Mutex::new(AssertionState {
                disposition: Disposition::PendingEnter,
                enter_payload: None,
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn detached(name: &str, session_id: u64) -> Arc<Self> {
        Arc::new(Self {
            root: Weak::new(),
            name: name.to_string(),
            session_id,
            state: Mutex::new(AssertionState {
                disposition: Disposition::PendingEnter,
                enter_payload: None,
            }),
        })
    }

    pub fn disposition(&self) -> Disposition {
        self.state.lock().expect("assertion state poisoned").disposition
    }

    pub fn set_disposition(&self, disposition: Disposition) {
        self.state
            .lock()
            .expect("assertion state poisoned")
            .disposition = disposition;
    }

    pub fn stash_enter_payload(&self, payload: Value) {
        self.state
            .lock()
            .expect("assertion state poisoned")
            .enter_payload = Some(payload);
    }

    fn take_enter_payload(&self) -> Option<Value> {
        self.state
            .lock()
            .expect("assertion state poisoned")
            .enter_payload
            .take()
    }
}

/// The per-root state table. All operations happen under the root's
/// single writer lock (`Root::asserted_states`).
#[derive(Debug, Default)]
pub struct AssertedStates {
    queues: HashMap<String, VecDeque<Arc<ClientStateAssertion>>>,
}

impl AssertedStates {
    /// Track `assertion`, maintaining per-name ordering. The new entry
    /// is the front when no assertion for the name exists, otherwise it
    /// waits behind the current holders.
    pub fn queue_assertion(
        &mut self,
        assertion: &Arc<ClientStateAssertion>,
    ) -> Result<(), StateError> {
        let queue = self.queues.entry(assertion.name.clone()).or_default();
        if queue
            .iter()
            .any(|queued| queued.session_id == assertion.session_id)
        {
            return Err(StateError::AlreadyAsserted(assertion.name.clone()));
        }
        assertion.set_disposition(Disposition::PendingEnter);
        queue.push_back(Arc::clone(assertion));
        Ok(())
    }

    /// Remove `assertion` from its queue and mark it `Done`.
    ///
    /// When the front is removed the successor (if any) is promoted:
    /// transitioned to `Asserted`, and its deferred enter payload (if it
    /// has synced already) is returned for the caller to broadcast.
    /// Removing a waiting entry never promotes and never broadcasts.
    pub fn remove_assertion(&mut self, assertion: &Arc<ClientStateAssertion>) -> Option<Value> {
        let queue = self.queues.get_mut(&assertion.name)?;
        let position = queue
            .iter()
            .position(|queued| Arc::ptr_eq(queued, assertion))?;

        queue.remove(position);
        assertion.set_disposition(Disposition::Done);

        let mut deferred = None;
        if position == 0 {
            if let Some(next) = queue.front() {
                next.set_disposition(Disposition::Asserted);
                deferred = next.take_enter_payload();
            }
        }
        if queue.is_empty() {
            self.queues.remove(&assertion.name);
        }
        deferred
    }

    /// Whether `assertion` is currently the front for its name.
    pub fn is_front(&self, assertion: &Arc<ClientStateAssertion>) -> bool {
        self.queues
            .get(&assertion.name)
            .and_then(VecDeque::front)
            .is_some_and(|front| Arc::ptr_eq(front, assertion))
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

/// Convenience alias for the guarded table.
pub type SharedAssertedStates = Mutex<AssertedStates>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_assertion_is_front() {
        let mut states = AssertedStates::default();
        let a = ClientStateAssertion::detached("S", 1);
        states.queue_assertion(&a).unwrap();
        assert!(states.is_front(&a));
        assert_eq!(a.disposition(), Disposition::PendingEnter);
    }

    #[test]
    fn same_session_duplicate_is_rejected() {
        let mut states = AssertedStates::default();
        let a = ClientStateAssertion::detached("S", 1);
        let dup = ClientStateAssertion::detached("S", 1);
        states.queue_assertion(&a).unwrap();
        assert!(matches!(
            states.queue_assertion(&dup),
            Err(StateError::AlreadyAsserted(_))
        ));
    }

    #[test]
    fn second_client_queues_behind() {
        let mut states = AssertedStates::default();
        let a = ClientStateAssertion::detached("S", 1);
        let b = ClientStateAssertion::detached("S", 2);
        states.queue_assertion(&a).unwrap();
        states.queue_assertion(&b).unwrap();
        assert!(states.is_front(&a));
        assert!(!states.is_front(&b));
    }

    #[test]
    fn removing_front_promotes_and_returns_deferred_payload() {
        let mut states = AssertedStates::default();
        let a = ClientStateAssertion::detached("S", 1);
        let b = ClientStateAssertion::detached("S", 2);
        states.queue_assertion(&a).unwrap();
        states.queue_assertion(&b).unwrap();

        // B synced while waiting; its broadcast is buffered.
        b.stash_enter_payload(json!({"state-enter": "S"}));

        let deferred = states.remove_assertion(&a);
        assert_eq!(deferred, Some(json!({"state-enter": "S"})));
        assert_eq!(a.disposition(), Disposition::Done);
        assert_eq!(b.disposition(), Disposition::Asserted);
        assert!(states.is_front(&b));
    }

    #[test]
    fn removing_front_without_deferred_payload_still_promotes() {
        let mut states = AssertedStates::default();
        let a = ClientStateAssertion::detached("S", 1);
        let b = ClientStateAssertion::detached("S", 2);
        states.queue_assertion(&a).unwrap();
        states.queue_assertion(&b).unwrap();

        let deferred = states.remove_assertion(&a);
        assert_eq!(deferred, None);
        assert_eq!(b.disposition(), Disposition::Asserted);
    }

    #[test]
    fn removing_waiting_entry_never_promotes() {
        let mut states = AssertedStates::default();
        let a = ClientStateAssertion::detached("S", 1);
        let b = ClientStateAssertion::detached("S", 2);
        let c = ClientStateAssertion::detached("S", 3);
        states.queue_assertion(&a).unwrap();
        states.queue_assertion(&b).unwrap();
        states.queue_assertion(&c).unwrap();

        b.stash_enter_payload(json!({"never": "sent"}));
        let deferred = states.remove_assertion(&b);
        assert_eq!(deferred, None);
        assert_eq!(b.disposition(), Disposition::Done);
        assert!(states.is_front(&a));

        // C is still behind A.
        let deferred = states.remove_assertion(&a);
        assert_eq!(deferred, None);
        assert!(states.is_front(&c));
    }

    #[test]
    fn queue_then_remove_leaves_the_table_empty() {
        let mut states = AssertedStates::default();
        let a = ClientStateAssertion::detached("S", 1);
        states.queue_assertion(&a).unwrap();
        let deferred = states.remove_assertion(&a);
        assert_eq!(deferred, None, "no broadcast is produced");
        assert!(states.is_empty());
        assert_eq!(a.disposition(), Disposition::Done);

        // The name is immediately reusable.
        let again = ClientStateAssertion::detached("S", 1);
        states.queue_assertion(&again).unwrap();
        assert!(states.is_front(&again));
    }

    #[test]
    fn distinct_names_do_not_interact() {
        let mut states = AssertedStates::default();
        let a = ClientStateAssertion::detached("S1", 1);
        let b = ClientStateAssertion::detached("S2", 1);
        states.queue_assertion(&a).unwrap();
        states.queue_assertion(&b).unwrap();
        assert!(states.is_front(&a));
        assert!(states.is_front(&b));
    }

    #[test]
    fn remove_of_unknown_assertion_is_a_noop() {
        let mut states = AssertedStates::default();
        let a = ClientStateAssertion::detached("S", 1);
        assert_eq!(states.remove_assertion(&a), None);
    }
}
