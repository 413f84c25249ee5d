//! Per-connection client session and the state-enter/leave protocols.
//!
//! The session owns weak handles to the assertions it holds; eviction
//! followed by a late client action is therefore a safe no-op. The OK
//! response for an enter/leave is always sent before the cookie sync is
//! initiated, so a client observes its own response strictly before any
//! broadcast it caused.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam::channel::Sender;
use serde_json::{Value, json};

use crate::daemon::ipc::{CommandError, make_response};
use crate::daemon::publish::Subscriber;
use crate::daemon::root::Root;
use crate::daemon::states::{ClientStateAssertion, Disposition, StateError};

pub struct ClientSession {
    pub id: u64,
    responses: Sender<Value>,
    states: HashMap<String, Weak<ClientStateAssertion>>,
    /// Held subscriptions; dropping one detaches its forwarding callback.
    subscriptions: HashMap<String, Subscriber>,
}

impl ClientSession {
    pub fn new(id: u64, responses: Sender<Value>) -> Self {
        Self {
            id,
            responses,
            states: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    /// Queue a PDU onto this client's pending-response queue.
    pub fn send(&self, pdu: Value) {
        let _ = self.responses.send(pdu);
    }

    pub fn holds_state(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    /// Attach this session to `root`'s unilateral publisher. Forwarded
    /// payloads carry the subscription name and a `unilateral` marker.
    pub fn subscribe(&mut self, name: String, root: &Arc<Root>) {
        // The callback holds only a weak handle so dropping the session's
        // subscription detaches it.
        let slot: Arc<Mutex<Option<crate::daemon::publish::WeakSubscriber>>> =
            Arc::new(Mutex::new(None));
        let forward_slot = Arc::clone(&slot);
        let tx = self.responses.clone();
        let sub_name = name.clone();
        let subscriber = root.unilateral_responses.subscribe(move || {
            // The slot lock keeps forwarded batches FIFO even when
            // notifies race on different publisher threads.
            let guard = forward_slot.lock().expect("subscription slot poisoned");
            let Some(weak) = guard.as_ref() else {
                return;
            };
            let mut items = Vec::new();
            weak.get_pending(&mut items);
            for item in items {
                let mut payload = item.payload.clone();
                if let Some(obj) = payload.as_object_mut() {
                    obj.insert("subscription".to_string(), json!(sub_name));
                    obj.insert("unilateral".to_string(), json!(true));
                }
                let _ = tx.send(payload);
            }
        });
        *slot.lock().expect("subscription slot poisoned") = Some(subscriber.downgrade());
        self.subscriptions.insert(name, subscriber);
    }

    pub fn unsubscribe(&mut self, name: &str) -> bool {
        self.subscriptions.remove(name).is_some()
    }
}

/// Validated `state-enter` / `state-leave` argument.
#[derive(Debug, Clone)]
pub struct StateArgs {
    pub name: String,
    pub metadata: Option<Value>,
    pub sync_timeout: Duration,
}

/// Parses the third element of `[cmd, root, name | {name, metadata?,
/// sync_timeout?}]`.
pub fn parse_state_args(
    args: &[Value],
    default_sync_timeout: Duration,
) -> Result<StateArgs, CommandError> {
    if args.len() != 3 {
        return Err(CommandError::Validation(format!(
            "invalid number of arguments, expected 3, got {}",
            args.len()
        )));
    }

    match &args[2] {
        Value::String(name) if !name.is_empty() => Ok(StateArgs {
            name: name.clone(),
            metadata: None,
            sync_timeout: default_sync_timeout,
        }),
        Value::Object(obj) => {
            let name = obj
                .get("name")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    CommandError::Validation("state name must be a non-empty string".into())
                })?
                .to_string();
            for key in obj.keys() {
                if !matches!(key.as_str(), "name" | "metadata" | "sync_timeout") {
                    return Err(CommandError::Validation(format!(
                        "unknown state argument key {key:?}"
                    )));
                }
            }
            let sync_timeout = match obj.get("sync_timeout") {
                None => default_sync_timeout,
                Some(value) => value
                    .as_u64()
                    .map(Duration::from_millis)
                    .ok_or_else(|| {
                        CommandError::Validation("sync_timeout must be >= 0".into())
                    })?,
            };
            Ok(StateArgs {
                name,
                metadata: obj.get("metadata").cloned(),
                sync_timeout,
            })
        }
        other => Err(CommandError::Validation(format!(
            "expected state name or object, got {other}"
        ))),
    }
}

/// The `state-enter` protocol. Sends the OK response itself (before the
/// cookie sync starts) and completes the transition asynchronously.
pub fn state_enter(
    session: &mut ClientSession,
    root: &Arc<Root>,
    args: StateArgs,
) -> Result<(), CommandError> {
    if session.holds_state(&args.name) {
        return Err(StateError::AlreadyAsserted(args.name).into());
    }

    let assertion = ClientStateAssertion::new(root, args.name.clone(), session.id);

    // Ask the root to track the assertion and maintain ordering before
    // linking it into the session.
    root.asserted_states
        .lock()
        .expect("asserted states poisoned")
        .queue_assertion(&assertion)?;

    root.bump_state_trans_count();
    session
        .states
        .insert(args.name.clone(), Arc::downgrade(&assertion));

    // The response goes out before any broadcast this enter produces.
    let mut response = make_response();
    response.insert("root".to_string(), json!(root.path_str()));
    response.insert("state-enter".to_string(), json!(args.name.clone()));
    session.send(Value::Object(response));

    // Past this point all failures are asynchronous; the client already
    // has its response.
    let root = Arc::clone(root);
    spawn_sync_thread("state-enter sync", move || {
        match root.sync_to_now(args.sync_timeout) {
            Err(err) => {
                tracing::error!("state-enter sync failed: {err}");
                // Don't allow this assertion to clog the queue; evict it.
                // The client side is cleaned up on disconnect or when it
                // attempts to leave the state.
                root.remove_assertion(&assertion);
            }
            Ok(()) => {
                let mut payload = json!({
                    "root": root.path_str(),
                    "clock": root.current_clock_string(),
                    "state-enter": args.name,
                });
                if let Some(metadata) = args.metadata {
                    payload["metadata"] = metadata;
                }

                let states = root
                    .asserted_states
                    .lock()
                    .expect("asserted states poisoned");
                assertion.set_disposition(Disposition::Asserted);
                if states.is_front(&assertion) {
                    root.unilateral_responses.enqueue(payload);
                } else {
                    // Defer until this assertion reaches the front; the
                    // promotion in remove_assertion sends it.
                    assertion.stash_enter_payload(payload);
                }
            }
        }
    });

    Ok(())
}

/// The `state-leave` protocol. Sends the OK response itself.
pub fn state_leave(
    session: &mut ClientSession,
    root: &Arc<Root>,
    args: StateArgs,
) -> Result<(), CommandError> {
    let weak = session
        .states
        .get(&args.name)
        .ok_or_else(|| StateError::NotAsserted(args.name.clone()))?;
    let assertion = weak
        .upgrade()
        .ok_or_else(|| StateError::ImplicitlyVacated(args.name.clone()))?;

    // Sanity check ownership against a racing implicit vacate.
    if assertion.session_id != session.id {
        return Err(StateError::NotAsserted(args.name.clone()).into());
    }

    {
        let _states = root
            .asserted_states
            .lock()
            .expect("asserted states poisoned");
        if assertion.disposition() == Disposition::Done {
            return Err(StateError::ImplicitlyVacated(args.name.clone()).into());
        }
        // Not vacated until the cookie is observed.
        assertion.set_disposition(Disposition::PendingLeave);
    }

    // Unlink from the session now; the root side goes on the other side
    // of the sync.
    session.states.remove(&args.name);

    let mut response = make_response();
    response.insert("root".to_string(), json!(root.path_str()));
    response.insert("state-leave".to_string(), json!(args.name.clone()));
    session.send(Value::Object(response));

    let root = Arc::clone(root);
    spawn_sync_thread("state-leave sync", move || {
        match root.sync_to_now(args.sync_timeout) {
            Err(err) => {
                // Log it and take no further action.
                tracing::error!("state-leave sync failed: {err}");
            }
            Ok(()) => {
                leave_state(&root, &assertion, false, args.metadata);
            }
        }
    });

    Ok(())
}

/// Broadcast the leave payload and drop the assertion from the root.
fn leave_state(
    root: &Arc<Root>,
    assertion: &Arc<ClientStateAssertion>,
    abandoned: bool,
    metadata: Option<Value>,
) {
    let mut payload = json!({
        "root": root.path_str(),
        "clock": root.current_clock_string(),
        "state-leave": assertion.name,
    });
    if let Some(metadata) = metadata {
        payload["metadata"] = metadata;
    }
    if abandoned {
        payload["abandoned"] = json!(true);
    }
    root.unilateral_responses.enqueue(payload);

    root.remove_assertion(assertion);
    root.bump_state_trans_count();
}

/// Abandon any states the client did not explicitly vacate.
pub fn vacate_states(session: &mut ClientSession) {
    let held = std::mem::take(&mut session.states);
    for (name, weak) in held {
        let Some(assertion) = weak.upgrade() else {
            // Already evicted; nothing to do.
            continue;
        };
        let Some(root) = assertion.root.upgrade() else {
            continue;
        };
        tracing::warn!(
            "implicitly vacating state {name} on {} due to client disconnect",
            root.path_str()
        );
        leave_state(&root, &assertion, true, None);
    }
}

fn spawn_sync_thread(name: &str, body: impl FnOnce() + Send + 'static) {
    if let Err(err) = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
    {
        tracing::error!("failed to spawn {name} thread: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SYNC: Duration = Duration::from_secs(60);

    fn state_args(third: Value) -> Vec<Value> {
        vec![json!("state-enter"), json!("/root"), third]
    }

    #[test]
    fn string_form_parses() {
        let args = parse_state_args(&state_args(json!("mystate")), SYNC).unwrap();
        assert_eq!(args.name, "mystate");
        assert_eq!(args.sync_timeout, SYNC);
        assert!(args.metadata.is_none());
    }

    #[test]
    fn object_form_parses() {
        let args = parse_state_args(
            &state_args(json!({
                "name": "deploy",
                "metadata": {"who": "me"},
                "sync_timeout": 1500,
            })),
            SYNC,
        )
        .unwrap();
        assert_eq!(args.name, "deploy");
        assert_eq!(args.metadata, Some(json!({"who": "me"})));
        assert_eq!(args.sync_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn invalid_forms_are_rejected() {
        assert!(parse_state_args(&[json!("cmd"), json!("/r")], SYNC).is_err());
        assert!(parse_state_args(&state_args(json!(12)), SYNC).is_err());
        assert!(parse_state_args(&state_args(json!("")), SYNC).is_err());
        assert!(parse_state_args(&state_args(json!({"metadata": {}})), SYNC).is_err());
        assert!(
            parse_state_args(&state_args(json!({"name": "s", "sync_timeout": -5})), SYNC)
                .is_err()
        );
        assert!(
            parse_state_args(&state_args(json!({"name": "s", "bogus": 1})), SYNC).is_err()
        );
    }
}
