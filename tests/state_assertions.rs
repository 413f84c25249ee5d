//! End-to-end client-state scenarios driven through the session protocol
//! layer with a real root, watcher, and cookie sync.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, unbounded};
use serde_json::{Value, json};
use tempfile::TempDir;

use fswatchd::config::Config;
use fswatchd::daemon::session::{self, ClientSession, StateArgs};
use fswatchd::{ClockPosition, Root};

const WAIT: Duration = Duration::from_secs(10);

fn test_config() -> Config {
    Config {
        settle_ms: 10,
        ..Config::default()
    }
}

/// Subscribe to `root` forwarding every broadcast into a channel.
fn forwarding_subscriber(root: &Arc<Root>) -> (fswatchd::Subscriber, Receiver<Value>) {
    let (tx, rx) = unbounded();
    let slot: Arc<std::sync::Mutex<Option<fswatchd::daemon::WeakSubscriber>>> = Arc::default();
    let forward = Arc::clone(&slot);
    let subscriber = root.unilateral_responses.subscribe(move || {
        let guard = forward.lock().unwrap();
        if let Some(weak) = guard.as_ref() {
            let mut items = Vec::new();
            weak.get_pending(&mut items);
            for item in items {
                let _ = tx.send(item.payload.clone());
            }
        }
    });
    *slot.lock().unwrap() = Some(subscriber.downgrade());
    (subscriber, rx)
}

struct Fixture {
    _dir: TempDir,
    root: Arc<Root>,
    broadcasts: Receiver<Value>,
    _subscriber: fswatchd::Subscriber,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = test_config();
        let root = Root::open(dir.path(), dir.path().join("test.sock"), &config).unwrap();
        let (subscriber, broadcasts) = forwarding_subscriber(&root);
        Self {
            _dir: dir,
            root,
            broadcasts,
            _subscriber: subscriber,
        }
    }

    fn session(&self, id: u64) -> (ClientSession, Receiver<Value>) {
        let (tx, rx) = unbounded();
        (ClientSession::new(id, tx), rx)
    }

    fn args(&self, name: &str) -> StateArgs {
        StateArgs {
            name: name.to_string(),
            metadata: None,
            sync_timeout: Duration::from_secs(30),
        }
    }

    /// Next broadcast carrying `key`, skipping settle payloads.
    fn next_broadcast(&self, key: &str) -> Value {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            match self.broadcasts.recv_timeout(Duration::from_millis(100)) {
                Ok(payload) => {
                    if payload.get(key).is_some() {
                        return payload;
                    }
                }
                Err(_) => continue,
            }
        }
        panic!("timed out waiting for a {key:?} broadcast");
    }

    fn assert_no_state_broadcast_for(&self, window: Duration) {
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            if let Ok(payload) = self.broadcasts.recv_timeout(Duration::from_millis(25)) {
                assert!(
                    payload.get("state-enter").is_none() && payload.get("state-leave").is_none(),
                    "unexpected state broadcast: {payload}"
                );
            }
        }
    }
}

fn recv_response(rx: &Receiver<Value>) -> Value {
    rx.recv_timeout(WAIT).expect("no response")
}

fn clock_of(payload: &Value) -> ClockPosition {
    ClockPosition::parse(payload["clock"].as_str().expect("clock string")).unwrap()
}

#[test]
fn enter_then_leave_single_client() {
    let fixture = Fixture::new();
    let (mut session, responses) = fixture.session(1);

    session::state_enter(&mut session, &fixture.root, fixture.args("S")).unwrap();
    let ok = recv_response(&responses);
    assert_eq!(ok["root"], json!(fixture.root.path_str()));
    assert_eq!(ok["state-enter"], json!("S"));

    let entered = fixture.next_broadcast("state-enter");
    assert_eq!(entered["state-enter"], json!("S"));
    assert_eq!(entered["root"], json!(fixture.root.path_str()));
    let c1 = clock_of(&entered);

    session::state_leave(&mut session, &fixture.root, fixture.args("S")).unwrap();
    let ok = recv_response(&responses);
    assert_eq!(ok["state-leave"], json!("S"));

    let left = fixture.next_broadcast("state-leave");
    assert_eq!(left["state-leave"], json!("S"));
    let c2 = clock_of(&left);
    assert!(c2 >= c1, "leave clock must not precede enter clock");
}

#[test]
fn metadata_flows_into_broadcasts() {
    let fixture = Fixture::new();
    let (mut session, responses) = fixture.session(1);

    let args = StateArgs {
        name: "deploy".into(),
        metadata: Some(json!({"who": "me"})),
        sync_timeout: Duration::from_secs(30),
    };
    session::state_enter(&mut session, &fixture.root, args).unwrap();
    recv_response(&responses);

    let entered = fixture.next_broadcast("state-enter");
    assert_eq!(entered["metadata"], json!({"who": "me"}));
}

#[test]
fn queued_second_enter_broadcasts_in_order() {
    let fixture = Fixture::new();
    let (mut a, a_rx) = fixture.session(1);
    let (mut b, b_rx) = fixture.session(2);

    session::state_enter(&mut a, &fixture.root, fixture.args("S")).unwrap();
    recv_response(&a_rx);
    let a_enter = fixture.next_broadcast("state-enter");
    let a_clock = clock_of(&a_enter);

    // B queues behind A: it gets its OK but no broadcast yet.
    session::state_enter(&mut b, &fixture.root, fixture.args("S")).unwrap();
    recv_response(&b_rx);
    fixture.assert_no_state_broadcast_for(Duration::from_millis(300));

    // A leaves: A's leave is followed by B's (deferred) enter.
    session::state_leave(&mut a, &fixture.root, fixture.args("S")).unwrap();
    recv_response(&a_rx);

    let a_leave = fixture.next_broadcast("state-leave");
    assert_eq!(a_leave["state-leave"], json!("S"));
    let b_enter = fixture.next_broadcast("state-enter");
    assert_eq!(b_enter["state-enter"], json!("S"));

    assert!(clock_of(&a_leave) >= a_clock);
    assert!(clock_of(&b_enter) >= a_clock);

    // B can now leave normally.
    session::state_leave(&mut b, &fixture.root, fixture.args("S")).unwrap();
    recv_response(&b_rx);
    let b_leave = fixture.next_broadcast("state-leave");
    assert_eq!(b_leave["state-leave"], json!("S"));
}

#[test]
fn duplicate_enter_from_same_session_is_rejected() {
    let fixture = Fixture::new();
    let (mut session, responses) = fixture.session(1);

    session::state_enter(&mut session, &fixture.root, fixture.args("S")).unwrap();
    recv_response(&responses);
    fixture.next_broadcast("state-enter");

    let err = session::state_enter(&mut session, &fixture.root, fixture.args("S")).unwrap_err();
    assert_eq!(err.code(), "already_asserted");
}

#[test]
fn leave_without_enter_is_not_asserted() {
    let fixture = Fixture::new();
    let (mut session, _responses) = fixture.session(1);

    let err = session::state_leave(&mut session, &fixture.root, fixture.args("S")).unwrap_err();
    assert_eq!(err.code(), "not_asserted");
}

#[test]
fn disconnect_vacates_held_states() {
    let fixture = Fixture::new();
    let (mut session, responses) = fixture.session(1);

    session::state_enter(&mut session, &fixture.root, fixture.args("S1")).unwrap();
    recv_response(&responses);
    fixture.next_broadcast("state-enter");
    session::state_enter(&mut session, &fixture.root, fixture.args("S2")).unwrap();
    recv_response(&responses);
    fixture.next_broadcast("state-enter");

    session::vacate_states(&mut session);

    let mut names = Vec::new();
    for _ in 0..2 {
        let left = fixture.next_broadcast("state-leave");
        assert_eq!(left["abandoned"], json!(true));
        assert!(left.get("metadata").is_none());
        names.push(left["state-leave"].as_str().unwrap().to_string());
    }
    names.sort();
    assert_eq!(names, vec!["S1".to_string(), "S2".to_string()]);

    // Both names are reusable immediately: the assertions are done.
    let (mut fresh, fresh_rx) = fixture.session(2);
    session::state_enter(&mut fresh, &fixture.root, fixture.args("S1")).unwrap();
    recv_response(&fresh_rx);
    let entered = fixture.next_broadcast("state-enter");
    assert_eq!(entered["state-enter"], json!("S1"));
}

#[test]
fn enter_sync_failure_emits_no_broadcast() {
    let dir = TempDir::new().unwrap();
    let watched = dir.path().join("root");
    std::fs::create_dir(&watched).unwrap();
    let config = test_config();
    let root = Root::open(&watched, dir.path().join("test.sock"), &config).unwrap();

    let (_subscriber, broadcasts) = forwarding_subscriber(&root);

    // Remove the watched directory so the cookie file cannot be created:
    // the enter sync must fail after the OK response.
    std::fs::remove_dir_all(&watched).unwrap();

    let (session_tx, session_rx) = unbounded();
    let mut session = ClientSession::new(1, session_tx);
    let args = StateArgs {
        name: "S".into(),
        metadata: None,
        sync_timeout: Duration::from_millis(500),
    };
    session::state_enter(&mut session, &root, args).unwrap();

    // The OK response was already sent.
    let ok = session_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ok["state-enter"], json!("S"));

    // No broadcast follows: the assertion is silently evicted.
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let Ok(payload) = broadcasts.recv_timeout(Duration::from_millis(50)) {
            assert!(
                payload.get("state-enter").is_none() && payload.get("state-leave").is_none(),
                "unexpected broadcast after failed enter sync: {payload}"
            );
        }
    }

    // A subsequent leave observes the eviction.
    let err = session::state_leave(&mut session, &root, {
        StateArgs {
            name: "S".into(),
            metadata: None,
            sync_timeout: Duration::from_millis(100),
        }
    })
    .unwrap_err();
    assert_eq!(err.code(), "implicitly_vacated");

    root.cancel();
}
