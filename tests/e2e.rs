//! End-to-end tests: a daemon on an ephemeral port, executor processes
//! simulated by `ServiceRunner` threads, clients on the wire SDK.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use kiln::client::ManagerClient;
use kiln::config::Config;
use kiln::daemon::ipc::{ErrorCode, Metadata, TaskInput};
use kiln::daemon::{self, DaemonHandle};
use kiln::service::{ServiceRunner, TaskService};

// =============================================================================
// Fixture
// =============================================================================

struct Harness {
    daemon: Option<DaemonHandle>,
    addr: String,
}

impl Harness {
    fn start() -> Self {
        kiln::telemetry::init(0);
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            ..Config::default()
        };
        let daemon = daemon::start(&config).expect("start daemon");
        let addr = daemon.local_addr().to_string();
        Harness {
            daemon: Some(daemon),
            addr,
        }
    }

    fn client(&self) -> ManagerClient {
        ManagerClient::new(&self.addr)
    }

    fn spawn_service<S: TaskService + Send + 'static>(
        &self,
        name: &str,
        mut service: S,
    ) -> ServiceGuard {
        let runner = ServiceRunner::new(&self.addr, name);
        let stop = runner.stop_flag();
        let thread = std::thread::spawn(move || {
            runner.run(&mut service).expect("service run");
        });
        ServiceGuard {
            stop,
            thread: Some(thread),
        }
    }

    fn spawn_echo(&self, name: &str) -> ServiceGuard {
        self.spawn_service(name, Echo::default())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        drop(self.daemon.take());
    }
}

struct ServiceGuard {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for ServiceGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[derive(Default)]
struct Echo {
    bound: Option<Arc<AtomicUsize>>,
    unbound: Option<Arc<AtomicUsize>>,
    invoke_delay: Option<Duration>,
}

impl TaskService for Echo {
    fn on_session_bound(&mut self, _session: &Metadata) {
        if let Some(counter) = &self.bound {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_session_unbound(&mut self, _session: &Metadata) {
        if let Some(counter) = &self.unbound {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_task_invoke(&mut self, input: &TaskInput) -> Result<String, String> {
        if let Some(delay) = self.invoke_delay {
            std::thread::sleep(delay);
        }
        Ok(format!("Hello {}!", input.input))
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn hello_round_trip() {
    let harness = Harness::start();
    let _echo = harness.spawn_echo("echo-1");

    let client = harness.client();
    let conn = client.new_connection().unwrap();
    let ssn = conn.new_session().unwrap();

    let task = ssn.send_input("k82cn").unwrap();
    assert_eq!(ssn.recv_output(&task).unwrap(), "Hello k82cn!");

    ssn.close().unwrap();
    conn.close().unwrap();
}

#[test]
fn recv_output_blocks_without_executors() {
    let harness = Harness::start();
    let client = harness.client();
    let conn = client.new_connection().unwrap();
    let ssn = conn.new_session().unwrap();
    let task = ssn.send_input("x").unwrap();

    let (tx, rx) = mpsc::channel();
    {
        let client = harness.client();
        let task = task.clone();
        std::thread::spawn(move || {
            // A second handle on the same session; recv_output blocks on
            // the wire until the task completes or the session closes.
            let ssn = reattach_session(&client, &task.session_id);
            let _ = tx.send(ssn.recv_output(&task));
        });
    }

    // No executor: still blocked after 500 ms.
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

    // Closing the session releases the waiter promptly with SessionClosed.
    ssn.close().unwrap();
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let err = result.unwrap_err();
    assert_eq!(err.remote_code(), Some(ErrorCode::SessionClosed));
}

/// Rebuild a session handle from raw ids, the way a second process would.
fn reattach_session(client: &ManagerClient, session_id: &str) -> kiln::client::SessionHandle {
    kiln::client::SessionHandle::attach(client.clone(), Metadata::with_id(session_id))
}

/// Spin until a hook counter reaches `at_least`, with a generous timeout.
fn wait_for_count(counter: &AtomicUsize, at_least: usize) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while counter.load(Ordering::Relaxed) < at_least {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for counter to reach {at_least}"
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn one_executor_drains_two_sessions_in_turn() {
    let harness = Harness::start();
    let _echo = harness.spawn_echo("echo-1");

    let client = harness.client();
    let conn = client.new_connection().unwrap();
    let ssn_a = conn.new_session().unwrap();
    let ssn_b = conn.new_session().unwrap();

    let task_a = ssn_a.send_input("a").unwrap();
    let task_b = ssn_b.send_input("b").unwrap();

    // A single executor serves one session at a time; after draining and
    // unbinding it is rebound to the other, so both outputs arrive.
    assert_eq!(ssn_a.recv_output(&task_a).unwrap(), "Hello a!");
    assert_eq!(ssn_b.recv_output(&task_b).unwrap(), "Hello b!");
}

#[test]
fn one_pending_task_binds_exactly_one_executor() {
    let harness = Harness::start();
    let bound = Arc::new(AtomicUsize::new(0));

    let first = Echo {
        bound: Some(Arc::clone(&bound)),
        ..Echo::default()
    };
    let second = Echo {
        bound: Some(Arc::clone(&bound)),
        ..Echo::default()
    };
    let _first = harness.spawn_service("exe-a", first);
    let _second = harness.spawn_service("exe-b", second);

    let client = harness.client();
    let conn = client.new_connection().unwrap();
    let ssn = conn.new_session().unwrap();
    let task = ssn.send_input("x").unwrap();
    assert_eq!(ssn.recv_output(&task).unwrap(), "Hello x!");

    // Demand was one pending task: exactly one bind, the other executor
    // stayed idle.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(bound.load(Ordering::Relaxed), 1);
}

#[test]
fn close_session_while_executor_is_serving() {
    let harness = Harness::start();
    let bound = Arc::new(AtomicUsize::new(0));
    let unbound = Arc::new(AtomicUsize::new(0));
    let service = Echo {
        bound: Some(Arc::clone(&bound)),
        unbound: Some(Arc::clone(&unbound)),
        invoke_delay: Some(Duration::from_millis(300)),
    };
    let _echo = harness.spawn_service("slow-echo", service);

    let client = harness.client();
    let conn = client.new_connection().unwrap();
    let ssn = conn.new_session().unwrap();
    let task = ssn.send_input("x").unwrap();

    // Close mid-invoke: the running task is not preempted, its completion
    // still lands, and the stream then ends cleanly.
    wait_for_count(&bound, 1);
    std::thread::sleep(Duration::from_millis(100));
    ssn.close().unwrap();

    assert_eq!(ssn.recv_output(&task).unwrap(), "Hello x!");

    // The executor observed closure, unbound, and is idle again: a fresh
    // session gets served.
    let ssn2 = conn.new_session().unwrap();
    let task2 = ssn2.send_input("y").unwrap();
    assert_eq!(ssn2.recv_output(&task2).unwrap(), "Hello y!");
    assert!(unbound.load(Ordering::Relaxed) >= 1);
}

#[test]
fn ten_inputs_one_echo_executor() {
    let harness = Harness::start();
    let _echo = harness.spawn_echo("echo-1");

    let client = harness.client();
    let conn = client.new_connection().unwrap();
    let ssn = conn.new_session().unwrap();

    let tasks: Vec<_> = (0..10)
        .map(|i| ssn.send_input(i.to_string()).unwrap())
        .collect();

    for (i, task) in tasks.iter().enumerate() {
        assert_eq!(ssn.recv_output(task).unwrap(), format!("Hello {i}!"));
    }
}

// =============================================================================
// Boundary behaviours
// =============================================================================

#[test]
fn concurrent_recv_output_callers_share_the_result() {
    let harness = Harness::start();
    let client = harness.client();
    let conn = client.new_connection().unwrap();
    let ssn = conn.new_session().unwrap();
    let task = ssn.send_input("x").unwrap();

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let client = harness.client();
        let session_id = task.session_id.clone();
        let task = task.clone();
        waiters.push(std::thread::spawn(move || {
            reattach_session(&client, &session_id).recv_output(&task)
        }));
    }

    std::thread::sleep(Duration::from_millis(100));
    let _echo = harness.spawn_echo("echo-1");

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap().unwrap(), "Hello x!");
    }
}

#[test]
fn submitting_to_a_closed_session_fails_promptly() {
    let harness = Harness::start();
    let client = harness.client();
    let conn = client.new_connection().unwrap();
    let ssn = conn.new_session().unwrap();
    ssn.close().unwrap();

    let err = ssn.send_input("x").unwrap_err();
    assert_eq!(err.remote_code(), Some(ErrorCode::SessionClosed));
}

#[test]
fn closing_a_connection_closes_its_sessions() {
    let harness = Harness::start();
    let client = harness.client();
    let conn = client.new_connection().unwrap();
    let ssn = conn.new_session().unwrap();

    conn.close().unwrap();

    let err = ssn.send_input("x").unwrap_err();
    assert_eq!(err.remote_code(), Some(ErrorCode::SessionClosed));
    let err = conn.new_session().unwrap_err();
    assert_eq!(err.remote_code(), Some(ErrorCode::ConnectionClosed));
}

#[test]
fn list_session_is_capped_at_ten() {
    let harness = Harness::start();
    let client = harness.client();
    let conn = client.new_connection().unwrap();
    for _ in 0..12 {
        conn.new_session().unwrap();
    }

    assert_eq!(client.list_session().unwrap().len(), 10);
}

#[test]
fn register_unregister_register_is_idempotent() {
    let harness = Harness::start();
    let client = harness.client();
    let executor = Metadata::with_id("exe-cycle");

    client.register(&executor).unwrap();
    client.unregister(&executor).unwrap();
    client.register(&executor).unwrap();

    // A live registration still collides.
    let err = client.register(&executor).unwrap_err();
    assert_eq!(err.remote_code(), Some(ErrorCode::Duplicate));
    client.unregister(&executor).unwrap();
}

#[test]
fn run_is_declared_but_not_implemented() {
    use std::io::{BufRead, BufReader, Write};

    let harness = Harness::start();
    let mut stream = std::net::TcpStream::connect(&harness.addr).unwrap();
    stream.write_all(b"{\"op\":\"run\"}\n").unwrap();

    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).unwrap();
    assert!(line.contains("invalid_argument"));
    assert!(line.contains("not implemented"));
}

#[test]
fn unknown_ids_are_not_found() {
    let harness = Harness::start();
    let client = harness.client();

    let err = client
        .unregister(&Metadata::with_id("never-registered"))
        .unwrap_err();
    assert_eq!(err.remote_code(), Some(ErrorCode::NotFound));
}
