//! Background I/O loop: owns the transport, drains two outbound priority
//! lanes, filters inbound by room topic, and hands fatal errors back to the
//! main thread without panicking the loop's own thread. Runs on its own
//! dedicated OS thread, shut down via an `Arc<AtomicBool>` flag.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::router::RouterSink;

#[derive(Debug)]
pub enum SendOutcome {
    Sent,
    Backpressure,
    Fatal(String),
}

/// Collaborator implemented by the concrete transport (UDP/message-broker
/// socket pair in a real deployment; an in-memory fake in tests).
pub trait Transport: Send {
    fn send(&mut self, room_id: &str, payload: &[u8]) -> SendOutcome;
    fn recv_timeout(&mut self, timeout: Duration) -> Option<(String, Vec<u8>)>;
}

const DEFAULT_CONTROL_CAP: usize = 512;

struct OutboundQueues {
    control: VecDeque<Vec<u8>>,
    control_cap: usize,
    transform: Option<Vec<u8>>,
}

impl OutboundQueues {
    fn new(control_cap: usize) -> Self {
        Self { control: VecDeque::new(), control_cap, transform: None }
    }
}

#[derive(Clone)]
pub struct IoCoreHandle {
    queues: Arc<Mutex<OutboundQueues>>,
    stop: Arc<AtomicBool>,
    error: Arc<Mutex<Option<(String, f64)>>>,
    connection_error: Arc<AtomicBool>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl IoCoreHandle {
    /// Enqueues a control-lane payload (FIFO, bounded). Returns `false` if
    /// the queue is at capacity; the caller should treat that as "dropped",
    /// not retry internally.
    pub fn offer_control(&self, payload: Vec<u8>) -> bool {
        let mut q = self.queues.lock().unwrap();
        if q.control.len() >= q.control_cap {
            return false;
        }
        q.control.push_back(payload);
        true
    }

    /// Overwrites the single pending transform payload; only the latest
    /// offered payload is ever sent.
    pub fn offer_transform(&self, payload: Vec<u8>) {
        let mut q = self.queues.lock().unwrap();
        q.transform = Some(payload);
    }

    pub fn connection_error(&self) -> bool {
        self.connection_error.load(Ordering::SeqCst)
    }

    /// Reads and clears the stored error, if any. The main thread must call
    /// this before attempting to reconnect.
    pub fn take_error(&self) -> Option<(String, f64)> {
        let mut slot = self.error.lock().unwrap();
        self.connection_error.store(false, Ordering::SeqCst);
        slot.take()
    }

    /// Signals the loop to stop and joins it with a bounded wait. Best
    /// effort: if the join doesn't complete promptly this still returns,
    /// since the loop observes the stop flag on every iteration and the
    /// socket timeout bounds how long any single iteration can block.
    pub fn disconnect(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

pub fn spawn<T: Transport + 'static>(
    mut transport: T,
    room_id: String,
    router: Arc<dyn RouterSink>,
    now_seconds: impl Fn() -> f64 + Send + 'static,
) -> IoCoreHandle {
    let queues = Arc::new(Mutex::new(OutboundQueues::new(DEFAULT_CONTROL_CAP)));
    let stop = Arc::new(AtomicBool::new(false));
    let error = Arc::new(Mutex::new(None));
    let connection_error = Arc::new(AtomicBool::new(false));

    let loop_queues = Arc::clone(&queues);
    let loop_stop = Arc::clone(&stop);
    let loop_error = Arc::clone(&error);
    let loop_connection_error = Arc::clone(&connection_error);

    let join = std::thread::spawn(move || {
        run_loop(
            &mut transport,
            &room_id,
            router.as_ref(),
            &loop_queues,
            &loop_stop,
            &loop_error,
            &loop_connection_error,
            &now_seconds,
        );
    });

    IoCoreHandle {
        queues,
        stop,
        error,
        connection_error,
        join: Arc::new(Mutex::new(Some(join))),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_loop<T: Transport + ?Sized>(
    transport: &mut T,
    room_id: &str,
    router: &dyn RouterSink,
    queues: &Mutex<OutboundQueues>,
    stop: &AtomicBool,
    error: &Mutex<Option<(String, f64)>>,
    connection_error: &AtomicBool,
    now_seconds: &(impl Fn() -> f64 + ?Sized),
) {
    while !stop.load(Ordering::SeqCst) {
        let mut did_work = false;

        let control_payload = {
            let q = queues.lock().unwrap();
            q.control.front().cloned()
        };
        if let Some(payload) = control_payload {
            match transport.send(room_id, &payload) {
                SendOutcome::Sent => {
                    queues.lock().unwrap().control.pop_front();
                    did_work = true;
                }
                SendOutcome::Backpressure => {}
                SendOutcome::Fatal(reason) => {
                    *error.lock().unwrap() = Some((reason, now_seconds()));
                    connection_error.store(true, Ordering::SeqCst);
                    return;
                }
            }
        } else {
            let transform_payload = queues.lock().unwrap().transform.take();
            if let Some(payload) = transform_payload {
                match transport.send(room_id, &payload) {
                    SendOutcome::Sent => {
                        did_work = true;
                    }
                    SendOutcome::Backpressure => {
                        // Restore for retry; a newer offer may still race
                        // ahead of it, which is fine (overwrite semantics).
                        let mut q = queues.lock().unwrap();
                        if q.transform.is_none() {
                            q.transform = Some(payload);
                        }
                    }
                    SendOutcome::Fatal(reason) => {
                        *error.lock().unwrap() = Some((reason, now_seconds()));
                        connection_error.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            }
        }

        let mut latest_inbound: Option<Vec<u8>> = None;
        while let Some((topic, payload)) = transport.recv_timeout(Duration::from_millis(5)) {
            did_work = true;
            if topic == room_id {
                latest_inbound = Some(payload);
            }
            // Keep draining within the short window so extras don't pile up,
            // but only the most recent matching-topic payload survives.
        }
        if let Some(payload) = latest_inbound {
            router.ingest(&payload);
        }

        if !did_work {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct FakeTransport {
        sent: mpsc::Sender<Vec<u8>>,
        inbound: VecDeque<(String, Vec<u8>)>,
        fail_next: bool,
    }

    impl Transport for FakeTransport {
        fn send(&mut self, _room_id: &str, payload: &[u8]) -> SendOutcome {
            if self.fail_next {
                return SendOutcome::Fatal("boom".to_string());
            }
            self.sent.send(payload.to_vec()).unwrap();
            SendOutcome::Sent
        }

        fn recv_timeout(&mut self, _timeout: Duration) -> Option<(String, Vec<u8>)> {
            self.inbound.pop_front()
        }
    }

    struct NullRouter;
    impl RouterSink for NullRouter {
        fn ingest(&self, _payload: &[u8]) {}
    }

    #[test]
    fn control_lane_drains_before_transform_lane() {
        let (tx, rx) = mpsc::channel();
        let transport = FakeTransport { sent: tx, inbound: VecDeque::new(), fail_next: false };
        let handle = spawn(transport, "room".to_string(), Arc::new(NullRouter), || 0.0);

        handle.offer_transform(vec![9]);
        handle.offer_control(vec![1]);

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first, vec![1]);
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(second, vec![9]);

        handle.disconnect();
    }

    #[test]
    fn transform_lane_keeps_only_latest() {
        let (tx, rx) = mpsc::channel();
        let transport = FakeTransport { sent: tx, inbound: VecDeque::new(), fail_next: false };
        let handle = spawn(transport, "room".to_string(), Arc::new(NullRouter), || 0.0);

        handle.offer_transform(vec![1]);
        handle.offer_transform(vec![2]);
        handle.offer_transform(vec![3]);

        let received = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received, vec![3]);

        handle.disconnect();
    }

    #[test]
    fn control_queue_rejects_past_cap() {
        let (tx, _rx) = mpsc::channel();
        let transport = FakeTransport { sent: tx, inbound: VecDeque::new(), fail_next: false };
        let handle = spawn(transport, "room".to_string(), Arc::new(NullRouter), || 0.0);
        handle.stop.store(true, Ordering::SeqCst);
        handle.disconnect();

        for _ in 0..DEFAULT_CONTROL_CAP {
            assert!(handle.offer_control(vec![0]));
        }
        assert!(!handle.offer_control(vec![0]));
    }

    #[test]
    fn fatal_send_sets_connection_error() {
        let (tx, _rx) = mpsc::channel();
        let transport = FakeTransport { sent: tx, inbound: VecDeque::new(), fail_next: true };
        let handle = spawn(transport, "room".to_string(), Arc::new(NullRouter), || 42.0);

        handle.offer_control(vec![1]);
        std::thread::sleep(Duration::from_millis(50));

        assert!(handle.connection_error());
        let (reason, ts) = handle.take_error().unwrap();
        assert_eq!(reason, "boom");
        assert_eq!(ts, 42.0);
        assert!(!handle.connection_error());
    }
}
