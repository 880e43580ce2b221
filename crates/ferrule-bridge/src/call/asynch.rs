//! Asynchronous call dispatch and the completion event loop.
//!
//! This module provides the machinery behind `call_async`:
//! - A dedicated tokio runtime whose blocking pool runs native calls
//! - A process-wide event channel carrying completions and callback
//!   relay jobs back to pumping threads
//! - In-flight accounting against the configured ceiling
//! - Cancellation that suppresses delivery without interrupting the
//!   native call itself
//!
//! Completions never run on the worker thread. They are queued and only
//! execute inside [`pump`] or [`pump_timeout`], so the caller decides
//! which thread observes results.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::runtime::Runtime;

use crate::callback::relay::RelayJob;
use crate::error::{BridgeError, MarshalingError};
use crate::value::Value;

/// Result of a finished native call: the decoded return value plus the
/// argument list with output parameters written back.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub value: Value,
    pub args: Vec<Value>,
}

/// Callback invoked from a pumping thread when an asynchronous call
/// finishes.
pub type AsyncCompletion = Box<dyn FnOnce(Result<CallOutcome, BridgeError>) + Send + 'static>;

const PHASE_CREATED: u8 = 0;
const PHASE_DISPATCHED: u8 = 1;
const PHASE_COMPLETED: u8 = 2;

/// Shared progress record of one asynchronous call.
pub(crate) struct AsyncState {
    cancelled: AtomicBool,
    phase: AtomicU8,
}

impl AsyncState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(AsyncState {
            cancelled: AtomicBool::new(false),
            phase: AtomicU8::new(PHASE_CREATED),
        })
    }
}

/// Handle to an in-flight asynchronous call.
///
/// Dropping the handle does not affect the call; it keeps running and
/// its completion is still delivered.
pub struct AsyncCall {
    state: Arc<AsyncState>,
}

impl AsyncCall {
    pub(crate) fn new(state: Arc<AsyncState>) -> Self {
        AsyncCall { state }
    }

    /// Suppress delivery of the completion. The native call itself is
    /// not interrupted. Returns `false` when the call had already
    /// finished, in which case the completion may still run.
    pub fn cancel(&self) -> bool {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.phase.load(Ordering::SeqCst) != PHASE_COMPLETED
    }

    /// Whether the native call has finished executing.
    pub fn is_completed(&self) -> bool {
        self.state.phase.load(Ordering::SeqCst) == PHASE_COMPLETED
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

/// An item queued for a pumping thread.
pub(crate) enum Event {
    Completion {
        completion: AsyncCompletion,
        result: Result<CallOutcome, BridgeError>,
        state: Arc<AsyncState>,
    },
    Relay(RelayJob),
}

impl Event {
    fn dispatch(self) {
        match self {
            Event::Completion {
                completion,
                result,
                state,
            } => {
                if !state.cancelled.load(Ordering::SeqCst) {
                    completion(result);
                }
            }
            Event::Relay(job) => job.run(),
        }
    }
}

// std's Sender is not Sync, so both ends sit behind a Mutex and the
// receiver side is drained in batches.
struct EventHub {
    tx: Mutex<mpsc::Sender<Event>>,
    rx: Mutex<mpsc::Receiver<Event>>,
}

static HUB: OnceLock<EventHub> = OnceLock::new();

fn hub() -> &'static EventHub {
    HUB.get_or_init(|| {
        let (tx, rx) = mpsc::channel();
        EventHub {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        }
    })
}

pub(crate) fn post(event: Event) {
    let _ = hub().tx.lock().unwrap().send(event);
}

/// Run every queued completion and relay job without blocking.
///
/// Returns the number of events serviced. When another thread is
/// already pumping, returns 0 immediately.
pub fn pump() -> usize {
    let mut batch = Vec::new();
    if let Ok(rx) = hub().rx.try_lock() {
        while let Ok(event) = rx.try_recv() {
            batch.push(event);
        }
    }
    // Events run after the receiver lock is released, so a completion
    // may itself pump or start new calls.
    let serviced = batch.len();
    for event in batch {
        event.dispatch();
    }
    serviced
}

/// Wait up to `timeout` for one event, then drain whatever else is
/// queued. Returns the number of events serviced.
pub fn pump_timeout(timeout: Duration) -> usize {
    let mut batch = Vec::new();
    {
        let rx = hub().rx.lock().unwrap();
        if let Ok(event) = rx.recv_timeout(timeout) {
            batch.push(event);
            while let Ok(more) = rx.try_recv() {
                batch.push(more);
            }
        }
    }
    let serviced = batch.len();
    for event in batch {
        event.dispatch();
    }
    serviced
}

/// Pump until no asynchronous call is in flight and every queued event
/// has run. Returns the number of events serviced.
///
/// Completions may start new calls; those are waited out too.
pub fn wait_idle() -> usize {
    let mut serviced = pump();
    while in_flight() != 0 {
        serviced += pump_timeout(Duration::from_millis(10));
    }
    serviced + pump()
}

static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Claim an in-flight slot, failing once the configured ceiling is
/// reached.
pub(crate) fn try_reserve_slot() -> Result<(), MarshalingError> {
    let limit = crate::config::current().max_async_calls;
    IN_FLIGHT
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            if n < limit {
                Some(n + 1)
            } else {
                None
            }
        })
        .map(|_| ())
        .map_err(|_| MarshalingError::AsyncCallLimit(limit))
}

fn release_slot() {
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
}

pub(crate) fn in_flight() -> usize {
    IN_FLIGHT.load(Ordering::SeqCst)
}

static WORKER: OnceLock<Runtime> = OnceLock::new();

/// The runtime whose blocking pool hosts native calls. One core thread
/// is enough; every call occupies a blocking slot instead.
fn worker() -> &'static Runtime {
    WORKER.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(crate::config::current().max_async_calls)
            .thread_name("ferrule-worker")
            .build()
            .expect("Failed to initialize async call runtime")
    })
}

/// Hand a reserved call to the worker pool. `work` runs the native call
/// and the result is queued for the next pump.
pub(crate) fn dispatch_call(
    state: Arc<AsyncState>,
    work: impl FnOnce() -> Result<CallOutcome, BridgeError> + Send + 'static,
    completion: AsyncCompletion,
) {
    worker().spawn_blocking(move || {
        state.phase.store(PHASE_DISPATCHED, Ordering::SeqCst);
        let result = work();
        state.phase.store(PHASE_COMPLETED, Ordering::SeqCst);
        // Post before releasing the slot: once the in-flight count hits
        // zero, every completion is already queued, which is what lets
        // wait_idle drain and stop.
        post(Event::Completion {
            completion,
            result,
            state: state.clone(),
        });
        release_slot();
    });
}
