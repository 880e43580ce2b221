//! Cross-thread callback relay.
//!
//! When native code invokes a trampoline from a thread that does not own
//! the registration, the managed function must not run there. The
//! trampoline posts a [`RelayJob`] to the event channel and blocks on a
//! [`RelayReply`] until a pumping thread has executed the function and
//! published the result.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{BridgeError, NativeFaultError};
use crate::value::{CallbackFn, Value};

/// A managed callback invocation waiting to run on a pumping thread.
pub(crate) struct RelayJob {
    func: CallbackFn,
    receiver: Option<Value>,
    args: Vec<Value>,
    reply: Arc<RelayReply>,
}

impl RelayJob {
    pub(crate) fn new(
        func: CallbackFn,
        receiver: Option<Value>,
        args: Vec<Value>,
    ) -> (RelayJob, Arc<RelayReply>) {
        let reply = Arc::new(RelayReply {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        });
        let job = RelayJob {
            func,
            receiver,
            args,
            reply: reply.clone(),
        };
        (job, reply)
    }

    /// Execute the managed function and publish its result. Panics are
    /// caught and surface as a callback fault instead of unwinding into
    /// the pump.
    pub(crate) fn run(self) {
        let RelayJob {
            func,
            receiver,
            mut args,
            reply,
        } = self;
        if let Some(bound) = receiver {
            args.insert(0, bound);
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| func(&args)));
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(NativeFaultError::CallbackPanic.into()),
        };
        reply.finish(result);
    }
}

/// One-shot result slot the native thread blocks on.
pub(crate) struct RelayReply {
    slot: Mutex<Option<Result<Value, BridgeError>>>,
    cond: Condvar,
}

impl RelayReply {
    pub(crate) fn finish(&self, result: Result<Value, BridgeError>) {
        *self.slot.lock().unwrap() = Some(result);
        self.cond.notify_one();
    }

    /// Block until a pumping thread has produced the result. The wait is
    /// unbounded; a native thread stays parked until someone pumps.
    pub(crate) fn wait(&self) -> Result<Value, BridgeError> {
        let mut guard = self.slot.lock().unwrap();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            guard = self.cond.wait(guard).unwrap();
        }
    }
}
