//! Scratch memory management for foreign calls.
//!
//! Every call stages its data in a [`CallFrame`]: two bump-allocated
//! regions of fixed capacity. The stack region holds argument cells, the
//! heap region holds string copies, temporaries and output buffers. Native
//! code receives addresses into these regions, so the backing storage never
//! moves or grows while a call is in flight; running out is a
//! [`MarshalingError::ScratchExhausted`] instead of a reallocation.
//!
//! Frames are pooled. Synchronous calls share one resident frame per
//! region size, asynchronous calls keep up to
//! [`crate::BridgeConfig::resident_async_pools`] frames warm.

pub(crate) mod decode;
pub(crate) mod encode;

use std::sync::Mutex;

use crate::callback::CallbackRegistration;
use crate::config;
use crate::error::MarshalingError;
use crate::types::layout::align_up;

/// Which pool a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameMode {
    Sync,
    Async,
}

/// A fixed-capacity bump allocator handing out zeroed, aligned blocks.
pub(crate) struct RegionBuf {
    buf: Vec<u8>,
    used: usize,
    region: &'static str,
}

impl RegionBuf {
    fn with_capacity(region: &'static str, capacity: usize) -> Self {
        RegionBuf {
            buf: vec![0u8; capacity],
            used: 0,
            region,
        }
    }

    /// Hand out `size` zeroed bytes aligned to `align`. The address stays
    /// valid until the frame resets.
    pub(crate) fn alloc(&mut self, size: usize, align: usize) -> Result<*mut u8, MarshalingError> {
        let base = self.buf.as_mut_ptr() as usize;
        let aligned = align_up(base + self.used, align.max(1));
        let offset = aligned - base;
        let end = match offset.checked_add(size) {
            Some(end) if end <= self.buf.len() => end,
            _ => {
                return Err(MarshalingError::ScratchExhausted {
                    region: self.region,
                    needed: size,
                    available: self.buf.len().saturating_sub(self.used),
                })
            }
        };
        self.used = end;

        let ptr = unsafe { self.buf.as_mut_ptr().add(offset) };
        unsafe {
            std::ptr::write_bytes(ptr, 0, size);
        }
        Ok(ptr)
    }

    fn reset(&mut self) {
        self.used = 0;
    }
}

/// Scratch state for one foreign call.
pub(crate) struct CallFrame {
    pub(crate) stack: RegionBuf,
    pub(crate) heap: RegionBuf,
    transients: Vec<CallbackRegistration>,
    mode: FrameMode,
}

impl CallFrame {
    fn new(mode: FrameMode, stack_size: usize, heap_size: usize) -> Self {
        CallFrame {
            stack: RegionBuf::with_capacity("stack", stack_size),
            heap: RegionBuf::with_capacity("heap", heap_size),
            transients: Vec::new(),
            mode,
        }
    }

    /// A frame with zero scratch capacity, for encoding into memory the
    /// caller owns. Any value that would need a staged temporary fails
    /// with [`MarshalingError::ScratchExhausted`] instead of handing out
    /// a pointer that dies with the frame.
    pub(crate) fn without_scratch() -> Self {
        CallFrame::new(FrameMode::Sync, 0, 0)
    }

    /// Record a callback registered for the duration of this call.
    pub(crate) fn note_transient(&mut self, registration: CallbackRegistration) {
        self.transients.push(registration);
    }

    /// Whether this frame holds callback registrations that die with it.
    pub(crate) fn has_transients(&self) -> bool {
        !self.transients.is_empty()
    }

    pub(crate) fn reset(&mut self) {
        for registration in self.transients.drain(..) {
            let _ = crate::callback::unregister(registration);
        }
        self.stack.reset();
        self.heap.reset();
    }
}

static SYNC_POOL: Mutex<Vec<CallFrame>> = Mutex::new(Vec::new());
static ASYNC_POOL: Mutex<Vec<CallFrame>> = Mutex::new(Vec::new());

/// Exclusive use of a frame; returns it to its pool on drop.
pub(crate) struct FrameLease {
    frame: Option<CallFrame>,
}

impl FrameLease {
    pub(crate) fn frame(&mut self) -> &mut CallFrame {
        self.frame.as_mut().expect("frame already released")
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(mut frame) = self.frame.take() {
            frame.reset();
            let (pool, keep) = match frame.mode {
                FrameMode::Sync => (&SYNC_POOL, 1),
                FrameMode::Async => (&ASYNC_POOL, config::current().resident_async_pools),
            };
            let mut guard = pool.lock().unwrap();
            if guard.len() < keep {
                guard.push(frame);
            }
        }
    }
}

/// Take a frame from the pool, or build one sized by the configuration.
pub(crate) fn acquire(mode: FrameMode) -> FrameLease {
    let pool = match mode {
        FrameMode::Sync => &SYNC_POOL,
        FrameMode::Async => &ASYNC_POOL,
    };
    if let Some(frame) = pool.lock().unwrap().pop() {
        return FrameLease { frame: Some(frame) };
    }

    let cfg = config::current();
    let (stack_size, heap_size) = match mode {
        FrameMode::Sync => (cfg.sync_stack_size, cfg.sync_heap_size),
        FrameMode::Async => (cfg.async_stack_size, cfg.async_heap_size),
    };
    FrameLease {
        frame: Some(CallFrame::new(mode, stack_size, heap_size)),
    }
}
