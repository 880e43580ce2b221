//! Managed callbacks exposed to native code.
//!
//! Registration hands native code a trampoline address wired to a
//! managed function:
//! - A fixed arena of [`MAX_TRAMPOLINES`] slots tracks live registrations
//! - Each registration leaks one libffi closure so the executable mapping
//!   survives unregistration forever
//! - Generation counters route calls through stale addresses to a zero
//!   sentinel instead of a dangling function
//! - Invocations from threads that do not own the registration are
//!   relayed to a pumping thread and the native caller blocks on the
//!   reply
//!
//! Faults raised inside a trampoline (stale hit, managed panic, managed
//! error) cannot unwind into native frames. They are latched per thread
//! and surface as the error of the managed call that was on the stack,
//! if any.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};

use libffi::low::ffi_cif;
use libffi::middle::Closure;

use crate::call::asynch::{self, Event};
use crate::call::cif::PreparedCif;
use crate::error::{BridgeError, MarshalingError, NativeFaultError};
use crate::marshal::{decode, CallFrame};
use crate::types::{Prototype, TypeDesc, TypeKind, TypeSpec};
use crate::value::{CallbackFn, Value};

pub(crate) mod relay;

use relay::RelayJob;

/// Process-wide ceiling on simultaneously registered callbacks.
pub const MAX_TRAMPOLINES: usize = 1024;

struct SlotKey {
    index: usize,
    generation: u64,
}

#[derive(Default)]
struct Slot {
    active: bool,
    generation: u64,
    func: Option<CallbackFn>,
    receiver: Option<Value>,
    proto: Option<Arc<Prototype>>,
    owner: Option<ThreadId>,
}

struct Arena {
    slots: Vec<Mutex<Slot>>,
    free: Mutex<Vec<usize>>,
    stale_hits: AtomicU64,
}

static ARENA: OnceLock<Arena> = OnceLock::new();

fn arena() -> &'static Arena {
    ARENA.get_or_init(|| Arena {
        slots: (0..MAX_TRAMPOLINES)
            .map(|_| Mutex::new(Slot::default()))
            .collect(),
        free: Mutex::new((0..MAX_TRAMPOLINES).rev().collect()),
        stale_hits: AtomicU64::new(0),
    })
}

thread_local! {
    static PENDING_FAULT: Cell<Option<NativeFaultError>> = const { Cell::new(None) };
}

fn latch_fault(fault: NativeFaultError) {
    PENDING_FAULT.with(|cell| cell.set(Some(fault)));
}

/// Take the fault latched on this thread, if any. Managed calls clear
/// the latch before dialing out and check it right after.
pub(crate) fn take_fault() -> Option<NativeFaultError> {
    PENDING_FAULT.with(|cell| cell.take())
}

/// Times native code called a trampoline after its registration ended.
pub fn stale_trampoline_hits() -> u64 {
    arena().stale_hits.load(Ordering::SeqCst)
}

/// Handle to a registered callback.
///
/// Clones refer to the same trampoline; unregistering through any of
/// them invalidates all.
#[derive(Debug, Clone)]
pub struct CallbackRegistration {
    index: usize,
    generation: u64,
    code: usize,
    desc: Arc<TypeDesc>,
}

impl CallbackRegistration {
    /// Address native code can store and call.
    pub fn address(&self) -> usize {
        self.code
    }

    /// The trampoline address as a pointer value, ready to pass as an
    /// argument.
    pub fn as_value(&self) -> Value {
        Value::pointer(self.code, self.desc.clone())
    }
}

fn prototype_of(desc: &Arc<TypeDesc>) -> Result<(Arc<TypeDesc>, Arc<Prototype>), BridgeError> {
    match desc.kind() {
        TypeKind::Prototype(proto) => Ok((desc.clone(), proto.clone())),
        TypeKind::Pointer { target } => match target.kind() {
            TypeKind::Prototype(proto) => Ok((target.clone(), proto.clone())),
            _ => Err(MarshalingError::NotCallable(desc.name().to_string()).into()),
        },
        _ => Err(MarshalingError::NotCallable(desc.name().to_string()).into()),
    }
}

/// Register a managed function under a callback type.
///
/// The returned registration stays valid until [`unregister`]; native
/// code may store the address and call it at any time from any thread.
pub fn register<F>(
    func: F,
    proto: impl Into<TypeSpec>,
) -> Result<CallbackRegistration, BridgeError>
where
    F: Fn(&[Value]) -> Result<Value, BridgeError> + Send + Sync + 'static,
{
    let desc = crate::types::resolve(proto)?;
    do_register(Arc::new(func), None, &desc)
}

/// Like [`register`], with `receiver` delivered as the leading argument
/// of every invocation.
pub fn register_bound<F>(
    receiver: Value,
    func: F,
    proto: impl Into<TypeSpec>,
) -> Result<CallbackRegistration, BridgeError>
where
    F: Fn(&[Value]) -> Result<Value, BridgeError> + Send + Sync + 'static,
{
    let desc = crate::types::resolve(proto)?;
    do_register(Arc::new(func), Some(receiver), &desc)
}

/// Registration for the duration of one call, driven by the owning
/// frame.
pub(crate) fn register_transient(
    func: CallbackFn,
    desc: &Arc<TypeDesc>,
) -> Result<CallbackRegistration, BridgeError> {
    do_register(func, None, desc)
}

fn do_register(
    func: CallbackFn,
    receiver: Option<Value>,
    desc: &Arc<TypeDesc>,
) -> Result<CallbackRegistration, BridgeError> {
    let (desc, proto) = prototype_of(desc)?;

    let params: Vec<Arc<TypeDesc>> = proto.params().iter().map(|p| p.ty.clone()).collect();
    let prepared = PreparedCif::prepare(proto.convention(), proto.return_type(), &params)?;

    let arena = arena();
    let index = arena
        .free
        .lock()
        .unwrap()
        .pop()
        .ok_or(MarshalingError::TrampolineLimit(MAX_TRAMPOLINES))?;

    let mut slot = arena.slots[index].lock().unwrap();
    let generation = slot.generation;

    let key: &'static SlotKey = Box::leak(Box::new(SlotKey { index, generation }));
    let closure = Closure::new(prepared.into_cif(), trampoline_handler, key);
    let code = *closure.code_ptr() as usize;
    // The executable mapping must outlive the registration so stale
    // pointers reach the sentinel instead of unmapped memory.
    std::mem::forget(closure);

    slot.active = true;
    slot.func = Some(func);
    slot.receiver = receiver;
    slot.proto = Some(proto);
    slot.owner = Some(thread::current().id());
    drop(slot);

    Ok(CallbackRegistration {
        index,
        generation,
        code,
        desc,
    })
}

/// End a registration. The slot becomes free for reuse; the old address
/// keeps hitting the zero sentinel forever.
pub fn unregister(registration: CallbackRegistration) -> Result<(), BridgeError> {
    let arena = arena();
    {
        let mut slot = arena.slots[registration.index].lock().unwrap();
        if !slot.active || slot.generation != registration.generation {
            return Err(MarshalingError::UnknownRegistration.into());
        }
        slot.active = false;
        slot.generation += 1;
        slot.func = None;
        slot.receiver = None;
        slot.proto = None;
        slot.owner = None;
    }
    arena.free.lock().unwrap().push(registration.index);
    Ok(())
}

/// Fill a closure return slot with zeroes, covering at least one
/// `ffi_arg`.
unsafe fn zero_return(cif: &ffi_cif, ret: *mut u8) {
    let size = unsafe { (*cif.rtype).size }.max(std::mem::size_of::<u64>());
    unsafe { std::ptr::write_bytes(ret, 0, size) };
}

extern "C" fn trampoline_handler(
    cif: &ffi_cif,
    result: &mut u64,
    args: *const *const std::ffi::c_void,
    key: &SlotKey,
) {
    let arena = arena();
    let ret_slot = result as *mut u64 as *mut u8;

    // Copy everything out so the slot lock is not held while managed
    // code runs; callbacks may register or unregister freely.
    let grabbed = {
        let slot = arena.slots[key.index].lock().unwrap();
        match (&slot.func, &slot.proto) {
            (Some(func), Some(proto)) if slot.active && slot.generation == key.generation => {
                Some((func.clone(), proto.clone(), slot.receiver.clone(), slot.owner))
            }
            _ => None,
        }
    };
    let Some((func, proto, receiver, owner)) = grabbed else {
        arena.stale_hits.fetch_add(1, Ordering::SeqCst);
        latch_fault(NativeFaultError::StaleTrampoline);
        unsafe { zero_return(cif, ret_slot) };
        return;
    };

    let mut decoded = Vec::with_capacity(proto.params().len());
    for (i, param) in proto.params().iter().enumerate() {
        let src = unsafe { *args.add(i) } as *const u8;
        match unsafe { decode::decode_from(src, &param.ty) } {
            Ok(value) => decoded.push(value),
            Err(e) => {
                latch_fault(NativeFaultError::CallbackFailed(e.to_string()));
                unsafe { zero_return(cif, ret_slot) };
                return;
            }
        }
    }

    let outcome = if owner == Some(thread::current().id()) {
        let mut call_args = decoded;
        if let Some(bound) = receiver {
            call_args.insert(0, bound);
        }
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| func(&call_args))) {
            Ok(result) => result,
            Err(_) => Err(NativeFaultError::CallbackPanic.into()),
        }
    } else {
        let (job, reply) = RelayJob::new(func, receiver, decoded);
        asynch::post(Event::Relay(job));
        reply.wait()
    };

    match outcome {
        Ok(value) => {
            let written =
                unsafe { encode_closure_return(proto.return_type(), &value, ret_slot) };
            if let Err(e) = written {
                latch_fault(NativeFaultError::CallbackFailed(e.to_string()));
                unsafe { zero_return(cif, ret_slot) };
            }
        }
        Err(BridgeError::Fault(fault)) => {
            latch_fault(fault);
            unsafe { zero_return(cif, ret_slot) };
        }
        Err(other) => {
            latch_fault(NativeFaultError::CallbackFailed(other.to_string()));
            unsafe { zero_return(cif, ret_slot) };
        }
    }
}

/// Write a managed return value into a closure return slot.
///
/// Integer returns occupy a widened `ffi_arg` slot, floats and records
/// their exact layout. Strings are duplicated onto the C heap because
/// the closure frame dies when the handler returns; the native side
/// owns the copy.
unsafe fn encode_closure_return(
    ret: &Arc<TypeDesc>,
    value: &Value,
    dst: *mut u8,
) -> Result<(), BridgeError> {
    let wide = dst as *mut u64;
    let mismatch = || MarshalingError::TypeMismatch {
        expected: ret.name().to_string(),
        got: value.type_name(),
    };

    match ret.kind() {
        TypeKind::Void => {
            unsafe { *wide = 0 };
            Ok(())
        }
        TypeKind::Bool => {
            let b = value.as_bool().ok_or_else(mismatch)?;
            unsafe { *wide = b as u64 };
            Ok(())
        }
        TypeKind::Char | TypeKind::Int8 => {
            let v = value.as_i64().ok_or_else(mismatch)? as i8;
            unsafe { *wide = v as i64 as u64 };
            Ok(())
        }
        TypeKind::UInt8 => {
            let v = value.as_u64().ok_or_else(mismatch)? as u8;
            unsafe { *wide = v as u64 };
            Ok(())
        }
        TypeKind::Int16 => {
            let v = value.as_i64().ok_or_else(mismatch)? as i16;
            unsafe { *wide = v as i64 as u64 };
            Ok(())
        }
        TypeKind::Char16 | TypeKind::UInt16 => {
            let v = value.as_u64().ok_or_else(mismatch)? as u16;
            unsafe { *wide = v as u64 };
            Ok(())
        }
        TypeKind::Int32 => {
            let v = value.as_i64().ok_or_else(mismatch)? as i32;
            unsafe { *wide = v as i64 as u64 };
            Ok(())
        }
        TypeKind::UInt32 => {
            let v = value.as_u64().ok_or_else(mismatch)? as u32;
            unsafe { *wide = v as u64 };
            Ok(())
        }
        TypeKind::Int16Swapped => {
            let v = (value.as_i64().ok_or_else(mismatch)? as i16).swap_bytes();
            unsafe { *wide = v as i64 as u64 };
            Ok(())
        }
        TypeKind::UInt16Swapped => {
            let v = (value.as_u64().ok_or_else(mismatch)? as u16).swap_bytes();
            unsafe { *wide = v as u64 };
            Ok(())
        }
        TypeKind::Int32Swapped => {
            let v = (value.as_i64().ok_or_else(mismatch)? as i32).swap_bytes();
            unsafe { *wide = v as i64 as u64 };
            Ok(())
        }
        TypeKind::UInt32Swapped => {
            let v = (value.as_u64().ok_or_else(mismatch)? as u32).swap_bytes();
            unsafe { *wide = v as u64 };
            Ok(())
        }
        TypeKind::Int64 | TypeKind::Int64Swapped => {
            let mut v = value.as_i64().ok_or_else(mismatch)?;
            if matches!(ret.kind(), TypeKind::Int64Swapped) {
                v = v.swap_bytes();
            }
            unsafe { *wide = v as u64 };
            Ok(())
        }
        TypeKind::UInt64 | TypeKind::UInt64Swapped => {
            let mut v = value.as_u64().ok_or_else(mismatch)?;
            if matches!(ret.kind(), TypeKind::UInt64Swapped) {
                v = v.swap_bytes();
            }
            unsafe { *wide = v };
            Ok(())
        }
        TypeKind::Float32 => {
            let v = value.as_f64().ok_or_else(mismatch)? as f32;
            unsafe { std::ptr::write_unaligned(dst as *mut f32, v) };
            Ok(())
        }
        TypeKind::Float64 => {
            let v = value.as_f64().ok_or_else(mismatch)?;
            unsafe { std::ptr::write_unaligned(dst as *mut f64, v) };
            Ok(())
        }
        TypeKind::CString => {
            let addr = dup_c_string(ret, value)?;
            unsafe { *wide = addr as u64 };
            Ok(())
        }
        TypeKind::CString16 => {
            let addr = dup_c_string16(ret, value)?;
            unsafe { *wide = addr as u64 };
            Ok(())
        }
        TypeKind::Pointer { .. } | TypeKind::Prototype(_) => match value {
            Value::Null => {
                unsafe { *wide = 0 };
                Ok(())
            }
            Value::Pointer(p) => {
                unsafe { *wide = p.addr() as u64 };
                Ok(())
            }
            other => Err(MarshalingError::TypeMismatch {
                expected: ret.name().to_string(),
                got: other.type_name(),
            }
            .into()),
        },
        TypeKind::Record { .. } => {
            unsafe { std::ptr::write_bytes(dst, 0, ret.size()) };
            let mut frame = CallFrame::without_scratch();
            let outcome = unsafe { crate::marshal::encode::encode_into(&mut frame, dst, ret, value) };
            frame.reset();
            outcome.map_err(|e| match e {
                BridgeError::Marshal(MarshalingError::ScratchExhausted { .. }) => {
                    MarshalingError::UnencodableType(ret.name().to_string()).into()
                }
                other => other,
            })
        }
        TypeKind::Disposable { target, .. } => {
            unsafe { encode_closure_return(target, value, dst) }
        }
        TypeKind::Array { .. } | TypeKind::Opaque => {
            Err(MarshalingError::UnencodableType(ret.name().to_string()).into())
        }
    }
}

extern "C" {
    fn malloc(size: usize) -> *mut std::ffi::c_void;
}

fn dup_c_string(ret: &Arc<TypeDesc>, value: &Value) -> Result<usize, BridgeError> {
    match value {
        Value::Null => Ok(0),
        Value::Pointer(p) => Ok(p.addr()),
        Value::String(s) => {
            let bytes = s.as_bytes();
            if bytes.contains(&0) {
                return Err(MarshalingError::EmbeddedNul.into());
            }
            unsafe {
                let buf = malloc(bytes.len() + 1) as *mut u8;
                if buf.is_null() {
                    return Ok(0);
                }
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, bytes.len());
                *buf.add(bytes.len()) = 0;
                Ok(buf as usize)
            }
        }
        other => Err(MarshalingError::TypeMismatch {
            expected: ret.name().to_string(),
            got: other.type_name(),
        }
        .into()),
    }
}

fn dup_c_string16(ret: &Arc<TypeDesc>, value: &Value) -> Result<usize, BridgeError> {
    match value {
        Value::Null => Ok(0),
        Value::Pointer(p) => Ok(p.addr()),
        Value::String(s) => {
            let units: Vec<u16> = s.encode_utf16().collect();
            if units.contains(&0) {
                return Err(MarshalingError::EmbeddedNul.into());
            }
            unsafe {
                let buf = malloc((units.len() + 1) * 2) as *mut u16;
                if buf.is_null() {
                    return Ok(0);
                }
                std::ptr::copy_nonoverlapping(units.as_ptr(), buf, units.len());
                *buf.add(units.len()) = 0;
                Ok(buf as usize)
            }
        }
        other => Err(MarshalingError::TypeMismatch {
            expected: ret.name().to_string(),
            got: other.type_name(),
        }
        .into()),
    }
}
