//! Reading and writing native memory through pointer values.
//!
//! These functions operate on addresses the caller already owns, such
//! as pointers returned from native calls or buffers handed to a
//! callback. [`decode`] converts native bytes into managed values;
//! [`encode`] is the write-side mirror. Writes go directly into the
//! target memory: values that would need staged temporaries (strings,
//! nested callback registrations) are rejected rather than left
//! pointing at storage that dies with the call.

use crate::error::{BridgeError, MarshalingError, TypeDescriptionError};
use crate::marshal::{decode as raw_decode, encode as raw_encode, CallFrame};
use crate::types::{self, TypeSpec};
use crate::value::Value;

fn addr_of(value: &Value) -> Result<usize, BridgeError> {
    match value {
        Value::Pointer(p) if !p.is_null() => Ok(p.addr()),
        Value::Pointer(_) | Value::Null => Err(MarshalingError::NullPointer.into()),
        other => Err(MarshalingError::TypeMismatch {
            expected: "pointer".to_string(),
            got: other.type_name(),
        }
        .into()),
    }
}

/// Decode one value of `spec` from the memory behind `pointer`.
pub fn decode(pointer: &Value, spec: impl Into<TypeSpec>) -> Result<Value, BridgeError> {
    decode_at(pointer, 0, spec)
}

/// Decode one value of `spec` at a byte offset from `pointer`.
pub fn decode_at(
    pointer: &Value,
    offset: isize,
    spec: impl Into<TypeSpec>,
) -> Result<Value, BridgeError> {
    let ty = types::resolve(spec)?;
    let addr = addr_of(pointer)?;
    let src = (addr as *const u8).wrapping_offset(offset);
    unsafe { raw_decode::decode_from(src, &ty) }
}

/// Decode `len` consecutive elements of `spec` at a byte offset from
/// `pointer`. `char` and `char16` elements decode as bounded text, any
/// other element type as an array.
pub fn decode_slice(
    pointer: &Value,
    offset: isize,
    spec: impl Into<TypeSpec>,
    len: usize,
) -> Result<Value, BridgeError> {
    let element = types::resolve(spec)?;
    if element.size() == 0 {
        return Err(TypeDescriptionError::IncompleteType(element.name().to_string()).into());
    }
    let addr = addr_of(pointer)?;
    let src = (addr as *const u8).wrapping_offset(offset);
    unsafe { raw_decode::decode_slice_from(src, &element, len) }
}

/// Encode `value` as `spec` into the memory behind `pointer`.
///
/// The target must be large enough for the encoded type. Values that
/// cannot live in caller-owned memory alone fail with
/// [`MarshalingError::UnencodableType`]: strings would need a staged
/// copy, and bare callback functions would need a registration scoped
/// to a call. Pass an already registered callback's pointer instead.
pub fn encode(
    pointer: &Value,
    spec: impl Into<TypeSpec>,
    value: &Value,
) -> Result<(), BridgeError> {
    encode_at(pointer, 0, spec, value)
}

/// Encode `value` as `spec` at a byte offset from `pointer`.
pub fn encode_at(
    pointer: &Value,
    offset: isize,
    spec: impl Into<TypeSpec>,
    value: &Value,
) -> Result<(), BridgeError> {
    let ty = types::resolve(spec)?;
    let addr = addr_of(pointer)?;
    let dst = (addr as *mut u8).wrapping_offset(offset);

    let mut frame = CallFrame::without_scratch();
    let outcome = unsafe { raw_encode::encode_into(&mut frame, dst, &ty, value) };
    let leaked_registration = frame.has_transients();
    frame.reset();

    if leaked_registration {
        // The trampoline died with the frame just now; null the target
        // so no stale code pointer survives in caller memory.
        unsafe { std::ptr::write_bytes(dst, 0, ty.size()) };
    }

    match outcome {
        Ok(()) if leaked_registration => {
            Err(MarshalingError::UnencodableType(ty.name().to_string()).into())
        }
        Err(BridgeError::Marshal(MarshalingError::ScratchExhausted { .. })) => {
            Err(MarshalingError::UnencodableType(ty.name().to_string()).into())
        }
        other => other,
    }
}

/// Release `pointer` with the C allocator's `free`. Null pointers and
/// [`Value::Null`] are ignored.
pub fn free(pointer: &Value) -> Result<(), BridgeError> {
    let addr = match pointer {
        Value::Null => return Ok(()),
        Value::Pointer(p) => p.addr(),
        other => {
            return Err(MarshalingError::TypeMismatch {
                expected: "pointer".to_string(),
                got: other.type_name(),
            }
            .into())
        }
    };
    if addr != 0 {
        unsafe { types::c_free(addr as *mut std::ffi::c_void) };
    }
    Ok(())
}
