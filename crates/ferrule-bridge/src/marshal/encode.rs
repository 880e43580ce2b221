//! Managed-to-native conversion.
//!
//! [`encode_into`] writes a [`Value`] as a C object of a given type at a
//! caller-supplied address. Strings, temporaries and nested buffers are
//! carved out of the frame's heap region, so everything written here stays
//! alive exactly as long as the frame.

use std::sync::Arc;

use crate::error::{BridgeError, MarshalingError};
use crate::marshal::CallFrame;
use crate::types::{TypeDesc, TypeKind};
use crate::value::Value;

fn mismatch(expected: &TypeDesc, got: &Value) -> MarshalingError {
    MarshalingError::TypeMismatch {
        expected: expected.name().to_string(),
        got: got.type_name(),
    }
}

#[inline]
unsafe fn put<T>(dst: *mut u8, v: T) {
    std::ptr::write_unaligned(dst as *mut T, v);
}

/// Write `value` as a `ty`-shaped C object at `dst`.
///
/// # Safety
///
/// `dst` must point at `ty.size()` writable bytes that stay valid for the
/// duration of the call being staged.
pub(crate) unsafe fn encode_into(
    frame: &mut CallFrame,
    dst: *mut u8,
    ty: &Arc<TypeDesc>,
    value: &Value,
) -> Result<(), BridgeError> {
    match ty.kind() {
        TypeKind::Void | TypeKind::Opaque => {
            Err(MarshalingError::UnencodableType(ty.name().to_string()).into())
        }

        TypeKind::Bool => {
            let b = value.as_bool().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<u8>(dst, b as u8) };
            Ok(())
        }

        TypeKind::Char => {
            let byte = match value {
                Value::String(s) => s.as_bytes().first().copied().unwrap_or(0),
                other => other.as_i64().ok_or_else(|| mismatch(ty, value))? as u8,
            };
            unsafe { put::<u8>(dst, byte) };
            Ok(())
        }

        TypeKind::Char16 => {
            let unit = match value {
                Value::String(s) => s.encode_utf16().next().unwrap_or(0),
                other => other.as_i64().ok_or_else(|| mismatch(ty, value))? as u16,
            };
            unsafe { put::<u16>(dst, unit) };
            Ok(())
        }

        TypeKind::Int8 => {
            let v = value.as_i64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<i8>(dst, v as i8) };
            Ok(())
        }
        TypeKind::UInt8 => {
            let v = value.as_u64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<u8>(dst, v as u8) };
            Ok(())
        }
        TypeKind::Int16 => {
            let v = value.as_i64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<i16>(dst, v as i16) };
            Ok(())
        }
        TypeKind::UInt16 => {
            let v = value.as_u64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<u16>(dst, v as u16) };
            Ok(())
        }
        TypeKind::Int32 => {
            let v = value.as_i64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<i32>(dst, v as i32) };
            Ok(())
        }
        TypeKind::UInt32 => {
            let v = value.as_u64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<u32>(dst, v as u32) };
            Ok(())
        }
        TypeKind::Int64 => {
            let v = value.as_i64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<i64>(dst, v) };
            Ok(())
        }
        TypeKind::UInt64 => {
            let v = value.as_u64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<u64>(dst, v) };
            Ok(())
        }

        TypeKind::Int16Swapped => {
            let v = value.as_i64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<i16>(dst, (v as i16).swap_bytes()) };
            Ok(())
        }
        TypeKind::UInt16Swapped => {
            let v = value.as_u64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<u16>(dst, (v as u16).swap_bytes()) };
            Ok(())
        }
        TypeKind::Int32Swapped => {
            let v = value.as_i64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<i32>(dst, (v as i32).swap_bytes()) };
            Ok(())
        }
        TypeKind::UInt32Swapped => {
            let v = value.as_u64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<u32>(dst, (v as u32).swap_bytes()) };
            Ok(())
        }
        TypeKind::Int64Swapped => {
            let v = value.as_i64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<i64>(dst, v.swap_bytes()) };
            Ok(())
        }
        TypeKind::UInt64Swapped => {
            let v = value.as_u64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<u64>(dst, v.swap_bytes()) };
            Ok(())
        }

        TypeKind::Float32 => {
            let v = value.as_f64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<f32>(dst, v as f32) };
            Ok(())
        }
        TypeKind::Float64 => {
            let v = value.as_f64().ok_or_else(|| mismatch(ty, value))?;
            unsafe { put::<f64>(dst, v) };
            Ok(())
        }

        TypeKind::CString => {
            let addr = encode_c_string(frame, ty, value)?;
            unsafe { put::<usize>(dst, addr) };
            Ok(())
        }
        TypeKind::CString16 => {
            let addr = encode_c_string16(frame, ty, value)?;
            unsafe { put::<usize>(dst, addr) };
            Ok(())
        }

        TypeKind::Pointer { target } => {
            let addr = unsafe { encode_pointer(frame, ty, target, value)? };
            unsafe { put::<usize>(dst, addr) };
            Ok(())
        }

        TypeKind::Prototype(_) => {
            let addr = encode_callback_slot(frame, ty, value)?;
            unsafe { put::<usize>(dst, addr) };
            Ok(())
        }

        TypeKind::Record { members, union, .. } => {
            let record = value.as_record().ok_or_else(|| mismatch(ty, value))?;
            if *union {
                let mut present = Vec::new();
                for member in members {
                    if let Some(v) = record.get(&member.name) {
                        present.push((member, v));
                    }
                }
                if present.len() != 1 {
                    return Err(MarshalingError::UnionMemberCount {
                        got: present.len(),
                    }
                    .into());
                }
                let (member, v) = &present[0];
                unsafe { encode_into(frame, dst.add(member.offset), &member.ty, v) }
            } else {
                for member in members {
                    let v = record.get(&member.name).ok_or_else(|| {
                        MarshalingError::MissingMember {
                            record: ty.name().to_string(),
                            member: member.name.clone(),
                        }
                    })?;
                    unsafe { encode_into(frame, dst.add(member.offset), &member.ty, v)? };
                }
                Ok(())
            }
        }

        TypeKind::Array { element, len, .. } => unsafe {
            encode_array(frame, dst, ty, element, *len, value)
        },

        // Dispose only matters when decoding; inputs encode as the target.
        TypeKind::Disposable { target, .. } => unsafe {
            encode_into(frame, dst, target, value)
        },
    }
}

fn encode_c_string(
    frame: &mut CallFrame,
    ty: &TypeDesc,
    value: &Value,
) -> Result<usize, BridgeError> {
    match value {
        Value::Null => Ok(0),
        Value::Pointer(p) => Ok(p.addr()),
        Value::String(s) => {
            let bytes = s.as_bytes();
            if bytes.contains(&0) {
                return Err(MarshalingError::EmbeddedNul.into());
            }
            let dst = frame.heap.alloc(bytes.len() + 1, 1)?;
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            }
            Ok(dst as usize)
        }
        other => Err(mismatch(ty, other).into()),
    }
}

fn encode_c_string16(
    frame: &mut CallFrame,
    ty: &TypeDesc,
    value: &Value,
) -> Result<usize, BridgeError> {
    match value {
        Value::Null => Ok(0),
        Value::Pointer(p) => Ok(p.addr()),
        Value::String(s) => {
            let units: Vec<u16> = s.encode_utf16().collect();
            if units.contains(&0) {
                return Err(MarshalingError::EmbeddedNul.into());
            }
            let dst = frame.heap.alloc((units.len() + 1) * 2, 2)?;
            unsafe {
                std::ptr::copy_nonoverlapping(units.as_ptr(), dst as *mut u16, units.len());
            }
            Ok(dst as usize)
        }
        other => Err(mismatch(ty, other).into()),
    }
}

/// Produce the address a pointer parameter should carry.
///
/// Records, arrays and strings are staged into a heap temporary so callers
/// can pass managed aggregates wherever C expects `T *`.
unsafe fn encode_pointer(
    frame: &mut CallFrame,
    ty: &TypeDesc,
    target: &Arc<TypeDesc>,
    value: &Value,
) -> Result<usize, BridgeError> {
    match value {
        Value::Null => Ok(0),
        Value::Pointer(p) => Ok(p.addr()),

        Value::Record(_) if matches!(target.kind(), TypeKind::Record { .. }) => {
            let buf = frame.heap.alloc(target.size(), target.align())?;
            unsafe { encode_into(frame, buf, target, value)? };
            Ok(buf as usize)
        }

        Value::Array(_) if matches!(target.kind(), TypeKind::Array { .. }) => {
            let buf = frame.heap.alloc(target.size(), target.align())?;
            unsafe { encode_into(frame, buf, target, value)? };
            Ok(buf as usize)
        }

        // A managed array against `T *` stages a packed buffer of its
        // elements; the length comes from the value.
        Value::Array(items) if target.size() > 0 => {
            let buf = frame.heap.alloc(items.len() * target.size(), target.align())?;
            for (i, item) in items.iter().enumerate() {
                unsafe { encode_into(frame, buf.add(i * target.size()), target, item)? };
            }
            Ok(buf as usize)
        }

        Value::String(_) if matches!(target.kind(), TypeKind::Char) => {
            encode_c_string(frame, ty, value)
        }
        Value::String(_) if matches!(target.kind(), TypeKind::Char16) => {
            encode_c_string16(frame, ty, value)
        }

        Value::Callback(_) => match target.kind() {
            TypeKind::Prototype(_) => encode_callback_slot(frame, target, value),
            _ => Err(mismatch(ty, value).into()),
        },

        other => Err(mismatch(ty, other).into()),
    }
}

fn encode_callback_slot(
    frame: &mut CallFrame,
    desc: &Arc<TypeDesc>,
    value: &Value,
) -> Result<usize, BridgeError> {
    match value {
        Value::Null => Ok(0),
        Value::Pointer(p) => Ok(p.addr()),
        Value::Callback(f) => {
            let registration = crate::callback::register_transient(f.clone(), desc)?;
            let addr = registration.address();
            frame.note_transient(registration);
            Ok(addr)
        }
        other => Err(MarshalingError::NotCallable(other.type_name().to_string()).into()),
    }
}

unsafe fn encode_array(
    frame: &mut CallFrame,
    dst: *mut u8,
    ty: &Arc<TypeDesc>,
    element: &Arc<TypeDesc>,
    len: usize,
    value: &Value,
) -> Result<(), BridgeError> {
    match value {
        Value::Array(items) => {
            if items.len() != len {
                return Err(MarshalingError::ArrayLength {
                    expected: len,
                    got: items.len(),
                }
                .into());
            }
            for (i, item) in items.iter().enumerate() {
                unsafe { encode_into(frame, dst.add(i * element.size()), element, item)? };
            }
            Ok(())
        }

        Value::String(s) if matches!(element.kind(), TypeKind::Char) => {
            let bytes = s.as_bytes();
            if bytes.len() > len {
                return Err(MarshalingError::ArrayLength {
                    expected: len,
                    got: bytes.len(),
                }
                .into());
            }
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
                std::ptr::write_bytes(dst.add(bytes.len()), 0, len - bytes.len());
            }
            Ok(())
        }

        Value::String(s) if matches!(element.kind(), TypeKind::Char16) => {
            let units: Vec<u16> = s.encode_utf16().collect();
            if units.len() > len {
                return Err(MarshalingError::ArrayLength {
                    expected: len,
                    got: units.len(),
                }
                .into());
            }
            unsafe {
                std::ptr::copy_nonoverlapping(units.as_ptr(), dst as *mut u16, units.len());
                std::ptr::write_bytes(
                    dst.add(units.len() * 2),
                    0,
                    (len - units.len()) * 2,
                );
            }
            Ok(())
        }

        other => Err(mismatch(ty, other).into()),
    }
}
