//! Native-to-managed conversion.
//!
//! [`decode_from`] reads a C object of a known type and rebuilds the
//! corresponding [`Value`]. Return registers go through [`decode_return`]
//! instead, because libffi widens small integer returns to a full
//! `ffi_arg` slot.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::Arc;

use crate::error::{BridgeError, MarshalingError};
use crate::types::{ArrayHint, TypeDesc, TypeKind};
use crate::value::Value;

#[inline]
unsafe fn read<T>(src: *const u8) -> T {
    unsafe { std::ptr::read_unaligned(src as *const T) }
}

/// Rebuild a managed value from the `ty`-shaped C object at `src`.
///
/// # Safety
///
/// `src` must point at `ty.size()` readable bytes laid out as `ty`
/// describes. Pointer-bearing types are followed, so any address stored
/// in the object must itself be valid or null.
pub(crate) unsafe fn decode_from(
    src: *const u8,
    ty: &Arc<TypeDesc>,
) -> Result<Value, BridgeError> {
    match ty.kind() {
        TypeKind::Void | TypeKind::Opaque => {
            Err(MarshalingError::UndecodableType(ty.name().to_string()).into())
        }

        TypeKind::Bool => Ok(Value::Bool(unsafe { read::<u8>(src) } != 0)),
        TypeKind::Char => Ok(Value::Number(unsafe { read::<i8>(src) } as f64)),
        TypeKind::Char16 => Ok(Value::Number(unsafe { read::<u16>(src) } as f64)),

        TypeKind::Int8 => Ok(Value::Number(unsafe { read::<i8>(src) } as f64)),
        TypeKind::UInt8 => Ok(Value::Number(unsafe { read::<u8>(src) } as f64)),
        TypeKind::Int16 => Ok(Value::Number(unsafe { read::<i16>(src) } as f64)),
        TypeKind::UInt16 => Ok(Value::Number(unsafe { read::<u16>(src) } as f64)),
        TypeKind::Int32 => Ok(Value::Number(unsafe { read::<i32>(src) } as f64)),
        TypeKind::UInt32 => Ok(Value::Number(unsafe { read::<u32>(src) } as f64)),
        TypeKind::Int64 => Ok(Value::integer(unsafe { read::<i64>(src) })),
        TypeKind::UInt64 => Ok(Value::unsigned(unsafe { read::<u64>(src) })),

        TypeKind::Int16Swapped => {
            Ok(Value::Number(unsafe { read::<i16>(src) }.swap_bytes() as f64))
        }
        TypeKind::UInt16Swapped => {
            Ok(Value::Number(unsafe { read::<u16>(src) }.swap_bytes() as f64))
        }
        TypeKind::Int32Swapped => {
            Ok(Value::Number(unsafe { read::<i32>(src) }.swap_bytes() as f64))
        }
        TypeKind::UInt32Swapped => {
            Ok(Value::Number(unsafe { read::<u32>(src) }.swap_bytes() as f64))
        }
        TypeKind::Int64Swapped => {
            Ok(Value::integer(unsafe { read::<i64>(src) }.swap_bytes()))
        }
        TypeKind::UInt64Swapped => {
            Ok(Value::unsigned(unsafe { read::<u64>(src) }.swap_bytes()))
        }

        TypeKind::Float32 => Ok(Value::Number(unsafe { read::<f32>(src) } as f64)),
        TypeKind::Float64 => Ok(Value::Number(unsafe { read::<f64>(src) })),

        TypeKind::CString => {
            let addr = unsafe { read::<usize>(src) };
            if addr == 0 {
                return Ok(Value::Null);
            }
            let text = unsafe { CStr::from_ptr(addr as *const c_char) }
                .to_string_lossy()
                .into_owned();
            Ok(Value::string(text))
        }

        TypeKind::CString16 => {
            let addr = unsafe { read::<usize>(src) };
            if addr == 0 {
                return Ok(Value::Null);
            }
            Ok(unsafe { decode_text_utf16(addr as *const u8, usize::MAX) })
        }

        TypeKind::Pointer { .. } => {
            let addr = unsafe { read::<usize>(src) };
            if addr == 0 {
                Ok(Value::Null)
            } else {
                Ok(Value::pointer(addr, ty.clone()))
            }
        }

        TypeKind::Prototype(_) => {
            let addr = unsafe { read::<usize>(src) };
            if addr == 0 {
                Ok(Value::Null)
            } else {
                Ok(Value::pointer(addr, ty.clone()))
            }
        }

        TypeKind::Array { element, len, hint } => match (hint, element.kind()) {
            (ArrayHint::String, TypeKind::Char) => {
                Ok(unsafe { decode_text_bytes(src, *len) })
            }
            (ArrayHint::String, TypeKind::Char16) => {
                Ok(unsafe { decode_text_utf16(src, *len) })
            }
            _ => {
                let mut items = Vec::with_capacity(*len);
                for i in 0..*len {
                    items.push(unsafe { decode_from(src.add(i * element.size()), element)? });
                }
                Ok(Value::array(items))
            }
        },

        // Union members all live at offset zero; every view is reported.
        TypeKind::Record { members, .. } => {
            let mut entries = Vec::with_capacity(members.len());
            for member in members {
                let v = unsafe { decode_from(src.add(member.offset), &member.ty)? };
                entries.push((member.name.clone(), v));
            }
            Ok(Value::record(entries))
        }

        TypeKind::Disposable { target, dispose } => {
            let addr = unsafe { read::<usize>(src) };
            if addr == 0 {
                return Ok(Value::Null);
            }
            let decoded = unsafe { decode_from(src, target)? };
            dispose.dispose(addr);
            Ok(decoded)
        }
    }
}

/// Decode a return slot written by `ffi_call`.
///
/// Integer returns narrower than `ffi_arg` occupy a full widened slot, so
/// the value is read wide and truncated arithmetically. Everything else
/// is laid out exactly as in memory and goes through [`decode_from`].
///
/// # Safety
///
/// `buf` must point at a return slot of at least `ffi_arg` size that the
/// call filled in, or `ty.size()` bytes for larger types.
pub(crate) unsafe fn decode_return(
    buf: *const u8,
    ty: &Arc<TypeDesc>,
) -> Result<Value, BridgeError> {
    let kind = ty.kind();
    match kind {
        TypeKind::Void => Ok(Value::Null),

        TypeKind::Bool
        | TypeKind::Char
        | TypeKind::Char16
        | TypeKind::Int8
        | TypeKind::UInt8
        | TypeKind::Int16
        | TypeKind::UInt16
        | TypeKind::Int32
        | TypeKind::UInt32
        | TypeKind::Int16Swapped
        | TypeKind::UInt16Swapped
        | TypeKind::Int32Swapped
        | TypeKind::UInt32Swapped => {
            let w = unsafe { read::<u64>(buf) };
            Ok(match kind {
                TypeKind::Bool => Value::Bool(w as u8 != 0),
                TypeKind::Char => Value::Number(w as u8 as i8 as f64),
                TypeKind::Char16 => Value::Number(w as u16 as f64),
                TypeKind::Int8 => Value::Number(w as u8 as i8 as f64),
                TypeKind::UInt8 => Value::Number(w as u8 as f64),
                TypeKind::Int16 => Value::Number(w as u16 as i16 as f64),
                TypeKind::UInt16 => Value::Number(w as u16 as f64),
                TypeKind::Int32 => Value::Number(w as u32 as i32 as f64),
                TypeKind::UInt32 => Value::Number(w as u32 as f64),
                TypeKind::Int16Swapped => {
                    Value::Number((w as u16).swap_bytes() as i16 as f64)
                }
                TypeKind::UInt16Swapped => {
                    Value::Number((w as u16).swap_bytes() as f64)
                }
                TypeKind::Int32Swapped => {
                    Value::Number((w as u32).swap_bytes() as i32 as f64)
                }
                TypeKind::UInt32Swapped => {
                    Value::Number((w as u32).swap_bytes() as f64)
                }
                _ => unreachable!(),
            })
        }

        _ => unsafe { decode_from(buf, ty) },
    }
}

/// Copy at most `max` bytes starting at `src`, stopping at the first NUL.
pub(crate) unsafe fn decode_text_bytes(src: *const u8, max: usize) -> Value {
    let mut end = 0;
    while end < max && unsafe { read::<u8>(src.add(end)) } != 0 {
        end += 1;
    }
    let bytes = unsafe { std::slice::from_raw_parts(src, end) };
    Value::string(String::from_utf8_lossy(bytes).into_owned())
}

/// Copy at most `max` UTF-16 units starting at `src`, stopping at the
/// first NUL unit.
pub(crate) unsafe fn decode_text_utf16(src: *const u8, max: usize) -> Value {
    let mut units = Vec::new();
    let mut i = 0;
    while i < max {
        let unit = unsafe { read::<u16>(src.add(i * 2)) };
        if unit == 0 {
            break;
        }
        units.push(unit);
        i += 1;
    }
    Value::string(String::from_utf16_lossy(&units))
}

/// Decode `len` consecutive elements at `src`. Character elements decode
/// as bounded text, everything else as an array.
pub(crate) unsafe fn decode_slice_from(
    src: *const u8,
    element: &Arc<TypeDesc>,
    len: usize,
) -> Result<Value, BridgeError> {
    match element.kind() {
        TypeKind::Char => Ok(unsafe { decode_text_bytes(src, len) }),
        TypeKind::Char16 => Ok(unsafe { decode_text_utf16(src, len) }),
        _ => {
            let mut items = Vec::with_capacity(len);
            for i in 0..len {
                items.push(unsafe { decode_from(src.add(i * element.size()), element)? });
            }
            Ok(Value::array(items))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::resolve;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_widened_returns_truncate_like_c() {
        let slot: u64 = 0x0000_0001_0000_002a;
        let buf = slot.to_ne_bytes();

        let as_i32 = unsafe { decode_return(buf.as_ptr(), &resolve("int32").unwrap()) };
        assert_eq!(as_i32.unwrap(), Value::Number(42.0));

        let as_u8 = unsafe { decode_return(buf.as_ptr(), &resolve("uint8").unwrap()) };
        assert_eq!(as_u8.unwrap(), Value::Number(42.0));

        let neg: u64 = u64::from_ne_bytes((-7i64).to_ne_bytes());
        let buf = neg.to_ne_bytes();
        let as_i16 = unsafe { decode_return(buf.as_ptr(), &resolve("int16").unwrap()) };
        assert_eq!(as_i16.unwrap(), Value::Number(-7.0));
    }

    #[test]
    fn test_cstring_copies_until_nul() {
        let text = b"hello\0world";
        let cell = (text.as_ptr() as usize).to_ne_bytes();
        let v = unsafe { decode_from(cell.as_ptr(), &resolve("str").unwrap()) }.unwrap();
        assert_eq!(v, Value::string("hello"));
    }

    #[test]
    fn test_null_string_and_pointer_decode_as_null() {
        let cell = 0usize.to_ne_bytes();
        let s = unsafe { decode_from(cell.as_ptr(), &resolve("str").unwrap()) }.unwrap();
        assert_eq!(s, Value::Null);

        let p = unsafe { decode_from(cell.as_ptr(), &resolve("int32 *").unwrap()) }.unwrap();
        assert_eq!(p, Value::Null);
    }

    #[test]
    fn test_char_array_decodes_as_text_by_default() {
        let raw = *b"abc\0\0\0\0\0";
        let ty = resolve("char [8]").unwrap();
        let v = unsafe { decode_from(raw.as_ptr(), &ty) }.unwrap();
        assert_eq!(v, Value::string("abc"));
    }

    #[test]
    fn test_record_round_trip() {
        #[repr(C)]
        struct Native {
            a: i8,
            b: i32,
            c: f64,
        }
        let ty = crate::types::struct_type(
            "TyDecNative",
            &[
                ("a", "int8".into()),
                ("b", "int32".into()),
                ("c", "float64".into()),
            ],
        )
        .unwrap();

        let native = Native { a: -3, b: 512, c: 0.25 };
        let v = unsafe { decode_from(&native as *const Native as *const u8, &ty) }.unwrap();
        let record = v.as_record().unwrap();
        assert_eq!(record.get("a"), Some(&Value::Number(-3.0)));
        assert_eq!(record.get("b"), Some(&Value::Number(512.0)));
        assert_eq!(record.get("c"), Some(&Value::Number(0.25)));
    }

    #[test]
    fn test_union_reports_every_view() {
        let ty = crate::types::union_type(
            "TyDecUnion",
            &[("u", "uint32".into()), ("i", "int32".into())],
        )
        .unwrap();
        let raw = u32::MAX.to_ne_bytes();
        let v = unsafe { decode_from(raw.as_ptr(), &ty) }.unwrap();
        let record = v.as_record().unwrap();
        assert_eq!(record.get("u"), Some(&Value::Number(u32::MAX as f64)));
        assert_eq!(record.get("i"), Some(&Value::Number(-1.0)));
    }

    #[test]
    fn test_disposable_invokes_free_exactly_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let ty = crate::types::disposable_with(
            "TyDecDisposed",
            "str",
            crate::types::DisposeFn::custom(|_addr| {
                CALLS.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        let text = b"gone\0";
        let cell = (text.as_ptr() as usize).to_ne_bytes();
        let v = unsafe { decode_from(cell.as_ptr(), &ty) }.unwrap();
        assert_eq!(v, Value::string("gone"));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        let null = 0usize.to_ne_bytes();
        let v = unsafe { decode_from(null.as_ptr(), &ty) }.unwrap();
        assert_eq!(v, Value::Null);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bounded_text_stops_at_limit() {
        let raw = *b"abcdef";
        let v = unsafe { decode_text_bytes(raw.as_ptr(), 4) };
        assert_eq!(v, Value::string("abcd"));
    }
}
