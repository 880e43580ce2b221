//! libffi call interface preparation.
//!
//! Descriptors are lowered to `libffi::middle::Type` values, then a
//! [`PreparedCif`] owns the prepared `ffi_cif` together with the type
//! storage it points into. Conventions other than the platform default
//! and variadic signatures re-run the low-level prep over the same
//! storage with an explicit ABI and argument split.

use std::sync::Arc;

use libffi::low;
use libffi::middle::{Cif, Type};

use crate::call::CallConvention;
use crate::error::{BridgeError, ConventionError, TypeDescriptionError};
use crate::types::{Member, TypeDesc, TypeKind};

/// Lower a descriptor to the libffi type used for by-value traffic.
///
/// Pointer-bearing kinds all collapse to `pointer`. Records whose layout
/// libffi can reproduce keep their member types so the platform ABI can
/// classify them; packed, union and custom-aligned records fall back to
/// an opaque granule filling with the same size and alignment.
pub(crate) fn ffi_type_for(desc: &TypeDesc) -> Type {
    match desc.kind() {
        TypeKind::Void => Type::void(),

        TypeKind::Bool | TypeKind::UInt8 => Type::u8(),
        TypeKind::Char | TypeKind::Int8 => Type::i8(),
        TypeKind::Char16 | TypeKind::UInt16 | TypeKind::UInt16Swapped => Type::u16(),
        TypeKind::Int16 | TypeKind::Int16Swapped => Type::i16(),
        TypeKind::Int32 | TypeKind::Int32Swapped => Type::i32(),
        TypeKind::UInt32 | TypeKind::UInt32Swapped => Type::u32(),
        TypeKind::Int64 | TypeKind::Int64Swapped => Type::i64(),
        TypeKind::UInt64 | TypeKind::UInt64Swapped => Type::u64(),

        TypeKind::Float32 => Type::f32(),
        TypeKind::Float64 => Type::f64(),

        TypeKind::CString
        | TypeKind::CString16
        | TypeKind::Pointer { .. }
        | TypeKind::Opaque
        | TypeKind::Prototype(_)
        | TypeKind::Disposable { .. } => Type::pointer(),

        // Arrays only travel by value inside records; a struct of N
        // element types has the same size, alignment and classification.
        TypeKind::Array { element, len, .. } => {
            Type::structure((0..*len).map(|_| ffi_type_for(element)))
        }

        TypeKind::Record {
            members,
            union,
            packed,
        } => {
            if *union || *packed || !natural_layout(members, desc.size(), desc.align()) {
                granule_fill(desc.size(), desc.align())
            } else {
                Type::structure(members.iter().map(|m| ffi_type_for(&m.ty)))
            }
        }
    }
}

/// Whether sequential natural placement reproduces the stored offsets.
fn natural_layout(members: &[Member], size: usize, align: usize) -> bool {
    let mut cursor = 0usize;
    let mut max_align = 1usize;
    for member in members {
        let a = member.ty.align().max(1);
        max_align = max_align.max(a);
        let natural = (cursor + a - 1) / a * a;
        if member.offset != natural {
            return false;
        }
        cursor = natural + member.ty.size();
    }
    let rounded = (cursor + max_align - 1) / max_align * max_align;
    rounded == size && max_align == align
}

/// An anonymous struct of integer granules with the given size and
/// alignment. Loses ABI classification but keeps layout exact.
fn granule_fill(size: usize, align: usize) -> Type {
    match align.min(8) {
        1 => Type::structure((0..size).map(|_| Type::u8())),
        2 => Type::structure((0..size / 2).map(|_| Type::u16())),
        4 => Type::structure((0..size / 4).map(|_| Type::u32())),
        _ => Type::structure((0..size / 8).map(|_| Type::u64())),
    }
}

/// A prepared call interface plus the type storage its `ffi_cif` points
/// into. Immutable once built.
#[derive(Debug)]
pub(crate) struct PreparedCif {
    cif: Cif,
    ret_size: usize,
}

// Safety: the inner pointers reference storage owned by `cif` that is
// never mutated after preparation.
unsafe impl Send for PreparedCif {}
unsafe impl Sync for PreparedCif {}

impl PreparedCif {
    /// Prepare a fixed-arity interface.
    pub(crate) fn prepare(
        convention: CallConvention,
        ret: &Arc<TypeDesc>,
        params: &[Arc<TypeDesc>],
    ) -> Result<Self, BridgeError> {
        let cif = Cif::new(
            params.iter().map(|p| ffi_type_for(p)),
            ffi_type_for(ret),
        );
        reprep(&cif, convention, ret, None)?;
        Ok(PreparedCif {
            cif,
            ret_size: ret.size(),
        })
    }

    /// Prepare a variadic interface for one concrete argument spread.
    /// `fixed` counts the declared parameters; `extra` holds the promoted
    /// types of the trailing arguments.
    pub(crate) fn prepare_variadic(
        convention: CallConvention,
        ret: &Arc<TypeDesc>,
        fixed: &[Arc<TypeDesc>],
        extra: &[Arc<TypeDesc>],
    ) -> Result<Self, BridgeError> {
        if !convention.supports_variadic() {
            return Err(ConventionError::VariadicConvention(convention.display_name()).into());
        }
        let arg_types: Vec<Type> = fixed
            .iter()
            .chain(extra.iter())
            .map(|p| ffi_type_for(p))
            .collect();
        let cif = Cif::new(arg_types, ffi_type_for(ret));
        reprep(&cif, convention, ret, Some(fixed.len()))?;
        Ok(PreparedCif {
            cif,
            ret_size: ret.size(),
        })
    }

    /// Bytes the native return value occupies.
    pub(crate) fn ret_size(&self) -> usize {
        self.ret_size
    }

    pub(crate) fn as_raw_ptr(&self) -> *mut low::ffi_cif {
        self.cif.as_raw_ptr()
    }

    /// Give away the inner cif for a closure allocation.
    pub(crate) fn into_cif(self) -> Cif {
        self.cif
    }

    /// Invoke `fn_addr` through this interface.
    ///
    /// # Safety
    ///
    /// `fn_addr` must be a function matching this interface, every entry
    /// of `args` must point at a live encoded argument of the matching
    /// type, and `ret` must have room for at least `ffi_arg` or the
    /// return type's size, whichever is larger.
    pub(crate) unsafe fn call(
        &self,
        fn_addr: usize,
        args: &mut [*mut std::ffi::c_void],
        ret: *mut std::ffi::c_void,
    ) {
        unsafe {
            let target: unsafe extern "C" fn() = std::mem::transmute(fn_addr);
            libffi::raw::ffi_call(self.cif.as_raw_ptr(), Some(target), ret, args.as_mut_ptr());
        }
    }
}

/// Re-run preparation with an explicit ABI, and with the fixed/total
/// split for variadic interfaces. The default ABI fixed-arity case is
/// already prepared and left untouched.
fn reprep(
    cif: &Cif,
    convention: CallConvention,
    ret: &Arc<TypeDesc>,
    fixed: Option<usize>,
) -> Result<(), BridgeError> {
    let abi = convention.to_abi()?;
    let raw = cif.as_raw_ptr();
    let outcome = unsafe {
        let nargs = (*raw).nargs as usize;
        let rtype = (*raw).rtype;
        let argtypes = (*raw).arg_types;
        match fixed {
            None if abi == low::ffi_abi_FFI_DEFAULT_ABI => return Ok(()),
            None => low::prep_cif(raw, abi, nargs, rtype, argtypes),
            Some(fixed_count) => {
                low::prep_cif_var(raw, abi, fixed_count, nargs, rtype, argtypes)
            }
        }
    };
    outcome.map_err(|e| match e {
        low::Error::Abi => {
            BridgeError::from(ConventionError::Unsupported(convention.display_name()))
        }
        _ => BridgeError::from(TypeDescriptionError::UnrepresentableType(
            ret.name().to_string(),
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::resolve;

    fn raw_size(ty: &Type) -> usize {
        unsafe { (*ty.as_raw_ptr()).size }
    }

    #[test]
    fn test_scalar_lowering_preserves_width() {
        for (name, size) in [
            ("int8", 1),
            ("uint16", 2),
            ("int32", 4),
            ("uint64", 8),
            ("float32", 4),
            ("float64", 8),
        ] {
            let desc = resolve(name).unwrap();
            let lowered = ffi_type_for(&desc);
            assert_eq!(raw_size(&lowered), size, "width of {name}");
        }
    }

    #[test]
    fn test_pointer_kinds_lower_to_pointer() {
        for name in ["str", "str16", "int32 *", "void *"] {
            let desc = resolve(name).unwrap();
            let lowered = ffi_type_for(&desc);
            assert_eq!(raw_size(&lowered), std::mem::size_of::<usize>(), "{name}");
        }
    }

    // Structure sizes are only filled in during cif preparation, so these
    // tests look at the element lists instead.
    fn element_sizes(ty: &Type) -> Vec<usize> {
        let mut out = Vec::new();
        unsafe {
            let mut cursor = (*ty.as_raw_ptr()).elements;
            while !(*cursor).is_null() {
                out.push((**cursor).size);
                cursor = cursor.add(1);
            }
        }
        out
    }

    #[test]
    fn test_natural_struct_keeps_member_types() {
        let desc = crate::types::struct_type(
            "TyCifPlain",
            &[("a", "int8".into()), ("b", "float64".into())],
        )
        .unwrap();
        let lowered = ffi_type_for(&desc);
        assert_eq!(element_sizes(&lowered), vec![1, 8]);
    }

    #[test]
    fn test_packed_struct_falls_back_to_granules() {
        let desc = crate::types::pack(
            "TyCifPacked",
            &[("a", "int8".into()), ("b", "int32".into())],
        )
        .unwrap();
        let lowered = ffi_type_for(&desc);
        assert_eq!(element_sizes(&lowered), vec![1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_union_lowering_uses_alignment_granules() {
        let desc = crate::types::union_type(
            "TyCifUnion",
            &[("u", "uint32".into()), ("f", "float32".into())],
        )
        .unwrap();
        let lowered = ffi_type_for(&desc);
        assert_eq!(element_sizes(&lowered), vec![4]);
    }

    #[test]
    fn test_fixed_cif_prepares_for_default_convention() {
        let ret = resolve("int32").unwrap();
        let params = [resolve("int32").unwrap(), resolve("int32").unwrap()];
        let prepared = PreparedCif::prepare(CallConvention::Cdecl, &ret, &params).unwrap();
        assert_eq!(prepared.ret_size(), 4);
        assert!(!prepared.as_raw_ptr().is_null());
    }

    #[test]
    fn test_variadic_needs_cdecl() {
        let ret = resolve("int32").unwrap();
        let fixed = [resolve("str").unwrap()];
        let extra = [resolve("float64").unwrap()];
        let err = PreparedCif::prepare_variadic(
            CallConvention::Stdcall,
            &ret,
            &fixed,
            &extra,
        )
        .unwrap_err();
        assert_eq!(
            err,
            BridgeError::Convention(ConventionError::VariadicConvention("stdcall"))
        );
    }
}
