//! Calling convention selection.

use libffi::low::ffi_abi;

use crate::error::ConventionError;

/// Calling convention of a bound function or callback.
///
/// Everything except [`CallConvention::Cdecl`] only exists on 32-bit x86
/// Windows. Asking for another convention elsewhere is a
/// [`ConventionError`], never a silent fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallConvention {
    /// The platform's default C convention.
    #[default]
    Cdecl,
    /// Callee-cleaned stack, used by the Win32 API.
    Stdcall,
    /// First arguments in registers, callee-cleaned stack.
    Fastcall,
    /// `this` in ECX, used by MSVC instance methods.
    Thiscall,
}

impl CallConvention {
    /// Short name used in error messages.
    pub fn display_name(self) -> &'static str {
        match self {
            CallConvention::Cdecl => "cdecl",
            CallConvention::Stdcall => "stdcall",
            CallConvention::Fastcall => "fastcall",
            CallConvention::Thiscall => "thiscall",
        }
    }

    /// Keyword form accepted inside declarations.
    pub fn keyword(self) -> &'static str {
        match self {
            CallConvention::Cdecl => "__cdecl",
            CallConvention::Stdcall => "__stdcall",
            CallConvention::Fastcall => "__fastcall",
            CallConvention::Thiscall => "__thiscall",
        }
    }

    /// Whether this convention can host a variadic signature.
    pub fn supports_variadic(self) -> bool {
        matches!(self, CallConvention::Cdecl)
    }

    /// The libffi ABI value for this convention on the current target.
    #[cfg(all(target_arch = "x86", target_os = "windows"))]
    pub(crate) fn to_abi(self) -> Result<ffi_abi, ConventionError> {
        Ok(match self {
            CallConvention::Cdecl => libffi::low::ffi_abi_FFI_DEFAULT_ABI,
            CallConvention::Stdcall => libffi::raw::ffi_abi_FFI_STDCALL,
            CallConvention::Fastcall => libffi::raw::ffi_abi_FFI_FASTCALL,
            CallConvention::Thiscall => libffi::raw::ffi_abi_FFI_THISCALL,
        })
    }

    /// The libffi ABI value for this convention on the current target.
    #[cfg(not(all(target_arch = "x86", target_os = "windows")))]
    pub(crate) fn to_abi(self) -> Result<ffi_abi, ConventionError> {
        match self {
            CallConvention::Cdecl => Ok(libffi::low::ffi_abi_FFI_DEFAULT_ABI),
            other => Err(ConventionError::Unsupported(other.display_name())),
        }
    }
}

impl std::fmt::Display for CallConvention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}
