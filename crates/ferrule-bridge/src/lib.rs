//! Ferrule Bridge - Runtime foreign function interface
//!
//! This library calls native shared-library functions from managed
//! runtime values, without generated bindings:
//! - Runtime C type descriptions (primitives, pointers, arrays,
//!   structs, unions, opaque handles, callback prototypes)
//! - Library loading and symbol binding with C-style declarations
//! - Two-way marshaling, including `out`/`inout` parameters, variadic
//!   calls and disposable return values
//! - Callback trampolines so native code can call managed functions
//! - Asynchronous calls on a worker pool with pumped completions
//!
//! ```no_run
//! use ferrule_bridge as ffi;
//! use ffi::Value;
//!
//! # fn main() -> Result<(), ffi::BridgeError> {
//! let libc = ffi::load_self()?;
//! let atoi = libc.func("int atoi(const char *str)")?;
//! let parsed = atoi.call(&mut [Value::string("42")])?;
//! assert_eq!(parsed, Value::Number(42.0));
//! # Ok(())
//! # }
//! ```

/// Ferrule bridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Public API modules
pub mod call;
pub mod callback;
pub mod config;
pub mod error;
pub mod library;
pub mod memory;
pub mod types;
pub mod value;

pub(crate) mod marshal;

// Re-export commonly used types
pub use call::{
    pump, pump_timeout, wait_idle, AsyncCall, AsyncCompletion, CallConvention, CallOutcome,
    FunctionBinding,
};
pub use callback::{register, register_bound, unregister, CallbackRegistration, MAX_TRAMPOLINES};
pub use config::{configure, BridgeConfig, ConfigError};
pub use error::{
    BridgeError, ConventionError, MarshalingError, NativeFaultError, SymbolResolutionError,
    TypeDescriptionError,
};
pub use library::{
    bind_pointer, bind_pointer_with, load, load_self, NativeLibrary, LIBRARY_EXTENSION,
};
pub use memory::{decode, decode_at, decode_slice, encode, encode_at, free};
pub use types::{
    alias, aligned, alignof, array, as_type, callback_with, disposable, disposable_with, in_,
    inout, introspect, offsetof, opaque, out, pack, pointer, resolve, sizeof, struct_type,
    union_type, ArrayHint, Direction, DisposeFn, Member, MemberInfo, ParamDesc, Prototype,
    TypeDesc, TypeInfo, TypeKind, TypeSpec, MAX_OUT_PARAMETERS, MAX_PARAMETERS,
};
pub use value::{CallbackFn, PointerValue, Value, ValueArray, ValueMap, MAX_SAFE_INTEGER};

/// Single-import convenience for the common surface.
pub mod prelude {
    pub use crate::memory;
    pub use crate::types::{self, inout, out, struct_type, union_type};
    pub use crate::{
        load, load_self, pump, pump_timeout, wait_idle, BridgeError, CallConvention,
        FunctionBinding, NativeLibrary, Value,
    };
}
