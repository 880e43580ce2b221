//! Error taxonomy for the bridge.
//!
//! Failures are grouped by the stage that produced them: describing types,
//! resolving libraries and symbols, selecting a calling convention,
//! marshaling values, or faulting inside a callback trampoline.
//! [`BridgeError`] flattens the five stages into a single type for
//! crate-level signatures; matching on it recovers the stage.

use thiserror::Error;

/// Errors raised while building or querying type descriptions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeDescriptionError {
    #[error("Unknown type '{0}'")]
    UnknownType(String),

    #[error("Invalid declaration '{decl}': {detail}")]
    InvalidDeclaration { decl: String, detail: String },

    #[error("Empty struct '{0}' is not allowed in C")]
    EmptyRecord(String),

    #[error("Duplicate member '{member}' in '{record}'")]
    DuplicateMember { record: String, member: String },

    #[error("Duplicate type name '{0}'")]
    DuplicateTypeName(String),

    #[error("Member '{member}' of '{record}' has incomplete type '{ty}'")]
    IncompleteMember {
        record: String,
        member: String,
        ty: String,
    },

    #[error("Alignment override must be a power of two between 1 and 16, not {0}")]
    InvalidAlignment(usize),

    #[error("Array length must be positive and non-zero")]
    InvalidArrayLength,

    #[error("Array length is too high (max = {max})")]
    ArrayTooBig { max: usize },

    #[error("Type '{name}' is larger than the configured limit ({max} bytes)")]
    TypeTooBig { name: String, max: usize },

    #[error("Cannot take the size of incomplete type '{0}'")]
    IncompleteType(String),

    #[error("Cannot describe type '{0}' to the native call engine")]
    UnrepresentableType(String),

    #[error("Type '{0}' is not a struct or union")]
    NotARecord(String),

    #[error("Unknown member '{member}' in type '{record}'")]
    UnknownMember { record: String, member: String },

    #[error("Pointer indirection must be between 1 and 4")]
    PointerDepth,

    #[error("Only string and pointer types can become disposable, not '{0}'")]
    DisposableKind(String),

    #[error("Cannot use disposable type '{0}' to create a new disposable")]
    DisposableNesting(String),

    #[error("Type '{0}' cannot be used as a parameter (maybe try '{0} *')")]
    InvalidParameterType(String),

    #[error("Type '{0}' cannot be used as a return type")]
    InvalidReturnType(String),

    #[error("Directed parameter of type '{0}' must be a pointer")]
    DirectionOnValue(String),

    #[error("Functions cannot take more than {0} parameters")]
    TooManyParameters(usize),

    #[error("Functions cannot use more than {0} output parameters")]
    TooManyOutParameters(usize),

    #[error("Variadic callbacks are not supported")]
    VariadicCallback,

    #[error("Alignment overrides are only allowed on struct members")]
    MisplacedAlignment,
}

/// Errors raised while loading libraries or locating exported symbols.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolResolutionError {
    #[error("Failed to load shared library '{path}': {detail}")]
    LibraryLoad { path: String, detail: String },

    #[error("Cannot find function '{0}' in shared library")]
    MissingSymbol(String),
}

/// Errors raised when a calling convention cannot be honored.
///
/// A convention the target platform does not implement is a hard error,
/// never a silent fallback to `cdecl`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConventionError {
    #[error("Calling convention '{0}' is not supported on this platform")]
    Unsupported(&'static str),

    #[error("Calling convention '{0}' does not support variadic functions")]
    VariadicConvention(&'static str),
}

/// Errors raised while converting values across the boundary, including the
/// resource limits that guard scratch memory, the async pool and the
/// trampoline arena.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MarshalingError {
    #[error("Expected {expected} arguments, got {got}")]
    Arity { expected: usize, got: usize },

    #[error("Unexpected {got} value, expected {expected}")]
    TypeMismatch { expected: String, got: &'static str },

    #[error("Missing expected member '{member}' of record '{record}'")]
    MissingMember { record: String, member: String },

    #[error("Expected an array of length {expected}, got {got}")]
    ArrayLength { expected: usize, got: usize },

    #[error("Union value must set exactly one member, got {got}")]
    UnionMemberCount { got: usize },

    #[error("Output parameter {index} needs a mutable {expected} placeholder")]
    MissingOutputSlot {
        index: usize,
        expected: &'static str,
    },

    #[error("String contains an embedded null byte")]
    EmbeddedNul,

    #[error("Cannot decode value of type '{0}'")]
    UndecodableType(String),

    #[error("Cannot encode value of type '{0}'")]
    UnencodableType(String),

    #[error("Cannot dereference a null pointer")]
    NullPointer,

    #[error("Cannot use {0} value as a callback")]
    NotCallable(String),

    #[error("The {region} scratch region is exhausted ({needed} bytes needed, {available} available)")]
    ScratchExhausted {
        region: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("Too many asynchronous calls are in flight (max = {0})")]
    AsyncCallLimit(usize),

    #[error("All {0} callback trampolines are in use")]
    TrampolineLimit(usize),

    #[error("Could not find a matching registered callback")]
    UnknownRegistration,

    #[error("Missing value argument for variadic call")]
    VariadicPair,

    #[error("Variadic arguments cannot be output parameters")]
    VariadicDirection,
}

/// Faults recorded while native code held a trampoline.
///
/// These surface on the managed call that was on the stack when the fault
/// happened. A fault on a thread with no managed call in flight is counted
/// but cannot be delivered anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NativeFaultError {
    #[error("Native code invoked a trampoline whose callback was unregistered")]
    StaleTrampoline,

    #[error("A managed callback panicked while native code was waiting on it")]
    CallbackPanic,

    #[error("A managed callback reported an error: {0}")]
    CallbackFailed(String),
}

/// Any failure the bridge can produce, tagged by stage.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Type(#[from] TypeDescriptionError),

    #[error(transparent)]
    Symbol(#[from] SymbolResolutionError),

    #[error(transparent)]
    Convention(#[from] ConventionError),

    #[error(transparent)]
    Marshal(#[from] MarshalingError),

    #[error(transparent)]
    Fault(#[from] NativeFaultError),
}
