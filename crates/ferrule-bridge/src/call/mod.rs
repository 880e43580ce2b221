//! Binding native functions and calling them.
//!
//! A [`FunctionBinding`] couples a resolved symbol address with a
//! prepared call interface and the declared parameter list. Bindings
//! are cheap to clone and safe to share across threads, and each one
//! keeps the library it came from loaded.
//!
//! Synchronous calls run on the caller's thread. Asynchronous calls run
//! on a worker pool and deliver their [`CallOutcome`] through [`pump`]
//! or [`pump_timeout`] on whichever thread chooses to service events.

pub(crate) mod asynch;
pub(crate) mod cif;
mod convention;

pub use asynch::{pump, pump_timeout, wait_idle, AsyncCall, AsyncCompletion, CallOutcome};
pub use convention::CallConvention;

use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use crate::error::{BridgeError, ConventionError, MarshalingError, TypeDescriptionError};
use crate::library::LibraryInner;
use crate::marshal::{acquire, decode, encode, FrameMode};
use crate::types::{
    self, Direction, ParamDesc, TypeDesc, TypeKind, TypeSpec, MAX_OUT_PARAMETERS, MAX_PARAMETERS,
};
use crate::value::Value;

use asynch::AsyncState;
use cif::PreparedCif;

pub(crate) struct BindingInner {
    name: String,
    convention: CallConvention,
    ret: Arc<TypeDesc>,
    params: Vec<ParamDesc>,
    variadic: bool,
    addr: usize,
    /// Prepared once at bind time. `None` for variadic bindings, which
    /// prepare a fresh interface per call once the extra types are known.
    cif: Option<PreparedCif>,
    /// Keeps the originating library mapped for as long as any clone of
    /// the binding is alive. `None` for raw pointer bindings.
    _library: Option<Arc<LibraryInner>>,
}

/// A callable native function.
#[derive(Clone)]
pub struct FunctionBinding {
    inner: Arc<BindingInner>,
}

pub(crate) fn bind(
    name: String,
    convention: CallConvention,
    ret: Arc<TypeDesc>,
    params: Vec<ParamDesc>,
    variadic: bool,
    addr: usize,
    library: Option<Arc<LibraryInner>>,
) -> Result<FunctionBinding, BridgeError> {
    ret.check_return()?;
    if params.len() > MAX_PARAMETERS {
        return Err(TypeDescriptionError::TooManyParameters(MAX_PARAMETERS).into());
    }
    let out_count = params.iter().filter(|p| p.direction.is_output()).count();
    if out_count > MAX_OUT_PARAMETERS {
        return Err(TypeDescriptionError::TooManyOutParameters(MAX_OUT_PARAMETERS).into());
    }
    for param in &params {
        if param.direction.is_output() {
            if !matches!(param.ty.kind(), TypeKind::Pointer { .. }) {
                return Err(
                    TypeDescriptionError::DirectionOnValue(param.ty.name().to_string()).into(),
                );
            }
        } else {
            param.ty.check_parameter()?;
        }
    }
    if variadic && !convention.supports_variadic() {
        return Err(ConventionError::VariadicConvention(convention.display_name()).into());
    }

    let prepared = if variadic {
        None
    } else {
        let fixed: Vec<Arc<TypeDesc>> = params.iter().map(|p| p.ty.clone()).collect();
        Some(PreparedCif::prepare(convention, &ret, &fixed)?)
    };

    Ok(FunctionBinding {
        inner: Arc::new(BindingInner {
            name,
            convention,
            ret,
            params,
            variadic,
            addr,
            cif: prepared,
            _library: library,
        }),
    })
}

impl FunctionBinding {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Raw address of the native entry point.
    pub fn address(&self) -> usize {
        self.inner.addr
    }

    pub fn convention(&self) -> CallConvention {
        self.inner.convention
    }

    pub fn return_type(&self) -> &Arc<TypeDesc> {
        &self.inner.ret
    }

    pub fn params(&self) -> &[ParamDesc] {
        &self.inner.params
    }

    pub fn is_variadic(&self) -> bool {
        self.inner.variadic
    }

    /// C-style rendering of the bound signature.
    pub fn signature(&self) -> String {
        let inner = &self.inner;
        let mut params: Vec<String> = inner
            .params
            .iter()
            .map(|p| {
                if p.name.is_empty() {
                    p.ty.name().to_string()
                } else {
                    format!("{} {}", p.ty.name(), p.name)
                }
            })
            .collect();
        if inner.variadic {
            params.push("...".to_string());
        }
        format!("{} {}({})", inner.ret.name(), inner.name, params.join(", "))
    }

    /// Call the function on the current thread.
    ///
    /// `args` must match the declared parameters one to one. Output
    /// parameters are rewritten in place: a primitive `_Out_ int *`
    /// slot comes back as a one-element array holding the new value, a
    /// record slot comes back as the decoded record.
    pub fn call(&self, args: &mut [Value]) -> Result<Value, BridgeError> {
        let outcome = self.inner.invoke(args.to_vec(), FrameMode::Sync, &[])?;
        for (slot, updated) in args.iter_mut().zip(outcome.args) {
            *slot = updated;
        }
        Ok(outcome.value)
    }

    /// Call a variadic function, passing `extra` as the trailing
    /// arguments. Each extra pairs an input type with its value; the C
    /// default promotions are applied to the type automatically.
    pub fn call_variadic(
        &self,
        args: &mut [Value],
        extra: &[(TypeSpec, Value)],
    ) -> Result<Value, BridgeError> {
        let extras = resolve_extras(extra)?;
        let outcome = self.inner.invoke(args.to_vec(), FrameMode::Sync, &extras)?;
        for (slot, updated) in args.iter_mut().zip(outcome.args) {
            *slot = updated;
        }
        Ok(outcome.value)
    }

    /// Run the call on a worker thread. The returned handle can cancel
    /// delivery; the completion itself only ever runs inside [`pump`]
    /// or [`pump_timeout`].
    ///
    /// Fails immediately when the in-flight ceiling is reached.
    pub fn call_async<F>(&self, args: Vec<Value>, completion: F) -> Result<AsyncCall, BridgeError>
    where
        F: FnOnce(Result<CallOutcome, BridgeError>) + Send + 'static,
    {
        self.dispatch_async(args, Vec::new(), Box::new(completion))
    }

    /// Asynchronous variant of [`FunctionBinding::call_variadic`].
    pub fn call_async_variadic<F>(
        &self,
        args: Vec<Value>,
        extra: Vec<(TypeSpec, Value)>,
        completion: F,
    ) -> Result<AsyncCall, BridgeError>
    where
        F: FnOnce(Result<CallOutcome, BridgeError>) + Send + 'static,
    {
        self.dispatch_async(args, extra, Box::new(completion))
    }

    fn dispatch_async(
        &self,
        args: Vec<Value>,
        extra: Vec<(TypeSpec, Value)>,
        completion: AsyncCompletion,
    ) -> Result<AsyncCall, BridgeError> {
        asynch::try_reserve_slot()?;
        let state = AsyncState::new();
        let inner = self.inner.clone();
        // Extras resolve on the worker so their errors reach the
        // completion like any other call failure.
        let work = move || {
            let extras = resolve_extras(&extra)?;
            inner.invoke(args, FrameMode::Async, &extras)
        };
        asynch::dispatch_call(state.clone(), work, completion);
        Ok(AsyncCall::new(state))
    }
}

impl fmt::Debug for FunctionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionBinding")
            .field("signature", &self.signature())
            .field("address", &format_args!("{:#x}", self.inner.addr))
            .finish()
    }
}

impl BindingInner {
    pub(crate) fn invoke(
        &self,
        args: Vec<Value>,
        mode: FrameMode,
        extra: &[(Arc<TypeDesc>, Value)],
    ) -> Result<CallOutcome, BridgeError> {
        if !self.variadic && !extra.is_empty() {
            return Err(MarshalingError::Arity {
                expected: self.params.len(),
                got: args.len() + extra.len(),
            }
            .into());
        }
        if args.len() != self.params.len() {
            return Err(MarshalingError::Arity {
                expected: self.params.len(),
                got: args.len(),
            }
            .into());
        }

        let variadic_cif;
        let prepared = match &self.cif {
            Some(cif) => cif,
            None => {
                let fixed: Vec<Arc<TypeDesc>> = self.params.iter().map(|p| p.ty.clone()).collect();
                let extra_tys: Vec<Arc<TypeDesc>> =
                    extra.iter().map(|(ty, _)| ty.clone()).collect();
                variadic_cif =
                    PreparedCif::prepare_variadic(self.convention, &self.ret, &fixed, &extra_tys)?;
                &variadic_cif
            }
        };

        let mut lease = acquire(mode);
        let frame = lease.frame();
        let mut ptrs: Vec<*mut c_void> = Vec::with_capacity(self.params.len() + extra.len());
        let mut writebacks: Vec<(usize, *mut u8, Arc<TypeDesc>)> = Vec::new();

        for (i, param) in self.params.iter().enumerate() {
            if param.direction == Direction::In {
                let cell = frame
                    .stack
                    .alloc(param.ty.size().max(1), param.ty.align().max(1))?;
                unsafe { encode::encode_into(frame, cell, &param.ty, &args[i])? };
                ptrs.push(cell as *mut c_void);
                continue;
            }

            // Output parameters travel as a pointer to a scratch buffer
            // that is decoded back into the argument slot after the call.
            let target = match param.ty.pointee() {
                Some(target) => target.clone(),
                None => {
                    return Err(
                        TypeDescriptionError::DirectionOnValue(param.ty.name().to_string()).into(),
                    )
                }
            };
            let direct = matches!(
                target.kind(),
                TypeKind::Record { .. } | TypeKind::Array { .. }
            );
            match (&args[i], direct) {
                (Value::Record(_), true) | (Value::Array(_), _) => {}
                (_, true) => {
                    return Err(MarshalingError::MissingOutputSlot {
                        index: i,
                        expected: "record",
                    }
                    .into())
                }
                (_, false) => {
                    return Err(MarshalingError::MissingOutputSlot {
                        index: i,
                        expected: "array",
                    }
                    .into())
                }
            }

            let buffer = frame
                .heap
                .alloc(target.size().max(1), target.align().max(1))?;
            if param.direction == Direction::InOut {
                if direct {
                    unsafe { encode::encode_into(frame, buffer, &target, &args[i])? };
                } else if let Value::Array(items) = &args[i] {
                    if let Some(first) = items.as_slice().first() {
                        unsafe { encode::encode_into(frame, buffer, &target, first)? };
                    }
                }
            }

            let cell = frame
                .stack
                .alloc(std::mem::size_of::<usize>(), std::mem::align_of::<usize>())?;
            unsafe { (cell as *mut usize).write(buffer as usize) };
            ptrs.push(cell as *mut c_void);
            writebacks.push((i, buffer, target));
        }

        for (ty, value) in extra {
            let cell = frame.stack.alloc(ty.size().max(1), ty.align().max(1))?;
            unsafe { encode::encode_into(frame, cell, ty, value)? };
            ptrs.push(cell as *mut c_void);
        }

        // The return buffer must hold at least a full ffi_arg even for
        // narrow types, since libffi widens small integer returns.
        let ret_words = (prepared.ret_size().max(8) + 7) / 8;
        let mut ret_buf = vec![0u64; ret_words];

        let _ = crate::callback::take_fault();
        unsafe {
            prepared.call(self.addr, &mut ptrs, ret_buf.as_mut_ptr() as *mut c_void);
        }
        if let Some(fault) = crate::callback::take_fault() {
            return Err(fault.into());
        }

        let value = unsafe { decode::decode_return(ret_buf.as_ptr() as *const u8, &self.ret)? };

        let mut args = args;
        for (index, buffer, target) in writebacks {
            let decoded = unsafe { decode::decode_from(buffer, &target)? };
            let direct = matches!(
                target.kind(),
                TypeKind::Record { .. } | TypeKind::Array { .. }
            );
            args[index] = if direct {
                decoded
            } else {
                Value::array(vec![decoded])
            };
        }

        Ok(CallOutcome { value, args })
    }
}

/// Resolve the (type, value) pairs of a variadic tail. Directions are
/// rejected and the C default promotions are applied.
fn resolve_extras(
    extra: &[(TypeSpec, Value)],
) -> Result<Vec<(Arc<TypeDesc>, Value)>, BridgeError> {
    let mut resolved = Vec::with_capacity(extra.len());
    for (spec, value) in extra {
        let full = types::resolve_full(spec.clone())?;
        if full.align_override.is_some() {
            return Err(TypeDescriptionError::MisplacedAlignment.into());
        }
        if full.direction != Direction::In {
            return Err(MarshalingError::VariadicDirection.into());
        }
        let desc = promote_variadic(&full.desc);
        desc.check_parameter()?;
        resolved.push((desc, value.clone()));
    }
    Ok(resolved)
}

/// C default argument promotions: `float` widens to `double`, integers
/// below `int` rank widen to `int32` or `uint32`.
pub(crate) fn promote_variadic(desc: &Arc<TypeDesc>) -> Arc<TypeDesc> {
    let promoted = match desc.kind() {
        TypeKind::Float32 => "float64",
        TypeKind::Bool
        | TypeKind::Char
        | TypeKind::Int8
        | TypeKind::Int16
        | TypeKind::Int16Swapped => "int32",
        TypeKind::UInt8 | TypeKind::UInt16 | TypeKind::UInt16Swapped | TypeKind::Char16 => "uint32",
        _ => return desc.clone(),
    };
    types::lookup(promoted).unwrap_or_else(|| desc.clone())
}
