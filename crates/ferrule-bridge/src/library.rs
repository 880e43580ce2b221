//! Loading shared libraries and binding their functions.
//!
//! [`load`] opens a shared library by path and [`load_self`] binds the
//! running process image, which on most platforms also reaches the
//! symbols of every library the process has already linked. Both return
//! a [`NativeLibrary`] that hands out [`FunctionBinding`]s. The OS
//! handle stays mapped for as long as the library or any binding built
//! from it is alive.
//!
//! The first successful load commits the active [`crate::config`]
//! settings; scratch sizes cannot change once native code is reachable.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;

use crate::call::{self, CallConvention, FunctionBinding};
use crate::config;
use crate::error::{BridgeError, SymbolResolutionError, TypeDescriptionError};
use crate::types::parser::parse_signature;
use crate::types::{self, Direction, ParamDesc, TypeSpec};

/// Shared library file extension of the current platform, with the dot.
#[cfg(target_os = "windows")]
pub const LIBRARY_EXTENSION: &str = ".dll";
/// Shared library file extension of the current platform, with the dot.
#[cfg(target_os = "macos")]
pub const LIBRARY_EXTENSION: &str = ".dylib";
/// Shared library file extension of the current platform, with the dot.
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const LIBRARY_EXTENSION: &str = ".so";

pub(crate) struct LibraryInner {
    library: Library,
    path: Option<PathBuf>,
}

impl LibraryInner {
    /// Resolve `name` to a raw function address.
    fn symbol(&self, name: &str) -> Result<usize, BridgeError> {
        let address = unsafe {
            self.library
                .get::<unsafe extern "C" fn()>(name.as_bytes())
                .map_err(|_| SymbolResolutionError::MissingSymbol(name.to_string()))?
        };
        Ok(*address as usize)
    }
}

/// A loaded shared library, cheap to clone.
#[derive(Clone)]
pub struct NativeLibrary {
    inner: Arc<LibraryInner>,
}

/// Open the shared library at `path`.
pub fn load(path: impl AsRef<Path>) -> Result<NativeLibrary, BridgeError> {
    let path = path.as_ref();
    config::commit();
    let library =
        unsafe { Library::new(path) }.map_err(|e| SymbolResolutionError::LibraryLoad {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
    Ok(NativeLibrary {
        inner: Arc::new(LibraryInner {
            library,
            path: Some(path.to_path_buf()),
        }),
    })
}

/// Bind the running process image instead of a file on disk.
pub fn load_self() -> Result<NativeLibrary, BridgeError> {
    config::commit();
    Ok(NativeLibrary {
        inner: Arc::new(LibraryInner {
            library: self_library()?,
            path: None,
        }),
    })
}

#[cfg(unix)]
fn self_library() -> Result<Library, BridgeError> {
    Ok(libloading::os::unix::Library::this().into())
}

#[cfg(windows)]
fn self_library() -> Result<Library, BridgeError> {
    let library = libloading::os::windows::Library::this().map_err(|e| {
        SymbolResolutionError::LibraryLoad {
            path: "<process>".to_string(),
            detail: e.to_string(),
        }
    })?;
    Ok(library.into())
}

impl NativeLibrary {
    /// Path the library was loaded from. `None` for [`load_self`].
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Bind a function from a C-style declaration such as
    /// `"int atoi(const char *str)"`. A convention keyword inside the
    /// declaration (`__stdcall` and friends) takes effect here.
    pub fn func(&self, decl: &str) -> Result<FunctionBinding, BridgeError> {
        self.func_in(decl, None)
    }

    /// Bind with [`CallConvention::Cdecl`] unless the declaration says
    /// otherwise.
    pub fn cdecl(&self, decl: &str) -> Result<FunctionBinding, BridgeError> {
        self.func_in(decl, Some(CallConvention::Cdecl))
    }

    /// Bind with [`CallConvention::Stdcall`] unless the declaration says
    /// otherwise.
    pub fn stdcall(&self, decl: &str) -> Result<FunctionBinding, BridgeError> {
        self.func_in(decl, Some(CallConvention::Stdcall))
    }

    /// Bind with [`CallConvention::Fastcall`] unless the declaration says
    /// otherwise.
    pub fn fastcall(&self, decl: &str) -> Result<FunctionBinding, BridgeError> {
        self.func_in(decl, Some(CallConvention::Fastcall))
    }

    /// Bind with [`CallConvention::Thiscall`] unless the declaration says
    /// otherwise.
    pub fn thiscall(&self, decl: &str) -> Result<FunctionBinding, BridgeError> {
        self.func_in(decl, Some(CallConvention::Thiscall))
    }

    fn func_in(
        &self,
        decl: &str,
        default: Option<CallConvention>,
    ) -> Result<FunctionBinding, BridgeError> {
        let parsed = parse_signature(decl)?;
        let convention = parsed.convention.or(default).unwrap_or_default();
        let addr = self.inner.symbol(&parsed.name)?;
        call::bind(
            parsed.name,
            convention,
            parsed.ret,
            parsed.params,
            parsed.variadic,
            addr,
            Some(self.inner.clone()),
        )
    }

    /// Bind a function from its name and separate type specs. A trailing
    /// `"..."` parameter marks the function variadic.
    pub fn func_with(
        &self,
        name: &str,
        ret: impl Into<TypeSpec>,
        params: &[TypeSpec],
    ) -> Result<FunctionBinding, BridgeError> {
        let (ret, param_descs, variadic) = resolve_explicit(ret.into(), params)?;
        let addr = self.inner.symbol(name)?;
        call::bind(
            name.to_string(),
            CallConvention::Cdecl,
            ret,
            param_descs,
            variadic,
            addr,
            Some(self.inner.clone()),
        )
    }

    /// Drop this handle. The library is unmapped once the last clone and
    /// the last binding built from it are gone.
    pub fn close(self) {}
}

impl fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.path {
            Some(path) => write!(f, "NativeLibrary({})", path.display()),
            None => f.write_str("NativeLibrary(<process>)"),
        }
    }
}

/// Bind a raw function pointer, such as one decoded from a native
/// vtable or returned by another call.
///
/// # Safety
///
/// `addr` must be the address of a live native function whose real
/// signature matches `decl`, and it must remain callable for the
/// binding's lifetime.
pub unsafe fn bind_pointer(addr: usize, decl: &str) -> Result<FunctionBinding, BridgeError> {
    let parsed = parse_signature(decl)?;
    let convention = parsed.convention.unwrap_or_default();
    call::bind(
        parsed.name,
        convention,
        parsed.ret,
        parsed.params,
        parsed.variadic,
        addr,
        None,
    )
}

/// Explicit-types variant of [`bind_pointer`].
///
/// # Safety
///
/// Same contract as [`bind_pointer`].
pub unsafe fn bind_pointer_with(
    addr: usize,
    name: &str,
    ret: impl Into<TypeSpec>,
    params: &[TypeSpec],
) -> Result<FunctionBinding, BridgeError> {
    let (ret, param_descs, variadic) = resolve_explicit(ret.into(), params)?;
    call::bind(
        name.to_string(),
        CallConvention::Cdecl,
        ret,
        param_descs,
        variadic,
        addr,
        None,
    )
}

fn resolve_explicit(
    ret: TypeSpec,
    params: &[TypeSpec],
) -> Result<(Arc<crate::types::TypeDesc>, Vec<ParamDesc>, bool), BridgeError> {
    if matches!(&ret, TypeSpec::Directed(..)) {
        let (desc, _) = types::resolve_param(ret)?;
        return Err(TypeDescriptionError::InvalidReturnType(desc.name().to_string()).into());
    }
    let ret = types::resolve(ret)?;

    let mut specs = params.to_vec();
    let variadic = matches!(specs.last(), Some(TypeSpec::Name(n)) if n.trim() == "...");
    if variadic {
        specs.pop();
    }

    let mut descs = Vec::with_capacity(specs.len());
    for spec in specs {
        let (ty, direction) = types::resolve_param(spec)?;
        if direction == Direction::In {
            ty.check_parameter()?;
        }
        descs.push(ParamDesc {
            name: String::new(),
            ty,
            direction,
        });
    }
    Ok((ret, descs, variadic))
}
