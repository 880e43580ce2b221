//! Type descriptions and the process-wide type registry.
//!
//! Every marshaling decision starts from a [`TypeDesc`]: an immutable,
//! reference-counted description of a C type with a resolved size and
//! alignment. Descriptions are built once, registered by name, and shared
//! through `Arc` from then on. The registry is pre-seeded with the C
//! primitives and their common spellings, so `"int"`, `"uint32_t"` and
//! `"double"` resolve without any setup.
//!
//! User-facing builders ([`struct_type`], [`union_type`], [`pointer`],
//! [`array`], [`callback`] and friends) validate eagerly: an invalid
//! description is reported when it is built, never silently defaulted at
//! call time.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use crate::call::CallConvention;
use crate::config;
use crate::error::{BridgeError, MarshalingError, TypeDescriptionError};
use crate::value::Value;

pub(crate) mod layout;
pub(crate) mod parser;
mod introspect;

pub use introspect::{introspect, MemberInfo, TypeInfo};

/// Most parameters a bound function or callback may declare.
pub const MAX_PARAMETERS: usize = 32;
/// Most output parameters a bound function may declare.
pub const MAX_OUT_PARAMETERS: usize = 16;

const MAX_POINTER_DEPTH: usize = 4;

/// Data flow of a pointer parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Read by the callee. The default for every parameter.
    In,
    /// Written by the callee; the caller passes a placeholder to fill.
    Out,
    /// Read and then rewritten by the callee.
    InOut,
}

impl Direction {
    pub fn is_input(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    pub fn is_output(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

/// How an array decodes back into managed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayHint {
    /// Element-by-element array of values.
    Array,
    /// Same as [`ArrayHint::Array`]; kept as a distinct tag for callers
    /// that treat numeric buffers specially.
    Typed,
    /// Decode the elements as text. The default for `char` and `char16`
    /// element types.
    String,
}

/// Release policy of a disposable type.
#[derive(Clone)]
pub enum DisposeFn {
    /// Release through the C library allocator's `free`.
    CFree,
    /// Release through a custom function receiving the raw address.
    Custom(Arc<dyn Fn(usize) + Send + Sync>),
}

impl DisposeFn {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        DisposeFn::Custom(Arc::new(f))
    }

    /// Release `addr`. Null addresses are ignored.
    pub(crate) fn dispose(&self, addr: usize) {
        if addr == 0 {
            return;
        }
        match self {
            DisposeFn::CFree => unsafe {
                c_free(addr as *mut std::ffi::c_void);
            },
            DisposeFn::Custom(f) => f(addr),
        }
    }
}

extern "C" {
    #[link_name = "free"]
    pub(crate) fn c_free(ptr: *mut std::ffi::c_void);
}

impl PartialEq for DisposeFn {
    /// Custom release functions compare by pointer identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DisposeFn::CFree, DisposeFn::CFree) => true,
            (DisposeFn::Custom(a), DisposeFn::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for DisposeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisposeFn::CFree => f.write_str("CFree"),
            DisposeFn::Custom(_) => f.write_str("Custom(<managed>)"),
        }
    }
}

/// Shape of a C type.
#[derive(Debug, PartialEq)]
pub enum TypeKind {
    Void,
    Bool,
    /// `char`: numerically an `int8`, but arrays of it decode as text.
    Char,
    /// `char16_t`: numerically a `uint16`, but arrays of it decode as text.
    Char16,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    /// Byte-swapped integers for foreign-endian data.
    Int16Swapped,
    UInt16Swapped,
    Int32Swapped,
    UInt32Swapped,
    Int64Swapped,
    UInt64Swapped,
    Float32,
    Float64,
    /// NUL-terminated UTF-8 string, marshaled as `const char *`.
    CString,
    /// NUL-terminated UTF-16 string, marshaled as `const char16_t *`.
    CString16,
    Pointer {
        target: Arc<TypeDesc>,
    },
    Array {
        element: Arc<TypeDesc>,
        len: usize,
        hint: ArrayHint,
    },
    Record {
        members: Vec<Member>,
        /// All members share offset zero.
        union: bool,
        packed: bool,
    },
    /// Named type with no known layout; only pointers to it are usable.
    Opaque,
    /// Function signature, marshaled as a code pointer.
    Prototype(Arc<Prototype>),
    /// A string or pointer type whose decoded memory is released after use.
    Disposable {
        target: Arc<TypeDesc>,
        dispose: DisposeFn,
    },
}

/// An immutable C type description with resolved size and alignment.
#[derive(Debug, PartialEq)]
pub struct TypeDesc {
    name: String,
    kind: TypeKind,
    size: usize,
    align: usize,
}

/// A laid-out struct or union member.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub name: String,
    pub ty: Arc<TypeDesc>,
    pub offset: usize,
}

/// A function parameter with its marshaling direction.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDesc {
    pub name: String,
    pub ty: Arc<TypeDesc>,
    pub direction: Direction,
}

/// A callback or function signature.
#[derive(Debug, PartialEq)]
pub struct Prototype {
    pub(crate) name: String,
    pub(crate) ret: Arc<TypeDesc>,
    pub(crate) params: Vec<ParamDesc>,
    pub(crate) convention: CallConvention,
}

impl Prototype {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn return_type(&self) -> &Arc<TypeDesc> {
        &self.ret
    }

    pub fn params(&self) -> &[ParamDesc] {
        &self.params
    }

    pub fn convention(&self) -> CallConvention {
        self.convention
    }

    /// C-style rendering of the signature, mostly for diagnostics.
    pub fn signature(&self) -> String {
        let params = self
            .params
            .iter()
            .map(|p| {
                if p.name.is_empty() {
                    p.ty.name().to_string()
                } else {
                    format!("{} {}", p.ty.name(), p.name)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} {}({})", self.ret.name(), self.name, params)
    }
}

impl TypeDesc {
    pub(crate) fn new(name: String, kind: TypeKind, size: usize, align: usize) -> Self {
        TypeDesc {
            name,
            kind,
            size,
            align,
        }
    }

    /// Registered or synthesized name, such as `"int32"` or `"Vec2 *"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    /// Size in bytes. Zero for `void` and opaque types.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// Target of a pointer type.
    pub fn pointee(&self) -> Option<&Arc<TypeDesc>> {
        match &self.kind {
            TypeKind::Pointer { target } => Some(target),
            _ => None,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self.kind, TypeKind::Void)
    }

    /// Whether values of this type occupy a pointer-sized cell.
    pub(crate) fn is_pointer_like(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::CString
                | TypeKind::CString16
                | TypeKind::Pointer { .. }
                | TypeKind::Prototype(_)
                | TypeKind::Disposable { .. }
        )
    }

    /// Reject types that cannot travel by value as a parameter.
    pub(crate) fn check_parameter(&self) -> Result<(), TypeDescriptionError> {
        match &self.kind {
            TypeKind::Void | TypeKind::Opaque | TypeKind::Array { .. } => Err(
                TypeDescriptionError::InvalidParameterType(self.name.clone()),
            ),
            TypeKind::Record { union: true, .. } => Err(
                TypeDescriptionError::InvalidParameterType(self.name.clone()),
            ),
            _ => Ok(()),
        }
    }

    /// Reject types that cannot travel by value as a return value.
    pub(crate) fn check_return(&self) -> Result<(), TypeDescriptionError> {
        match &self.kind {
            TypeKind::Void => Ok(()),
            TypeKind::Opaque | TypeKind::Array { .. } => {
                Err(TypeDescriptionError::InvalidReturnType(self.name.clone()))
            }
            TypeKind::Record { union: true, .. } => {
                Err(TypeDescriptionError::InvalidReturnType(self.name.clone()))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Synthesize a single-level pointer description.
pub(crate) fn pointer_to(target: Arc<TypeDesc>) -> Arc<TypeDesc> {
    let name = if target.name().ends_with('*') {
        format!("{}*", target.name())
    } else {
        format!("{} *", target.name())
    };
    Arc::new(TypeDesc::new(
        name,
        TypeKind::Pointer { target },
        std::mem::size_of::<usize>(),
        std::mem::align_of::<usize>(),
    ))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<TypeDesc>>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, Arc<TypeDesc>>> {
    REGISTRY.get_or_init(|| RwLock::new(initial_registry()))
}

fn prim(
    map: &mut HashMap<String, Arc<TypeDesc>>,
    names: &[&str],
    kind: TypeKind,
    size: usize,
    align: usize,
) -> Arc<TypeDesc> {
    let desc = Arc::new(TypeDesc::new(names[0].to_string(), kind, size, align));
    for name in names {
        map.insert((*name).to_string(), desc.clone());
    }
    desc
}

fn initial_registry() -> HashMap<String, Arc<TypeDesc>> {
    use std::mem::{align_of, size_of};

    let mut map = HashMap::new();
    let ptr_size = size_of::<usize>();
    let ptr_align = align_of::<usize>();

    prim(&mut map, &["void"], TypeKind::Void, 0, 1);
    prim(&mut map, &["bool"], TypeKind::Bool, 1, 1);
    prim(&mut map, &["char"], TypeKind::Char, 1, 1);
    prim(&mut map, &["char16", "char16_t"], TypeKind::Char16, 2, align_of::<u16>());

    prim(&mut map, &["int8", "int8_t"], TypeKind::Int8, 1, 1);
    prim(&mut map, &["uint8", "uint8_t", "uchar"], TypeKind::UInt8, 1, 1);
    let int16 = prim(
        &mut map,
        &["int16", "int16_t", "short"],
        TypeKind::Int16,
        size_of::<i16>(),
        align_of::<i16>(),
    );
    let uint16 = prim(
        &mut map,
        &["uint16", "uint16_t", "ushort"],
        TypeKind::UInt16,
        size_of::<u16>(),
        align_of::<u16>(),
    );
    let int32 = prim(
        &mut map,
        &["int32", "int32_t", "int"],
        TypeKind::Int32,
        size_of::<i32>(),
        align_of::<i32>(),
    );
    let uint32 = prim(
        &mut map,
        &["uint32", "uint32_t", "uint"],
        TypeKind::UInt32,
        size_of::<u32>(),
        align_of::<u32>(),
    );
    let int64 = prim(
        &mut map,
        &["int64", "int64_t", "longlong"],
        TypeKind::Int64,
        size_of::<i64>(),
        align_of::<i64>(),
    );
    let uint64 = prim(
        &mut map,
        &["uint64", "uint64_t", "ulonglong"],
        TypeKind::UInt64,
        size_of::<u64>(),
        align_of::<u64>(),
    );

    prim(&mut map, &["float32", "float"], TypeKind::Float32, size_of::<f32>(), align_of::<f32>());
    prim(&mut map, &["float64", "double"], TypeKind::Float64, size_of::<f64>(), align_of::<f64>());

    let str_desc = prim(&mut map, &["str", "string"], TypeKind::CString, ptr_size, ptr_align);
    let str16_desc = prim(&mut map, &["str16", "string16"], TypeKind::CString16, ptr_size, ptr_align);

    // Platform-width integers alias a fixed-width description.
    let (long_desc, ulong_desc) = if size_of::<std::ffi::c_long>() == 4 {
        (int32.clone(), uint32.clone())
    } else {
        (int64.clone(), uint64.clone())
    };
    map.insert("long".to_string(), long_desc);
    map.insert("ulong".to_string(), ulong_desc);

    let (iptr, uptr) = if ptr_size == 4 {
        (int32.clone(), uint32.clone())
    } else {
        (int64.clone(), uint64.clone())
    };
    for name in ["intptr", "intptr_t", "ssize_t"] {
        map.insert(name.to_string(), iptr.clone());
    }
    for name in ["uintptr", "uintptr_t", "size_t"] {
        map.insert(name.to_string(), uptr.clone());
    }

    // Endian-pinned integers: the host-order spelling aliases the plain
    // description, the foreign-order spelling gets a byte-swapped kind.
    let host_le = cfg!(target_endian = "little");
    let swapped: [(&str, &str, TypeKind, usize, usize, Arc<TypeDesc>); 6] = [
        ("int16_le", "int16_be", TypeKind::Int16Swapped, 2, align_of::<i16>(), int16),
        ("uint16_le", "uint16_be", TypeKind::UInt16Swapped, 2, align_of::<u16>(), uint16),
        ("int32_le", "int32_be", TypeKind::Int32Swapped, 4, align_of::<i32>(), int32),
        ("uint32_le", "uint32_be", TypeKind::UInt32Swapped, 4, align_of::<u32>(), uint32),
        ("int64_le", "int64_be", TypeKind::Int64Swapped, 8, align_of::<i64>(), int64),
        ("uint64_le", "uint64_be", TypeKind::UInt64Swapped, 8, align_of::<u64>(), uint64),
    ];
    for (le_name, be_name, swapped_kind, size, align, plain) in swapped {
        let (native_name, foreign_name) = if host_le {
            (le_name, be_name)
        } else {
            (be_name, le_name)
        };
        map.insert(native_name.to_string(), plain);
        let foreign = Arc::new(TypeDesc::new(foreign_name.to_string(), swapped_kind, size, align));
        map.insert(foreign_name.to_string(), foreign);
    }

    // Pre-made disposables for strings returned from `strdup`-style APIs.
    let str_free = Arc::new(TypeDesc::new(
        "str_free".to_string(),
        TypeKind::Disposable {
            target: str_desc,
            dispose: DisposeFn::CFree,
        },
        ptr_size,
        ptr_align,
    ));
    map.insert("str_free".to_string(), str_free);
    let str16_free = Arc::new(TypeDesc::new(
        "str16_free".to_string(),
        TypeKind::Disposable {
            target: str16_desc,
            dispose: DisposeFn::CFree,
        },
        ptr_size,
        ptr_align,
    ));
    map.insert("str16_free".to_string(), str16_free);

    map
}

/// Look up a registered type by exact name.
pub fn lookup(name: &str) -> Option<Arc<TypeDesc>> {
    registry().read().unwrap().get(name).cloned()
}

fn register_named(name: &str, desc: Arc<TypeDesc>) -> Result<(), TypeDescriptionError> {
    let mut map = registry().write().unwrap();
    if map.contains_key(name) {
        return Err(TypeDescriptionError::DuplicateTypeName(name.to_string()));
    }
    map.insert(name.to_string(), desc);
    Ok(())
}

// ---------------------------------------------------------------------------
// Type specifications
// ---------------------------------------------------------------------------

/// A reference to a type: a name, a C declaration, or a built description,
/// optionally wrapped with a direction or member alignment.
#[derive(Debug, Clone)]
pub enum TypeSpec {
    /// A registered name or C declaration such as `"int *"` or `"char [8]"`.
    Name(String),
    /// An already built description.
    Desc(Arc<TypeDesc>),
    /// A parameter direction applied by [`out`], [`inout`] or [`in_`].
    Directed(Direction, Box<TypeSpec>),
    /// A member alignment override applied by [`aligned`].
    Aligned(usize, Box<TypeSpec>),
}

impl From<&str> for TypeSpec {
    fn from(name: &str) -> Self {
        TypeSpec::Name(name.to_string())
    }
}

impl From<String> for TypeSpec {
    fn from(name: String) -> Self {
        TypeSpec::Name(name)
    }
}

impl From<Arc<TypeDesc>> for TypeSpec {
    fn from(desc: Arc<TypeDesc>) -> Self {
        TypeSpec::Desc(desc)
    }
}

impl From<&Arc<TypeDesc>> for TypeSpec {
    fn from(desc: &Arc<TypeDesc>) -> Self {
        TypeSpec::Desc(desc.clone())
    }
}

/// Mark a pointer parameter as written by the callee.
pub fn out(spec: impl Into<TypeSpec>) -> TypeSpec {
    TypeSpec::Directed(Direction::Out, Box::new(spec.into()))
}

/// Mark a pointer parameter as read and then rewritten by the callee.
pub fn inout(spec: impl Into<TypeSpec>) -> TypeSpec {
    TypeSpec::Directed(Direction::InOut, Box::new(spec.into()))
}

/// Mark a parameter as read-only, the default.
pub fn in_(spec: impl Into<TypeSpec>) -> TypeSpec {
    TypeSpec::Directed(Direction::In, Box::new(spec.into()))
}

/// Override the alignment of a struct member.
pub fn aligned(align: usize, spec: impl Into<TypeSpec>) -> TypeSpec {
    TypeSpec::Aligned(align, Box::new(spec.into()))
}

pub(crate) struct ResolvedSpec {
    pub(crate) desc: Arc<TypeDesc>,
    pub(crate) direction: Direction,
    pub(crate) align_override: Option<usize>,
}

pub(crate) fn resolve_full(spec: TypeSpec) -> Result<ResolvedSpec, TypeDescriptionError> {
    match spec {
        TypeSpec::Name(name) => {
            let trimmed = name.trim();
            if let Some(desc) = lookup(trimmed) {
                return Ok(ResolvedSpec {
                    desc,
                    direction: Direction::In,
                    align_override: None,
                });
            }
            let (desc, direction) = parser::parse_type_spec(trimmed)?;
            Ok(ResolvedSpec {
                desc,
                direction,
                align_override: None,
            })
        }
        TypeSpec::Desc(desc) => Ok(ResolvedSpec {
            desc,
            direction: Direction::In,
            align_override: None,
        }),
        TypeSpec::Directed(direction, inner) => {
            let mut resolved = resolve_full(*inner)?;
            resolved.direction = direction;
            Ok(resolved)
        }
        TypeSpec::Aligned(align, inner) => {
            if !align.is_power_of_two() || align > 16 {
                return Err(TypeDescriptionError::InvalidAlignment(align));
            }
            let mut resolved = resolve_full(*inner)?;
            resolved.align_override = Some(align);
            Ok(resolved)
        }
    }
}

/// Resolve a specification to its description.
///
/// # Examples
///
/// ```
/// # use ferrule_bridge::types::resolve;
/// let ty = resolve("int *").unwrap();
/// assert_eq!(ty.name(), "int32 *");
/// ```
pub fn resolve(spec: impl Into<TypeSpec>) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
    let resolved = resolve_full(spec.into())?;
    if resolved.align_override.is_some() {
        return Err(TypeDescriptionError::MisplacedAlignment);
    }
    Ok(resolved.desc)
}

/// Resolve a parameter specification, validating its direction.
pub(crate) fn resolve_param(
    spec: TypeSpec,
) -> Result<(Arc<TypeDesc>, Direction), TypeDescriptionError> {
    let resolved = resolve_full(spec)?;
    if resolved.align_override.is_some() {
        return Err(TypeDescriptionError::MisplacedAlignment);
    }
    if resolved.direction.is_output()
        && !matches!(resolved.desc.kind(), TypeKind::Pointer { .. })
    {
        return Err(TypeDescriptionError::DirectionOnValue(
            resolved.desc.name().to_string(),
        ));
    }
    Ok((resolved.desc, resolved.direction))
}

fn resolve_member(
    spec: TypeSpec,
) -> Result<(Arc<TypeDesc>, Option<usize>), TypeDescriptionError> {
    let resolved = resolve_full(spec)?;
    if resolved.direction != Direction::In {
        return Err(TypeDescriptionError::DirectionOnValue(
            resolved.desc.name().to_string(),
        ));
    }
    Ok((resolved.desc, resolved.align_override))
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

fn build_record(
    name: &str,
    register: bool,
    fields: &[(&str, TypeSpec)],
    packed: bool,
    union: bool,
) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
    if fields.is_empty() {
        return Err(TypeDescriptionError::EmptyRecord(name.to_string()));
    }

    let mut pending = Vec::with_capacity(fields.len());
    for (member_name, spec) in fields {
        let (ty, align_override) = resolve_member(spec.clone())?;
        if ty.size() == 0 {
            return Err(TypeDescriptionError::IncompleteMember {
                record: name.to_string(),
                member: (*member_name).to_string(),
                ty: ty.name().to_string(),
            });
        }
        pending.push(layout::PendingMember {
            name: (*member_name).to_string(),
            ty,
            align_override,
        });
    }

    let (members, size, align) = layout::compute(name, pending, packed, union)?;

    let max = config::current().max_type_size;
    if size > max {
        return Err(TypeDescriptionError::TypeTooBig {
            name: name.to_string(),
            max,
        });
    }

    let desc = Arc::new(TypeDesc::new(
        name.to_string(),
        TypeKind::Record {
            members,
            union,
            packed,
        },
        size,
        align,
    ));
    if register {
        register_named(name, desc.clone())?;
    }
    Ok(desc)
}

/// Describe and register a C struct.
///
/// # Examples
///
/// ```
/// # use ferrule_bridge::types::{struct_type, sizeof, offsetof};
/// struct_type("DocPoint", &[("x", "double".into()), ("y", "double".into())]).unwrap();
/// assert_eq!(sizeof("DocPoint").unwrap(), 16);
/// assert_eq!(offsetof("DocPoint", "y").unwrap(), 8);
/// ```
pub fn struct_type(
    name: &str,
    fields: &[(&str, TypeSpec)],
) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
    build_record(name, true, fields, false, false)
}

/// Describe and register a packed C struct: no padding between members.
pub fn pack(
    name: &str,
    fields: &[(&str, TypeSpec)],
) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
    build_record(name, true, fields, true, false)
}

/// Describe and register a C union.
pub fn union_type(
    name: &str,
    fields: &[(&str, TypeSpec)],
) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
    build_record(name, true, fields, false, true)
}

/// Register a named type with unknown layout. Only pointers to it can cross
/// the boundary.
pub fn opaque(name: &str) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
    let desc = Arc::new(TypeDesc::new(name.to_string(), TypeKind::Opaque, 0, 1));
    register_named(name, desc.clone())?;
    Ok(desc)
}

/// Build a pointer description with `depth` levels of indirection.
pub fn pointer(
    spec: impl Into<TypeSpec>,
    depth: usize,
) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
    if !(1..=MAX_POINTER_DEPTH).contains(&depth) {
        return Err(TypeDescriptionError::PointerDepth);
    }
    let mut desc = resolve(spec)?;
    for _ in 0..depth {
        desc = pointer_to(desc);
    }
    Ok(desc)
}

/// Build a fixed-length array description.
///
/// `hint` controls how the elements decode; `char` and `char16` arrays
/// default to text.
pub fn array(
    spec: impl Into<TypeSpec>,
    len: usize,
    hint: Option<ArrayHint>,
) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
    let element = resolve(spec)?;
    if len == 0 {
        return Err(TypeDescriptionError::InvalidArrayLength);
    }
    if element.size() == 0 {
        return Err(TypeDescriptionError::IncompleteType(
            element.name().to_string(),
        ));
    }

    let max = config::current().max_type_size;
    if len > max / element.size() {
        return Err(TypeDescriptionError::ArrayTooBig {
            max: max / element.size(),
        });
    }

    let hint = hint.unwrap_or(match element.kind() {
        TypeKind::Char | TypeKind::Char16 => ArrayHint::String,
        _ => ArrayHint::Array,
    });

    let name = format!("{} [{}]", element.name(), len);
    let size = element.size() * len;
    let align = element.align();
    Ok(Arc::new(TypeDesc::new(
        name,
        TypeKind::Array { element, len, hint },
        size,
        align,
    )))
}

fn build_prototype(
    name: &str,
    convention: CallConvention,
    ret: Arc<TypeDesc>,
    params: Vec<ParamDesc>,
) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
    ret.check_return()?;
    if params.len() > MAX_PARAMETERS {
        return Err(TypeDescriptionError::TooManyParameters(MAX_PARAMETERS));
    }
    for param in &params {
        param.ty.check_parameter()?;
        if param.direction != Direction::In {
            return Err(TypeDescriptionError::DirectionOnValue(
                param.ty.name().to_string(),
            ));
        }
    }

    let proto = Arc::new(Prototype {
        name: name.to_string(),
        ret,
        params,
        convention,
    });
    Ok(Arc::new(TypeDesc::new(
        name.to_string(),
        TypeKind::Prototype(proto),
        std::mem::size_of::<usize>(),
        std::mem::align_of::<usize>(),
    )))
}

/// Describe and register a callback signature from a C declaration, such as
/// `"int IntCallback(int x)"`.
pub fn callback(decl: &str) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
    let sig = parser::parse_signature(decl)?;
    if sig.variadic {
        return Err(TypeDescriptionError::VariadicCallback);
    }
    let convention = sig.convention.unwrap_or(CallConvention::Cdecl);
    let desc = build_prototype(&sig.name, convention, sig.ret, sig.params)?;
    register_named(&sig.name, desc.clone())?;
    Ok(desc)
}

/// Describe and register a callback signature from parts.
pub fn callback_with(
    name: &str,
    ret: impl Into<TypeSpec>,
    params: &[TypeSpec],
) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
    let ret = resolve(ret)?;
    let mut param_descs = Vec::with_capacity(params.len());
    for spec in params {
        let (ty, direction) = resolve_param(spec.clone())?;
        param_descs.push(ParamDesc {
            name: String::new(),
            ty,
            direction,
        });
    }
    let desc = build_prototype(name, CallConvention::Cdecl, ret, param_descs)?;
    register_named(name, desc.clone())?;
    Ok(desc)
}

/// Register an additional name for an existing type.
pub fn alias(name: &str, spec: impl Into<TypeSpec>) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
    let desc = resolve(spec)?;
    register_named(name, desc.clone())?;
    Ok(desc)
}

fn build_disposable(
    name: &str,
    target: Arc<TypeDesc>,
    dispose: DisposeFn,
) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
    match target.kind() {
        TypeKind::Disposable { .. } => {
            return Err(TypeDescriptionError::DisposableNesting(
                target.name().to_string(),
            ))
        }
        TypeKind::CString | TypeKind::CString16 | TypeKind::Pointer { .. } => {}
        _ => {
            return Err(TypeDescriptionError::DisposableKind(
                target.name().to_string(),
            ))
        }
    }
    Ok(Arc::new(TypeDesc::new(
        name.to_string(),
        TypeKind::Disposable {
            target: target.clone(),
            dispose,
        },
        target.size(),
        target.align(),
    )))
}

/// Wrap a string or pointer type so decoded memory is released with the C
/// allocator's `free` after conversion.
pub fn disposable(spec: impl Into<TypeSpec>) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
    let target = resolve(spec)?;
    let name = format!("{}!", target.name());
    build_disposable(&name, target, DisposeFn::CFree)
}

/// Wrap a string or pointer type with a named disposable using a custom
/// release function, and register it.
pub fn disposable_with(
    name: &str,
    spec: impl Into<TypeSpec>,
    dispose: DisposeFn,
) -> Result<Arc<TypeDesc>, TypeDescriptionError> {
    let target = resolve(spec)?;
    let desc = build_disposable(name, target, dispose)?;
    register_named(name, desc.clone())?;
    Ok(desc)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Size of a type in bytes.
pub fn sizeof(spec: impl Into<TypeSpec>) -> Result<usize, TypeDescriptionError> {
    let desc = resolve(spec)?;
    if desc.size() == 0 {
        return Err(TypeDescriptionError::IncompleteType(
            desc.name().to_string(),
        ));
    }
    Ok(desc.size())
}

/// Alignment of a type in bytes.
pub fn alignof(spec: impl Into<TypeSpec>) -> Result<usize, TypeDescriptionError> {
    let desc = resolve(spec)?;
    if desc.size() == 0 {
        return Err(TypeDescriptionError::IncompleteType(
            desc.name().to_string(),
        ));
    }
    Ok(desc.align())
}

/// Byte offset of a struct or union member.
pub fn offsetof(
    spec: impl Into<TypeSpec>,
    member: &str,
) -> Result<usize, TypeDescriptionError> {
    let desc = resolve(spec)?;
    let TypeKind::Record { members, .. } = desc.kind() else {
        return Err(TypeDescriptionError::NotARecord(desc.name().to_string()));
    };
    members
        .iter()
        .find(|m| m.name == member)
        .map(|m| m.offset)
        .ok_or_else(|| TypeDescriptionError::UnknownMember {
            record: desc.name().to_string(),
            member: member.to_string(),
        })
}

/// Reinterpret a pointer-bearing value under another type.
///
/// Numbers are treated as raw addresses; `Null` becomes a null pointer of
/// the target type.
pub fn as_type(value: &Value, spec: impl Into<TypeSpec>) -> Result<Value, BridgeError> {
    let desc = resolve(spec)?;
    match value {
        Value::Pointer(p) => Ok(Value::pointer(p.addr(), desc)),
        Value::Number(n) => Ok(Value::pointer(*n as u64 as usize, desc)),
        Value::Int64(v) => Ok(Value::pointer(*v as usize, desc)),
        Value::UInt64(v) => Ok(Value::pointer(*v as usize, desc)),
        Value::Null => Ok(Value::pointer(0, desc)),
        other => Err(MarshalingError::TypeMismatch {
            expected: "pointer".to_string(),
            got: other.type_name(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_primitive_lookup() {
        assert_eq!(resolve("int").unwrap().size(), 4);
        assert_eq!(resolve("double").unwrap().size(), 8);
        assert_eq!(resolve("str").unwrap().size(), std::mem::size_of::<usize>());

        // Aliases share one description.
        let a = resolve("int32").unwrap();
        let b = resolve("int").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_platform_width_names() {
        assert_eq!(
            sizeof("long").unwrap(),
            std::mem::size_of::<std::ffi::c_long>()
        );
        assert_eq!(sizeof("size_t").unwrap(), std::mem::size_of::<usize>());
        assert_eq!(sizeof("intptr_t").unwrap(), std::mem::size_of::<isize>());
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(
            resolve("no_such_type"),
            Err(TypeDescriptionError::UnknownType("no_such_type".to_string()))
        );
    }

    #[test]
    fn test_struct_layout_queries() {
        struct_type(
            "TyMixed",
            &[
                ("flag", "bool".into()),
                ("count", "int32".into()),
                ("scale", "double".into()),
            ],
        )
        .unwrap();

        assert_eq!(offsetof("TyMixed", "flag").unwrap(), 0);
        assert_eq!(offsetof("TyMixed", "count").unwrap(), 4);
        assert_eq!(offsetof("TyMixed", "scale").unwrap(), 8);
        assert_eq!(sizeof("TyMixed").unwrap(), 16);
        assert_eq!(alignof("TyMixed").unwrap(), 8);
    }

    #[test]
    fn test_packed_struct() {
        pack(
            "TyPacked",
            &[("a", "int8".into()), ("b", "int32".into()), ("c", "int8".into())],
        )
        .unwrap();

        assert_eq!(offsetof("TyPacked", "b").unwrap(), 1);
        assert_eq!(offsetof("TyPacked", "c").unwrap(), 5);
        assert_eq!(sizeof("TyPacked").unwrap(), 6);
        assert_eq!(alignof("TyPacked").unwrap(), 1);
    }

    #[test]
    fn test_member_alignment_override() {
        struct_type(
            "TyAligned",
            &[("a", "int8".into()), ("b", aligned(8, "int16"))],
        )
        .unwrap();

        assert_eq!(offsetof("TyAligned", "b").unwrap(), 8);
        assert_eq!(sizeof("TyAligned").unwrap(), 16);
    }

    #[test]
    fn test_union_layout() {
        union_type("TyEither", &[("i", "int32".into()), ("d", "double".into())]).unwrap();

        assert_eq!(offsetof("TyEither", "i").unwrap(), 0);
        assert_eq!(offsetof("TyEither", "d").unwrap(), 0);
        assert_eq!(sizeof("TyEither").unwrap(), 8);
    }

    #[test]
    fn test_empty_and_duplicate_records() {
        assert_eq!(
            struct_type("TyEmpty", &[]),
            Err(TypeDescriptionError::EmptyRecord("TyEmpty".to_string()))
        );

        struct_type("TyOnce", &[("a", "int".into())]).unwrap();
        assert_eq!(
            struct_type("TyOnce", &[("a", "int".into())]),
            Err(TypeDescriptionError::DuplicateTypeName("TyOnce".to_string()))
        );
    }

    #[test]
    fn test_nested_struct_members() {
        struct_type("TyInner", &[("x", "int16".into()), ("y", "int16".into())]).unwrap();
        struct_type(
            "TyOuter",
            &[("head", "int8".into()), ("inner", "TyInner".into())],
        )
        .unwrap();

        assert_eq!(offsetof("TyOuter", "inner").unwrap(), 2);
        assert_eq!(sizeof("TyOuter").unwrap(), 6);
    }

    #[test]
    fn test_pointer_depth() {
        let p = pointer("int", 1).unwrap();
        assert_eq!(p.name(), "int32 *");
        assert_eq!(p.size(), std::mem::size_of::<usize>());

        let pp = pointer("int", 2).unwrap();
        assert_eq!(pp.name(), "int32 **");

        assert_eq!(pointer("int", 0), Err(TypeDescriptionError::PointerDepth));
        assert_eq!(pointer("int", 5), Err(TypeDescriptionError::PointerDepth));
    }

    #[test]
    fn test_array_rules() {
        let a = array("int32", 4, None).unwrap();
        assert_eq!(a.size(), 16);
        assert_eq!(a.name(), "int32 [4]");

        assert_eq!(
            array("int32", 0, None),
            Err(TypeDescriptionError::InvalidArrayLength)
        );
        assert!(matches!(
            array("int32", usize::MAX / 2, None),
            Err(TypeDescriptionError::ArrayTooBig { .. })
        ));
    }

    #[test]
    fn test_char_arrays_default_to_text() {
        let chars = array("char", 8, None).unwrap();
        assert!(matches!(
            chars.kind(),
            TypeKind::Array {
                hint: ArrayHint::String,
                ..
            }
        ));

        let bytes = array("uint8", 8, None).unwrap();
        assert!(matches!(
            bytes.kind(),
            TypeKind::Array {
                hint: ArrayHint::Array,
                ..
            }
        ));
    }

    #[test]
    fn test_opaque_has_no_size() {
        opaque("TyHandle").unwrap();
        assert_eq!(
            sizeof("TyHandle"),
            Err(TypeDescriptionError::IncompleteType("TyHandle".to_string()))
        );
        assert!(pointer("TyHandle", 1).is_ok());
    }

    #[test]
    fn test_callback_declaration() {
        let cb = callback("int TyNotify(int level, str message)").unwrap();
        let TypeKind::Prototype(proto) = cb.kind() else {
            panic!("expected a prototype kind");
        };
        assert_eq!(proto.name(), "TyNotify");
        assert_eq!(proto.params().len(), 2);
        assert_eq!(proto.params()[1].name, "message");
        assert_eq!(
            proto.signature(),
            "int32 TyNotify(int32 level, str message)"
        );
    }

    #[test]
    fn test_variadic_callback_rejected() {
        assert_eq!(
            callback("int TyBadCb(str fmt, ...)"),
            Err(TypeDescriptionError::VariadicCallback)
        );
    }

    #[test]
    fn test_alias_shares_description() {
        alias("TyMyInt", "int32").unwrap();
        let a = resolve("TyMyInt").unwrap();
        let b = resolve("int32").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_disposable_rules() {
        let d = disposable("str").unwrap();
        assert!(matches!(d.kind(), TypeKind::Disposable { .. }));

        assert_eq!(
            disposable("int32"),
            Err(TypeDescriptionError::DisposableKind("int32".to_string()))
        );
        assert!(matches!(
            disposable(d),
            Err(TypeDescriptionError::DisposableNesting(_))
        ));
    }

    #[test]
    fn test_union_cannot_travel_by_value() {
        union_type("TyByValue", &[("i", "int32".into()), ("f", "float32".into())]).unwrap();
        let desc = resolve("TyByValue").unwrap();

        assert!(desc.check_parameter().is_err());
        assert!(desc.check_return().is_err());
        assert!(pointer("TyByValue", 1).unwrap().check_parameter().is_ok());
    }

    #[test]
    fn test_as_type_retags_pointers() {
        opaque("TyAsTarget").unwrap();
        let target = pointer("TyAsTarget", 1).unwrap();

        let raw = Value::pointer(0x1000, resolve("void").map(super::pointer_to).unwrap());
        let cast = as_type(&raw, &target).unwrap();
        let p = cast.as_pointer().unwrap();
        assert_eq!(p.addr(), 0x1000);
        assert_eq!(p.type_desc().name(), "TyAsTarget *");

        let from_null = as_type(&Value::Null, &target).unwrap();
        assert!(from_null.as_pointer().unwrap().is_null());

        assert!(as_type(&Value::string("x"), &target).is_err());
    }

    #[test]
    fn test_foreign_endian_types() {
        let native = resolve("uint32").unwrap();
        let (same, swapped) = if cfg!(target_endian = "little") {
            ("uint32_le", "uint32_be")
        } else {
            ("uint32_be", "uint32_le")
        };

        assert!(Arc::ptr_eq(&resolve(same).unwrap(), &native));
        assert!(matches!(
            resolve(swapped).unwrap().kind(),
            TypeKind::UInt32Swapped
        ));
        assert_eq!(sizeof(swapped).unwrap(), 4);
    }
}
