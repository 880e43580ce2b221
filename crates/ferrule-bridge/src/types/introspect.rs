//! Serializable reports describing resolved types.
//!
//! [`introspect`] turns any resolvable specification into a [`TypeInfo`]
//! that can be logged, diffed or serialized. Reports are snapshots: they
//! describe the layout at the time of the call and hold no reference to the
//! live description.

use serde::Serialize;

use crate::error::TypeDescriptionError;
use crate::types::{resolve, TypeKind, TypeSpec};

/// Layout report for a single type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeInfo {
    pub name: String,
    /// Kind label such as `"Int32"`, `"Record"` or `"Union"`.
    pub primitive: String,
    pub size: usize,
    pub alignment: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<MemberInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Pointed-to or element type, or the callback signature.
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// One member row of a struct or union report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub offset: usize,
}

fn kind_label(kind: &TypeKind) -> &'static str {
    match kind {
        TypeKind::Void => "Void",
        TypeKind::Bool => "Bool",
        TypeKind::Char => "Char",
        TypeKind::Char16 => "Char16",
        TypeKind::Int8 => "Int8",
        TypeKind::UInt8 => "UInt8",
        TypeKind::Int16 => "Int16",
        TypeKind::UInt16 => "UInt16",
        TypeKind::Int32 => "Int32",
        TypeKind::UInt32 => "UInt32",
        TypeKind::Int64 => "Int64",
        TypeKind::UInt64 => "UInt64",
        TypeKind::Int16Swapped => "Int16Swapped",
        TypeKind::UInt16Swapped => "UInt16Swapped",
        TypeKind::Int32Swapped => "Int32Swapped",
        TypeKind::UInt32Swapped => "UInt32Swapped",
        TypeKind::Int64Swapped => "Int64Swapped",
        TypeKind::UInt64Swapped => "UInt64Swapped",
        TypeKind::Float32 => "Float32",
        TypeKind::Float64 => "Float64",
        TypeKind::CString => "String",
        TypeKind::CString16 => "String16",
        TypeKind::Pointer { .. } => "Pointer",
        TypeKind::Array { .. } => "Array",
        TypeKind::Record { union: false, .. } => "Record",
        TypeKind::Record { union: true, .. } => "Union",
        TypeKind::Opaque => "Opaque",
        TypeKind::Prototype(_) => "Callback",
        TypeKind::Disposable { target, .. } => kind_label(target.kind()),
    }
}

/// Build a layout report for a type.
///
/// # Examples
///
/// ```
/// # use ferrule_bridge::types::introspect;
/// let info = introspect("int16").unwrap();
/// assert_eq!(info.primitive, "Int16");
/// assert_eq!(info.size, 2);
/// ```
pub fn introspect(spec: impl Into<TypeSpec>) -> Result<TypeInfo, TypeDescriptionError> {
    let desc = resolve(spec)?;

    let mut info = TypeInfo {
        name: desc.name().to_string(),
        primitive: kind_label(desc.kind()).to_string(),
        size: desc.size(),
        alignment: desc.align(),
        members: None,
        length: None,
        hint: None,
        target: None,
    };

    match desc.kind() {
        TypeKind::Record { members, .. } => {
            info.members = Some(
                members
                    .iter()
                    .map(|m| MemberInfo {
                        name: m.name.clone(),
                        type_name: m.ty.name().to_string(),
                        offset: m.offset,
                    })
                    .collect(),
            );
        }
        TypeKind::Array { element, len, hint } => {
            info.length = Some(*len);
            info.hint = Some(format!("{hint:?}"));
            info.target = Some(element.name().to_string());
        }
        TypeKind::Pointer { target } => {
            info.target = Some(target.name().to_string());
        }
        TypeKind::Prototype(proto) => {
            info.target = Some(proto.signature());
        }
        TypeKind::Disposable { target, .. } => {
            info.target = Some(target.name().to_string());
        }
        _ => {}
    }

    Ok(info)
}
