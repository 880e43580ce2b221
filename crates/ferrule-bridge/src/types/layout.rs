//! Offset and size computation for struct and union layouts.
//!
//! Offsets follow the C rules: each member lands at the next multiple of
//! its alignment, the aggregate alignment is the strictest member
//! alignment, and the total size is padded out to that alignment. Packed
//! records drop the per-member padding. An explicit member alignment
//! override replaces the natural alignment entirely, whether packing is in
//! effect or not.

use std::sync::Arc;

use crate::error::TypeDescriptionError;
use crate::types::{Member, TypeDesc};

/// A member waiting for an offset.
pub(crate) struct PendingMember {
    pub(crate) name: String,
    pub(crate) ty: Arc<TypeDesc>,
    pub(crate) align_override: Option<usize>,
}

/// Round `len` up to the next multiple of `align`.
pub(crate) fn align_up(len: usize, align: usize) -> usize {
    (len + align - 1) / align * align
}

/// Assign offsets and compute the aggregate size and alignment.
///
/// Union members all sit at offset zero and the union spans its widest
/// member. Struct members are laid out in declaration order.
pub(crate) fn compute(
    record: &str,
    members: Vec<PendingMember>,
    packed: bool,
    union: bool,
) -> Result<(Vec<Member>, usize, usize), TypeDescriptionError> {
    let mut laid_out: Vec<Member> = Vec::with_capacity(members.len());
    let mut size = 0usize;
    let mut align = 1usize;

    for pending in members {
        if laid_out.iter().any(|m| m.name == pending.name) {
            return Err(TypeDescriptionError::DuplicateMember {
                record: record.to_string(),
                member: pending.name,
            });
        }

        let natural = pending.ty.align();
        let member_align = pending
            .align_override
            .unwrap_or(if packed { 1 } else { natural });

        let offset = if union { 0 } else { align_up(size, member_align) };
        let end = offset + pending.ty.size();

        size = if union { size.max(end) } else { end };
        align = align.max(member_align);

        laid_out.push(Member {
            name: pending.name,
            ty: pending.ty,
            offset,
        });
    }

    Ok((laid_out, align_up(size, align), align))
}
