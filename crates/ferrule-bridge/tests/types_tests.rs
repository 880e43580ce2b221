//! Type description and layout integration tests.
//!
//! Layout claims are checked against what rustc produces for the
//! equivalent `#[repr(C)]` definitions, so every offset assertion holds
//! on any target the tests build for.

use std::sync::atomic::{AtomicUsize, Ordering};

use ferrule_bridge::{
    aligned, alignof, alias, array, introspect, offsetof, opaque, pack, pointer, resolve, sizeof,
    struct_type, types, union_type, TypeSpec, Value,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;

// ===== Primitive sizes =====

#[rstest]
#[case("int8", 1)]
#[case("uint16", 2)]
#[case("int32", 4)]
#[case("int64", 8)]
#[case("float32", 4)]
#[case("double", 8)]
#[case("bool", 1)]
#[case("char", 1)]
#[case("char16", 2)]
#[case("str", std::mem::size_of::<usize>())]
#[case("void *", std::mem::size_of::<usize>())]
#[case("long", std::mem::size_of::<std::ffi::c_long>())]
#[case("size_t", std::mem::size_of::<usize>())]
fn test_primitive_sizes(#[case] name: &str, #[case] expected: usize) {
    assert_eq!(sizeof(name).unwrap(), expected);
}

// ===== Struct layout against rustc =====

#[repr(C)]
struct MixedMirror {
    a: i8,
    b: i32,
    c: f64,
    d: u16,
}

#[test]
fn test_struct_layout_matches_repr_c() {
    struct_type(
        "TyMixed",
        &[
            ("a", "int8".into()),
            ("b", "int32".into()),
            ("c", "double".into()),
            ("d", "uint16".into()),
        ],
    )
    .unwrap();

    let sample = MixedMirror { a: 0, b: 0, c: 0.0, d: 0 };
    let base = &sample as *const MixedMirror as usize;

    assert_eq!(sizeof("TyMixed").unwrap(), std::mem::size_of::<MixedMirror>());
    assert_eq!(alignof("TyMixed").unwrap(), std::mem::align_of::<MixedMirror>());
    assert_eq!(offsetof("TyMixed", "a").unwrap(), 0);
    assert_eq!(
        offsetof("TyMixed", "b").unwrap(),
        std::ptr::addr_of!(sample.b) as usize - base
    );
    assert_eq!(
        offsetof("TyMixed", "c").unwrap(),
        std::ptr::addr_of!(sample.c) as usize - base
    );
    assert_eq!(
        offsetof("TyMixed", "d").unwrap(),
        std::ptr::addr_of!(sample.d) as usize - base
    );
}

#[repr(C, packed)]
struct PackedMirror {
    tag: u8,
    count: i32,
    scale: f64,
}

#[test]
fn test_packed_layout_drops_padding() {
    pack(
        "TyPacked",
        &[
            ("tag", "uint8".into()),
            ("count", "int32".into()),
            ("scale", "double".into()),
        ],
    )
    .unwrap();

    let sample = PackedMirror { tag: 0, count: 0, scale: 0.0 };
    let base = &sample as *const PackedMirror as usize;

    assert_eq!(sizeof("TyPacked").unwrap(), std::mem::size_of::<PackedMirror>());
    assert_eq!(
        offsetof("TyPacked", "count").unwrap(),
        std::ptr::addr_of!(sample.count) as usize - base
    );
    assert_eq!(
        offsetof("TyPacked", "scale").unwrap(),
        std::ptr::addr_of!(sample.scale) as usize - base
    );
}

#[test]
fn test_union_members_share_offset_zero() {
    union_type("TyVariant", &[("i", "int32".into()), ("d", "double".into())]).unwrap();

    assert_eq!(sizeof("TyVariant").unwrap(), 8);
    assert_eq!(offsetof("TyVariant", "i").unwrap(), 0);
    assert_eq!(offsetof("TyVariant", "d").unwrap(), 0);
}

#[test]
fn test_aligned_member_override() {
    struct_type(
        "TyLoose",
        &[("tag", "uint8".into()), ("payload", aligned(8, "uint8"))],
    )
    .unwrap();

    assert_eq!(offsetof("TyLoose", "payload").unwrap(), 8);
    assert_eq!(sizeof("TyLoose").unwrap(), 16);
}

#[test]
fn test_array_types() {
    assert_eq!(sizeof("int32 [4]").unwrap(), 16);

    let triple = array("double", 3, None).unwrap();
    assert_eq!(triple.size(), 24);

    let info = introspect(&triple).unwrap();
    assert_eq!(info.primitive, "Array");
    assert_eq!(info.length, Some(3));
}

// ===== Named types and aliases =====

#[test]
fn test_alias_shares_the_description() {
    alias("TyMsecs", "uint32").unwrap();

    let via_alias = resolve("TyMsecs").unwrap();
    let direct = resolve("uint32").unwrap();
    assert!(std::sync::Arc::ptr_eq(&via_alias, &direct));
}

#[test]
fn test_opaque_types_are_pointer_only() {
    opaque("TyHandle").unwrap();

    let err = sizeof("TyHandle").unwrap_err();
    insta::assert_snapshot!(
        err.to_string(),
        @"Cannot take the size of incomplete type 'TyHandle'"
    );
    assert_eq!(sizeof("TyHandle *").unwrap(), std::mem::size_of::<usize>());
}

#[test]
fn test_pointer_reinterpretation() {
    let mut cell: i64 = -5;
    let untyped = Value::pointer(
        &mut cell as *mut i64 as usize,
        resolve("void *").unwrap(),
    );

    let retyped = types::as_type(&untyped, "int64 *").unwrap();
    match &retyped {
        Value::Pointer(p) => assert_eq!(p.addr(), &cell as *const i64 as usize),
        other => panic!("expected a pointer, got {other:?}"),
    }
    assert_eq!(
        ferrule_bridge::decode(&retyped, "int64").unwrap(),
        Value::Number(-5.0)
    );
}

// ===== Introspection reports =====

#[test]
fn test_introspect_serializes_layout() {
    struct_type("TyPoint", &[("x", "int32".into()), ("y", "int32".into())]).unwrap();

    let info = introspect("TyPoint").unwrap();
    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "name": "TyPoint",
            "primitive": "Record",
            "size": 8,
            "alignment": 4,
            "members": [
                {"name": "x", "type": "int32", "offset": 0},
                {"name": "y", "type": "int32", "offset": 4},
            ],
        })
    );
}

#[test]
fn test_introspect_callback_reports_signature() {
    types::callback("int TyTick(int n)").unwrap();

    let info = introspect("TyTick").unwrap();
    assert_eq!(info.primitive, "Callback");
    assert!(info.target.is_some());
}

// ===== Error reporting =====

#[test]
fn test_unknown_type_names_the_offender() {
    let err = resolve("NoSuchType").unwrap_err();
    insta::assert_snapshot!(err.to_string(), @"Unknown type 'NoSuchType'");
}

#[test]
fn test_zero_length_arrays_are_rejected() {
    let err = array("int32", 0, None).unwrap_err();
    insta::assert_snapshot!(err.to_string(), @"Array length must be positive and non-zero");
}

#[test]
fn test_duplicate_members_are_rejected() {
    let err = struct_type("TyDup", &[("a", "int32".into()), ("a", "int32".into())]).unwrap_err();
    insta::assert_snapshot!(err.to_string(), @"Duplicate member 'a' in 'TyDup'");
}

#[test]
fn test_pointer_depth_is_bounded() {
    let err = pointer("int32", 9).unwrap_err();
    insta::assert_snapshot!(err.to_string(), @"Pointer indirection must be between 1 and 4");
}

// ===== Layout laws =====

static NEXT_PROP_STRUCT: AtomicUsize = AtomicUsize::new(0);

const PROP_PRIMS: [&str; 6] = ["int8", "int16", "int32", "int64", "float32", "float64"];

proptest! {
    #[test]
    fn prop_struct_layout_obeys_c_rules(picks in prop::collection::vec(0usize..6, 1..6)) {
        let name = format!(
            "TyPropStruct{}",
            NEXT_PROP_STRUCT.fetch_add(1, Ordering::SeqCst)
        );
        let members: Vec<(String, TypeSpec)> = picks
            .iter()
            .enumerate()
            .map(|(i, &k)| (format!("m{i}"), PROP_PRIMS[k].into()))
            .collect();
        let refs: Vec<(&str, TypeSpec)> = members
            .iter()
            .map(|(n, s)| (n.as_str(), s.clone()))
            .collect();
        struct_type(&name, &refs).unwrap();

        let size = sizeof(name.as_str()).unwrap();
        let align = alignof(name.as_str()).unwrap();
        prop_assert_eq!(size % align, 0);

        let mut min_size = 0;
        let mut prev_end = 0;
        for (i, &k) in picks.iter().enumerate() {
            let offset = offsetof(name.as_str(), &format!("m{i}")).unwrap();
            let member_size = sizeof(PROP_PRIMS[k]).unwrap();
            let member_align = alignof(PROP_PRIMS[k]).unwrap();
            prop_assert_eq!(offset % member_align, 0);
            prop_assert!(offset >= prev_end);
            prev_end = offset + member_size;
            min_size += member_size;
        }
        prop_assert!(size >= min_size);
        prop_assert!(size >= prev_end);
    }
}
