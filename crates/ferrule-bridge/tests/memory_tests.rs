//! Direct memory access integration tests.
//!
//! The decode and encode entry points work on caller-owned addresses
//! with no staging frame, so the natural partners here are the C
//! allocator and plain local buffers.

use ferrule_bridge::{decode, decode_at, decode_slice, encode, resolve, Value};
use proptest::prelude::*;

#[cfg(unix)]
use ferrule_bridge::{encode_at, free, struct_type};

fn ptr_to<T>(v: &mut T) -> Value {
    Value::pointer(v as *mut T as usize, resolve("void *").unwrap())
}

// ===== Local buffers =====

#[test]
fn test_decode_at_walks_offsets() {
    let mut values: [i32; 3] = [10, 20, 30];
    let p = ptr_to(&mut values);

    assert_eq!(decode(&p, "int32").unwrap(), Value::Number(10.0));
    assert_eq!(decode_at(&p, 4, "int32").unwrap(), Value::Number(20.0));
    assert_eq!(decode_at(&p, 8, "int32").unwrap(), Value::Number(30.0));
}

#[test]
fn test_decode_slice_reads_text_and_arrays() {
    let mut text = *b"hey\0ignored";
    let p = ptr_to(&mut text);
    assert_eq!(
        decode_slice(&p, 0, "char", text.len()).unwrap(),
        Value::string("hey")
    );

    let mut shorts: [u16; 3] = [5, 6, 7];
    let p = ptr_to(&mut shorts);
    assert_eq!(
        decode_slice(&p, 0, "uint16", 3).unwrap(),
        Value::array(vec![
            Value::Number(5.0),
            Value::Number(6.0),
            Value::Number(7.0),
        ])
    );
}

#[test]
fn test_encode_rejects_values_that_need_staging() {
    let mut cell = 0u64;
    let p = ptr_to(&mut cell);

    let err = encode(&p, "str", &Value::string("nope")).unwrap_err();
    insta::assert_snapshot!(err.to_string(), @"Cannot encode value of type 'str'");
    assert_eq!(cell, 0);
}

// ===== C heap round trips =====

#[cfg(unix)]
#[test]
fn test_malloc_encode_decode_free_cycle() {
    struct_type("MemPair", &[("id", "int32".into()), ("weight", "double".into())]).unwrap();

    let libc = ferrule_bridge::load_self().unwrap();
    let malloc = libc.func("void *malloc(size_t size)").unwrap();

    let block = malloc.call(&mut [Value::Number(16.0)]).unwrap();
    assert!(matches!(block, Value::Pointer(_)));

    let pair = Value::record([
        ("id", Value::Number(7.0)),
        ("weight", Value::Number(0.5)),
    ]);
    encode(&block, "MemPair", &pair).unwrap();

    let back = decode(&block, "MemPair").unwrap();
    let record = back.as_record().unwrap();
    assert_eq!(record.get("id"), Some(&Value::Number(7.0)));
    assert_eq!(record.get("weight"), Some(&Value::Number(0.5)));

    free(&block).unwrap();
}

#[cfg(unix)]
#[test]
fn test_encode_at_offsets_inside_a_block() {
    let libc = ferrule_bridge::load_self().unwrap();
    let malloc = libc.func("void *malloc(size_t size)").unwrap();

    let block = malloc.call(&mut [Value::Number(12.0)]).unwrap();
    for i in 0..3isize {
        encode_at(&block, i * 4, "int32", &Value::Number(i as f64 + 1.0)).unwrap();
    }
    assert_eq!(
        decode_slice(&block, 0, "int32", 3).unwrap(),
        Value::array(vec![
            Value::Number(1.0),
            Value::Number(2.0),
            Value::Number(3.0),
        ])
    );
    free(&block).unwrap();
}

#[cfg(unix)]
#[test]
fn test_disposable_return_copies_then_frees() {
    let libc = ferrule_bridge::load_self().unwrap();
    let strdup = libc.func("str_free strdup(const char *s)").unwrap();

    let copy = strdup.call(&mut [Value::string("copy me")]).unwrap();
    assert_eq!(copy, Value::string("copy me"));
}

// ===== Round-trip law =====

proptest! {
    #[test]
    fn prop_int32_round_trips_through_memory(v in any::<i32>()) {
        let mut cell = 0i32;
        let p = ptr_to(&mut cell);
        encode(&p, "int32", &Value::Number(v as f64)).unwrap();
        prop_assert_eq!(decode(&p, "int32").unwrap(), Value::Number(v as f64));
    }

    #[test]
    fn prop_double_round_trips_through_memory(v in -1.0e300f64..1.0e300) {
        let mut cell = 0f64;
        let p = ptr_to(&mut cell);
        encode(&p, "double", &Value::Number(v)).unwrap();
        prop_assert_eq!(decode(&p, "double").unwrap(), Value::Number(v));
    }

    #[test]
    fn prop_uint64_round_trips_exactly(v in any::<u64>()) {
        let mut cell = 0u64;
        let p = ptr_to(&mut cell);
        encode(&p, "uint64", &Value::unsigned(v)).unwrap();
        prop_assert_eq!(decode(&p, "uint64").unwrap(), Value::unsigned(v));
    }
}
