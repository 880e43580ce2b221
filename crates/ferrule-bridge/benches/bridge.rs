//! Marshaling and call overhead benchmarks
//!
//! Measures the fixed costs a caller pays per operation:
//! - Staging arguments and dialing a native function
//! - Binding a declaration string to an address
//! - Encoding and decoding records through raw memory
//! - String decoding
//! - A native round trip through a callback trampoline

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ferrule_bridge::{
    bind_pointer, memory, register, struct_type, types, unregister, Value,
};

extern "C" fn bench_add(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

#[repr(C)]
struct Pair {
    id: i32,
    weight: f64,
}

fn pair_type() -> &'static str {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        struct_type(
            "BenchPair",
            &[("id", "int32".into()), ("weight", "double".into())],
        )
        .unwrap();
    });
    "BenchPair"
}

fn bench_sync_call(c: &mut Criterion) {
    let addr = bench_add as extern "C" fn(i32, i32) -> i32 as usize;
    let binding = unsafe { bind_pointer(addr, "int bench_add(int a, int b)") }.unwrap();

    c.bench_function("sync_call_two_ints", |b| {
        b.iter(|| {
            binding
                .call(&mut [black_box(Value::Number(20.0)), Value::Number(22.0)])
                .unwrap()
        });
    });
}

fn bench_bind_declaration(c: &mut Criterion) {
    let addr = bench_add as extern "C" fn(i32, i32) -> i32 as usize;

    c.bench_function("bind_declaration", |b| {
        b.iter(|| {
            unsafe { bind_pointer(black_box(addr), "int bench_add(int a, int b)") }.unwrap()
        });
    });
}

fn bench_encode_record(c: &mut Criterion) {
    let name = pair_type();
    let mut cell = Pair { id: 0, weight: 0.0 };
    let target = Value::pointer(
        &mut cell as *mut Pair as usize,
        types::resolve("void *").unwrap(),
    );
    let value = Value::record([
        ("id", Value::Number(7.0)),
        ("weight", Value::Number(0.5)),
    ]);

    c.bench_function("encode_record", |b| {
        b.iter(|| memory::encode(&target, name, black_box(&value)).unwrap());
    });
}

fn bench_decode_record(c: &mut Criterion) {
    let name = pair_type();
    let mut cell = Pair { id: 7, weight: 0.5 };
    let source = Value::pointer(
        &mut cell as *mut Pair as usize,
        types::resolve("void *").unwrap(),
    );

    c.bench_function("decode_record", |b| {
        b.iter(|| memory::decode(black_box(&source), name).unwrap());
    });
}

fn bench_decode_string(c: &mut Criterion) {
    let text = b"a moderately sized benchmark string\0";
    let mut cell: usize = text.as_ptr() as usize;
    let source = Value::pointer(
        &mut cell as *mut usize as usize,
        types::resolve("void *").unwrap(),
    );

    c.bench_function("decode_string", |b| {
        b.iter(|| memory::decode(black_box(&source), "str").unwrap());
    });
}

fn bench_callback_trampoline(c: &mut Criterion) {
    types::callback("int BenchCb(int x)").unwrap();
    let reg = register(
        |args| Ok(Value::Number(args[0].as_f64().unwrap_or(0.0) + 1.0)),
        "BenchCb",
    )
    .unwrap();
    let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(reg.address()) };

    c.bench_function("callback_trampoline_round_trip", |b| {
        b.iter(|| black_box(f(black_box(7))));
    });

    unregister(reg).unwrap();
}

criterion_group!(
    benches,
    bench_sync_call,
    bench_bind_declaration,
    bench_encode_record,
    bench_decode_record,
    bench_decode_string,
    bench_callback_trampoline
);
criterion_main!(benches);
