//! Asynchronous dispatch integration tests.
//!
//! Native calls run on the worker pool; completions only execute inside
//! a pump on a managed thread. Tests therefore flag their progress from
//! the completion and pump until the flag flips.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::pump_until;
use ferrule_bridge::{
    bind_pointer, pump_timeout, wait_idle, BridgeError, MarshalingError, Value,
};

extern "C" fn slow_add(a: i32, b: i32) -> i32 {
    std::thread::sleep(Duration::from_millis(20));
    a.wrapping_add(b)
}

extern "C" fn fill_seven(slot: *mut i32) {
    unsafe { *slot = 7 }
}

fn bind_slow_add() -> ferrule_bridge::FunctionBinding {
    let addr = slow_add as extern "C" fn(i32, i32) -> i32 as usize;
    unsafe { bind_pointer(addr, "int slow_add(int a, int b)") }.unwrap()
}

#[cfg(unix)]
#[test]
fn test_async_matches_sync_result() {
    let libc = ferrule_bridge::load_self().unwrap();
    let atoi = libc.func("int atoi(const char *str)").unwrap();

    let sync = atoi.call(&mut [Value::string("424242")]).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let slot = Arc::new(Mutex::new(None));
    let (flag, captured) = (done.clone(), slot.clone());
    atoi.call_async(vec![Value::string("424242")], move |result| {
        *captured.lock().unwrap() = Some(result.unwrap().value);
        flag.store(true, Ordering::SeqCst);
    })
    .unwrap();

    pump_until(&done);
    assert_eq!(slot.lock().unwrap().take().unwrap(), sync);
    assert_eq!(sync, Value::Number(424242.0));
}

#[test]
fn test_batch_of_calls_all_complete() {
    let binding = bind_slow_add();
    let count = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let batch = 32;
    for i in 0..batch {
        let (count, done) = (count.clone(), done.clone());
        binding
            .call_async(
                vec![Value::Number(i as f64), Value::Number(100.0)],
                move |result| {
                    let value = result.unwrap().value.as_f64().unwrap_or(f64::NAN);
                    assert_eq!(value, (i + 100) as f64);
                    if count.fetch_add(1, Ordering::SeqCst) + 1 == batch {
                        done.store(true, Ordering::SeqCst);
                    }
                },
            )
            .unwrap();
    }

    // Synchronous calls through the same binding proceed while the
    // batch is in flight.
    for i in 0..4 {
        let r = binding
            .call(&mut [Value::Number(i as f64), Value::Number(1000.0)])
            .unwrap();
        assert_eq!(r, Value::Number((i + 1000) as f64));
    }

    wait_idle();
    // Another pumping thread may have grabbed the last completions, so
    // wait on the flag rather than on wait_idle's return.
    pump_until(&done);
    assert_eq!(count.load(Ordering::SeqCst), batch);
}

#[test]
fn test_failure_is_delivered_through_the_completion() {
    let binding = bind_slow_add();
    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();

    binding
        .call_async(vec![Value::Number(1.0)], move |result| {
            assert!(matches!(
                result,
                Err(BridgeError::Marshal(MarshalingError::Arity {
                    expected: 2,
                    got: 1,
                }))
            ));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

    pump_until(&done);
}

#[test]
fn test_cancel_suppresses_the_completion() {
    let binding = bind_slow_add();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();

    let call = binding
        .call_async(
            vec![Value::Number(1.0), Value::Number(2.0)],
            move |_| flag.store(true, Ordering::SeqCst),
        )
        .unwrap();
    assert!(call.cancel());
    assert!(call.is_cancelled());

    let deadline = Instant::now() + Duration::from_secs(5);
    while !call.is_completed() {
        assert!(Instant::now() < deadline, "call never finished");
        pump_timeout(Duration::from_millis(5));
    }
    // The queued completion is dropped undelivered wherever it drains.
    wait_idle();
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_output_parameters_ride_the_outcome() {
    let addr = fill_seven as extern "C" fn(*mut i32) as usize;
    let binding = unsafe { bind_pointer(addr, "void fill_seven(_Out_ int *slot)") }.unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let slot = Arc::new(Mutex::new(Vec::new()));
    let (flag, captured) = (done.clone(), slot.clone());
    binding
        .call_async(vec![Value::array(vec![Value::Null])], move |result| {
            *captured.lock().unwrap() = result.unwrap().args;
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

    pump_until(&done);
    let args = slot.lock().unwrap();
    assert_eq!(args[0], Value::array(vec![Value::Number(7.0)]));
}

#[cfg(unix)]
#[test]
fn test_variadic_call_dispatches_asynchronously() {
    let libc = ferrule_bridge::load_self().unwrap();
    let snprintf = libc
        .func("int snprintf(char *buf, size_t size, const char *fmt, ...)")
        .unwrap();

    let mut buf = [0u8; 32];
    let target = Value::pointer(
        buf.as_mut_ptr() as usize,
        ferrule_bridge::resolve("void *").unwrap(),
    );

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    snprintf
        .call_async_variadic(
            vec![
                target.clone(),
                Value::Number(buf.len() as f64),
                Value::string("n=%d"),
            ],
            vec![("int".into(), Value::Number(7.0))],
            move |result| {
                assert_eq!(result.unwrap().value, Value::Number(3.0));
                flag.store(true, Ordering::SeqCst);
            },
        )
        .unwrap();

    pump_until(&done);
    let text = ferrule_bridge::decode_slice(&target, 0, "char", buf.len()).unwrap();
    assert_eq!(text, Value::string("n=7"));
}
