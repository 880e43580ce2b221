//! Shared helpers for integration tests.
//!
//! Completion delivery and callback relays only happen inside a pump, so
//! tests that wait on either spin a bounded pump loop instead of sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pump events until `flag` flips, failing the test after five seconds.
pub fn pump_until(flag: &Arc<AtomicBool>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !flag.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "event never delivered");
        ferrule_bridge::pump_timeout(Duration::from_millis(10));
    }
}
