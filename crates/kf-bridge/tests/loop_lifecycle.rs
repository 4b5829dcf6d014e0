//! Shared loop shutdown and restart
//!
//! Lives in its own test binary because it tears down the process-wide
//! loop, which would disturb every other test sharing it.

use std::time::Duration;

use kf_bridge::{run_blocking, LoopOwner};
use kf_core::BridgeError;

#[test]
fn test_shutdown_then_reacquire_starts_fresh_loop() {
    let first = LoopOwner::acquire().unwrap();
    let second = first.clone();
    assert_eq!(first.borrowers(), 2);
    LoopOwner::release(second);
    assert_eq!(first.borrowers(), 1);

    let value: Result<u32, BridgeError> = run_blocking(async { Ok(1) }, None);
    assert_eq!(value, Ok(1));
    assert_eq!(LoopOwner::scheduler_threads_started(), 1);

    let old_thread = first.thread_id();
    assert!(LoopOwner::shutdown());
    assert!(!first.is_running());
    assert!(!LoopOwner::shutdown(), "second shutdown has nothing to stop");

    let fresh = LoopOwner::acquire().unwrap();
    assert!(fresh.is_running());
    assert_ne!(fresh.thread_id(), old_thread);
    assert_eq!(LoopOwner::scheduler_threads_started(), 2);

    let value: Result<u32, BridgeError> =
        run_blocking(async { Ok(2) }, Some(Duration::from_secs(5)));
    assert_eq!(value, Ok(2));
    assert_eq!(fresh.in_flight(), 0);
}
