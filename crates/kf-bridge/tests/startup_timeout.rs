//! Shared loop startup that misses its grace period
//!
//! Lives in its own test binary: the first acquire in the process has to
//! be the one that fails.

use std::time::Duration;

use kf_bridge::{run_blocking, LoopOwner};
use kf_core::config::BridgeConfig;
use kf_core::BridgeError;

#[test]
fn test_startup_grace_exceeded_then_recovers() {
    let impatient = BridgeConfig {
        startup_grace: Duration::ZERO,
        ..BridgeConfig::default()
    };

    match LoopOwner::acquire_with(&impatient) {
        Err(BridgeError::Startup { waited, reason }) => {
            assert_eq!(waited, Duration::ZERO);
            assert!(!reason.is_empty());
        }
        other => panic!("expected a startup failure, got {:?}", other),
    }
    assert_eq!(LoopOwner::scheduler_threads_started(), 0);
    assert!(!LoopOwner::shutdown(), "failed start must not install a loop");

    let handle = LoopOwner::acquire().unwrap();
    assert!(handle.is_running());
    assert_eq!(LoopOwner::scheduler_threads_started(), 1);

    let value: Result<u32, BridgeError> = run_blocking(async { Ok(3) }, Some(Duration::from_secs(5)));
    assert_eq!(value, Ok(3));

    // Later acquires reuse the loop whatever grace they ask for
    let again = LoopOwner::acquire_with(&impatient).unwrap();
    assert_eq!(again.thread_id(), handle.thread_id());
    assert_eq!(LoopOwner::scheduler_threads_started(), 1);
}
