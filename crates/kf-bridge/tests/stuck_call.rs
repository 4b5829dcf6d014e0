//! An operation that never yields cannot honor cancellation
//!
//! Blocks the shared loop thread on purpose, so it gets its own binary.

use std::time::{Duration, Instant};

use kf_bridge::CallForwarder;
use kf_core::config::BridgeConfig;
use kf_core::BridgeError;

#[test]
fn test_uncancellable_operation_reports_stuck() {
    let config = BridgeConfig {
        cancel_grace: Duration::from_millis(50),
        ..BridgeConfig::default()
    };
    let forwarder = CallForwarder::with_config(&config).unwrap();

    let started = Instant::now();
    let result: Result<(), BridgeError> = forwarder.call(
        async {
            // Parks the loop thread without ever reaching an await point
            std::thread::sleep(Duration::from_millis(400));
            Ok(())
        },
        Some(Duration::from_millis(50)),
    );

    assert!(matches!(result, Err(BridgeError::ForwarderStuck { .. })));
    assert!(started.elapsed() < Duration::from_millis(400));

    // The loop recovers once the sleeper returns
    let after: Result<u8, BridgeError> =
        forwarder.call(async { Ok(9) }, Some(Duration::from_secs(5)));
    assert_eq!(after, Ok(9));
}
