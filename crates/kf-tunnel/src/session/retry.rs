//! Transport negotiation with retries

use std::time::Duration;

use kf_core::config::BackoffConfig;
use kf_core::traits::{BoxedTransport, Negotiator};
use kf_core::{NegotiationError, Target};

/// Negotiate an upgraded transport, retrying transient failures
///
/// Rejections are returned at once; other failures are retried until
/// `config.max_attempts` attempts have been made. The wait before retry
/// `n` is `initial * multiplier^(n-1)`, capped at `max`, plus up to
/// `jitter` of itself at random.
pub async fn negotiate_with_retry(
    negotiator: &dyn Negotiator,
    target: &Target,
    remote_port: u16,
    config: &BackoffConfig,
) -> Result<BoxedTransport, NegotiationError> {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match negotiator.negotiate_upgrade(target, remote_port).await {
            Ok(transport) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Negotiated transport to {} after retrying", target);
                }
                return Ok(transport);
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            tracing::warn!("Upgrade to {} rejected, not retrying: {}", target, err);
            return Err(err);
        }
        if attempt >= max_attempts {
            tracing::warn!(attempt, "Giving up on {}: {}", target, err);
            return Err(err);
        }

        let delay = retry_delay(config, attempt, rand::random::<f64>());
        tracing::warn!(attempt, ?delay, "Negotiation with {} failed: {}", target, err);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Wait after failed attempt `attempt`; `unit` in `[0, 1)` scales the jitter
///
/// Never panics, whatever `config` holds: out-of-range products saturate
/// at `config.max`.
fn retry_delay(config: &BackoffConfig, attempt: u32, unit: f64) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let grown = config.initial.as_secs_f64() * config.multiplier.powi(exponent);
    let base = Duration::try_from_secs_f64(grown).map_or(config.max, |d| d.min(config.max));

    let spread = base.as_secs_f64() * config.jitter.clamp(0.0, 1.0) * unit;
    base.saturating_add(Duration::try_from_secs_f64(spread).unwrap_or_default())
}
