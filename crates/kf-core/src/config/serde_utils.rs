//! Integer duration encodings for configuration files
//!
//! TOML has no duration type, so durations are written as plain integers.
//! Pick the unit per field with `#[serde(with = "...")]`:
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Timeouts {
//!     #[serde(with = "kf_core::config::serde_utils::duration_secs")]
//!     connect: Duration,
//!     #[serde(with = "kf_core::config::serde_utils::duration_millis")]
//!     grace: Duration,
//! }
//! ```

macro_rules! duration_as_integer {
    ($(#[$meta:meta])* $name:ident, $to:expr, $from:expr) => {
        $(#[$meta])*
        pub mod $name {
            use serde::{Deserialize, Deserializer, Serializer};
            use std::time::Duration;

            pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let to: fn(&Duration) -> u64 = $to;
                serializer.serialize_u64(to(duration))
            }

            pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
            where
                D: Deserializer<'de>,
            {
                let from: fn(u64) -> Duration = $from;
                Ok(from(u64::deserialize(deserializer)?))
            }
        }
    };
}

duration_as_integer!(
    /// Whole seconds; sub-second parts are dropped on write
    duration_secs,
    |d| d.as_secs(),
    std::time::Duration::from_secs
);

duration_as_integer!(
    /// Milliseconds, for grace periods and retry delays
    duration_millis,
    |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX),
    std::time::Duration::from_millis
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "duration_secs")]
        connect: Duration,
        #[serde(with = "duration_millis")]
        grace: Duration,
    }

    #[test]
    fn test_units_per_field() {
        let timeouts = Timeouts {
            connect: Duration::from_secs(30),
            grace: Duration::from_millis(250),
        };
        let json = serde_json::to_string(&timeouts).unwrap();
        assert_eq!(json, r#"{"connect":30,"grace":250}"#);

        let parsed: Timeouts = serde_json::from_str(r#"{"connect":60,"grace":1500}"#).unwrap();
        assert_eq!(parsed.connect, Duration::from_secs(60));
        assert_eq!(parsed.grace, Duration::from_millis(1500));
    }

    #[test]
    fn test_seconds_drop_fraction() {
        let timeouts = Timeouts {
            connect: Duration::from_millis(2900),
            grace: Duration::ZERO,
        };
        let json = serde_json::to_string(&timeouts).unwrap();
        assert_eq!(json, r#"{"connect":2,"grace":0}"#);
    }

    #[test]
    fn test_negative_is_rejected() {
        assert!(serde_json::from_str::<Timeouts>(r#"{"connect":-1,"grace":0}"#).is_err());
    }
}
