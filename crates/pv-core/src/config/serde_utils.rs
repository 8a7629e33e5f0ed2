//! Serde helpers for configuration files

/// `Duration` fields written as seconds.
///
/// Whole seconds are written as integers, anything finer as a float, so
/// `backoff_min = 1` and `backoff_min = 0.25` both read back as written.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Tuning {
///     #[serde(with = "pv_core::config::serde_utils::duration_secs")]
///     backoff_max: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Whole(u64),
        Fraction(f64),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_u64(duration.as_secs())
        } else {
            serializer.serialize_f64(duration.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Seconds::deserialize(deserializer)? {
            Seconds::Whole(secs) => Ok(Duration::from_secs(secs)),
            Seconds::Fraction(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|_| D::Error::custom(format!("invalid number of seconds: {}", secs))),
        }
    }
}
