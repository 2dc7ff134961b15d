//! Shared serde helpers for the worker wire contract.

/// Serde support for human-readable duration fields.
///
/// Accepts `"500ms"`, `"30s"`, `"1m"`, `"2h"` strings as well as the
/// `{secs, nanos}` object form that `std::time::Duration` serializes to.
/// Serializes back to the whole-second string form.
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        use serde_json::Value;

        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => parse_duration_string(&s).map_err(Error::custom),
            Value::Number(n) => {
                // Bare numbers are seconds
                let secs = n
                    .as_u64()
                    .ok_or_else(|| Error::custom("duration must be a non-negative integer"))?;
                Ok(Duration::from_secs(secs))
            }
            Value::Object(obj) => {
                let secs = obj
                    .get("secs")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| Error::custom("missing 'secs' field"))?;
                let nanos = obj.get("nanos").and_then(|v| v.as_u64()).unwrap_or(0);
                Ok(Duration::new(secs, nanos as u32))
            }
            _ => Err(Error::custom("invalid duration format")),
        }
    }

    pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration string".to_string());
        }
        if let Some(stripped) = s.strip_suffix("ms") {
            let num: u64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            return Ok(Duration::from_millis(num));
        }
        if let Some(stripped) = s.strip_suffix('s') {
            let num: f64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            let secs = num.trunc() as u64;
            let nanos = ((num.fract() * 1_000_000_000.0).round()) as u32;
            return Ok(Duration::new(secs, nanos));
        }
        if let Some(stripped) = s.strip_suffix('m') {
            let num: u64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            return Ok(Duration::from_secs(num * 60));
        }
        if let Some(stripped) = s.strip_suffix('h') {
            let num: u64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            return Ok(Duration::from_secs(num * 3600));
        }
        Err(format!("unrecognized duration: {s}"))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_all_suffixes() {
            assert_eq!(
                parse_duration_string("500ms").unwrap(),
                Duration::from_millis(500)
            );
            assert_eq!(parse_duration_string("30s").unwrap(), Duration::from_secs(30));
            assert_eq!(parse_duration_string("1m").unwrap(), Duration::from_secs(60));
            assert_eq!(
                parse_duration_string("4h").unwrap(),
                Duration::from_secs(14_400)
            );
        }

        #[test]
        fn rejects_garbage() {
            assert!(parse_duration_string("").is_err());
            assert!(parse_duration_string("30x").is_err());
            assert!(parse_duration_string("abc").is_err());
        }
    }
}
