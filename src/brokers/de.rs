//! Flexible deserialization helpers
//!
//! Broker APIs send numbers as strings or numbers depending on the endpoint
//! (and sometimes on the day). These keep the wire structs strict about
//! meaning while tolerant about representation.

use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum Flexible {
    String(String),
    Int(i64),
    Float(f64),
}

impl Flexible {
    fn into_f64(self) -> Option<f64> {
        match self {
            Flexible::String(s) if s.trim().is_empty() => None,
            Flexible::String(s) => s.trim().parse().ok(),
            Flexible::Int(i) => Some(i as f64),
            Flexible::Float(f) => Some(f),
        }
    }

    fn into_u64(self) -> Option<u64> {
        match self {
            Flexible::String(s) if s.trim().is_empty() => None,
            Flexible::String(s) => {
                let s = s.trim();
                s.parse::<u64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u64))
            }
            Flexible::Int(i) => u64::try_from(i).ok(),
            Flexible::Float(f) if f >= 0.0 => Some(f as u64),
            Flexible::Float(_) => None,
        }
    }
}

/// Deserialize a value that could be either a string or an integer
pub fn string_or_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Flexible::deserialize(deserializer)?
        .into_u64()
        .ok_or_else(|| serde::de::Error::custom("expected a non-negative integer"))
}

/// Deserialize an optional value that could be either a string or a float
pub fn optional_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Flexible>::deserialize(deserializer)?.and_then(Flexible::into_f64))
}

/// Deserialize an optional value that could be either a string or an integer
pub fn optional_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Flexible>::deserialize(deserializer)?.and_then(Flexible::into_u64))
}
