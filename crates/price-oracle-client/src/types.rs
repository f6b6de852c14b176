//! Request and response types for the price API.

use serde::Deserialize;
use std::collections::HashMap;

/// Response of `GET /price?ids=...`.
///
/// Unknown ids come back as `null` entries.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceResponse {
    pub data: HashMap<String, Option<PriceData>>,
    #[serde(default, rename = "timeTaken")]
    pub time_taken: Option<f64>,
}

/// Price of a single asset in USD.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceData {
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    pub price: PriceValue,
}

/// Prices are quoted either as decimal strings or as JSON numbers.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PriceValue {
    Text(String),
    Number(f64),
}

impl PriceValue {
    /// Parse into a positive, finite USD price.
    pub fn to_usd(&self) -> Option<f64> {
        let value = match self {
            PriceValue::Text(s) => s.trim().parse::<f64>().ok()?,
            PriceValue::Number(n) => *n,
        };
        (value.is_finite() && value > 0.0).then_some(value)
    }
}

impl std::fmt::Display for PriceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PriceValue::Text(s) => write!(f, "{}", s),
            PriceValue::Number(n) => write!(f, "{}", n),
        }
    }
}
