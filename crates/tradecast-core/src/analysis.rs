//! Analysis results carried inside `data` frames.
//!
//! The transport treats payloads as opaque text. Consumers that want a typed
//! result run [`classify_payload`], which only promotes payloads that pass a
//! structural check; everything else stays raw text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Envelope;

/// Trade direction suggested by the worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Signal {
    Buy,
    Sell,
    Other(String),
}

impl From<String> for Signal {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Self::Buy,
            "sell" => Self::Sell,
            _ => Self::Other(s),
        }
    }
}

impl From<Signal> for String {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Buy => "buy".into(),
            Signal::Sell => "sell".into(),
            Signal::Other(s) => s,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    pub price: f64,
    pub volume_percent: f64,
    pub order_type: String,
}

/// A validated analysis produced by the upstream worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub symbol: String,
    #[serde(rename = "timestamp_utc", alias = "timestamp")]
    pub timestamp: String,
    #[serde(rename = "timeframe_detected", alias = "timeframe")]
    pub timeframe: String,
    pub signal: Signal,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: Vec<TakeProfitLevel>,
    #[serde(default)]
    pub order_quantity: Option<f64>,
    pub order_type: String,
    pub confidence: f64,
    pub advice: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl AnalysisResult {
    /// Range and finiteness checks that serde cannot express.
    fn is_consistent(&self) -> bool {
        let prices_finite = self.entry_price.is_finite()
            && self.stop_loss.is_finite()
            && self
                .take_profit
                .iter()
                .all(|tp| tp.price.is_finite() && tp.volume_percent.is_finite());
        prices_finite && (0.0..=1.0).contains(&self.confidence) && !self.symbol.trim().is_empty()
    }
}

/// Result of classifying a payload.
#[derive(Clone, Debug, PartialEq)]
pub enum AnalysisOutcome {
    Final(Box<AnalysisResult>),
    Raw(String),
}

impl AnalysisOutcome {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final(_))
    }

    pub fn as_result(&self) -> Option<&AnalysisResult> {
        match self {
            Self::Final(result) => Some(result),
            Self::Raw(_) => None,
        }
    }

    /// Classify an envelope, falling back to its raw text when it has no parsed payload.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        match &envelope.parsed {
            Some(value) => classify_payload(value, &envelope.data),
            None => Self::Raw(envelope.data.clone()),
        }
    }
}

/// Promote `value` to an [`AnalysisResult`] if it is structurally complete.
pub fn classify_payload(value: &Value, raw: &str) -> AnalysisOutcome {
    if !value.is_object() {
        return AnalysisOutcome::Raw(raw.to_string());
    }
    match serde_json::from_value::<AnalysisResult>(value.clone()) {
        Ok(result) if result.is_consistent() => AnalysisOutcome::Final(Box::new(result)),
        _ => AnalysisOutcome::Raw(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rune_sell() -> Value {
        json!({
            "symbol": "RUNEUSDT",
            "timestamp_utc": "2025-09-06T12:30:00Z",
            "timeframe_detected": "15m",
            "signal": "sell",
            "entry_price": 1.183,
            "stop_loss": 1.2,
            "take_profit": [
                { "price": 1.17, "volume_percent": 50, "order_type": "limit" },
                { "price": 1.16, "volume_percent": 30, "order_type": "limit" },
                { "price": 1.15, "volume_percent": 20, "order_type": "market" }
            ],
            "order_quantity": null,
            "order_type": "limit",
            "confidence": 0.7,
            "advice": "Place a LIMIT SELL at 1.183; STOP 1.200.",
            "issues": []
        })
    }

    #[test]
    fn complete_payload_is_final() {
        let value = rune_sell();
        let outcome = classify_payload(&value, &value.to_string());
        let result = outcome.as_result().expect("expected final result");
        assert_eq!(result.symbol, "RUNEUSDT");
        assert_eq!(result.signal, Signal::Sell);
        assert_eq!(result.take_profit.len(), 3);
        assert_eq!(result.order_quantity, None);
        assert_eq!(result.timeframe, "15m");
    }

    #[test]
    fn missing_stop_loss_stays_raw() {
        let mut value = rune_sell();
        value.as_object_mut().unwrap().remove("stop_loss");
        let raw = value.to_string();
        assert_eq!(classify_payload(&value, &raw), AnalysisOutcome::Raw(raw));
    }

    #[test]
    fn confidence_out_of_range_stays_raw() {
        let mut value = rune_sell();
        value["confidence"] = json!(1.5);
        assert!(!classify_payload(&value, "").is_final());
    }

    #[test]
    fn short_field_names_are_accepted() {
        let mut value = rune_sell();
        let obj = value.as_object_mut().unwrap();
        let ts = obj.remove("timestamp_utc").unwrap();
        let tf = obj.remove("timeframe_detected").unwrap();
        obj.insert("timestamp".into(), ts);
        obj.insert("timeframe".into(), tf);
        assert!(classify_payload(&value, "").is_final());
    }

    #[test]
    fn unknown_signal_is_preserved() {
        let mut value = rune_sell();
        value["signal"] = json!("hold");
        let outcome = classify_payload(&value, "");
        assert_eq!(outcome.as_result().unwrap().signal, Signal::Other("hold".into()));
    }

    #[test]
    fn non_object_stays_raw() {
        assert_eq!(
            classify_payload(&json!("just text"), "\"just text\""),
            AnalysisOutcome::Raw("\"just text\"".into())
        );
        assert!(!classify_payload(&json!({}), "{}").is_final());
    }

    #[test]
    fn envelope_without_payload_is_raw() {
        let env = Envelope::from_frame(
            crate::codec::RawFrame {
                event_type: "data".into(),
                id: None,
                data: vec!["Waiting for data...".into()],
            },
            true,
            None,
        );
        assert_eq!(
            AnalysisOutcome::from_envelope(&env),
            AnalysisOutcome::Raw("Waiting for data...".into())
        );
    }
}
