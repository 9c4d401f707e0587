//! Provider bridge: execution-report contract and frame codec.
//!
//! The provider speaks length-prefixed frames (4-byte big-endian length +
//! msgpack map) whose keys are FIX-like tag strings. Reports are normalized
//! once at the listener and travel the queues as JSON.

pub mod dispatcher;
pub mod listener;

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

pub const TAG_CL_ORD_ID: &str = "11";
pub const TAG_EXEC_ID: &str = "17";
pub const TAG_ORD_STATUS: &str = "39";
pub const TAG_AVG_PX: &str = "6";
pub const TAG_CUM_QTY: &str = "14";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrdStatus {
    #[serde(rename = "EXECUTED")]
    Executed,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl OrdStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrdStatus::Executed => "EXECUTED",
            OrdStatus::Rejected => "REJECTED",
            OrdStatus::Cancelled => "CANCELLED",
        }
    }

    /// Accepts both the provider's word form and raw FIX tag-39 codes
    /// (2 = filled, 8 = rejected, 4 = canceled).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "EXECUTED" | "FILLED" | "2" => Some(OrdStatus::Executed),
            "REJECTED" | "8" => Some(OrdStatus::Rejected),
            "CANCELLED" | "CANCELED" | "4" => Some(OrdStatus::Cancelled),
            _ => None,
        }
    }
}

/// Normalized execution report. Price and quantity stay strings on the wire
/// so nothing rounds between the listener and the workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub order_id: String,
    pub exec_id: String,
    pub ord_status: String,
    pub avg_px: Option<String>,
    pub cum_qty: Option<String>,
    pub ts_ms: i64,
    pub raw: Value,
}

impl ExecutionReport {
    pub fn status(&self) -> Option<OrdStatus> {
        OrdStatus::parse(&self.ord_status)
    }

    pub fn avg_px_dec(&self) -> Option<Decimal> {
        self.avg_px.as_deref().and_then(|v| v.parse().ok())
    }

    pub fn cum_qty_dec(&self) -> Option<Decimal> {
        self.cum_qty.as_deref().and_then(|v| v.parse().ok())
    }
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts either `{ "fields": {...} }` or a flat tag map, with keys
/// stringified; unknown tags are preserved in `raw`.
pub fn normalize_report(msg: &Value, ts_ms: i64) -> Result<ExecutionReport, EngineError> {
    let fields = match msg.get("fields") {
        Some(Value::Object(f)) if !f.is_empty() => f,
        _ => msg
            .as_object()
            .ok_or_else(|| EngineError::Malformed("provider frame is not a map".into()))?,
    };
    // Stable key order keeps replayed frames byte-comparable.
    let raw: BTreeMap<String, Value> = fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

    let tag = |t: &str| fields.get(t).and_then(value_to_string);
    let order_id = tag(TAG_CL_ORD_ID)
        .ok_or_else(|| EngineError::Malformed("report missing tag 11 (ClOrdID)".into()))?;
    let exec_id = tag(TAG_EXEC_ID)
        .ok_or_else(|| EngineError::Malformed("report missing tag 17 (ExecID)".into()))?;
    let ord_status = tag(TAG_ORD_STATUS)
        .ok_or_else(|| EngineError::Malformed("report missing tag 39 (OrdStatus)".into()))?;

    Ok(ExecutionReport {
        order_id,
        exec_id,
        ord_status,
        avg_px: tag(TAG_AVG_PX),
        cum_qty: tag(TAG_CUM_QTY),
        ts_ms,
        raw: serde_json::to_value(raw).unwrap_or(Value::Null),
    })
}

/// Decodes one frame payload (length prefix already consumed).
pub fn decode_frame(payload: &[u8]) -> Result<Value, EngineError> {
    rmp_serde::from_slice(payload)
        .map_err(|e| EngineError::Malformed(format!("msgpack decode: {e}")))
}

/// Encodes a map into a length-prefixed frame (used by the test harness and
/// the local provider simulator).
pub fn encode_frame(value: &Value) -> Result<Vec<u8>, EngineError> {
    let body = rmp_serde::to_vec(value)
        .map_err(|e| EngineError::Malformed(format!("msgpack encode: {e}")))?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_flat_tag_map() {
        let msg = json!({
            "11": "1700000000000101",
            "17": "exec-9",
            "39": "EXECUTED",
            "6": "1.20002",
            "14": 1.0,
            "58": "fill note",
        });
        let r = normalize_report(&msg, 1_700_000_000_123).unwrap();
        assert_eq!(r.order_id, "1700000000000101");
        assert_eq!(r.exec_id, "exec-9");
        assert_eq!(r.status(), Some(OrdStatus::Executed));
        assert_eq!(r.avg_px_dec().unwrap().to_string(), "1.20002");
        assert_eq!(r.raw["58"], "fill note");
    }

    #[test]
    fn normalizes_wrapped_fields() {
        let msg = json!({"fields": {"11": "7", "17": "e1", "39": "8"}});
        let r = normalize_report(&msg, 0).unwrap();
        assert_eq!(r.status(), Some(OrdStatus::Rejected));
    }

    #[test]
    fn missing_required_tag_is_malformed() {
        let msg = json!({"17": "e1", "39": "2"});
        assert!(normalize_report(&msg, 0).is_err());
    }

    #[test]
    fn frame_roundtrip() {
        let msg = json!({"11": "42", "17": "e", "39": "EXECUTED"});
        let frame = encode_frame(&msg).unwrap();
        let (hdr, body) = frame.split_at(4);
        assert_eq!(u32::from_be_bytes(hdr.try_into().unwrap()) as usize, body.len());
        let decoded = decode_frame(body).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn fix_codes_map_to_statuses() {
        assert_eq!(OrdStatus::parse("2"), Some(OrdStatus::Executed));
        assert_eq!(OrdStatus::parse("8"), Some(OrdStatus::Rejected));
        assert_eq!(OrdStatus::parse("4"), Some(OrdStatus::Cancelled));
        assert_eq!(OrdStatus::parse("0"), None);
    }
}
