//! Payload decoding and enrichment for the worker pipeline.
//!
//! Messages arrive as opaque bytes expected to hold a JSON object. Decoding
//! produces a [`Record`]; enrichment stamps it with the receipt time and
//! derives the identifier used in log lines. Conversion to BSON happens at
//! the sink boundary via [`EnrichedRecord::to_document`].

use chrono::{DateTime, Utc};
use mongodb::bson::{self, Document};
use serde_json::{Map, Value};
use thiserror::Error;

/// Field injected into every stored document
pub const RECEIVED_AT_FIELD: &str = "receivedAt";

/// Field used to derive the log identifier
pub const USER_ID_FIELD: &str = "userId";

/// Placeholder identifier for records without a `userId` field
pub const UNKNOWN_USER: &str = "<no userId>";

/// Errors that can occur while decoding a payload
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Failed to parse payload: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Payload is not a key-value mapping (got {0})")]
    NotAMapping(&'static str),
}

/// A decoded message payload: a JSON object, keys unique by construction
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

/// Decode a raw payload into a [`Record`].
///
/// Empty payloads are a no-op and yield `Ok(None)`; anything that does not
/// parse into a JSON object is a [`DecodeError`]. Callers treat decode
/// failures as per-message, not fatal.
pub fn decode(payload: &[u8]) -> Result<Option<Record>, DecodeError> {
    if payload.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_slice(payload)?;
    match value {
        Value::Object(fields) => Ok(Some(Record { fields })),
        other => Err(DecodeError::NotAMapping(json_type_name(&other))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A record stamped with its receipt time
#[derive(Debug, Clone)]
pub struct EnrichedRecord {
    fields: Map<String, Value>,
    received_at: DateTime<Utc>,
}

/// Stamp a decoded record with the current wall-clock time.
///
/// Total function: enrichment never fails and has no side effects beyond
/// the timestamp it carries into the stored document.
pub fn enrich(record: Record) -> EnrichedRecord {
    EnrichedRecord {
        fields: record.fields,
        received_at: Utc::now(),
    }
}

impl EnrichedRecord {
    /// Receipt timestamp assigned at enrichment
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Identifier used in log lines: the `userId` field if present,
    /// otherwise a fixed placeholder.
    pub fn display_id(&self) -> String {
        match self.fields.get(USER_ID_FIELD) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => UNKNOWN_USER.to_string(),
        }
    }

    /// Convert to a BSON document for insertion.
    ///
    /// The stored document carries every decoded field plus exactly one
    /// `receivedAt` datetime. A producer-supplied `receivedAt` is discarded;
    /// the field is server-assigned only.
    pub fn to_document(&self) -> Result<Document, bson::ser::Error> {
        let mut doc = bson::to_document(&self.fields)?;
        doc.remove(RECEIVED_AT_FIELD);
        doc.insert(
            RECEIVED_AT_FIELD,
            bson::DateTime::from_chrono(self.received_at),
        );
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::Bson;

    #[test]
    fn test_decode_object() {
        let record = decode(br#"{"city":"SP","tempC":28,"userId":"u1"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(record.fields().get("city"), Some(&Value::String("SP".into())));
        assert_eq!(record.fields().get("tempC"), Some(&Value::from(28)));
    }

    #[test]
    fn test_decode_empty_payload_is_skipped() {
        assert!(decode(b"").unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        assert!(matches!(decode(b"{not json"), Err(DecodeError::Parse(_))));
    }

    #[test]
    fn test_decode_rejects_non_mapping() {
        match decode(b"[1,2,3]") {
            Err(DecodeError::NotAMapping(kind)) => assert_eq!(kind, "array"),
            other => panic!("expected NotAMapping, got {:?}", other),
        }
    }

    #[test]
    fn test_enrich_stamps_receipt_time() {
        let before = Utc::now();
        let record = decode(br#"{"city":"SP"}"#).unwrap().unwrap();
        let enriched = enrich(record);
        assert!(enriched.received_at() >= before);
        assert!(enriched.received_at() <= Utc::now());
    }

    #[test]
    fn test_display_id_uses_user_id() {
        let enriched = enrich(decode(br#"{"userId":"u1"}"#).unwrap().unwrap());
        assert_eq!(enriched.display_id(), "u1");
    }

    #[test]
    fn test_display_id_renders_non_string_user_id() {
        let enriched = enrich(decode(br#"{"userId":42}"#).unwrap().unwrap());
        assert_eq!(enriched.display_id(), "42");
    }

    #[test]
    fn test_display_id_placeholder_without_user_id() {
        let enriched = enrich(decode(br#"{"city":"SP"}"#).unwrap().unwrap());
        assert_eq!(enriched.display_id(), UNKNOWN_USER);
    }

    #[test]
    fn test_to_document_carries_fields_and_timestamp() {
        let enriched = enrich(
            decode(br#"{"city":"SP","tempC":28,"userId":"u1"}"#)
                .unwrap()
                .unwrap(),
        );
        let doc = enriched.to_document().unwrap();
        assert_eq!(doc.get_str("city").unwrap(), "SP");
        assert_eq!(doc.get_str("userId").unwrap(), "u1");
        assert_eq!(
            doc.get_datetime(RECEIVED_AT_FIELD).unwrap(),
            &bson::DateTime::from_chrono(enriched.received_at())
        );
    }

    #[test]
    fn test_to_document_empty_mapping_has_only_timestamp() {
        let enriched = enrich(decode(b"{}").unwrap().unwrap());
        let doc = enriched.to_document().unwrap();
        assert_eq!(doc.len(), 1);
        assert!(doc.get_datetime(RECEIVED_AT_FIELD).is_ok());
    }

    #[test]
    fn test_producer_supplied_received_at_is_discarded() {
        let enriched = enrich(
            decode(br#"{"receivedAt":"spoofed","userId":"u1"}"#)
                .unwrap()
                .unwrap(),
        );
        let doc = enriched.to_document().unwrap();
        assert_eq!(
            doc.iter()
                .filter(|(key, _)| key.as_str() == RECEIVED_AT_FIELD)
                .count(),
            1
        );
        assert!(matches!(
            doc.get(RECEIVED_AT_FIELD),
            Some(Bson::DateTime(_))
        ));
    }

    #[test]
    fn test_nested_mapping_round_trips_to_bson() {
        let enriched = enrich(
            decode(br#"{"reading":{"tempC":28.5,"valid":true},"tags":null}"#)
                .unwrap()
                .unwrap(),
        );
        let doc = enriched.to_document().unwrap();
        let reading = doc.get_document("reading").unwrap();
        assert_eq!(reading.get_f64("tempC").unwrap(), 28.5);
        assert!(reading.get_bool("valid").unwrap());
        assert_eq!(doc.get("tags"), Some(&Bson::Null));
    }
}
