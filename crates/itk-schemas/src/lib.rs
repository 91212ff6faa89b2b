//! Data model for document-intake CRM records.
//!
//! Payloads stay as open `serde_json::Value` maps — only the enrichment
//! engine's fixed dotted paths are ever interpreted — while the record
//! envelope around them is typed. All structs take serde defaults so
//! partially populated records round-trip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `true` for a JSON object with at least one key.
///
/// Payload fallback chains treat an empty object the same as an absent one,
/// so "is there an edited payload" style checks must use this rather than
/// `Value::is_object`.
pub fn non_empty_object(value: &Value) -> bool {
    value.as_object().map_or(false, |map| !map.is_empty())
}

// ---------------------------------------------------------------------------
// Identifiers & status
// ---------------------------------------------------------------------------

/// Natural identity derived from the payload: the declared document number
/// and full name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentIdentifiers {
    #[serde(default)]
    pub document_number: String,
    #[serde(default)]
    pub name: String,
}

/// Lifecycle status of an intake record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Confirmed,
    /// Absorbed into another record; `merged_into_document_id` points there.
    Merged,
    #[default]
    Unknown,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Confirmed => "confirmed",
            DocumentStatus::Merged => "merged",
            DocumentStatus::Unknown => "unknown",
        }
    }

    /// Lossy parse: anything unrecognized maps to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "uploaded" => DocumentStatus::Uploaded,
            "confirmed" => DocumentStatus::Confirmed,
            "merged" => DocumentStatus::Merged,
            _ => DocumentStatus::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// Family links
// ---------------------------------------------------------------------------

/// Directed typed edge between two document records.
///
/// Links are stored as ids, never embedded records; the graph may contain
/// cycles and traversal is never transitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyLink {
    #[serde(default)]
    pub relation: String,
    #[serde(default)]
    pub related_document_id: String,
    #[serde(default)]
    pub document_number: String,
    #[serde(default)]
    pub created_from_reference: bool,
}

// ---------------------------------------------------------------------------
// Enrichment reporting
// ---------------------------------------------------------------------------

/// Why a suggested value was skipped during fill-empty enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Current and suggested values match case-insensitively.
    Equal,
    /// A different value is already present; enrichment never overwrites.
    Conflict,
}

/// One applied or skipped field from a fill-empty enrichment pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentFieldRow {
    /// Dotted payload path, e.g. `identificacion.primer_apellido`.
    pub field: String,
    #[serde(default)]
    pub current_value: String,
    #[serde(default)]
    pub suggested_value: String,
    /// Source document the suggestion came from.
    #[serde(default)]
    pub source: String,
    /// Present on skipped rows only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentLog {
    #[serde(default)]
    pub applied_fields: Vec<EnrichmentFieldRow>,
    #[serde(default)]
    pub skipped_fields: Vec<EnrichmentFieldRow>,
}

// ---------------------------------------------------------------------------
// Source provenance
// ---------------------------------------------------------------------------

/// Where an intake record came from. `source_kind` is an opaque tag; the
/// historical values are carried verbatim and never validated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(default)]
    pub source_kind: String,
    #[serde(default)]
    pub origin_document_id: String,
    #[serde(default)]
    pub original_filename: String,
    #[serde(default)]
    pub stored_path: String,
    #[serde(default)]
    pub preview_url: String,
}

// ---------------------------------------------------------------------------
// Document record
// ---------------------------------------------------------------------------

/// A person-centric intake record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    #[serde(default)]
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub identifiers: DocumentIdentifiers,
    /// Payload as extracted by OCR.
    #[serde(default)]
    pub ocr_payload: Value,
    /// Operator-confirmed payload, when one exists.
    #[serde(default)]
    pub edited_payload: Option<Value>,
    /// Edited payload when present, else the OCR payload.
    #[serde(default)]
    pub effective_payload: Value,
    #[serde(default)]
    pub ocr_document: Value,
    #[serde(default)]
    pub source: SourceInfo,
    #[serde(default)]
    pub missing_fields: Vec<String>,
    #[serde(default)]
    pub manual_steps_required: Vec<String>,
    #[serde(default)]
    pub form_url: String,
    #[serde(default)]
    pub target_url: String,
    #[serde(default)]
    pub browser_session_id: String,
    #[serde(default)]
    pub identity_key: String,
    #[serde(default)]
    pub identity_match_found: bool,
    #[serde(default)]
    pub identity_source_document_id: String,
    #[serde(default)]
    pub enrichment_preview: Vec<EnrichmentFieldRow>,
    #[serde(default)]
    pub enrichment_log: EnrichmentLog,
    #[serde(default)]
    pub family_links: Vec<FamilyLink>,
    #[serde(default)]
    pub merged_into_document_id: String,
}

impl DocumentRecord {
    /// Empty record shell with stable id and creation time.
    pub fn new(document_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            document_id: document_id.into(),
            status: DocumentStatus::Unknown,
            created_at: now,
            updated_at: now,
            identifiers: DocumentIdentifiers::default(),
            ocr_payload: Value::Null,
            edited_payload: None,
            effective_payload: Value::Null,
            ocr_document: Value::Null,
            source: SourceInfo::default(),
            missing_fields: Vec::new(),
            manual_steps_required: Vec::new(),
            form_url: String::new(),
            target_url: String::new(),
            browser_session_id: String::new(),
            identity_key: String::new(),
            identity_match_found: false,
            identity_source_document_id: String::new(),
            enrichment_preview: Vec::new(),
            enrichment_log: EnrichmentLog::default(),
            family_links: Vec::new(),
            merged_into_document_id: String::new(),
        }
    }

    /// Current best view of the document payload: the stored effective
    /// payload, else the edited payload, else the OCR payload. Empty maps
    /// count as absent.
    pub fn effective(&self) -> &Value {
        if non_empty_object(&self.effective_payload) {
            return &self.effective_payload;
        }
        if let Some(edited) = &self.edited_payload {
            if non_empty_object(edited) {
                return edited;
            }
        }
        &self.ocr_payload
    }
}

// ---------------------------------------------------------------------------
// Summary projection
// ---------------------------------------------------------------------------

/// Listing row returned by repository searches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub document_id: String,
    #[serde(default)]
    pub document_number: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: DocumentStatus,
    #[serde(default)]
    pub has_edited: bool,
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_parse_is_lossy() {
        assert_eq!(DocumentStatus::parse("uploaded"), DocumentStatus::Uploaded);
        assert_eq!(DocumentStatus::parse("confirmed"), DocumentStatus::Confirmed);
        assert_eq!(DocumentStatus::parse("merged"), DocumentStatus::Merged);
        assert_eq!(DocumentStatus::parse("???"), DocumentStatus::Unknown);
        assert_eq!(DocumentStatus::parse(""), DocumentStatus::Unknown);
    }

    #[test]
    fn effective_prefers_stored_then_edited_then_ocr() {
        let now = Utc::now();
        let mut record = DocumentRecord::new("doc-1", now);
        record.ocr_payload = json!({"identificacion": {"nombre": "OCR"}});
        assert_eq!(record.effective(), &record.ocr_payload);

        record.edited_payload = Some(json!({"identificacion": {"nombre": "EDITED"}}));
        assert_eq!(
            record.effective(),
            record.edited_payload.as_ref().unwrap()
        );

        record.effective_payload = json!({"identificacion": {"nombre": "EFFECTIVE"}});
        assert_eq!(record.effective(), &record.effective_payload);
    }

    #[test]
    fn empty_objects_are_skipped_in_the_effective_chain() {
        let now = Utc::now();
        let mut record = DocumentRecord::new("doc-1", now);
        record.ocr_payload = json!({"identificacion": {"nombre": "OCR"}});
        record.edited_payload = Some(json!({}));
        record.effective_payload = json!({});
        assert_eq!(record.effective(), &record.ocr_payload);
    }

    #[test]
    fn partially_populated_record_json_round_trips() {
        let raw = json!({
            "document_id": "doc-9",
            "status": "confirmed",
            "created_at": "2026-02-24T10:00:00Z",
            "updated_at": "2026-02-24T11:00:00Z",
            "family_links": [
                {"relation": "familiar_que_da_derecho", "related_document_id": "doc-2"}
            ]
        });
        let record: DocumentRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.status, DocumentStatus::Confirmed);
        assert_eq!(record.family_links.len(), 1);
        assert_eq!(record.family_links[0].document_number, "");
        assert!(!record.family_links[0].created_from_reference);
        assert_eq!(record.edited_payload, None);
        assert_eq!(record.merged_into_document_id, "");
    }

    #[test]
    fn skipped_row_reason_serializes_snake_case() {
        let row = EnrichmentFieldRow {
            field: "identificacion.nombre".to_string(),
            current_value: "ALFA".to_string(),
            suggested_value: "BETA".to_string(),
            source: "doc-2".to_string(),
            reason: Some(SkipReason::Conflict),
        };
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["reason"], json!("conflict"));

        let applied = EnrichmentFieldRow {
            reason: None,
            ..row
        };
        let value = serde_json::to_value(&applied).unwrap();
        assert!(value.get("reason").is_none(), "applied rows omit reason");
    }
}
