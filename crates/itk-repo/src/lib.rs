//! Repository boundary for document persistence.
//!
//! This crate defines **only** the contract the enrichment engine depends
//! on, plus the record-assembly and normalization helpers every backend
//! must agree on. No storage technology lives here: a backend may be a
//! document store, a local JSON directory, or the in-memory double used by
//! tests — the engine never knows which.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

use itk_schemas::{
    non_empty_object, DocumentIdentifiers, DocumentRecord, DocumentStatus, DocumentSummary,
    EnrichmentFieldRow, EnrichmentLog, FamilyLink, SourceInfo,
};

/// Hard cap on `search_documents` result sizes.
pub const SEARCH_LIMIT_MAX: usize = 200;

// ---------------------------------------------------------------------------
// Operation parameter types
// ---------------------------------------------------------------------------

/// Parameters for `upsert_from_upload`: a fresh intake of a document,
/// creating the record or overwriting a previous intake of the same id.
#[derive(Debug, Clone, Default)]
pub struct UploadRecord {
    pub document_id: String,
    pub payload: Value,
    pub ocr_document: Value,
    pub source: SourceInfo,
    pub missing_fields: Vec<String>,
    pub manual_steps_required: Vec<String>,
    pub form_url: String,
    pub target_url: String,
    pub identity_match_found: bool,
    pub identity_source_document_id: String,
    /// `Some` replaces the stored preview; `None` keeps whatever is there.
    pub enrichment_preview: Option<Vec<EnrichmentFieldRow>>,
}

/// Shallow partial update for `update_document_fields`. Only `Some` fields
/// are written; implementations always bump `updated_at`.
#[derive(Debug, Clone, Default)]
pub struct DocumentFieldUpdates {
    pub status: Option<DocumentStatus>,
    pub identity_key: Option<String>,
    pub identity_match_found: Option<bool>,
    pub identity_source_document_id: Option<String>,
    pub enrichment_preview: Option<Vec<EnrichmentFieldRow>>,
    pub enrichment_log: Option<EnrichmentLog>,
    pub family_links: Option<Vec<FamilyLink>>,
    pub merged_into_document_id: Option<String>,
    pub browser_session_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Repository contract
// ---------------------------------------------------------------------------

/// Capability contract over document persistence.
///
/// Implementations must be `Send + Sync` trait objects and honor each
/// operation's semantics atomically per call. List outputs are finite and
/// newest-first where specified.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>>;

    /// Recent documents, newest first, deduplicated by normalized identity
    /// key. A non-empty `query` filters case-insensitively by substring
    /// against name and document number.
    async fn search_documents(&self, query: &str, limit: usize)
        -> Result<Vec<DocumentSummary>>;

    /// Most recent record whose stored document number matches any of
    /// `identities` under uppercase-alphanumeric comparison, excluding
    /// `exclude_document_id`.
    async fn find_latest_by_identities(
        &self,
        identities: &[String],
        exclude_document_id: &str,
    ) -> Result<Option<DocumentRecord>>;

    async fn upsert_from_upload(&self, upload: UploadRecord) -> Result<DocumentRecord>;

    /// Persist an operator-confirmed payload; the record becomes
    /// `confirmed` and its effective payload is replaced.
    async fn save_edited_payload(
        &self,
        document_id: &str,
        payload: Value,
        missing_fields: Vec<String>,
    ) -> Result<DocumentRecord>;

    async fn update_document_fields(
        &self,
        document_id: &str,
        updates: DocumentFieldUpdates,
    ) -> Result<DocumentRecord>;

    /// Attach a browser automation session to the record.
    async fn set_browser_session(&self, document_id: &str, session_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Normalization helpers
// ---------------------------------------------------------------------------

/// Uppercase alphanumeric projection of a document number.
pub fn normalized_document_number(value: &str) -> String {
    value
        .to_uppercase()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

/// Uppercase name with every non-alphanumeric run collapsed to one space.
pub fn normalized_name(value: &str) -> String {
    value
        .to_uppercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn payload_str(payload: &Value, path: &[&str]) -> String {
    let mut node = payload;
    for key in path {
        match node.get(key) {
            Some(next) => node = next,
            None => return String::new(),
        }
    }
    match node {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Derive the stored identifiers from a payload.
pub fn identifiers_from_payload(payload: &Value) -> DocumentIdentifiers {
    DocumentIdentifiers {
        document_number: payload_str(payload, &["identificacion", "nif_nie"]),
        name: payload_str(payload, &["identificacion", "nombre_apellidos"]),
    }
}

/// Project a record into its listing row.
pub fn summary_from_record(record: &DocumentRecord) -> DocumentSummary {
    DocumentSummary {
        document_id: record.document_id.clone(),
        document_number: record.identifiers.document_number.clone(),
        name: record.identifiers.name.clone(),
        updated_at: Some(record.updated_at),
        status: record.status,
        has_edited: record
            .edited_payload
            .as_ref()
            .map_or(false, non_empty_object),
    }
}

/// Keep the latest summary per identity key: document number when present,
/// then normalized name, then the document id itself.
pub fn dedupe_summaries(mut items: Vec<DocumentSummary>) -> Vec<DocumentSummary> {
    items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    let mut seen: HashMap<String, ()> = HashMap::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let doc_no = normalized_document_number(&item.document_number);
        let name = normalized_name(&item.name);
        let key = if !doc_no.is_empty() {
            format!("doc:{doc_no}")
        } else if !name.is_empty() {
            format!("name:{name}")
        } else {
            format!("id:{}", item.document_id)
        };
        if seen.insert(key, ()).is_none() {
            out.push(item);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Record assembly
// ---------------------------------------------------------------------------

/// Build the stored record for an upload, merging over `existing` per the
/// upsert rules: `created_at` and any edited payload survive, identifiers
/// are recomputed from the effective payload, and the record returns to
/// `uploaded`.
pub fn record_from_upload(
    existing: Option<&DocumentRecord>,
    upload: UploadRecord,
    now: DateTime<Utc>,
) -> DocumentRecord {
    let edited_payload = existing
        .and_then(|record| record.edited_payload.clone())
        .filter(Value::is_object);
    let effective_payload = match &edited_payload {
        Some(edited) if non_empty_object(edited) => edited.clone(),
        _ => upload.payload.clone(),
    };

    let mut record = DocumentRecord::new(upload.document_id, now);
    record.status = DocumentStatus::Uploaded;
    record.created_at = existing.map_or(now, |r| r.created_at);
    record.identifiers = identifiers_from_payload(&effective_payload);
    record.ocr_payload = upload.payload;
    record.edited_payload = edited_payload;
    record.effective_payload = effective_payload;
    record.ocr_document = upload.ocr_document;
    record.source = upload.source;
    record.missing_fields = upload.missing_fields;
    record.manual_steps_required = upload.manual_steps_required;
    record.form_url = upload.form_url;
    record.target_url = upload.target_url;
    record.browser_session_id = existing.map_or(String::new(), |r| r.browser_session_id.clone());
    record.identity_match_found = upload.identity_match_found
        || existing.map_or(false, |r| r.identity_match_found);
    record.identity_source_document_id = if upload.identity_source_document_id.is_empty() {
        existing.map_or(String::new(), |r| r.identity_source_document_id.clone())
    } else {
        upload.identity_source_document_id
    };
    record.enrichment_preview = upload
        .enrichment_preview
        .unwrap_or_else(|| existing.map_or(Vec::new(), |r| r.enrichment_preview.clone()));
    record.enrichment_log = existing.map_or(EnrichmentLog::default(), |r| r.enrichment_log.clone());
    record
}

/// Build the stored record for a confirmed payload save: the record becomes
/// `confirmed`, the edited and effective payloads are replaced, and the
/// original OCR payload is kept when one exists.
pub fn record_from_edited_payload(
    existing: Option<&DocumentRecord>,
    document_id: &str,
    payload: Value,
    missing_fields: Vec<String>,
    now: DateTime<Utc>,
) -> DocumentRecord {
    let ocr_payload = existing
        .map(|r| r.ocr_payload.clone())
        .filter(non_empty_object)
        .unwrap_or_else(|| payload.clone());

    let mut record = DocumentRecord::new(document_id, now);
    record.status = DocumentStatus::Confirmed;
    record.created_at = existing.map_or(now, |r| r.created_at);
    record.identifiers = identifiers_from_payload(&payload);
    record.ocr_payload = ocr_payload;
    record.edited_payload = Some(payload.clone());
    record.effective_payload = payload;
    record.missing_fields = missing_fields;
    if let Some(existing) = existing {
        record.ocr_document = existing.ocr_document.clone();
        record.source = existing.source.clone();
        record.manual_steps_required = existing.manual_steps_required.clone();
        record.form_url = existing.form_url.clone();
        record.target_url = existing.target_url.clone();
        record.browser_session_id = existing.browser_session_id.clone();
        record.identity_match_found = existing.identity_match_found;
        record.identity_source_document_id = existing.identity_source_document_id.clone();
        record.enrichment_preview = existing.enrichment_preview.clone();
        record.enrichment_log = existing.enrichment_log.clone();
    }
    record
}

/// Apply a shallow partial update over `existing` (bootstrapping an empty
/// record when absent) and bump `updated_at`.
pub fn apply_field_updates(
    existing: Option<DocumentRecord>,
    document_id: &str,
    updates: DocumentFieldUpdates,
    now: DateTime<Utc>,
) -> DocumentRecord {
    let mut record = existing.unwrap_or_else(|| DocumentRecord::new(document_id, now));
    record.document_id = document_id.to_string();
    record.updated_at = now;

    if let Some(status) = updates.status {
        record.status = status;
    }
    if let Some(identity_key) = updates.identity_key {
        record.identity_key = identity_key;
    }
    if let Some(found) = updates.identity_match_found {
        record.identity_match_found = found;
    }
    if let Some(source_id) = updates.identity_source_document_id {
        record.identity_source_document_id = source_id;
    }
    if let Some(preview) = updates.enrichment_preview {
        record.enrichment_preview = preview;
    }
    if let Some(log) = updates.enrichment_log {
        record.enrichment_log = log;
    }
    if let Some(links) = updates.family_links {
        record.family_links = links;
    }
    if let Some(merged_into) = updates.merged_into_document_id {
        record.merged_into_document_id = merged_into;
    }
    if let Some(session_id) = updates.browser_session_id {
        record.browser_session_id = session_id;
    }
    record
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).unwrap()
    }

    #[test]
    fn document_number_normalization_strips_punctuation() {
        assert_eq!(normalized_document_number("x-1234-z"), "X1234Z");
        assert_eq!(normalized_document_number(" p 99 "), "P99");
        assert_eq!(normalized_document_number("garcía"), "GARCA");
        assert_eq!(normalized_document_number(""), "");
    }

    #[test]
    fn name_normalization_collapses_separators() {
        assert_eq!(normalized_name("García,  Ana "), "GARCA ANA");
        assert_eq!(normalized_name("---"), "");
    }

    #[test]
    fn identifiers_come_from_the_identification_section() {
        let payload = json!({
            "identificacion": {"nif_nie": " x-1 ", "nombre_apellidos": " GARCIA ANA "}
        });
        let identifiers = identifiers_from_payload(&payload);
        assert_eq!(identifiers.document_number, "x-1");
        assert_eq!(identifiers.name, "GARCIA ANA");

        assert_eq!(
            identifiers_from_payload(&json!({})),
            DocumentIdentifiers::default()
        );
    }

    #[test]
    fn dedupe_keeps_newest_per_document_number() {
        let older = DocumentSummary {
            document_id: "doc-old".to_string(),
            document_number: "X-1".to_string(),
            name: "ALFA".to_string(),
            updated_at: Some(ts(9)),
            status: DocumentStatus::Uploaded,
            has_edited: false,
        };
        let newer = DocumentSummary {
            document_id: "doc-new".to_string(),
            document_number: "x1".to_string(),
            name: "ALFA".to_string(),
            updated_at: Some(ts(10)),
            status: DocumentStatus::Confirmed,
            has_edited: true,
        };
        let unrelated = DocumentSummary {
            document_id: "doc-other".to_string(),
            document_number: String::new(),
            name: "BETA TEST".to_string(),
            updated_at: Some(ts(8)),
            status: DocumentStatus::Uploaded,
            has_edited: false,
        };

        let out = dedupe_summaries(vec![older, newer.clone(), unrelated.clone()]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], newer, "normalized X-1 and x1 collide; newest wins");
        assert_eq!(out[1], unrelated);
    }

    #[test]
    fn upsert_preserves_created_at_and_edited_payload() {
        let first = record_from_upload(
            None,
            UploadRecord {
                document_id: "doc-1".to_string(),
                payload: json!({"identificacion": {"nif_nie": "X1"}}),
                ..Default::default()
            },
            ts(9),
        );
        assert_eq!(first.status, DocumentStatus::Uploaded);
        assert_eq!(first.created_at, ts(9));
        assert_eq!(first.identifiers.document_number, "X1");

        let mut confirmed = first.clone();
        confirmed.edited_payload = Some(json!({"identificacion": {"nif_nie": "X2"}}));

        let second = record_from_upload(
            Some(&confirmed),
            UploadRecord {
                document_id: "doc-1".to_string(),
                payload: json!({"identificacion": {"nif_nie": "X3"}}),
                ..Default::default()
            },
            ts(11),
        );
        assert_eq!(second.created_at, ts(9), "creation time is stable");
        assert_eq!(second.updated_at, ts(11));
        // The operator's confirmed payload stays effective over the re-OCR.
        assert_eq!(
            second.identifiers.document_number, "X2",
            "identifiers derive from the effective payload"
        );
        assert_eq!(second.ocr_payload, json!({"identificacion": {"nif_nie": "X3"}}));
    }

    #[test]
    fn save_edited_payload_confirms_and_keeps_ocr() {
        let uploaded = record_from_upload(
            None,
            UploadRecord {
                document_id: "doc-1".to_string(),
                payload: json!({"identificacion": {"nif_nie": "X1"}}),
                ..Default::default()
            },
            ts(9),
        );

        let confirmed = record_from_edited_payload(
            Some(&uploaded),
            "doc-1",
            json!({"identificacion": {"nif_nie": "X1", "nombre_apellidos": "GARCIA ANA"}}),
            vec![],
            ts(10),
        );
        assert_eq!(confirmed.status, DocumentStatus::Confirmed);
        assert_eq!(confirmed.created_at, ts(9));
        assert_eq!(confirmed.ocr_payload, uploaded.ocr_payload);
        assert_eq!(confirmed.identifiers.name, "GARCIA ANA");
        assert!(confirmed.edited_payload.is_some());
    }

    #[test]
    fn field_updates_bootstrap_missing_records() {
        let record = apply_field_updates(
            None,
            "doc-7",
            DocumentFieldUpdates {
                status: Some(DocumentStatus::Merged),
                merged_into_document_id: Some("doc-1".to_string()),
                ..Default::default()
            },
            ts(12),
        );
        assert_eq!(record.document_id, "doc-7");
        assert_eq!(record.status, DocumentStatus::Merged);
        assert_eq!(record.merged_into_document_id, "doc-1");
        assert_eq!(record.created_at, ts(12));
    }

    #[test]
    fn field_updates_leave_unset_fields_alone() {
        let mut existing = DocumentRecord::new("doc-1", ts(9));
        existing.identity_key = "X1".to_string();
        existing.family_links = vec![FamilyLink {
            relation: "familiar_que_da_derecho".to_string(),
            related_document_id: "doc-2".to_string(),
            document_number: "P9".to_string(),
            created_from_reference: true,
        }];

        let updated = apply_field_updates(
            Some(existing.clone()),
            "doc-1",
            DocumentFieldUpdates {
                identity_match_found: Some(true),
                ..Default::default()
            },
            ts(10),
        );
        assert!(updated.identity_match_found);
        assert_eq!(updated.identity_key, "X1");
        assert_eq!(updated.family_links, existing.family_links);
        assert_eq!(updated.updated_at, ts(10));
    }
}
