//! In-memory reference implementation of the repository port.
//!
//! Built on the shared assembly helpers in `itk-repo`, so scenario tests
//! exercise the same upsert/save/search semantics any real backend must
//! honor.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

use itk_repo::{
    apply_field_updates, dedupe_summaries, normalized_document_number, record_from_edited_payload,
    record_from_upload, summary_from_record, DocumentFieldUpdates, DocumentRepository,
    UploadRecord, SEARCH_LIMIT_MAX,
};
use itk_schemas::{DocumentRecord, DocumentSummary};

/// Map-backed repository double for tests.
#[derive(Default)]
pub struct MemoryRepository {
    records: Mutex<HashMap<String, DocumentRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as-is, bypassing the upsert rules. Useful for shaping
    /// corpus fixtures with specific timestamps.
    pub async fn insert_record(&self, record: DocumentRecord) {
        self.records
            .lock()
            .await
            .insert(record.document_id.clone(), record);
    }

    pub async fn record_count(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl DocumentRepository for MemoryRepository {
    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        Ok(self.records.lock().await.get(document_id).cloned())
    }

    async fn search_documents(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<DocumentSummary>> {
        let limit = limit.clamp(1, SEARCH_LIMIT_MAX);
        let needle = query.trim().to_lowercase();

        let records = self.records.lock().await;
        let mut summaries: Vec<DocumentSummary> = records
            .values()
            .map(summary_from_record)
            .filter(|summary| {
                if needle.is_empty() {
                    return true;
                }
                let haystack =
                    format!("{} {}", summary.name, summary.document_number).to_lowercase();
                haystack.contains(&needle)
            })
            .collect();
        drop(records);

        summaries = dedupe_summaries(summaries);
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn find_latest_by_identities(
        &self,
        identities: &[String],
        exclude_document_id: &str,
    ) -> Result<Option<DocumentRecord>> {
        let wanted: Vec<String> = identities
            .iter()
            .map(|identity| normalized_document_number(identity))
            .filter(|identity| !identity.is_empty())
            .collect();
        if wanted.is_empty() {
            return Ok(None);
        }

        let records = self.records.lock().await;
        let mut matches: Vec<&DocumentRecord> = records
            .values()
            .filter(|record| record.document_id != exclude_document_id)
            .filter(|record| {
                let stored = normalized_document_number(&record.identifiers.document_number);
                !stored.is_empty() && wanted.contains(&stored)
            })
            .collect();
        matches.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(matches.first().map(|record| (*record).clone()))
    }

    async fn upsert_from_upload(&self, upload: UploadRecord) -> Result<DocumentRecord> {
        let mut records = self.records.lock().await;
        let existing = records.get(&upload.document_id).cloned();
        let record = record_from_upload(existing.as_ref(), upload, Utc::now());
        records.insert(record.document_id.clone(), record.clone());
        Ok(record)
    }

    async fn save_edited_payload(
        &self,
        document_id: &str,
        payload: Value,
        missing_fields: Vec<String>,
    ) -> Result<DocumentRecord> {
        let mut records = self.records.lock().await;
        let existing = records.get(document_id).cloned();
        let record = record_from_edited_payload(
            existing.as_ref(),
            document_id,
            payload,
            missing_fields,
            Utc::now(),
        );
        records.insert(record.document_id.clone(), record.clone());
        Ok(record)
    }

    async fn update_document_fields(
        &self,
        document_id: &str,
        updates: DocumentFieldUpdates,
    ) -> Result<DocumentRecord> {
        let mut records = self.records.lock().await;
        let existing = records.remove(document_id);
        let record = apply_field_updates(existing, document_id, updates, Utc::now());
        records.insert(record.document_id.clone(), record.clone());
        Ok(record)
    }

    async fn set_browser_session(&self, document_id: &str, session_id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let existing = records.remove(document_id);
        let record = apply_field_updates(
            existing,
            document_id,
            DocumentFieldUpdates {
                browser_session_id: Some(session_id.to_string()),
                ..Default::default()
            },
            Utc::now(),
        );
        records.insert(record.document_id.clone(), record);
        Ok(())
    }
}
