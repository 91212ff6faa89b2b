//! Enrichment service: identity-driven record enrichment, merge-candidate
//! scoring and family-reference synchronization over the repository port.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use itk_repo::{DocumentFieldUpdates, DocumentRepository, UploadRecord};
use itk_schemas::{DocumentStatus, EnrichmentFieldRow, EnrichmentLog, FamilyLink, SourceInfo};

use crate::fill::{enrich_payload_fill_empty, merge_family_links};
use crate::identity::{
    family_reference_from_payload, identity_candidates, name_tokens, split_full_name,
    FamilyReference,
};

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

/// Form-layer hooks the engine depends on but does not own: payload shape
/// normalization and validation of required fields.
pub trait IntakeProfile: Send + Sync {
    /// Normalize a synthesized payload into the canonical form shape.
    fn normalize_payload(&self, payload: Value) -> Value;

    /// Validation errors for a payload; `require_tramite` tightens the rules
    /// to the full submission set.
    fn missing_fields(&self, payload: &Value, require_tramite: bool) -> Vec<String>;
}

/// Runtime record store the engine persists its working records into,
/// separate from the CRM repository.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Read the runtime record for a document, bootstrapping an empty one
    /// when absent.
    async fn read_or_bootstrap(&self, document_id: &str) -> Result<Value>;

    async fn write(&self, document_id: &str, record: Value) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EnrichmentSettings {
    /// Target URL stamped onto auto-created family records.
    pub default_target_url: String,
}

impl From<itk_config::DocumentsConfig> for EnrichmentSettings {
    fn from(cfg: itk_config::DocumentsConfig) -> Self {
        Self {
            default_target_url: cfg.default_target_url,
        }
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Why a candidate scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    /// Identity candidates overlap (+100).
    DocumentMatch,
    /// Two or more name tokens overlap (+40).
    NameOverlap,
    /// Exactly one name token overlaps (+15).
    PartialNameOverlap,
}

/// A scored suggestion that two documents refer to the same person.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeCandidate {
    pub document_id: String,
    pub name: String,
    pub document_number: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub score: i64,
    pub reasons: Vec<MatchReason>,
    pub identity_overlap: Vec<String>,
    pub name_overlap: Vec<String>,
}

/// Outcome of a family-reference sync pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FamilySyncOutcome {
    pub linked: bool,
    pub related_document_id: String,
    /// `true` when the related record was minted by this pass.
    pub created: bool,
    /// The primary document's family links after the merge.
    pub family_links: Vec<FamilyLink>,
    pub family_reference: Option<FamilyReference>,
}

/// Outcome of an identity-driven enrichment pass. A missing identity or
/// source is a normal `identity_match_found = false` result, not an error.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityEnrichmentOutcome {
    pub identity_match_found: bool,
    pub identity_source_document_id: String,
    pub identity_key: String,
    pub enrichment_preview: Vec<EnrichmentFieldRow>,
    pub enrichment_skipped: Vec<EnrichmentFieldRow>,
    pub applied_fields: Vec<String>,
    pub skipped_fields: Vec<String>,
    pub payload: Value,
}

impl IdentityEnrichmentOutcome {
    fn no_match(identity_key: String, payload: Value) -> Self {
        Self {
            identity_match_found: false,
            identity_source_document_id: String::new(),
            identity_key,
            enrichment_preview: Vec::new(),
            enrichment_skipped: Vec::new(),
            applied_fields: Vec::new(),
            skipped_fields: Vec::new(),
            payload,
        }
    }
}

/// Parameters for [`EnrichmentService::enrich_record_payload_by_identity`].
#[derive(Debug, Clone)]
pub struct EnrichmentRequest {
    /// Persist results into the record store and repository.
    pub persist: bool,
    /// Explicit source document id; empty resolves by identity instead.
    pub source_document_id: String,
    /// Restrict the pass to these enrichment paths.
    pub selected_fields: Option<Vec<String>>,
}

impl Default for EnrichmentRequest {
    fn default() -> Self {
        Self {
            persist: true,
            source_document_id: String::new(),
            selected_fields: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Merge/enrichment/family-reference logic over the repository port.
pub struct EnrichmentService {
    repo: Arc<dyn DocumentRepository>,
    profile: Arc<dyn IntakeProfile>,
    records: Arc<dyn RecordStore>,
    default_target_url: String,
}

impl EnrichmentService {
    pub fn new(
        repo: Arc<dyn DocumentRepository>,
        profile: Arc<dyn IntakeProfile>,
        records: Arc<dyn RecordStore>,
        settings: EnrichmentSettings,
    ) -> Self {
        Self {
            repo,
            profile,
            records,
            default_target_url: settings.default_target_url,
        }
    }

    // -----------------------------------------------------------------------
    // Merge candidates
    // -----------------------------------------------------------------------

    /// Score recent documents against `payload` by identity and name-token
    /// overlap. Results sort by `(score desc, updated_at desc)` and truncate
    /// to `limit`.
    pub async fn merge_candidates_for_payload(
        &self,
        document_id: &str,
        payload: &Value,
        limit: usize,
    ) -> Result<Vec<MergeCandidate>> {
        let target_ids: HashSet<String> = identity_candidates(payload).into_iter().collect();
        let target_tokens = name_tokens(payload);

        let summaries = self.repo.search_documents("", 200).await?;
        let mut out = Vec::new();

        for item in summaries {
            if item.document_id.is_empty() || item.document_id == document_id {
                continue;
            }
            let Some(record) = self.repo.get_document(&item.document_id).await? else {
                continue;
            };
            let source_payload = record.effective();
            if !source_payload.is_object() {
                continue;
            }

            let candidate_ids: HashSet<String> =
                identity_candidates(source_payload).into_iter().collect();
            let candidate_tokens = name_tokens(source_payload);

            let mut identity_overlap: Vec<String> =
                target_ids.intersection(&candidate_ids).cloned().collect();
            identity_overlap.sort();
            let mut name_overlap: Vec<String> = target_tokens
                .intersection(&candidate_tokens)
                .cloned()
                .collect();
            name_overlap.sort();

            let mut score = 0;
            let mut reasons = Vec::new();
            if !identity_overlap.is_empty() {
                score += 100;
                reasons.push(MatchReason::DocumentMatch);
            }
            if name_overlap.len() >= 2 {
                score += 40;
                reasons.push(MatchReason::NameOverlap);
            } else if name_overlap.len() == 1 {
                score += 15;
                reasons.push(MatchReason::PartialNameOverlap);
            }
            if score <= 0 {
                continue;
            }

            out.push(MergeCandidate {
                document_id: item.document_id,
                name: item.name,
                document_number: item.document_number,
                updated_at: item.updated_at,
                score,
                reasons,
                identity_overlap,
                name_overlap,
            });
        }

        // Stable sort: candidates with equal (score, updated_at) keep their
        // scan order.
        out.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        out.truncate(limit);
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Family reference sync
    // -----------------------------------------------------------------------

    /// Synthesized payload for an auto-created relative.
    fn build_family_payload(&self, family_ref: &FamilyReference) -> Value {
        let (first_surname, second_surname, first_name) =
            split_full_name(&family_ref.nombre_apellidos);
        let primer_apellido = if family_ref.primer_apellido.is_empty() {
            first_surname
        } else {
            family_ref.primer_apellido.clone()
        };
        let nombre = if family_ref.nombre.is_empty() {
            first_name
        } else {
            family_ref.nombre.clone()
        };
        let documento_tipo = if !family_ref.pasaporte.is_empty() && family_ref.nif_nie.is_empty() {
            "pasaporte"
        } else {
            "nif_tie_nie_dni"
        };

        let payload = json!({
            "identificacion": {
                "nif_nie": family_ref.nif_nie,
                "pasaporte": family_ref.pasaporte,
                "documento_tipo": documento_tipo,
                "nombre_apellidos": family_ref.nombre_apellidos,
                "primer_apellido": primer_apellido,
                "segundo_apellido": second_surname,
                "nombre": nombre,
            },
            "domicilio": {},
            "autoliquidacion": {
                "tipo": "principal",
                "num_justificante": "",
                "importe_complementaria": null,
            },
            "tramite": {},
            "declarante": {},
            "ingreso": {"forma_pago": "efectivo", "iban": ""},
            "extra": {},
            "captcha": {"manual": true},
            "download": {"dir": "./downloads", "filename_prefix": "family_related"},
        });
        self.profile.normalize_payload(payload)
    }

    /// Resolve or create the related family document and maintain the
    /// bidirectional links between it and the primary document.
    pub async fn sync_family_reference(
        &self,
        document_id: &str,
        payload: &Value,
        source: &SourceInfo,
    ) -> Result<FamilySyncOutcome> {
        if document_id.is_empty() {
            bail!("document_id is required");
        }

        let Some(family_ref) = family_reference_from_payload(payload) else {
            return Ok(FamilySyncOutcome::default());
        };

        let family_payload = self.build_family_payload(&family_ref);
        let identity_keys: Vec<String> = [family_ref.nif_nie.clone(), family_ref.pasaporte.clone()]
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect();

        let linked_doc = self
            .repo
            .find_latest_by_identities(&identity_keys, document_id)
            .await?;

        let mut created = false;
        let related_document_id = match &linked_doc {
            Some(linked) => {
                // Known relative: fill its empty fields from the reference.
                let existing_payload = linked.effective();
                if existing_payload.is_object() {
                    let (merged, applied, _skipped) = enrich_payload_fill_empty(
                        existing_payload,
                        &family_payload,
                        document_id,
                        None,
                    );
                    if !applied.is_empty() {
                        let missing = self.profile.missing_fields(&merged, false);
                        self.repo
                            .save_edited_payload(&linked.document_id, merged, missing)
                            .await?;
                    }
                }
                linked.document_id.clone()
            }
            None => {
                // Unknown relative: mint a synthetic intake record.
                let related_document_id = Uuid::new_v4().simple().to_string();
                created = true;
                let missing = self.profile.missing_fields(&family_payload, false);
                self.repo
                    .upsert_from_upload(UploadRecord {
                        document_id: related_document_id.clone(),
                        payload: family_payload.clone(),
                        ocr_document: Value::Object(Map::new()),
                        source: SourceInfo {
                            source_kind: "family_reference_auto".to_string(),
                            origin_document_id: document_id.to_string(),
                            original_filename: source.original_filename.clone(),
                            stored_path: source.stored_path.clone(),
                            preview_url: source.preview_url.clone(),
                        },
                        missing_fields: missing,
                        manual_steps_required: vec![
                            "verify_filled_fields".to_string(),
                            "submit_or_download_manually".to_string(),
                        ],
                        form_url: self.default_target_url.clone(),
                        target_url: self.default_target_url.clone(),
                        ..Default::default()
                    })
                    .await?;
                related_document_id
            }
        };

        let forward_link = FamilyLink {
            relation: "familiar_que_da_derecho".to_string(),
            related_document_id: related_document_id.clone(),
            document_number: family_ref.document_number.clone(),
            created_from_reference: created,
        };
        let identities = identity_candidates(payload);
        let backward_link = FamilyLink {
            relation: "titular_familiar_dependiente".to_string(),
            related_document_id: document_id.to_string(),
            document_number: identities.first().cloned().unwrap_or_default(),
            created_from_reference: false,
        };

        let primary_doc = self.repo.get_document(document_id).await?;
        let primary_links = merge_family_links(
            primary_doc.map(|doc| doc.family_links).unwrap_or_default(),
            forward_link,
        );
        self.repo
            .update_document_fields(
                document_id,
                DocumentFieldUpdates {
                    family_links: Some(primary_links.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let related_doc = self.repo.get_document(&related_document_id).await?;
        let related_links = merge_family_links(
            related_doc.map(|doc| doc.family_links).unwrap_or_default(),
            backward_link,
        );
        self.repo
            .update_document_fields(
                &related_document_id,
                DocumentFieldUpdates {
                    family_links: Some(related_links),
                    ..Default::default()
                },
            )
            .await?;

        debug!(
            document_id,
            related_document_id = %related_document_id,
            created,
            "family reference synced"
        );

        Ok(FamilySyncOutcome {
            linked: true,
            related_document_id,
            created,
            family_links: primary_links,
            family_reference: Some(family_ref),
        })
    }

    // -----------------------------------------------------------------------
    // Identity-driven enrichment
    // -----------------------------------------------------------------------

    /// Enrich `payload` from the latest record sharing its identity (or an
    /// explicitly named source), optionally persisting the outcome.
    pub async fn enrich_record_payload_by_identity(
        &self,
        document_id: &str,
        payload: &Value,
        request: EnrichmentRequest,
    ) -> Result<IdentityEnrichmentOutcome> {
        if document_id.is_empty() {
            bail!("document_id is required");
        }

        let candidates = identity_candidates(payload);
        let explicit_source_id = request.source_document_id.trim().to_string();
        if candidates.is_empty() && explicit_source_id.is_empty() {
            return Ok(IdentityEnrichmentOutcome::no_match(
                String::new(),
                payload.clone(),
            ));
        }
        let first_candidate = candidates.first().cloned().unwrap_or_default();

        let source_record = if !explicit_source_id.is_empty() {
            let record = self.repo.get_document(&explicit_source_id).await?;
            match record {
                // An explicit source pointing at the document itself is
                // rejected as a no-match, not an error.
                Some(record) if record.document_id != document_id => Some(record),
                _ => {
                    return Ok(IdentityEnrichmentOutcome::no_match(
                        first_candidate,
                        payload.clone(),
                    ));
                }
            }
        } else {
            self.repo
                .find_latest_by_identities(&candidates, document_id)
                .await?
        };

        let Some(source_record) = source_record else {
            return Ok(IdentityEnrichmentOutcome::no_match(
                first_candidate,
                payload.clone(),
            ));
        };

        let source_payload = source_record.effective().clone();
        let resolved_source_document_id = source_record.document_id.clone();
        let source_candidates = identity_candidates(&source_payload);
        let identity_key = candidates
            .iter()
            .find(|candidate| source_candidates.contains(candidate))
            .cloned()
            .unwrap_or(first_candidate);

        let allowed: HashSet<String> = request
            .selected_fields
            .unwrap_or_default()
            .iter()
            .map(|field| field.trim().to_string())
            .filter(|field| !field.is_empty())
            .collect();
        let selected = if allowed.is_empty() {
            None
        } else {
            Some(&allowed)
        };

        let (enriched, applied, skipped) = enrich_payload_fill_empty(
            payload,
            &source_payload,
            &resolved_source_document_id,
            selected,
        );

        if request.persist {
            let missing = self.profile.missing_fields(&enriched, false);
            let log = EnrichmentLog {
                applied_fields: applied.clone(),
                skipped_fields: skipped.clone(),
            };

            let mut record = self.records.read_or_bootstrap(document_id).await?;
            if !record.is_object() {
                record = Value::Object(Map::new());
            }
            if let Some(map) = record.as_object_mut() {
                map.insert("payload".to_string(), enriched.clone());
                map.insert("identity_key".to_string(), json!(identity_key));
                map.insert("identity_match_found".to_string(), json!(true));
                map.insert(
                    "identity_source_document_id".to_string(),
                    json!(resolved_source_document_id),
                );
                map.insert("enrichment_preview".to_string(), json!(applied));
                map.insert("enrichment_log".to_string(), json!(log));
                map.insert("missing_fields".to_string(), json!(missing));
            }
            self.records.write(document_id, record).await?;

            self.repo
                .save_edited_payload(document_id, enriched.clone(), missing)
                .await?;
            self.repo
                .update_document_fields(
                    document_id,
                    DocumentFieldUpdates {
                        identity_key: Some(identity_key.clone()),
                        identity_match_found: Some(true),
                        identity_source_document_id: Some(resolved_source_document_id.clone()),
                        enrichment_preview: Some(applied.clone()),
                        enrichment_log: Some(log),
                        ..Default::default()
                    },
                )
                .await?;

            // An explicit distinct source is folded into this document.
            if !explicit_source_id.is_empty() && explicit_source_id != document_id {
                self.repo
                    .update_document_fields(
                        &explicit_source_id,
                        DocumentFieldUpdates {
                            status: Some(DocumentStatus::Merged),
                            merged_into_document_id: Some(document_id.to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
            }

            debug!(
                document_id,
                source_document_id = %resolved_source_document_id,
                applied = applied.len(),
                skipped = skipped.len(),
                "identity enrichment persisted"
            );
        }

        Ok(IdentityEnrichmentOutcome {
            identity_match_found: true,
            identity_source_document_id: resolved_source_document_id,
            identity_key,
            applied_fields: applied.iter().map(|row| row.field.clone()).collect(),
            skipped_fields: skipped.iter().map(|row| row.field.clone()).collect(),
            enrichment_preview: applied,
            enrichment_skipped: skipped,
            payload: enriched,
        })
    }
}
