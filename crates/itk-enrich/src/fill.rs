//! Fill-empty payload enrichment and family-link merging.

use serde_json::Value;
use std::collections::HashSet;

use itk_schemas::{EnrichmentFieldRow, FamilyLink, SkipReason};

use crate::paths::{safe_get, safe_set};
use crate::ENRICHMENT_PATHS;

/// Fill empty fields of `payload` from `source_payload`, reporting what was
/// applied and what was skipped.
///
/// Only the fixed enrichment paths participate; `selected_fields`, when
/// given, restricts the pass further. Existing values are never overwritten:
/// a non-empty current value produces a skipped row with reason `equal`
/// (case-insensitive match) or `conflict`.
pub fn enrich_payload_fill_empty(
    payload: &Value,
    source_payload: &Value,
    source_document_id: &str,
    selected_fields: Option<&HashSet<String>>,
) -> (Value, Vec<EnrichmentFieldRow>, Vec<EnrichmentFieldRow>) {
    let mut out = payload.clone();
    let mut applied = Vec::new();
    let mut skipped = Vec::new();

    for path in ENRICHMENT_PATHS {
        if let Some(selected) = selected_fields {
            if !selected.contains(*path) {
                continue;
            }
        }

        let current = safe_get(&out, path);
        let suggested = safe_get(source_payload, path);
        if suggested.is_empty() {
            continue;
        }

        if !current.is_empty() {
            let reason = if current.to_uppercase() == suggested.to_uppercase() {
                SkipReason::Equal
            } else {
                SkipReason::Conflict
            };
            skipped.push(EnrichmentFieldRow {
                field: (*path).to_string(),
                current_value: current,
                suggested_value: suggested,
                source: source_document_id.to_string(),
                reason: Some(reason),
            });
            continue;
        }

        safe_set(&mut out, path, &suggested);
        applied.push(EnrichmentFieldRow {
            field: (*path).to_string(),
            current_value: current,
            suggested_value: suggested,
            source: source_document_id.to_string(),
            reason: None,
        });
    }

    (out, applied, skipped)
}

/// Merge a link into a family-link list without duplicates.
///
/// Set-like under the key `(related_document_id, relation, document_number)`:
/// merging an already-present link returns the list unchanged.
pub fn merge_family_links(existing: Vec<FamilyLink>, new_link: FamilyLink) -> Vec<FamilyLink> {
    let mut links = existing;
    let duplicate = links.iter().any(|row| {
        row.related_document_id == new_link.related_document_id
            && row.relation == new_link.relation
            && row.document_number == new_link.document_number
    });
    if !duplicate {
        links.push(new_link);
    }
    links
}
