use chrono::{TimeZone, Utc};
use itk_enrich::MatchReason;
use itk_schemas::{DocumentIdentifiers, DocumentRecord};
use itk_testkit::{test_enrichment_service, MemoryRecordStore, MemoryRepository};
use serde_json::json;
use std::sync::Arc;

fn corpus_record(document_id: &str, nif_nie: &str, name: &str, hour: u32) -> DocumentRecord {
    let ts = Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).unwrap();
    let mut record = DocumentRecord::new(document_id, ts);
    record.effective_payload = json!({
        "identificacion": {
            "nif_nie": nif_nie,
            "primer_apellido": "ALFA",
            "nombre": "TEST",
        }
    });
    record.identifiers = DocumentIdentifiers {
        document_number: nif_nie.to_string(),
        name: name.to_string(),
    };
    record
}

#[tokio::test]
async fn identity_matches_outrank_name_overlap() -> anyhow::Result<()> {
    let repo = Arc::new(MemoryRepository::new());
    repo.insert_record(corpus_record("doc-a", "X1", "ALFA TEST", 10))
        .await;
    repo.insert_record(corpus_record("doc-b", "Y1", "BETA TEST", 9))
        .await;

    let service = test_enrichment_service(Arc::clone(&repo), Arc::new(MemoryRecordStore::new()));
    let payload = json!({
        "identificacion": {"nif_nie": "X1", "primer_apellido": "ALFA", "nombre": "TEST"}
    });

    let out = service
        .merge_candidates_for_payload("doc-main", &payload, 10)
        .await?;

    assert_eq!(out.len(), 2);
    assert_eq!(out[0].document_id, "doc-a");
    assert!(out[0].reasons.contains(&MatchReason::DocumentMatch));
    assert_eq!(out[0].score, 140, "identity + two-token name overlap");
    assert_eq!(out[0].identity_overlap, vec!["X1"]);

    assert_eq!(out[1].document_id, "doc-b");
    assert_eq!(out[1].score, 40, "name overlap only");
    assert!(out[1].identity_overlap.is_empty());
    Ok(())
}

#[tokio::test]
async fn candidates_with_no_signal_are_dropped_and_limit_truncates() -> anyhow::Result<()> {
    let repo = Arc::new(MemoryRepository::new());
    repo.insert_record(corpus_record("doc-a", "X1", "ALFA TEST", 10))
        .await;
    repo.insert_record(corpus_record("doc-b", "Y1", "ALFA TEST", 9))
        .await;

    let mut unrelated = DocumentRecord::new(
        "doc-c",
        Utc.with_ymd_and_hms(2026, 2, 24, 8, 0, 0).unwrap(),
    );
    unrelated.effective_payload = json!({
        "identificacion": {"nif_nie": "Z9", "primer_apellido": "OTRO", "nombre": "NOMBRE"}
    });
    unrelated.identifiers = itk_schemas::DocumentIdentifiers {
        document_number: "Z9".to_string(),
        name: "OTRO NOMBRE".to_string(),
    };
    repo.insert_record(unrelated).await;

    let service = test_enrichment_service(Arc::clone(&repo), Arc::new(MemoryRecordStore::new()));
    let payload = json!({
        "identificacion": {"nif_nie": "X1", "primer_apellido": "ALFA", "nombre": "TEST"}
    });

    let all = service
        .merge_candidates_for_payload("doc-main", &payload, 10)
        .await?;
    assert_eq!(all.len(), 2, "zero-score candidates never appear");
    assert!(all.iter().all(|c| c.document_id != "doc-c"));

    let top = service
        .merge_candidates_for_payload("doc-main", &payload, 1)
        .await?;
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].document_id, "doc-a");
    Ok(())
}

#[tokio::test]
async fn the_document_itself_is_never_a_candidate() -> anyhow::Result<()> {
    let repo = Arc::new(MemoryRepository::new());
    repo.insert_record(corpus_record("doc-main", "X1", "ALFA TEST", 10))
        .await;

    let service = test_enrichment_service(Arc::clone(&repo), Arc::new(MemoryRecordStore::new()));
    let payload = json!({
        "identificacion": {"nif_nie": "X1", "primer_apellido": "ALFA", "nombre": "TEST"}
    });

    let out = service
        .merge_candidates_for_payload("doc-main", &payload, 10)
        .await?;
    assert!(out.is_empty());
    Ok(())
}
