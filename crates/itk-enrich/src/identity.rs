//! Identity extraction, name splitting and tokenization.

use serde_json::Value;
use std::collections::HashSet;

use crate::paths::{safe_get, trimmed_string};

/// Uppercase alphanumeric projection of a personal identifier.
pub fn normalize_identity(value: &str) -> String {
    value
        .to_uppercase()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

/// Ordered, deduplicated identity candidates: the normalized
/// `identificacion.nif_nie` first, then `identificacion.pasaporte`.
pub fn identity_candidates(payload: &Value) -> Vec<String> {
    let mut out = Vec::new();
    for path in ["identificacion.nif_nie", "identificacion.pasaporte"] {
        let value = normalize_identity(&safe_get(payload, path));
        if !value.is_empty() && !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

/// Split a full name into `(first_surname, second_surname, first_name)`.
///
/// A comma separates "surnames, given name"; otherwise surname-first
/// ordering is assumed over whitespace tokens.
pub fn split_full_name(raw: &str) -> (String, String, String) {
    let raw = raw.trim();
    if raw.is_empty() {
        return (String::new(), String::new(), String::new());
    }

    if let Some((left, right)) = raw.split_once(',') {
        let parts: Vec<&str> = left.split_whitespace().collect();
        let first_surname = parts.first().map_or(String::new(), |s| (*s).to_string());
        let second_surname = if parts.len() > 1 {
            parts[1..].join(" ")
        } else {
            String::new()
        };
        return (first_surname, second_surname, right.trim().to_string());
    }

    let parts: Vec<&str> = raw.split_whitespace().collect();
    match parts.len() {
        1 => (parts[0].to_string(), String::new(), String::new()),
        2 => (parts[0].to_string(), String::new(), parts[1].to_string()),
        _ => (
            parts[0].to_string(),
            parts[1].to_string(),
            parts[2..].join(" "),
        ),
    }
}

/// Uppercase alphanumeric tokens (length >= 2) from the four name fields
/// under `identificacion`, used for merge-candidate scoring.
pub fn name_tokens(payload: &Value) -> HashSet<String> {
    let joined = [
        safe_get(payload, "identificacion.primer_apellido"),
        safe_get(payload, "identificacion.segundo_apellido"),
        safe_get(payload, "identificacion.nombre"),
        safe_get(payload, "identificacion.nombre_apellidos"),
    ]
    .join(" ")
    .to_uppercase();

    joined
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| token.len() >= 2)
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Family reference extraction
// ---------------------------------------------------------------------------

/// Family reference extracted from `referencias.familiar_que_da_derecho`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct FamilyReference {
    /// Normalized nif_nie when present, else the normalized passport.
    pub document_number: String,
    pub nif_nie: String,
    pub pasaporte: String,
    pub nombre_apellidos: String,
    pub primer_apellido: String,
    pub nombre: String,
}

/// Extract the family reference, requiring at least one non-empty
/// normalized identifier. When the reference names no full name, one is
/// synthesized from the surname and given-name fields.
pub fn family_reference_from_payload(payload: &Value) -> Option<FamilyReference> {
    let fam = payload
        .get("referencias")
        .and_then(|refs| refs.get("familiar_que_da_derecho"))
        .and_then(Value::as_object)?;
    if fam.is_empty() {
        return None;
    }

    let field = |key: &str| fam.get(key).map_or(String::new(), trimmed_string);

    let nif_nie = normalize_identity(&field("nif_nie"));
    let pasaporte = normalize_identity(&field("pasaporte"));
    let primer_apellido = field("primer_apellido");
    let nombre = field("nombre");
    let mut nombre_apellidos = field("nombre_apellidos");
    if nombre_apellidos.is_empty() {
        nombre_apellidos = [primer_apellido.as_str(), nombre.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
    }

    let document_number = if nif_nie.is_empty() {
        pasaporte.clone()
    } else {
        nif_nie.clone()
    };
    if document_number.is_empty() {
        return None;
    }

    Some(FamilyReference {
        document_number,
        nif_nie,
        pasaporte,
        nombre_apellidos,
        primer_apellido,
        nombre,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_candidates_are_normalized_and_deduplicated() {
        let payload = json!({
            "identificacion": {"nif_nie": "x-1234-z", "pasaporte": "p 99"}
        });
        assert_eq!(identity_candidates(&payload), vec!["X1234Z", "P99"]);

        let duplicated = json!({
            "identificacion": {"nif_nie": "x1", "pasaporte": "X-1"}
        });
        assert_eq!(identity_candidates(&duplicated), vec!["X1"]);
    }

    #[test]
    fn empty_identities_yield_no_candidates() {
        assert!(identity_candidates(&json!({})).is_empty());
        let blank = json!({"identificacion": {"nif_nie": "  ", "pasaporte": "---"}});
        assert!(identity_candidates(&blank).is_empty());
    }

    #[test]
    fn split_full_name_handles_comma_form() {
        assert_eq!(
            split_full_name("GARCIA LOPEZ, ANA MARIA"),
            (
                "GARCIA".to_string(),
                "LOPEZ".to_string(),
                "ANA MARIA".to_string()
            )
        );
        assert_eq!(
            split_full_name("GARCIA, ANA"),
            ("GARCIA".to_string(), String::new(), "ANA".to_string())
        );
    }

    #[test]
    fn split_full_name_handles_token_counts() {
        assert_eq!(
            split_full_name("GARCIA"),
            ("GARCIA".to_string(), String::new(), String::new())
        );
        assert_eq!(
            split_full_name("GARCIA ANA"),
            ("GARCIA".to_string(), String::new(), "ANA".to_string())
        );
        assert_eq!(
            split_full_name("GARCIA LOPEZ ANA MARIA"),
            (
                "GARCIA".to_string(),
                "LOPEZ".to_string(),
                "ANA MARIA".to_string()
            )
        );
        assert_eq!(
            split_full_name("   "),
            (String::new(), String::new(), String::new())
        );
    }

    #[test]
    fn name_tokens_drop_short_fragments() {
        let payload = json!({
            "identificacion": {
                "primer_apellido": "GARCIA",
                "nombre": "ANA M",
                "nombre_apellidos": "GARCIA, ANA"
            }
        });
        let tokens = name_tokens(&payload);
        assert!(tokens.contains("GARCIA"));
        assert!(tokens.contains("ANA"));
        assert!(!tokens.contains("M"), "single characters are noise");
    }

    #[test]
    fn family_reference_requires_an_identifier() {
        let payload = json!({
            "referencias": {
                "familiar_que_da_derecho": {
                    "pasaporte": " ab-123 ",
                    "nombre_apellidos": "",
                    "primer_apellido": "GARCIA",
                    "nombre": "ANA"
                }
            }
        });
        let family_ref = family_reference_from_payload(&payload).expect("identifier present");
        assert_eq!(family_ref.document_number, "AB123");
        assert_eq!(family_ref.pasaporte, "AB123");
        assert_eq!(family_ref.nif_nie, "");
        assert_eq!(family_ref.nombre_apellidos, "GARCIA ANA");

        let no_ids = json!({
            "referencias": {
                "familiar_que_da_derecho": {"nombre_apellidos": "GARCIA ANA"}
            }
        });
        assert!(family_reference_from_payload(&no_ids).is_none());
        assert!(family_reference_from_payload(&json!({})).is_none());
    }

    #[test]
    fn family_reference_prefers_nif_nie_for_document_number() {
        let payload = json!({
            "referencias": {
                "familiar_que_da_derecho": {"nif_nie": "x-7", "pasaporte": "p-8"}
            }
        });
        let family_ref = family_reference_from_payload(&payload).unwrap();
        assert_eq!(family_ref.document_number, "X7");
    }
}
