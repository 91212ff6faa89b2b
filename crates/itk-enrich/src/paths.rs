//! Dotted-path reads and writes over nested payload maps.

use serde_json::{Map, Value};

/// Render a leaf value as a trimmed string. Missing and null both read as
/// the empty string; non-string scalars use their JSON representation.
pub(crate) fn trimmed_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Read a nested payload value by dotted path as a trimmed string.
///
/// Returns `""` whenever any intermediate node is missing or not a map.
pub fn safe_get(payload: &Value, path: &str) -> String {
    let mut node = payload;
    for part in path.split('.') {
        match node.as_object().and_then(|map| map.get(part)) {
            Some(next) => node = next,
            None => return String::new(),
        }
    }
    trimmed_string(node)
}

/// Write a nested payload value by dotted path, creating intermediate maps
/// where absent and replacing non-map nodes with fresh maps.
pub fn safe_set(payload: &mut Value, path: &str, value: &str) {
    let mut node = payload;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Some(map) = node.as_object_mut() else { return };
        if parts.peek().is_none() {
            map.insert(part.to_string(), Value::String(value.to_string()));
            return;
        }
        let entry = map.entry(part.to_string()).or_insert(Value::Null);
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        node = entry;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn safe_get_descends_and_trims() {
        let payload = json!({"identificacion": {"nombre": "  ANA  "}});
        assert_eq!(safe_get(&payload, "identificacion.nombre"), "ANA");
    }

    #[test]
    fn safe_get_returns_empty_on_any_missing_node() {
        let payload = json!({"identificacion": {"nombre": "ANA"}});
        assert_eq!(safe_get(&payload, "identificacion.apellido"), "");
        assert_eq!(safe_get(&payload, "domicilio.cp"), "");
        assert_eq!(safe_get(&payload, "identificacion.nombre.extra"), "");
        assert_eq!(safe_get(&json!(null), "identificacion.nombre"), "");
    }

    #[test]
    fn safe_get_renders_null_as_empty_and_numbers_as_text() {
        let payload = json!({"domicilio": {"numero": 12, "piso": null}});
        assert_eq!(safe_get(&payload, "domicilio.numero"), "12");
        assert_eq!(safe_get(&payload, "domicilio.piso"), "");
    }

    #[test]
    fn safe_set_creates_intermediate_maps() {
        let mut payload = json!({});
        safe_set(&mut payload, "a.b.c", "value");
        assert_eq!(payload, json!({"a": {"b": {"c": "value"}}}));
        assert_eq!(safe_get(&payload, "a.b.c"), "value");
    }

    #[test]
    fn safe_set_replaces_non_map_nodes() {
        let mut payload = json!({"a": "scalar"});
        safe_set(&mut payload, "a.b", "value");
        assert_eq!(payload, json!({"a": {"b": "value"}}));

        let mut null_root = json!(null);
        safe_set(&mut null_root, "a.b", "value");
        assert_eq!(null_root, json!({"a": {"b": "value"}}));
    }

    #[test]
    fn set_then_get_round_trips_trimmed() {
        let mut payload = json!({});
        safe_set(&mut payload, "extra.email", "mail@example.test");
        assert_eq!(safe_get(&payload, "extra.email"), "mail@example.test");
    }
}
