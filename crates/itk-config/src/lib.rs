//! Layered YAML configuration for the intake runtime.
//!
//! Configuration is assembled from an ordered list of YAML files (defaults
//! first, site overrides last), deep-merged, canonicalized and hashed, then
//! exposed as typed sections: the queue storage/retry settings and the
//! document-intake settings. Required keys and value clamping are enforced
//! here, at extraction time; domain crates turn the sections into their
//! runtime settings via `From` impls (`QueueSettings` in `itk-queue`,
//! `EnrichmentSettings` in `itk-enrich`).

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Typed sections
// ---------------------------------------------------------------------------

/// The `queue.*` section. `database_path` is required; every other field is
/// `None` when its key is absent, in which case the queue's built-in
/// defaults apply.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub database_path: PathBuf,
    pub default_ttl_seconds: Option<i64>,
    /// Clamped to >= 0 at extraction.
    pub default_max_retries: Option<i64>,
    /// Clamped to >= 1 at extraction.
    pub default_retry_delay_seconds: Option<i64>,
    pub worker_poll_interval: Option<Duration>,
}

/// The `documents.*` section.
#[derive(Debug, Clone)]
pub struct DocumentsConfig {
    /// Target URL stamped onto auto-created family records.
    pub default_target_url: String,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Merged configuration with its canonical form and content hash.
///
/// The hash covers the canonical bytes, so two deployments with the same
/// effective configuration hash identically regardless of file layout.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

impl LoadedConfig {
    /// Load and merge YAML files in order; later files override earlier
    /// ones. Objects merge recursively, arrays and scalars replace.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut merged = Value::Object(Default::default());
        for path in paths {
            merge_layer(&mut merged, read_yaml_layer(path.as_ref())?);
        }

        let canonical_json = serde_json::to_string(&canonical_value(&merged))
            .context("canonical json serialization failed")?;
        let config_hash = hex::encode(Sha256::digest(canonical_json.as_bytes()));

        Ok(Self {
            config_json: merged,
            canonical_json,
            config_hash,
        })
    }

    /// Extract the typed queue section.
    pub fn queue(&self) -> Result<QueueConfig> {
        let database_path = self
            .str_at("/queue/database_path")
            .context("config missing queue.database_path")?;

        Ok(QueueConfig {
            database_path: PathBuf::from(database_path),
            default_ttl_seconds: self.i64_at("/queue/default_ttl_seconds"),
            default_max_retries: self
                .i64_at("/queue/default_max_retries")
                .map(|retries| retries.max(0)),
            default_retry_delay_seconds: self
                .i64_at("/queue/default_retry_delay_seconds")
                .map(|delay| delay.max(1)),
            worker_poll_interval: self
                .config_json
                .pointer("/queue/worker_poll_interval_ms")
                .and_then(Value::as_u64)
                .map(Duration::from_millis),
        })
    }

    /// Extract the typed documents section.
    pub fn documents(&self) -> Result<DocumentsConfig> {
        let default_target_url = self
            .str_at("/documents/default_target_url")
            .context("config missing documents.default_target_url")?;
        Ok(DocumentsConfig {
            default_target_url: default_target_url.to_string(),
        })
    }

    fn str_at(&self, pointer: &str) -> Option<&str> {
        self.config_json.pointer(pointer).and_then(Value::as_str)
    }

    fn i64_at(&self, pointer: &str) -> Option<i64> {
        self.config_json.pointer(pointer).and_then(Value::as_i64)
    }
}

fn read_yaml_layer(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path).with_context(|| format!("read config: {path:?}"))?;
    let parsed: serde_yaml::Value =
        serde_yaml::from_str(&text).with_context(|| format!("parse yaml: {path:?}"))?;
    serde_json::to_value(parsed)
        .with_context(|| format!("config layer is not json-compatible: {path:?}"))
}

/// Deep-merge one layer into the accumulated configuration. A key new to
/// `dst` merges into an intermediate null slot, which the replace arm then
/// overwrites with the incoming value.
fn merge_layer(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, value) in src_map {
                merge_layer(dst_map.entry(key).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Rebuild the value with every object's keys in sorted order, so the
/// serialized form (and therefore the hash) is independent of key layout in
/// the source files.
fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(key, nested)| (key.clone(), canonical_value(nested)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        scalar => scalar.clone(),
    }
}
