//! Fingerprints: deterministic cache keys for DAG nodes.
//!
//! fingerprint = sha256(engine_version, spec, op_version, [(role, upstream_fp)...])
//!
//! Source nodes take a dataset fingerprint as their only upstream, so a data
//! change ripples through every downstream key.

use df_core::pipeline::OperationSpec;
use df_core::record::Record;
use serde_json::json;
use sha2::{Digest, Sha256};

/// Bumped whenever the executor's output semantics change.
pub const ENGINE_VERSION: &str = "docflow-1";

/// Key for a node: its full spec, implementation version and ordered
/// upstream fingerprints.
///
/// `serde_json::Map` is ordered by key, so the canonical form does not depend
/// on the order parameters were written in the config.
pub fn node_fingerprint(
    spec: &OperationSpec,
    op_version: &str,
    upstream: &[(Option<&str>, &str)],
) -> String {
    let upstream: Vec<_> = upstream
        .iter()
        .map(|(role, fp)| json!({ "role": role, "fingerprint": fp }))
        .collect();
    let canonical = json!({
        "engine": ENGINE_VERSION,
        "spec": spec,
        "op_version": op_version,
        "upstream": upstream,
    });
    digest(canonical.to_string().as_bytes())
}

/// Key for a loaded dataset: name, declared version and record content.
pub fn dataset_fingerprint(name: &str, version: Option<&str>, records: &[Record]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ENGINE_VERSION.as_bytes());
    hasher.update([0]);
    hasher.update(name.as_bytes());
    hasher.update([0]);
    hasher.update(version.unwrap_or("").as_bytes());
    hasher.update([0]);
    for record in records {
        hasher.update(serde_json::Value::Object(record.clone()).to_string().as_bytes());
        hasher.update([b'\n']);
    }
    hex::encode(hasher.finalize())
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// First 12 hex chars, for log lines.
pub fn short(fp: &str) -> &str {
    fp.get(..12).unwrap_or(fp)
}
