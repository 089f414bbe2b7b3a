//! Equijoin across two named upstreams.

use super::Params;
use crate::{OpContext, Operation, OperationError, OperationInput, RegistryError};
use async_trait::async_trait;
use df_core::pipeline::OperationSpec;
use df_core::record::{lookup_path, Record};
use std::collections::HashMap;

/// Joins `left` and `right` on `left_key == right_key`.
///
/// Output follows left order, then right order within each left record.
/// Fields present on both sides with different values are kept as
/// `<field>_left` / `<field>_right`.
#[derive(Debug)]
pub struct Equijoin {
    spec: OperationSpec,
    left_key: String,
    right_key: String,
}

impl Equijoin {
    pub fn new(spec: &OperationSpec) -> Result<Self, RegistryError> {
        let mut p = Params::new(spec);
        let left_key = p.required_str("left_key");
        let right_key = p.required_str("right_key");
        p.finish()?;
        Ok(Self {
            spec: spec.clone(),
            left_key,
            right_key,
        })
    }
}

fn merge(left: &Record, right: &Record) -> Record {
    let mut out = left.clone();
    for (k, rv) in right {
        match left.get(k) {
            None => {
                out.insert(k.clone(), rv.clone());
            }
            Some(lv) if lv == rv => {}
            Some(lv) => {
                out.remove(k);
                out.insert(format!("{k}_left"), lv.clone());
                out.insert(format!("{k}_right"), rv.clone());
            }
        }
    }
    out
}

#[async_trait]
impl Operation for Equijoin {
    fn spec(&self) -> &OperationSpec {
        &self.spec
    }

    fn input_roles(&self) -> &[&'static str] {
        &["left", "right"]
    }

    async fn execute(&self, input: OperationInput, _ctx: &OpContext) -> Result<Vec<Record>, OperationError> {
        let missing = |role: &str| {
            OperationError::ExecutionFailed(format!("equijoin '{}' has no '{role}' input", self.spec.name))
        };
        let left = input.role("left").ok_or_else(|| missing("left"))?;
        let right = input.role("right").ok_or_else(|| missing("right"))?;

        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, r) in right.iter().enumerate() {
            if let Some(key) = lookup_path(r, &self.right_key) {
                index.entry(key.to_string()).or_default().push(i);
            }
        }

        let mut out = Vec::new();
        for l in left.iter() {
            let Some(key) = lookup_path(l, &self.left_key) else {
                continue;
            };
            if let Some(matches) = index.get(&key.to_string()) {
                for &i in matches {
                    out.push(merge(l, &right[i]));
                }
            }
        }
        tracing::debug!(
            op = %self.spec.name,
            left = left.len(),
            right = right.len(),
            joined = out.len(),
            "equijoin complete"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::test_support::records;
    use crate::Upstream;
    use serde_json::json;
    use std::sync::Arc;

    fn join() -> Equijoin {
        Equijoin::new(
            &OperationSpec::new("j", "equijoin")
                .with_param("left_key", "vendor")
                .with_param("right_key", "name"),
        )
        .unwrap()
    }

    fn input(left: serde_json::Value, right: serde_json::Value) -> OperationInput {
        OperationInput {
            upstreams: vec![
                Upstream { role: Some("left".into()), records: Arc::new(records(left)) },
                Upstream { role: Some("right".into()), records: Arc::new(records(right)) },
            ],
        }
    }

    #[tokio::test]
    async fn joins_on_key_equality() {
        let out = join()
            .execute(
                input(
                    json!([{"vendor": "acme", "total": 3}, {"vendor": "zeta", "total": 1}, {"vendor": "acme", "total": 9}]),
                    json!([{"name": "acme", "country": "DE", "total": 0}]),
                ),
                &OpContext::structural("s/j"),
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["country"], "DE");
        assert_eq!(out[0]["total_left"], 3);
        assert_eq!(out[0]["total_right"], 0);
        assert_eq!(out[1]["total_left"], 9);
    }

    #[tokio::test]
    async fn missing_role_is_an_error() {
        let err = join()
            .execute(OperationInput::single(vec![]), &OpContext::structural("s/j"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no 'left' input"));
    }

    #[test]
    fn declares_roles() {
        assert_eq!(join().input_roles(), &["left", "right"]);
    }
}
