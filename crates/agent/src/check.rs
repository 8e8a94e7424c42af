//! Offline permission check of manifests against an executor.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use spoke_apply::resolve_manifest;
use spoke_auth::{ExecuteAction, ExecutorValidator};
use spoke_core::ManifestWorkExecutor;
use spoke_kubehub::RestMapping;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Split a multi-document YAML stream into JSON manifests, skipping empty
/// documents.
pub fn parse_manifests(yaml: &str) -> Result<Vec<Json>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let v = Json::deserialize(doc).with_context(|| format!("parsing YAML document {}", i))?;
        if !v.is_null() {
            out.push(v);
        }
    }
    Ok(out)
}

/// Parse `ns/name` into a service-account executor.
pub fn parse_executor(s: &str) -> Result<ManifestWorkExecutor> {
    match s.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok(ManifestWorkExecutor::service_account(ns, name))
        }
        _ => anyhow::bail!("executor must be <namespace>/<name>, got {:?}", s),
    }
}

pub async fn check_manifests(
    validator: &dyn ExecutorValidator,
    mapper: &dyn RestMapping,
    executor: &ManifestWorkExecutor,
    manifests: &[Json],
    action: ExecuteAction,
) -> Vec<CheckOutcome> {
    let mut out = Vec::with_capacity(manifests.len());
    for raw in manifests {
        let target = match resolve_manifest(mapper, raw) {
            Ok(t) => t,
            Err(e) => {
                out.push(CheckOutcome {
                    resource: String::new(),
                    namespace: String::new(),
                    name: String::new(),
                    allowed: false,
                    reason: Some(e.to_string()),
                });
                continue;
            }
        };
        let (ns, name) = (target.identity.namespace.as_str(), target.identity.name.as_str());
        let res = validator.validate(Some(executor), &target.gvr, ns, name, Some(&target.obj), action).await;
        out.push(CheckOutcome {
            resource: target.gvr.to_string(),
            namespace: ns.to_string(),
            name: name.to_string(),
            allowed: res.is_ok(),
            reason: res.err().map(|e| e.to_string()),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use spoke_auth::SarValidator;
    use spoke_kubehub::{
        fake::{named_rule, FakeCluster},
        ResourceMapper,
    };
    use std::sync::Arc;

    const TWO_MAPS: &str = "\
apiVersion: v1
kind: ConfigMap
metadata: {name: cm1, namespace: ns1}
---
---
apiVersion: v1
kind: ConfigMap
metadata: {name: cm2, namespace: ns1}
";

    #[test]
    fn yaml_stream_skips_empty_documents() {
        let docs = parse_manifests(TWO_MAPS).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["metadata"]["name"], "cm2");
        assert!(parse_manifests("a: [").is_err());
    }

    #[test]
    fn executor_flag_format() {
        assert_eq!(parse_executor("ns1/sa").unwrap(), ManifestWorkExecutor::service_account("ns1", "sa"));
        assert!(parse_executor("sa").is_err());
        assert!(parse_executor("ns1/").is_err());
        assert!(parse_executor("a/b/c").is_err());
    }

    #[tokio::test]
    async fn reports_each_manifest() {
        let c = FakeCluster::new();
        c.grant_role(
            "ns1",
            "cm1-writer",
            ("ns1", "executor"),
            vec![named_rule(&["create", "update", "patch", "get"], &[""], &["configmaps"], &["cm1"])],
        )
        .unwrap();
        let validator = SarValidator::new(c.clone(), Arc::new(c.impersonation()));
        let executor = parse_executor("ns1/executor").unwrap();
        let docs = parse_manifests(TWO_MAPS).unwrap();

        let out = check_manifests(&validator, &ResourceMapper::builtin(), &executor, &docs, ExecuteAction::Apply).await;
        assert_eq!(out.len(), 2);
        assert!(out[0].allowed && out[0].reason.is_none());
        assert_eq!(out[0].resource, "v1.configmaps");
        assert!(!out[1].allowed);
        assert!(out[1].reason.as_deref().unwrap().contains("not allowed to apply"));
        assert!(c.writes().is_empty());
    }
}
