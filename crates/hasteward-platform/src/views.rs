// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Typed views over the custom resources the steward reads.
//!
//! The platform hands resources over as loose JSON; these records project
//! the fields the engines rely on, with `Option`/empty defaults marking
//! genuinely missing data. The raw value is retained for the rare field no
//! view exposes.

use hasteward_core::evidence::{GaleraRecovery, PodObservation, PodPhase};
use serde_json::Value;

/// Annotation on the CNPG cluster holding the fenced-instance list as a JSON
/// string array in the annotation value.
pub const FENCE_ANNOTATION: &str = "cnpg.io/fencedInstances";

fn path<'a>(value: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

fn path_str(value: &Value, segments: &[&str]) -> Option<String> {
    path(value, segments)?.as_str().map(str::to_owned)
}

fn path_i64(value: &Value, segments: &[&str]) -> Option<i64> {
    path(value, segments)?.as_i64()
}

fn path_string_list(value: &Value, segments: &[&str]) -> Vec<String> {
    path(value, segments)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Decodes the fence annotation value. Empty or `"[]"` means no fence.
pub fn parse_fence_list(annotation: &str) -> Vec<String> {
    if annotation.is_empty() {
        return Vec::new();
    }
    serde_json::from_str(annotation).unwrap_or_default()
}

/// Encodes a fence list for the annotation value.
pub fn encode_fence_list(instances: &[String]) -> String {
    serde_json::to_string(instances).expect("string arrays always serialize")
}

/// Builds the merge patch setting (or, for an empty list, clearing) the
/// fence annotation.
pub fn fence_patch(instances: &[String]) -> Value {
    let value = if instances.is_empty() {
        Value::Null
    } else {
        Value::String(encode_fence_list(instances))
    };
    serde_json::json!({
        "metadata": { "annotations": { FENCE_ANNOTATION: value } }
    })
}

/// Projection of a CNPG `Cluster` resource.
#[derive(Debug, Clone, Default)]
pub struct PostgresClusterView {
    pub instances: i64,
    pub image_name: Option<String>,
    pub current_primary: Option<String>,
    pub target_primary: Option<String>,
    pub instance_names: Vec<String>,
    pub ready_instances: i64,
    pub phase: Option<String>,
    pub timeline_id: Option<i64>,
    pub dangling_pvcs: Vec<String>,
    pub healthy_pvcs: Vec<String>,
    pub fenced_instances: Vec<String>,
    raw: Value,
}

impl PostgresClusterView {
    pub fn from_value(raw: Value) -> Self {
        let fenced_instances = path_str(&raw, &["metadata", "annotations", FENCE_ANNOTATION])
            .map(|annotation| parse_fence_list(&annotation))
            .unwrap_or_default();
        Self {
            instances: path_i64(&raw, &["spec", "instances"]).unwrap_or(0),
            image_name: path_str(&raw, &["spec", "imageName"]),
            current_primary: path_str(&raw, &["status", "currentPrimary"]),
            target_primary: path_str(&raw, &["status", "targetPrimary"]),
            instance_names: path_string_list(&raw, &["status", "instanceNames"]),
            ready_instances: path_i64(&raw, &["status", "readyInstances"]).unwrap_or(0),
            phase: path_str(&raw, &["status", "phase"]),
            timeline_id: path_i64(&raw, &["status", "timelineID"]),
            dangling_pvcs: path_string_list(&raw, &["status", "danglingPVC"]),
            healthy_pvcs: path_string_list(&raw, &["status", "healthyPVC"]),
            fenced_instances,
            raw,
        }
    }

    /// Fallback accessor for fields the view does not expose.
    pub fn raw_path(&self, segments: &[&str]) -> Option<&Value> {
        path(&self.raw, segments)
    }
}

/// Secret key reference of the Galera root password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// Projection of a MariaDB operator `MariaDB` resource.
#[derive(Debug, Clone, Default)]
pub struct GaleraClusterView {
    pub replicas: i64,
    pub image: Option<String>,
    pub suspended: bool,
    pub root_password_secret: Option<SecretKeyRef>,
    /// Status of the `Ready` condition.
    pub ready_status: Option<String>,
    /// Status of the `GaleraReady` condition.
    pub galera_ready_status: Option<String>,
    pub recovery: GaleraRecovery,
    raw: Value,
}

impl GaleraClusterView {
    pub fn from_value(raw: Value) -> Self {
        let root_password_secret = path(&raw, &["spec", "rootPasswordSecretKeyRef"])
            .and_then(|secret_ref| {
                Some(SecretKeyRef {
                    name: secret_ref.get("name")?.as_str()?.to_owned(),
                    key: secret_ref.get("key")?.as_str()?.to_owned(),
                })
            });
        Self {
            replicas: path_i64(&raw, &["spec", "replicas"]).unwrap_or(0),
            image: path_str(&raw, &["spec", "image"]),
            suspended: path(&raw, &["spec", "suspend"])
                .and_then(Value::as_bool)
                .unwrap_or(false),
            root_password_secret,
            ready_status: condition_status(&raw, "Ready"),
            galera_ready_status: condition_status(&raw, "GaleraReady"),
            recovery: parse_recovery(&raw),
            raw,
        }
    }

    /// Fallback accessor for fields the view does not expose.
    pub fn raw_path(&self, segments: &[&str]) -> Option<&Value> {
        path(&self.raw, segments)
    }
}

fn condition_status(raw: &Value, condition_type: &str) -> Option<String> {
    path(raw, &["status", "conditions"])?
        .as_array()?
        .iter()
        .find(|condition| {
            condition.get("type").and_then(Value::as_str) == Some(condition_type)
        })?
        .get("status")?
        .as_str()
        .map(str::to_owned)
}

fn parse_recovery(raw: &Value) -> GaleraRecovery {
    GaleraRecovery {
        recovered: recovery_map(raw, "recovered"),
        state: recovery_map(raw, "state"),
    }
}

fn recovery_map(raw: &Value, field: &str) -> std::collections::BTreeMap<String, i64> {
    path(raw, &["status", "galeraRecovery", field])
        .and_then(Value::as_object)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|(pod, entry)| Some((pod.clone(), entry.get("seqno")?.as_i64()?)))
                .collect()
        })
        .unwrap_or_default()
}

/// Projects a pod resource into the observation shape the analyzer consumes.
pub fn parse_pod(raw: &Value) -> Option<PodObservation> {
    let name = path_str(raw, &["metadata", "name"])?;
    let phase = path_str(raw, &["status", "phase"])
        .map_or(PodPhase::Unknown, |phase| PodPhase::parse(&phase));
    let first_container = path(raw, &["status", "containerStatuses"])
        .and_then(Value::as_array)
        .and_then(|statuses| statuses.first());
    Some(PodObservation {
        name,
        phase,
        ready: first_container
            .and_then(|status| status.get("ready"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
        restarts: first_container
            .and_then(|status| status.get("restartCount"))
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32,
        node_name: path_str(raw, &["spec", "nodeName"]),
        pod_ip: path_str(raw, &["status", "podIP"]),
    })
}

/// The phase of a persistent volume claim resource.
pub fn pvc_phase(raw: &Value) -> Option<String> {
    path_str(raw, &["status", "phase"])
}

#[cfg(test)]
mod tests {
    use hasteward_test_utils::param_test;
    use serde_json::json;

    use super::*;

    param_test! {
        fence_list_decoding: [
            empty_string: ("", Vec::new()),
            empty_array: ("[]", Vec::new()),
            one_member: (r#"["db-2"]"#, vec!["db-2".to_owned()]),
            two_members: (r#"["db-1","db-2"]"#, vec!["db-1".to_owned(), "db-2".to_owned()]),
            malformed: ("{not json", Vec::new()),
        ]
    }
    fn fence_list_decoding(annotation: &str, expected: Vec<String>) {
        assert_eq!(parse_fence_list(annotation), expected);
    }

    #[test]
    fn fence_patch_clears_annotation_when_empty() {
        let patch = fence_patch(&[]);
        assert_eq!(
            patch["metadata"]["annotations"][FENCE_ANNOTATION],
            Value::Null
        );

        let patch = fence_patch(&["db-2".to_owned()]);
        assert_eq!(
            patch["metadata"]["annotations"][FENCE_ANNOTATION],
            json!(r#"["db-2"]"#)
        );
    }

    #[test]
    fn postgres_view_projects_fields() {
        let view = PostgresClusterView::from_value(json!({
            "metadata": {
                "annotations": { FENCE_ANNOTATION: r#"["db-2"]"# }
            },
            "spec": { "instances": 3, "imageName": "ghcr.io/cloudnative-pg/postgresql:16.2" },
            "status": {
                "currentPrimary": "db-1",
                "targetPrimary": "db-1",
                "instanceNames": ["db-1", "db-2", "db-3"],
                "readyInstances": 2,
                "phase": "Cluster in healthy state",
                "timelineID": 5,
                "danglingPVC": ["db-3"],
            }
        }));

        assert_eq!(view.instances, 3);
        assert_eq!(view.current_primary.as_deref(), Some("db-1"));
        assert_eq!(view.instance_names.len(), 3);
        assert_eq!(view.fenced_instances, vec!["db-2".to_owned()]);
        assert_eq!(view.dangling_pvcs, vec!["db-3".to_owned()]);
        assert_eq!(view.timeline_id, Some(5));
        // Unprojected fields stay reachable through the raw value.
        assert_eq!(
            view.raw_path(&["status", "phase"]).and_then(Value::as_str),
            Some("Cluster in healthy state"),
        );
    }

    #[test]
    fn galera_view_projects_conditions_and_recovery() {
        let view = GaleraClusterView::from_value(json!({
            "spec": {
                "replicas": 3,
                "image": "mariadb:11.4",
                "suspend": true,
                "rootPasswordSecretKeyRef": { "name": "gdb-root", "key": "password" },
            },
            "status": {
                "conditions": [
                    { "type": "Ready", "status": "False" },
                    { "type": "GaleraReady", "status": "True" },
                ],
                "galeraRecovery": {
                    "recovered": { "gdb-0": { "seqno": 42 }, "gdb-1": { "seqno": 40 } },
                    "state": { "gdb-0": { "seqno": 41 } },
                },
            }
        }));

        assert_eq!(view.replicas, 3);
        assert!(view.suspended);
        assert_eq!(
            view.root_password_secret,
            Some(SecretKeyRef {
                name: "gdb-root".to_owned(),
                key: "password".to_owned()
            })
        );
        assert_eq!(view.ready_status.as_deref(), Some("False"));
        assert_eq!(view.galera_ready_status.as_deref(), Some("True"));
        assert_eq!(view.recovery.recovered_seqno("gdb-0"), 42);
        assert_eq!(view.recovery.state_seqno("gdb-0"), 41);
        assert_eq!(view.recovery.recovered_seqno("gdb-2"), -1);
    }

    #[test]
    fn pod_projection() {
        let pod = parse_pod(&json!({
            "metadata": { "name": "db-2" },
            "spec": { "nodeName": "worker-1" },
            "status": {
                "phase": "Running",
                "podIP": "10.0.4.2",
                "containerStatuses": [ { "ready": false, "restartCount": 7 } ],
            }
        }))
        .unwrap();

        assert_eq!(pod.name, "db-2");
        assert_eq!(pod.phase, PodPhase::Running);
        assert!(!pod.ready);
        assert!(pod.is_crashloop());
        assert_eq!(pod.restarts, 7);
        assert_eq!(pod.node_name.as_deref(), Some("worker-1"));
    }
}
