// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Identification of managed clusters, instances, and their volumes.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// The database engine family managing a cluster.
///
/// Engines are a closed set; a string lookup exists only for the CLI
/// boundary via [`FromStr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// CNPG-style PostgreSQL cluster: one primary plus streaming replicas,
    /// with fenceable instances.
    Postgres,
    /// Multi-master Galera MariaDB cluster, quorum-based.
    Galera,
}

impl EngineKind {
    /// The identifier used in snapshot tags and log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Galera => "galera",
        }
    }

    /// The database container name inside an instance pod.
    pub fn container(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Galera => "mariadb",
        }
    }

    /// The virtual dump filename used inside archive snapshots.
    pub fn dump_filename(&self) -> &'static str {
        match self {
            Self::Postgres => "pgdumpall.sql",
            Self::Galera => "mysqldump.sql",
        }
    }

    /// The label selector matching all instance pods of the named cluster.
    pub fn pod_selector(&self, cluster: &str) -> String {
        match self {
            Self::Postgres => format!("cnpg.io/cluster={cluster}"),
            Self::Galera => format!("app.kubernetes.io/instance={cluster}"),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown engine name.
#[derive(Debug, thiserror::Error)]
#[error("unknown engine {0:?} (valid: postgres, galera)")]
pub struct UnknownEngine(pub String);

impl FromStr for EngineKind {
    type Err = UnknownEngine;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "cnpg" is accepted as an alias since that is the operator name
        // Postgres users know.
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "pg" | "cnpg" => Ok(Self::Postgres),
            "galera" | "mariadb" => Ok(Self::Galera),
            other => Err(UnknownEngine(other.to_owned())),
        }
    }
}

/// Uniquely identifies a managed database cluster across all interactions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterRef {
    pub engine: EngineKind,
    pub namespace: String,
    pub cluster: String,
}

impl ClusterRef {
    pub fn new(engine: EngineKind, namespace: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            engine,
            namespace: namespace.into(),
            cluster: cluster.into(),
        }
    }

    /// The pod name of the instance with the given ordinal.
    pub fn instance_name(&self, ordinal: u32) -> String {
        format!("{}-{ordinal}", self.cluster)
    }

    /// The virtual path of this cluster's dump inside a snapshot.
    pub fn dump_path(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.cluster, self.engine.dump_filename())
    }

    /// The virtual path of a per-instance diverged dump inside a snapshot.
    pub fn diverged_dump_path(&self, ordinal: u32) -> String {
        format!(
            "{}/{}/{ordinal}-{}",
            self.namespace,
            self.cluster,
            self.engine.dump_filename()
        )
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.engine, self.namespace, self.cluster)
    }
}

/// Extracts the instance ordinal from a pod name of the form `<cluster>-<n>`.
pub fn instance_ordinal(pod: &str) -> Option<u32> {
    pod.rsplit('-').next()?.parse().ok()
}

/// Mount path of the Postgres data volume inside instance and helper pods.
pub const PG_DATA_MOUNT: &str = "/var/lib/postgresql/data";
/// Data directory below [`PG_DATA_MOUNT`].
pub const PG_DATA_DIR: &str = "/var/lib/postgresql/data/pgdata";
/// Mount path of the Galera storage volume.
pub const GALERA_DATA_MOUNT: &str = "/var/lib/mysql";
/// Mount path of the optional Galera config volume.
pub const GALERA_CONFIG_MOUNT: &str = "/galera";

/// The data volume claim of a Postgres instance (claim name equals the pod name).
pub fn postgres_data_claim(pod: &str) -> String {
    pod.to_owned()
}

/// The storage volume claim of a Galera node.
pub fn galera_storage_claim(pod: &str) -> String {
    format!("storage-{pod}")
}

/// The optional config volume claim of a Galera node.
pub fn galera_config_claim(pod: &str) -> String {
    format!("galera-{pod}")
}

#[cfg(test)]
mod tests {
    use hasteward_test_utils::param_test;

    use super::*;

    param_test! {
        engine_from_str: [
            postgres: ("postgres", Some(EngineKind::Postgres)),
            cnpg_alias: ("cnpg", Some(EngineKind::Postgres)),
            galera: ("galera", Some(EngineKind::Galera)),
            mariadb_alias: ("MariaDB", Some(EngineKind::Galera)),
            unknown: ("mysql8", None),
        ]
    }
    fn engine_from_str(input: &str, expected: Option<EngineKind>) {
        assert_eq!(input.parse::<EngineKind>().ok(), expected);
    }

    param_test! {
        ordinal_from_pod_name: [
            simple: ("db-2", Some(2)),
            dashed_cluster: ("my-cluster-11", Some(11)),
            no_ordinal: ("db-primary", None),
        ]
    }
    fn ordinal_from_pod_name(pod: &str, expected: Option<u32>) {
        assert_eq!(instance_ordinal(pod), expected);
    }

    #[test]
    fn dump_paths() {
        let cluster = ClusterRef::new(EngineKind::Postgres, "prod", "orders-db");
        assert_eq!(cluster.dump_path(), "prod/orders-db/pgdumpall.sql");
        assert_eq!(cluster.diverged_dump_path(2), "prod/orders-db/2-pgdumpall.sql");
        assert_eq!(cluster.instance_name(1), "orders-db-1");
    }

    #[test]
    fn volume_claims() {
        assert_eq!(postgres_data_claim("db-1"), "db-1");
        assert_eq!(galera_storage_claim("gdb-0"), "storage-gdb-0");
        assert_eq!(galera_config_claim("gdb-0"), "galera-gdb-0");
    }
}
