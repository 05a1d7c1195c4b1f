// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Addressing of the resource kinds the steward interacts with.

use kube::core::{ApiResource, GroupVersionKind};

/// The closed set of resource kinds consumed through the platform adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// CNPG `Cluster` custom resource.
    PostgresCluster,
    /// MariaDB operator `MariaDB` custom resource.
    GaleraCluster,
    Pod,
    PersistentVolumeClaim,
    Secret,
    StatefulSet,
}

impl ResourceKind {
    /// `(group, version, kind, plural)` of the underlying API resource.
    pub fn gvk(&self) -> (&'static str, &'static str, &'static str, &'static str) {
        match self {
            Self::PostgresCluster => ("postgresql.cnpg.io", "v1", "Cluster", "clusters"),
            Self::GaleraCluster => ("k8s.mariadb.com", "v1alpha1", "MariaDB", "mariadbs"),
            Self::Pod => ("", "v1", "Pod", "pods"),
            Self::PersistentVolumeClaim => {
                ("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims")
            }
            Self::Secret => ("", "v1", "Secret", "secrets"),
            Self::StatefulSet => ("apps", "v1", "StatefulSet", "statefulsets"),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        self.gvk().2
    }

    /// The dynamic-API descriptor for this kind.
    pub fn api_resource(&self) -> ApiResource {
        let (group, version, kind, plural) = self.gvk();
        ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, version, kind), plural)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_resources_have_expected_coordinates() {
        let ar = ResourceKind::PostgresCluster.api_resource();
        assert_eq!(ar.group, "postgresql.cnpg.io");
        assert_eq!(ar.plural, "clusters");

        let ar = ResourceKind::GaleraCluster.api_resource();
        assert_eq!(ar.api_version, "k8s.mariadb.com/v1alpha1");
        assert_eq!(ar.plural, "mariadbs");
    }
}
