//! Per-user session record.
//!
//! Every type here owns its data, so `Clone` is a full deep copy. The store
//! relies on that to hand out copies that share nothing with its cache.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Durable per-user configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "k8sConfig", default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterAccess>,
    #[serde(rename = "meshAdapters", default, skip_serializing_if = "Vec::is_empty")]
    pub adapters: Vec<Adapter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grafana: Option<GrafanaConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusConfig>,
}

impl Session {
    /// Cluster access that adapters can be configured with, if any.
    pub fn valid_cluster(&self) -> Option<&ClusterAccess> {
        self.cluster.as_ref().filter(|cluster| cluster.is_valid())
    }

    pub fn find_adapter(&self, location: &str) -> Option<&Adapter> {
        self.adapters
            .iter()
            .find(|adapter| adapter.location == location)
    }

    pub fn prometheus_url(&self) -> Option<&str> {
        self.prometheus
            .as_ref()
            .map(|prometheus| prometheus.url.as_str())
            .filter(|url| !url.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAccess {
    #[serde(rename = "inClusterConfig", default)]
    pub in_cluster: bool,
    #[serde(rename = "k8sfile", default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    /// Raw kubeconfig bytes, base64 on the wire.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<u8>,
    #[serde(rename = "configuredServer", default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context_name: String,
    #[serde(default)]
    pub cluster_configured: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<ClusterNode>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_version: String,
}

impl ClusterAccess {
    pub fn is_valid(&self) -> bool {
        self.in_cluster || !self.config.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub internal_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os_image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubelet_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_runtime_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub allocatable_cpu: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub allocatable_memory: String,
}

/// One configured adapter. `location` is the identity used everywhere else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adapter {
    #[serde(rename = "adapter_location")]
    pub location: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ops: Vec<String>,
}

impl Adapter {
    pub fn at(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrafanaConfig {
    #[serde(rename = "grafanaURL", default)]
    pub url: String,
    #[serde(rename = "grafanaAPIKey", default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(rename = "selectedBoardsConfigs", default, skip_serializing_if = "Vec::is_empty")]
    pub boards: Vec<SelectedBoardConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(rename = "prometheusURL", default)]
    pub url: String,
    #[serde(
        rename = "selectedPrometheusBoardsConfigs",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub boards: Vec<SelectedBoardConfig>,
}

/// Dashboard selection. Board and panel bodies are kept as opaque JSON; their
/// schema belongs to the dashboard product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectedBoardConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub panels: Vec<Value>,
    #[serde(rename = "templateVars", default, skip_serializing_if = "Vec::is_empty")]
    pub template_vars: Vec<String>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) if !encoded.is_empty() => STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cluster_validity_follows_in_cluster_or_config() {
        let mut cluster = ClusterAccess::default();
        assert!(!cluster.is_valid());
        cluster.config = b"apiVersion: v1".to_vec();
        assert!(cluster.is_valid());
        cluster.config.clear();
        cluster.in_cluster = true;
        assert!(cluster.is_valid());
    }

    #[test]
    fn decodes_wire_field_names() {
        let session: Session = serde_json::from_value(json!({
            "k8sConfig": {
                "config": "YXBpVmVyc2lvbjogdjE=",
                "contextName": "kind-dev",
                "configuredServer": "https://127.0.0.1:6443"
            },
            "meshAdapters": [
                { "adapter_location": "localhost:10000", "name": "ISTIO", "ops": ["install"] }
            ],
            "prometheus": { "prometheusURL": "http://prometheus:9090" }
        }))
        .expect("decode session");

        let cluster = session.valid_cluster().expect("valid cluster");
        assert_eq!(cluster.config, b"apiVersion: v1");
        assert_eq!(cluster.context_name, "kind-dev");
        assert_eq!(session.adapters[0].name, "ISTIO");
        assert_eq!(session.prometheus_url(), Some("http://prometheus:9090"));
        assert!(session.find_adapter("localhost:10000").is_some());
    }

    #[test]
    fn empty_session_serializes_to_empty_object() {
        let value = serde_json::to_value(Session::default()).expect("encode");
        assert_eq!(value, json!({}));
    }
}
