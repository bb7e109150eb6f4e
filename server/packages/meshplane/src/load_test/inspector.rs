use meshplane_adapter_client::BoxFuture;
use meshplane_session_store::{ClusterAccess, ClusterNode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::LoadTestError;

const IN_CLUSTER_API: &str = "https://kubernetes.default.svc";
const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Image name fragments that identify a mesh control plane.
const MESH_SIGNATURES: &[(&str, &str)] = &[
    ("istio/pilot", "istio"),
    ("linkerd", "linkerd"),
    ("consul", "consul"),
    ("kuma-cp", "kuma"),
    ("nginx-mesh", "nginx-sm"),
    ("openservicemesh", "osm"),
    ("traefik-mesh", "traefik-mesh"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedAdapter {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Read-only cluster lookups used to enrich load-test results.
pub trait ClusterInspector: Send + Sync + 'static {
    fn nodes<'a>(
        &'a self,
        cluster: &'a ClusterAccess,
    ) -> BoxFuture<'a, Result<Vec<ClusterNode>, LoadTestError>>;

    fn server_version<'a>(
        &'a self,
        cluster: &'a ClusterAccess,
    ) -> BoxFuture<'a, Result<String, LoadTestError>>;

    fn detect_adapters<'a>(
        &'a self,
        cluster: &'a ClusterAccess,
    ) -> BoxFuture<'a, Result<Vec<DetectedAdapter>, LoadTestError>>;
}

/// Talks to the cluster API server recorded in the session.
#[derive(Debug, Clone)]
pub struct HttpClusterInspector {
    http: Client,
}

impl HttpClusterInspector {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    async fn get_json(
        &self,
        cluster: &ClusterAccess,
        path: &str,
        what: &'static str,
    ) -> Result<Value, LoadTestError> {
        let inspect = |message: String| LoadTestError::Inspect { what, message };
        let base = api_server(cluster).ok_or_else(|| inspect("cluster api server is unknown".to_string()))?;
        let url = base.join(path).map_err(|err| inspect(err.to_string()))?;

        let mut request = self.http.get(url);
        if cluster.in_cluster {
            if let Ok(token) = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN) {
                request = request.bearer_auth(token.trim());
            }
        }
        let response = request
            .send()
            .await
            .map_err(|err| inspect(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(inspect(format!("api server responded with {status}")));
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| inspect(err.to_string()))
    }
}

impl ClusterInspector for HttpClusterInspector {
    fn nodes<'a>(
        &'a self,
        cluster: &'a ClusterAccess,
    ) -> BoxFuture<'a, Result<Vec<ClusterNode>, LoadTestError>> {
        Box::pin(async move {
            let list = self.get_json(cluster, "api/v1/nodes", "cluster nodes").await?;
            Ok(parse_nodes(&list))
        })
    }

    fn server_version<'a>(
        &'a self,
        cluster: &'a ClusterAccess,
    ) -> BoxFuture<'a, Result<String, LoadTestError>> {
        Box::pin(async move {
            let info = self.get_json(cluster, "version", "server version").await?;
            Ok(str_at(&info, &["gitVersion"]))
        })
    }

    fn detect_adapters<'a>(
        &'a self,
        cluster: &'a ClusterAccess,
    ) -> BoxFuture<'a, Result<Vec<DetectedAdapter>, LoadTestError>> {
        Box::pin(async move {
            let pods = self.get_json(cluster, "api/v1/pods", "installed meshes").await?;
            Ok(detect_meshes(&pods))
        })
    }
}

fn api_server(cluster: &ClusterAccess) -> Option<Url> {
    let server = match cluster.server.trim() {
        "" if cluster.in_cluster => IN_CLUSTER_API,
        "" => return None,
        server => server,
    };
    let normalized = if server.ends_with('/') {
        server.to_string()
    } else {
        format!("{server}/")
    };
    Url::parse(&normalized).ok()
}

fn str_at(value: &Value, path: &[&str]) -> String {
    path.iter()
        .try_fold(value, |value, key| value.get(key))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_nodes(list: &Value) -> Vec<ClusterNode> {
    let items = list
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    items
        .iter()
        .map(|item| {
            let address = |kind: &str| {
                item.pointer("/status/addresses")
                    .and_then(Value::as_array)
                    .and_then(|addresses| {
                        addresses
                            .iter()
                            .find(|address| address.get("type").and_then(Value::as_str) == Some(kind))
                    })
                    .map(|address| str_at(address, &["address"]))
                    .unwrap_or_default()
            };
            ClusterNode {
                name: str_at(item, &["metadata", "name"]),
                internal_ip: address("InternalIP"),
                hostname: address("Hostname"),
                os_image: str_at(item, &["status", "nodeInfo", "osImage"]),
                kubelet_version: str_at(item, &["status", "nodeInfo", "kubeletVersion"]),
                container_runtime_version: str_at(
                    item,
                    &["status", "nodeInfo", "containerRuntimeVersion"],
                ),
                architecture: str_at(item, &["status", "nodeInfo", "architecture"]),
                allocatable_cpu: str_at(item, &["status", "allocatable", "cpu"]),
                allocatable_memory: str_at(item, &["status", "allocatable", "memory"]),
            }
        })
        .collect()
}

fn detect_meshes(pods: &Value) -> Vec<DetectedAdapter> {
    let mut detected: Vec<DetectedAdapter> = Vec::new();
    let items = pods
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for pod in items {
        let namespace = str_at(pod, &["metadata", "namespace"]);
        let containers = pod
            .pointer("/spec/containers")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for container in containers {
            let image = str_at(container, &["image"]);
            let Some((_, mesh)) = MESH_SIGNATURES
                .iter()
                .find(|(signature, _)| image.contains(signature))
            else {
                continue;
            };
            if detected.iter().any(|existing| existing.name == *mesh) {
                continue;
            }
            let version = image
                .rsplit_once(':')
                .map(|(_, tag)| tag.to_string())
                .filter(|tag| !tag.contains('/'))
                .unwrap_or_default();
            detected.push(DetectedAdapter {
                name: mesh.to_string(),
                version,
                namespace: namespace.clone(),
            });
        }
    }
    detected
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_node_list() {
        let list = json!({
            "items": [{
                "metadata": {"name": "worker-1"},
                "status": {
                    "addresses": [
                        {"type": "InternalIP", "address": "10.0.0.4"},
                        {"type": "Hostname", "address": "worker-1"}
                    ],
                    "nodeInfo": {
                        "osImage": "Ubuntu 22.04",
                        "kubeletVersion": "v1.29.2",
                        "containerRuntimeVersion": "containerd://1.7.13",
                        "architecture": "amd64"
                    },
                    "allocatable": {"cpu": "4", "memory": "16Gi"}
                }
            }]
        });
        let nodes = parse_nodes(&list);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "worker-1");
        assert_eq!(nodes[0].internal_ip, "10.0.0.4");
        assert_eq!(nodes[0].kubelet_version, "v1.29.2");
        assert_eq!(nodes[0].allocatable_memory, "16Gi");
    }

    #[test]
    fn detects_each_mesh_once() {
        let pods = json!({
            "items": [
                {"metadata": {"namespace": "istio-system"},
                 "spec": {"containers": [{"image": "docker.io/istio/pilot:1.21.0"}]}},
                {"metadata": {"namespace": "istio-system"},
                 "spec": {"containers": [{"image": "docker.io/istio/pilot:1.21.0"}]}},
                {"metadata": {"namespace": "default"},
                 "spec": {"containers": [{"image": "nginx:1.25"}]}},
                {"metadata": {"namespace": "linkerd"},
                 "spec": {"containers": [{"image": "cr.l5d.io/linkerd/controller:stable-2.14.10"}]}}
            ]
        });
        let detected = detect_meshes(&pods);
        assert_eq!(
            detected,
            vec![
                DetectedAdapter {
                    name: "istio".to_string(),
                    version: "1.21.0".to_string(),
                    namespace: "istio-system".to_string(),
                },
                DetectedAdapter {
                    name: "linkerd".to_string(),
                    version: "stable-2.14.10".to_string(),
                    namespace: "linkerd".to_string(),
                },
            ]
        );
    }

    #[test]
    fn in_cluster_defaults_api_server() {
        let cluster = ClusterAccess {
            in_cluster: true,
            ..ClusterAccess::default()
        };
        assert_eq!(
            api_server(&cluster).map(|url| url.to_string()),
            Some("https://kubernetes.default.svc/".to_string())
        );
        assert!(api_server(&ClusterAccess::default()).is_none());
    }
}
