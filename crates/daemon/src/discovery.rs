// Kube Tunnel Manager - Discovery Module
// Queries the cluster for namespaces and services through kubectl

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use kube_tunnel_common::{Error, Result, ServiceInfo, ServicePort};

/// Minimal slice of the kubectl JSON list schema
#[derive(Debug, Deserialize)]
struct KubeList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct KubeNamespace {
    metadata: KubeMetadata,
}

#[derive(Debug, Deserialize)]
struct KubeMetadata {
    name: String,
}

#[derive(Debug, Deserialize)]
struct KubeService {
    metadata: KubeMetadata,
    #[serde(default)]
    spec: KubeServiceSpec,
}

#[derive(Debug, Default, Deserialize)]
struct KubeServiceSpec {
    #[serde(rename = "type")]
    service_type: Option<String>,
    #[serde(rename = "clusterIP")]
    cluster_ip: Option<String>,
    #[serde(default = "Vec::new")]
    ports: Vec<KubeServicePort>,
}

#[derive(Debug, Deserialize)]
struct KubeServicePort {
    name: Option<String>,
    port: u16,
    protocol: Option<String>,
}

/// Cluster discovery via kubectl subprocess calls
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    kubectl_path: String,
}

impl DiscoveryClient {
    pub fn new(kubectl_path: impl Into<String>) -> Self {
        Self {
            kubectl_path: kubectl_path.into(),
        }
    }

    /// List the namespaces visible to the current kube context
    pub async fn list_namespaces(&self) -> Result<Vec<String>> {
        let output = self.run(&["get", "namespaces", "-o", "json"]).await?;
        parse_namespace_list(&output)
    }

    /// List the services in a namespace
    pub async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceInfo>> {
        let output = self
            .run(&["get", "services", "-n", namespace, "-o", "json"])
            .await?;
        parse_service_list(&output)
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("Running {} {}", self.kubectl_path, args.join(" "));

        let output = Command::new(&self.kubectl_path)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Spawn(format!("{}: {}", self.kubectl_path, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_failure(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

impl Default for DiscoveryClient {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

/// Map a failed kubectl invocation onto the typed failure taxonomy
fn classify_failure(stderr: &str) -> Error {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();

    let unreachable_markers = [
        "connection refused",
        "unable to connect",
        "no such host",
        "i/o timeout",
        "cluster unreachable",
        "was refused",
    ];

    if unreachable_markers.iter().any(|m| lower.contains(m)) {
        Error::ClusterUnreachable(message)
    } else if lower.contains("not found") {
        Error::NotFound(message)
    } else {
        Error::ExecutionFailed(message)
    }
}

fn parse_namespace_list(json: &str) -> Result<Vec<String>> {
    let list: KubeList<KubeNamespace> =
        serde_json::from_str(json).map_err(|e| Error::ParsingFailed(e.to_string()))?;
    Ok(list.items.into_iter().map(|ns| ns.metadata.name).collect())
}

fn parse_service_list(json: &str) -> Result<Vec<ServiceInfo>> {
    let list: KubeList<KubeService> =
        serde_json::from_str(json).map_err(|e| Error::ParsingFailed(e.to_string()))?;

    Ok(list
        .items
        .into_iter()
        .map(|svc| ServiceInfo {
            name: svc.metadata.name,
            service_type: svc.spec.service_type.unwrap_or_else(|| "ClusterIP".to_string()),
            cluster_ip: svc.spec.cluster_ip,
            ports: svc
                .spec
                .ports
                .into_iter()
                .map(|p| ServicePort {
                    name: p.name,
                    port: p.port,
                    protocol: p.protocol,
                })
                .collect(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMESPACE_JSON: &str = r#"{
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            {"metadata": {"name": "default"}},
            {"metadata": {"name": "kube-system"}}
        ]
    }"#;

    const SERVICE_JSON: &str = r#"{
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            {
                "metadata": {"name": "postgres-rw"},
                "spec": {
                    "type": "ClusterIP",
                    "clusterIP": "10.96.12.7",
                    "ports": [
                        {"name": "pg", "port": 5432, "protocol": "TCP"},
                        {"port": 9187}
                    ]
                }
            }
        ]
    }"#;

    #[test]
    fn parses_namespace_names() {
        let namespaces = parse_namespace_list(NAMESPACE_JSON).unwrap();
        assert_eq!(namespaces, vec!["default", "kube-system"]);
    }

    #[test]
    fn parses_services_with_named_and_numbered_ports() {
        let services = parse_service_list(SERVICE_JSON).unwrap();
        assert_eq!(services.len(), 1);

        let svc = &services[0];
        assert_eq!(svc.name, "postgres-rw");
        assert_eq!(svc.service_type, "ClusterIP");
        assert_eq!(svc.cluster_ip.as_deref(), Some("10.96.12.7"));
        assert_eq!(svc.ports.len(), 2);
        assert_eq!(svc.ports[0].name.as_deref(), Some("pg"));
        assert_eq!(svc.ports[0].port, 5432);
        assert_eq!(svc.ports[1].name, None);
        assert_eq!(svc.ports[1].port, 9187);
    }

    #[test]
    fn empty_list_parses_to_empty_vec() {
        let services = parse_service_list(r#"{"items": []}"#).unwrap();
        assert!(services.is_empty());
    }

    #[test]
    fn malformed_json_is_a_parsing_failure() {
        let err = parse_service_list("not json at all").unwrap_err();
        assert!(matches!(err, Error::ParsingFailed(_)));
    }

    #[test]
    fn classifies_unreachable_cluster() {
        let err = classify_failure(
            "The connection to the server 10.0.0.1:6443 was refused - did you specify the right host or port?",
        );
        assert!(matches!(err, Error::ClusterUnreachable(_)));

        let err = classify_failure("dial tcp: lookup cluster.local: no such host");
        assert!(matches!(err, Error::ClusterUnreachable(_)));
    }

    #[test]
    fn classifies_missing_namespace() {
        let err = classify_failure("Error from server (NotFound): namespaces \"nope\" not found");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn classifies_other_failures_as_execution() {
        let err = classify_failure("error: you must be logged in to the server");
        assert!(matches!(err, Error::ExecutionFailed(_)));
    }
}
