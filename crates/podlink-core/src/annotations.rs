use crate::types::{FqName, NamespaceRecord, PodRecord};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Annotation selecting the virtual network of a pod or namespace
pub const NETWORK_ANNOTATION: &str = "opencontrail.org/network";
/// Annotation marking a namespace as isolated
pub const ISOLATION_ANNOTATION: &str = "opencontrail.org/isolation";
/// Annotation overriding IP-fabric forwarding for a namespace
pub const IP_FABRIC_FORWARDING_ANNOTATION: &str = "opencontrail.org/ip_fabric_forwarding";

#[derive(Deserialize)]
struct NetworkAnnotation {
    domain: String,
    project: String,
    name: String,
}

/// Parse a network annotation of the form `{"domain": .., "project": .., "name": ..}`
pub fn parse_network_annotation(value: &str) -> Option<FqName> {
    let parsed: NetworkAnnotation = serde_json::from_str(value).ok()?;
    Some(FqName::new([parsed.domain, parsed.project, parsed.name]))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Network annotated in an annotation map, if any
pub fn annotated_network(annotations: Option<&BTreeMap<String, String>>) -> Option<FqName> {
    annotations
        .and_then(|a| a.get(NETWORK_ANNOTATION))
        .and_then(|v| parse_network_annotation(v))
}

impl PodRecord {
    /// Build a mirror record from an orchestrator pod.
    ///
    /// Returns `None` for pods without a uid, name or namespace; those
    /// cannot be reconciled.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let meta = &pod.metadata;
        let spec = pod.spec.as_ref();

        Some(Self {
            uid: meta.uid.clone()?,
            name: meta.name.clone()?,
            namespace: meta.namespace.clone()?,
            node_name: spec.and_then(|s| s.node_name.clone()),
            host_ip: pod.status.as_ref().and_then(|s| s.host_ip.clone()),
            labels: meta.labels.clone().unwrap_or_default(),
            host_network: spec.and_then(|s| s.host_network).unwrap_or(false),
            network: annotated_network(meta.annotations.as_ref()),
        })
    }
}

impl NamespaceRecord {
    /// Build a mirror record from an orchestrator namespace.
    ///
    /// `isolated_network` is the name the controller gives the namespace's
    /// private pod network; it is only recorded when the namespace is isolated.
    pub fn from_namespace(ns: &Namespace, isolated_network: impl FnOnce(&str) -> FqName) -> Option<Self> {
        let name = ns.metadata.name.clone()?;
        let annotations = ns.metadata.annotations.as_ref();

        let isolated = annotations
            .and_then(|a| a.get(ISOLATION_ANNOTATION))
            .and_then(|v| parse_flag(v))
            .unwrap_or(false);
        let ip_fabric_forwarding = annotations
            .and_then(|a| a.get(IP_FABRIC_FORWARDING_ANNOTATION))
            .and_then(|v| parse_flag(v));

        Some(Self {
            isolated_network: isolated.then(|| isolated_network(&name)),
            annotated_network: annotated_network(annotations),
            isolated,
            ip_fabric_forwarding,
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};

    #[test]
    fn test_parse_network_annotation() {
        let fq = parse_network_annotation(
            r#"{"domain": "default-domain", "project": "admin", "name": "blue"}"#,
        )
        .unwrap();
        assert_eq!(fq.to_string(), "default-domain:admin:blue");
    }

    #[test]
    fn test_parse_network_annotation_rejects_garbage() {
        assert!(parse_network_annotation("blue").is_none());
        assert!(parse_network_annotation(r#"{"name": "blue"}"#).is_none());
    }

    #[test]
    fn test_pod_record_from_pod() {
        let mut pod = Pod::default();
        pod.metadata.uid = Some("p1".to_string());
        pod.metadata.name = Some("web".to_string());
        pod.metadata.namespace = Some("ns1".to_string());
        pod.metadata.labels = Some(BTreeMap::from([("app".to_string(), "web".to_string())]));
        pod.metadata.annotations = Some(BTreeMap::from([(
            NETWORK_ANNOTATION.to_string(),
            r#"{"domain": "d", "project": "p", "name": "n"}"#.to_string(),
        )]));
        pod.spec = Some(PodSpec {
            node_name: Some("node1".to_string()),
            ..Default::default()
        });
        pod.status = Some(PodStatus {
            host_ip: Some("10.0.0.5".to_string()),
            ..Default::default()
        });

        let record = PodRecord::from_pod(&pod).unwrap();
        assert_eq!(record.uid, "p1");
        assert_eq!(record.node_name.as_deref(), Some("node1"));
        assert_eq!(record.host_ip.as_deref(), Some("10.0.0.5"));
        assert!(!record.host_network);
        assert_eq!(record.network.unwrap().to_string(), "d:p:n");
    }

    #[test]
    fn test_pod_record_requires_uid() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("web".to_string());
        pod.metadata.namespace = Some("ns1".to_string());
        assert!(PodRecord::from_pod(&pod).is_none());
    }

    #[test]
    fn test_namespace_record_isolation() {
        let mut ns = Namespace::default();
        ns.metadata.name = Some("secure".to_string());
        ns.metadata.annotations = Some(BTreeMap::from([
            (ISOLATION_ANNOTATION.to_string(), "true".to_string()),
            (IP_FABRIC_FORWARDING_ANNOTATION.to_string(), "False".to_string()),
        ]));

        let record =
            NamespaceRecord::from_namespace(&ns, |n| FqName::new(["d", "p", n])).unwrap();
        assert!(record.isolated);
        assert_eq!(record.isolated_network.unwrap().to_string(), "d:p:secure");
        assert_eq!(record.ip_fabric_forwarding, Some(false));
        assert!(record.annotated_network.is_none());
    }

    #[test]
    fn test_namespace_record_not_isolated_has_no_private_network() {
        let mut ns = Namespace::default();
        ns.metadata.name = Some("open".to_string());

        let record = NamespaceRecord::from_namespace(&ns, |n| FqName::new([n])).unwrap();
        assert!(!record.isolated);
        assert!(record.isolated_network.is_none());
        assert_eq!(record.ip_fabric_forwarding, None);
    }

    #[test]
    fn test_namespace_labels_are_not_recorded() {
        let mut ns = Namespace::default();
        ns.metadata.name = Some("open".to_string());
        ns.metadata.labels = Some(BTreeMap::from([("team".to_string(), "a".to_string())]));

        let record = NamespaceRecord::from_namespace(&ns, |n| FqName::new([n])).unwrap();
        assert_eq!(record, NamespaceRecord::new("open"));
    }
}
