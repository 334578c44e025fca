use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A label set, ordered so that tag and index updates are deterministic
pub type Labels = BTreeMap<String, String>;

/// Key of the implicit label every pod carries with its namespace name
pub const NAMESPACE_LABEL_KEY: &str = "namespace";

/// Fully-qualified name of an SDN object (e.g. `default-domain:k8s-default:pod-network`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FqName(Vec<String>);

impl FqName {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Append a child component, e.g. a network name under a project
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut parts = self.0.clone();
        parts.push(name.into());
        Self(parts)
    }

    /// Last component (the object's own name)
    pub fn name(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or("")
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Parse the `a:b:c` form used in configuration
    pub fn parse(s: &str) -> Self {
        Self::new(s.split(':').filter(|p| !p.is_empty()))
    }
}

impl fmt::Display for FqName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(":"))
    }
}

/// Read-only mirror of an orchestrator pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodRecord {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    pub host_ip: Option<String>,
    pub labels: Labels,
    pub host_network: bool,
    /// Virtual network annotated on the pod itself
    pub network: Option<FqName>,
}

/// Read-only mirror of an orchestrator namespace
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NamespaceRecord {
    pub name: String,
    /// Virtual network annotated on the namespace
    pub annotated_network: Option<FqName>,
    /// Private network used by pods of an isolated namespace
    pub isolated_network: Option<FqName>,
    pub isolated: bool,
    /// Per-namespace override of the global IP-fabric-forwarding setting
    pub ip_fabric_forwarding: Option<bool>,
}

impl NamespaceRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Effective label set of a pod: its explicit labels plus `namespace=<ns>`
pub fn effective_labels(labels: &Labels, namespace: &str) -> Labels {
    let mut effective = labels.clone();
    effective.insert(NAMESPACE_LABEL_KEY.to_string(), namespace.to_string());
    effective
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fq_name_display_and_parse() {
        let fq = FqName::new(["default-domain", "k8s-default", "pod-network"]);
        assert_eq!(fq.to_string(), "default-domain:k8s-default:pod-network");
        assert_eq!(FqName::parse("default-domain:k8s-default:pod-network"), fq);
        assert_eq!(fq.name(), "pod-network");
    }

    #[test]
    fn test_fq_name_child() {
        let project = FqName::new(["default-domain", "k8s-ns1"]);
        let net = project.child("k8s-ns1-pod-network");
        assert_eq!(net.parts().len(), 3);
        assert_eq!(net.name(), "k8s-ns1-pod-network");
    }

    #[test]
    fn test_effective_labels_adds_namespace() {
        let mut labels = Labels::new();
        labels.insert("app".to_string(), "web".to_string());

        let effective = effective_labels(&labels, "ns1");
        assert_eq!(effective.len(), 2);
        assert_eq!(effective.get("app").map(String::as_str), Some("web"));
        assert_eq!(effective.get("namespace").map(String::as_str), Some("ns1"));
    }

    #[test]
    fn test_effective_labels_overrides_explicit_namespace_label() {
        let mut labels = Labels::new();
        labels.insert("namespace".to_string(), "spoofed".to_string());

        let effective = effective_labels(&labels, "ns1");
        assert_eq!(effective.get("namespace").map(String::as_str), Some("ns1"));
    }
}
