use crate::annotations::annotated_network;
use crate::error::{CoreError, Result};
use crate::types::{Labels, PodRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Watch event type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    uid: Option<String>,
    name: Option<String>,
    namespace: Option<String>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    annotations: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSpec {
    node_name: Option<String>,
    host_network: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatus {
    #[serde(rename = "hostIP")]
    host_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawObject {
    kind: Option<String>,
    #[serde(default)]
    metadata: RawMetadata,
    #[serde(default)]
    spec: Option<RawSpec>,
    #[serde(default)]
    status: Option<RawStatus>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: WatchEventType,
    #[serde(default)]
    object: Option<RawObject>,
}

/// A deleted pod. Synthetic deletes only carry the uid and labels.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedPod {
    pub uid: String,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub labels: Labels,
}

/// A validated pod lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum PodEvent {
    Added(PodRecord),
    Modified(PodRecord),
    Deleted(DeletedPod),
    /// Any other event type (including watch `ERROR`); logged and ignored
    Unknown { event_type: String },
}

impl PodEvent {
    /// Build a synthetic delete notification for a pod known only by uid
    pub fn deleted(uid: impl Into<String>, labels: Labels) -> Self {
        PodEvent::Deleted(DeletedPod {
            uid: uid.into(),
            name: None,
            namespace: None,
            labels,
        })
    }

    /// Uid of the pod the event is about, if any
    pub fn uid(&self) -> Option<&str> {
        match self {
            PodEvent::Added(pod) | PodEvent::Modified(pod) => Some(&pod.uid),
            PodEvent::Deleted(pod) => Some(&pod.uid),
            PodEvent::Unknown { .. } => None,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            PodEvent::Added(_) => "ADDED",
            PodEvent::Modified(_) => "MODIFIED",
            PodEvent::Deleted(_) => "DELETED",
            PodEvent::Unknown { event_type } => event_type,
        }
    }

    /// Validate a raw watch event and turn it into a typed event
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let raw_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| CoreError::missing_field("event", "type"))?;

        let raw: RawEvent = serde_json::from_value(value).map_err(|e| {
            CoreError::serialization(format!("Failed to decode watch event: {}", e), Some(Box::new(e)))
        })?;

        let object = match raw.event_type {
            WatchEventType::Added | WatchEventType::Modified | WatchEventType::Deleted => raw
                .object
                .ok_or_else(|| CoreError::missing_field("event", "object"))?,
            WatchEventType::Error | WatchEventType::Unknown => {
                return Ok(PodEvent::Unknown {
                    event_type: raw_type,
                })
            }
        };

        match object.kind.as_deref() {
            Some("Pod") | None => {}
            Some(other) => {
                return Err(CoreError::invalid_event(format!(
                    "expected kind Pod, got {}",
                    other
                )))
            }
        }

        let meta = object.metadata;
        let uid = meta
            .uid
            .ok_or_else(|| CoreError::missing_field("Pod", "metadata.uid"))?;
        let labels = meta.labels.unwrap_or_default();

        if raw.event_type == WatchEventType::Deleted {
            return Ok(PodEvent::Deleted(DeletedPod {
                uid,
                name: meta.name,
                namespace: meta.namespace,
                labels,
            }));
        }

        let spec = object.spec.unwrap_or_default();
        let record = PodRecord {
            name: meta
                .name
                .ok_or_else(|| CoreError::missing_field("Pod", "metadata.name"))?,
            namespace: meta
                .namespace
                .ok_or_else(|| CoreError::missing_field("Pod", "metadata.namespace"))?,
            node_name: spec.node_name,
            host_ip: object.status.and_then(|s| s.host_ip),
            host_network: spec.host_network.unwrap_or(false),
            network: annotated_network(meta.annotations.as_ref()),
            labels,
            uid,
        };

        Ok(match raw.event_type {
            WatchEventType::Added => PodEvent::Added(record),
            _ => PodEvent::Modified(record),
        })
    }

    /// Render the event in watch-event wire form
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            PodEvent::Added(pod) | PodEvent::Modified(pod) => serde_json::json!({
                "type": self.type_name(),
                "object": {
                    "kind": "Pod",
                    "metadata": {
                        "uid": pod.uid,
                        "name": pod.name,
                        "namespace": pod.namespace,
                        "labels": pod.labels,
                    },
                    "spec": {
                        "nodeName": pod.node_name,
                        "hostNetwork": pod.host_network,
                    },
                    "status": { "hostIP": pod.host_ip },
                }
            }),
            PodEvent::Deleted(pod) => serde_json::json!({
                "type": "DELETED",
                "object": {
                    "kind": "Pod",
                    "metadata": { "uid": pod.uid, "labels": pod.labels },
                }
            }),
            PodEvent::Unknown { event_type } => serde_json::json!({ "type": event_type }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn added_event() -> serde_json::Value {
        json!({
            "type": "ADDED",
            "object": {
                "kind": "Pod",
                "metadata": {
                    "uid": "p1",
                    "name": "web",
                    "namespace": "ns1",
                    "labels": {"app": "web"}
                },
                "spec": {"nodeName": "node1", "hostNetwork": false},
                "status": {"hostIP": "10.0.0.5"}
            }
        })
    }

    #[test]
    fn test_parse_added_event() {
        let event = PodEvent::from_value(added_event()).unwrap();
        let PodEvent::Added(pod) = event else {
            panic!("expected ADDED");
        };
        assert_eq!(pod.uid, "p1");
        assert_eq!(pod.name, "web");
        assert_eq!(pod.namespace, "ns1");
        assert_eq!(pod.node_name.as_deref(), Some("node1"));
        assert_eq!(pod.host_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(pod.labels.get("app").map(String::as_str), Some("web"));
        assert!(!pod.host_network);
    }

    #[test]
    fn test_parse_modified_without_status() {
        let mut value = added_event();
        value["type"] = json!("MODIFIED");
        value["object"].as_object_mut().unwrap().remove("status");

        let event = PodEvent::from_value(value).unwrap();
        let PodEvent::Modified(pod) = event else {
            panic!("expected MODIFIED");
        };
        assert!(pod.host_ip.is_none());
    }

    #[test]
    fn test_parse_synthetic_delete() {
        let value = json!({
            "type": "DELETED",
            "object": {"kind": "Pod", "metadata": {"uid": "b", "labels": {"app": "db"}}}
        });
        let event = PodEvent::from_value(value).unwrap();
        assert_eq!(event.uid(), Some("b"));
        assert!(matches!(event, PodEvent::Deleted(ref d) if d.name.is_none()));
    }

    #[test]
    fn test_unknown_event_type_is_preserved() {
        let event = PodEvent::from_value(json!({"type": "BOOKMARK", "object": {}})).unwrap();
        assert_eq!(
            event,
            PodEvent::Unknown {
                event_type: "BOOKMARK".to_string()
            }
        );
    }

    #[test]
    fn test_missing_uid_is_rejected() {
        let mut value = added_event();
        value["object"]["metadata"]
            .as_object_mut()
            .unwrap()
            .remove("uid");
        assert!(matches!(
            PodEvent::from_value(value).unwrap_err(),
            CoreError::MissingField { .. }
        ));
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let mut value = added_event();
        value["object"]["kind"] = json!("Service");
        assert!(matches!(
            PodEvent::from_value(value).unwrap_err(),
            CoreError::InvalidEvent { .. }
        ));
    }

    #[test]
    fn test_synthetic_delete_wire_form() {
        let labels = Labels::from([("app".to_string(), "db".to_string())]);
        let value = PodEvent::deleted("b", labels).to_value();
        assert_eq!(value["type"], "DELETED");
        assert_eq!(value["object"]["kind"], "Pod");
        assert_eq!(value["object"]["metadata"]["uid"], "b");
        assert_eq!(value["object"]["metadata"]["labels"]["app"], "db");
    }
}
