//! Podlink Core - boundary types for the pod-to-SDN reconciliation controller
//!
//! This crate provides:
//! - Typed pod lifecycle events, validated from raw watch JSON
//! - Read-only pod and namespace mirror records
//! - SDN resource-graph objects and naming helpers
//! - Error types with miette diagnostics

pub mod annotations;
pub mod error;
pub mod events;
pub mod objects;
pub mod types;

// Re-export commonly used types
pub use error::{CoreError, Result};
pub use events::{DeletedPod, PodEvent, WatchEventType};
pub use objects::{
    make_display_name, make_name, FloatingIp, InstanceIp, InterfaceProperties, ObjectKind,
    ObjectRef, RefOp, VirtualMachine, VirtualMachineInterface, VirtualNetwork, VirtualRouter,
};
pub use types::{effective_labels, FqName, Labels, NamespaceRecord, PodRecord, NAMESPACE_LABEL_KEY};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::{Namespace, Pod};

/// Serialize a value to JSON
pub fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| {
        CoreError::serialization(
            format!("Failed to serialize to JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Parse a single watch event line
pub fn parse_event(line: &str) -> Result<PodEvent> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
        CoreError::serialization(
            format!("Failed to deserialize watch event: {}", e),
            Some(Box::new(e)),
        )
    })?;
    PodEvent::from_value(value)
}
