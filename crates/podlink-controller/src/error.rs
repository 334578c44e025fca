use miette::Diagnostic;
use podlink_core::ObjectKind;
use thiserror::Error;

/// Controller error type.
///
/// `NotFound`, `AlreadyExists` and `Unresolvable` are expected outcomes of
/// races with the orchestrator and the remote control plane; components absorb
/// them. `RemoteFailure` and `Timeout` surface to the event dispatcher.
#[derive(Error, Debug, Diagnostic)]
pub enum ControllerError {
    /// Object not found, remotely or in a local mirror
    #[error("{kind} not found: {id}")]
    #[diagnostic(
        code(podlink::controller::not_found),
        help("The object was most likely removed concurrently. It is recreated on the next event or drift pass if still needed")
    )]
    NotFound {
        #[allow(unused)]
        kind: String,
        #[allow(unused)]
        id: String,
    },

    /// Creation conflict
    #[error("{kind} already exists: {id}")]
    #[diagnostic(
        code(podlink::controller::already_exists),
        help("Creation is idempotent: the existing object is updated instead")
    )]
    AlreadyExists {
        #[allow(unused)]
        kind: String,
        #[allow(unused)]
        id: String,
    },

    /// Something needed for reconciliation cannot be determined from current state
    #[error("Cannot resolve {what}: {reason}")]
    #[diagnostic(
        code(podlink::controller::unresolvable),
        help("Processing is deferred until a later event or the drift pass supplies the missing state")
    )]
    Unresolvable {
        #[allow(unused)]
        what: String,
        #[allow(unused)]
        reason: String,
    },

    /// Any other remote API failure
    #[error("Remote API call '{operation}' failed: {message}")]
    #[diagnostic(
        code(podlink::controller::remote_failure),
        help("Check connectivity and credentials for the SDN API server. The resource chain is left partially applied and completed on a later event")
    )]
    RemoteFailure {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        message: String,
    },

    /// A remote call exceeded its deadline
    #[error("Remote API call '{operation}' timed out")]
    #[diagnostic(
        code(podlink::controller::timeout),
        help("Increase --request-timeout or check SDN API server load")
    )]
    Timeout {
        #[allow(unused)]
        operation: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(podlink::controller::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] podlink_core::CoreError),
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn object_not_found(kind: ObjectKind, id: impl Into<String>) -> Self {
        Self::not_found(kind.as_str(), id)
    }

    pub fn already_exists(kind: ObjectKind, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.as_str().to_string(),
            id: id.into(),
        }
    }

    pub fn unresolvable(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unresolvable {
            what: what.into(),
            reason: reason.into(),
        }
    }

    pub fn remote_failure(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteFailure {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Turns a "not found" outcome into `Ok(None)`
pub trait NotFoundExt<T> {
    fn found(self) -> Result<Option<T>>;
}

impl<T> NotFoundExt<T> for Result<T> {
    fn found(self) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_found_absorbs_not_found() {
        let r: Result<u32> = Err(ControllerError::object_not_found(
            ObjectKind::InstanceIp,
            "iip-1",
        ));
        assert_eq!(r.found().unwrap(), None);
    }

    #[test]
    fn test_found_keeps_value() {
        let r: Result<u32> = Ok(7);
        assert_eq!(r.found().unwrap(), Some(7));
    }

    #[test]
    fn test_found_propagates_remote_failure() {
        let r: Result<u32> = Err(ControllerError::remote_failure("vm-create", "503"));
        assert!(matches!(
            r.found().unwrap_err(),
            ControllerError::RemoteFailure { .. }
        ));
    }

    #[test]
    fn test_error_display() {
        let err = ControllerError::object_not_found(ObjectKind::VirtualRouter, "vr-1");
        assert_eq!(err.to_string(), "virtual-router not found: vr-1");
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());
    }
}
