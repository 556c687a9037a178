use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Lifecycle state shared by stored records, backend processes and
/// supervised runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Pending,

    Started,

    Fetching,

    Building,

    Starting,

    Running,

    Restarting,

    Stopping,

    Stopped,

    /// `retry` is false when another attempt cannot succeed until the
    /// caller changes the service.
    Error {
        message: String,

        #[serde(default = "retry_default")]
        retry: bool,
    },
}

fn retry_default() -> bool {
    true
}

impl ServiceStatus {
    pub fn error(message: impl Into<String>) -> Self {
        ServiceStatus::Error {
            message: message.into(),
            retry: true,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        ServiceStatus::Error {
            message: err.to_string(),
            retry: err.is_recoverable(),
        }
    }

    /// Failed in a way only a caller update can clear.
    pub fn is_held(&self) -> bool {
        matches!(self, ServiceStatus::Error { retry: false, .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ServiceStatus::Running)
    }

    /// Nothing is left executing for this entry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Error { .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ServiceStatus::Error { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Pending => write!(f, "pending"),
            ServiceStatus::Started => write!(f, "started"),
            ServiceStatus::Fetching => write!(f, "fetching"),
            ServiceStatus::Building => write!(f, "building"),
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Restarting => write!(f, "restarting"),
            ServiceStatus::Stopping => write!(f, "stopping"),
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::Error { message, .. } => write!(f, "error: {}", message),
        }
    }
}
