use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP probe request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error in '{field}': {message}")]
    ConfigError { field: String, message: String },

    #[error("Cyclic dependency detected: {}", cycle.join(" -> "))]
    CyclicDependencyError { cycle: Vec<String> },

    #[error("No free host port for {service}:{container_port} in range {floor}-{ceiling}")]
    PortExhaustionError {
        service: String,
        container_port: u16,
        floor: u16,
        ceiling: u16,
    },

    #[error("Failed to launch '{service}': {details}")]
    LaunchError { service: String, details: String },

    #[error("'{service}' did not become healthy after {attempts} attempts")]
    HealthTimeoutError { service: String, attempts: u32 },

    #[error("Run cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Scheduling,
    Resource,
    Runtime,
    Health,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl OrchestratorError {
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigError {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn launch(service: impl Into<String>, details: impl Into<String>) -> Self {
        Self::LaunchError {
            service: service.into(),
            details: details.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigError { .. } | Self::SerializationError(_) => ErrorCategory::Configuration,
            Self::CyclicDependencyError { .. } => ErrorCategory::Scheduling,
            Self::PortExhaustionError { .. } => ErrorCategory::Resource,
            Self::LaunchError { .. } | Self::Cancelled => ErrorCategory::Runtime,
            Self::HealthTimeoutError { .. } | Self::HttpError(_) => ErrorCategory::Health,
            Self::IoError(_) => ErrorCategory::System,
        }
    }

    /// 對應 CLI 退出碼：High 為 1（致命配置錯誤），Medium 為 2（服務失敗）
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::ConfigError { .. }
            | Self::CyclicDependencyError { .. }
            | Self::SerializationError(_) => ErrorSeverity::High,
            Self::PortExhaustionError { .. }
            | Self::LaunchError { .. }
            | Self::HealthTimeoutError { .. }
            | Self::Cancelled => ErrorSeverity::Medium,
            Self::HttpError(_) => ErrorSeverity::Low,
            Self::IoError(_) => ErrorSeverity::Critical,
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            Self::ConfigError { field, .. } => {
                format!("Check the '{}' entry in your stack configuration file", field)
            }
            Self::CyclicDependencyError { cycle } => format!(
                "Remove one of the depends_on edges between: {}",
                cycle.join(", ")
            ),
            Self::PortExhaustionError { floor, ceiling, .. } => format!(
                "Free some host ports or widen the search range (currently {}-{}) with --port-floor/--port-ceiling",
                floor, ceiling
            ),
            Self::LaunchError { service, .. } => format!(
                "Inspect the container runtime output for '{}' (docker logs) and retry with --force-recreate",
                service
            ),
            Self::HealthTimeoutError { service, .. } => format!(
                "Check the logs of '{}' or raise its health timeout/retries",
                service
            ),
            Self::HttpError(_) => {
                "Verify that the probe URL is reachable from this host".to_string()
            }
            Self::Cancelled => {
                "Re-run the orchestrator; started services were left running".to_string()
            }
            Self::IoError(_) => "Check file permissions and that docker is installed".to_string(),
            Self::SerializationError(_) => "The run report could not be serialized".to_string(),
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            Self::ConfigError { field, message } => {
                format!("Invalid stack configuration ({}): {}", field, message)
            }
            Self::CyclicDependencyError { cycle } => {
                format!("Services depend on each other in a loop: {}", cycle.join(" -> "))
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_path() {
        let err = OrchestratorError::CyclicDependencyError {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency detected: a -> b -> a");
        assert_eq!(err.category(), ErrorCategory::Scheduling);
        assert_eq!(err.severity(), ErrorSeverity::High);
    }

    #[test]
    fn test_per_service_errors_are_not_fatal_severity() {
        let err = OrchestratorError::launch("n8n", "image not found");
        assert_eq!(err.severity(), ErrorSeverity::Medium);
        assert!(err.recovery_suggestion().contains("n8n"));
    }
}
