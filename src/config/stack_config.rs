use crate::domain::model::{ProbeKind, Protocol, RestartPolicy};
use crate::utils::error::{OrchestratorError, Result};
use crate::utils::validation::{self, Validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_PORT_FLOOR: u16 = 8000;
pub const DEFAULT_PORT_CEILING: u16 = 9999;
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_PROBE_RETRIES: u32 = 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackConfig {
    pub stack: Option<StackInfo>,
    pub ports: Option<PortsConfig>,
    pub defaults: Option<DefaultsConfig>,
    pub orchestrator: Option<OrchestratorSettings>,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackInfo {
    pub name: String,
    pub description: Option<String>,
    /// 容器名稱前綴與 docker network 名稱，預設為 name
    pub project: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortsConfig {
    pub floor: Option<u16>,
    pub ceiling: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    pub health: Option<HealthDefaults>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthDefaults {
    pub interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    pub report_dir: Option<String>,
    pub run_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(alias = "command")]
    pub image: String,
    pub enabled: Option<bool>,
    pub ports: Option<Vec<PortDefinition>>,
    pub depends_on: Option<Vec<String>>,
    pub profiles: Option<Vec<String>>,
    pub restart: Option<RestartPolicy>,
    pub environment: Option<HashMap<String, String>>,
    pub health: Option<HealthDefinition>,
    pub best_effort: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortDefinition {
    pub container: u16,
    /// 省略時與 container 相同
    pub host: Option<u16>,
    pub protocol: Option<Protocol>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthDefinition {
    pub kind: ProbeKind,
    pub target: String,
    pub interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
}

impl StackConfig {
    /// 從 TOML 檔案載入堆疊配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::config(
                "config_file",
                format!("Cannot read '{}': {}", path.display(), e),
            )
        })?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析堆疊配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        // 處理環境變數替換
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| {
            OrchestratorError::config("toml_parsing", format!("Stack TOML parsing error: {}", e))
        })
    }

    /// 替換 ${VAR} 與 ${VAR:-default}；未設定又無預設值的變數保持原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").map_err(|e| {
            OrchestratorError::config("env_substitution", format!("Invalid pattern: {}", e))
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match (std::env::var(var_name), caps.get(2)) {
                (Ok(value), _) => value,
                (Err(_), Some(default)) => default.as_str().to_string(),
                (Err(_), None) => caps[0].to_string(),
            }
        });

        Ok(result.to_string())
    }

    /// 依序合併多個檔案：後面的設定區段覆蓋前面的，services 直接串接
    pub fn merge(configs: Vec<StackConfig>) -> StackConfig {
        configs
            .into_iter()
            .fold(StackConfig::default(), |acc, next| StackConfig {
                stack: next.stack.or(acc.stack),
                ports: next.ports.or(acc.ports),
                defaults: next.defaults.or(acc.defaults),
                orchestrator: next.orchestrator.or(acc.orchestrator),
                services: acc.services.into_iter().chain(next.services).collect(),
            })
    }

    pub fn project_name(&self) -> String {
        self.stack
            .as_ref()
            .map(|s| s.project.clone().unwrap_or_else(|| s.name.clone()))
            .unwrap_or_else(|| "stack".to_string())
    }

    pub fn port_floor(&self) -> u16 {
        self.ports
            .as_ref()
            .and_then(|p| p.floor)
            .unwrap_or(DEFAULT_PORT_FLOOR)
    }

    pub fn port_ceiling(&self) -> u16 {
        self.ports
            .as_ref()
            .and_then(|p| p.ceiling)
            .unwrap_or(DEFAULT_PORT_CEILING)
    }

    pub fn health_defaults(&self) -> HealthDefaults {
        self.defaults
            .as_ref()
            .and_then(|d| d.health.clone())
            .unwrap_or_default()
    }

    pub fn report_dir(&self) -> Option<&str> {
        self.orchestrator.as_ref().and_then(|o| o.report_dir.as_deref())
    }

    pub fn run_timeout_secs(&self) -> Option<u64> {
        self.orchestrator.as_ref().and_then(|o| o.run_timeout_secs)
    }

    /// 獲取指定名稱的服務定義
    pub fn get_service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name == name)
    }

    fn validate_service(&self, service: &ServiceDefinition) -> Result<()> {
        let prefix = format!("services.{}", service.name);
        validation::validate_service_name("services.name", &service.name)?;
        validation::validate_non_empty_string(&format!("{}.image", prefix), &service.image)?;

        for port in service.ports.iter().flatten() {
            validation::validate_range(
                &format!("{}.ports.container", prefix),
                port.container,
                1,
                u16::MAX,
            )?;
            if let Some(host) = port.host {
                validation::validate_range(&format!("{}.ports.host", prefix), host, 1, u16::MAX)?;
            }
        }

        if let Some(health) = &service.health {
            validation::validate_non_empty_string(
                &format!("{}.health.target", prefix),
                &health.target,
            )?;
            if let Some(retries) = health.retries {
                validation::validate_positive_number(
                    &format!("{}.health.retries", prefix),
                    retries as u64,
                    1,
                )?;
            }
            if let Some(timeout) = health.timeout_ms {
                validation::validate_positive_number(
                    &format!("{}.health.timeout_ms", prefix),
                    timeout,
                    1,
                )?;
            }
        }

        Ok(())
    }
}

impl Validate for StackConfig {
    fn validate(&self) -> Result<()> {
        if let Some(stack) = &self.stack {
            validation::validate_non_empty_string("stack.name", &stack.name)?;
        }

        let floor = self.port_floor();
        let ceiling = self.port_ceiling();
        validation::validate_range("ports.floor", floor, 1, u16::MAX)?;
        if floor > ceiling {
            return Err(OrchestratorError::config(
                "ports",
                format!("floor {} is above ceiling {}", floor, ceiling),
            ));
        }

        let defaults = self.health_defaults();
        if let Some(retries) = defaults.retries {
            validation::validate_positive_number("defaults.health.retries", retries as u64, 1)?;
        }
        if let Some(timeout) = defaults.timeout_ms {
            validation::validate_positive_number("defaults.health.timeout_ms", timeout, 1)?;
        }

        for service in &self.services {
            self.validate_service(service)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
[stack]
name = "local-ai"
project = "localai"

[ports]
floor = 8100
ceiling = 8200

[defaults.health]
interval_ms = 500
retries = 10

[[services]]
name = "postgres"
image = "postgres:16-alpine"
restart = "unless-stopped"

[[services.ports]]
container = 5432

[services.health]
kind = "command"
target = "pg_isready -U postgres"

[[services]]
name = "n8n"
image = "n8nio/n8n:latest"
depends_on = ["postgres"]

[[services.ports]]
container = 5678
host = 5678
protocol = "tcp"

[services.health]
kind = "http"
target = "http://{host}:{port:5678}/healthz"
"#;

    #[test]
    fn test_stack_config_parsing() {
        let config = StackConfig::from_toml_str(BASIC).unwrap();
        assert_eq!(config.project_name(), "localai");
        assert_eq!(config.port_floor(), 8100);
        assert_eq!(config.port_ceiling(), 8200);
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.health_defaults().interval_ms, Some(500));

        let postgres = config.get_service("postgres").unwrap();
        assert_eq!(postgres.restart, Some(RestartPolicy::UnlessStopped));
        assert_eq!(postgres.health.as_ref().unwrap().kind, ProbeKind::Command);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_substitution_with_default() {
        std::env::set_var("STACK_LAUNCH_TEST_IMAGE", "qdrant/qdrant:v1.9");
        let content = r#"
[[services]]
name = "qdrant"
image = "${STACK_LAUNCH_TEST_IMAGE}"

[services.environment]
LOG_LEVEL = "${STACK_LAUNCH_TEST_UNSET_LEVEL:-info}"
TOKEN = "${STACK_LAUNCH_TEST_UNSET_TOKEN}"
"#;
        let config = StackConfig::from_toml_str(content).unwrap();
        let qdrant = config.get_service("qdrant").unwrap();
        assert_eq!(qdrant.image, "qdrant/qdrant:v1.9");

        let env = qdrant.environment.as_ref().unwrap();
        assert_eq!(env.get("LOG_LEVEL").unwrap(), "info");
        assert_eq!(env.get("TOKEN").unwrap(), "${STACK_LAUNCH_TEST_UNSET_TOKEN}");
    }

    #[test]
    fn test_merge_overrides_sections_and_appends_services() {
        let base = StackConfig::from_toml_str(BASIC).unwrap();
        let overlay = StackConfig::from_toml_str(
            r#"
[ports]
floor = 9000
ceiling = 9100

[[services]]
name = "ollama"
image = "ollama/ollama:latest"
profiles = ["cpu"]
"#,
        )
        .unwrap();

        let merged = StackConfig::merge(vec![base, overlay]);
        assert_eq!(merged.project_name(), "localai");
        assert_eq!(merged.port_floor(), 9000);
        assert_eq!(merged.services.len(), 3);
        assert_eq!(merged.services[2].name, "ollama");
    }

    #[test]
    fn test_invalid_port_range_rejected() {
        let config = StackConfig::from_toml_str(
            r#"
[ports]
floor = 9000
ceiling = 8000
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_retries_rejected() {
        let config = StackConfig::from_toml_str(
            r#"
[[services]]
name = "neo4j"
image = "neo4j:5"

[services.health]
kind = "tcp"
target = "{host}:{port:7687}"
retries = 0
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = StackConfig::from_toml_str("[[services]\nname = ").unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigError { .. }));
    }
}
