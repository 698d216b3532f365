use crate::config::stack_config::{
    ServiceDefinition, StackConfig, DEFAULT_PROBE_INTERVAL_MS, DEFAULT_PROBE_RETRIES,
    DEFAULT_PROBE_TIMEOUT_MS,
};
use crate::core::context::Selection;
use crate::domain::model::{PortBinding, ProbeKind, ProbeSpec, Protocol, ServiceSpec};
use crate::utils::error::{OrchestratorError, Result};
use crate::utils::validation::{self, Validate};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// 服務目錄的來源，依序合併
#[derive(Debug, Clone)]
pub enum CatalogSource {
    File(PathBuf),
    Toml(String),
    Parsed(StackConfig),
}

impl CatalogSource {
    fn read(&self) -> Result<StackConfig> {
        match self {
            CatalogSource::File(path) => StackConfig::from_file(path),
            CatalogSource::Toml(content) => StackConfig::from_toml_str(content),
            CatalogSource::Parsed(config) => Ok(config.clone()),
        }
    }
}

pub struct ServiceCatalog;

impl ServiceCatalog {
    /// 載入並驗證服務清單，回傳依名稱排序的 ServiceSpec
    pub fn load(sources: &[CatalogSource], selection: &Selection) -> Result<Vec<ServiceSpec>> {
        let configs = sources
            .iter()
            .map(CatalogSource::read)
            .collect::<Result<Vec<_>>>()?;
        let merged = StackConfig::merge(configs);
        Self::from_config(&merged, selection)
    }

    pub fn from_config(config: &StackConfig, selection: &Selection) -> Result<Vec<ServiceSpec>> {
        config.validate()?;
        validation::validate_unique(
            "services.name",
            config.services.iter().map(|s| s.name.as_str()),
        )?;

        let declared: BTreeMap<&str, &ServiceDefinition> = config
            .services
            .iter()
            .map(|s| (s.name.as_str(), s))
            .collect();

        for service in &config.services {
            for dep in service.depends_on.iter().flatten() {
                if !declared.contains_key(dep.as_str()) {
                    return Err(OrchestratorError::config(
                        format!("services.{}.depends_on", service.name),
                        format!("Dependency '{}' is not declared", dep),
                    ));
                }
            }
        }

        let active: BTreeSet<&str> = config
            .services
            .iter()
            .filter(|s| s.enabled.unwrap_or(true))
            .filter(|s| Self::matches_profile(s, selection.profile.as_deref()))
            .map(|s| s.name.as_str())
            .collect();

        let chosen = Self::select(&declared, &active, selection)?;

        for name in &chosen {
            let service = declared[name];
            for dep in service.depends_on.iter().flatten() {
                if !active.contains(dep.as_str()) {
                    return Err(OrchestratorError::config(
                        format!("services.{}.depends_on", service.name),
                        format!(
                            "Dependency '{}' is disabled or excluded by profile {:?}",
                            dep, selection.profile
                        ),
                    ));
                }
            }
        }

        if chosen.is_empty() {
            return Err(OrchestratorError::config(
                "services",
                format!(
                    "No services selected (profile: {:?}, services: {:?})",
                    selection.profile, selection.services
                ),
            ));
        }

        let specs = chosen
            .iter()
            .map(|name| Self::to_spec(declared[name], config))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            "📚 Catalog loaded: {} of {} declared services selected",
            specs.len(),
            declared.len()
        );
        Ok(specs)
    }

    /// 無 profile 標籤的服務永遠選取；有標籤者需符合目前 profile
    fn matches_profile(service: &ServiceDefinition, profile: Option<&str>) -> bool {
        match service.profiles.as_deref() {
            None | Some([]) => true,
            Some(tags) => profile.is_some_and(|p| tags.iter().any(|t| t == p)),
        }
    }

    /// --services 指定的服務加上其遞移依賴；未指定時選取所有 active 服務
    fn select<'a>(
        declared: &BTreeMap<&'a str, &'a ServiceDefinition>,
        active: &BTreeSet<&'a str>,
        selection: &Selection,
    ) -> Result<BTreeSet<&'a str>> {
        if selection.services.is_empty() {
            return Ok(active.clone());
        }

        let mut chosen = BTreeSet::new();
        let mut stack: Vec<&'a str> = Vec::new();
        for requested in &selection.services {
            let (name, _) = declared.get_key_value(requested.as_str()).ok_or_else(|| {
                OrchestratorError::config(
                    "--services",
                    format!("Unknown service '{}'", requested),
                )
            })?;
            if !active.contains(name) {
                return Err(OrchestratorError::config(
                    "--services",
                    format!(
                        "Service '{}' is disabled or excluded by profile {:?}",
                        requested, selection.profile
                    ),
                ));
            }
            stack.push(*name);
        }

        while let Some(name) = stack.pop() {
            if !chosen.insert(name) {
                continue;
            }
            for dep in declared[name].depends_on.iter().flatten() {
                if let Some((dep_name, _)) = declared.get_key_value(dep.as_str()) {
                    stack.push(*dep_name);
                }
            }
        }

        Ok(chosen)
    }

    fn to_spec(definition: &ServiceDefinition, config: &StackConfig) -> Result<ServiceSpec> {
        let defaults = config.health_defaults();

        let health_probe = match &definition.health {
            Some(health) => {
                let probe = ProbeSpec {
                    kind: health.kind,
                    target: health.target.clone(),
                    interval_ms: health
                        .interval_ms
                        .or(defaults.interval_ms)
                        .unwrap_or(DEFAULT_PROBE_INTERVAL_MS),
                    timeout_ms: health
                        .timeout_ms
                        .or(defaults.timeout_ms)
                        .unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
                    retries: health
                        .retries
                        .or(defaults.retries)
                        .unwrap_or(DEFAULT_PROBE_RETRIES),
                };
                Self::validate_probe(&definition.name, &probe, definition)?;
                Some(probe)
            }
            None => None,
        };

        let ports = definition
            .ports
            .iter()
            .flatten()
            .map(|p| PortBinding {
                container_port: p.container,
                preferred_host_port: p.host.unwrap_or(p.container),
                protocol: p.protocol.unwrap_or(Protocol::Tcp),
            })
            .collect();

        Ok(ServiceSpec {
            name: definition.name.clone(),
            image_or_command: definition.image.trim().to_string(),
            ports,
            depends_on: definition.depends_on.iter().flatten().cloned().collect(),
            health_probe,
            profile_tags: definition.profiles.iter().flatten().cloned().collect(),
            restart_policy: definition.restart.unwrap_or_default(),
            environment: definition
                .environment
                .iter()
                .flatten()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            best_effort: definition.best_effort.unwrap_or(false),
        })
    }

    /// probe target 中的 {port:N} 必須對應到服務宣告的 container port
    fn validate_probe(
        service: &str,
        probe: &ProbeSpec,
        definition: &ServiceDefinition,
    ) -> Result<()> {
        let field = format!("services.{}.health", service);
        validation::validate_positive_number(
            &format!("{}.retries", field),
            probe.retries as u64,
            1,
        )?;
        validation::validate_positive_number(
            &format!("{}.timeout_ms", field),
            probe.timeout_ms,
            1,
        )?;

        let container_ports: BTreeMap<u16, u16> = definition
            .ports
            .iter()
            .flatten()
            .map(|p| (p.container, 1))
            .collect();
        let rendered = crate::core::health::render_target(&probe.target, &container_ports)
            .map_err(|reason| OrchestratorError::config(format!("{}.target", field), reason))?;

        if probe.kind == ProbeKind::Http {
            validation::validate_url(&format!("{}.target", field), &rendered)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection(profile: Option<&str>, services: &[&str]) -> Selection {
        Selection {
            profile: profile.map(str::to_string),
            services: services.iter().map(|s| s.to_string()).collect(),
        }
    }

    const STACK: &str = r#"
[[services]]
name = "postgres"
image = "postgres:16"

[[services]]
name = "ollama-cpu"
image = "ollama/ollama"
profiles = ["cpu"]

[[services]]
name = "ollama-gpu"
image = "ollama/ollama"
profiles = ["gpu-nvidia"]

[[services]]
name = "n8n"
image = "n8nio/n8n"
depends_on = ["postgres"]

[[services.ports]]
container = 5678

[services.health]
kind = "http"
target = "http://{host}:{port:5678}/healthz"
retries = 5
interval_ms = 100
timeout_ms = 1000

[[services]]
name = "open-webui"
image = "ghcr.io/open-webui/open-webui:main"
depends_on = ["n8n"]
"#;

    fn load(content: &str, sel: &Selection) -> Result<Vec<ServiceSpec>> {
        ServiceCatalog::load(&[CatalogSource::Toml(content.to_string())], sel)
    }

    #[test]
    fn test_profile_filtering() {
        let specs = load(STACK, &selection(Some("cpu"), &[])).unwrap();
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["n8n", "ollama-cpu", "open-webui", "postgres"]);

        let untagged = load(STACK, &selection(None, &[])).unwrap();
        assert!(untagged.iter().all(|s| s.profile_tags.is_empty()));
    }

    #[test]
    fn test_service_selection_includes_transitive_dependencies() {
        let specs = load(STACK, &selection(None, &["open-webui"])).unwrap();
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["n8n", "open-webui", "postgres"]);
    }

    #[test]
    fn test_probe_defaults_and_port_defaults() {
        let specs = load(STACK, &selection(None, &["n8n"])).unwrap();
        let n8n = specs.iter().find(|s| s.name == "n8n").unwrap();
        assert_eq!(n8n.ports[0].preferred_host_port, 5678);
        assert_eq!(n8n.ports[0].protocol, Protocol::Tcp);
        let probe = n8n.health_probe.as_ref().unwrap();
        assert_eq!(probe.retries, 5);
        assert_eq!(probe.interval_ms, 100);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let content = r#"
[[services]]
name = "flowise"
image = "flowiseai/flowise"
depends_on = ["redis"]
"#;
        let err = load(content, &Selection::default()).unwrap_err();
        assert!(err.to_string().contains("redis"));
    }

    #[test]
    fn test_duplicate_names_rejected_across_sources() {
        let a = CatalogSource::Toml(
            "[[services]]\nname = \"qdrant\"\nimage = \"qdrant/qdrant\"\n".into(),
        );
        let b = CatalogSource::Toml(
            "[[services]]\nname = \"qdrant\"\nimage = \"qdrant/qdrant:v2\"\n".into(),
        );
        let err = ServiceCatalog::load(&[a, b], &Selection::default()).unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigError { .. }));
        assert!(err.to_string().contains("qdrant"));
    }

    #[test]
    fn test_empty_profile_selection_rejected() {
        let content = r#"
[[services]]
name = "ollama-gpu"
image = "ollama/ollama"
profiles = ["gpu-nvidia"]
"#;
        assert!(load(content, &selection(Some("cpu"), &[])).is_err());
    }

    #[test]
    fn test_dependency_excluded_by_profile_rejected() {
        let content = r#"
[[services]]
name = "ollama-gpu"
image = "ollama/ollama"
profiles = ["gpu-nvidia"]

[[services]]
name = "open-webui"
image = "ghcr.io/open-webui/open-webui:main"
depends_on = ["ollama-gpu"]
"#;
        let err = load(content, &selection(Some("cpu"), &[])).unwrap_err();
        assert!(err.to_string().contains("ollama-gpu"));
    }

    #[test]
    fn test_unknown_selected_service_rejected() {
        assert!(load(STACK, &selection(None, &["langfuse"])).is_err());
    }

    #[test]
    fn test_probe_placeholder_must_name_declared_port() {
        let content = r#"
[[services]]
name = "searxng"
image = "searxng/searxng"

[[services.ports]]
container = 8080

[services.health]
kind = "http"
target = "http://{host}:{port:9090}/"
"#;
        let err = load(content, &Selection::default()).unwrap_err();
        assert!(err.to_string().contains("9090"));
    }
}
