use crate::config::stack_config::StackConfig;
use crate::core::catalog::CatalogSource;
use crate::core::context::{RunContext, Selection};
use crate::core::port_allocator::PortRange;
use crate::domain::model::Environment;
use crate::utils::error::Result;
use crate::utils::validation::Validate;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "stack-launch")]
#[command(about = "Launch a dependency-ordered stack of containerized services")]
pub struct CliConfig {
    /// Stack configuration file(s), merged in order
    #[arg(short, long = "config", default_value = "configs/local-ai-stack.toml")]
    pub configs: Vec<String>,

    /// Hardware/environment profile (cpu, gpu-nvidia, gpu-amd, ...)
    #[arg(long)]
    pub profile: Option<String>,

    /// private binds published ports to 127.0.0.1, public to 0.0.0.0
    #[arg(long, default_value = "private")]
    pub environment: Environment,

    /// Start only these services (and their dependencies)
    #[arg(long, value_delimiter = ',')]
    pub services: Vec<String>,

    /// Show the waves and port plan without starting anything
    #[arg(long)]
    pub dry_run: bool,

    /// Recreate containers even if they already exist
    #[arg(long)]
    pub force_recreate: bool,

    /// Treat launched services as healthy without probing
    #[arg(long)]
    pub skip_health_checks: bool,

    /// Stop services started by this run when it aborts
    #[arg(long)]
    pub rollback_on_failure: bool,

    #[arg(long)]
    pub port_floor: Option<u16>,

    #[arg(long)]
    pub port_ceiling: Option<u16>,

    /// Abort the whole run after this many seconds
    #[arg(long)]
    pub run_timeout_secs: Option<u64>,

    /// Directory for run-report-<run_id>.json/.txt
    #[arg(long)]
    pub report_dir: Option<String>,

    #[arg(long)]
    pub run_id: Option<String>,

    #[arg(long, value_enum, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Log orchestrator resource usage per wave
    #[arg(long)]
    pub monitor: bool,

    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,
}

impl CliConfig {
    /// 依序讀取並合併所有配置檔
    pub fn load_stack(&self) -> Result<StackConfig> {
        let configs = self
            .configs
            .iter()
            .map(StackConfig::from_file)
            .collect::<Result<Vec<_>>>()?;
        Ok(StackConfig::merge(configs))
    }

    pub fn catalog_sources(&self, stack: StackConfig) -> Vec<CatalogSource> {
        vec![CatalogSource::Parsed(stack)]
    }

    /// CLI 參數優先，其次為配置檔，最後是預設值
    pub fn to_run_context(&self, stack: &StackConfig) -> Result<RunContext> {
        let port_range = PortRange::new(
            self.port_floor.unwrap_or_else(|| stack.port_floor()),
            self.port_ceiling.unwrap_or_else(|| stack.port_ceiling()),
        )?;

        let run_timeout = self
            .run_timeout_secs
            .or_else(|| stack.run_timeout_secs())
            .map(Duration::from_secs);

        let report_dir = self
            .report_dir
            .clone()
            .or_else(|| stack.report_dir().map(str::to_string))
            .unwrap_or_else(|| "./reports".to_string());

        let run_id = self
            .run_id
            .clone()
            .unwrap_or_else(RunContext::generate_run_id);

        Ok(RunContext::new(run_id, stack.project_name())
            .with_selection(Selection {
                profile: self.profile.clone(),
                services: self.services.clone(),
            })
            .with_environment(self.environment)
            .with_port_range(port_range)
            .with_dry_run(self.dry_run)
            .with_force_recreate(self.force_recreate)
            .with_skip_health_checks(self.skip_health_checks)
            .with_rollback_on_failure(self.rollback_on_failure)
            .with_run_timeout(run_timeout)
            .with_report_dir(Some(PathBuf::from(report_dir))))
    }
}

impl Validate for CliConfig {
    fn validate(&self) -> Result<()> {
        for path in &self.configs {
            crate::utils::validation::validate_non_empty_string("--config", path)?;
        }
        for service in &self.services {
            crate::utils::validation::validate_service_name("--services", service)?;
        }
        if let Some(profile) = &self.profile {
            crate::utils::validation::validate_non_empty_string("--profile", profile)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags_override_stack_settings() {
        let cli = CliConfig::parse_from([
            "stack-launch",
            "--profile",
            "gpu-nvidia",
            "--environment",
            "public",
            "--services",
            "n8n,open-webui",
            "--port-floor",
            "9100",
            "--run-id",
            "run_test",
            "--dry-run",
        ]);
        let stack = StackConfig::from_toml_str(
            r#"
[stack]
name = "local-ai"

[ports]
floor = 8000
ceiling = 9500

[orchestrator]
report_dir = "/tmp/stack-reports"
run_timeout_secs = 600
"#,
        )
        .unwrap();

        let ctx = cli.to_run_context(&stack).unwrap();
        assert_eq!(ctx.run_id, "run_test");
        assert_eq!(ctx.project, "local-ai");
        assert_eq!(ctx.environment, Environment::Public);
        assert_eq!(ctx.selection.services, vec!["n8n", "open-webui"]);
        assert_eq!(ctx.selection.profile.as_deref(), Some("gpu-nvidia"));
        assert_eq!(ctx.port_range, PortRange { floor: 9100, ceiling: 9500 });
        assert_eq!(ctx.run_timeout, Some(Duration::from_secs(600)));
        assert_eq!(ctx.report_dir, Some(PathBuf::from("/tmp/stack-reports")));
        assert!(ctx.dry_run);
        assert!(!ctx.force_recreate);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let cli = CliConfig::parse_from(["stack-launch"]);
        assert_eq!(cli.configs, vec!["configs/local-ai-stack.toml"]);
        assert_eq!(cli.environment, Environment::Private);
        assert_eq!(cli.log_format, LogFormat::Pretty);
        assert!(cli.services.is_empty());
    }
}
