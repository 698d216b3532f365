use crate::core::port_allocator::PortRange;
use crate::domain::model::Environment;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 服務篩選條件：profile 與 --services 清單
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub profile: Option<String>,
    pub services: Vec<String>,
}

/// 單次執行的所有設定，由 CLI 建立後明確傳入 Orchestrator
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub project: String,
    pub selection: Selection,
    pub environment: Environment,
    pub port_range: PortRange,
    pub dry_run: bool,
    pub force_recreate: bool,
    pub skip_health_checks: bool,
    pub rollback_on_failure: bool,
    pub run_timeout: Option<Duration>,
    pub report_dir: Option<PathBuf>,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            project: project.into(),
            selection: Selection::default(),
            environment: Environment::default(),
            port_range: PortRange::default(),
            dry_run: false,
            force_recreate: false,
            skip_health_checks: false,
            rollback_on_failure: false,
            run_timeout: None,
            report_dir: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn generate_run_id() -> String {
        format!("run_{}", chrono::Utc::now().format("%Y%m%d_%H%M%S"))
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_port_range(mut self, port_range: PortRange) -> Self {
        self.port_range = port_range;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_force_recreate(mut self, force_recreate: bool) -> Self {
        self.force_recreate = force_recreate;
        self
    }

    pub fn with_skip_health_checks(mut self, skip: bool) -> Self {
        self.skip_health_checks = skip;
        self
    }

    pub fn with_rollback_on_failure(mut self, rollback: bool) -> Self {
        self.rollback_on_failure = rollback;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn with_report_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.report_dir = dir;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
