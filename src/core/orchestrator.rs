use crate::core::catalog::{CatalogSource, ServiceCatalog};
use crate::core::context::RunContext;
use crate::core::health::HealthMonitor;
use crate::core::launcher::ProcessLauncher;
use crate::core::port_allocator::PortAllocator;
use crate::core::report::{RunReport, ServiceReport};
use crate::core::scheduler::DependencyScheduler;
use crate::domain::model::{
    HealthOutcome, LaunchResult, PortPlan, ServiceSpec, ServiceStatus, Wave,
};
use crate::domain::ports::{ContainerRuntime, PortScanner};
use crate::utils::error::{OrchestratorError, Result};
use crate::utils::monitor::SystemMonitor;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Config(String),
    Cycle(Vec<String>),
    HardDependency { service: String, wave: usize },
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Config(message) => write!(f, "configuration error: {}", message),
            AbortReason::Cycle(cycle) => write!(f, "dependency cycle: {}", cycle.join(" -> ")),
            AbortReason::HardDependency { service, wave } => {
                write!(f, "hard dependency '{}' failed in wave {}", service, wave)
            }
            AbortReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Loading,
    Scheduling,
    AllocatingPorts { wave: usize },
    Launching { wave: usize },
    HealthChecking { wave: usize },
    Completed,
    FatallyAborted(AbortReason),
}

impl OrchestratorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestratorState::Completed | OrchestratorState::FatallyAborted(_)
        )
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorState::Idle => write!(f, "idle"),
            OrchestratorState::Loading => write!(f, "loading"),
            OrchestratorState::Scheduling => write!(f, "scheduling"),
            OrchestratorState::AllocatingPorts { wave } => {
                write!(f, "wave {}: allocating-ports", wave)
            }
            OrchestratorState::Launching { wave } => write!(f, "wave {}: launching", wave),
            OrchestratorState::HealthChecking { wave } => {
                write!(f, "wave {}: health-checking", wave)
            }
            OrchestratorState::Completed => write!(f, "completed"),
            OrchestratorState::FatallyAborted(reason) => write!(f, "fatally-aborted ({})", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: OrchestratorState,
    pub history: Vec<OrchestratorState>,
    pub report: RunReport,
}

impl RunOutcome {
    /// 0 全部成功；1 配置或排程錯誤；2 有服務失敗（best-effort 完成、硬依賴中止或取消）
    pub fn exit_code(&self) -> i32 {
        match &self.state {
            OrchestratorState::Completed if self.report.has_failures() => 2,
            OrchestratorState::Completed => 0,
            OrchestratorState::FatallyAborted(AbortReason::Config(_))
            | OrchestratorState::FatallyAborted(AbortReason::Cycle(_)) => 1,
            _ => 2,
        }
    }

    /// 曾經進入過的 wave
    pub fn entered_waves(&self) -> BTreeSet<usize> {
        self.history
            .iter()
            .filter_map(|s| match s {
                OrchestratorState::AllocatingPorts { wave } => Some(*wave),
                _ => None,
            })
            .collect()
    }
}

/// 服務編排狀態機：Loading → Scheduling → 逐 wave 分配 port、啟動、健康檢查
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    scanner: Arc<dyn PortScanner>,
    launcher: ProcessLauncher,
    health: Arc<HealthMonitor>,
    monitor: SystemMonitor,
    state: OrchestratorState,
    history: Vec<OrchestratorState>,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, scanner: Arc<dyn PortScanner>) -> Result<Self> {
        Ok(Self {
            launcher: ProcessLauncher::new(Arc::clone(&runtime)),
            health: Arc::new(HealthMonitor::new(Arc::clone(&runtime))?),
            runtime,
            scanner,
            monitor: SystemMonitor::new(false),
            state: OrchestratorState::Idle,
            history: Vec::new(),
        })
    }

    /// 啟用或禁用系統監控
    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitor = SystemMonitor::new(enabled);
        self
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    pub async fn run(&mut self, ctx: &RunContext, sources: &[CatalogSource]) -> RunOutcome {
        self.state = OrchestratorState::Idle;
        self.history = vec![OrchestratorState::Idle];

        let mut report = RunReport::new(&ctx.run_id, &ctx.project, ctx.dry_run);
        self.monitor.log_stats("Run started");

        // 整體逾時：取消 token，讓進行中的啟動與輪詢結束
        let watchdog = ctx.run_timeout.map(|timeout| {
            let token = ctx.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        tracing::warn!("⏰ Run timeout of {:?} reached, cancelling", timeout);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });

        let final_state = self.drive(ctx, sources, &mut report).await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        if ctx.rollback_on_failure && matches!(final_state, OrchestratorState::FatallyAborted(_)) {
            self.rollback(&mut report).await;
        }

        self.monitor.log_final_stats();
        report.finalize(
            final_state.to_string(),
            self.history.iter().map(|s| s.to_string()).collect(),
        );

        RunOutcome {
            state: final_state,
            history: self.history.clone(),
            report,
        }
    }

    fn transition(&mut self, next: OrchestratorState) {
        tracing::debug!("🔁 {} -> {}", self.state, next);
        self.state = next.clone();
        self.history.push(next);
    }

    fn abort(&mut self, reason: AbortReason) -> OrchestratorState {
        tracing::error!("🛑 Run aborted: {}", reason);
        let state = OrchestratorState::FatallyAborted(reason);
        self.transition(state.clone());
        state
    }

    async fn drive(
        &mut self,
        ctx: &RunContext,
        sources: &[CatalogSource],
        report: &mut RunReport,
    ) -> OrchestratorState {
        self.transition(OrchestratorState::Loading);
        let specs = match ServiceCatalog::load(sources, &ctx.selection) {
            Ok(specs) => specs,
            Err(e) => {
                tracing::error!("❌ {}", e.user_friendly_message());
                return self.abort(AbortReason::Config(e.to_string()));
            }
        };
        tracing::info!("📚 Loaded {} services", specs.len());

        self.transition(OrchestratorState::Scheduling);
        let waves = match DependencyScheduler::schedule(&specs) {
            Ok(waves) => waves,
            Err(OrchestratorError::CyclicDependencyError { cycle }) => {
                return self.abort(AbortReason::Cycle(cycle));
            }
            Err(e) => return self.abort(AbortReason::Config(e.to_string())),
        };

        let by_name: BTreeMap<String, Arc<ServiceSpec>> = specs
            .into_iter()
            .map(|s| (s.name.clone(), Arc::new(s)))
            .collect();
        for (index, wave) in waves.iter().enumerate() {
            tracing::info!("🌊 Wave {}: [{}]", index, wave.join(", "));
            for name in wave {
                report.record(name, ServiceReport::pending(index));
            }
        }
        report.waves = waves.clone();

        let allocator = PortAllocator::new(ctx.port_range);
        let mut claimed: BTreeSet<u16> = BTreeSet::new();

        for (index, wave) in waves.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                report.skip_unstarted(
                    waves[index..].iter().flatten(),
                    "not started: run cancelled",
                );
                return self.abort(AbortReason::Cancelled);
            }

            self.transition(OrchestratorState::AllocatingPorts { wave: index });
            let wave_specs: Vec<Arc<ServiceSpec>> =
                wave.iter().map(|n| Arc::clone(&by_name[n])).collect();
            let (plan, launchable) = self
                .allocate(&allocator, &wave_specs, &mut claimed, report)
                .await;
            report
                .port_plan
                .extend(plan.iter().map(|(k, v)| (k.clone(), v.clone())));

            if ctx.dry_run {
                self.record_dry_run(index, &launchable, &plan, report);
                continue;
            }

            self.transition(OrchestratorState::Launching { wave: index });
            let wave_started = Instant::now();
            let launched = self.launcher.launch(&launchable, &plan, ctx).await;

            let mut running = Vec::new();
            for (name, result) in launched {
                match result {
                    Ok(launch) => {
                        Self::reconcile_ports(&name, &plan, &launch, &mut claimed, report);
                        running.push((Arc::clone(&by_name[&name]), launch));
                    }
                    Err(e) => report.record(
                        &name,
                        ServiceReport {
                            status: ServiceStatus::Failed,
                            duration_ms: wave_started.elapsed().as_millis() as u64,
                            last_error: Some(e.to_string()),
                            wave: Some(index),
                            applied_ports: plan.get(&name).cloned().unwrap_or_default(),
                            handle: None,
                            rolled_back: false,
                        },
                    ),
                }
            }

            self.transition(OrchestratorState::HealthChecking { wave: index });
            self.check_wave(index, running, wave_started, ctx, report).await;
            self.monitor.log_stats(&format!("Wave {} complete", index));

            let upcoming = &waves[index + 1..];
            if ctx.cancel.is_cancelled() {
                report.skip_unstarted(upcoming.iter().flatten(), "not started: run cancelled");
                return self.abort(AbortReason::Cancelled);
            }

            if let Some(blocker) = Self::find_blocking_failure(wave, upcoming, &by_name, report) {
                let reason = format!(
                    "not started: hard dependency '{}' did not become healthy",
                    blocker
                );
                report.skip_unstarted(upcoming.iter().flatten(), &reason);
                return self.abort(AbortReason::HardDependency {
                    service: blocker,
                    wave: index,
                });
            }
        }

        tracing::info!("🏁 All {} waves processed", waves.len());
        self.transition(OrchestratorState::Completed);
        OrchestratorState::Completed
    }

    /// 掃描主機 port 後解決衝突；port 耗盡只讓該服務失敗
    async fn allocate(
        &self,
        allocator: &PortAllocator,
        wave_specs: &[Arc<ServiceSpec>],
        claimed: &mut BTreeSet<u16>,
        report: &mut RunReport,
    ) -> (PortPlan, Vec<Arc<ServiceSpec>>) {
        let candidates = allocator.scan_candidates(wave_specs.iter().map(|s| s.as_ref()));
        let scanner = Arc::clone(&self.scanner);
        let scan = tokio::task::spawn_blocking(move || scanner.in_use(&candidates)).await;
        let mut in_use = match scan {
            Ok(in_use) => in_use,
            Err(e) => {
                tracing::warn!("⚠️ Host port scan failed, assuming all ports free: {}", e);
                BTreeSet::new()
            }
        };
        in_use.extend(claimed.iter().copied());

        let mut pending: Vec<Arc<ServiceSpec>> = wave_specs.to_vec();
        loop {
            match allocator.resolve(pending.iter().map(|s| s.as_ref()), &in_use) {
                Ok(plan) => {
                    claimed.extend(plan.values().flat_map(|ports| ports.values().copied()));
                    return (plan, pending);
                }
                Err(e) => {
                    let exhausted = match &e {
                        OrchestratorError::PortExhaustionError { service, .. } => {
                            Some(service.clone())
                        }
                        _ => None,
                    };
                    tracing::error!("❌ {}", e);

                    let failed: Vec<String> = match exhausted {
                        Some(service) => vec![service],
                        None => pending.iter().map(|s| s.name.clone()).collect(),
                    };
                    for name in &failed {
                        let wave = report.get(name).and_then(|r| r.wave);
                        report.record(
                            name,
                            ServiceReport {
                                status: ServiceStatus::Failed,
                                duration_ms: 0,
                                last_error: Some(e.to_string()),
                                wave,
                                applied_ports: BTreeMap::new(),
                                handle: None,
                                rolled_back: false,
                            },
                        );
                    }
                    pending.retain(|s| !failed.contains(&s.name));
                }
            }
        }
    }

    /// 沿用既有容器時以實際發佈的 port 為準，釋放計畫中沒用到的 port
    fn reconcile_ports(
        name: &str,
        plan: &PortPlan,
        launch: &LaunchResult,
        claimed: &mut BTreeSet<u16>,
        report: &mut RunReport,
    ) {
        let Some(planned) = plan.get(name) else {
            return;
        };
        if planned == &launch.applied_ports {
            return;
        }

        for port in planned.values() {
            if !launch.applied_ports.values().any(|applied| applied == port) {
                claimed.remove(port);
            }
        }
        claimed.extend(launch.applied_ports.values().copied());
        report
            .port_plan
            .insert(name.to_string(), launch.applied_ports.clone());
    }

    fn record_dry_run(
        &self,
        index: usize,
        launchable: &[Arc<ServiceSpec>],
        plan: &PortPlan,
        report: &mut RunReport,
    ) {
        for spec in launchable {
            let ports = plan.get(&spec.name).cloned().unwrap_or_default();
            tracing::info!(
                "🔍 [dry-run] wave {} would start {} ({}) with ports {:?}",
                index,
                spec.name,
                spec.image_or_command,
                ports
            );
            report.record(
                &spec.name,
                ServiceReport {
                    status: ServiceStatus::Skipped,
                    duration_ms: 0,
                    last_error: Some("dry run".to_string()),
                    wave: Some(index),
                    applied_ports: ports,
                    handle: None,
                    rolled_back: false,
                },
            );
        }
    }

    /// 同時輪詢 wave 內所有已啟動服務的健康狀態
    async fn check_wave(
        &self,
        index: usize,
        running: Vec<(Arc<ServiceSpec>, LaunchResult)>,
        wave_started: Instant,
        ctx: &RunContext,
        report: &mut RunReport,
    ) {
        let mut tasks = JoinSet::new();
        let mut launches: BTreeMap<String, LaunchResult> = BTreeMap::new();

        for (spec, launch) in running {
            let probe = match (&spec.health_probe, ctx.skip_health_checks) {
                (Some(probe), false) => probe.clone(),
                (_, skipped) => {
                    if skipped {
                        tracing::info!("⏭️ Health check skipped for {}", spec.name);
                    }
                    report.record(
                        &spec.name,
                        Self::entry(index, ServiceStatus::Healthy, None, wave_started, &launch),
                    );
                    continue;
                }
            };

            let monitor = Arc::clone(&self.health);
            let cancel = ctx.cancel.clone();
            let ports = launch.applied_ports.clone();
            launches.insert(spec.name.clone(), launch);

            tasks.spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    outcome = monitor.await_healthy(&spec, &probe, &ports) => Some(outcome),
                };
                (spec.name.clone(), outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (name, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("❌ Health task aborted: {}", e);
                    continue;
                }
            };
            let Some(launch) = launches.remove(&name) else {
                continue;
            };

            let (status, error) = match outcome {
                Some(HealthOutcome::Healthy) => {
                    tracing::info!("💚 {} is healthy", name);
                    (ServiceStatus::Healthy, None)
                }
                Some(HealthOutcome::Unhealthy(reason)) => {
                    tracing::warn!("💔 {} is unhealthy: {}", name, reason);
                    (ServiceStatus::Unhealthy, Some(reason))
                }
                Some(HealthOutcome::Timeout {
                    attempts,
                    last_error,
                }) => {
                    let error = OrchestratorError::HealthTimeoutError {
                        service: name.clone(),
                        attempts,
                    };
                    tracing::warn!("⏰ {}", error);
                    let message = match last_error {
                        Some(last) => format!("{} (last error: {})", error, last),
                        None => error.to_string(),
                    };
                    (ServiceStatus::Unhealthy, Some(message))
                }
                None => (
                    ServiceStatus::Failed,
                    Some(OrchestratorError::Cancelled.to_string()),
                ),
            };
            report.record(&name, Self::entry(index, status, error, wave_started, &launch));
        }

        // 被中止的健康檢查 task
        for (name, launch) in launches {
            report.record(
                &name,
                Self::entry(
                    index,
                    ServiceStatus::Failed,
                    Some("health task aborted".to_string()),
                    wave_started,
                    &launch,
                ),
            );
        }
    }

    fn entry(
        index: usize,
        status: ServiceStatus,
        last_error: Option<String>,
        wave_started: Instant,
        launch: &LaunchResult,
    ) -> ServiceReport {
        ServiceReport {
            status,
            duration_ms: wave_started.elapsed().as_millis() as u64,
            last_error,
            wave: Some(index),
            applied_ports: launch.applied_ports.clone(),
            handle: Some(launch.handle.clone()),
            rolled_back: false,
        }
    }

    /// 非 best-effort 且被後續 wave 依賴的失敗服務會中止整個執行
    fn find_blocking_failure(
        wave: &Wave,
        later_waves: &[Wave],
        by_name: &BTreeMap<String, Arc<ServiceSpec>>,
        report: &RunReport,
    ) -> Option<String> {
        wave.iter()
            .filter(|name| report.status_of(name) != Some(ServiceStatus::Healthy))
            .filter(|name| !by_name[*name].best_effort)
            .find(|name| {
                later_waves
                    .iter()
                    .flatten()
                    .any(|later| by_name[later].depends_on.contains(*name))
            })
            .cloned()
    }

    /// 依啟動順序反向停止本次啟動的服務
    async fn rollback(&self, report: &mut RunReport) {
        let started: Vec<String> = report
            .waves
            .iter()
            .flatten()
            .filter(|name| report.get(name).is_some_and(|r| r.was_started()))
            .cloned()
            .collect();

        for name in started.iter().rev() {
            tracing::info!("↩️ Rolling back {}", name);
            match self.runtime.stop(name).await {
                Ok(()) => {
                    if let Some(entry) = report.per_service.get_mut(name) {
                        entry.rolled_back = true;
                    }
                }
                Err(e) => tracing::error!("❌ Rollback of {} failed: {}", name, e),
            }
        }
    }
}
