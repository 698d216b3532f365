use crate::domain::model::{HealthOutcome, ProbeKind, ProbeSpec, ServiceSpec};
use crate::domain::ports::ContainerRuntime;
use crate::utils::error::Result;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const PROBE_HOST: &str = "127.0.0.1";

/// 將 probe target 的 {host} 與 {port:N} 換成實際位址與已分配的 host port
pub fn render_target(
    target: &str,
    ports: &BTreeMap<u16, u16>,
) -> std::result::Result<String, String> {
    let re = Regex::new(r"\{port:(\d+)\}").map_err(|e| e.to_string())?;

    let mut missing = None;
    let rendered = re.replace_all(target, |caps: &regex::Captures| {
        let mapped = caps[1]
            .parse::<u16>()
            .ok()
            .and_then(|container| ports.get(&container));
        match mapped {
            Some(host_port) => host_port.to_string(),
            None => {
                missing.get_or_insert_with(|| caps[1].to_string());
                caps[0].to_string()
            }
        }
    });

    if let Some(port) = missing {
        return Err(format!(
            "probe target '{}' references container port {} which is not published",
            target, port
        ));
    }

    Ok(rendered.replace("{host}", PROBE_HOST))
}

/// 依 ProbeSpec 輪詢服務是否就緒
pub struct HealthMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    client: reqwest::Client,
}

impl HealthMonitor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        // 3xx 視為健康，所以不跟隨轉址
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { runtime, client })
    }

    /// 固定間隔重試，最多 retries 次，總時間不超過 timeout_ms；重試耗盡回傳 Timeout
    pub async fn await_healthy(
        &self,
        service: &ServiceSpec,
        probe: &ProbeSpec,
        ports: &BTreeMap<u16, u16>,
    ) -> HealthOutcome {
        let target = match render_target(&probe.target, ports) {
            Ok(target) => target,
            Err(reason) => return HealthOutcome::Unhealthy(reason),
        };

        let deadline = Instant::now() + Duration::from_millis(probe.timeout_ms);
        let interval = Duration::from_millis(probe.interval_ms);
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < probe.retries {
            let budget = deadline.saturating_duration_since(Instant::now());
            if budget.is_zero() {
                break;
            }
            attempts += 1;

            match self.attempt(&service.name, probe.kind, &target, budget).await {
                Ok(()) => {
                    tracing::debug!("💚 {} healthy after {} attempt(s)", service.name, attempts);
                    return HealthOutcome::Healthy;
                }
                Err(e) => {
                    tracing::debug!(
                        "⏳ {} not ready ({}/{}): {}",
                        service.name,
                        attempts,
                        probe.retries,
                        e
                    );
                    last_error = Some(e);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if attempts >= probe.retries || remaining.is_zero() {
                break;
            }
            tokio::time::sleep(interval.min(remaining)).await;
        }

        HealthOutcome::Timeout {
            attempts,
            last_error,
        }
    }

    /// 單次檢查，給 health-check 工具使用
    pub async fn check_once(
        &self,
        service: &ServiceSpec,
        probe: &ProbeSpec,
        ports: &BTreeMap<u16, u16>,
    ) -> HealthOutcome {
        let target = match render_target(&probe.target, ports) {
            Ok(target) => target,
            Err(reason) => return HealthOutcome::Unhealthy(reason),
        };
        let budget = Duration::from_millis(probe.timeout_ms.min(probe.interval_ms.max(1_000)));

        match self.attempt(&service.name, probe.kind, &target, budget).await {
            Ok(()) => HealthOutcome::Healthy,
            Err(e) => HealthOutcome::Timeout {
                attempts: 1,
                last_error: Some(e),
            },
        }
    }

    async fn attempt(
        &self,
        service: &str,
        kind: ProbeKind,
        target: &str,
        budget: Duration,
    ) -> std::result::Result<(), String> {
        let timed_out = || format!("attempt timed out after {:?}", budget);

        match kind {
            ProbeKind::Http => {
                let response = tokio::time::timeout(budget, self.client.get(target).send())
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|e| e.to_string())?;
                let status = response.status();
                if status.is_success() || status.is_redirection() {
                    Ok(())
                } else {
                    Err(format!("HTTP {}", status))
                }
            }
            ProbeKind::Tcp => {
                tokio::time::timeout(budget, tokio::net::TcpStream::connect(target))
                    .await
                    .map_err(|_| timed_out())?
                    .map(|_| ())
                    .map_err(|e| format!("connect {}: {}", target, e))
            }
            ProbeKind::Command => {
                let passed = tokio::time::timeout(budget, self.runtime.probe(service, target))
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|e| e.to_string())?;
                if passed {
                    Ok(())
                } else {
                    Err(format!("check command '{}' exited non-zero", target))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{LaunchResult, RestartPolicy};
    use crate::domain::ports::StartRequest;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 前 n 次 probe 失敗，之後成功
    struct FlakyRuntime {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ContainerRuntime for FlakyRuntime {
        async fn start(&self, request: StartRequest<'_>) -> Result<LaunchResult> {
            Ok(LaunchResult {
                handle: request.service.name.clone(),
                applied_ports: request.ports.clone(),
            })
        }

        async fn stop(&self, _service: &str) -> Result<()> {
            Ok(())
        }

        async fn probe(&self, _service: &str, _command: &str) -> Result<bool> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(call >= self.failures_before_success)
        }
    }

    fn service() -> ServiceSpec {
        ServiceSpec {
            name: "supabase-db".to_string(),
            image_or_command: "supabase/postgres:15".to_string(),
            ports: Vec::new(),
            depends_on: BTreeSet::new(),
            health_probe: None,
            profile_tags: BTreeSet::new(),
            restart_policy: RestartPolicy::UnlessStopped,
            environment: BTreeMap::new(),
            best_effort: false,
        }
    }

    fn command_probe(retries: u32, interval_ms: u64, timeout_ms: u64) -> ProbeSpec {
        ProbeSpec {
            kind: ProbeKind::Command,
            target: "pg_isready".to_string(),
            interval_ms,
            timeout_ms,
            retries,
        }
    }

    fn monitor(failures: u32) -> (HealthMonitor, Arc<FlakyRuntime>) {
        let runtime = Arc::new(FlakyRuntime {
            failures_before_success: failures,
            calls: AtomicU32::new(0),
        });
        (HealthMonitor::new(runtime.clone()).unwrap(), runtime)
    }

    #[test]
    fn test_render_target() {
        let ports: BTreeMap<u16, u16> = [(5678, 8003)].into_iter().collect();
        assert_eq!(
            render_target("http://{host}:{port:5678}/healthz", &ports).unwrap(),
            "http://127.0.0.1:8003/healthz"
        );
        assert!(render_target("{host}:{port:6379}", &ports).is_err());
        assert_eq!(
            render_target("pg_isready -U postgres", &ports).unwrap(),
            "pg_isready -U postgres"
        );
    }

    #[tokio::test]
    async fn test_becomes_healthy_after_retries() {
        let (monitor, runtime) = monitor(2);
        let outcome = monitor
            .await_healthy(&service(), &command_probe(5, 10, 1_000), &BTreeMap::new())
            .await;
        assert_eq!(outcome, HealthOutcome::Healthy);
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_never_healthy_times_out_near_budget() {
        let (monitor, runtime) = monitor(u32::MAX);
        let started = std::time::Instant::now();
        let outcome = monitor
            .await_healthy(&service(), &command_probe(3, 100, 250), &BTreeMap::new())
            .await;
        let elapsed = started.elapsed();

        match outcome {
            HealthOutcome::Timeout { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.unwrap().contains("pg_isready"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 3);
        // 三次嘗試分別在 0、100、200ms
        assert!(elapsed >= Duration::from_millis(190), "returned too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1_000), "returned too late: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_last_attempt_returns_without_waiting_an_interval() {
        let (monitor, runtime) = monitor(u32::MAX);
        let started = std::time::Instant::now();
        let outcome = monitor
            .await_healthy(&service(), &command_probe(1, 1_000, 60_000), &BTreeMap::new())
            .await;

        assert!(matches!(outcome, HealthOutcome::Timeout { attempts: 1, .. }));
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 1);
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "waited after final attempt: {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_unpublished_port_is_unhealthy_without_polling() {
        let (monitor, runtime) = monitor(0);
        let probe = ProbeSpec {
            kind: ProbeKind::Tcp,
            target: "{host}:{port:7687}".to_string(),
            interval_ms: 10,
            timeout_ms: 100,
            retries: 3,
        };
        let outcome = monitor.await_healthy(&service(), &probe, &BTreeMap::new()).await;
        assert!(matches!(outcome, HealthOutcome::Unhealthy(_)));
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 0);
    }
}
