use crate::core::context::RunContext;
use crate::domain::model::{LaunchResult, PortPlan, ServiceSpec};
use crate::domain::ports::{ContainerRuntime, StartRequest};
use crate::utils::error::{OrchestratorError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;

/// 同時啟動一個 wave 內的所有服務；單一服務失敗不影響其他服務
pub struct ProcessLauncher {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ProcessLauncher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn launch(
        &self,
        wave: &[Arc<ServiceSpec>],
        plan: &PortPlan,
        ctx: &RunContext,
    ) -> BTreeMap<String, Result<LaunchResult>> {
        let mut tasks = JoinSet::new();

        for spec in wave {
            let runtime = Arc::clone(&self.runtime);
            let spec = Arc::clone(spec);
            let ports = plan.get(&spec.name).cloned().unwrap_or_default();
            let bind_address = ctx.environment.bind_address();
            let force_recreate = ctx.force_recreate;
            let cancel = ctx.cancel.clone();

            tracing::info!("🚀 Launching {} ({})", spec.name, spec.image_or_command);
            tasks.spawn(async move {
                let request = StartRequest {
                    service: &spec,
                    ports: &ports,
                    bind_address,
                    force_recreate,
                };
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
                    result = runtime.start(request) => result,
                };
                (spec.name.clone(), result)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, result)) => {
                    match &result {
                        Ok(launch) => {
                            tracing::info!("✅ Started {} ({})", name, launch.handle)
                        }
                        Err(e) => tracing::error!("❌ {}", e),
                    }
                    results.insert(name, result);
                }
                Err(join_error) => {
                    tracing::error!("❌ Launch task aborted: {}", join_error);
                }
            }
        }

        // panic 的 task 沒有回傳名稱，補記為啟動失敗
        for spec in wave {
            if !results.contains_key(&spec.name) {
                results.insert(
                    spec.name.clone(),
                    Err(OrchestratorError::launch(&spec.name, "launch task aborted")),
                );
            }
        }

        results
    }
}
