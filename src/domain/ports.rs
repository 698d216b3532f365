use crate::domain::model::{LaunchResult, Protocol, ServiceSpec};
use crate::utils::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

/// 交給容器引擎的啟動請求
#[derive(Debug, Clone)]
pub struct StartRequest<'a> {
    pub service: &'a ServiceSpec,
    pub ports: &'a BTreeMap<u16, u16>,
    pub bind_address: &'a str,
    pub force_recreate: bool,
}

/// 容器引擎能力介面；orchestrator 只透過它改變主機狀態
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start(&self, request: StartRequest<'_>) -> Result<LaunchResult>;

    async fn stop(&self, service: &str) -> Result<()>;

    /// 在服務容器內執行檢查指令，回傳 exit code 是否為 0
    async fn probe(&self, service: &str, command: &str) -> Result<bool>;
}

pub trait PortScanner: Send + Sync {
    /// 回傳 candidates 之中目前已被主機佔用的 port
    fn in_use(&self, candidates: &[(u16, Protocol)]) -> BTreeSet<u16>;
}

pub trait Storage: Send + Sync {
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}
