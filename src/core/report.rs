use crate::domain::model::{PortPlan, ServiceStatus, Wave};
use crate::domain::ports::Storage;
use crate::utils::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReport {
    pub status: ServiceStatus,
    pub duration_ms: u64,
    pub last_error: Option<String>,
    pub wave: Option<usize>,
    #[serde(default)]
    pub applied_ports: BTreeMap<u16, u16>,
    pub handle: Option<String>,
    #[serde(default)]
    pub rolled_back: bool,
}

impl ServiceReport {
    /// 尚未啟動的服務先記為 skipped，啟動後覆寫
    pub fn pending(wave: usize) -> Self {
        Self {
            status: ServiceStatus::Skipped,
            duration_ms: 0,
            last_error: None,
            wave: Some(wave),
            applied_ports: BTreeMap::new(),
            handle: None,
            rolled_back: false,
        }
    }

    pub fn was_started(&self) -> bool {
        self.handle.is_some()
    }
}

/// 單次執行的結果，執行中逐步累積，結束時寫成 JSON 與文字摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub project: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub final_state: String,
    pub dry_run: bool,
    pub waves: Vec<Wave>,
    pub port_plan: PortPlan,
    pub per_service: BTreeMap<String, ServiceReport>,
    pub state_history: Vec<String>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, project: impl Into<String>, dry_run: bool) -> Self {
        Self {
            run_id: run_id.into(),
            project: project.into(),
            started_at: Utc::now(),
            finished_at: None,
            final_state: "idle".to_string(),
            dry_run,
            waves: Vec::new(),
            port_plan: PortPlan::new(),
            per_service: BTreeMap::new(),
            state_history: Vec::new(),
        }
    }

    pub fn record(&mut self, service: &str, entry: ServiceReport) {
        self.per_service.insert(service.to_string(), entry);
    }

    pub fn get(&self, service: &str) -> Option<&ServiceReport> {
        self.per_service.get(service)
    }

    pub fn status_of(&self, service: &str) -> Option<ServiceStatus> {
        self.per_service.get(service).map(|r| r.status)
    }

    /// 將尚未啟動的服務標記為 skipped 並附上原因
    pub fn skip_unstarted<'a, I>(&mut self, services: I, reason: &str)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for name in services {
            if let Some(entry) = self.per_service.get_mut(name) {
                if entry.status == ServiceStatus::Skipped && !entry.was_started() {
                    entry.last_error = Some(reason.to_string());
                }
            }
        }
    }

    pub fn finalize(&mut self, final_state: String, history: Vec<String>) {
        self.final_state = final_state;
        self.state_history = history;
        self.finished_at = Some(Utc::now());
    }

    pub fn count(&self, status: ServiceStatus) -> usize {
        self.per_service.values().filter(|r| r.status == status).count()
    }

    pub fn has_failures(&self) -> bool {
        self.per_service
            .values()
            .any(|r| matches!(r.status, ServiceStatus::Failed | ServiceStatus::Unhealthy))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 人類可讀的摘要表，列出每一個服務
    pub fn summary_table(&self) -> String {
        let name_width = self
            .per_service
            .keys()
            .map(|k| k.len())
            .max()
            .unwrap_or(7)
            .max("SERVICE".len());

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Run {} ({}) - {}",
            self.run_id, self.project, self.final_state
        );
        let _ = writeln!(
            out,
            "{:<name_width$}  {:<4}  {:<9}  {:>8}  {:<17}  DETAILS",
            "SERVICE", "WAVE", "STATUS", "TIME", "PORTS"
        );

        for (name, entry) in &self.per_service {
            let wave = entry
                .wave
                .map(|w| w.to_string())
                .unwrap_or_else(|| "-".to_string());
            let ports = if entry.applied_ports.is_empty() {
                "-".to_string()
            } else {
                entry
                    .applied_ports
                    .iter()
                    .map(|(container, host)| format!("{}->{}", host, container))
                    .collect::<Vec<_>>()
                    .join(",")
            };
            let mut details = entry.last_error.clone().unwrap_or_default();
            if entry.rolled_back {
                details.push_str(" (rolled back)");
            }

            let _ = writeln!(
                out,
                "{:<name_width$}  {:<4}  {:<9}  {:>6}ms  {:<17}  {}",
                name,
                wave,
                entry.status,
                entry.duration_ms,
                ports,
                details.trim()
            );
        }

        let _ = writeln!(
            out,
            "healthy: {}, unhealthy: {}, failed: {}, skipped: {}",
            self.count(ServiceStatus::Healthy),
            self.count(ServiceStatus::Unhealthy),
            self.count(ServiceStatus::Failed),
            self.count(ServiceStatus::Skipped)
        );
        out
    }

    /// 寫出 run-report-<run_id>.json 與 .txt，回傳兩個檔名
    pub async fn write<S: Storage>(&self, storage: &S) -> Result<Vec<String>> {
        let json_name = format!("run-report-{}.json", self.run_id);
        let text_name = format!("run-report-{}.txt", self.run_id);

        storage.write_file(&json_name, self.to_json()?.as_bytes()).await?;
        storage
            .write_file(&text_name, self.summary_table().as_bytes())
            .await?;

        Ok(vec![json_name, text_name])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: ServiceStatus, wave: usize) -> ServiceReport {
        ServiceReport {
            status,
            duration_ms: 1200,
            last_error: None,
            wave: Some(wave),
            applied_ports: BTreeMap::new(),
            handle: Some("abc123".to_string()),
            rolled_back: false,
        }
    }

    #[test]
    fn test_failures_detected() {
        let mut report = RunReport::new("run_1", "localai", false);
        report.record("postgres", entry(ServiceStatus::Healthy, 0));
        assert!(!report.has_failures());

        report.record("n8n", entry(ServiceStatus::Unhealthy, 1));
        assert!(report.has_failures());
        assert_eq!(report.count(ServiceStatus::Healthy), 1);
    }

    #[test]
    fn test_summary_table_lists_every_service() {
        let mut report = RunReport::new("run_2", "localai", false);
        let mut db = entry(ServiceStatus::Healthy, 0);
        db.applied_ports.insert(5432, 5432);
        report.record("supabase-db", db);

        let mut failed = entry(ServiceStatus::Failed, 1);
        failed.last_error = Some("image not found".to_string());
        report.record("flowise", failed);
        report.record("caddy", ServiceReport::pending(2));
        report.skip_unstarted(&["caddy".to_string()], "not started");
        report.finalize("fatally-aborted".to_string(), Vec::new());

        let table = report.summary_table();
        assert!(table.contains("supabase-db"));
        assert!(table.contains("5432->5432"));
        assert!(table.contains("image not found"));
        assert!(table.contains("caddy"));
        assert!(table.contains("not started"));
        assert!(table.contains("healthy: 1, unhealthy: 0, failed: 1, skipped: 1"));
    }

    #[test]
    fn test_json_contains_status_names() {
        let mut report = RunReport::new("run_3", "localai", true);
        report.record("qdrant", ServiceReport::pending(0));
        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["per_service"]["qdrant"]["status"], "skipped");
        assert_eq!(value["dry_run"], true);
    }
}
