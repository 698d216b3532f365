use crate::domain::model::LaunchResult;
use crate::domain::ports::{ContainerRuntime, StartRequest};
use crate::utils::error::{OrchestratorError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Output;
use tokio::process::Command;
use tokio::sync::OnceCell;

/// 透過 docker CLI 管理容器：容器名稱為 <project>-<service>，共用 <project> network
pub struct DockerRuntime {
    binary: String,
    project: String,
    network_ready: OnceCell<()>,
}

impl DockerRuntime {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            binary: "docker".to_string(),
            project: project.into(),
            network_ready: OnceCell::new(),
        }
    }

    /// 例如改用 podman
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn container_name(&self, service: &str) -> String {
        format!("{}-{}", self.project, service)
    }

    pub fn run_args(&self, request: &StartRequest<'_>) -> Vec<String> {
        let service = request.service;
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            self.container_name(&service.name),
            "--network".into(),
            self.project.clone(),
            "--network-alias".into(),
            service.name.clone(),
            "--restart".into(),
            service.restart_policy.as_docker_arg().into(),
            "--label".into(),
            format!("stack-launch.project={}", self.project),
            "--label".into(),
            format!("stack-launch.service={}", service.name),
        ];

        for binding in &service.ports {
            if let Some(host_port) = request.ports.get(&binding.container_port) {
                args.push("-p".into());
                args.push(format!(
                    "{}:{}:{}/{}",
                    request.bind_address, host_port, binding.container_port, binding.protocol
                ));
            }
        }

        for (key, value) in &service.environment {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }

        // 第一個 token 是 image，其餘為 command 參數
        args.extend(service.image_or_command.split_whitespace().map(str::to_string));
        args
    }

    async fn exec(&self, args: &[String]) -> Result<Output> {
        tracing::debug!("🐳 {} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(output)
    }

    async fn ensure_network(&self) -> Result<()> {
        self.network_ready
            .get_or_try_init(|| async {
                let inspect = self
                    .exec(&["network".into(), "inspect".into(), self.project.clone()])
                    .await?;
                if inspect.status.success() {
                    return Ok(());
                }

                let create = self
                    .exec(&["network".into(), "create".into(), self.project.clone()])
                    .await?;
                if create.status.success() {
                    tracing::info!("🕸️ Created docker network {}", self.project);
                    Ok(())
                } else {
                    Err(OrchestratorError::launch(
                        &self.project,
                        format!("network create failed: {}", stderr(&create)),
                    ))
                }
            })
            .await
            .map(|_| ())
    }

    /// 已存在容器的 Running 狀態；不存在時回傳 None
    async fn container_state(&self, name: &str) -> Result<Option<bool>> {
        let output = self
            .exec(&[
                "inspect".into(),
                "-f".into(),
                "{{.State.Running}}".into(),
                name.to_string(),
            ])
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim() == "true"))
    }

    async fn published_ports(&self, name: &str) -> Result<BTreeMap<u16, u16>> {
        let output = self.exec(&["port".into(), name.to_string()]).await?;
        Ok(parse_port_output(&String::from_utf8_lossy(&output.stdout)))
    }

    /// 服務目前實際發佈的 port，容器不存在時為空
    pub async fn live_ports(&self, service: &str) -> Result<BTreeMap<u16, u16>> {
        self.published_ports(&self.container_name(service)).await
    }

    async fn container_id(&self, name: &str) -> Result<String> {
        let output = self
            .exec(&["inspect".into(), "-f".into(), "{{.Id}}".into(), name.to_string()])
            .await?;
        Ok(short_id(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, request: StartRequest<'_>) -> Result<LaunchResult> {
        let service = &request.service.name;
        let name = self.container_name(service);
        self.ensure_network().await?;

        if request.force_recreate {
            let removed = self.exec(&["rm".into(), "-f".into(), name.clone()]).await?;
            let details = stderr(&removed);
            if !removed.status.success() && !is_missing_container(&details) {
                tracing::error!("❌ Could not remove existing container {}: {}", name, details);
                return Err(OrchestratorError::launch(
                    service,
                    format!("remove before recreate failed: {}", details),
                ));
            }
        } else if let Some(running) = self.container_state(&name).await? {
            // 與 compose 相同：未要求重建時沿用現有容器
            if !running {
                let output = self.exec(&["start".into(), name.clone()]).await?;
                if !output.status.success() {
                    return Err(OrchestratorError::launch(service, stderr(&output)));
                }
            }
            let applied_ports = self.published_ports(&name).await?;
            if &applied_ports != request.ports {
                tracing::warn!(
                    "⚠️ Reusing existing container {} with ports {:?} (planned {:?}); use --force-recreate to apply the plan",
                    name,
                    applied_ports,
                    request.ports
                );
            }
            return Ok(LaunchResult {
                handle: self.container_id(&name).await?,
                applied_ports,
            });
        }

        let output = self.exec(&self.run_args(&request)).await?;
        if !output.status.success() {
            let details = stderr(&output);
            if details.contains("port is already allocated")
                || details.contains("address already in use")
            {
                tracing::warn!(
                    "⚠️ Port for {} was taken between scan and launch; re-run to pick a new port",
                    service
                );
            }
            return Err(OrchestratorError::launch(service, details));
        }

        Ok(LaunchResult {
            handle: short_id(&String::from_utf8_lossy(&output.stdout)),
            applied_ports: request.ports.clone(),
        })
    }

    async fn stop(&self, service: &str) -> Result<()> {
        let output = self
            .exec(&["stop".into(), self.container_name(service)])
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(OrchestratorError::launch(service, format!("stop failed: {}", stderr(&output))))
        }
    }

    async fn probe(&self, service: &str, command: &str) -> Result<bool> {
        let output = self
            .exec(&[
                "exec".into(),
                self.container_name(service),
                "sh".into(),
                "-c".into(),
                command.to_string(),
            ])
            .await?;
        Ok(output.status.success())
    }
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("no such container")
}

fn short_id(raw: &str) -> String {
    raw.trim().chars().take(12).collect()
}

/// 解析 `docker port` 輸出，例如 `5678/tcp -> 127.0.0.1:8001`
pub fn parse_port_output(output: &str) -> BTreeMap<u16, u16> {
    output
        .lines()
        .filter_map(|line| {
            let (container, host) = line.split_once(" -> ")?;
            let container_port = container.split('/').next()?.trim().parse().ok()?;
            let host_port = host.rsplit(':').next()?.trim().parse().ok()?;
            Some((container_port, host_port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{PortBinding, Protocol, RestartPolicy, ServiceSpec};
    use std::collections::BTreeSet;

    fn n8n() -> ServiceSpec {
        ServiceSpec {
            name: "n8n".to_string(),
            image_or_command: "n8nio/n8n:latest start --tunnel".to_string(),
            ports: vec![PortBinding {
                container_port: 5678,
                preferred_host_port: 5678,
                protocol: Protocol::Tcp,
            }],
            depends_on: BTreeSet::new(),
            health_probe: None,
            profile_tags: BTreeSet::new(),
            restart_policy: RestartPolicy::UnlessStopped,
            environment: [("N8N_HOST".to_string(), "localhost".to_string())]
                .into_iter()
                .collect(),
            best_effort: false,
        }
    }

    #[test]
    fn test_run_args() {
        let runtime = DockerRuntime::new("localai");
        let service = n8n();
        let ports: BTreeMap<u16, u16> = [(5678, 8001)].into_iter().collect();
        let args = runtime.run_args(&StartRequest {
            service: &service,
            ports: &ports,
            bind_address: "127.0.0.1",
            force_recreate: false,
        });

        assert_eq!(&args[..4], &["run", "-d", "--name", "localai-n8n"]);
        assert!(args.windows(2).any(|w| w == ["--restart", "unless-stopped"]));
        assert!(args.windows(2).any(|w| w == ["-p", "127.0.0.1:8001:5678/tcp"]));
        assert!(args.windows(2).any(|w| w == ["-e", "N8N_HOST=localhost"]));
        assert_eq!(&args[args.len() - 3..], &["n8nio/n8n:latest", "start", "--tunnel"]);
    }

    /// 以 shell 腳本模擬 docker CLI，`rm` 的輸出與 exit code 由參數決定
    #[cfg(unix)]
    fn fake_docker(dir: &std::path::Path, rm_stderr: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("docker");
        let script = format!(
            "#!/bin/sh\ncase \"$1\" in\n  rm) echo '{}' >&2; exit 1 ;;\n  run) echo 0123456789abcdef ;;\nesac\nexit 0\n",
            rm_stderr
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_force_recreate_stops_when_remove_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = DockerRuntime::new("localai").with_binary(fake_docker(
            dir.path(),
            "Error response from daemon: cannot remove container: device or resource busy",
        ));
        let service = n8n();
        let ports = BTreeMap::new();

        let err = runtime
            .start(StartRequest {
                service: &service,
                ports: &ports,
                bind_address: "127.0.0.1",
                force_recreate: true,
            })
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("remove before recreate failed"), "{}", message);
        assert!(message.contains("resource busy"), "{}", message);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_force_recreate_ignores_missing_container() {
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = DockerRuntime::new("localai").with_binary(fake_docker(
            dir.path(),
            "Error response from daemon: No such container: localai-n8n",
        ));
        let service = n8n();
        let ports = BTreeMap::from([(5678, 8001)]);

        let launch = runtime
            .start(StartRequest {
                service: &service,
                ports: &ports,
                bind_address: "127.0.0.1",
                force_recreate: true,
            })
            .await
            .unwrap();

        assert_eq!(launch.handle, "0123456789ab");
        assert_eq!(launch.applied_ports, ports);
    }

    #[test]
    fn test_parse_port_output() {
        let output = "5678/tcp -> 127.0.0.1:8001\n5678/tcp -> [::]:8001\n53/udp -> 0.0.0.0:5353\ngarbage\n";
        let ports = parse_port_output(output);
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[&5678], 8001);
        assert_eq!(ports[&53], 5353);
    }
}
