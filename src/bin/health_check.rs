use anyhow::Context;
use clap::Parser;
use stack_launch::core::health::HealthMonitor;
use stack_launch::domain::model::HealthOutcome;
use stack_launch::utils::logger;
use stack_launch::{DockerRuntime, Selection, ServiceCatalog, StackConfig};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "health-check")]
#[command(about = "Probe every running service of a stack once and report its health")]
struct Args {
    /// Stack configuration file(s), merged in order
    #[arg(short, long = "config", default_value = "configs/local-ai-stack.toml")]
    configs: Vec<String>,

    #[arg(long)]
    profile: Option<String>,

    #[arg(long, value_delimiter = ',')]
    services: Vec<String>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init_cli_logger(args.verbose);

    let stack = StackConfig::merge(
        args.configs
            .iter()
            .map(|path| {
                StackConfig::from_file(path)
                    .with_context(|| format!("Failed to load config file '{}'", path))
            })
            .collect::<anyhow::Result<Vec<_>>>()?,
    );
    let selection = Selection {
        profile: args.profile.clone(),
        services: args.services.clone(),
    };
    let specs = ServiceCatalog::from_config(&stack, &selection)?;

    let runtime = Arc::new(DockerRuntime::new(stack.project_name()));
    let monitor = HealthMonitor::new(runtime.clone())?;

    let mut unhealthy = 0;
    for spec in &specs {
        let Some(probe) = &spec.health_probe else {
            println!("{:<20} {:<9} no health probe configured", spec.name, "-");
            continue;
        };

        // 以容器實際發佈的 port 為準
        let ports = runtime
            .live_ports(&spec.name)
            .await
            .with_context(|| format!("Failed to inspect ports of {}", spec.name))?;
        let outcome = monitor.check_once(spec, probe, &ports).await;

        let (label, details) = match outcome {
            HealthOutcome::Healthy => ("healthy", String::new()),
            HealthOutcome::Unhealthy(reason) => ("unhealthy", reason),
            HealthOutcome::Timeout { last_error, .. } => {
                ("unhealthy", last_error.unwrap_or_else(|| "no response".to_string()))
            }
        };
        if label != "healthy" {
            unhealthy += 1;
        }
        println!("{:<20} {:<9} {}", spec.name, label, details);
    }

    if unhealthy > 0 {
        tracing::warn!("💔 {} service(s) are not healthy", unhealthy);
        std::process::exit(2);
    }

    tracing::info!("💚 All probed services are healthy");
    Ok(())
}
