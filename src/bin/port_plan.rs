use anyhow::Context;
use clap::Parser;
use stack_launch::core::port_allocator::{PortAllocator, PortRange};
use stack_launch::core::scheduler::DependencyScheduler;
use stack_launch::domain::model::{Environment, PortPlan};
use stack_launch::domain::ports::PortScanner;
use stack_launch::utils::logger;
use stack_launch::{HostPortScanner, Selection, ServiceCatalog, StackConfig};
use std::collections::BTreeSet;

#[derive(Parser)]
#[command(name = "port-plan")]
#[command(about = "Show the host port each service would get, without launching anything")]
struct Args {
    /// Stack configuration file(s), merged in order
    #[arg(short, long = "config", default_value = "configs/local-ai-stack.toml")]
    configs: Vec<String>,

    #[arg(long)]
    profile: Option<String>,

    #[arg(long, value_delimiter = ',')]
    services: Vec<String>,

    #[arg(long, default_value = "private")]
    environment: Environment,

    #[arg(long)]
    port_floor: Option<u16>,

    #[arg(long)]
    port_ceiling: Option<u16>,

    /// Print the plan as JSON
    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
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
    let waves = DependencyScheduler::schedule(&specs)?;

    let range = PortRange::new(
        args.port_floor.unwrap_or_else(|| stack.port_floor()),
        args.port_ceiling.unwrap_or_else(|| stack.port_ceiling()),
    )?;
    let allocator = PortAllocator::new(range);
    let scanner = HostPortScanner::for_environment(args.environment);

    // 與實際啟動相同：逐 wave 分配，前面 wave 拿走的 port 後面不能再用
    let mut taken: BTreeSet<u16> = scanner.in_use(&allocator.scan_candidates(specs.iter()));
    let mut plan = PortPlan::new();
    for wave in &waves {
        let wave_specs = specs.iter().filter(|s| wave.contains(&s.name));
        let wave_plan = allocator.resolve(wave_specs, &taken)?;
        taken.extend(wave_plan.values().flat_map(|ports| ports.values().copied()));
        plan.extend(wave_plan);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!(
        "Port plan for {} (range {}-{}, bind {})",
        stack.project_name(),
        range.floor,
        range.ceiling,
        args.environment.bind_address()
    );
    for (index, wave) in waves.iter().enumerate() {
        println!("wave {}:", index);
        for name in wave {
            let Some(ports) = plan.get(name) else {
                continue;
            };
            if ports.is_empty() {
                println!("  {:<20} (no published ports)", name);
                continue;
            }
            let preferred = specs
                .iter()
                .find(|s| &s.name == name)
                .map(|s| s.ports.as_slice())
                .unwrap_or_default();
            for (container, host) in ports {
                let moved = preferred
                    .iter()
                    .any(|b| b.container_port == *container && b.preferred_host_port != *host);
                let note = if moved { " (remapped)" } else { "" };
                println!("  {:<20} {:>5} -> {}{}", name, host, container, note);
            }
        }
    }

    Ok(())
}
