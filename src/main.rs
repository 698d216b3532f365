use clap::Parser;
use stack_launch::utils::{logger, validation::Validate};
use stack_launch::{
    CliConfig, DockerRuntime, HostPortScanner, LocalStorage, LogFormat, Orchestrator,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = CliConfig::parse();

    // 初始化日誌
    match config.log_format {
        LogFormat::Pretty => logger::init_cli_logger(config.verbose),
        LogFormat::Json => logger::init_json_logger(config.verbose),
    }

    tracing::info!("Starting stack-launch");
    if config.verbose {
        tracing::debug!("CLI config: {:?}", config);
    }

    // 驗證參數並讀取配置檔，任何錯誤都在啟動前以 exit 1 結束
    if let Err(e) = config.validate() {
        fail_before_run(&e);
    }
    let stack = config.load_stack().unwrap_or_else(|e| fail_before_run(&e));
    let ctx = config
        .to_run_context(&stack)
        .unwrap_or_else(|e| fail_before_run(&e));

    if config.monitor {
        tracing::info!("🔍 System monitoring enabled");
    }

    // Ctrl-C 取消整個執行
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("🛑 Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let runtime = Arc::new(DockerRuntime::new(ctx.project.clone()));
    let scanner = Arc::new(HostPortScanner::for_environment(ctx.environment));
    let mut orchestrator = Orchestrator::new(runtime, scanner)
        .unwrap_or_else(|e| fail_before_run(&e))
        .with_monitoring(config.monitor);

    let sources = config.catalog_sources(stack);
    let outcome = orchestrator.run(&ctx, &sources).await;

    println!("{}", outcome.report.summary_table());

    if let Some(report_dir) = &ctx.report_dir {
        let storage = LocalStorage::new(report_dir.clone());
        match outcome.report.write(&storage).await {
            Ok(files) => {
                for file in files {
                    tracing::info!("📁 Report saved to: {}", report_dir.join(file).display());
                }
            }
            Err(e) => {
                tracing::error!("❌ Failed to write run report: {}", e);
                eprintln!("❌ {}", e.user_friendly_message());
            }
        }
    }

    let exit_code = outcome.exit_code();
    match exit_code {
        0 => tracing::info!("✅ Stack is up ({})", outcome.state),
        code => tracing::error!("❌ Run finished with exit code {} ({})", code, outcome.state),
    }

    if exit_code > 0 {
        std::process::exit(exit_code);
    }

    Ok(())
}

fn fail_before_run(e: &stack_launch::OrchestratorError) -> ! {
    tracing::error!(
        "❌ Configuration failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());
    std::process::exit(1);
}
