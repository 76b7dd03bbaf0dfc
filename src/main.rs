use clap::Parser;
use db_migrate::config::cli::{Cli, Command, Side};
use db_migrate::core::runner::preview_records;
use db_migrate::utils::error::ErrorSeverity;
use db_migrate::utils::logger;
use db_migrate::utils::validation::Validate;
use db_migrate::{
    create_connector, start_migration, Connector, EtlError, JobTracker, MigrationConfig, Result,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // 初始化日誌
    if cli.json_logs {
        logger::init_json_logger();
    } else {
        logger::init_cli_logger(cli.verbose);
    }

    tracing::info!("Starting db-migrate CLI");
    if cli.verbose {
        tracing::debug!("CLI args: {:?}", cli);
    }

    match execute(&cli).await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(
                "❌ Command failed: {} (Category: {:?}, Severity: {:?})",
                e,
                e.category(),
                e.severity()
            );
            tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());

            // 根據錯誤嚴重程度決定退出碼
            let exit_code = match e.severity() {
                ErrorSeverity::Low => 0,
                ErrorSeverity::Medium => 2,
                ErrorSeverity::High => 1,
                ErrorSeverity::Critical => 3,
            };
            if exit_code > 0 {
                std::process::exit(exit_code);
            }
        }
    }
}

fn load_config(cli: &Cli) -> Result<MigrationConfig> {
    let config = MigrationConfig::from_file(&cli.config)?;
    config.validate()?;
    Ok(config)
}

fn connector_for(config: &MigrationConfig, side: Side) -> Result<Box<dyn Connector>> {
    match side {
        Side::Source => create_connector(&config.source),
        Side::Destination => create_connector(&config.destination),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// 回傳退出碼；錯誤交給 main 依嚴重程度處理
async fn execute(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Command::Validate => {
            let config = load_config(cli)?;
            println!(
                "✅ Configuration is valid: {} mapping(s), {} -> {}",
                config.mappings.len(),
                config.source.db_type(),
                config.destination.db_type()
            );
            Ok(0)
        }
        Command::Test { side } => {
            let config = load_config(cli)?;
            let sides = match side {
                Some(side) => vec![*side],
                None => vec![Side::Source, Side::Destination],
            };

            let mut failed = false;
            for side in sides {
                let connector = connector_for(&config, side)?;
                let result = connector.test_connection().await;
                if result.success {
                    println!("✅ {}: {}", side.label(), result.message);
                } else {
                    failed = true;
                    println!("❌ {}: {}", side.label(), result.message);
                }
                connector.close().await?;
            }
            Ok(if failed { 1 } else { 0 })
        }
        Command::Discover { side } => {
            let config = load_config(cli)?;
            let connector = connector_for(&config, *side)?;
            let result = connector.discover().await;
            connector.close().await?;
            print_json(&result?)?;
            Ok(0)
        }
        Command::Schema { name, side } => {
            let config = load_config(cli)?;
            let connector = connector_for(&config, *side)?;
            let result = connector.get_schema(name).await;
            connector.close().await?;
            print_json(&result?)?;
            Ok(0)
        }
        Command::Preview { name, limit } => {
            let config = load_config(cli)?;
            let connector = connector_for(&config, Side::Source)?;
            let result = preview_records(connector.as_ref(), name, *limit).await;
            connector.close().await?;
            for record in result? {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(0)
        }
        Command::Migrate {
            dry_run,
            batch_size,
            poll_interval_ms,
        } => {
            let mut config = MigrationConfig::from_file(&cli.config)?;
            if *dry_run {
                config.settings.dry_run = true;
            }
            if let Some(batch_size) = batch_size {
                config.settings.batch_size = *batch_size;
            }
            migrate(config, *poll_interval_ms).await
        }
    }
}

async fn migrate(config: MigrationConfig, poll_interval_ms: u64) -> Result<i32> {
    let tracker = Arc::new(JobTracker::new());
    let started = start_migration(tracker.clone(), config);
    let job_id = started.job_id.clone();
    println!("🚀 Started job {}", job_id);

    let mut task = started.task;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(poll_interval_ms.max(50)));
    let mut interrupted = false;

    let outcome = loop {
        tokio::select! {
            result = &mut task => break result,
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                tracing::warn!("🛑 Interrupt received, cancelling migration");
                started.cancel.cancel();
            }
            _ = ticker.tick() => {
                if let Some(job) = tracker.get_job(&job_id) {
                    let total = job
                        .total_records
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "?".to_string());
                    println!(
                        "📊 {:>5.1}% {}/{} {}",
                        job.progress,
                        job.processed_records,
                        total,
                        job.current_mapping.as_deref().unwrap_or("")
                    );
                }
            }
        }
    };

    let status = outcome.map_err(|e| EtlError::ProcessingError {
        message: format!("Migration task aborted: {}", e),
    })??;

    for error in &status.errors {
        let location = match (&error.mapping, error.record_index) {
            (Some(mapping), Some(index)) => format!(" [{} #{}]", mapping, index),
            (Some(mapping), None) => format!(" [{}]", mapping),
            _ => String::new(),
        };
        eprintln!("⚠️ {}{}", error.message, location);
    }
    println!(
        "✅ Migration completed: {} records processed, {} error(s)",
        status.processed_records,
        status.errors.len()
    );

    Ok(if status.errors.is_empty() { 0 } else { 2 })
}
