//! `ledger-reconcile`: one reconciliation run against PostgreSQL.
//!
//! Prints the report as JSON on stdout. Exit status is 0 when the ledger
//! reconciles, 1 when any discrepancy was found and 2 when the run itself
//! failed.

use clinic_ledger::config::LedgerConfig;
use clinic_ledger::services::init_metrics;
use clinic_ledger::Application;
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::process::ExitCode;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, abandoning reconciliation run");
}

/// Returns whether the ledger reconciled.
async fn run(config: LedgerConfig) -> Result<bool, AppError> {
    let app = Application::build(config).await?;
    let report = app.run_reconciliation().await?;

    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to encode report: {}", e)))?;
    println!("{}", json);

    Ok(report.passed())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match LedgerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::from(2);
        }
    };

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
        config.common.json_logs,
    );
    init_metrics();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.common.environment,
        db_max_connections = config.database.max_connections,
        db_min_connections = config.database.min_connections,
        "Starting ledger reconciliation"
    );

    tokio::select! {
        result = run(config) => match result {
            Ok(true) => {
                tracing::info!("Ledger reconciled");
                ExitCode::SUCCESS
            }
            Ok(false) => {
                tracing::error!("Ledger has discrepancies");
                ExitCode::from(1)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    error_type = e.error_type(),
                    retryable = e.is_retryable(),
                    "Reconciliation run failed"
                );
                ExitCode::from(2)
            }
        },
        _ = shutdown_signal() => ExitCode::from(2),
    }
}
