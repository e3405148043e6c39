//! Deduplicate a stream of JSON records against a durable membership table.
use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dedup_common::gate::DedupGate;
use dedup_common::memstore::MemoryMembershipStore;
use dedup_common::metrics::{serve, setup_metrics_router};
use dedup_common::pgstore::PgMembershipStore;
use dedup_common::store::MembershipStore;
use dedup_filter::config::{Backend, Config};
use dedup_filter::filter::run_filter;
use dedup_filter::reader::RecordReader;
use dedup_filter::writer::RecordWriter;

async fn connect(config: &Config) -> Result<Arc<dyn MembershipStore>> {
    let store: Arc<dyn MembershipStore> = match config.backend {
        Backend::Postgres => Arc::new(
            PgMembershipStore::new(
                &config.compartment,
                &config.table_name,
                &config.database_url,
                config.pg_options(),
            )
            .await
            .context("failed to initialize membership store")?,
        ),
        Backend::Memory => Arc::new(MemoryMembershipStore::new()),
    };

    Ok(store)
}

fn start_metrics_server(bind: String) -> Result<()> {
    let router = setup_metrics_router().context("failed to install metrics recorder")?;

    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to start serving metrics on {}: {}", bind, e);
        }
    });

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let store = connect(&config).await?;

    if config.create_table {
        let request = config.provision_request();
        store
            .provision(&request)
            .await
            .with_context(|| format!("failed to create table {}", request.table))?;
        info!(
            table = %request.table,
            compartment = %request.compartment,
            "created membership table"
        );
        return Ok(());
    }

    if let Some(bind) = config.metrics_bind.clone() {
        start_metrics_server(bind)?;
    }

    let gate = DedupGate::new(config.key_deriver(), store, config.claim_mode);
    let reader = RecordReader::new(io::stdin().lock(), config.input_format);
    // Stdout is line buffered on its own, which would flush every record regardless of policy.
    let stdout = io::BufWriter::new(io::stdout().lock());
    let mut writer = RecordWriter::new(stdout, config.flush_policy());
    if config.verbose {
        writer = writer.with_mirror(Box::new(io::stderr()));
    }

    let report = run_filter(reader, &gate, &mut writer, config.strict).await?;

    info!(
        read = report.read,
        forwarded = report.forwarded,
        duplicates = report.duplicates,
        skipped = report.skipped,
        failed = report.failed,
        decode_errors = report.decode_errors,
        "input exhausted"
    );

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    // Diagnostics go to stderr; stdout carries only forwarded records.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
