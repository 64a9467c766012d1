use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use cfdi_engine::cli::{Cli, Config, VerbosityLevel};
use cfdi_engine::engine::{EngineConfig, IngestOutcome, IngestionEngine};
use cfdi_engine::file_discovery::FileDiscovery;
use cfdi_engine::output::Output;
use cfdi_engine::store::QueryScope;
use cfdi_engine::{HttpStatusClient, StatusClientConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse_args();
    if let Err(message) = cli.validate() {
        anyhow::bail!(message);
    }

    let engine_config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .await
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let config = Config::from_cli(&cli, engine_config);

    let status_provider = match &config.status_url {
        Some(url) => {
            let client_config = StatusClientConfig {
                base_url: url.clone(),
                timeout_seconds: config.engine.status_timeout_secs,
                ..Default::default()
            };
            let client =
                HttpStatusClient::new(client_config).context("building status client")?;
            Some(Arc::new(client) as Arc<dyn cfdi_engine::CertificateStatusProvider>)
        }
        None => None,
    };

    let engine = IngestionEngine::new(config.engine.clone(), status_provider);
    let loaded = engine
        .load_archive()
        .await
        .context("loading durable archive")?;
    if loaded > 0 && !config.quiet {
        eprintln!("Loaded {} archived records", loaded);
    }

    let discovery = FileDiscovery::new()
        .with_extensions(config.extensions.clone())
        .with_include_patterns(config.include_patterns.clone())?
        .with_exclude_patterns(config.exclude_patterns.clone())?;
    let files = discovery.discover_files(&config.path).await?;
    if files.is_empty() {
        anyhow::bail!("No matching files under {}", config.path.display());
    }

    let mut documents = Vec::with_capacity(files.len());
    for file in &files {
        let text = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        documents.push(text);
    }

    let outcomes = engine.ingest_batch(documents).await;
    let results: Vec<(PathBuf, IngestOutcome)> =
        files.into_iter().zip(outcomes.into_iter()).collect();

    let scope = QueryScope::unrestricted();
    let aggregates = engine.aggregate_by_status(&scope);

    let output = Output::new(config.verbosity());
    if config.json {
        println!("{}", serde_json::to_string_pretty(&Output::json_report(&results, &aggregates))?);
    } else {
        if config.verbosity() >= VerbosityLevel::Normal {
            for (path, outcome) in &results {
                println!("{}", output.format_outcome(path, outcome));
            }
            println!();
        }
        let outcomes_only: Vec<IngestOutcome> =
            results.iter().map(|(_, o)| o.clone()).collect();
        print!("{}", output.format_summary(&outcomes_only));
        println!();
        print!("{}", output.format_status_aggregates(&aggregates));

        let orphaned = engine.orphaned_events_total();
        if orphaned > 0 {
            eprintln!("Warning: {} orphaned lifecycle events dropped", orphaned);
        }
    }

    let rejected = results.iter().any(|(_, outcome)| !outcome.is_accepted()
        && !matches!(outcome, IngestOutcome::DuplicateIgnored(_)));
    if rejected {
        std::process::exit(1);
    }
    Ok(())
}
