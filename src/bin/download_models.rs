use clap::Parser;
use tracing_subscriber::EnvFilter;

use lingua_stream_service::download::{
    DEFAULT_FILES, DownloadOutcome, DownloadTarget, default_targets, download_all,
};

/// Download base models from the Hugging Face hub into local directories.
#[derive(Debug, Parser)]
#[command(name = "download_models", version)]
struct Args {
    /// Model to fetch, as DIR=REPO. Repeatable; defaults to the translation, paraphrase and instruct models.
    #[arg(long = "target", value_name = "DIR=REPO")]
    targets: Vec<DownloadTarget>,

    /// File to fetch from every repository that publishes it. Repeatable.
    #[arg(long = "file", value_name = "NAME")]
    files: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let targets = if args.targets.is_empty() {
        default_targets()
    } else {
        args.targets
    };
    let files = if args.files.is_empty() {
        DEFAULT_FILES.iter().map(|f| f.to_string()).collect()
    } else {
        args.files
    };

    let report = download_all(&targets, &files).await;
    let failed = report
        .iter()
        .filter(|(_, outcome)| matches!(outcome, DownloadOutcome::Failed(_)))
        .count();
    tracing::info!(attempted = report.len(), failed, "all model downloads attempted");

    Ok(())
}
