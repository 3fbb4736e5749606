//! Fetches model checkpoints from the Hugging Face hub into the local
//! directories the registry loads at startup. Checkpoints that only ship
//! PyTorch weights must be exported to TorchScript before they can be loaded.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use hf_hub::api::tokio::Api;
use tokio::fs;
use tracing::{info, warn};

use crate::error::ServiceError;

/// Checkpoint files fetched when a repository has them. Exported TorchScript
/// modules are included for repositories that publish them.
pub const DEFAULT_FILES: &[&str] = &[
    "config.json",
    "generation_config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "vocab.json",
    "source.spm",
    "target.spm",
    "spiece.model",
    "tokenizer.model",
    "model.safetensors",
    "pytorch_model.bin",
    "model.pt",
    "encoder.pt",
    "decoder.pt",
];

/// A hub repository and the local directory it is saved to, written `DIR=REPO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    pub directory: PathBuf,
    pub repo_id: String,
}

impl FromStr for DownloadTarget {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (directory, repo_id) = raw
            .split_once('=')
            .filter(|(dir, repo)| !dir.trim().is_empty() && !repo.trim().is_empty())
            .ok_or_else(|| ServiceError::BadRequest(format!("expected DIR=REPO, got `{raw}`")))?;
        Ok(Self {
            directory: PathBuf::from(directory.trim()),
            repo_id: repo_id.trim().to_string(),
        })
    }
}

impl fmt::Display for DownloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.directory.display(), self.repo_id)
    }
}

pub fn default_targets() -> Vec<DownloadTarget> {
    [
        ("local_model_en_ar", "Helsinki-NLP/opus-mt-en-ar"),
        ("local_model_ar_en", "Helsinki-NLP/opus-mt-ar-en"),
        ("local_model_paraphrase", "tuner007/pegasus_paraphrase"),
        ("local_gemma_model", "google/gemma-3-1b-it"),
    ]
    .into_iter()
    .map(|(directory, repo_id)| DownloadTarget {
        directory: PathBuf::from(directory),
        repo_id: repo_id.to_string(),
    })
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The directory already existed and was left alone.
    Skipped,
    Downloaded { files: usize },
    Failed(String),
}

/// Downloads every target whose directory does not exist yet. A failing
/// target is reported and does not stop the others.
pub async fn download_all(
    targets: &[DownloadTarget],
    files: &[String],
) -> Vec<(DownloadTarget, DownloadOutcome)> {
    let mut api: Option<Api> = None;
    let mut report = Vec::with_capacity(targets.len());

    for target in targets {
        if target.directory.exists() {
            info!(directory = %target.directory.display(), "directory already exists, skipping download");
            report.push((target.clone(), DownloadOutcome::Skipped));
            continue;
        }

        let outcome = match api_handle(&mut api) {
            Ok(api) => match download_target(api, target, files).await {
                Ok(count) => {
                    info!(repo = %target.repo_id, files = count, "download complete");
                    DownloadOutcome::Downloaded { files: count }
                }
                Err(err) => {
                    warn!(repo = %target.repo_id, %err, "download failed");
                    discard_partial(&target.directory).await;
                    DownloadOutcome::Failed(err.to_string())
                }
            },
            Err(err) => DownloadOutcome::Failed(err.to_string()),
        };
        report.push((target.clone(), outcome));
    }

    report
}

fn api_handle(slot: &mut Option<Api>) -> Result<&Api, ServiceError> {
    if slot.is_none() {
        let api = Api::new().map_err(|e| ServiceError::Other(format!("hub client: {e}")))?;
        *slot = Some(api);
    }
    slot.as_ref()
        .ok_or_else(|| ServiceError::Other("hub client unavailable".into()))
}

async fn download_target(
    api: &Api,
    target: &DownloadTarget,
    files: &[String],
) -> Result<usize, ServiceError> {
    info!(repo = %target.repo_id, directory = %target.directory.display(), "downloading model");
    fs::create_dir_all(&target.directory).await?;

    let repo = api.model(target.repo_id.clone());
    let listing = repo
        .info()
        .await
        .map_err(|e| ServiceError::Other(format!("{}: {e}", target.repo_id)))?;
    let available: Vec<String> = listing.siblings.into_iter().map(|s| s.rfilename).collect();
    let wanted = select_files(files, &available);
    if wanted.is_empty() {
        return Err(ServiceError::Other(format!(
            "{} has none of the requested files",
            target.repo_id
        )));
    }

    for file in &wanted {
        let cached = repo
            .get(file)
            .await
            .map_err(|e| ServiceError::Other(format!("{}/{file}: {e}", target.repo_id)))?;
        fs::copy(&cached, target.directory.join(file)).await?;
    }
    Ok(wanted.len())
}

/// Requested files the repository actually contains, in request order.
fn select_files<'a>(requested: &'a [String], available: &[String]) -> Vec<&'a str> {
    requested
        .iter()
        .filter(|file| available.contains(file))
        .map(String::as_str)
        .collect()
}

/// Removes a directory created by a failed download so the next run retries it.
async fn discard_partial(directory: &Path) {
    if let Err(err) = fs::remove_dir_all(directory).await {
        warn!(directory = %directory.display(), %err, "could not remove partial download");
    }
}
