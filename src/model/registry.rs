use std::{collections::BTreeMap, sync::Arc};

use serde::Serialize;
use tracing::{error, info};

use crate::{
    config::{AppConfig, ModelSource, PipelineKind},
    error::ServiceError,
    model::{ModelKey, ModelMetadata, RemoteGenerator, TextGenerator},
};

#[cfg(feature = "tch-backend")]
use crate::model::loader::{Architecture, TorchModel};

/// Loaded models by task slot. Built once at startup and read-only afterwards.
pub struct ModelRegistry {
    entries: BTreeMap<ModelKey, Arc<dyn TextGenerator>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredModel {
    pub key: ModelKey,
    #[serde(flatten)]
    pub model: ModelMetadata,
}

impl ModelRegistry {
    pub async fn load_all(config: &AppConfig) -> Result<Self, ServiceError> {
        let local = local_plan(config);
        ensure_local_sources(&local)?;

        let mut entries: Vec<(ModelKey, Arc<dyn TextGenerator>)> = Vec::new();
        if config.pipeline == PipelineKind::Remote {
            info!(endpoint = %config.remote_endpoint, model = %config.remote_model, "using remote inference endpoint");
            entries.push((
                ModelKey::Instruct,
                Arc::new(RemoteGenerator::new(
                    config.remote_endpoint.clone(),
                    config.remote_model.clone(),
                )),
            ));
        }
        for (key, source) in local {
            info!(%key, %source, "loading model");
            entries.push((key, load_local(key, source, config).await?));
        }

        let registry = Self::from_entries(entries)?;
        info!(count = registry.len(), "all models loaded");
        Ok(registry)
    }

    /// Builds a registry from already constructed generators. At least one is required.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (ModelKey, Arc<dyn TextGenerator>)>,
    ) -> Result<Self, ServiceError> {
        let entries: BTreeMap<_, _> = entries.into_iter().collect();
        if entries.is_empty() {
            return Err(ServiceError::Config("no models configured".into()));
        }
        Ok(Self { entries })
    }

    pub fn lookup(&self, key: ModelKey) -> Result<Arc<dyn TextGenerator>, ServiceError> {
        self.entries
            .get(&key)
            .cloned()
            .ok_or(ServiceError::ModelUnavailable(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn metadata(&self) -> Vec<RegisteredModel> {
        self.entries
            .iter()
            .map(|(key, model)| RegisteredModel {
                key: *key,
                model: model.metadata(),
            })
            .collect()
    }
}

/// Locally executed models the configured pipeline needs.
fn local_plan(config: &AppConfig) -> Vec<(ModelKey, &ModelSource)> {
    match config.pipeline {
        PipelineKind::Seq2Seq => vec![
            (ModelKey::TranslateEnAr, &config.translate_en_ar),
            (ModelKey::TranslateArEn, &config.translate_ar_en),
            (ModelKey::RephraseEn, &config.rephrase_en),
        ],
        PipelineKind::Instruct => vec![(ModelKey::Instruct, &config.instruct_model)],
        PipelineKind::Remote => Vec::new(),
    }
}

/// Every local directory must exist before anything is loaded.
fn ensure_local_sources(plan: &[(ModelKey, &ModelSource)]) -> Result<(), ServiceError> {
    for (key, source) in plan {
        if let ModelSource::Local(path) = source {
            if !path.is_dir() {
                error!(%key, path = %path.display(), "model directory not found, run download_models first");
                return Err(ServiceError::ModelMissing(path.clone()));
            }
        }
    }
    Ok(())
}

#[cfg(feature = "tch-backend")]
async fn load_local(
    key: ModelKey,
    source: &ModelSource,
    config: &AppConfig,
) -> Result<Arc<dyn TextGenerator>, ServiceError> {
    let architecture = match key {
        ModelKey::Instruct => Architecture::CausalChat,
        ModelKey::TranslateEnAr | ModelKey::TranslateArEn | ModelKey::RephraseEn => {
            Architecture::EncoderDecoder
        }
    };
    let model = match source {
        ModelSource::Local(path) => {
            let path = path.clone();
            let device = config.device;
            tokio::task::spawn_blocking(move || {
                TorchModel::load(key.as_str(), &path, device, architecture)
            })
            .await
            .map_err(|err| ServiceError::Other(format!("model load task failed: {err}")))??
        }
        ModelSource::Hub(repo) => {
            TorchModel::from_hub(key.as_str(), repo, config.device, architecture).await?
        }
    };
    Ok(Arc::new(model))
}

#[cfg(not(feature = "tch-backend"))]
async fn load_local(
    key: ModelKey,
    source: &ModelSource,
    _config: &AppConfig,
) -> Result<Arc<dyn TextGenerator>, ServiceError> {
    Err(ServiceError::Config(format!(
        "cannot load {key} from {source}: local models need the `tch-backend` feature"
    )))
}
