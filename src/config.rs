use std::{
    env, fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use serde::Serialize;

#[cfg(feature = "tch-backend")]
use tch::Device;

use crate::{error::ServiceError, language::DetectionPolicy};

/// Which model layout the server is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    /// Dedicated translation models per direction plus an English paraphraser.
    Seq2Seq,
    /// One local fine-tuned instruction model for every task.
    Instruct,
    /// One instruction model served by a remote inference endpoint.
    Remote,
}

impl FromStr for PipelineKind {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "seq2seq" => Ok(PipelineKind::Seq2Seq),
            "instruct" => Ok(PipelineKind::Instruct),
            "remote" => Ok(PipelineKind::Remote),
            other => Err(ServiceError::Config(format!("unknown pipeline `{other}`"))),
        }
    }
}

/// Where a model's artifacts come from: a local directory or a hub repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    Hub(String),
}

impl ModelSource {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix("hub:") {
            Some(repo) => ModelSource::Hub(repo.to_string()),
            None => ModelSource::Local(PathBuf::from(raw)),
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Local(path) => write!(f, "{}", path.display()),
            ModelSource::Hub(repo) => write!(f, "hub:{repo}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub pipeline: PipelineKind,
    pub detection_policy: DetectionPolicy,
    pub translate_en_ar: ModelSource,
    pub translate_ar_en: ModelSource,
    pub rephrase_en: ModelSource,
    pub instruct_model: ModelSource,
    pub remote_endpoint: String,
    pub remote_model: String,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub char_delay: Duration,
    pub strip_diacritics: bool,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            pipeline: PipelineKind::Remote,
            detection_policy: DetectionPolicy::default(),
            translate_en_ar: ModelSource::parse("./local_model_en_ar"),
            translate_ar_en: ModelSource::parse("./local_model_ar_en"),
            rephrase_en: ModelSource::parse("./local_model_paraphrase"),
            instruct_model: ModelSource::parse("./local_gemma_finetuned"),
            remote_endpoint: "http://localhost:11434/api/generate".to_string(),
            remote_model: "gemma3:1b".to_string(),
            max_new_tokens: 256,
            temperature: 0.2,
            char_delay: Duration::from_millis(10),
            strip_diacritics: true,
            #[cfg(feature = "tch-backend")]
            device: Device::Cpu,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = env::var("SERVER_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.listen_addr);

        let pipeline = match env::var("PIPELINE") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.pipeline,
        };
        let detection_policy = match env::var("DETECTION_POLICY") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.detection_policy,
        };

        let source = |key: &str, fallback: ModelSource| {
            env::var(key)
                .map(|v| ModelSource::parse(&v))
                .unwrap_or(fallback)
        };
        let translate_en_ar = source("TRANSLATE_EN_AR_MODEL", defaults.translate_en_ar);
        let translate_ar_en = source("TRANSLATE_AR_EN_MODEL", defaults.translate_ar_en);
        let rephrase_en = source("REPHRASE_EN_MODEL", defaults.rephrase_en);
        let instruct_model = source("INSTRUCT_MODEL", defaults.instruct_model);

        let remote_endpoint = env::var("REMOTE_ENDPOINT").unwrap_or(defaults.remote_endpoint);
        let remote_model = env::var("REMOTE_MODEL").unwrap_or(defaults.remote_model);

        let max_new_tokens = env::var("MAX_NEW_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_new_tokens);
        let temperature = env::var("TEMPERATURE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.temperature);
        let char_delay = env::var("CHAR_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.char_delay);
        let strip_diacritics = env::var("STRIP_DIACRITICS")
            .ok()
            .and_then(|v| parse_flag(&v))
            .unwrap_or(defaults.strip_diacritics);

        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = env::var("DEVICE").unwrap_or_else(|_| "cpu".into());
            parse_device(&raw)
        };

        Ok(Self {
            listen_addr,
            pipeline,
            detection_policy,
            translate_en_ar,
            translate_ar_en,
            rephrase_en,
            instruct_model,
            remote_endpoint,
            remote_model,
            max_new_tokens,
            temperature,
            char_delay,
            strip_diacritics,
            #[cfg(feature = "tch-backend")]
            device,
        })
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}
