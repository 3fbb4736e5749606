use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tch::{CModule, Device, IValue, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;
use tokio::task;
use tracing::info;

use crate::{
    error::ServiceError,
    model::{
        DecodeParams, FragmentSender, ModelMetadata, Sampling, TextGenerator,
        backend::unsent_suffix,
    },
    prompt,
};

const CAUSAL_MODULE: &str = "model.pt";
const ENCODER_MODULE: &str = "encoder.pt";
const DECODER_MODULE: &str = "decoder.pt";
const TOKENIZER_FILE: &str = "tokenizer.json";
const CONFIG_FILE: &str = "config.json";
const STOP_TOKENS: &[&str] = &["</s>", "<eos>", "<end_of_turn>", "<|endoftext|>"];

/// The TorchScript export layout a model directory follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// `model.pt` traced as `input_ids [1, seq] -> logits [1, seq, vocab]`.
    /// Input is wrapped in a chat turn before tokenization.
    CausalChat,
    /// Translation and paraphrase models (Marian, Pegasus).
    ///
    /// `encoder.pt`: `(input_ids [1, src], attention_mask [1, src]) -> hidden [1, src, d]`.
    /// `decoder.pt`: `(decoder_input_ids [1, tgt], hidden, attention_mask) -> logits [1, tgt, vocab]`.
    /// `config.json` supplies `decoder_start_token_id` (or `pad_token_id`) and `eos_token_id`.
    EncoderDecoder,
}

impl Architecture {
    /// Files a model directory must contain.
    pub fn artifacts(self) -> &'static [&'static str] {
        match self {
            Architecture::CausalChat => &[TOKENIZER_FILE, CAUSAL_MODULE],
            Architecture::EncoderDecoder => {
                &[TOKENIZER_FILE, CONFIG_FILE, ENCODER_MODULE, DECODER_MODULE]
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerationConfig {
    decoder_start_token_id: Option<i64>,
    pad_token_id: Option<i64>,
    eos_token_id: Option<i64>,
}

enum Modules {
    Causal(CModule),
    EncoderDecoder {
        encoder: CModule,
        decoder: CModule,
        decoder_start: i64,
    },
}

/// Decode state for one request.
enum Session<'m> {
    Causal {
        module: &'m CModule,
        ids: Vec<i64>,
    },
    EncoderDecoder {
        decoder: &'m CModule,
        hidden: Tensor,
        attention_mask: Tensor,
        ids: Vec<i64>,
    },
}

pub struct TorchModel {
    inner: Arc<TorchModelInner>,
}

struct TorchModelInner {
    name: String,
    source: String,
    device: Device,
    architecture: Architecture,
    stop_ids: Vec<i64>,
    tokenizer: Tokenizer,
    modules: Mutex<Modules>,
}

impl TorchModel {
    pub fn load(
        name: &str,
        directory: &Path,
        device: Device,
        architecture: Architecture,
    ) -> Result<Self, ServiceError> {
        if !directory.is_dir() {
            return Err(ServiceError::ModelMissing(directory.to_path_buf()));
        }
        for artifact in architecture.artifacts() {
            let path = directory.join(artifact);
            if !path.exists() {
                return Err(ServiceError::Other(format!(
                    "model artifact missing: {} (export the checkpoint to TorchScript first)",
                    path.display()
                )));
            }
        }

        let tokenizer = Tokenizer::from_file(directory.join(TOKENIZER_FILE))
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let mut stop_ids: Vec<i64> = STOP_TOKENS
            .iter()
            .filter_map(|token| tokenizer.token_to_id(token))
            .map(i64::from)
            .collect();

        let modules = match architecture {
            Architecture::CausalChat => {
                Modules::Causal(load_module(&directory.join(CAUSAL_MODULE), device)?)
            }
            Architecture::EncoderDecoder => {
                let config = read_generation_config(&directory.join(CONFIG_FILE))?;
                let decoder_start = config
                    .decoder_start_token_id
                    .or(config.pad_token_id)
                    .ok_or_else(|| {
                        ServiceError::Config(format!(
                            "{}: no decoder_start_token_id or pad_token_id",
                            directory.display()
                        ))
                    })?;
                if let Some(eos) = config.eos_token_id {
                    if !stop_ids.contains(&eos) {
                        stop_ids.push(eos);
                    }
                }
                Modules::EncoderDecoder {
                    encoder: load_module(&directory.join(ENCODER_MODULE), device)?,
                    decoder: load_module(&directory.join(DECODER_MODULE), device)?,
                    decoder_start,
                }
            }
        };
        info!(model = name, path = %directory.display(), ?architecture, "loaded TorchScript model");

        Ok(Self {
            inner: Arc::new(TorchModelInner {
                name: name.to_string(),
                source: directory.display().to_string(),
                device,
                architecture,
                stop_ids,
                tokenizer,
                modules: Mutex::new(modules),
            }),
        })
    }

    /// Fetches the exported artifacts of `repo_id` into the hub cache, then loads them.
    pub async fn from_hub(
        name: &str,
        repo_id: &str,
        device: Device,
        architecture: Architecture,
    ) -> Result<Self, ServiceError> {
        let hub_error = |e: hf_hub::api::tokio::ApiError| {
            ServiceError::Other(format!("hub download of {repo_id} failed: {e}"))
        };
        let api = hf_hub::api::tokio::Api::new().map_err(hub_error)?;
        let repo = api.model(repo_id.to_string());
        let mut snapshot: Option<PathBuf> = None;
        for artifact in architecture.artifacts() {
            let cached = repo.get(artifact).await.map_err(hub_error)?;
            snapshot = cached.parent().map(Path::to_path_buf);
        }
        let snapshot = snapshot
            .ok_or_else(|| ServiceError::Other(format!("unexpected cache layout for {repo_id}")))?;

        let name = name.to_string();
        let mut model =
            task::spawn_blocking(move || TorchModel::load(&name, &snapshot, device, architecture))
                .await
                .map_err(|err| ServiceError::Other(format!("model load task failed: {err}")))??;
        if let Some(inner) = Arc::get_mut(&mut model.inner) {
            inner.source = format!("hub:{repo_id}");
        }
        Ok(model)
    }
}

fn load_module(path: &Path, device: Device) -> Result<CModule, ServiceError> {
    let mut module = CModule::load_on_device(path, device)
        .map_err(|e| ServiceError::Inference(format!("{}: {e}", path.display())))?;
    module.set_eval();
    Ok(module)
}

fn read_generation_config(path: &Path) -> Result<GenerationConfig, ServiceError> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| ServiceError::Config(format!("{}: {e}", path.display())))
}

/// First tensor of a module output, which is either a tensor or a tuple led by one.
fn first_tensor(output: IValue) -> Result<Tensor, ServiceError> {
    match output {
        IValue::Tensor(t) => Ok(t),
        IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
            IValue::Tensor(t) => Ok(t.shallow_clone()),
            _ => Err(ServiceError::Inference(
                "expected tensor as first tuple element".into(),
            )),
        },
        _ => Err(ServiceError::Inference(
            "unexpected model output format".into(),
        )),
    }
}

fn id_tensor(ids: &[i64], device: Device) -> Tensor {
    Tensor::from_slice(ids)
        .reshape([1, ids.len() as i64])
        .to(device)
}

impl Modules {
    fn start(&self, prompt_ids: Vec<i64>, device: Device) -> Result<Session<'_>, ServiceError> {
        match self {
            Modules::Causal(module) => Ok(Session::Causal {
                module,
                ids: prompt_ids,
            }),
            Modules::EncoderDecoder {
                encoder,
                decoder,
                decoder_start,
            } => {
                let input_ids = id_tensor(&prompt_ids, device);
                let attention_mask = input_ids.ones_like();
                let hidden = first_tensor(
                    encoder
                        .forward_is(&[
                            IValue::Tensor(input_ids),
                            IValue::Tensor(attention_mask.shallow_clone()),
                        ])
                        .map_err(|e| ServiceError::Inference(e.to_string()))?,
                )?;
                Ok(Session::EncoderDecoder {
                    decoder,
                    hidden,
                    attention_mask,
                    ids: vec![*decoder_start],
                })
            }
        }
    }
}

impl Session<'_> {
    /// Logits `[vocab]` for the next position.
    fn next_logits(&self, device: Device) -> Result<Tensor, ServiceError> {
        let output = match self {
            Session::Causal { module, ids } => {
                module.forward_is(&[IValue::Tensor(id_tensor(ids, device))])
            }
            Session::EncoderDecoder {
                decoder,
                hidden,
                attention_mask,
                ids,
            } => decoder.forward_is(&[
                IValue::Tensor(id_tensor(ids, device)),
                IValue::Tensor(hidden.shallow_clone()),
                IValue::Tensor(attention_mask.shallow_clone()),
            ]),
        }
        .map_err(|e| ServiceError::Inference(e.to_string()))?;

        Ok(first_tensor(output)?.select(1, -1).squeeze())
    }

    fn push(&mut self, token: i64) {
        match self {
            Session::Causal { ids, .. } | Session::EncoderDecoder { ids, .. } => ids.push(token),
        }
    }
}

impl TorchModelInner {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            name: self.name.clone(),
            backend: "torchscript",
            source: self.source.clone(),
        }
    }

    /// Autoregressive decode. `on_delta` receives each newly decoded piece of text.
    fn decode(
        &self,
        input: &str,
        params: &DecodeParams,
        mut on_delta: impl FnMut(&str),
    ) -> Result<String, ServiceError> {
        let model_input = match self.architecture {
            Architecture::CausalChat => prompt::chat_turn(input),
            Architecture::EncoderDecoder => input.to_string(),
        };
        let encoding = self
            .tokenizer
            .encode(model_input, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let mut prompt_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if prompt_ids.is_empty() {
            prompt_ids.push(0);
        }

        let mut generated: Vec<u32> = Vec::new();
        let mut sent = String::new();

        no_grad(|| {
            let modules = self.modules.lock();
            let mut session = modules.start(prompt_ids, self.device)?;

            for _ in 0..params.max_new_tokens {
                let last_logits = session.next_logits(self.device)?;
                let next_token_id = match params.sampling {
                    Some(sampling) => sample(&last_logits, sampling),
                    None => last_logits.argmax(0, false).int64_value(&[]),
                };
                if self.stop_ids.contains(&next_token_id) {
                    break;
                }
                session.push(next_token_id);
                generated.push(next_token_id as u32);

                let text = self
                    .tokenizer
                    .decode(&generated, true)
                    .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
                // Hold back output that ends inside an incomplete multi-byte sequence.
                if !text.ends_with('\u{FFFD}') {
                    let delta = unsent_suffix(&text, &sent).to_string();
                    if !delta.is_empty() {
                        on_delta(&delta);
                        sent.push_str(&delta);
                    }
                }
            }

            Ok::<(), ServiceError>(())
        })?;

        let completion = self
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let rest = unsent_suffix(&completion, &sent);
        if !rest.is_empty() {
            on_delta(rest);
        }
        Ok(completion)
    }
}

/// Temperature, top-k and nucleus sampling over a `[vocab]` logits vector.
fn sample(logits: &Tensor, sampling: Sampling) -> i64 {
    let temperature = sampling.temperature.max(1e-5);
    let scaled = logits.to_kind(Kind::Float) / temperature;
    let vocab = scaled.size()[0];
    let k = (sampling.top_k as i64).clamp(1, vocab);
    let (values, indices) = scaled.topk(k, -1, true, true);
    let probs = values.softmax(-1, Kind::Float);
    let cumulative = probs.cumsum(-1, Kind::Float);
    let outside_nucleus = (&cumulative - &probs).gt(sampling.top_p);
    let probs = probs.masked_fill(&outside_nucleus, 0.0);
    let choice = probs.multinomial(1, true).int64_value(&[0]);
    indices.int64_value(&[choice])
}

#[async_trait]
impl TextGenerator for TorchModel {
    fn metadata(&self) -> ModelMetadata {
        self.inner.metadata()
    }

    async fn generate(&self, input: &str, params: &DecodeParams) -> Result<String, ServiceError> {
        let inner = self.inner.clone();
        let input = input.to_string();
        let params = *params;
        task::spawn_blocking(move || inner.decode(&input, &params, |_| {}))
            .await
            .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }

    async fn generate_stream(
        &self,
        input: &str,
        params: &DecodeParams,
        fragments: FragmentSender,
    ) -> Result<(), ServiceError> {
        let inner = self.inner.clone();
        let input = input.to_string();
        let params = *params;
        task::spawn_blocking(move || {
            inner.decode(&input, &params, |delta| {
                let _ = fragments.send(delta.to_string());
            })
        })
        .await
        .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
        .map(|_| ())
    }
}
