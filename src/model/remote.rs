//! Generator backed by a remote inference endpoint speaking the Ollama
//! `/api/generate` protocol (newline-delimited JSON chunks).

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::ServiceError,
    model::{DecodeParams, FragmentSender, ModelMetadata, TextGenerator},
};

pub struct RemoteGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Serialize)]
struct UpstreamRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: UpstreamOptions,
}

#[derive(Serialize)]
struct UpstreamOptions {
    num_predict: usize,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

impl From<&DecodeParams> for UpstreamOptions {
    fn from(params: &DecodeParams) -> Self {
        match params.sampling {
            Some(sampling) => Self {
                num_predict: params.max_new_tokens,
                temperature: sampling.temperature,
                top_k: Some(sampling.top_k),
                top_p: Some(sampling.top_p),
            },
            None => Self {
                num_predict: params.max_new_tokens,
                temperature: 0.0,
                top_k: None,
                top_p: None,
            },
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct UpstreamChunk {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Decodes one NDJSON line of the upstream body.
pub fn decode_chunk(line: &[u8]) -> Result<UpstreamChunk, ServiceError> {
    let chunk: UpstreamChunk = serde_json::from_slice(line)
        .map_err(|err| ServiceError::Upstream(format!("malformed chunk: {err}")))?;
    if let Some(message) = chunk.error {
        return Err(ServiceError::Upstream(message));
    }
    Ok(chunk)
}

/// Returns `true` once the chunk that ends the generation has been seen.
fn handle_line(
    line: &[u8],
    on_fragment: &mut impl FnMut(String),
) -> Result<bool, ServiceError> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(false);
    }
    let chunk = decode_chunk(line)?;
    if let Some(text) = chunk.response {
        if !text.is_empty() {
            on_fragment(text);
        }
    }
    Ok(chunk.done)
}

impl RemoteGenerator {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
        }
    }

    async fn stream_chunks(
        &self,
        prompt: &str,
        params: &DecodeParams,
        mut on_fragment: impl FnMut(String) + Send,
    ) -> Result<(), ServiceError> {
        let body = UpstreamRequest {
            model: &self.model,
            prompt,
            stream: true,
            options: params.into(),
        };
        debug!(endpoint = %self.endpoint, model = %self.model, "calling inference endpoint");

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ServiceError::Upstream(format!("{status}: {detail}")));
        }

        let mut body = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        while let Some(bytes) = body.next().await {
            pending.extend_from_slice(&bytes?);
            while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                if handle_line(&line[..newline], &mut on_fragment)? {
                    return Ok(());
                }
            }
        }
        handle_line(&pending, &mut on_fragment)?;
        Ok(())
    }
}

#[async_trait]
impl TextGenerator for RemoteGenerator {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            name: self.model.clone(),
            backend: "remote",
            source: self.endpoint.clone(),
        }
    }

    async fn generate(&self, input: &str, params: &DecodeParams) -> Result<String, ServiceError> {
        let mut output = String::new();
        self.stream_chunks(input, params, |fragment| output.push_str(&fragment))
            .await?;
        Ok(output)
    }

    async fn generate_stream(
        &self,
        input: &str,
        params: &DecodeParams,
        fragments: FragmentSender,
    ) -> Result<(), ServiceError> {
        self.stream_chunks(input, params, |fragment| {
            let _ = fragments.send(fragment);
        })
        .await
    }
}
