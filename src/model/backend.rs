use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::ServiceError,
    model::{DecodeParams, ModelMetadata},
};

/// Producer side of an incremental decode; each message is a fragment of output text.
pub type FragmentSender = mpsc::UnboundedSender<String>;

/// A loaded model that turns an input string into generated text.
///
/// Implementations are shared between concurrent requests and must only
/// perform inference through `&self`.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn metadata(&self) -> ModelMetadata;

    /// Produces the complete output in one call.
    async fn generate(&self, input: &str, params: &DecodeParams) -> Result<String, ServiceError>;

    /// Pushes output fragments into `fragments` as they are produced and
    /// returns once generation is over. Dropping the sender closes the stream.
    ///
    /// Backends without native incremental output send the whole text once.
    async fn generate_stream(
        &self,
        input: &str,
        params: &DecodeParams,
        fragments: FragmentSender,
    ) -> Result<(), ServiceError> {
        let text = self.generate(input, params).await?;
        if !text.is_empty() {
            let _ = fragments.send(text);
        }
        Ok(())
    }
}

/// Part of a fresh re-decode of the generated ids that has not been
/// forwarded yet. `sent` is everything forwarded so far.
///
/// Re-decoding can rewrite earlier text (merged pieces, cleanup of spaces).
/// When `text` no longer starts with `sent`, the split falls back to
/// character counts so it always lands on a char boundary.
#[cfg_attr(not(feature = "tch-backend"), allow(dead_code))]
pub(crate) fn unsent_suffix<'a>(text: &'a str, sent: &str) -> &'a str {
    if let Some(rest) = text.strip_prefix(sent) {
        return rest;
    }
    tracing::warn!(
        sent_chars = sent.chars().count(),
        decoded_chars = text.chars().count(),
        "re-decoded text diverged from streamed output"
    );
    let skip = sent.chars().count();
    text.char_indices()
        .nth(skip)
        .map_or("", |(offset, _)| &text[offset..])
}
