//! Generation orchestration: turns a request into an ordered sequence of
//! [`StreamEvent`]s ending in exactly one terminal event.

use std::{sync::Arc, time::Duration};

use futures::{StreamExt, stream::BoxStream};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::{
    config::{AppConfig, PipelineKind},
    error::ServiceError,
    language::{DetectionPolicy, Language, detect, remove_diacritics},
    model::{
        DecodeParams, GenerationRequest, ModelKey, ModelRegistry, Sampling, StreamEvent,
        TextGenerator,
    },
    prompt::{Task, build_prompt},
};

const TRANSLATION_MAX_TOKENS: usize = 250;
const TRANSLATION_BEAMS: usize = 5;
const PARAPHRASE_MAX_TOKENS: usize = 100;

const PARAPHRASE_SAMPLING: Sampling = Sampling {
    temperature: 1.5,
    top_k: 120,
    top_p: 0.95,
};
const BACK_TRANSLATION_SAMPLING: Sampling = Sampling {
    temperature: 1.0,
    top_k: 50,
    top_p: 1.0,
};

pub struct Orchestrator {
    registry: Arc<ModelRegistry>,
    pipeline: PipelineKind,
    policy: DetectionPolicy,
    max_new_tokens: usize,
    temperature: f64,
    char_delay: Duration,
    strip_diacritics: bool,
}

/// Write side of one request's event sequence. Consuming `finish` is the
/// only way to emit a terminal event.
struct EventSink {
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl EventSink {
    fn token(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        // A closed channel means the client went away; generation still runs to completion.
        let _ = self.events.send(StreamEvent::Token(text));
    }

    fn finish(self, outcome: Result<(), ServiceError>) {
        let terminal = match outcome {
            Ok(()) => StreamEvent::EndOfStream,
            Err(err) => {
                error!(%err, "error during stream generation");
                StreamEvent::Error
            }
        };
        let _ = self.events.send(terminal);
    }
}

impl Orchestrator {
    pub fn new(config: &AppConfig, registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            pipeline: config.pipeline,
            policy: config.detection_policy,
            max_new_tokens: config.max_new_tokens,
            temperature: config.temperature,
            char_delay: config.char_delay,
            strip_diacritics: config.strip_diacritics,
        }
    }

    pub fn generate(self: &Arc<Self>, request: GenerationRequest) -> BoxStream<'static, StreamEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut sink = EventSink { events: tx };
            let outcome = this.run(&request, &mut sink).await;
            sink.finish(outcome);
        });

        async_stream::stream! {
            let mut terminated = false;
            while let Some(event) = rx.recv().await {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    terminated = true;
                    break;
                }
            }
            if !terminated {
                error!("generation task ended without a terminal event");
                yield StreamEvent::Error;
            }
        }
        .boxed()
    }

    async fn run(
        &self,
        request: &GenerationRequest,
        sink: &mut EventSink,
    ) -> Result<(), ServiceError> {
        let task: Task = request.task.parse()?;
        let source = detect(&request.text, self.policy);
        debug!(%task, %source, pipeline = ?self.pipeline, "dispatching generation");

        match self.pipeline {
            PipelineKind::Seq2Seq => self.run_seq2seq(&request.text, task, source, sink).await,
            PipelineKind::Instruct | PipelineKind::Remote => {
                self.run_instruct(&request.text, task, source, sink).await
            }
        }
    }

    async fn run_seq2seq(
        &self,
        text: &str,
        task: Task,
        source: Language,
        sink: &mut EventSink,
    ) -> Result<(), ServiceError> {
        match (task, source) {
            (Task::Translate, _) => {
                let model = self.registry.lookup(ModelKey::translation_from(source))?;
                let params = DecodeParams::beam(TRANSLATION_MAX_TOKENS, TRANSLATION_BEAMS);
                let output = model.generate(text, &params).await?;
                self.replay(&output, sink).await;
                Ok(())
            }
            (Task::Rephrase, Language::Arabic) => {
                let to_english = self.registry.lookup(ModelKey::TranslateArEn)?;
                let to_arabic = self.registry.lookup(ModelKey::TranslateEnAr)?;
                let output = back_translate(to_english.as_ref(), to_arabic.as_ref(), text).await?;
                self.replay(&output, sink).await;
                Ok(())
            }
            (Task::Rephrase, Language::English) => {
                let model = self.registry.lookup(ModelKey::RephraseEn)?;
                let params = DecodeParams::sampled(PARAPHRASE_MAX_TOKENS, PARAPHRASE_SAMPLING);
                relay(model, text.to_string(), params, false, sink).await
            }
        }
    }

    async fn run_instruct(
        &self,
        text: &str,
        task: Task,
        source: Language,
        sink: &mut EventSink,
    ) -> Result<(), ServiceError> {
        let model = self.registry.lookup(ModelKey::Instruct)?;
        let prompt = build_prompt(text, task, source);
        let output_language = match task {
            Task::Translate => source.counterpart(),
            Task::Rephrase => source,
        };
        let strip = self.strip_diacritics && output_language == Language::Arabic;
        relay(model, prompt, self.instruct_params(), strip, sink).await
    }

    fn instruct_params(&self) -> DecodeParams {
        if self.temperature > 0.0 {
            DecodeParams::sampled(
                self.max_new_tokens,
                Sampling {
                    temperature: self.temperature,
                    top_k: 40,
                    top_p: 0.95,
                },
            )
        } else {
            DecodeParams::beam(self.max_new_tokens, 1)
        }
    }

    /// Re-emits a finished output one character at a time.
    async fn replay(&self, output: &str, sink: &mut EventSink) {
        for ch in output.chars() {
            sink.token(ch.to_string());
            if !self.char_delay.is_zero() {
                tokio::time::sleep(self.char_delay).await;
            }
        }
    }
}

/// Arabic -> English -> Arabic round trip, two full generations.
async fn back_translate(
    to_english: &dyn TextGenerator,
    to_arabic: &dyn TextGenerator,
    text: &str,
) -> Result<String, ServiceError> {
    let english = to_english
        .generate(
            text,
            &DecodeParams {
                max_new_tokens: TRANSLATION_MAX_TOKENS,
                num_beams: TRANSLATION_BEAMS,
                sampling: Some(BACK_TRANSLATION_SAMPLING),
            },
        )
        .await?;
    to_arabic
        .generate(
            &english,
            &DecodeParams::beam(TRANSLATION_MAX_TOKENS, TRANSLATION_BEAMS),
        )
        .await
}

/// Runs an incremental decode on its own task and forwards fragments as they arrive.
async fn relay(
    model: Arc<dyn TextGenerator>,
    input: String,
    params: DecodeParams,
    strip_diacritics: bool,
    sink: &mut EventSink,
) -> Result<(), ServiceError> {
    let (fragments_tx, mut fragments) = mpsc::unbounded_channel::<String>();
    let producer =
        tokio::spawn(async move { model.generate_stream(&input, &params, fragments_tx).await });

    while let Some(fragment) = fragments.recv().await {
        if strip_diacritics {
            sink.token(remove_diacritics(&fragment));
        } else {
            sink.token(fragment);
        }
    }

    producer
        .await
        .map_err(|err| ServiceError::Inference(format!("generation task failed: {err}")))?
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::model::{FragmentSender, ModelMetadata};

    /// Returns fixed fragments, then an optional failure, and records every input.
    struct Scripted {
        fragments: Vec<&'static str>,
        failure: Option<&'static str>,
        calls: AtomicUsize,
        inputs: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(fragments: &[&'static str], failure: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                fragments: fragments.to_vec(),
                failure,
                calls: AtomicUsize::new(0),
                inputs: Mutex::new(Vec::new()),
            })
        }

        fn ok(fragments: &[&'static str]) -> Arc<Self> {
            Self::new(fragments, None)
        }

        fn failing(message: &'static str) -> Arc<Self> {
            Self::new(&[], Some(message))
        }

        /// Streams `fragments`, then fails.
        fn interrupted(fragments: &[&'static str], message: &'static str) -> Arc<Self> {
            Self::new(fragments, Some(message))
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn record(&self, input: &str) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().push(input.to_string());
        }

        fn outcome(&self) -> Result<(), ServiceError> {
            match self.failure {
                Some(message) => Err(ServiceError::Inference(message.to_string())),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        fn metadata(&self) -> ModelMetadata {
            ModelMetadata {
                name: "scripted".into(),
                backend: "test",
                source: "memory".into(),
            }
        }

        async fn generate(&self, input: &str, _: &DecodeParams) -> Result<String, ServiceError> {
            self.record(input);
            self.outcome()?;
            Ok(self.fragments.concat())
        }

        async fn generate_stream(
            &self,
            input: &str,
            _: &DecodeParams,
            fragments: FragmentSender,
        ) -> Result<(), ServiceError> {
            self.record(input);
            for fragment in &self.fragments {
                let _ = fragments.send(fragment.to_string());
            }
            self.outcome()
        }
    }

    fn orchestrator(
        pipeline: PipelineKind,
        policy: DetectionPolicy,
        entries: Vec<(ModelKey, Arc<Scripted>)>,
    ) -> Arc<Orchestrator> {
        let config = AppConfig {
            pipeline,
            detection_policy: policy,
            char_delay: Duration::ZERO,
            ..AppConfig::default()
        };
        let registry = ModelRegistry::from_entries(
            entries
                .into_iter()
                .map(|(key, model)| (key, model as Arc<dyn TextGenerator>)),
        )
        .unwrap();
        Arc::new(Orchestrator::new(&config, Arc::new(registry)))
    }

    async fn collect(orchestrator: &Arc<Orchestrator>, text: &str, task: &str) -> Vec<StreamEvent> {
        let events: Vec<StreamEvent> = orchestrator
            .generate(GenerationRequest::new(text, task))
            .collect()
            .await;
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1, "exactly one terminal event in {events:?}");
        assert!(events.last().unwrap().is_terminal());
        events
    }

    fn tokens(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    struct Seq2SeqModels {
        en_ar: Arc<Scripted>,
        ar_en: Arc<Scripted>,
        rephrase: Arc<Scripted>,
    }

    impl Seq2SeqModels {
        fn new() -> Self {
            Self {
                en_ar: Scripted::ok(&["مرحبا بالعالم"]),
                ar_en: Scripted::ok(&["Hello there"]),
                rephrase: Scripted::ok(&["Hi", " there", ", world"]),
            }
        }

        fn orchestrator(&self, policy: DetectionPolicy) -> Arc<Orchestrator> {
            orchestrator(
                PipelineKind::Seq2Seq,
                policy,
                vec![
                    (ModelKey::TranslateEnAr, self.en_ar.clone()),
                    (ModelKey::TranslateArEn, self.ar_en.clone()),
                    (ModelKey::RephraseEn, self.rephrase.clone()),
                ],
            )
        }
    }

    #[tokio::test]
    async fn english_translation_streams_characters_then_ends() {
        let models = Seq2SeqModels::new();
        let events = collect(&models.orchestrator(DetectionPolicy::default()), "Hello world", "translate").await;

        assert_eq!(events.len(), "مرحبا بالعالم".chars().count() + 1);
        assert_eq!(events.first(), Some(&StreamEvent::Token("م".into())));
        assert_eq!(tokens(&events), "مرحبا بالعالم");
        assert_eq!(events.last(), Some(&StreamEvent::EndOfStream));
        assert_eq!(models.en_ar.calls(), 1);
        assert_eq!(models.en_ar.inputs.lock()[0], "Hello world");
        assert_eq!(models.ar_en.calls(), 0);
    }

    #[tokio::test]
    async fn arabic_translation_uses_the_reverse_model() {
        let models = Seq2SeqModels::new();
        let events = collect(&models.orchestrator(DetectionPolicy::AnyMatch), "مرحبا", "translate").await;

        assert_eq!(tokens(&events), "Hello there");
        assert_eq!(events.last(), Some(&StreamEvent::EndOfStream));
        assert_eq!(models.ar_en.calls(), 1);
        assert_eq!(models.en_ar.calls(), 0);
    }

    #[tokio::test]
    async fn unsupported_task_emits_only_an_error() {
        let models = Seq2SeqModels::new();
        let events = collect(&models.orchestrator(DetectionPolicy::default()), "Hello", "summarize").await;

        assert_eq!(events, vec![StreamEvent::Error]);
        assert_eq!(models.en_ar.calls() + models.ar_en.calls() + models.rephrase.calls(), 0);
    }

    #[tokio::test]
    async fn generation_failure_emits_a_single_error() {
        let failing = Scripted::failing("CUDA out of memory");
        let orchestrator = orchestrator(
            PipelineKind::Seq2Seq,
            DetectionPolicy::default(),
            vec![(ModelKey::TranslateEnAr, failing.clone())],
        );
        let events = collect(&orchestrator, "Hello world", "translate").await;

        assert_eq!(events, vec![StreamEvent::Error]);
        assert_eq!(failing.calls(), 1);
    }

    #[tokio::test]
    async fn missing_registry_entry_is_an_error() {
        let rephrase = Scripted::ok(&["unused"]);
        let orchestrator = orchestrator(
            PipelineKind::Seq2Seq,
            DetectionPolicy::default(),
            vec![(ModelKey::RephraseEn, rephrase.clone())],
        );
        let events = collect(&orchestrator, "مرحبا بكم", "rephrase").await;

        assert_eq!(events, vec![StreamEvent::Error]);
        assert_eq!(rephrase.calls(), 0);
    }

    #[tokio::test]
    async fn arabic_rephrase_chains_two_translations() {
        let models = Seq2SeqModels::new();
        let events = collect(&models.orchestrator(DetectionPolicy::default()), "أهلا وسهلا", "rephrase").await;

        assert_eq!(models.ar_en.inputs.lock().as_slice(), ["أهلا وسهلا"]);
        assert_eq!(models.en_ar.inputs.lock().as_slice(), ["Hello there"]);
        assert_eq!(tokens(&events), "مرحبا بالعالم");
        assert_eq!(models.rephrase.calls(), 0);
    }

    #[tokio::test]
    async fn failing_first_hop_fails_the_cascade() {
        let en_ar = Scripted::ok(&["never"]);
        let orchestrator = orchestrator(
            PipelineKind::Seq2Seq,
            DetectionPolicy::default(),
            vec![
                (ModelKey::TranslateArEn, Scripted::failing("boom")),
                (ModelKey::TranslateEnAr, en_ar.clone()),
            ],
        );
        let events = collect(&orchestrator, "أهلا وسهلا", "rephrase").await;

        assert_eq!(events, vec![StreamEvent::Error]);
        assert_eq!(en_ar.calls(), 0);
    }

    #[tokio::test]
    async fn failing_second_hop_fails_the_cascade() {
        let ar_en = Scripted::ok(&["Hello there"]);
        let en_ar = Scripted::failing("decoder crashed");
        let orchestrator = orchestrator(
            PipelineKind::Seq2Seq,
            DetectionPolicy::default(),
            vec![
                (ModelKey::TranslateArEn, ar_en.clone()),
                (ModelKey::TranslateEnAr, en_ar.clone()),
            ],
        );
        let events = collect(&orchestrator, "أهلا وسهلا", "rephrase").await;

        assert_eq!(events, vec![StreamEvent::Error]);
        assert_eq!(ar_en.calls(), 1);
        assert_eq!(en_ar.inputs.lock().as_slice(), ["Hello there"]);
    }

    #[tokio::test]
    async fn failure_after_fragments_ends_with_one_error() {
        let rephrase = Scripted::interrupted(&["Hi", " there"], "CUDA out of memory");
        let orchestrator = orchestrator(
            PipelineKind::Seq2Seq,
            DetectionPolicy::default(),
            vec![(ModelKey::RephraseEn, rephrase)],
        );
        let events = collect(&orchestrator, "Hello world", "rephrase").await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Token("Hi".into()),
                StreamEvent::Token(" there".into()),
                StreamEvent::Error,
            ]
        );
    }

    #[tokio::test]
    async fn english_rephrase_forwards_fragments_in_order() {
        let models = Seq2SeqModels::new();
        let events = collect(&models.orchestrator(DetectionPolicy::default()), "Hello world", "rephrase").await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Token("Hi".into()),
                StreamEvent::Token(" there".into()),
                StreamEvent::Token(", world".into()),
                StreamEvent::EndOfStream,
            ]
        );
    }

    #[tokio::test]
    async fn instruct_pipeline_sends_the_built_prompt() {
        let model = Scripted::ok(&["{\"english_tags\": ", "[\"hello\"]}"]);
        let orchestrator = orchestrator(
            PipelineKind::Remote,
            DetectionPolicy::default(),
            vec![(ModelKey::Instruct, model.clone())],
        );
        let events = collect(&orchestrator, "Hello hello world", "rephrase").await;

        assert_eq!(
            model.inputs.lock()[0],
            build_prompt("Hello hello world", Task::Rephrase, Language::English)
        );
        assert_eq!(tokens(&events), "{\"english_tags\": [\"hello\"]}");
        assert_eq!(events.last(), Some(&StreamEvent::EndOfStream));
    }

    #[tokio::test]
    async fn arabic_output_loses_its_diacritics() {
        let model = Scripted::ok(&["مَرْ", "\u{064E}", "حَبًا"]);
        let orchestrator = orchestrator(
            PipelineKind::Instruct,
            DetectionPolicy::default(),
            vec![(ModelKey::Instruct, model)],
        );
        let events = collect(&orchestrator, "Hello", "translate").await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Token("مر".into()),
                StreamEvent::Token("حبا".into()),
                StreamEvent::EndOfStream,
            ]
        );
    }

    #[tokio::test]
    async fn english_output_is_left_untouched() {
        let model = Scripted::ok(&["café"]);
        let orchestrator = orchestrator(
            PipelineKind::Instruct,
            DetectionPolicy::default(),
            vec![(ModelKey::Instruct, model)],
        );
        let events = collect(&orchestrator, "مقهى", "translate").await;

        assert_eq!(tokens(&events), "café");
    }
}
