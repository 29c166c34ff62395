use std::{fmt, sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheKey, SessionCache},
    config::AppConfig,
    errors::{ExportError, GenerationError, NO_PROMPT_MESSAGE, TEMPORARILY_UNAVAILABLE_MESSAGE},
    export::{ExportedThumbnail, render_download},
    generation::GenerationBackend,
    models::{EncodedImage, GenerationRequest, GenerationResult, Variant},
    retry::{RetryError, RetryPolicy, Sleeper, TokioSleeper},
};

pub const PREVIEW_STATUS: &str = "Generating fast preview...";
pub const FINAL_STATUS: &str = "Enhancing to Full HD...";
pub const RETRY_STATUS: &str = "Server is busy. Retrying automatically...";

const EMPTY_PREVIEW_MESSAGE: &str = "AI did not return a preview.";
const EMPTY_FINAL_MESSAGE: &str = "AI did not return a final image.";
const NO_PROMPT_FOR_FINAL_MESSAGE: &str = "Prompt is missing for final generation.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    RequestingPreview,
    PreviewReady,
    RequestingFinal,
    FinalReady,
    Error,
}

impl FlowState {
    /// A requesting state may only settle into its own outcome or `Error`.
    /// Settled states may start any flow. Anything may reset to `Idle`.
    pub fn can_transition_to(self, next: FlowState) -> bool {
        use FlowState::*;
        match (self, next) {
            (_, Idle) => true,
            (RequestingPreview, PreviewReady | Error) => true,
            (RequestingFinal, FinalReady | Error) => true,
            (RequestingPreview | RequestingFinal, _) => false,
            _ => true,
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FlowState::Idle => "idle",
            FlowState::RequestingPreview => "requesting preview",
            FlowState::PreviewReady => "preview ready",
            FlowState::RequestingFinal => "requesting final",
            FlowState::FinalReady => "final ready",
            FlowState::Error => "error",
        };
        f.write_str(label)
    }
}

/// A flow that ended in `FlowState::Error`. `message` is what the user sees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FlowError {
    pub cause: GenerationError,
    pub message: String,
    pub attempts: u32,
}

pub type StatusCallback = Box<dyn Fn(&str) + Send + Sync>;

/// One user's generation session: inputs are passed per call, results and
/// the cache live here until the process ends.
pub struct ThumbnailSession {
    backend: Arc<dyn GenerationBackend>,
    sleeper: Arc<dyn Sleeper>,
    retry: RetryPolicy,
    key_prefix_len: usize,
    cache: SessionCache,
    state: FlowState,
    current_key: Option<CacheKey>,
    preview: Option<GenerationResult>,
    final_result: Option<GenerationResult>,
    error: Option<String>,
    on_status: Option<StatusCallback>,
}

impl ThumbnailSession {
    pub fn new(backend: Arc<dyn GenerationBackend>, retry: RetryPolicy, key_prefix_len: usize) -> Self {
        Self {
            backend,
            sleeper: Arc::new(TokioSleeper),
            retry,
            key_prefix_len,
            cache: SessionCache::new(),
            state: FlowState::Idle,
            current_key: None,
            preview: None,
            final_result: None,
            error: None,
            on_status: None,
        }
    }

    pub fn from_config(backend: Arc<dyn GenerationBackend>, config: &AppConfig) -> Self {
        Self::new(
            backend,
            RetryPolicy::from_config(&config.retry),
            config.cache.key_prefix_len,
        )
    }

    #[cfg(test)]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.on_status = Some(callback);
        self
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// The final when present, else the preview.
    pub fn displayed(&self) -> Option<(Variant, &GenerationResult)> {
        self.final_result
            .as_ref()
            .map(|result| (Variant::Final, result))
            .or_else(|| self.preview.as_ref().map(|result| (Variant::Preview, result)))
    }

    /// Drops displayed results and any error. The cache survives.
    pub fn reset(&mut self) {
        self.preview = None;
        self.final_result = None;
        self.current_key = None;
        self.error = None;
        self.transition(FlowState::Idle);
    }

    pub async fn generate_preview(
        &mut self,
        prompt_text: &str,
        image: Option<&EncodedImage>,
        face_lock: bool,
    ) -> Result<GenerationResult, FlowError> {
        if prompt_text.trim().is_empty() {
            return Err(self.fail(GenerationError::NoPromptProvided, NO_PROMPT_MESSAGE.into(), 0));
        }

        let key = CacheKey::derive(prompt_text, image, face_lock, self.key_prefix_len);
        if let Some(cached) = self.cache.get(&key, Variant::Preview).cloned() {
            debug!(target: "orchestrator", "preview served from cache");
            self.show(key, Variant::Preview, cached.clone());
            self.transition(FlowState::PreviewReady);
            return Ok(cached);
        }

        self.error = None;
        self.transition(FlowState::RequestingPreview);
        self.emit(PREVIEW_STATUS);

        let request =
            GenerationRequest::new(prompt_text, image.cloned(), Variant::Preview, face_lock);
        match self.backend.generate(&request).await {
            Ok(result) => {
                info!(target: "orchestrator", backend = self.backend.name(), "preview ready");
                self.cache.store(key.clone(), Variant::Preview, result.clone());
                self.show(key, Variant::Preview, result.clone());
                self.transition(FlowState::PreviewReady);
                Ok(result)
            }
            Err(err) => {
                warn!(target: "orchestrator", error = %err, "preview failed");
                let message = match &err {
                    GenerationError::EmptyResult => EMPTY_PREVIEW_MESSAGE.to_string(),
                    other => other.user_message(),
                };
                Err(self.fail(err, message, 1))
            }
        }
    }

    /// Does not require a preceding preview.
    pub async fn generate_final(
        &mut self,
        prompt_text: &str,
        image: Option<&EncodedImage>,
        face_lock: bool,
    ) -> Result<GenerationResult, FlowError> {
        if prompt_text.trim().is_empty() {
            return Err(self.fail(
                GenerationError::NoPromptProvided,
                NO_PROMPT_FOR_FINAL_MESSAGE.into(),
                0,
            ));
        }

        let key = CacheKey::derive(prompt_text, image, face_lock, self.key_prefix_len);
        if let Some(cached) = self.cache.get(&key, Variant::Final).cloned() {
            debug!(target: "orchestrator", "final served from cache");
            self.show(key, Variant::Final, cached.clone());
            self.transition(FlowState::FinalReady);
            return Ok(cached);
        }

        self.error = None;
        self.transition(FlowState::RequestingFinal);
        self.emit(FINAL_STATUS);

        let request = GenerationRequest::new(prompt_text, image.cloned(), Variant::Final, face_lock);
        let outcome = {
            let backend = self.backend.as_ref();
            let request = &request;
            self.retry
                .run(
                    self.sleeper.as_ref(),
                    move |attempt| async move {
                        let result = backend.generate(request).await;
                        if let Err(err) = &result {
                            let detail = match err {
                                GenerationError::EmptyResult => EMPTY_FINAL_MESSAGE.to_string(),
                                other => other.to_string(),
                            };
                            warn!(target: "orchestrator", attempt = attempt + 1, error = %detail, "final attempt failed");
                        }
                        result
                    },
                    GenerationError::is_retryable,
                    |_, _, delay: Duration| {
                        info!(target: "orchestrator", delay_ms = delay.as_millis() as u64, "retrying final");
                        self.emit(RETRY_STATUS);
                    },
                )
                .await
        };

        match outcome {
            Ok(result) => {
                info!(target: "orchestrator", backend = self.backend.name(), "final ready");
                self.cache.store(key.clone(), Variant::Final, result.clone());
                self.show(key, Variant::Final, result.clone());
                self.transition(FlowState::FinalReady);
                Ok(result)
            }
            Err(RetryError::Aborted { attempt, error }) => {
                let message = error.user_message();
                Err(self.fail(error, message, attempt + 1))
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                Err(self.fail(last, TEMPORARILY_UNAVAILABLE_MESSAGE.into(), attempts))
            }
        }
    }

    /// Renders the displayed result for download, named after `prompt_text`.
    pub fn export_displayed(&self, prompt_text: &str) -> Result<(Variant, ExportedThumbnail), ExportError> {
        let (variant, result) = self.displayed().ok_or(ExportError::NothingToExport)?;
        let exported = render_download(result, prompt_text)?;
        Ok((variant, exported))
    }

    fn show(&mut self, key: CacheKey, variant: Variant, result: GenerationResult) {
        // Results shown for another request are stale once the key changes.
        if self.current_key.as_ref() != Some(&key) {
            let entry = self.cache.entry(&key);
            self.preview = entry.and_then(|entry| entry.preview.clone());
            self.final_result = entry.and_then(|entry| entry.final_result.clone());
            self.current_key = Some(key);
        }
        match variant {
            Variant::Preview => self.preview = Some(result),
            Variant::Final => self.final_result = Some(result),
        }
        self.error = None;
    }

    fn fail(&mut self, cause: GenerationError, message: String, attempts: u32) -> FlowError {
        self.error = Some(message.clone());
        self.transition(FlowState::Error);
        FlowError {
            cause,
            message,
            attempts,
        }
    }

    fn transition(&mut self, next: FlowState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        debug!(target: "orchestrator", from = %self.state, to = %next, "state change");
        self.state = next;
    }

    fn emit(&self, status: &str) {
        if let Some(callback) = &self.on_status {
            callback(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::Mutex,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        errors::{FACE_MATCH_FAILED_MESSAGE, SERVICE_UNAVAILABLE_MESSAGE},
        retry::testing::RecordingSleeper,
    };

    /// Replays queued outcomes and records every request it receives.
    #[derive(Default)]
    struct ScriptedBackend {
        outcomes: Mutex<VecDeque<Result<GenerationResult, GenerationError>>>,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedBackend {
        fn with(outcomes: Vec<Result<GenerationResult, GenerationError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                requests: Mutex::default(),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().expect("lock").len()
        }

        fn variants(&self) -> Vec<Variant> {
            self.requests
                .lock()
                .expect("lock")
                .iter()
                .map(|request| request.variant)
                .collect()
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<GenerationResult, GenerationError> {
            self.requests.lock().expect("lock").push(request.clone());
            self.outcomes
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Err(GenerationError::UpstreamFailure("script exhausted".into())))
        }
    }

    fn ok(data: &str) -> Result<GenerationResult, GenerationError> {
        Ok(GenerationResult::from_base64(data))
    }

    fn upstream() -> Result<GenerationResult, GenerationError> {
        Err(GenerationError::UpstreamFailure("overloaded".into()))
    }

    fn session(backend: &Arc<ScriptedBackend>) -> (ThumbnailSession, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::default());
        let session = ThumbnailSession::new(backend.clone(), RetryPolicy::default(), 100)
            .with_sleeper(sleeper.clone());
        (session, sleeper)
    }

    fn headshot() -> EncodedImage {
        EncodedImage::new("/9j/4AAQSkZJRgABAQAAAQABAAD", "image/jpeg")
    }

    #[test]
    fn requesting_states_only_settle_into_their_outcome() {
        use FlowState::*;
        assert!(Idle.can_transition_to(RequestingPreview));
        assert!(Idle.can_transition_to(RequestingFinal));
        assert!(Idle.can_transition_to(Error));
        assert!(PreviewReady.can_transition_to(RequestingFinal));
        assert!(Error.can_transition_to(RequestingPreview));
        assert!(RequestingPreview.can_transition_to(PreviewReady));
        assert!(RequestingPreview.can_transition_to(Error));
        assert!(!RequestingPreview.can_transition_to(FinalReady));
        assert!(!RequestingPreview.can_transition_to(RequestingFinal));
        assert!(RequestingFinal.can_transition_to(FinalReady));
        assert!(!RequestingFinal.can_transition_to(PreviewReady));
        assert!(FinalReady.can_transition_to(Idle));
    }

    #[tokio::test]
    async fn repeated_preview_is_served_from_cache() {
        let backend = ScriptedBackend::with(vec![ok("PREVIEW")]);
        let (mut session, _) = session(&backend);

        let first = session.generate_preview("X", None, false).await.expect("preview");
        let second = session.generate_preview("X", None, false).await.expect("cached");

        assert_eq!(first, second);
        assert_eq!(backend.calls(), 1);
        assert_eq!(session.state(), FlowState::PreviewReady);
    }

    #[tokio::test]
    async fn empty_prompt_errors_without_a_call() {
        let backend = ScriptedBackend::with(vec![]);
        let (mut session, _) = session(&backend);

        let err = session.generate_preview("   ", None, false).await.expect_err("no prompt");
        assert_eq!(err.message, NO_PROMPT_MESSAGE);
        assert_eq!(err.attempts, 0);
        assert_eq!(session.state(), FlowState::Error);
        assert_eq!(session.error(), Some(NO_PROMPT_MESSAGE));

        session.generate_final("", None, false).await.expect_err("no prompt");
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn final_without_preview_calls_once_with_final_variant() {
        let backend = ScriptedBackend::with(vec![ok("FINAL")]);
        let (mut session, sleeper) = session(&backend);

        session.generate_final("X", None, false).await.expect("final");

        assert_eq!(backend.variants(), vec![Variant::Final]);
        assert!(sleeper.delays().is_empty());
        assert_eq!(session.state(), FlowState::FinalReady);
        assert_eq!(session.displayed().map(|(variant, _)| variant), Some(Variant::Final));
    }

    #[tokio::test]
    async fn final_retries_twice_with_doubling_delays() {
        let backend = ScriptedBackend::with(vec![
            upstream(),
            Err(GenerationError::EmptyResult),
            upstream(),
        ]);
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        let (session, sleeper) = session(&backend);
        let mut session = session.with_status_callback(Box::new(move |status: &str| {
            sink.lock().expect("lock").push(status.to_string())
        }));

        let err = session.generate_final("X", None, false).await.expect_err("exhausted");

        assert_eq!(backend.calls(), 3);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(2000), Duration::from_millis(4000)]
        );
        assert_eq!(err.message, TEMPORARILY_UNAVAILABLE_MESSAGE);
        assert_eq!(err.attempts, 3);
        assert_eq!(
            *statuses.lock().expect("lock"),
            vec![FINAL_STATUS, RETRY_STATUS, RETRY_STATUS]
        );
    }

    #[tokio::test]
    async fn final_succeeds_after_a_transient_failure() {
        let backend = ScriptedBackend::with(vec![upstream(), ok("FINAL")]);
        let (mut session, sleeper) = session(&backend);

        let result = session.generate_final("X", None, false).await.expect("final");
        assert_eq!(result.data, "FINAL");
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(2000)]);
        assert_eq!(session.error(), None);
    }

    #[tokio::test]
    async fn service_unavailable_aborts_without_retry() {
        let backend = ScriptedBackend::with(vec![Err(GenerationError::ServiceUnavailable(
            "OPENROUTER_API_KEY is not set".into(),
        ))]);
        let (mut session, sleeper) = session(&backend);

        let err = session.generate_final("X", None, false).await.expect_err("abort");

        assert_eq!(backend.calls(), 1);
        assert!(sleeper.delays().is_empty());
        assert_eq!(err.message, SERVICE_UNAVAILABLE_MESSAGE);
        assert_eq!(session.state(), FlowState::Error);
    }

    #[tokio::test]
    async fn face_match_failure_aborts_with_its_own_message() {
        let backend = ScriptedBackend::with(vec![Err(GenerationError::FaceMatchFailed(
            "Face Match Failed: identity drift".into(),
        ))]);
        let (mut session, sleeper) = session(&backend);
        let image = headshot();

        let err = session
            .generate_final("X", Some(&image), true)
            .await
            .expect_err("abort");

        assert_eq!(backend.calls(), 1);
        assert!(sleeper.delays().is_empty());
        assert!(matches!(err.cause, GenerationError::FaceMatchFailed(_)));
        assert_eq!(err.message, err.cause.user_message());
    }

    #[tokio::test]
    async fn service_unavailable_on_a_retry_stops_the_final() {
        let backend = ScriptedBackend::with(vec![
            upstream(),
            Err(GenerationError::ServiceUnavailable("OPENROUTER_API_KEY is not set".into())),
            ok("NEVER"),
        ]);
        let (mut session, sleeper) = session(&backend);

        let err = session.generate_final("X", None, false).await.expect_err("abort");

        assert_eq!(backend.calls(), 2);
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(2000)]);
        assert_eq!(err.message, SERVICE_UNAVAILABLE_MESSAGE);
        assert_eq!(err.attempts, 2);
        assert_eq!(session.state(), FlowState::Error);
    }

    #[tokio::test]
    async fn face_mismatch_on_a_retry_stops_the_final() {
        let backend = ScriptedBackend::with(vec![
            Err(GenerationError::EmptyResult),
            Err(GenerationError::FaceMatchFailed("likeness lost".into())),
            ok("NEVER"),
        ]);
        let (mut session, sleeper) = session(&backend);
        let image = headshot();

        let err = session
            .generate_final("X", Some(&image), true)
            .await
            .expect_err("abort");

        assert_eq!(backend.calls(), 2);
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(2000)]);
        assert_eq!(err.message, FACE_MATCH_FAILED_MESSAGE);
        assert_eq!(err.attempts, 2);
        assert_eq!(session.error(), Some(FACE_MATCH_FAILED_MESSAGE));
    }

    #[tokio::test]
    async fn preview_is_never_retried() {
        let backend = ScriptedBackend::with(vec![Err(GenerationError::EmptyResult), ok("LATE")]);
        let (mut session, sleeper) = session(&backend);

        let err = session.generate_preview("X", None, false).await.expect_err("empty");
        assert_eq!(err.message, EMPTY_PREVIEW_MESSAGE);
        assert_eq!(backend.calls(), 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn failed_final_keeps_the_preview() {
        let backend = ScriptedBackend::with(vec![
            ok("PREVIEW"),
            Err(GenerationError::ServiceUnavailable("down".into())),
        ]);
        let (mut session, _) = session(&backend);

        session.generate_preview("X", None, false).await.expect("preview");
        session.generate_final("X", None, false).await.expect_err("fail");

        let (variant, shown) = session.displayed().expect("preview kept");
        assert_eq!(variant, Variant::Preview);
        assert_eq!(shown.data, "PREVIEW");
    }

    #[tokio::test]
    async fn image_and_face_lock_are_separate_cache_entries() {
        let backend = ScriptedBackend::with(vec![ok("A"), ok("B"), ok("C")]);
        let (mut session, _) = session(&backend);
        let image = headshot();

        session.generate_preview("X", None, false).await.expect("bare");
        session.generate_preview("X", Some(&image), false).await.expect("image");
        session.generate_preview("X", Some(&image), true).await.expect("locked");
        session.generate_preview("X", Some(&image), false).await.expect("cached");

        assert_eq!(backend.calls(), 3);
        assert_eq!(session.cached_entries(), 3);
    }

    #[tokio::test]
    async fn preview_write_keeps_cached_final() {
        let backend = ScriptedBackend::with(vec![ok("FINAL"), ok("PREVIEW")]);
        let (mut session, _) = session(&backend);

        session.generate_final("X", None, false).await.expect("final");
        session.generate_preview("X", None, false).await.expect("preview");
        session.reset();
        let cached = session.generate_final("X", None, false).await.expect("cached");

        assert_eq!(cached.data, "FINAL");
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn switching_prompts_hides_stale_final() {
        let backend = ScriptedBackend::with(vec![ok("FINAL-X"), ok("PREVIEW-Y")]);
        let (mut session, _) = session(&backend);

        session.generate_final("X", None, false).await.expect("final");
        session.generate_preview("Y", None, false).await.expect("preview");

        let (variant, shown) = session.displayed().expect("shown");
        assert_eq!(variant, Variant::Preview);
        assert_eq!(shown.data, "PREVIEW-Y");
    }

    #[tokio::test]
    async fn reset_clears_results_but_not_cache() {
        let backend = ScriptedBackend::with(vec![ok("PREVIEW")]);
        let (mut session, _) = session(&backend);

        session.generate_preview("X", None, false).await.expect("preview");
        session.reset();
        assert_eq!(session.state(), FlowState::Idle);
        assert!(session.displayed().is_none());

        session.generate_preview("X", None, false).await.expect("cached");
        assert_eq!(backend.calls(), 1);
    }

    #[test]
    fn export_without_result_is_rejected() {
        let backend = ScriptedBackend::with(vec![]);
        let (session, _) = session(&backend);
        assert!(matches!(
            session.export_displayed("X"),
            Err(ExportError::NothingToExport)
        ));
    }
}
