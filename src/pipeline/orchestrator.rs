use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::pipeline::backend::{ImageModel, ImageRequest, LanguageModel};
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::errors::{FailureReport, PipelineError, ValidationError};
use crate::pipeline::events::{
    image_progress, PipelineEvent, PipelineState, ProgressReporter, PLANNING_BUDGET,
    PLANNING_PROGRESS,
};
use crate::pipeline::ledger::{
    CreditLedger, GenerationStore, NewGeneration, RecordId, StatusUpdate,
};
use crate::pipeline::outbox::{OutboxHandle, SideEffect};
use crate::pipeline::pacing::Pacer;
use crate::pipeline::planner::plan_photoshoot;
use crate::pipeline::prompt::{compose_prompt, PromptRequest};
use crate::pipeline::session::Session;
use crate::pipeline::types::{
    GeneratedImage, GenerationRequest, GenerationStatus, ModelId, PhotoshootPlan,
};
use crate::utils::timing::{complete_generation_timer, start_generation_timer};

/// Credits charged per successfully generated image.
pub const CREDITS_PER_IMAGE: i64 = 1;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub image_model: ModelId,
    pub pro_image_model: ModelId,
    pub enhance_prompts: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PhotoshootResult {
    pub plan: Option<PhotoshootPlan>,
    pub images: Vec<GeneratedImage>,
    pub record_id: Option<RecordId>,
    pub remaining_credits: i64,
}

#[derive(Debug)]
pub enum GenerationOutcome {
    /// Inputs were invalid; nothing was contacted.
    Rejected(ValidationError),
    InsufficientCredits { required: i64, available: i64 },
    Completed(PhotoshootResult),
    /// Images produced before the failure are kept in `result`.
    Failed {
        result: PhotoshootResult,
        failure: FailureReport,
    },
    Cancelled(PhotoshootResult),
}

impl GenerationOutcome {
    pub fn state(&self) -> PipelineState {
        match self {
            GenerationOutcome::Rejected(_) | GenerationOutcome::InsufficientCredits { .. } => {
                PipelineState::Idle
            }
            GenerationOutcome::Completed(_) => PipelineState::Complete,
            GenerationOutcome::Failed { .. } => PipelineState::Error,
            GenerationOutcome::Cancelled(_) => PipelineState::Cancelled,
        }
    }

    pub fn result(&self) -> Option<&PhotoshootResult> {
        match self {
            GenerationOutcome::Completed(result)
            | GenerationOutcome::Failed { result, .. }
            | GenerationOutcome::Cancelled(result) => Some(result),
            GenerationOutcome::Rejected(_) | GenerationOutcome::InsufficientCredits { .. } => None,
        }
    }
}

enum LoopEnd {
    Finished,
    Failed(PipelineError),
    Cancelled,
}

pub struct GenerationOrchestrator {
    language: Arc<dyn LanguageModel>,
    images: Arc<dyn ImageModel>,
    ledger: Arc<dyn CreditLedger>,
    records: Arc<dyn GenerationStore>,
    pacer: Arc<dyn Pacer>,
    outbox: OutboxHandle,
    settings: PipelineSettings,
}

impl GenerationOrchestrator {
    pub fn new(
        language: Arc<dyn LanguageModel>,
        images: Arc<dyn ImageModel>,
        ledger: Arc<dyn CreditLedger>,
        records: Arc<dyn GenerationStore>,
        pacer: Arc<dyn Pacer>,
        outbox: OutboxHandle,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            language,
            images,
            ledger,
            records,
            pacer,
            outbox,
            settings,
        }
    }

    /// Balance the run may spend. Registered sessions are refreshed from the
    /// ledger; the cached value is only used when the ledger cannot answer.
    async fn available_credits(&self, session: &mut Session, required: i64) -> (bool, i64) {
        let Some(user_id) = session.user_id.as_deref() else {
            return (session.cached_credits >= required, session.cached_credits);
        };
        match self.ledger.credits(user_id).await {
            Ok(balance) => {
                session.cached_credits = balance;
                (balance >= required, balance)
            }
            Err(err) => {
                warn!(
                    "Credit check for {} failed, using cached balance {}: {}",
                    user_id, session.cached_credits, err
                );
                (session.cached_credits >= required, session.cached_credits)
            }
        }
    }

    async fn create_record(
        &self,
        session: &Session,
        request: &GenerationRequest,
    ) -> Option<RecordId> {
        let user_id = session.user_id.as_deref()?;
        let generation = NewGeneration {
            user_id,
            mode: request.mode,
            image_count: request.image_count,
            quality: request.quality(),
            priority: request.priority,
        };
        match self.records.create(generation).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!("Could not create generation record for {}: {}", user_id, err);
                None
            }
        }
    }

    async fn record_status(&self, record_id: Option<RecordId>, update: StatusUpdate) {
        if let Some(record_id) = record_id {
            self.outbox
                .enqueue(SideEffect::RecordStatus { record_id, update })
                .await;
        }
    }

    fn image_model(&self, request: &GenerationRequest) -> &ModelId {
        if request.use_pro_model {
            &self.settings.pro_image_model
        } else {
            &self.settings.image_model
        }
    }

    /// Runs one photoshoot end to end. Credits are debited per produced
    /// image; a failure or cancellation keeps what was already produced.
    pub async fn run(
        &self,
        session: &mut Session,
        request: &GenerationRequest,
        progress: &ProgressReporter,
        cancel: &CancelToken,
    ) -> GenerationOutcome {
        if let Err(err) = request.validate() {
            warn!("Rejected photoshoot request: {}", err);
            return GenerationOutcome::Rejected(err);
        }

        let image_count = request.image_count;
        let required = image_count as i64 * CREDITS_PER_IMAGE;
        let (affordable, available) = self.available_credits(session, required).await;
        if !affordable {
            info!(
                "Not enough credits for {} image(s) (available={})",
                image_count, available
            );
            return GenerationOutcome::InsufficientCredits {
                required,
                available,
            };
        }

        let mut timer = start_generation_timer(
            request.mode.as_str(),
            session.user_id.as_deref(),
            image_count,
        );
        let mut result = PhotoshootResult {
            remaining_credits: session.cached_credits,
            ..PhotoshootResult::default()
        };

        progress.state(PipelineState::Analyzing);
        progress.progress(PLANNING_PROGRESS, "Analyzing photos and planning the shoot...");

        let planning_inputs = request.planning_inputs();
        let planned = tokio::select! {
            planned = plan_photoshoot(
                self.language.as_ref(),
                &planning_inputs,
                image_count,
                request.mode,
            ) => planned,
            _ = cancel.cancelled() => {
                info!("Photoshoot cancelled during planning");
                progress.state(PipelineState::Cancelled);
                complete_generation_timer(&mut timer, "cancelled", 0, None);
                return GenerationOutcome::Cancelled(result);
            }
        };
        let plan = match planned {
            Ok(plan) => plan,
            Err(err) => {
                let failure = FailureReport::from_error(&PipelineError::from(err));
                error!(
                    "Photoshoot planning failed ({}): {}",
                    failure.kind.as_str(),
                    failure.detail
                );
                progress.state(PipelineState::Error);
                complete_generation_timer(
                    &mut timer,
                    "error",
                    0,
                    Some(failure.detail.clone()),
                );
                return GenerationOutcome::Failed { result, failure };
            }
        };
        progress.emit(PipelineEvent::PlanReady(plan.clone()));
        progress.progress(PLANNING_BUDGET, "Plan ready, generating images...");

        result.record_id = self.create_record(session, request).await;
        result.plan = Some(plan);
        progress.state(PipelineState::Generating);

        let end = self
            .generate_images(session, request, progress, cancel, &mut result)
            .await;
        result.remaining_credits = session.cached_credits;
        let produced = result.images.len();

        match end {
            LoopEnd::Finished => {
                self.record_status(
                    result.record_id,
                    StatusUpdate::new(GenerationStatus::Completed).with_result_count(produced),
                )
                .await;
                progress.progress(100.0, "Photoshoot complete");
                progress.state(PipelineState::Complete);
                complete_generation_timer(&mut timer, "success", produced, None);
                info!("Photoshoot completed with {} image(s)", produced);
                GenerationOutcome::Completed(result)
            }
            LoopEnd::Cancelled => {
                self.record_status(
                    result.record_id,
                    StatusUpdate::new(GenerationStatus::Cancelled).with_result_count(produced),
                )
                .await;
                progress.state(PipelineState::Cancelled);
                complete_generation_timer(&mut timer, "cancelled", produced, None);
                info!(
                    "Photoshoot cancelled after {}/{} image(s)",
                    produced, image_count
                );
                GenerationOutcome::Cancelled(result)
            }
            LoopEnd::Failed(err) => {
                if let PipelineError::Image { index, .. } = &err {
                    warn!("Image {} of {} could not be generated", index + 1, image_count);
                }
                let failure = FailureReport::from_error(&err);
                error!(
                    "Photoshoot failed after {}/{} image(s) ({}): {}",
                    produced,
                    image_count,
                    failure.kind.as_str(),
                    failure.detail
                );
                self.record_status(
                    result.record_id,
                    StatusUpdate::new(GenerationStatus::Failed)
                        .with_result_count(produced)
                        .with_error(failure.detail.clone()),
                )
                .await;
                progress.state(PipelineState::Error);
                complete_generation_timer(
                    &mut timer,
                    "error",
                    produced,
                    Some(failure.detail.clone()),
                );
                GenerationOutcome::Failed { result, failure }
            }
        }
    }

    async fn generate_images(
        &self,
        session: &mut Session,
        request: &GenerationRequest,
        progress: &ProgressReporter,
        cancel: &CancelToken,
        result: &mut PhotoshootResult,
    ) -> LoopEnd {
        let Some(plan) = result.plan.clone() else {
            return LoopEnd::Finished;
        };
        let inputs = &request.inputs;
        let image_count = request.image_count;
        let model = self.image_model(request);
        let enhancer: Option<&dyn LanguageModel> = if self.settings.enhance_prompts {
            Some(self.language.as_ref())
        } else {
            None
        };

        for index in 0..image_count {
            if cancel.is_cancelled() {
                return LoopEnd::Cancelled;
            }
            if index == 0 {
                self.record_status(
                    result.record_id,
                    StatusUpdate::new(GenerationStatus::Processing),
                )
                .await;
            }

            let subject = &inputs.subject_photos[index % inputs.subject_photos.len()];
            let scene = if inputs.location_photos.is_empty() {
                None
            } else {
                Some(&inputs.location_photos[index % inputs.location_photos.len()])
            };
            progress.progress(
                image_progress(index, image_count),
                format!("Generating image {} of {}...", index + 1, image_count),
            );

            let prompt_request = PromptRequest {
                plan: &plan,
                scenario_index: index,
                positive_prompt: &inputs.style_prompt,
                negative_prompt: &inputs.negative_prompt,
                replicate_scene: request.mode.is_replicate() && scene.is_some(),
            };
            let composed = compose_prompt(enhancer, &prompt_request).await;

            let image_request = ImageRequest {
                prompt: &composed.prompt,
                model,
                aspect_ratio: &request.aspect_ratio,
                subject: Some(subject),
                scene,
            };
            let generated = tokio::select! {
                biased;
                generated = self.images.generate_image(image_request) => generated,
                _ = cancel.cancelled() => return LoopEnd::Cancelled,
            };
            let payload = match generated {
                Ok(payload) => payload,
                Err(source) => return LoopEnd::Failed(PipelineError::Image { index, source }),
            };

            let image = GeneratedImage {
                id: format!("gen-{}-{}", Utc::now().timestamp_millis(), index),
                url: payload.data_uri(),
                prompt: composed.prompt,
            };
            session.cached_credits = (session.cached_credits - CREDITS_PER_IMAGE).max(0);
            if let Some(user_id) = session.user_id.as_ref() {
                self.outbox
                    .enqueue(SideEffect::Debit {
                        user_id: user_id.clone(),
                        amount: CREDITS_PER_IMAGE,
                        image_index: index,
                    })
                    .await;
            }
            result.images.push(image.clone());
            progress.emit(PipelineEvent::ImageReady { index, image });
            progress.progress(
                image_progress(index + 1, image_count),
                format!("Generated image {} of {}", index + 1, image_count),
            );

            if index + 1 < image_count {
                tokio::select! {
                    _ = self.pacer.pause(index) => {}
                    _ = cancel.cancelled() => return LoopEnd::Cancelled,
                }
            }
        }

        LoopEnd::Finished
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::llm::media::{ImagePayload, ReferenceImage};
    use crate::pipeline::cancel::CancelHandle;
    use crate::pipeline::errors::{BackendError, BackendErrorKind, ErrorClass, RATE_LIMIT_NOTICE};
    use crate::pipeline::ledger::StoreError;
    use crate::pipeline::outbox::{Outbox, OutboxSettings};
    use crate::pipeline::types::{GenerationMode, PhotoshootInputs};

    const PLAN_JSON: &str = r#"{
        "characterDescription": "woman with short red hair",
        "outfitDescription": "black trench coat",
        "locationDescription": "rainy harbor",
        "scenarios": [
            {"angle": "Close Up", "pose": "leaning", "action": "looking out", "lighting": "overcast"},
            {"angle": "Full Body", "pose": "walking", "action": "crossing the pier", "lighting": "dusk"}
        ]
    }"#;

    struct ScriptedLanguage {
        plan: Result<String, BackendError>,
        plan_calls: Mutex<usize>,
    }

    impl ScriptedLanguage {
        fn planning(plan: &str) -> Self {
            Self {
                plan: Ok(plan.to_string()),
                plan_calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedLanguage {
        async fn generate_structured(
            &self,
            _instructions: &str,
            _images: &[&ReferenceImage],
        ) -> Result<String, BackendError> {
            *self.plan_calls.lock() += 1;
            self.plan.clone()
        }

        async fn generate_text(&self, _prompt: &str) -> Result<String, BackendError> {
            Err(BackendError::new(BackendErrorKind::Transient, "offline"))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct ImageCall {
        model: String,
        subject: Option<String>,
        scene: Option<String>,
        prompt: String,
    }

    #[derive(Default)]
    struct ScriptedImages {
        fail_at: Option<(usize, BackendErrorKind)>,
        cancel_after_first: Mutex<Option<CancelHandle>>,
        calls: Mutex<Vec<ImageCall>>,
    }

    #[async_trait]
    impl ImageModel for ScriptedImages {
        async fn generate_image(
            &self,
            request: ImageRequest<'_>,
        ) -> Result<ImagePayload, BackendError> {
            let index = {
                let mut calls = self.calls.lock();
                calls.push(ImageCall {
                    model: request.model.name.clone(),
                    subject: request.subject.map(|image| image.id().to_string()),
                    scene: request.scene.map(|image| image.id().to_string()),
                    prompt: request.prompt.to_string(),
                });
                calls.len() - 1
            };
            if let Some((fail_index, kind)) = self.fail_at {
                if index == fail_index {
                    return Err(BackendError::new(kind, "RESOURCE_EXHAUSTED: quota").with_status(429));
                }
            }
            if index == 0 {
                if let Some(handle) = self.cancel_after_first.lock().take() {
                    handle.cancel();
                }
            }
            Ok(ImagePayload::new(vec![0x89, b'P', b'N', b'G'], Some("image/png")))
        }
    }

    #[derive(Default)]
    struct MemoryLedger {
        balance: Mutex<i64>,
        debits: Mutex<Vec<i64>>,
        checks: Mutex<usize>,
        unreachable: bool,
    }

    #[async_trait]
    impl CreditLedger for MemoryLedger {
        async fn credits(&self, user_id: &str) -> Result<i64, StoreError> {
            *self.checks.lock() += 1;
            if self.unreachable {
                return Err(StoreError::UnknownUser(user_id.to_string()));
            }
            Ok(*self.balance.lock())
        }

        async fn debit(&self, _user_id: &str, amount: i64) -> Result<bool, StoreError> {
            let mut balance = self.balance.lock();
            if *balance < amount {
                return Ok(false);
            }
            *balance -= amount;
            self.debits.lock().push(amount);
            Ok(true)
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        created: Mutex<usize>,
        updates: Mutex<Vec<StatusUpdate>>,
        reject_create: bool,
    }

    #[async_trait]
    impl GenerationStore for MemoryStore {
        async fn create(&self, generation: NewGeneration<'_>) -> Result<RecordId, StoreError> {
            if self.reject_create {
                return Err(StoreError::UnknownUser(generation.user_id.to_string()));
            }
            let mut created = self.created.lock();
            *created += 1;
            Ok(*created as RecordId)
        }

        async fn update_status(
            &self,
            _id: RecordId,
            update: StatusUpdate,
        ) -> Result<(), StoreError> {
            self.updates.lock().push(update);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingPacer {
        pauses: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Pacer for CountingPacer {
        async fn pause(&self, completed_index: usize) {
            self.pauses.lock().push(completed_index);
        }
    }

    struct Harness {
        language: Arc<ScriptedLanguage>,
        images: Arc<ScriptedImages>,
        ledger: Arc<MemoryLedger>,
        store: Arc<MemoryStore>,
        pacer: Arc<CountingPacer>,
        outbox: Outbox,
        orchestrator: GenerationOrchestrator,
    }

    fn harness(language: ScriptedLanguage, images: ScriptedImages, balance: i64) -> Harness {
        harness_with(
            language,
            images,
            MemoryLedger {
                balance: Mutex::new(balance),
                ..MemoryLedger::default()
            },
            MemoryStore::default(),
        )
    }

    fn harness_with(
        language: ScriptedLanguage,
        images: ScriptedImages,
        ledger: MemoryLedger,
        store: MemoryStore,
    ) -> Harness {
        let language = Arc::new(language);
        let images = Arc::new(images);
        let ledger = Arc::new(ledger);
        let store = Arc::new(store);
        let pacer = Arc::new(CountingPacer::default());
        let outbox = Outbox::spawn(
            ledger.clone(),
            store.clone(),
            OutboxSettings {
                max_attempts: 1,
                retry_delay: Duration::ZERO,
            },
        );
        let orchestrator = GenerationOrchestrator::new(
            language.clone(),
            images.clone(),
            ledger.clone(),
            store.clone(),
            pacer.clone(),
            outbox.handle(),
            PipelineSettings {
                image_model: ModelId::new("gemini-2.5-flash-image"),
                pro_image_model: ModelId::new("gemini-3-pro-image-preview"),
                enhance_prompts: true,
            },
        );
        Harness {
            language,
            images,
            ledger,
            store,
            pacer,
            outbox,
            orchestrator,
        }
    }

    fn photo(id: &str) -> ReferenceImage {
        ReferenceImage::from_parts(id, "image/jpeg", "aGVsbG8=")
    }

    fn request(subjects: &[&str], locations: &[&str], count: usize) -> GenerationRequest {
        let inputs = PhotoshootInputs {
            subject_photos: subjects.iter().map(|id| photo(id)).collect(),
            location_photos: locations.iter().map(|id| photo(id)).collect(),
            style_prompt: "editorial".to_string(),
            negative_prompt: "blurry".to_string(),
            ..PhotoshootInputs::default()
        };
        GenerationRequest::new(inputs, GenerationMode::Standard, count)
    }

    #[tokio::test]
    async fn round_robins_subject_photos_without_scene() {
        let h = harness(ScriptedLanguage::planning(PLAN_JSON), ScriptedImages::default(), 10);
        let mut session = Session::registered("alice", 10);
        let outcome = h
            .orchestrator
            .run(
                &mut session,
                &request(&["a", "b"], &[], 3),
                &ProgressReporter::silent(),
                &CancelToken::never(),
            )
            .await;

        assert_eq!(outcome.state(), PipelineState::Complete);
        let calls = h.images.calls.lock().clone();
        let subjects: Vec<_> = calls.iter().map(|c| c.subject.clone().unwrap()).collect();
        assert_eq!(subjects, vec!["a", "b", "a"]);
        assert!(calls.iter().all(|c| c.scene.is_none()));
        assert!(calls.iter().all(|c| c.model == "gemini-2.5-flash-image"));
        assert_eq!(h.pacer.pauses.lock().as_slice(), &[0, 1]);

        let result = outcome.result().unwrap();
        assert_eq!(result.images.len(), 3);
        assert!(result.images[0].id.starts_with("gen-"));
        assert!(result.images[2].id.ends_with("-2"));
        assert!(result.images[0].url.starts_with("data:image/png;base64,"));
        let ids: HashSet<_> = result.images.iter().map(|image| image.id.as_str()).collect();
        assert_eq!(ids.len(), result.images.len());
        assert_eq!(result.remaining_credits, 7);
        assert_eq!(session.cached_credits, 7);

        h.outbox.finish().await;
        assert_eq!(h.ledger.debits.lock().len(), 3);
        assert_eq!(*h.ledger.balance.lock(), 7);
        let statuses: Vec<_> = h.store.updates.lock().iter().map(|u| u.status).collect();
        assert_eq!(
            statuses,
            vec![GenerationStatus::Processing, GenerationStatus::Completed]
        );
    }

    #[tokio::test]
    async fn failure_mid_run_keeps_earlier_images_and_debits() {
        let images = ScriptedImages {
            fail_at: Some((2, BackendErrorKind::RateLimited)),
            ..ScriptedImages::default()
        };
        let h = harness(ScriptedLanguage::planning(PLAN_JSON), images, 10);
        let mut session = Session::registered("alice", 10);
        let (progress, mut events) = ProgressReporter::channel();
        let outcome = h
            .orchestrator
            .run(
                &mut session,
                &request(&["a"], &["loc"], 5),
                &progress,
                &CancelToken::never(),
            )
            .await;

        let GenerationOutcome::Failed { result, failure } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(result.images.len(), 2);
        assert_eq!(failure.class, ErrorClass::RateLimit);
        assert_eq!(failure.message, RATE_LIMIT_NOTICE);
        assert_eq!(h.images.calls.lock().len(), 3);
        assert_eq!(h.images.calls.lock()[0].scene.as_deref(), Some("loc"));

        h.outbox.finish().await;
        assert_eq!(h.ledger.debits.lock().len(), 2);
        let updates = h.store.updates.lock().clone();
        let last = updates.last().unwrap();
        assert_eq!(last.status, GenerationStatus::Failed);
        assert_eq!(last.result_count, Some(2));

        drop(progress);
        let mut states = Vec::new();
        while let Some(event) = events.recv().await {
            if let PipelineEvent::State(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                PipelineState::Analyzing,
                PipelineState::Generating,
                PipelineState::Error
            ]
        );
    }

    #[tokio::test]
    async fn insufficient_credits_contacts_no_backend() {
        let h = harness(ScriptedLanguage::planning(PLAN_JSON), ScriptedImages::default(), 2);
        let mut session = Session::registered("alice", 10);
        let outcome = h
            .orchestrator
            .run(
                &mut session,
                &request(&["a"], &[], 3),
                &ProgressReporter::silent(),
                &CancelToken::never(),
            )
            .await;

        assert!(matches!(
            outcome,
            GenerationOutcome::InsufficientCredits {
                required: 3,
                available: 2
            }
        ));
        assert_eq!(session.cached_credits, 2);
        assert_eq!(*h.language.plan_calls.lock(), 0);
        assert!(h.images.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn ledger_errors_fall_back_to_cached_balance() {
        let ledger = MemoryLedger {
            balance: Mutex::new(100),
            unreachable: true,
            ..MemoryLedger::default()
        };
        let h = harness_with(
            ScriptedLanguage::planning(PLAN_JSON),
            ScriptedImages::default(),
            ledger,
            MemoryStore::default(),
        );

        let mut session = Session::registered("alice", 1);
        let outcome = h
            .orchestrator
            .run(
                &mut session,
                &request(&["a"], &[], 2),
                &ProgressReporter::silent(),
                &CancelToken::never(),
            )
            .await;
        assert!(matches!(
            outcome,
            GenerationOutcome::InsufficientCredits {
                required: 2,
                available: 1
            }
        ));

        let mut session = Session::registered("alice", 3);
        let outcome = h
            .orchestrator
            .run(
                &mut session,
                &request(&["a"], &[], 2),
                &ProgressReporter::silent(),
                &CancelToken::never(),
            )
            .await;
        assert_eq!(outcome.state(), PipelineState::Complete);
        assert_eq!(session.cached_credits, 1);
        assert_eq!(*h.ledger.checks.lock(), 2);
    }

    #[tokio::test]
    async fn record_creation_failure_does_not_stop_the_run() {
        let store = MemoryStore {
            reject_create: true,
            ..MemoryStore::default()
        };
        let h = harness_with(
            ScriptedLanguage::planning(PLAN_JSON),
            ScriptedImages::default(),
            MemoryLedger {
                balance: Mutex::new(10),
                ..MemoryLedger::default()
            },
            store,
        );
        let mut session = Session::registered("alice", 10);
        let outcome = h
            .orchestrator
            .run(
                &mut session,
                &request(&["a"], &[], 2),
                &ProgressReporter::silent(),
                &CancelToken::never(),
            )
            .await;

        assert_eq!(outcome.state(), PipelineState::Complete);
        let result = outcome.result().unwrap();
        assert_eq!(result.images.len(), 2);
        assert!(result.record_id.is_none());
        h.outbox.finish().await;
        assert!(h.store.updates.lock().is_empty());
        assert_eq!(h.ledger.debits.lock().len(), 2);
    }

    #[tokio::test]
    async fn guest_sessions_use_cached_credits_only() {
        let h = harness(ScriptedLanguage::planning(PLAN_JSON), ScriptedImages::default(), 0);
        let mut session = Session::guest(2);
        let outcome = h
            .orchestrator
            .run(
                &mut session,
                &request(&["a"], &[], 2),
                &ProgressReporter::silent(),
                &CancelToken::never(),
            )
            .await;

        assert_eq!(outcome.state(), PipelineState::Complete);
        assert_eq!(session.cached_credits, 0);
        assert_eq!(*h.ledger.checks.lock(), 0);
        assert_eq!(*h.store.created.lock(), 0);
        h.outbox.finish().await;
        assert!(h.ledger.debits.lock().is_empty());
    }

    #[tokio::test]
    async fn replicate_without_reference_photos_is_rejected() {
        let h = harness(ScriptedLanguage::planning(PLAN_JSON), ScriptedImages::default(), 10);
        let mut session = Session::registered("alice", 10);
        let mut req = request(&["a"], &[], 2);
        req.mode = GenerationMode::Replicate;
        let outcome = h
            .orchestrator
            .run(
                &mut session,
                &req,
                &ProgressReporter::silent(),
                &CancelToken::never(),
            )
            .await;

        assert!(matches!(
            outcome,
            GenerationOutcome::Rejected(ValidationError::MissingReferencePhotos)
        ));
        assert_eq!(*h.language.plan_calls.lock(), 0);
    }

    #[tokio::test]
    async fn malformed_plan_ends_in_error_without_image_calls() {
        let h = harness(
            ScriptedLanguage::planning("Sure! Here is your plan."),
            ScriptedImages::default(),
            10,
        );
        let mut session = Session::registered("alice", 10);
        let outcome = h
            .orchestrator
            .run(
                &mut session,
                &request(&["a"], &[], 2),
                &ProgressReporter::silent(),
                &CancelToken::never(),
            )
            .await;

        let GenerationOutcome::Failed { result, failure } = outcome else {
            panic!("expected failure");
        };
        assert!(result.plan.is_none());
        assert_eq!(failure.kind, BackendErrorKind::Malformed);
        assert!(failure.message.starts_with("Failed to plan photoshoot"));
        assert!(h.images.calls.lock().is_empty());
        assert_eq!(*h.store.created.lock(), 0);
    }

    #[tokio::test]
    async fn pro_flag_selects_pro_model_and_prompts_fall_back() {
        let h = harness(ScriptedLanguage::planning(PLAN_JSON), ScriptedImages::default(), 10);
        let mut session = Session::registered("alice", 10);
        let mut req = request(&["a"], &[], 1);
        req.use_pro_model = true;
        h.orchestrator
            .run(
                &mut session,
                &req,
                &ProgressReporter::silent(),
                &CancelToken::never(),
            )
            .await;

        let calls = h.images.calls.lock().clone();
        assert_eq!(calls[0].model, "gemini-3-pro-image-preview");
        assert!(calls[0]
            .prompt
            .starts_with("Photo of woman with short red hair wearing black trench coat"));
        assert!(h.pacer.pauses.lock().is_empty());
    }

    #[tokio::test]
    async fn cancellation_keeps_produced_images() {
        let (handle, token) = CancelToken::pair();
        let images = ScriptedImages {
            cancel_after_first: Mutex::new(Some(handle)),
            ..ScriptedImages::default()
        };
        let h = harness(ScriptedLanguage::planning(PLAN_JSON), images, 10);
        let mut session = Session::registered("alice", 10);
        let outcome = h
            .orchestrator
            .run(
                &mut session,
                &request(&["a"], &[], 4),
                &ProgressReporter::silent(),
                &token,
            )
            .await;

        let GenerationOutcome::Cancelled(result) = outcome else {
            panic!("expected cancellation");
        };
        assert_eq!(result.images.len(), 1);
        assert_eq!(h.images.calls.lock().len(), 1);
        h.outbox.finish().await;
        assert_eq!(h.ledger.debits.lock().len(), 1);
        let last = h.store.updates.lock().last().cloned().unwrap();
        assert_eq!(last.status, GenerationStatus::Cancelled);
        assert_eq!(last.result_count, Some(1));
    }
}
