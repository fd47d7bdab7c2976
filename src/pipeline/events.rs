use tokio::sync::mpsc;

use crate::pipeline::types::{GeneratedImage, PhotoshootPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Analyzing,
    Generating,
    Complete,
    Error,
    Cancelled,
}

impl PipelineState {
    pub const fn as_str(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Analyzing => "analyzing",
            PipelineState::Generating => "generating",
            PipelineState::Complete => "complete",
            PipelineState::Error => "error",
            PipelineState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    State(PipelineState),
    Progress { percent: f32, message: String },
    PlanReady(PhotoshootPlan),
    ImageReady { index: usize, image: GeneratedImage },
}

pub const PLANNING_PROGRESS: f32 = 10.0;
pub const PLANNING_BUDGET: f32 = 20.0;

/// Share of the progress bar reached once `completed` of `total` images exist.
pub fn image_progress(completed: usize, total: usize) -> f32 {
    if total == 0 {
        return 100.0;
    }
    PLANNING_BUDGET + (completed as f32 / total as f32) * (100.0 - PLANNING_BUDGET)
}

/// Optional sink for incremental progress. A dropped receiver is ignored.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    sender: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl ProgressReporter {
    pub fn new(sender: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }

    #[cfg(test)]
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }

    pub fn state(&self, state: PipelineState) {
        self.emit(PipelineEvent::State(state));
    }

    pub fn progress(&self, percent: f32, message: impl Into<String>) {
        self.emit(PipelineEvent::Progress {
            percent,
            message: message.into(),
        });
    }
}
