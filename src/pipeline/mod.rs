pub mod backend;
pub mod cancel;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod orchestrator;
pub mod outbox;
pub mod pacing;
pub mod planner;
pub mod prompt;
pub mod session;
pub mod types;

pub use cancel::CancelToken;
pub use events::{PipelineEvent, ProgressReporter};
pub use orchestrator::{GenerationOrchestrator, GenerationOutcome};
pub use outbox::Outbox;
pub use session::Session;
