use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::info;

pub const TIMING_TARGET: &str = "studio.timing";

/// Wall-clock record of one photoshoot run, written to the timing log.
#[derive(Debug)]
pub struct GenerationTimer {
    mode: String,
    user_id: Option<String>,
    image_count: usize,
    started_at: DateTime<Utc>,
    started_perf: Instant,
    status: String,
    detail: Option<String>,
    produced: usize,
    completed: bool,
}

impl GenerationTimer {
    pub fn new(mode: &str, user_id: Option<&str>, image_count: usize) -> Self {
        GenerationTimer {
            mode: mode.to_string(),
            user_id: user_id.map(str::to_string),
            image_count,
            started_at: Utc::now(),
            started_perf: Instant::now(),
            status: "success".to_string(),
            detail: None,
            produced: 0,
            completed: false,
        }
    }

    pub fn log_started(&self) {
        info!(
            target: TIMING_TARGET,
            "event=generation_started mode={} user_id={:?} image_count={} started_at={}",
            self.mode,
            self.user_id,
            self.image_count,
            self.started_at.to_rfc3339()
        );
    }

    pub fn mark_status(&mut self, status: &str, detail: Option<String>) {
        self.status = status.to_string();
        self.detail = detail.map(|value| value.replace('\n', " "));
    }

    pub fn set_produced(&mut self, produced: usize) {
        self.produced = produced;
    }

    pub fn log_completed(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        let completed_at = Utc::now();
        let duration = self.started_perf.elapsed().as_secs_f64();
        info!(
            target: TIMING_TARGET,
            "event=generation_completed mode={} user_id={:?} started_at={} completed_at={} duration_s={:.3} images={}/{} status={} detail={}",
            self.mode,
            self.user_id,
            self.started_at.to_rfc3339(),
            completed_at.to_rfc3339(),
            duration,
            self.produced,
            self.image_count,
            self.status,
            self.detail.clone().unwrap_or_default()
        );
    }
}

impl Drop for GenerationTimer {
    fn drop(&mut self) {
        if !self.completed {
            self.mark_status("abandoned", None);
            self.log_completed();
        }
    }
}

pub fn start_generation_timer(
    mode: &str,
    user_id: Option<&str>,
    image_count: usize,
) -> GenerationTimer {
    let timer = GenerationTimer::new(mode, user_id, image_count);
    timer.log_started();
    timer
}

pub fn complete_generation_timer(
    timer: &mut GenerationTimer,
    status: &str,
    produced: usize,
    detail: Option<String>,
) {
    timer.set_produced(produced);
    timer.mark_status(status, detail);
    timer.log_completed();
}

/// Wraps one backend call with request/response lines on the timing target.
pub async fn log_llm_timing<T, E, F, Fut>(
    provider: &str,
    model: &str,
    operation: &str,
    metadata: Option<JsonValue>,
    call: F,
) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let started_at = Utc::now();
    let started_perf = Instant::now();
    let metadata_text = metadata
        .as_ref()
        .map(|value| value.to_string())
        .unwrap_or_else(|| "{}".to_string());
    info!(
        target: TIMING_TARGET,
        "event=llm_request provider={} model={} operation={} started_at={} metadata={}",
        provider,
        model,
        operation,
        started_at.to_rfc3339(),
        metadata_text
    );

    let result = call().await;
    let status = if result.is_ok() { "success" } else { "error" };

    let completed_at = Utc::now();
    let duration = started_perf.elapsed().as_secs_f64();
    info!(
        target: TIMING_TARGET,
        "event=llm_response provider={} model={} operation={} completed_at={} duration_s={:.3} status={} metadata={}",
        provider,
        model,
        operation,
        completed_at.to_rfc3339(),
        duration,
        status,
        metadata_text
    );

    result
}
