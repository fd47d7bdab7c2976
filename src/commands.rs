use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::CONFIG;
use crate::db::database::Database;
use crate::llm::gemini::GeminiClient;
use crate::llm::media::{decode_data_uri, ImagePayload};
use crate::pipeline::ledger::StoreError;
use crate::pipeline::pacing::{FixedDelayPacer, NoPacing, Pacer};
use crate::pipeline::types::{PhotoshootPlan, CAMERA_ANGLE_PRESETS};
use crate::pipeline::{
    CancelToken, GenerationOrchestrator, GenerationOutcome, Outbox, PipelineEvent,
    ProgressReporter, Session,
};
use crate::request::load_request;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    pub request_path: PathBuf,
    pub user_id: Option<String>,
    pub guest_credits: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
struct SavedImage {
    index: usize,
    id: String,
    file: String,
    prompt: String,
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, body).await?;
    Ok(())
}

async fn save_image(run_dir: &Path, index: usize, id: &str, url: &str) -> Result<String> {
    let (mime_type, bytes) =
        decode_data_uri(url).ok_or_else(|| anyhow!("Image {id} is not an inline data URI"))?;
    let payload = ImagePayload::new(bytes, Some(&mime_type));
    let file = format!("{:02}-{}.{}", index + 1, id, payload.file_extension());
    tokio::fs::write(run_dir.join(&file), &payload.bytes).await?;
    Ok(file)
}

/// Drains pipeline events, saving each image and the plan as they arrive.
async fn write_events(
    mut events: mpsc::UnboundedReceiver<PipelineEvent>,
    run_dir: PathBuf,
) -> Vec<SavedImage> {
    let mut saved = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::State(state) => info!("Photoshoot state: {}", state.as_str()),
            PipelineEvent::Progress { percent, message } => {
                info!("[{:>5.1}%] {}", percent, message);
            }
            PipelineEvent::PlanReady(plan) => {
                if let Err(err) = write_json(&run_dir.join("plan.json"), &plan).await {
                    warn!("Failed to write plan.json: {err:#}");
                }
            }
            PipelineEvent::ImageReady { index, image } => {
                match save_image(&run_dir, index, &image.id, &image.url).await {
                    Ok(file) => {
                        info!("Saved image {} to {}", index + 1, run_dir.join(&file).display());
                        saved.push(SavedImage {
                            index,
                            id: image.id,
                            file,
                            prompt: image.prompt,
                        });
                    }
                    Err(err) => warn!("Failed to save image {}: {err:#}", index + 1),
                }
            }
        }
    }
    saved
}

async fn open_session(db: &Database, args: &RunArgs) -> Result<Session> {
    let Some(user_id) = args.user_id.as_deref() else {
        return Ok(Session::guest(
            args.guest_credits.unwrap_or(CONFIG.guest_credits),
        ));
    };
    match db.balance(user_id).await {
        Ok(balance) => Ok(Session::registered(user_id, balance)),
        Err(StoreError::UnknownUser(_)) => Err(anyhow!(
            "Unknown user {user_id}; grant credits first with `credits --user {user_id} --grant <n>`"
        )),
        Err(err) => Err(err.into()),
    }
}

fn manifest_for(
    outcome: &GenerationOutcome,
    saved: &[SavedImage],
    plan: Option<&PhotoshootPlan>,
) -> serde_json::Value {
    let result = outcome.result();
    let error = match outcome {
        GenerationOutcome::Failed { failure, .. } => Some(json!({
            "message": failure.message,
            "detail": failure.detail,
            "class": failure.class.as_str(),
            "kind": failure.kind.as_str(),
            "requires_reauth": failure.requires_reauth,
        })),
        _ => None,
    };
    json!({
        "state": outcome.state().as_str(),
        "created_at": Utc::now().to_rfc3339(),
        "record_id": result.and_then(|result| result.record_id),
        "remaining_credits": result.map(|result| result.remaining_credits),
        "scenarios": plan.map(|plan| plan.scenarios.len()),
        "images": saved,
        "error": error,
    })
}

pub async fn run_photoshoot(args: RunArgs) -> Result<()> {
    if CONFIG.gemini_api_key.trim().is_empty() {
        return Err(anyhow!("GEMINI_API_KEY is required for run"));
    }

    let request = load_request(
        &args.request_path,
        &CONFIG.default_aspect_ratio,
        CONFIG.reference_max_side,
    )
    .await?;
    let db = Arc::new(Database::init(&CONFIG.database_url).await?);
    let mut session = open_session(&db, &args).await?;
    if session.is_guest() {
        info!("Guest session with {} credit(s)", session.cached_credits);
    }

    let gemini = Arc::new(GeminiClient::new(CONFIG.gemini_settings())?);
    let outbox = Outbox::spawn(db.clone(), db.clone(), CONFIG.outbox_settings());
    let pacer: Arc<dyn Pacer> = if CONFIG.pacing_delay_ms == 0 {
        Arc::new(NoPacing)
    } else {
        Arc::new(FixedDelayPacer::new(CONFIG.pacing_delay()))
    };
    let orchestrator = GenerationOrchestrator::new(
        gemini.clone(),
        gemini,
        db.clone(),
        db.clone(),
        pacer,
        outbox.handle(),
        CONFIG.pipeline_settings(),
    );

    let run_dir = CONFIG
        .output_dir
        .join(Utc::now().format("%Y%m%d-%H%M%S").to_string());
    tokio::fs::create_dir_all(&run_dir).await?;
    info!(
        "Starting {} photoshoot of {} image(s), output {}",
        request.mode.as_str(),
        request.image_count,
        run_dir.display()
    );

    let (progress, events) = ProgressReporter::channel();
    let writer = tokio::spawn(write_events(events, run_dir.clone()));

    let (cancel_handle, cancel) = CancelToken::pair();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling photoshoot");
            cancel_handle.cancel();
        }
    });

    let outcome = orchestrator
        .run(&mut session, &request, &progress, &cancel)
        .await;
    drop(progress);
    ctrl_c.abort();

    let saved = match writer.await {
        Ok(saved) => saved,
        Err(err) => {
            warn!("Image writer task failed: {err}");
            Vec::new()
        }
    };

    let report = outbox.handle().flush().await;
    for failure in &report.failures {
        warn!(
            "Side effect not applied after {} attempt(s): {:?} ({})",
            failure.attempts, failure.effect, failure.error
        );
    }
    if let Some(record_id) = outcome.result().and_then(|result| result.record_id) {
        match db.generation(record_id).await {
            Ok(Some(row)) => info!("Generation record #{} is {}", row.id, row.status),
            Ok(None) => warn!("Generation record #{} disappeared", record_id),
            Err(err) => warn!("Could not read generation record #{}: {}", record_id, err),
        }
    }
    outbox.finish().await;
    db.close().await;

    let plan = outcome.result().and_then(|result| result.plan.as_ref());
    write_json(
        &run_dir.join("manifest.json"),
        &manifest_for(&outcome, &saved, plan),
    )
    .await?;

    match outcome {
        GenerationOutcome::Completed(result) => {
            println!(
                "Saved {} image(s) to {} ({} credit(s) left)",
                saved.len(),
                run_dir.display(),
                result.remaining_credits
            );
            Ok(())
        }
        GenerationOutcome::Cancelled(result) => {
            println!(
                "Cancelled after {} image(s); saved to {}",
                result.images.len(),
                run_dir.display()
            );
            Ok(())
        }
        GenerationOutcome::Failed { result, failure } => {
            if !result.images.is_empty() {
                println!(
                    "Kept {} image(s) in {} before the failure",
                    result.images.len(),
                    run_dir.display()
                );
            }
            if failure.requires_reauth {
                Err(anyhow!("{} (check GEMINI_API_KEY)", failure.message))
            } else {
                Err(anyhow!(failure.message))
            }
        }
        GenerationOutcome::Rejected(err) => Err(err.into()),
        GenerationOutcome::InsufficientCredits {
            required,
            available,
        } => Err(anyhow!(
            "Not enough credits: {required} needed, {available} available"
        )),
    }
}

pub async fn show_credits(user_id: &str, grant: Option<i64>) -> Result<()> {
    let db = Database::init(&CONFIG.database_url).await?;
    let balance = match grant {
        Some(amount) if amount <= 0 => {
            return Err(anyhow!("--grant must be a positive number of credits"));
        }
        Some(amount) => db.grant_credits(user_id, amount).await?,
        None => db.balance(user_id).await?,
    };
    println!("{user_id}: {balance} credit(s)");
    db.close().await;
    Ok(())
}

pub async fn show_history(user_id: &str, limit: i64) -> Result<()> {
    let db = Database::init(&CONFIG.database_url).await?;
    let rows = db.recent_generations(user_id, limit).await?;
    if rows.is_empty() {
        println!("No generations recorded for {user_id}");
    }
    for row in rows {
        println!(
            "#{} {} {} {} {}/{} image(s) queued {}{}",
            row.id,
            row.mode,
            row.quality,
            row.status_label(),
            row.result_count.unwrap_or(0),
            row.image_count,
            row.queued_at.to_rfc3339(),
            row.error_message
                .as_ref()
                .map(|message| format!(" error: {message}"))
                .unwrap_or_default()
        );
    }
    db.close().await;
    Ok(())
}

pub fn print_angles() {
    for angle in CAMERA_ANGLE_PRESETS {
        println!("{angle}");
    }
}
