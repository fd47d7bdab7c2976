use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use tracing::warn;
use url::Url;

use crate::llm::gemini::GeminiSettings;
use crate::pipeline::outbox::OutboxSettings;
use crate::pipeline::orchestrator::PipelineSettings;
use crate::pipeline::types::{ModelId, DEFAULT_ASPECT_RATIO};

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub database_url: String,
    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub gemini_plan_model: String,
    pub gemini_prompt_model: String,
    pub gemini_image_model: String,
    pub gemini_pro_image_model: String,
    pub gemini_request_timeout_seconds: u64,
    pub gemini_transport_retries: usize,
    pub default_aspect_ratio: String,
    pub pacing_delay_ms: u64,
    pub enhance_prompts: bool,
    pub outbox_max_attempts: usize,
    pub outbox_retry_delay_ms: u64,
    pub guest_credits: i64,
    pub reference_max_side: u32,
    pub output_dir: PathBuf,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|value| value.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    match env::var(name) {
        Ok(value) => value.trim().parse::<u64>().unwrap_or_else(|_| {
            warn!("Invalid {} value '{}', using {}", name, value, default);
            default
        }),
        Err(_) => default,
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    env_u64(name, default as u64) as usize
}

fn normalize_database_url(value: String) -> String {
    if value.starts_with("sqlite+aiosqlite://") {
        return value.replacen("sqlite+aiosqlite://", "sqlite://", 1);
    }
    value
}

impl Config {
    pub fn load() -> Result<Self> {
        let gemini_base_url = env_string(
            "GEMINI_BASE_URL",
            "https://generativelanguage.googleapis.com/v1beta",
        );
        Url::parse(&gemini_base_url)
            .map_err(|err| anyhow!("GEMINI_BASE_URL '{}' is not a valid URL: {}", gemini_base_url, err))?;

        let reference_max_side = u32::try_from(env_u64("REFERENCE_MAX_SIDE", 2048))
            .map_err(|_| anyhow!("REFERENCE_MAX_SIDE is out of range"))?;
        let guest_credits = i64::try_from(env_u64("GUEST_CREDITS", 0))
            .map_err(|_| anyhow!("GUEST_CREDITS is out of range"))?;

        Ok(Config {
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            database_url: normalize_database_url(env_string(
                "DATABASE_URL",
                "sqlite://photoshoot.db",
            )),
            gemini_api_key: env_string("GEMINI_API_KEY", ""),
            gemini_base_url,
            gemini_plan_model: env_string("GEMINI_PLAN_MODEL", "gemini-2.5-flash"),
            gemini_prompt_model: env_string("GEMINI_PROMPT_MODEL", "gemini-2.5-flash"),
            gemini_image_model: env_string("GEMINI_IMAGE_MODEL", "gemini-2.5-flash-image"),
            gemini_pro_image_model: env_string(
                "GEMINI_PRO_IMAGE_MODEL",
                "gemini-3-pro-image-preview",
            ),
            gemini_request_timeout_seconds: env_u64("GEMINI_REQUEST_TIMEOUT_SECONDS", 120).max(1),
            gemini_transport_retries: env_usize("GEMINI_TRANSPORT_RETRIES", 1),
            default_aspect_ratio: env_string("DEFAULT_ASPECT_RATIO", DEFAULT_ASPECT_RATIO),
            pacing_delay_ms: env_u64("PACING_DELAY_MS", 2000),
            enhance_prompts: env_bool("ENHANCE_PROMPTS", true),
            outbox_max_attempts: env_usize("OUTBOX_MAX_ATTEMPTS", 3).max(1),
            outbox_retry_delay_ms: env_u64("OUTBOX_RETRY_DELAY_MS", 500),
            guest_credits,
            reference_max_side,
            output_dir: PathBuf::from(env_string("OUTPUT_DIR", "photoshoots")),
        })
    }

    pub fn gemini_settings(&self) -> GeminiSettings {
        GeminiSettings {
            api_key: self.gemini_api_key.clone(),
            base_url: self.gemini_base_url.clone(),
            plan_model: self.gemini_plan_model.clone(),
            prompt_model: self.gemini_prompt_model.clone(),
            request_timeout: Duration::from_secs(self.gemini_request_timeout_seconds),
            transport_retries: self.gemini_transport_retries,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            image_model: ModelId::new(self.gemini_image_model.clone()),
            pro_image_model: ModelId::new(self.gemini_pro_image_model.clone()),
            enhance_prompts: self.enhance_prompts,
        }
    }

    pub fn outbox_settings(&self) -> OutboxSettings {
        OutboxSettings {
            max_attempts: self.outbox_max_attempts,
            retry_delay: Duration::from_millis(self.outbox_retry_delay_ms),
        }
    }

    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }
}
