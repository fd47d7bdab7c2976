use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::llm::media::ReferenceImage;
use crate::pipeline::types::{
    GenerationMode, GenerationRequest, PhotoshootInputs, Priority, StyleAddon,
    DEFAULT_IMAGE_COUNT, DEFAULT_NEGATIVE_PROMPT, DEFAULT_STYLE_PROMPT,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AddonManifest {
    photos: Vec<PathBuf>,
    text: String,
}

/// On-disk description of one photoshoot. Photo paths are relative to the
/// manifest file.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RequestManifest {
    subject_photos: Vec<PathBuf>,
    location_photos: Vec<PathBuf>,
    location_text: String,
    style_prompt: String,
    negative_prompt: String,
    tattoos: AddonManifest,
    hairstyle: AddonManifest,
    makeup: AddonManifest,
    outfit: AddonManifest,
    pose: AddonManifest,
    camera_angles: Vec<String>,
    selfie: bool,
    replicate: bool,
    image_count: usize,
    aspect_ratio: Option<String>,
    use_pro_model: bool,
    priority: Priority,
}

impl Default for RequestManifest {
    fn default() -> Self {
        Self {
            subject_photos: Vec::new(),
            location_photos: Vec::new(),
            location_text: String::new(),
            style_prompt: DEFAULT_STYLE_PROMPT.to_string(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            tattoos: AddonManifest::default(),
            hairstyle: AddonManifest::default(),
            makeup: AddonManifest::default(),
            outfit: AddonManifest::default(),
            pose: AddonManifest::default(),
            camera_angles: Vec::new(),
            selfie: false,
            replicate: false,
            image_count: DEFAULT_IMAGE_COUNT,
            aspect_ratio: None,
            use_pro_model: false,
            priority: Priority::Normal,
        }
    }
}

async fn load_photos(base: &Path, paths: &[PathBuf], max_side: u32) -> Result<Vec<ReferenceImage>> {
    let mut photos = Vec::with_capacity(paths.len());
    for path in paths {
        let resolved = if path.is_absolute() {
            path.clone()
        } else {
            base.join(path)
        };
        let photo = ReferenceImage::from_path(&resolved, max_side)
            .await
            .with_context(|| format!("Failed to load photo {}", resolved.display()))?;
        photos.push(photo);
    }
    Ok(photos)
}

async fn load_addon(base: &Path, addon: &AddonManifest, max_side: u32) -> Result<StyleAddon> {
    Ok(StyleAddon {
        photos: load_photos(base, &addon.photos, max_side).await?,
        text: addon.text.clone(),
    })
}

/// Reads a request manifest and encodes every referenced photo.
pub async fn load_request(
    path: &Path,
    default_aspect_ratio: &str,
    max_side: u32,
) -> Result<GenerationRequest> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read request manifest {}", path.display()))?;
    let manifest: RequestManifest = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid request manifest {}", path.display()))?;

    let mode = GenerationMode::from_flags(manifest.selfie, manifest.replicate)
        .map_err(|err| anyhow!("{}", err))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let inputs = PhotoshootInputs {
        subject_photos: load_photos(base, &manifest.subject_photos, max_side).await?,
        location_photos: load_photos(base, &manifest.location_photos, max_side).await?,
        location_text: manifest.location_text,
        style_prompt: manifest.style_prompt,
        negative_prompt: manifest.negative_prompt,
        tattoos: load_addon(base, &manifest.tattoos, max_side).await?,
        hairstyle: load_addon(base, &manifest.hairstyle, max_side).await?,
        makeup: load_addon(base, &manifest.makeup, max_side).await?,
        outfit: load_addon(base, &manifest.outfit, max_side).await?,
        pose: load_addon(base, &manifest.pose, max_side).await?,
        camera_angles: manifest.camera_angles,
    };

    let mut request = GenerationRequest::new(inputs, mode, manifest.image_count);
    request.aspect_ratio = manifest
        .aspect_ratio
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default_aspect_ratio.to_string());
    request.use_pro_model = manifest.use_pro_model;
    request.priority = manifest.priority;
    Ok(request)
}
