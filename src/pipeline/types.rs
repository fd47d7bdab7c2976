use serde::{Deserialize, Serialize};

use crate::llm::media::ReferenceImage;
use crate::pipeline::errors::ValidationError;

pub const DEFAULT_IMAGE_COUNT: usize = 5;
pub const MAX_IMAGE_COUNT: usize = 10;
pub const MAX_REFERENCE_PHOTOS: usize = 10;
pub const DEFAULT_ASPECT_RATIO: &str = "3:4";
pub const DEFAULT_STYLE_PROMPT: &str = "Cinematic, warm lighting, professional photography";
pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "Blurry, low quality, distorted face, bad anatomy, cartoon, drawing";

pub const CAMERA_ANGLE_PRESETS: &[&str] = &[
    "Extreme Close Up",
    "Close Up",
    "Front View",
    "Studio Portrait",
    "Home Lifestyle",
    "Street Outdoor",
    "Full Body",
    "Face Close-up",
    "Low angle",
    "High angle",
    "Side profile",
];

/// One shot of the photoshoot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub angle: String,
    #[serde(default)]
    pub pose: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub lighting: String,
}

/// Structured result of the planning call, shared by every image of a run.
///
/// `scenarios` is not guaranteed to match the requested image count; always
/// go through [`PhotoshootPlan::scenario`] which wraps the index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoshootPlan {
    #[serde(default)]
    pub character_description: String,
    #[serde(default)]
    pub outfit_description: String,
    #[serde(default)]
    pub location_description: String,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
}

impl PhotoshootPlan {
    /// Returns the wrapped index and the scenario it points at.
    pub fn scenario(&self, index: usize) -> Option<(usize, &Scenario)> {
        if self.scenarios.is_empty() {
            return None;
        }
        let wrapped = index % self.scenarios.len();
        Some((wrapped, &self.scenarios[wrapped]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub id: String,
    pub url: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    #[default]
    #[serde(alias = "photoshoot")]
    Standard,
    Selfie,
    Replicate,
}

impl GenerationMode {
    pub fn from_flags(selfie: bool, replicate: bool) -> Result<Self, ValidationError> {
        match (selfie, replicate) {
            (true, true) => Err(ValidationError::ConflictingModes),
            (true, false) => Ok(GenerationMode::Selfie),
            (false, true) => Ok(GenerationMode::Replicate),
            (false, false) => Ok(GenerationMode::Standard),
        }
    }

    /// Name stored on generation records.
    pub const fn as_str(self) -> &'static str {
        match self {
            GenerationMode::Standard => "photoshoot",
            GenerationMode::Selfie => "selfie",
            GenerationMode::Replicate => "replicate",
        }
    }

    pub fn is_replicate(self) -> bool {
        matches!(self, GenerationMode::Replicate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Sd,
    Hd,
}

impl Quality {
    pub const fn as_str(self) -> &'static str {
        match self {
            Quality::Sd => "sd",
            Quality::Hd => "hd",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
    Max,
}

impl Priority {
    pub const fn as_str(self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Max => "max",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl GenerationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            GenerationStatus::Queued => "queued",
            GenerationStatus::Processing => "processing",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
            GenerationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(GenerationStatus::Queued),
            "processing" => Some(GenerationStatus::Processing),
            "completed" => Some(GenerationStatus::Completed),
            "failed" => Some(GenerationStatus::Failed),
            "cancelled" => Some(GenerationStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GenerationStatus::Completed | GenerationStatus::Failed | GenerationStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// `generateContent` models that accept inline reference images.
    Conversational,
    /// `predict` models that only take a prompt and sampling parameters.
    TextToImage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelId {
    pub name: String,
    pub family: ModelFamily,
}

impl ModelId {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let family = if name.trim().starts_with("gemini-") {
            ModelFamily::Conversational
        } else {
            ModelFamily::TextToImage
        };
        Self { name, family }
    }
}

/// Optional add-on: reference photos plus a free-text description.
#[derive(Debug, Clone, Default)]
pub struct StyleAddon {
    pub photos: Vec<ReferenceImage>,
    pub text: String,
}

impl StyleAddon {
    pub fn has_photos(&self) -> bool {
        !self.photos.is_empty()
    }

    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_photos() && !self.has_text()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PhotoshootInputs {
    pub subject_photos: Vec<ReferenceImage>,
    pub location_photos: Vec<ReferenceImage>,
    pub location_text: String,
    pub style_prompt: String,
    pub negative_prompt: String,
    pub tattoos: StyleAddon,
    pub hairstyle: StyleAddon,
    pub makeup: StyleAddon,
    pub outfit: StyleAddon,
    pub pose: StyleAddon,
    pub camera_angles: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub inputs: PhotoshootInputs,
    pub mode: GenerationMode,
    pub image_count: usize,
    pub aspect_ratio: String,
    pub use_pro_model: bool,
    pub priority: Priority,
}

impl GenerationRequest {
    pub fn new(inputs: PhotoshootInputs, mode: GenerationMode, image_count: usize) -> Self {
        Self {
            inputs,
            mode,
            image_count,
            aspect_ratio: DEFAULT_ASPECT_RATIO.to_string(),
            use_pro_model: false,
            priority: Priority::Normal,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let inputs = &self.inputs;
        if inputs.subject_photos.is_empty() {
            return Err(ValidationError::MissingSubjectPhotos);
        }
        if self.mode.is_replicate() && inputs.location_photos.is_empty() {
            return Err(ValidationError::MissingReferencePhotos);
        }
        if self.image_count == 0 || self.image_count > MAX_IMAGE_COUNT {
            return Err(ValidationError::ImageCountOutOfRange {
                requested: self.image_count,
            });
        }
        let photo_sets = [
            ("subject", inputs.subject_photos.len()),
            ("location", inputs.location_photos.len()),
            ("tattoo", inputs.tattoos.photos.len()),
            ("hairstyle", inputs.hairstyle.photos.len()),
            ("makeup", inputs.makeup.photos.len()),
            ("outfit", inputs.outfit.photos.len()),
            ("pose", inputs.pose.photos.len()),
        ];
        for (field, count) in photo_sets {
            if count > MAX_REFERENCE_PHOTOS {
                return Err(ValidationError::TooManyPhotos { field, count });
            }
        }
        Ok(())
    }

    pub fn quality(&self) -> Quality {
        if self.use_pro_model {
            Quality::Hd
        } else {
            Quality::Sd
        }
    }

    /// Inputs as the planner should see them. Pose add-ons and camera angles
    /// have no meaning outside the standard mode.
    pub fn planning_inputs(&self) -> PhotoshootInputs {
        let mut inputs = self.inputs.clone();
        if !matches!(self.mode, GenerationMode::Standard) {
            inputs.pose = StyleAddon::default();
            inputs.camera_angles.clear();
        }
        inputs
    }
}
