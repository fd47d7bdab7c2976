use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::llm::media::ReferenceImage;
use crate::pipeline::backend::LanguageModel;
use crate::pipeline::errors::PlanError;
use crate::pipeline::types::{GenerationMode, PhotoshootInputs, PhotoshootPlan};

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z]*\s*(.*?)\s*```$").expect("code fence pattern is valid")
});

const PLAN_SHAPE: &str = r#"{
  "characterDescription": "...",
  "outfitDescription": "...",
  "locationDescription": "...",
  "scenarios": [
    { "angle": "...", "pose": "...", "action": "...", "lighting": "..." }
  ]
}"#;

fn replicate_instructions(image_count: usize) -> String {
    format!(
        r#"You are an AI photography assistant performing a subject replacement.
You receive "User Photos" (the person) followed by "Location/Reference Photos" (the scenes).

Goal: plan shots that recreate the Location/Reference Photos exactly (pose, composition, lighting, background) with the person from the User Photos in place of the original subject.

1. Describe the person in the User Photos: physique, facial features, tattoos.
2. Treat every Location/Reference Photo as an exact scene to recreate.
3. Produce {image_count} scenarios. Map the reference photos onto the scenarios; when there are fewer references than scenarios, describe close variations of them. Angle, pose and action must match what the reference photos show.

Return ONLY one JSON object with this shape:
{shape}
"characterDescription" describes the person from the User Photos, "outfitDescription" the outfit worn in the reference scenes, "locationDescription" the reference background."#,
        shape = PLAN_SHAPE,
    )
}

fn selfie_instructions(inputs: &PhotoshootInputs, image_count: usize) -> String {
    format!(
        r#"You are planning a {image_count}-image selfie series and must answer with a JSON plan.

1. Subject and style: from the user photos, the general prompt ("{style}") and any style add-ons (hairstyle, makeup, outfit, tattoos), describe the person and one consistent look used in every selfie.
2. Background: describe a setting from the location photos and location text ("{location}").
3. Scenarios: design {image_count} selfie scenarios. Every "angle" is a typical selfie angle (high-angle selfie, mirror selfie, arm's-length selfie); "pose" and "action" are natural for someone holding the camera.

Return ONLY one JSON object with this shape:
{shape}
"characterDescription" includes tattoos, "outfitDescription" covers outfit, hairstyle and makeup."#,
        style = inputs.style_prompt.trim(),
        location = inputs.location_text.trim(),
        shape = PLAN_SHAPE,
    )
}

fn standard_instructions(inputs: &PhotoshootInputs, image_count: usize) -> String {
    let has_pose_input = !inputs.pose.is_empty();
    let pose_rule = if has_pose_input {
        "Study the pose references and text. That pose is the basis of every scenario."
    } else {
        "Choose natural poses that fit the look and the setting."
    };
    let angle_rule = if inputs.camera_angles.is_empty() {
        String::new()
    } else {
        format!(
            "\n   You MUST use exactly these camera angles across the scenarios: {}.",
            inputs.camera_angles.join(", ")
        )
    };

    format!(
        r#"You are a fashion art director planning a {image_count}-image photoshoot and must answer with a JSON plan.

Use EVERY piece of information the user supplied. Do not drop any text or image input.
- General prompt: "{style}"
- Tattoo details: "{tattoo}" (image provided: {tattoo_img})
- Hairstyle details: "{hair}" (image provided: {hair_img})
- Makeup details: "{makeup}" (image provided: {makeup_img})
- Outfit details: "{outfit}" (image provided: {outfit_img})
- Location text: "{location}" (image provided: {location_img})
- Pose details: "{pose}" (image provided: {pose_img})

Location rules:
1. Location text (atmosphere, style, elements) is fully integrated into "locationDescription".
2. Location photos are direct visual references; describe them exactly (lighting, colors, objects).
3. Merge text and photo details into one coherent setting; partial data is still used.

Steps:
1. Subject and style: merge the user photos, the general prompt and all style add-ons into one subject/style description.
2. Location: define a single background following the location rules.
3. Pose: {pose_rule}
4. Scenarios: design {image_count} detailed scenarios.{angle_rule}

Return ONLY one JSON object with this shape:
{shape}
"characterDescription" includes tattoos, "outfitDescription" covers outfit, hairstyle and makeup, "locationDescription" is atmospheric."#,
        style = inputs.style_prompt.trim(),
        tattoo = inputs.tattoos.text.trim(),
        tattoo_img = inputs.tattoos.has_photos(),
        hair = inputs.hairstyle.text.trim(),
        hair_img = inputs.hairstyle.has_photos(),
        makeup = inputs.makeup.text.trim(),
        makeup_img = inputs.makeup.has_photos(),
        outfit = inputs.outfit.text.trim(),
        outfit_img = inputs.outfit.has_photos(),
        location = inputs.location_text.trim(),
        location_img = !inputs.location_photos.is_empty(),
        pose = inputs.pose.text.trim(),
        pose_img = inputs.pose.has_photos(),
        shape = PLAN_SHAPE,
    )
}

pub fn build_plan_instructions(
    inputs: &PhotoshootInputs,
    image_count: usize,
    mode: GenerationMode,
) -> String {
    match mode {
        GenerationMode::Replicate => replicate_instructions(image_count),
        GenerationMode::Selfie => selfie_instructions(inputs, image_count),
        GenerationMode::Standard => standard_instructions(inputs, image_count),
    }
}

/// Reference images sent with the planning call, subject photos first.
pub fn collect_plan_images(inputs: &PhotoshootInputs, mode: GenerationMode) -> Vec<&ReferenceImage> {
    let mut images: Vec<&ReferenceImage> = Vec::new();
    images.extend(inputs.subject_photos.iter());
    images.extend(inputs.location_photos.iter());
    images.extend(inputs.tattoos.photos.iter());
    images.extend(inputs.hairstyle.photos.iter());
    images.extend(inputs.makeup.photos.iter());
    images.extend(inputs.outfit.photos.iter());
    if matches!(mode, GenerationMode::Standard) {
        images.extend(inputs.pose.photos.iter());
    }
    images
}

pub fn parse_plan(text: &str) -> Result<PhotoshootPlan, PlanError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(PlanError::EmptyResponse);
    }

    let body = CODE_FENCE
        .captures(trimmed)
        .and_then(|captures| captures.get(1))
        .map(|inner| inner.as_str())
        .unwrap_or(trimmed);

    let plan: PhotoshootPlan = serde_json::from_str(body).map_err(PlanError::Malformed)?;
    if plan.scenarios.is_empty() {
        return Err(PlanError::NoScenarios);
    }
    Ok(plan)
}

/// Runs the single planning call for a request.
pub async fn plan_photoshoot(
    model: &dyn LanguageModel,
    inputs: &PhotoshootInputs,
    image_count: usize,
    mode: GenerationMode,
) -> Result<PhotoshootPlan, PlanError> {
    let instructions = build_plan_instructions(inputs, image_count, mode);
    let images = collect_plan_images(inputs, mode);
    debug!(
        "Planning {} image(s) in {} mode with {} reference image(s)",
        image_count,
        mode.as_str(),
        images.len()
    );

    let text = model
        .generate_structured(&instructions, &images)
        .await
        .map_err(PlanError::Backend)?;
    let plan = parse_plan(&text)?;

    if plan.scenarios.len() != image_count {
        warn!(
            "Plan has {} scenario(s) for {} requested image(s); scenarios will be reused",
            plan.scenarios.len(),
            image_count
        );
    }
    info!(
        "Photoshoot planned: {} scenario(s), mode={}",
        plan.scenarios.len(),
        mode.as_str()
    );
    Ok(plan)
}
