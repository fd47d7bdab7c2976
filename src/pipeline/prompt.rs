use tracing::{debug, warn};

use crate::pipeline::backend::LanguageModel;
use crate::pipeline::types::{PhotoshootPlan, Scenario};

/// Enhancement replies at or below this many characters are discarded.
const MIN_ENHANCED_PROMPT_LEN: usize = 10;

const REPLICATE_SCENE: &str =
    "matching the exact composition, lighting, and style of the reference scene";

#[derive(Debug, Clone, Copy)]
pub struct PromptRequest<'a> {
    pub plan: &'a PhotoshootPlan,
    pub scenario_index: usize,
    pub positive_prompt: &'a str,
    pub negative_prompt: &'a str,
    /// Replicate mode with a scene photo attached to this image.
    pub replicate_scene: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedPrompt {
    pub prompt: String,
    pub scenario_index: usize,
    pub enhanced: bool,
}

struct PromptFields<'a> {
    scenario: &'a Scenario,
    subject: &'a str,
    outfit: &'a str,
    scene: String,
}

fn prompt_fields<'a>(request: &PromptRequest<'a>, scenario: &'a Scenario) -> PromptFields<'a> {
    let plan = request.plan;
    let subject = if plan.character_description.trim().is_empty() {
        "A person"
    } else {
        plan.character_description.as_str()
    };
    let scene = if request.replicate_scene {
        REPLICATE_SCENE.to_string()
    } else {
        format!("{} at {}", scenario.action, plan.location_description)
    };
    PromptFields {
        scenario,
        subject,
        outfit: plan.outfit_description.as_str(),
        scene,
    }
}

fn render_fallback(request: &PromptRequest<'_>, fields: &PromptFields<'_>) -> String {
    let style = format!(
        "Professional photography, 8k, highly detailed, realistic texture, {}, {}, {}",
        request.positive_prompt, fields.scenario.lighting, fields.scenario.angle
    );
    let negative = format!("cartoon, painting, illustration, {}", request.negative_prompt);
    format!(
        "Photo of {} wearing {}, {}. {}. --negative_prompt: {}",
        fields.subject, fields.outfit, fields.scene, style, negative
    )
}

fn render_enhancement(request: &PromptRequest<'_>, fields: &PromptFields<'_>) -> String {
    let plan = request.plan;
    let scenario = fields.scenario;
    format!(
        r#"You write prompts for a photorealistic image generator.
Fill in the template below to produce the final prompt.

INPUT DATA:
- Subject Description: {subject}
- Outfit: {outfit}
- Scene Context: {location}
- Specific Action: {action}
- Specific Pose: {pose}
- Lighting/Mood: {lighting}
- Camera Angle: {angle}
- User Positive Style Keywords: {positive}

TEMPLATE (keep this structure):

[Reference Photo of {subject}] | Photoshoot in a {scene} setting, {action}, wearing {outfit}. Transfer Intensity: 9.

Transfer Parameters:
**Age:** (age from the subject description, 25 years old when absent).
**Figure:** (body type from the subject description), {pose}, {angle}.
**Facial Features:** (detailed facial features from the subject description).

Lighting and Atmosphere: {lighting}, {location}.

Photography Style: **Photorealism, High quality, Standard photograph, Natural colors, Shot on Canon EOS R5 / Sony a7 IV, 85mm lens, f/2.0, Grain 0, {positive}.**

--negative_prompt: cartoon, painting, drawing, low quality, stylized, cinematic, dramatic lighting, fantasy, unreal, filters, excessive makeup, {negative}

RULES:
1. Fill every bracket with precise details from the input data.
2. Keep "Transfer Intensity: 9".
3. The Photography Style section always contains "Photorealism, High quality, Standard photograph".
4. Do not invent traits that are not in the input data.
5. Output ONLY the filled template, no preamble."#,
        subject = fields.subject,
        outfit = fields.outfit,
        location = plan.location_description,
        action = scenario.action,
        pose = scenario.pose,
        lighting = scenario.lighting,
        angle = scenario.angle,
        positive = request.positive_prompt,
        negative = request.negative_prompt,
        scene = fields.scene,
    )
}

fn with_scenario<T>(
    request: &PromptRequest<'_>,
    render: impl FnOnce(&PromptFields<'_>) -> T,
) -> T {
    let empty = Scenario::default();
    let scenario = request
        .plan
        .scenario(request.scenario_index)
        .map_or(&empty, |(_, scenario)| scenario);
    render(&prompt_fields(request, scenario))
}

/// Deterministic prompt built purely from the plan and style fields.
pub fn fallback_prompt(request: &PromptRequest<'_>) -> String {
    with_scenario(request, |fields| render_fallback(request, fields))
}

pub fn enhancement_instructions(request: &PromptRequest<'_>) -> String {
    with_scenario(request, |fields| render_enhancement(request, fields))
}

/// Produces the final prompt for one image. Never fails: when the rewrite
/// call errors or returns too little, the fallback prompt is used.
pub async fn compose_prompt(
    enhancer: Option<&dyn LanguageModel>,
    request: &PromptRequest<'_>,
) -> ComposedPrompt {
    let scenario_index = request
        .plan
        .scenario(request.scenario_index)
        .map_or(0, |(index, _)| index);
    let fallback = fallback_prompt(request);

    let Some(enhancer) = enhancer else {
        return ComposedPrompt {
            prompt: fallback,
            scenario_index,
            enhanced: false,
        };
    };

    match enhancer.generate_text(&enhancement_instructions(request)).await {
        Ok(text) if text.trim().chars().count() > MIN_ENHANCED_PROMPT_LEN => {
            debug!(
                "Enhanced prompt for scenario {} ({} chars)",
                scenario_index,
                text.trim().len()
            );
            ComposedPrompt {
                prompt: text.trim().to_string(),
                scenario_index,
                enhanced: true,
            }
        }
        Ok(text) => {
            warn!(
                "Prompt enhancement returned {} chars for scenario {}, using fallback prompt",
                text.trim().len(),
                scenario_index
            );
            ComposedPrompt {
                prompt: fallback,
                scenario_index,
                enhanced: false,
            }
        }
        Err(err) => {
            warn!(
                "Prompt enhancement failed for scenario {} ({}), using fallback prompt: {}",
                scenario_index,
                err.kind.as_str(),
                err
            );
            ComposedPrompt {
                prompt: fallback,
                scenario_index,
                enhanced: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::llm::media::ReferenceImage;
    use crate::pipeline::errors::{BackendError, BackendErrorKind};

    struct CannedEnhancer {
        reply: Result<String, BackendError>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LanguageModel for CannedEnhancer {
        async fn generate_structured(
            &self,
            _instructions: &str,
            _images: &[&ReferenceImage],
        ) -> Result<String, BackendError> {
            unreachable!("composer only uses free text generation")
        }

        async fn generate_text(&self, prompt: &str) -> Result<String, BackendError> {
            self.prompts.lock().push(prompt.to_string());
            self.reply.clone()
        }
    }

    fn enhancer(reply: Result<String, BackendError>) -> CannedEnhancer {
        CannedEnhancer {
            reply,
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn plan() -> PhotoshootPlan {
        let scenario = |tag: &str| Scenario {
            angle: format!("{tag}-angle"),
            pose: format!("{tag}-pose"),
            action: format!("{tag}-action"),
            lighting: format!("{tag}-light"),
        };
        PhotoshootPlan {
            character_description: "man with a beard".to_string(),
            outfit_description: "denim jacket".to_string(),
            location_description: "neon alley".to_string(),
            scenarios: vec![scenario("s0"), scenario("s1"), scenario("s2")],
        }
    }

    fn request<'a>(plan: &'a PhotoshootPlan, index: usize) -> PromptRequest<'a> {
        PromptRequest {
            plan,
            scenario_index: index,
            positive_prompt: "warm tones",
            negative_prompt: "blurry",
            replicate_scene: false,
        }
    }

    #[test]
    fn fallback_prompt_uses_wrapped_scenario() {
        let plan = plan();
        let prompt = fallback_prompt(&request(&plan, 7));
        assert_eq!(
            prompt,
            "Photo of man with a beard wearing denim jacket, s1-action at neon alley. \
             Professional photography, 8k, highly detailed, realistic texture, warm tones, \
             s1-light, s1-angle. --negative_prompt: cartoon, painting, illustration, blurry"
        );
    }

    #[test]
    fn replicate_scene_replaces_action_and_location() {
        let plan = plan();
        let req = PromptRequest {
            replicate_scene: true,
            ..request(&plan, 0)
        };
        let prompt = fallback_prompt(&req);
        assert!(prompt.contains(REPLICATE_SCENE));
        assert!(!prompt.contains("neon alley"));
    }

    #[test]
    fn missing_character_description_defaults_to_a_person() {
        let mut plan = plan();
        plan.character_description = "  ".to_string();
        assert!(fallback_prompt(&request(&plan, 0)).starts_with("Photo of A person wearing"));
    }

    #[tokio::test]
    async fn enhancement_failure_falls_back_to_deterministic_prompt() {
        let plan = plan();
        let req = request(&plan, 4);
        let model = enhancer(Err(BackendError::new(
            BackendErrorKind::Transient,
            "connection reset",
        )));
        let composed = compose_prompt(Some(&model), &req).await;
        assert_eq!(composed.prompt, fallback_prompt(&req));
        assert_eq!(composed.scenario_index, 1);
        assert!(!composed.enhanced);
    }

    #[tokio::test]
    async fn short_enhancement_is_ignored() {
        let plan = plan();
        let req = request(&plan, 0);
        let model = enhancer(Ok("  too short ".to_string()));
        let composed = compose_prompt(Some(&model), &req).await;
        assert_eq!(composed.prompt, fallback_prompt(&req));
    }

    #[tokio::test]
    async fn enhanced_prompt_is_used_verbatim_after_trim() {
        let plan = plan();
        let req = request(&plan, 2);
        let model = enhancer(Ok("\n[Reference Photo of man with a beard] | rooftop\n".to_string()));
        let composed = compose_prompt(Some(&model), &req).await;
        assert!(composed.enhanced);
        assert_eq!(composed.prompt, "[Reference Photo of man with a beard] | rooftop");

        let sent = model.prompts.lock()[0].clone();
        assert!(sent.contains("Specific Action: s2-action"));
        assert!(sent.contains("Transfer Intensity: 9"));
        assert!(sent.contains("excessive makeup, blurry"));
    }

    #[tokio::test]
    async fn disabled_enhancement_uses_fallback() {
        let plan = plan();
        let req = request(&plan, 0);
        let composed = compose_prompt(None, &req).await;
        assert_eq!(composed.prompt, fallback_prompt(&req));
        assert_eq!(enhancement_instructions(&req).contains("s0-pose"), true);
    }
}
