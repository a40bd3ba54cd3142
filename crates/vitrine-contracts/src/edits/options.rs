use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reference images accepted per edit request.
pub const MAX_REFERENCE_IMAGES: usize = 3;

/// Free-form hints forwarded to the edit service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
}

impl EditOptions {
    pub fn is_empty(&self) -> bool {
        self.color.is_none() && self.shape.is_none() && self.scenario.is_none()
    }

    pub fn to_map(&self) -> Map<String, Value> {
        serde_json::to_value(self)
            .ok()
            .and_then(|value| value.as_object().cloned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditTuning {
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_inference_steps")]
    pub num_inference_steps: u32,
    #[serde(default = "default_cfg_scale")]
    pub true_cfg_scale: f32,
}

impl Default for EditTuning {
    fn default() -> Self {
        Self {
            negative_prompt: String::new(),
            num_inference_steps: default_inference_steps(),
            true_cfg_scale: default_cfg_scale(),
        }
    }
}

fn default_inference_steps() -> u32 {
    50
}

fn default_cfg_scale() -> f32 {
    4.0
}
