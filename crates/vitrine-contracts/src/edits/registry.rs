use indexmap::IndexMap;

pub const FALLBACK_OPERATION: &str = "enhance";
pub const GENERIC_PROMPT: &str = "Enhance this image appropriately.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditCategory {
    Background,
    Enhancement,
    Style,
    Geometry,
}

impl EditCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Enhancement => "enhancement",
            Self::Style => "style",
            Self::Geometry => "geometry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOperationSpec {
    pub id: String,
    pub label: String,
    pub category: EditCategory,
    pub prompt: String,
    pub needs_reference: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditSelection {
    pub operation: EditOperationSpec,
    pub requested: String,
    pub prompt: String,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EditRegistry {
    operations: IndexMap<String, EditOperationSpec>,
}

impl Default for EditRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl EditRegistry {
    pub fn new(operations: Option<IndexMap<String, EditOperationSpec>>) -> Self {
        Self {
            operations: operations.unwrap_or_else(default_operations),
        }
    }

    pub fn get(&self, id: &str) -> Option<&EditOperationSpec> {
        self.operations.get(id.trim())
    }

    pub fn list(&self) -> impl Iterator<Item = &EditOperationSpec> {
        self.operations.values()
    }

    pub fn by_category(&self, category: EditCategory) -> Vec<EditOperationSpec> {
        self.operations
            .values()
            .filter(|operation| operation.category == category)
            .cloned()
            .collect()
    }

    /// Server-side resolution: unknown ids degrade to a generic enhance
    /// instruction instead of failing.
    pub fn resolve(&self, requested: &str) -> Result<EditSelection, String> {
        if let Some(operation) = self.get(requested) {
            return Ok(EditSelection {
                prompt: operation.prompt.clone(),
                operation: operation.clone(),
                requested: requested.to_string(),
                fallback_reason: None,
            });
        }
        let Some(fallback) = self.get(FALLBACK_OPERATION).cloned() else {
            return Err(format!(
                "Edit operation '{requested}' unknown and no '{FALLBACK_OPERATION}' fallback registered."
            ));
        };
        Ok(EditSelection {
            operation: fallback,
            requested: requested.to_string(),
            prompt: GENERIC_PROMPT.to_string(),
            fallback_reason: Some(format!(
                "Edit operation '{requested}' unknown; using generic enhance."
            )),
        })
    }
}

/// Display label for an operation id, e.g. `remove_bg` -> `Remove Background`.
pub fn humanize_operation(id: &str) -> String {
    if let Some(spec) = default_operations().get(id.trim()) {
        return spec.label.clone();
    }
    id.trim()
        .split(|ch: char| ch == '_' || ch == '-' || ch.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn default_operations() -> IndexMap<String, EditOperationSpec> {
    let mut map = IndexMap::new();

    let mut insert =
        |id: &str, label: &str, category: EditCategory, prompt: &str, needs_reference: bool| {
            map.insert(
                id.to_string(),
                EditOperationSpec {
                    id: id.to_string(),
                    label: label.to_string(),
                    category,
                    prompt: prompt.to_string(),
                    needs_reference,
                },
            );
        };

    insert(
        "remove_bg",
        "Remove Background",
        EditCategory::Background,
        "Remove the background from this image, keeping only the main subject with a transparent background.",
        false,
    );
    insert(
        "replace_bg_auto",
        "Auto Background",
        EditCategory::Background,
        "Replace the background with an aesthetically pleasing, contextually appropriate background.",
        false,
    );
    insert(
        "replace_bg_custom",
        "Custom Background",
        EditCategory::Background,
        "Replace the background with the reference image, ensuring seamless integration.",
        true,
    );
    insert(
        "replace_bg_studio",
        "Studio Background",
        EditCategory::Background,
        "Place the garment on a clean seamless studio backdrop with soft, even lighting.",
        false,
    );
    insert(
        "enhance",
        "Enhance",
        EditCategory::Enhancement,
        "Enhance the image quality, improve sharpness, color balance, and overall visual appeal.",
        false,
    );
    insert(
        "enhance_lighting",
        "Fix Lighting",
        EditCategory::Enhancement,
        "Correct exposure and white balance so the fabric colors look true to life.",
        false,
    );
    insert(
        "upscale",
        "Upscale",
        EditCategory::Enhancement,
        "Increase the resolution of this image while preserving fabric texture and fine detail.",
        false,
    );
    insert(
        "colorize",
        "Color Boost",
        EditCategory::Style,
        "Adjust colors, improve contrast, and enhance visual quality while maintaining original style.",
        false,
    );
    insert(
        "vintage",
        "Vintage",
        EditCategory::Style,
        "Apply a warm, faded vintage film look to this image.",
        false,
    );
    insert(
        "sketch",
        "Sketch",
        EditCategory::Style,
        "Render this image as a clean fashion illustration sketch.",
        false,
    );
    insert(
        "rotate_left",
        "Rotate Left",
        EditCategory::Geometry,
        "Rotate this image 90 degrees counter-clockwise.",
        false,
    );
    insert(
        "rotate_right",
        "Rotate Right",
        EditCategory::Geometry,
        "Rotate this image 90 degrees clockwise.",
        false,
    );
    insert(
        "flip_horizontal",
        "Mirror",
        EditCategory::Geometry,
        "Mirror this image horizontally.",
        false,
    );

    map
}
