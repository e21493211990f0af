#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Sampling temperature used for tutoring replies.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Output token ceiling applied when settings do not override it.
pub const DEFAULT_MAX_OUTPUT_TOKENS: u64 = 8192;

/// Static catalog offered by the settings layer; remote model listing is not performed.
pub fn default_models() -> Vec<Model> {
    vec![
        Model::from_id("gpt-4o-mini").with_description("Balanced cost/performance default"),
        Model::from_id("gpt-4o").with_description("High quality general model"),
        Model::from_id("gpt-4.1").with_description("Reasoning-forward GPT-4.1"),
        Model::from_id("o3").with_description("Advanced reasoning model"),
    ]
}

pub fn is_known_model(model_id: &str) -> bool {
    default_models().iter().any(|model| model.id == model_id)
}
