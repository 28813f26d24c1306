//! Known-model registry
//!
//! A static capability table for the model identifiers the analysis
//! pipeline understands. The orchestration core consults it in exactly two
//! places: submission validation (an explicitly named model must be known)
//! and default filling when the effective settings name nothing usable.

/// Which pipeline role a model is suited for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    /// Data collection and tool calling
    Quick,
    /// Reasoning and decision making
    Deep,
    Both,
}

/// One entry of the capability table.
#[derive(Debug, Clone)]
pub struct ModelCapability {
    pub name: &'static str,
    pub provider: &'static str,
    pub role: ModelRole,
    /// 1 (basic) to 5 (flagship)
    pub level: u8,
}

/// Representative subset of the supported model catalogue, one block per
/// provider. Extend as the pipeline gains providers.
const KNOWN_MODELS: &[ModelCapability] = &[
    // DashScope
    ModelCapability { name: "qwen-turbo", provider: "dashscope", role: ModelRole::Quick, level: 2 },
    ModelCapability { name: "qwen-plus", provider: "dashscope", role: ModelRole::Both, level: 3 },
    ModelCapability { name: "qwen-max", provider: "dashscope", role: ModelRole::Deep, level: 4 },
    // OpenAI
    ModelCapability { name: "gpt-4o-mini", provider: "openai", role: ModelRole::Quick, level: 2 },
    ModelCapability { name: "gpt-4o", provider: "openai", role: ModelRole::Both, level: 4 },
    // DeepSeek
    ModelCapability { name: "deepseek-chat", provider: "deepseek", role: ModelRole::Quick, level: 3 },
    ModelCapability { name: "deepseek-reasoner", provider: "deepseek", role: ModelRole::Deep, level: 4 },
    // Anthropic
    ModelCapability { name: "claude-3-5-haiku", provider: "anthropic", role: ModelRole::Quick, level: 3 },
    ModelCapability { name: "claude-sonnet-4", provider: "anthropic", role: ModelRole::Both, level: 5 },
    // Google
    ModelCapability { name: "gemini-2.0-flash", provider: "google", role: ModelRole::Quick, level: 3 },
    ModelCapability { name: "gemini-2.5-pro", provider: "google", role: ModelRole::Deep, level: 5 },
    // Moonshot
    ModelCapability { name: "kimi-k2", provider: "moonshot", role: ModelRole::Both, level: 4 },
];

/// Lookup over the static capability table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelRegistry;

impl ModelRegistry {
    pub fn get(&self, name: &str) -> Option<&'static ModelCapability> {
        KNOWN_MODELS.iter().find(|m| m.name == name)
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Fallback quick-analysis model when neither the request nor the
    /// effective settings name one.
    pub fn default_quick(&self) -> &'static str {
        "qwen-turbo"
    }

    /// Fallback deep-analysis model.
    pub fn default_deep(&self) -> &'static str {
        "qwen-max"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_models_resolve() {
        let registry = ModelRegistry;
        assert!(registry.is_known("qwen-turbo"));
        assert!(registry.is_known("gpt-4o"));
        assert!(!registry.is_known("qwen-ultra-pro"));
    }

    #[test]
    fn test_defaults_are_in_the_table() {
        let registry = ModelRegistry;
        assert!(registry.is_known(registry.default_quick()));
        assert!(registry.is_known(registry.default_deep()));
    }

    #[test]
    fn test_capability_levels_in_range() {
        for model in KNOWN_MODELS {
            assert!((1..=5).contains(&model.level), "{} out of range", model.name);
        }
    }
}
