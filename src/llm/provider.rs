// src/llm/provider.rs
// Provider selection: model-prefix routing, defaults, fallback order

use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend families the gateway can dispatch to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    OpenAi,
    Gemini,
    XAi,
    Local,
}

impl Provider {
    /// Select a provider from a model name's prefix
    pub fn from_model(model: &str) -> Self {
        let m = model.to_ascii_lowercase();
        if m.starts_with("claude") {
            Self::Anthropic
        } else if m.starts_with("gpt")
            || m.starts_with("o1")
            || m.starts_with("o3")
            || m.starts_with("o4")
        {
            Self::OpenAi
        } else if m.starts_with("gemini") {
            Self::Gemini
        } else if m.starts_with("grok") {
            Self::XAi
        } else {
            Self::Local
        }
    }

    /// Default model used when this provider is reached through fallback
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-5",
            Self::OpenAi => "gpt-4o",
            Self::Gemini => "gemini-2.5-flash",
            Self::XAi => "grok-3",
            Self::Local => "llama3.2",
        }
    }

    /// Environment variable holding this provider's API key
    pub fn api_key_env_var(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
            Self::XAi => "XAI_API_KEY",
            Self::Local => "LOCAL_LLM_URL",
        }
    }

    /// Order tried when the primary provider fails or has no key
    pub fn fallback_order() -> &'static [Provider] {
        &[
            Self::Anthropic,
            Self::OpenAi,
            Self::Gemini,
            Self::XAi,
            Self::Local,
        ]
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::OpenAi => write!(f, "openai"),
            Self::Gemini => write!(f, "gemini"),
            Self::XAi => write!(f, "xai"),
            Self::Local => write!(f, "local"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================================
    // from_model tests
    // ============================================================================

    #[test]
    fn test_from_model_anthropic() {
        assert_eq!(Provider::from_model("claude-sonnet-4-5"), Provider::Anthropic);
        assert_eq!(Provider::from_model("Claude-3-haiku"), Provider::Anthropic);
    }

    #[test]
    fn test_from_model_openai() {
        assert_eq!(Provider::from_model("gpt-4o"), Provider::OpenAi);
        assert_eq!(Provider::from_model("o1-preview"), Provider::OpenAi);
        assert_eq!(Provider::from_model("o3-mini"), Provider::OpenAi);
        assert_eq!(Provider::from_model("o4-mini"), Provider::OpenAi);
    }

    #[test]
    fn test_from_model_gemini() {
        assert_eq!(Provider::from_model("gemini-2.5-flash"), Provider::Gemini);
    }

    #[test]
    fn test_from_model_xai() {
        assert_eq!(Provider::from_model("grok-3"), Provider::XAi);
    }

    #[test]
    fn test_from_model_falls_back_to_local() {
        assert_eq!(Provider::from_model("llama3.2"), Provider::Local);
        assert_eq!(Provider::from_model("qwen2.5-coder"), Provider::Local);
        assert_eq!(Provider::from_model(""), Provider::Local);
    }

    // ============================================================================
    // Fallback order tests
    // ============================================================================

    #[test]
    fn test_fallback_order_ends_with_local() {
        let order = Provider::fallback_order();
        assert_eq!(order.last(), Some(&Provider::Local));
        assert_eq!(order.len(), 5);
    }

    #[test]
    fn test_default_models_route_back_to_provider() {
        for provider in Provider::fallback_order() {
            assert_eq!(Provider::from_model(provider.default_model()), *provider);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Provider::Anthropic), "anthropic");
        assert_eq!(format!("{}", Provider::Local), "local");
    }
}
