// src/llm/gemini/types.rs
// Gemini API wire types (Google's format)

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<GeminiTool>>,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

// ============================================================================
// Content types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiContent {
    pub role: String, // "user" | "model"
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inline_data")]
        inline_data: GeminiInlineData,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: GeminiFunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: GeminiFunctionResponse,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiInlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionCall {
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionResponse {
    pub name: String,
    pub response: Value,
}

// ============================================================================
// Tool types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiTool {
    pub function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
pub struct GeminiFunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiResponse {
    pub candidates: Option<Vec<GeminiCandidate>>,
    pub usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
pub struct GeminiCandidate {
    pub content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiUsage {
    pub prompt_token_count: Option<u32>,
    pub candidates_token_count: Option<u32>,
    pub total_token_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_text_serialize() {
        let part = GeminiPart::Text {
            text: "Hello".into(),
        };
        assert_eq!(
            serde_json::to_string(&part).unwrap(),
            r#"{"text":"Hello"}"#
        );
    }

    #[test]
    fn test_part_function_call_roundtrip() {
        let raw = r#"{"functionCall":{"name":"search","args":{"q":"x"}}}"#;
        let part: GeminiPart = serde_json::from_str(raw).unwrap();
        match part {
            GeminiPart::FunctionCall { function_call } => {
                assert_eq!(function_call.name, "search");
            }
            _ => panic!("expected functionCall part"),
        }
    }

    #[test]
    fn test_generation_config_camel_case() {
        let config = GenerationConfig {
            max_output_tokens: Some(1024),
            temperature: Some(0.7),
            top_p: Some(0.9),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("maxOutputTokens"));
        assert!(json.contains("topP"));
    }

    #[test]
    fn test_request_system_instruction_camel_case() {
        let req = GeminiRequest {
            contents: vec![],
            system_instruction: Some(GeminiContent {
                role: "user".into(),
                parts: vec![GeminiPart::Text { text: "sys".into() }],
            }),
            tools: None,
            generation_config: GenerationConfig::default(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("systemInstruction"));
    }
}
