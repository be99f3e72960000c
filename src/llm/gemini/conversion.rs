// src/llm/gemini/conversion.rs
// Request/response translation between OpenAI and Gemini formats

use serde_json::Value;
use std::collections::HashMap;

use super::types::{
    GeminiContent, GeminiFunctionCall, GeminiFunctionDeclaration, GeminiFunctionResponse,
    GeminiInlineData, GeminiPart, GeminiRequest, GeminiResponse, GeminiTool, GenerationConfig,
};
use crate::llm::types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ContentPart, FunctionCall,
    MessageContent, ToolCall, Usage,
};

/// Convert an OpenAI-shaped request to Gemini's generateContent format.
/// System messages lift to `systemInstruction`; generation hints go
/// under `generationConfig`.
pub fn to_gemini_request(req: &ChatCompletionRequest) -> GeminiRequest {
    // Map tool_call_id -> function name so tool results carry the right name
    let mut call_id_to_name: HashMap<String, String> = HashMap::new();
    for msg in &req.messages {
        if let Some(ref tool_calls) = msg.tool_calls {
            for tc in tool_calls {
                call_id_to_name.insert(tc.id.clone(), tc.function.name.clone());
            }
        }
    }

    let mut system_instruction: Option<GeminiContent> = None;
    let mut contents: Vec<GeminiContent> = Vec::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" => {
                system_instruction = Some(GeminiContent {
                    role: "user".into(),
                    parts: vec![GeminiPart::Text { text: msg.text() }],
                });
            }
            "user" => contents.push(GeminiContent {
                role: "user".into(),
                parts: convert_user_parts(msg),
            }),
            "assistant" => contents.push(convert_assistant_content(msg)),
            "tool" => {
                let call_id = msg.tool_call_id.clone().unwrap_or_default();
                let name = call_id_to_name
                    .get(&call_id)
                    .cloned()
                    .unwrap_or_else(|| "unknown".into());
                contents.push(GeminiContent {
                    role: "user".into(),
                    parts: vec![GeminiPart::FunctionResponse {
                        function_response: GeminiFunctionResponse {
                            name,
                            response: wrap_tool_response(&msg.text()),
                        },
                    }],
                });
            }
            _ => {}
        }
    }

    let tools = req.tools.as_ref().map(|tools| {
        vec![GeminiTool {
            function_declarations: tools
                .iter()
                .map(|t| GeminiFunctionDeclaration {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    parameters: t.function.parameters.clone(),
                })
                .collect(),
        }]
    });

    GeminiRequest {
        contents,
        system_instruction,
        tools,
        generation_config: GenerationConfig {
            max_output_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
        },
    }
}

/// Gemini requires function_response.response to be a JSON object
fn wrap_tool_response(content: &str) -> Value {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(obj)) => Value::Object(obj),
        Ok(other) => serde_json::json!({ "result": other }),
        Err(_) => serde_json::json!({ "result": content }),
    }
}

fn convert_user_parts(msg: &ChatMessage) -> Vec<GeminiPart> {
    match msg.content.as_ref() {
        Some(MessageContent::Text(s)) => vec![GeminiPart::Text { text: s.clone() }],
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => GeminiPart::Text { text: text.clone() },
                ContentPart::ImageUrl { image_url } => convert_image_part(&image_url.url),
            })
            .collect(),
        None => vec![GeminiPart::Text {
            text: String::new(),
        }],
    }
}

/// Data URIs become inline_data; remote URLs degrade to a text reference
/// (Gemini inline parts require base64 payloads).
fn convert_image_part(url: &str) -> GeminiPart {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((meta, data)) = rest.split_once(";base64,") {
            return GeminiPart::InlineData {
                inline_data: GeminiInlineData {
                    mime_type: meta.to_string(),
                    data: data.to_string(),
                },
            };
        }
    }
    GeminiPart::Text {
        text: format!("[image: {}]", url),
    }
}

fn convert_assistant_content(msg: &ChatMessage) -> GeminiContent {
    let mut parts = Vec::new();
    let text = msg.text();
    if !text.is_empty() {
        parts.push(GeminiPart::Text { text });
    }
    if let Some(ref tool_calls) = msg.tool_calls {
        for tc in tool_calls {
            let args: Value = serde_json::from_str(&tc.function.arguments)
                .unwrap_or(Value::Object(Default::default()));
            parts.push(GeminiPart::FunctionCall {
                function_call: GeminiFunctionCall {
                    name: tc.function.name.clone(),
                    args,
                },
            });
        }
    }
    if parts.is_empty() {
        parts.push(GeminiPart::Text {
            text: String::new(),
        });
    }
    GeminiContent {
        role: "model".into(),
        parts,
    }
}

/// Convert a Gemini response to OpenAI shape. Text parts concatenate;
/// functionCall parts become tool_calls with generated ids.
pub fn from_gemini_response(response: GeminiResponse, model: &str) -> ChatCompletionResponse {
    let mut content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    if let Some(candidate) = response.candidates.as_ref().and_then(|c| c.first())
        && let Some(ref body) = candidate.content
    {
        for part in &body.parts {
            match part {
                GeminiPart::Text { text } => content.push_str(text),
                GeminiPart::FunctionCall { function_call } => {
                    tool_calls.push(ToolCall {
                        id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                        call_type: "function".into(),
                        function: FunctionCall {
                            name: function_call.name.clone(),
                            arguments: serde_json::to_string(&function_call.args)
                                .unwrap_or_else(|_| "{}".into()),
                        },
                    });
                }
                _ => {}
            }
        }
    }

    let finish_reason = if tool_calls.is_empty() { "stop" } else { "tool_calls" };
    let message = if tool_calls.is_empty() {
        ChatMessage::assistant(content)
    } else {
        let text = if content.is_empty() { None } else { Some(content) };
        ChatMessage::assistant_tool_calls(text, tool_calls)
    };

    let mut out = ChatCompletionResponse::of_message(model, message, finish_reason);
    out.usage = response.usage_metadata.map(|u| {
        let prompt = u.prompt_token_count.unwrap_or(0);
        let completion = u.candidates_token_count.unwrap_or(0);
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: u.total_token_count.unwrap_or(prompt + completion),
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::gemini::types::{GeminiCandidate, GeminiUsage};
    use crate::llm::types::Tool;

    fn request_with(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: None,
            messages,
            stream: None,
            tools: None,
            tool_choice: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }

    // ============================================================================
    // Request conversion tests
    // ============================================================================

    #[test]
    fn test_system_lifts_to_system_instruction() {
        let req = request_with(vec![ChatMessage::system("be kind"), ChatMessage::user("hi")]);
        let out = to_gemini_request(&req);
        assert!(out.system_instruction.is_some());
        assert_eq!(out.contents.len(), 1);
    }

    #[test]
    fn test_assistant_role_maps_to_model() {
        let req = request_with(vec![ChatMessage::assistant("sure")]);
        let out = to_gemini_request(&req);
        assert_eq!(out.contents[0].role, "model");
    }

    #[test]
    fn test_generation_hints_land_in_config() {
        let mut req = request_with(vec![ChatMessage::user("hi")]);
        req.temperature = Some(0.2);
        req.max_tokens = Some(512);
        req.top_p = Some(0.8);
        let out = to_gemini_request(&req);
        assert_eq!(out.generation_config.temperature, Some(0.2));
        assert_eq!(out.generation_config.max_output_tokens, Some(512));
        assert_eq!(out.generation_config.top_p, Some(0.8));
    }

    #[test]
    fn test_tools_become_function_declarations() {
        let mut req = request_with(vec![ChatMessage::user("go")]);
        req.tools = Some(vec![Tool::function(
            "web_search",
            "Search",
            serde_json::json!({"type":"object"}),
        )]);
        let out = to_gemini_request(&req);
        let tools = out.tools.unwrap();
        assert_eq!(tools[0].function_declarations[0].name, "web_search");
    }

    #[test]
    fn test_tool_result_resolves_function_name() {
        let calls = vec![ToolCall {
            id: "call_7".into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: "read_file".into(),
                arguments: "{}".into(),
            },
        }];
        let req = request_with(vec![
            ChatMessage::assistant_tool_calls(None, calls),
            ChatMessage::tool_result("call_7", "contents here"),
        ]);
        let out = to_gemini_request(&req);
        match &out.contents[1].parts[0] {
            GeminiPart::FunctionResponse { function_response } => {
                assert_eq!(function_response.name, "read_file");
                assert_eq!(function_response.response["result"], "contents here");
            }
            _ => panic!("expected functionResponse part"),
        }
    }

    #[test]
    fn test_wrap_tool_response_object_passthrough() {
        let v = wrap_tool_response(r#"{"ok":true}"#);
        assert_eq!(v["ok"], true);
        let v = wrap_tool_response("plain text");
        assert_eq!(v["result"], "plain text");
        let v = wrap_tool_response("[1,2]");
        assert_eq!(v["result"][0], 1);
    }

    // ============================================================================
    // Response conversion tests
    // ============================================================================

    fn response_with_parts(parts: Vec<GeminiPart>) -> GeminiResponse {
        GeminiResponse {
            candidates: Some(vec![GeminiCandidate {
                content: Some(GeminiContent {
                    role: "model".into(),
                    parts,
                }),
            }]),
            usage_metadata: None,
        }
    }

    #[test]
    fn test_text_parts_concatenate() {
        let resp = response_with_parts(vec![
            GeminiPart::Text { text: "a".into() },
            GeminiPart::Text { text: "b".into() },
        ]);
        let out = from_gemini_response(resp, "gemini-2.5-flash");
        assert_eq!(out.text(), "ab");
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_function_call_maps_to_tool_calls() {
        let resp = response_with_parts(vec![GeminiPart::FunctionCall {
            function_call: GeminiFunctionCall {
                name: "web_search".into(),
                args: serde_json::json!({"query":"rust"}),
            },
        }]);
        let out = from_gemini_response(resp, "m");
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        let calls = out.tool_calls();
        assert_eq!(calls[0].function.name, "web_search");
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].function.arguments, r#"{"query":"rust"}"#);
    }

    #[test]
    fn test_empty_candidates() {
        let resp = GeminiResponse {
            candidates: None,
            usage_metadata: None,
        };
        let out = from_gemini_response(resp, "m");
        assert_eq!(out.text(), "");
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_usage_mapping() {
        let mut resp = response_with_parts(vec![GeminiPart::Text { text: "x".into() }]);
        resp.usage_metadata = Some(GeminiUsage {
            prompt_token_count: Some(20),
            candidates_token_count: Some(8),
            total_token_count: Some(28),
        });
        let out = from_gemini_response(resp, "m");
        let usage = out.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 20);
        assert_eq!(usage.completion_tokens, 8);
        assert_eq!(usage.total_tokens, 28);
    }
}
