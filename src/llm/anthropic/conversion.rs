// src/llm/anthropic/conversion.rs
// Request/response translation between OpenAI and Anthropic formats

use serde_json::Value;

use super::types::{
    AnthropicContent, AnthropicMessage, AnthropicRequest, AnthropicResponse, AnthropicTool,
    AnthropicToolChoice, ContentBlock, ImageSource,
};
use crate::llm::types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ContentPart, FunctionCall,
    MessageContent, ToolCall, Usage,
};

/// Convert an OpenAI-shaped request into an Anthropic messages request.
/// A leading system message becomes the `system` field; the rest map
/// role-for-role.
pub fn to_anthropic_request(
    req: &ChatCompletionRequest,
    model: &str,
    stream: bool,
) -> AnthropicRequest {
    let mut system: Option<String> = None;
    let mut messages: Vec<AnthropicMessage> = Vec::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" => {
                // Multiple system messages concatenate into one field
                let text = msg.text();
                system = Some(match system.take() {
                    Some(existing) => format!("{}\n\n{}", existing, text),
                    None => text,
                });
            }
            "user" => messages.push(AnthropicMessage {
                role: "user".into(),
                content: convert_user_content(msg),
            }),
            "assistant" => messages.push(convert_assistant_message(msg)),
            "tool" => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.text(),
                };
                messages.push(AnthropicMessage {
                    role: "user".into(),
                    content: AnthropicContent::Blocks(vec![block]),
                });
            }
            _ => {}
        }
    }

    let tools: Vec<AnthropicTool> = req
        .tools
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .map(|t| AnthropicTool {
            name: t.function.name.clone(),
            description: t.function.description.clone(),
            input_schema: t.function.parameters.clone(),
        })
        .collect();

    let tool_choice = if tools.is_empty() {
        None
    } else {
        convert_tool_choice(req.tool_choice.as_ref())
    };

    AnthropicRequest {
        model: model.to_string(),
        max_tokens: req.max_tokens.unwrap_or(AnthropicRequest::default_max_tokens()),
        system,
        messages,
        tools,
        tool_choice,
        temperature: req.temperature,
        top_p: req.top_p,
        stream,
    }
}

/// OpenAI `tool_choice` values map onto Anthropic's tagged variants
fn convert_tool_choice(choice: Option<&Value>) -> Option<AnthropicToolChoice> {
    match choice {
        None => Some(AnthropicToolChoice::Auto),
        Some(Value::String(s)) => match s.as_str() {
            "auto" => Some(AnthropicToolChoice::Auto),
            "required" => Some(AnthropicToolChoice::Any),
            "none" => None,
            _ => Some(AnthropicToolChoice::Auto),
        },
        Some(Value::Object(obj)) => obj
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
            .map(|name| AnthropicToolChoice::Tool { name: name.into() }),
        _ => Some(AnthropicToolChoice::Auto),
    }
}

/// User content: plain text stays a string, multipart becomes blocks
fn convert_user_content(msg: &ChatMessage) -> AnthropicContent {
    match msg.content.as_ref() {
        Some(MessageContent::Text(s)) => AnthropicContent::Text(s.clone()),
        Some(MessageContent::Parts(parts)) => {
            let blocks = parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => ContentBlock::Text { text: text.clone() },
                    ContentPart::ImageUrl { image_url } => ContentBlock::Image {
                        source: convert_image_source(&image_url.url),
                    },
                })
                .collect();
            AnthropicContent::Blocks(blocks)
        }
        None => AnthropicContent::Text(String::new()),
    }
}

/// Data URIs become inline base64 sources; anything else stays a URL
fn convert_image_source(url: &str) -> ImageSource {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((meta, data)) = rest.split_once(";base64,") {
            return ImageSource::Base64 {
                media_type: meta.to_string(),
                data: data.to_string(),
            };
        }
    }
    ImageSource::Url {
        url: url.to_string(),
    }
}

fn convert_assistant_message(msg: &ChatMessage) -> AnthropicMessage {
    let tool_calls = msg.tool_calls.as_deref().unwrap_or(&[]);
    if tool_calls.is_empty() {
        return AnthropicMessage {
            role: "assistant".into(),
            content: AnthropicContent::Text(msg.text()),
        };
    }

    let mut blocks = Vec::new();
    let text = msg.text();
    if !text.is_empty() {
        blocks.push(ContentBlock::Text { text });
    }
    for tc in tool_calls {
        let input: Value =
            serde_json::from_str(&tc.function.arguments).unwrap_or(Value::Object(Default::default()));
        blocks.push(ContentBlock::ToolUse {
            id: tc.id.clone(),
            name: tc.function.name.clone(),
            input,
        });
    }

    AnthropicMessage {
        role: "assistant".into(),
        content: AnthropicContent::Blocks(blocks),
    }
}

/// Convert an Anthropic response back to OpenAI shape. Text blocks
/// concatenate; tool_use blocks become tool_calls with re-serialized
/// JSON-string arguments.
pub fn from_anthropic_response(
    response: AnthropicResponse,
    model: &str,
) -> ChatCompletionResponse {
    let mut content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in response.content {
        match block {
            ContentBlock::Text { text } => content.push_str(&text),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall {
                    id,
                    call_type: "function".into(),
                    function: FunctionCall {
                        name,
                        arguments: serde_json::to_string(&input).unwrap_or_else(|_| "{}".into()),
                    },
                });
            }
            _ => {}
        }
    }

    let finish_reason = match response.stop_reason.as_deref() {
        Some("tool_use") => "tool_calls",
        _ => "stop",
    };

    let message = if tool_calls.is_empty() {
        ChatMessage::assistant(content)
    } else {
        let text = if content.is_empty() { None } else { Some(content) };
        ChatMessage::assistant_tool_calls(text, tool_calls)
    };

    let mut out = ChatCompletionResponse::of_message(model, message, finish_reason);
    out.usage = response.usage.map(|u| {
        let prompt = u.input_tokens.unwrap_or(0);
        let completion = u.output_tokens.unwrap_or(0);
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    });
    out
}
