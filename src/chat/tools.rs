// src/chat/tools.rs
// Tool registry: level-gated built-ins plus MCP collaborator tools

use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::access::AccessLevel;
use crate::config::{GatewayConfig, SecretStore};
use crate::llm::types::Tool;
use crate::util::net::validate_outbound_url;

/// Output cap for fetched pages and command output
const OUTPUT_CAP: usize = 16 * 1024;
/// Shell command wall clock
const SHELL_TIMEOUT: Duration = Duration::from_secs(30);
const SEARCH_RESULT_COUNT: usize = 5;

/// Contract for externally-registered MCP tools. The gateway composes
/// its tool list from the built-ins plus whatever a registered
/// collaborator contributes, and forwards calls it claims; discovery,
/// transport, and server lifecycle live outside the core.
#[async_trait]
pub trait McpToolCollaborator: Send + Sync {
    /// Definitions contributed by registered MCP servers, filtered to
    /// what `level` may see
    fn tools(&self, level: AccessLevel) -> Vec<Tool>;

    /// Whether `name` belongs to this collaborator at `level`
    fn provides(&self, name: &str, level: AccessLevel) -> bool;

    /// Forward a call to the owning MCP server. `Err` becomes the
    /// tool-role payload reported back to the model.
    async fn execute(&self, name: &str, arguments: &str) -> Result<String, String>;
}

/// Default collaborator: no MCP servers registered
pub struct NoopMcpTools;

#[async_trait]
impl McpToolCollaborator for NoopMcpTools {
    fn tools(&self, _level: AccessLevel) -> Vec<Tool> {
        Vec::new()
    }

    fn provides(&self, _name: &str, _level: AccessLevel) -> bool {
        false
    }

    async fn execute(&self, name: &str, _arguments: &str) -> Result<String, String> {
        Err(format!("no MCP collaborator registered for tool '{}'", name))
    }
}

/// One registered tool: definition plus execution policy
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
    /// Minimum effective level required to see and run this tool
    pub min_level: AccessLevel,
    /// Sequential tools mutate shared state and never run concurrently
    pub sequential: bool,
}

/// Server-side tools. The set offered to a request is whatever the
/// effective access level admits: built-ins plus the MCP
/// collaborator's contributions.
pub struct ToolRegistry {
    config: Arc<GatewayConfig>,
    secrets: SecretStore,
    http: reqwest::Client,
    specs: Vec<ToolSpec>,
    mcp: Arc<dyn McpToolCollaborator>,
}

impl ToolRegistry {
    pub fn new(
        config: Arc<GatewayConfig>,
        secrets: SecretStore,
        mcp: Arc<dyn McpToolCollaborator>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config,
            secrets,
            http,
            specs: builtin_specs(),
            mcp,
        }
    }

    /// OpenAI tool definitions visible at `level`: built-ins first,
    /// then MCP collaborator tools
    pub fn definitions_for_level(&self, level: AccessLevel) -> Vec<Tool> {
        let mut definitions: Vec<Tool> = self
            .specs
            .iter()
            .filter(|s| s.min_level <= level)
            .map(|s| Tool::function(s.name, s.description, s.parameters.clone()))
            .collect();
        definitions.extend(self.mcp.tools(level));
        definitions
    }

    pub fn is_executable(&self, name: &str, level: AccessLevel) -> bool {
        self.is_builtin(name, level) || self.mcp.provides(name, level)
    }

    fn is_builtin(&self, name: &str, level: AccessLevel) -> bool {
        self.specs
            .iter()
            .any(|s| s.name == name && s.min_level <= level)
    }

    /// MCP tools default to concurrent; only built-ins carry the
    /// sequential marker
    pub fn is_sequential(&self, name: &str) -> bool {
        self.specs.iter().any(|s| s.name == name && s.sequential)
    }

    /// Execute a tool call. `Err` carries the payload reported back to
    /// the model; it is never fatal to the loop.
    pub async fn execute(
        &self,
        name: &str,
        arguments: &str,
        level: AccessLevel,
    ) -> Result<String, String> {
        if !self.is_builtin(name, level) {
            // Collaborator tools pass their raw argument string through
            if self.mcp.provides(name, level) {
                debug!(tool = %name, "Forwarding tool call to MCP collaborator");
                return self.mcp.execute(name, arguments).await;
            }
            return Err(format!("tool '{}' is not available at this access level", name));
        }
        let args: Value = serde_json::from_str(arguments)
            .map_err(|e| format!("invalid tool arguments: {}", e))?;

        debug!(tool = %name, "Executing tool");
        match name {
            "get_time" => Ok(chrono::Local::now().format("%Y-%m-%d %H:%M:%S %Z").to_string()),
            "web_search" => self.web_search(&args).await,
            "http_fetch" => self.http_fetch(&args).await,
            "read_file" => self.read_file(&args).await,
            "list_dir" => self.list_dir(&args).await,
            "write_file" => self.write_file(&args).await,
            "shell" => self.shell(&args).await,
            other => Err(format!("unknown tool '{}'", other)),
        }
    }

    async fn web_search(&self, args: &Value) -> Result<String, String> {
        let query = require_str(args, "query")?;
        let secrets = self.secrets.snapshot();
        let (key, cx) = match (&secrets.search_key, &secrets.search_cx) {
            (Some(k), Some(c)) => (k.clone(), c.clone()),
            _ => return Err("web search is not configured on this gateway".into()),
        };

        let response = self
            .http
            .get("https://www.googleapis.com/customsearch/v1")
            .query(&[("key", key.as_str()), ("cx", cx.as_str()), ("q", query)])
            .send()
            .await
            .map_err(|e| format!("search request failed: {}", e))?;
        if !response.status().is_success() {
            return Err(format!("search returned status {}", response.status()));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| format!("search response unreadable: {}", e))?;

        let results: Vec<Value> = body["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .take(SEARCH_RESULT_COUNT)
                    .map(|item| {
                        json!({
                            "title": item["title"],
                            "link": item["link"],
                            "snippet": item["snippet"],
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(json!({ "query": query, "results": results }).to_string())
    }

    async fn http_fetch(&self, args: &Value) -> Result<String, String> {
        let url = require_str(args, "url")?;
        if self.config.ssrf_protection {
            validate_outbound_url(url).map_err(|e| format!("URL rejected: {}", e))?;
        }
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| format!("fetch failed: {}", e))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Ok(json!({
            "status": status.as_u16(),
            "body": cap_output(&body),
        })
        .to_string())
    }

    async fn read_file(&self, args: &Value) -> Result<String, String> {
        let path = self.sandbox_path(require_str(args, "path")?)?;
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("read failed: {}", e))?;
        Ok(cap_output(&contents))
    }

    async fn list_dir(&self, args: &Value) -> Result<String, String> {
        let rel = args["path"].as_str().unwrap_or(".");
        let path = self.sandbox_path(rel)?;
        let mut entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| format!("list failed: {}", e))?;
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(json!({ "entries": names }).to_string())
    }

    async fn write_file(&self, args: &Value) -> Result<String, String> {
        let path = self.sandbox_path(require_str(args, "path")?)?;
        let content = require_str(args, "content")?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("mkdir failed: {}", e))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| format!("write failed: {}", e))?;
        Ok(json!({ "written": content.len() }).to_string())
    }

    async fn shell(&self, args: &Value) -> Result<String, String> {
        let command_line = require_str(args, "command")?;
        let mut parts = command_line.split_whitespace();
        let program = parts.next().ok_or("empty command")?;
        if !self.config.allowed_commands.iter().any(|c| c == program) {
            warn!(command = %program, "Blocked shell command");
            return Err(format!("command '{}' is not on the allowed list", program));
        }

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(parts)
            .current_dir(&self.config.sandbox_root)
            .kill_on_drop(true);
        // Sandbox root must exist for current_dir
        let _ = tokio::fs::create_dir_all(&self.config.sandbox_root).await;

        let output = tokio::time::timeout(SHELL_TIMEOUT, cmd.output())
            .await
            .map_err(|_| "command timed out".to_string())?
            .map_err(|e| format!("spawn failed: {}", e))?;

        Ok(json!({
            "exit_code": output.status.code(),
            "stdout": cap_output(&String::from_utf8_lossy(&output.stdout)),
            "stderr": cap_output(&String::from_utf8_lossy(&output.stderr)),
        })
        .to_string())
    }

    /// Resolve a relative path inside the sandbox root, rejecting
    /// absolute paths and parent traversal.
    fn sandbox_path(&self, rel: &str) -> Result<PathBuf, String> {
        let candidate = Path::new(rel);
        if candidate.is_absolute() {
            return Err("absolute paths are not allowed".into());
        }
        for component in candidate.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err("path escapes the sandbox".into()),
            }
        }
        Ok(self.config.sandbox_root.join(candidate))
    }
}

/// Human-readable progress label emitted before each tool execution
pub fn progress_label(name: &str, arguments: &str) -> String {
    let args: Value = serde_json::from_str(arguments).unwrap_or(Value::Null);
    let preview = |key: &str| -> String {
        let raw = args[key].as_str().unwrap_or("");
        let mut short: String = raw.chars().take(60).collect();
        if raw.chars().count() > 60 {
            short.push('…');
        }
        short
    };
    match name {
        "web_search" => format!("[searching: \"{}\"]", preview("query")),
        "http_fetch" => format!("[fetching: {}]", preview("url")),
        "read_file" => format!("[reading: {}]", preview("path")),
        "write_file" => format!("[writing: {}]", preview("path")),
        "list_dir" => format!("[listing: {}]", preview("path")),
        "shell" => format!("[running: {}]", preview("command")),
        "get_time" => "[checking time]".to_string(),
        other => format!("[{}]", other),
    }
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("missing required argument '{}'", key))
}

fn cap_output(s: &str) -> String {
    if s.len() <= OUTPUT_CAP {
        return s.to_string();
    }
    let mut end = OUTPUT_CAP;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated]", &s[..end])
}

fn builtin_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "get_time",
            description: "Get the current local date and time",
            parameters: json!({ "type": "object", "properties": {} }),
            min_level: AccessLevel::Read,
            sequential: false,
        },
        ToolSpec {
            name: "web_search",
            description: "Search the web and return the top results",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" }
                },
                "required": ["query"]
            }),
            min_level: AccessLevel::Read,
            sequential: false,
        },
        ToolSpec {
            name: "http_fetch",
            description: "Fetch a public URL and return its body",
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "Absolute http(s) URL" }
                },
                "required": ["url"]
            }),
            min_level: AccessLevel::Read,
            sequential: false,
        },
        ToolSpec {
            name: "read_file",
            description: "Read a file from the gateway's sandbox directory",
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Path relative to the sandbox root" }
                },
                "required": ["path"]
            }),
            min_level: AccessLevel::Read,
            sequential: false,
        },
        ToolSpec {
            name: "list_dir",
            description: "List a directory inside the sandbox",
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Path relative to the sandbox root" }
                }
            }),
            min_level: AccessLevel::Read,
            sequential: false,
        },
        ToolSpec {
            name: "write_file",
            description: "Write a file inside the gateway's sandbox directory",
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
            min_level: AccessLevel::Write,
            sequential: true,
        },
        ToolSpec {
            name: "shell",
            description: "Run an allowed command in the sandbox",
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Command line to execute" }
                },
                "required": ["command"]
            }),
            min_level: AccessLevel::Execute,
            sequential: true,
        },
    ]
}
