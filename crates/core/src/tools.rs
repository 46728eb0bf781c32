//! Mentor Tool Service
//!
//! The function tools the mentor agents call during a realtime session,
//! exposed over the Model Context Protocol (MCP). Every tool answers with a
//! JSON object; failures are reported as `{"error": ...}` results rather than
//! tool errors so the agent can react to them in conversation.
//!
//! `McpToolExecutor` runs the service in-process and adapts it to the
//! transport's `ToolExecutor` seam.

use crate::transport::{ToolDefinition, ToolExecutor};
use async_trait::async_trait;
use rmcp::{
    ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{CallToolRequestParam, RawContent, ServerCapabilities, ServerInfo},
    service::{RoleClient, RunningService},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Model used for reading map screenshots.
pub const VISION_MODEL: &str = "gpt-4o-mini";

const VISION_SYSTEM_PROMPT: &str = "You are an expert at reading screenshots of Sensemaker-style mind maps.
Return a compact JSON object with:
- nodes: [{ id, title }]
- clusters: [{ name, nodeIds: [ids] }]
- connections: [{ fromId, toId, type }] // type can be 'link' | 'friction' | 'group'
- insights: [{ title, rationale }]
If text is ambiguous or unreadable, include a best-effort guess and add rationale.";

const VISION_USER_PROMPT: &str =
    "Extract structured content from this map screenshot. Respond with a single JSON object only.";

/// Letters, digits, dot, dash and underscore only. Keeps lookups inside their directory.
pub fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

// --- Data Structures for Tools ---

#[derive(Deserialize, JsonSchema, Debug)]
pub struct ReferenceReadArgs {
    #[schemars(
        description = "File name within the reference directory (e.g., 'Atchalta_FieldGuide.md'). Allowed chars: letters, numbers, dot, dash, underscore."
    )]
    pub filename: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct NoteArgs {
    #[schemars(description = "Raw note text to normalize.")]
    pub text: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct ClusterHintArgs {
    #[schemars(description = "List of concept titles to cluster.")]
    pub titles: Vec<String>,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct VisionReadArgs {
    /// Image filename in the uploads location.
    #[schemars(
        description = "Optional. Image filename in the uploads location (e.g., 'map1.png'). Allowed chars: letters, numbers, dot, dash, underscore."
    )]
    pub filename: Option<String>,
    #[schemars(description = "Optional. Full URL to the image. If provided, takes precedence over filename.")]
    pub image_url: Option<String>,
}

/// Where the tools find their inputs.
#[derive(Debug, Clone)]
pub struct MentorToolConfig {
    /// Directory holding the reference documents.
    pub refs_dir: PathBuf,
    /// URL prefix for uploaded images referenced by filename.
    pub uploads_base: String,
    /// The backend's `POST /api/responses` endpoint.
    pub responses_url: String,
}

impl MentorToolConfig {
    /// Derives the endpoint URLs from the backend origin.
    pub fn new(api_base_url: &str, refs_dir: impl Into<PathBuf>) -> Self {
        let base = api_base_url.trim_end_matches('/');
        Self {
            refs_dir: refs_dir.into(),
            uploads_base: format!("{base}/atchalta/uploads"),
            responses_url: format!("{base}/api/responses"),
        }
    }
}

// --- Service and Handler Implementation ---

pub struct MentorToolService {
    config: MentorToolConfig,
    http: reqwest::Client,
    tool_router: ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for MentorToolService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[tool_router]
impl MentorToolService {
    pub fn new(config: MentorToolConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Reads a reference document (Markdown or text) from the mentor's reference library. Returns the full text content."
    )]
    pub async fn reference_read(
        &self,
        args: Parameters<ReferenceReadArgs>,
    ) -> Result<String, String> {
        info!(filename = %args.0.filename, "Executing tool 'reference_read'");
        let filename = &args.0.filename;
        if !is_safe_filename(filename) {
            return Ok(json!({ "error": "invalid_filename" }).to_string());
        }
        let path = self.config.refs_dir.join(filename);
        let result = match tokio::fs::read_to_string(&path).await {
            Ok(content) => json!({ "url": path.display().to_string(), "content": content }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => json!({ "error": "not_found" }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read reference");
                json!({ "error": "fetch_failed" })
            }
        };
        Ok(result.to_string())
    }

    #[tool(
        description = "Append or transform notes for mapping; returns normalized text blocks ready to paste into Conceptor."
    )]
    pub async fn sensemaker_note(&self, args: Parameters<NoteArgs>) -> Result<String, String> {
        info!("Executing tool 'sensemaker_note'");
        Ok(json!({ "normalized": normalize_note(&args.0.text) }).to_string())
    }

    #[tool(description = "Suggest tentative clusters and names from a set of concept titles.")]
    pub async fn sensemaker_cluster_hint(
        &self,
        args: Parameters<ClusterHintArgs>,
    ) -> Result<String, String> {
        info!(count = args.0.titles.len(), "Executing tool 'sensemaker_cluster_hint'");
        Ok(json!({ "clusters": cluster_hint(&args.0.titles) }).to_string())
    }

    #[tool(
        description = "Parse a Sensemaker mind map screenshot and return structured data (nodes, clusters, connections, insights). Accepts an uploaded filename or a full URL."
    )]
    pub async fn sensemaker_vision_read(
        &self,
        args: Parameters<VisionReadArgs>,
    ) -> Result<String, String> {
        info!(filename = ?args.0.filename, "Executing tool 'sensemaker_vision_read'");
        let url = match resolve_image_url(&args.0, &self.config.uploads_base) {
            Ok(url) => url,
            Err(error) => return Ok(json!({ "error": error }).to_string()),
        };
        Ok(self.read_map(&url).await.to_string())
    }
}

impl MentorToolService {
    async fn read_map(&self, url: &str) -> Value {
        let response = match self
            .http
            .post(&self.config.responses_url)
            .json(&vision_request(url))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Vision request failed");
                return json!({ "error": "fetch_failed" });
            }
        };
        let status = response.status();
        if !status.is_success() {
            return json!({ "error": "vision_failed", "status": status.as_u16() });
        }
        let completion: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Vision response was not JSON");
                return json!({ "error": "fetch_failed" });
            }
        };
        let text = output_text(&completion);
        match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => json!({ "image_url": url, "parsed": parsed }),
            Err(_) => json!({ "image_url": url, "raw": text }),
        }
    }
}

/// Trims every line and drops the empty ones.
pub fn normalize_note(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Splits the non-empty titles in two at the rounded-up midpoint.
pub fn cluster_hint(titles: &[String]) -> Value {
    let titles: Vec<&str> = titles
        .iter()
        .map(String::as_str)
        .filter(|t| !t.is_empty())
        .collect();
    let midpoint = titles.len().div_ceil(2);
    json!([
        { "name": "Cluster A", "titles": &titles[..midpoint] },
        { "name": "Cluster B", "titles": &titles[midpoint..] },
    ])
}

/// An explicit `image_url` wins over `filename`.
fn resolve_image_url(args: &VisionReadArgs, uploads_base: &str) -> Result<String, &'static str> {
    if let Some(url) = args.image_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        return Ok(url.to_string());
    }
    match args.filename.as_deref() {
        Some(name) if !is_safe_filename(name) => Err("invalid_filename"),
        Some(name) => Ok(format!("{}/{}", uploads_base.trim_end_matches('/'), name)),
        None => Err("missing_image"),
    }
}

fn vision_request(image_url: &str) -> Value {
    json!({
        "model": VISION_MODEL,
        "input": [
            {
                "role": "system",
                "content": [{ "type": "input_text", "text": VISION_SYSTEM_PROMPT }],
            },
            {
                "role": "user",
                "content": [
                    { "type": "input_text", "text": VISION_USER_PROMPT },
                    { "type": "input_image", "image_url": image_url },
                ],
            },
        ],
    })
}

/// Concatenates the `output_text` parts of every `message` output item.
pub fn output_text(completion: &Value) -> String {
    completion
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|item| item["type"] == "message")
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter(|part| part["type"] == "output_text")
        .filter_map(|part| part["text"].as_str())
        .collect()
}

// --- In-process MCP client ---

/// Runs a `MentorToolService` in-process and calls it through an MCP client.
pub struct McpToolExecutor {
    client: RunningService<RoleClient, ()>,
    server: JoinHandle<()>,
}

impl McpToolExecutor {
    pub async fn start(service: MentorToolService) -> anyhow::Result<Self> {
        let (server_transport, client_transport) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            match service.serve(server_transport).await {
                Ok(running) => {
                    let _ = running.waiting().await;
                }
                Err(e) => warn!(error = %e, "Mentor tool service failed to start"),
            }
        });
        let client = ().serve(client_transport).await?;
        Ok(Self { client, server })
    }
}

impl Drop for McpToolExecutor {
    fn drop(&mut self) {
        self.server.abort();
    }
}

#[async_trait]
impl ToolExecutor for McpToolExecutor {
    async fn definitions(&self) -> anyhow::Result<Vec<ToolDefinition>> {
        self.client
            .list_all_tools()
            .await?
            .into_iter()
            .map(|t| {
                Ok::<_, anyhow::Error>(ToolDefinition {
                    name: t.name.to_string(),
                    description: t.description.map(|d| d.to_string()).unwrap_or_default(),
                    parameters: serde_json::to_value(&*t.input_schema)?,
                })
            })
            .collect()
    }

    async fn call(&self, name: &str, arguments: Value) -> Value {
        let result = self
            .client
            .peer()
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: arguments.as_object().cloned(),
            })
            .await;
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = name, error = %e, "Tool call failed");
                return json!({ "error": "tool_failed", "details": e.to_string() });
            }
        };

        let text = result
            .content
            .unwrap_or_default()
            .into_iter()
            .find_map(|content| match content.raw {
                RawContent::Text(text) => Some(text.text),
                _ => None,
            })
            .unwrap_or_default();
        if result.is_error.unwrap_or(false) {
            return json!({ "error": text });
        }
        serde_json::from_str(&text).unwrap_or_else(|_| json!({ "result": text }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(refs_dir: impl Into<PathBuf>) -> MentorToolService {
        MentorToolService::new(MentorToolConfig::new("http://127.0.0.1:9", refs_dir))
    }

    fn parse(result: Result<String, String>) -> Value {
        serde_json::from_str(&result.unwrap()).unwrap()
    }

    #[test]
    fn filename_rules() {
        assert!(is_safe_filename("Atchalta_FieldGuide.md"));
        assert!(is_safe_filename("map-1.png"));
        assert!(!is_safe_filename("../secret"));
        assert!(!is_safe_filename("a b"));
        assert!(!is_safe_filename(""));
    }

    #[test]
    fn note_normalization() {
        assert_eq!(normalize_note("  one \n\n\t two\n   \nthree  "), "one\ntwo\nthree");
    }

    #[test]
    fn cluster_hint_splits_at_rounded_up_midpoint() {
        let titles: Vec<String> = ["a", "", "b", "c"].iter().map(|s| s.to_string()).collect();
        let clusters = cluster_hint(&titles);
        assert_eq!(clusters[0], json!({ "name": "Cluster A", "titles": ["a", "b"] }));
        assert_eq!(clusters[1], json!({ "name": "Cluster B", "titles": ["c"] }));
        assert_eq!(cluster_hint(&[])[0]["titles"], json!([]));
    }

    #[test]
    fn image_url_takes_precedence() {
        let base = "http://localhost:3000/atchalta/uploads";
        let args = VisionReadArgs {
            filename: Some("map.png".into()),
            image_url: Some("  https://example.com/x.png ".into()),
        };
        assert_eq!(resolve_image_url(&args, base).unwrap(), "https://example.com/x.png");

        let args = VisionReadArgs { filename: Some("map.png".into()), image_url: Some("  ".into()) };
        assert_eq!(resolve_image_url(&args, base).unwrap(), format!("{base}/map.png"));

        let args = VisionReadArgs { filename: Some("../x".into()), image_url: None };
        assert_eq!(resolve_image_url(&args, base), Err("invalid_filename"));

        let args = VisionReadArgs { filename: None, image_url: None };
        assert_eq!(resolve_image_url(&args, base), Err("missing_image"));
    }

    #[test]
    fn output_text_joins_message_parts() {
        let completion = json!({
            "output": [
                { "type": "function_call", "name": "x" },
                { "type": "message", "content": [
                    { "type": "output_text", "text": "{\"nodes\":" },
                    { "type": "refusal", "text": "no" },
                    { "type": "output_text", "text": "[]}" }
                ]}
            ]
        });
        assert_eq!(output_text(&completion), "{\"nodes\":[]}");
        assert_eq!(output_text(&json!({})), "");
    }

    #[tokio::test]
    async fn reference_read_reads_from_refs_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("guide.md"), "# Field Guide").unwrap();
        let service = service(dir.path());

        let found = parse(
            service
                .reference_read(Parameters(ReferenceReadArgs { filename: "guide.md".into() }))
                .await,
        );
        assert_eq!(found["content"], "# Field Guide");

        let missing = parse(
            service
                .reference_read(Parameters(ReferenceReadArgs { filename: "nope.md".into() }))
                .await,
        );
        assert_eq!(missing, json!({ "error": "not_found" }));

        let unsafe_name = parse(
            service
                .reference_read(Parameters(ReferenceReadArgs { filename: "../etc/passwd".into() }))
                .await,
        );
        assert_eq!(unsafe_name, json!({ "error": "invalid_filename" }));
    }

    #[tokio::test]
    async fn vision_read_without_image_reports_missing_image() {
        let result = parse(
            service("refs")
                .sensemaker_vision_read(Parameters(VisionReadArgs { filename: None, image_url: None }))
                .await,
        );
        assert_eq!(result, json!({ "error": "missing_image" }));
    }

    #[tokio::test]
    async fn executor_lists_and_calls_tools_over_mcp() {
        let executor = McpToolExecutor::start(service("refs")).await.unwrap();

        let mut names: Vec<String> = executor
            .definitions()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        names.sort();
        assert_eq!(
            names,
            [
                "reference_read",
                "sensemaker_cluster_hint",
                "sensemaker_note",
                "sensemaker_vision_read"
            ]
        );

        let result = executor
            .call("sensemaker_note", json!({ "text": " a \n\n b " }))
            .await;
        assert_eq!(result, json!({ "normalized": "a\nb" }));
    }
}
