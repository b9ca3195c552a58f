use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{GeneratedMedia, GenerationRequest, MediaBackend, ToolKind};
use proto::MediaKind;

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    tool: &'a str,
    kind: ToolKind,
    instruction: &'a str,
    output_kind: MediaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
    inputs: Vec<WireInput<'a>>,
}

#[derive(Debug, Serialize)]
struct WireInput<'a> {
    name: &'a str,
    version: u32,
    mime_type: &'a str,
    data_b64: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    status: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    data_b64: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

// ── Backend ───────────────────────────────────────────────────────────────────

/// Remote generation service reached over HTTP.
///
/// Sends one JSON request per invocation with the inputs base64 encoded and
/// expects `{"status": "success", "mime_type": ..., "data_b64": ...}` back.
pub struct HttpMediaBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpMediaBackend {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl MediaBackend for HttpMediaBackend {
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedMedia, String> {
        let body = encode_request(&request);
        debug!(
            tool = %request.tool_name,
            inputs = request.inputs.len(),
            endpoint = %self.endpoint,
            "Sending generation request"
        );

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        let text = response.text().await.map_err(|e| e.to_string())?;
        if !status.is_success() {
            warn!(status = %status, tool = %request.tool_name, "Generation backend returned an error status");
            return Err(format!(
                "HTTP {status}: {}",
                text.chars().take(500).collect::<String>()
            ));
        }

        decode_response(&text, request.output_kind)
    }
}

fn encode_request(request: &GenerationRequest) -> WireRequest<'_> {
    let engine = base64::engine::general_purpose::STANDARD;
    WireRequest {
        tool: &request.tool_name,
        kind: request.kind,
        instruction: &request.instruction,
        output_kind: request.output_kind,
        duration_seconds: request.clip.duration_seconds,
        negative_prompt: request.clip.negative_prompt.as_deref(),
        inputs: request
            .inputs
            .iter()
            .map(|input| WireInput {
                name: &input.name,
                version: input.version,
                mime_type: &input.mime_type,
                data_b64: engine.encode(&input.data),
            })
            .collect(),
    }
}

fn decode_response(body: &str, output_kind: MediaKind) -> Result<GeneratedMedia, String> {
    let parsed: WireResponse = serde_json::from_str(body).map_err(|e| {
        format!(
            "invalid backend response: {e}; body: {}",
            body.chars().take(200).collect::<String>()
        )
    })?;

    if parsed.status != "success" {
        return Err(parsed
            .message
            .unwrap_or_else(|| format!("backend status '{}'", parsed.status)));
    }

    let encoded = parsed
        .data_b64
        .ok_or_else(|| "backend response has no media payload".to_string())?;
    let data = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("backend payload is not valid base64: {e}"))?;

    Ok(GeneratedMedia {
        data,
        mime_type: parsed
            .mime_type
            .unwrap_or_else(|| output_kind.default_mime().to_string()),
    })
}
