//! Reasoning-engine abstraction and the OpenAI-compatible adapter.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionToolType,
        CreateChatCompletionRequestArgs, FinishReason, FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use proto::{ArtifactSummary, LlmError, ToolCall, ToolDefinition};
use serde_json::Value;
use tracing::debug;

/// Represents a message in a chat history
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: proto::Role,
    /// Text content. Uploads appear here only as reference lines.
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    /// Tool calls requested by assistant messages.
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    fn with_role(role: proto::Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
            tool_calls: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(proto::Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(proto::Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(proto::Role::Assistant, content)
    }

    /// Creates a tool-result message linking a call id, tool name, and output content.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            ..Self::with_role(proto::Role::Tool, content)
        }
    }
}

/// Request to the reasoning engine
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Transcript including system/user/assistant/tool messages.
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub model: String,
    /// Artifacts the engine may reference, in stable order.
    pub artifacts: Vec<ArtifactSummary>,
}

/// Token usage reported by the LLM for a single call.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Accumulates another usage record into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Response from the reasoning engine
#[derive(Debug)]
pub enum ChatResponse {
    /// Final assistant text response.
    Text(String, TokenUsage),
    /// Assistant requested one or more tool calls.
    ToolCalls(Vec<ToolCall>, TokenUsage),
}

/// LLM provider trait
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Sends a chat request to the provider and returns either text or tool calls.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError>;
}

/// Renders the artifact list as a system-context block.
pub fn render_artifact_context(artifacts: &[ArtifactSummary]) -> String {
    if artifacts.is_empty() {
        return "Artifacts in this conversation: none yet.".to_string();
    }
    let mut out = String::from(
        "Artifacts in this conversation (reference them by these exact names; \
         append @vN for an older version):\n",
    );
    for (i, a) in artifacts.iter().enumerate() {
        out.push_str(&format!(
            "{}. {} ({}, latest v{}, from {})\n",
            i + 1,
            a.name,
            a.media_kind,
            a.latest_version,
            a.produced_by
        ));
    }
    out
}

/// OpenAI-compatible provider (works with OpenAI and compatible gateways)
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAiProvider {
    /// Creates an OpenAI provider using the default API base URL.
    pub fn new(api_key: impl Into<String>) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        Self {
            client: Client::with_config(config),
        }
    }

    /// Creates an OpenAI provider with a custom API base URL.
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url);
        Self {
            client: Client::with_config(config),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError> {
        let messages: Vec<ChatCompletionRequestMessage> = with_artifact_context(&req)
            .iter()
            .map(convert_message)
            .collect::<Result<_, _>>()?;

        let tools: Vec<ChatCompletionTool> = req
            .tools
            .iter()
            .map(convert_tool)
            .collect::<Result<_, _>>()?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&req.model).messages(messages);
        if !tools.is_empty() {
            builder.tools(tools);
        }
        let request = builder
            .build()
            .map_err(|e| LlmError::Serialization(e.to_string()))?;

        debug!(
            model = %req.model,
            messages = %req.messages.len(),
            tools = %req.tools.len(),
            artifacts = %req.artifacts.len(),
            "Sending request to OpenAI"
        );

        let response = self.client.chat().create(request).await.map_err(|e| {
            let msg = e.to_string();
            debug!(error = %msg, "OpenAI API error");
            if msg.contains("rate limit") || msg.contains("429") {
                LlmError::RateLimit
            } else {
                LlmError::Api(msg)
            }
        })?;

        let usage = TokenUsage {
            prompt_tokens: response.usage.as_ref().map_or(0, |u| u.prompt_tokens),
            completion_tokens: response.usage.as_ref().map_or(0, |u| u.completion_tokens),
        };
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("No choices in response".into()))?;

        let tool_calls = choice.message.tool_calls.unwrap_or_default();
        if matches!(choice.finish_reason, Some(FinishReason::ToolCalls)) || !tool_calls.is_empty()
        {
            let calls = tool_calls
                .into_iter()
                .map(|tc| ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments: parse_tool_arguments(&tc.function.arguments),
                })
                .collect();
            return Ok(ChatResponse::ToolCalls(calls, usage));
        }
        Ok(ChatResponse::Text(
            choice.message.content.unwrap_or_default(),
            usage,
        ))
    }
}

/// Places the artifact block right after the leading system message.
fn with_artifact_context(req: &ChatRequest) -> Vec<ChatMessage> {
    let context = ChatMessage::system(render_artifact_context(&req.artifacts));
    let mut messages = Vec::with_capacity(req.messages.len() + 1);
    let mut rest = req.messages.iter().peekable();
    while let Some(m) = rest.next_if(|m| m.role == proto::Role::System) {
        messages.push(m.clone());
    }
    messages.push(context);
    messages.extend(rest.cloned());
    messages
}

/// Converts internal chat message into OpenAI request format.
fn convert_message(m: &ChatMessage) -> Result<ChatCompletionRequestMessage, LlmError> {
    let ser = |e: async_openai::error::OpenAIError| LlmError::Serialization(e.to_string());
    match m.role {
        proto::Role::System => Ok(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(m.content.clone())
                .build()
                .map_err(ser)?,
        )),
        proto::Role::User => Ok(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(m.content.clone())
                .build()
                .map_err(ser)?,
        )),
        proto::Role::Assistant => {
            let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
            builder.content(m.content.clone());

            if let Some(tool_calls) = &m.tool_calls {
                let tc: Vec<async_openai::types::ChatCompletionMessageToolCall> = tool_calls
                    .iter()
                    .map(|tc| async_openai::types::ChatCompletionMessageToolCall {
                        id: tc.id.clone(),
                        r#type: ChatCompletionToolType::Function,
                        function: async_openai::types::FunctionCall {
                            name: tc.name.clone(),
                            arguments: tc.arguments.to_string(),
                        },
                    })
                    .collect();
                builder.tool_calls(tc);
            }

            Ok(ChatCompletionRequestMessage::Assistant(
                builder.build().map_err(ser)?,
            ))
        }
        proto::Role::Tool => {
            let call_id = m
                .tool_call_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            Ok(ChatCompletionRequestMessage::Tool(
                ChatCompletionRequestToolMessageArgs::default()
                    .tool_call_id(call_id)
                    .content(m.content.clone())
                    .build()
                    .map_err(ser)?,
            ))
        }
    }
}

/// Converts a tool definition into an OpenAI function-tool declaration.
fn convert_tool(t: &ToolDefinition) -> Result<ChatCompletionTool, LlmError> {
    Ok(ChatCompletionTool {
        r#type: ChatCompletionToolType::Function,
        function: FunctionObjectArgs::default()
            .name(t.name.clone())
            .description(t.description.clone())
            .parameters(t.parameters.clone())
            .build()
            .map_err(|e| LlmError::Serialization(e.to_string()))?,
    })
}

/// Parses tool call argument JSON. Malformed JSON is kept as a string so the
/// mediator reports it as invalid arguments.
fn parse_tool_arguments(arguments: &str) -> Value {
    serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
}
