//! Turn pipeline: upload interception, reasoning loop, tool mediation.

use std::sync::Arc;

use proto::{
    AgentMessage, AgentResponse, ArtifactSummary, ConversationId, Error, InboundTurn,
    LlmError, ProgressEvent, Role,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tools::MediaBackend;
use tracing::{debug, info, warn};

use crate::{
    binder::ConversationRegistry,
    interceptor::UploadInterceptor,
    llm::{ChatMessage, ChatRequest, ChatResponse, LlmProvider, TokenUsage},
    mediator::ToolMediator,
    store::ArtifactStore,
    tool_registry::ToolRegistry,
    turn_log::TurnLog,
};

const SYSTEM_PROMPT: &str = r#"You are a product photo and video studio assistant.
Users upload product photos and ask you to edit them, combine them, create new concept images, or turn them into short marketing clips.

Rules:
- Refer to media only by the artifact names in the artifact list. Never invent a name.
- When the user says "the second photo" or similar, use the numbered order of the artifact list. Ask when it is still unclear.
- Make one kind of change per edit call and chain calls for complex edits.
- For videos, describe camera movement, lighting, subject action and environment in the instruction.
- When tools finish, tell the user which artifact names now hold the results."#;
const MAX_CONTEXT_MESSAGES: usize = 40;

/// Tunables for [`StudioRuntime`].
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub model: String,
    pub max_tool_rounds: usize,
    pub max_upload_bytes: u64,
}

/// What `close_conversation` removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseReport {
    pub was_open: bool,
    pub artifacts_removed: u64,
    pub transcript_removed: bool,
}

/// The per-process conversation runtime.
pub struct StudioRuntime {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn ArtifactStore>,
    turn_log: Arc<TurnLog>,
    conversations: ConversationRegistry,
    interceptor: UploadInterceptor,
    mediator: ToolMediator,
    model: String,
    max_tool_rounds: usize,
}

impl StudioRuntime {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn ArtifactStore>,
        turn_log: Arc<TurnLog>,
        backend: Arc<dyn MediaBackend>,
        registry: Arc<ToolRegistry>,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            interceptor: UploadInterceptor::new(store.clone(), options.max_upload_bytes),
            mediator: ToolMediator::new(store.clone(), backend, registry),
            conversations: ConversationRegistry::new(),
            llm,
            store,
            turn_log,
            model: options.model,
            max_tool_rounds: options.max_tool_rounds,
        }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn turn_log(&self) -> &Arc<TurnLog> {
        &self.turn_log
    }

    /// Current artifact list of a conversation (open or not).
    pub async fn artifacts(&self, conversation: &ConversationId) -> Result<Vec<ArtifactSummary>, Error> {
        Ok(self.store.list(conversation).await?)
    }

    /// Processes one inbound turn end to end.
    ///
    /// Item- and invocation-scoped failures are reported in the response.
    /// Fatal store failures and cancellation end the turn with an error.
    pub async fn process_turn(
        &self,
        turn: InboundTurn,
        cancel: &CancellationToken,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<AgentResponse, Error> {
        let conversation = turn.conversation_id.clone();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let binder = self.conversations.open(&conversation, &*self.store).await?;
        self.turn_log.ensure_conversation(&conversation).await?;

        let intercepted = self.interceptor.intercept(turn, &binder).await?;
        if let Some(tx) = &progress {
            for meta in &intercepted.stored {
                let _ = tx.try_send(ProgressEvent::UploadStored {
                    artifact: meta.artifact_ref(),
                    media_kind: meta.media_kind,
                });
            }
            for rejected in &intercepted.rejected {
                let _ = tx.try_send(ProgressEvent::UploadRejected {
                    item: rejected.item.clone(),
                    reason: rejected.reason.clone(),
                });
            }
        }

        let user_msg = AgentMessage::new(conversation.clone(), Role::User, intercepted.turn.render());
        self.turn_log.save_message(&user_msg).await?;

        let history = trim_conversation_history(self.turn_log.load_conversation(&conversation).await?);
        let mut messages = history_to_chat_messages(SYSTEM_PROMPT, &history);
        let tool_defs = self.mediator.registry().definitions();

        let mut response = AgentResponse::new(conversation.clone(), String::new());
        response.rejected_uploads = intercepted.rejected;
        let mut total_usage = TokenUsage::default();
        let mut round = 0;

        loop {
            if round >= self.max_tool_rounds {
                warn!(conversation = %conversation, "Max tool rounds ({}) reached", self.max_tool_rounds);
                return Err(Error::Llm(LlmError::MaxToolRoundsExceeded));
            }
            if let Some(tx) = &progress {
                let _ = tx.try_send(ProgressEvent::Thinking { round });
            }

            let req = ChatRequest {
                messages: messages.clone(),
                tools: tool_defs.clone(),
                model: self.model.clone(),
                artifacts: binder.read().candidates().to_vec(),
            };
            debug!(conversation = %conversation, round, "LLM call");
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                reply = self.llm.chat(req) => reply?,
            };

            match reply {
                ChatResponse::Text(text, usage) => {
                    total_usage.add(&usage);
                    info!(
                        conversation = %conversation,
                        produced = response.produced.len(),
                        failed = response.failed_steps.len(),
                        prompt_tokens = total_usage.prompt_tokens,
                        completion_tokens = total_usage.completion_tokens,
                        "Turn complete"
                    );
                    let assistant_msg = AgentMessage::new(conversation.clone(), Role::Assistant, &text);
                    self.turn_log.save_message(&assistant_msg).await?;
                    self.turn_log.touch_conversation(&conversation).await?;
                    response.content = text;
                    return Ok(response);
                }

                ChatResponse::ToolCalls(tool_calls, usage) => {
                    total_usage.add(&usage);
                    debug!(
                        "Tool calls requested: {:?}",
                        tool_calls.iter().map(|tc| &tc.name).collect::<Vec<_>>()
                    );
                    let assistant_msg =
                        AgentMessage::assistant_tool_calls(conversation.clone(), tool_calls.clone());
                    self.turn_log.save_message(&assistant_msg).await?;
                    let mut assistant = ChatMessage::assistant("");
                    assistant.tool_calls = Some(tool_calls.clone());
                    messages.push(assistant);

                    let outcomes = self
                        .mediator
                        .invoke_batch(&tool_calls, &binder, cancel, progress.as_ref())
                        .await;

                    for outcome in &outcomes {
                        let result = outcome.to_tool_result();
                        let tool_msg = AgentMessage::tool_result(
                            conversation.clone(),
                            &result.call_id,
                            &result.tool_name,
                            &result.output,
                        );
                        self.turn_log.save_message(&tool_msg).await?;
                        messages.push(ChatMessage::tool_result(
                            &result.call_id,
                            &result.tool_name,
                            &result.output,
                        ));
                        match &outcome.result {
                            Ok(meta) => response.produced.push(meta.artifact_ref()),
                            Err(_) => response.failed_steps.extend(outcome.failed_step()),
                        }
                    }

                    if let Some(Err(fatal)) = outcomes
                        .into_iter()
                        .find(|o| o.is_fatal())
                        .map(|o| o.result)
                    {
                        warn!(conversation = %conversation, error = %fatal, "Fatal store failure, ending turn");
                        return Err(Error::Invocation(fatal));
                    }
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    round += 1;
                }
            }
        }
    }

    /// Ends a conversation. With `purge`, its artifacts and transcript are
    /// deleted after the binder is dropped.
    pub async fn close_conversation(
        &self,
        conversation: &ConversationId,
        purge: bool,
    ) -> Result<CloseReport, Error> {
        let mut report = CloseReport {
            was_open: self.conversations.close(conversation),
            ..CloseReport::default()
        };
        if purge {
            report.artifacts_removed = self.store.delete_conversation(conversation).await?;
            report.transcript_removed = self.turn_log.delete_conversation(conversation).await?;
            info!(
                conversation = %conversation,
                artifacts = report.artifacts_removed,
                "Conversation purged"
            );
        }
        Ok(report)
    }
}

/// Keeps the most recent messages, starting on a user message so tool calls
/// and their results stay paired.
fn trim_conversation_history(history: Vec<AgentMessage>) -> Vec<AgentMessage> {
    if history.len() <= MAX_CONTEXT_MESSAGES {
        return history;
    }

    let start = history.len() - MAX_CONTEXT_MESSAGES;
    let offset = history[start..]
        .iter()
        .position(|m| m.role == Role::User)
        .unwrap_or(0);
    history[start + offset..].to_vec()
}

/// Tool result recorded for a call whose turn ended before it answered.
const INTERRUPTED_RESULT: &str = r#"{"status":"error","error_kind":"cancelled","message":"The tool call was interrupted before it finished. Nothing was saved."}"#;

/// Rebuilds the chat history, keeping every assistant tool call paired with
/// exactly one tool result. Calls left unanswered by an interrupted turn get
/// [`INTERRUPTED_RESULT`]; results without a matching call are dropped.
fn history_to_chat_messages(system_prompt: &str, history: &[AgentMessage]) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = vec![ChatMessage::system(system_prompt)];
    let mut unanswered: Vec<(String, String)> = Vec::new();

    for msg in history {
        match msg.role {
            Role::User => {
                close_unanswered(&mut messages, &mut unanswered);
                messages.push(ChatMessage::user(&msg.content));
            }
            Role::Assistant => {
                close_unanswered(&mut messages, &mut unanswered);
                let mut assistant = ChatMessage::assistant(&msg.content);
                if let Some(calls) = &msg.tool_calls {
                    unanswered = calls.iter().map(|c| (c.id.clone(), c.name.clone())).collect();
                }
                assistant.tool_calls = msg.tool_calls.clone();
                messages.push(assistant);
            }
            Role::Tool => {
                let call_id = msg.tool_call_id.as_deref().unwrap_or("");
                match unanswered.iter().position(|(id, _)| id == call_id) {
                    Some(pos) => {
                        unanswered.remove(pos);
                        messages.push(ChatMessage::tool_result(
                            call_id,
                            msg.tool_name.as_deref().unwrap_or(""),
                            &msg.content,
                        ));
                    }
                    None => debug!(call_id, "Dropping tool result without a matching call"),
                }
            }
            Role::System => {}
        }
    }
    close_unanswered(&mut messages, &mut unanswered);
    messages
}

fn close_unanswered(messages: &mut Vec<ChatMessage>, unanswered: &mut Vec<(String, String)>) {
    for (call_id, tool_name) in unanswered.drain(..) {
        warn!(call_id = %call_id, tool = %tool_name, "Tool call has no recorded result, marking interrupted");
        messages.push(ChatMessage::tool_result(call_id, tool_name, INTERRUPTED_RESULT));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use proto::{ArtifactRef, MediaAttachment, NewArtifact, StoreError, ToolCall};
    use tools::{GeneratedMedia, GenerationRequest};

    use super::*;
    use crate::db;
    use crate::store::MemoryArtifactStore;

    struct MockLlm {
        queue: Mutex<VecDeque<ChatResponse>>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl MockLlm {
        fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                queue: Mutex::new(VecDeque::from(responses)),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError> {
            self.seen.lock().expect("lock seen").push(req);
            self.queue
                .lock()
                .expect("lock queue")
                .pop_front()
                .ok_or_else(|| LlmError::InvalidResponse("No mock response left".to_string()))
        }
    }

    struct SuffixBackend;

    #[async_trait]
    impl MediaBackend for SuffixBackend {
        async fn generate(&self, request: GenerationRequest) -> Result<GeneratedMedia, String> {
            let mut data = request
                .inputs
                .first()
                .map(|i| i.data.clone())
                .unwrap_or_default();
            data.extend_from_slice(b"+edit");
            Ok(GeneratedMedia {
                data,
                mime_type: request.output_kind.default_mime().to_string(),
            })
        }
    }

    /// Store whose writes always fail.
    struct BrokenStore;

    #[async_trait]
    impl ArtifactStore for BrokenStore {
        async fn put(
            &self,
            _conversation: &ConversationId,
            _artifact: NewArtifact,
        ) -> Result<proto::ArtifactMeta, StoreError> {
            Err(StoreError::Storage("disk full".to_string()))
        }
        async fn get(
            &self,
            conversation: &ConversationId,
            name: &str,
            version: Option<u32>,
        ) -> Result<proto::Artifact, StoreError> {
            Err(crate::store::not_found(conversation, name, version))
        }
        async fn list(&self, _conversation: &ConversationId) -> Result<Vec<ArtifactSummary>, StoreError> {
            Ok(Vec::new())
        }
        async fn history(
            &self,
            conversation: &ConversationId,
            name: &str,
        ) -> Result<Vec<proto::ArtifactMeta>, StoreError> {
            Err(crate::store::not_found(conversation, name, None))
        }
        async fn delete_conversation(&self, _conversation: &ConversationId) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    async fn open_temp_log() -> Arc<TurnLog> {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let db_path = tempdir.path().join("studio.db");
        let pool = db::open_pool(&db_path.to_string_lossy())
            .await
            .expect("pool open");
        // Keep tempdir alive for test process lifetime.
        std::mem::forget(tempdir);
        Arc::new(TurnLog::new(pool))
    }

    fn options(max_tool_rounds: usize) -> RuntimeOptions {
        RuntimeOptions {
            model: "mock-model".to_string(),
            max_tool_rounds,
            max_upload_bytes: 1024,
        }
    }

    /// Backend that never answers.
    struct StalledBackend;

    #[async_trait]
    impl MediaBackend for StalledBackend {
        async fn generate(&self, _request: GenerationRequest) -> Result<GeneratedMedia, String> {
            std::future::pending().await
        }
    }

    async fn runtime_with(
        llm: Arc<MockLlm>,
        store: Arc<dyn ArtifactStore>,
        max_tool_rounds: usize,
    ) -> StudioRuntime {
        runtime_with_backend(llm, store, Arc::new(SuffixBackend), max_tool_rounds).await
    }

    async fn runtime_with_backend(
        llm: Arc<MockLlm>,
        store: Arc<dyn ArtifactStore>,
        backend: Arc<dyn MediaBackend>,
        max_tool_rounds: usize,
    ) -> StudioRuntime {
        StudioRuntime::new(
            llm,
            store,
            open_temp_log().await,
            backend,
            Arc::new(ToolRegistry::builtin()),
            options(max_tool_rounds),
        )
    }

    /// Every assistant tool call must be answered by exactly one tool result
    /// before the next non-tool message.
    fn assert_tool_calls_paired(messages: &[ChatMessage]) {
        let mut i = 0;
        while i < messages.len() {
            let Some(calls) = &messages[i].tool_calls else {
                assert_ne!(messages[i].role, Role::Tool, "tool result without a call at {i}");
                i += 1;
                continue;
            };
            let mut answered: Vec<&str> = Vec::new();
            let mut j = i + 1;
            while j < messages.len() && messages[j].role == Role::Tool {
                answered.push(messages[j].tool_call_id.as_deref().unwrap_or(""));
                j += 1;
            }
            let mut expected: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
            answered.sort_unstable();
            expected.sort_unstable();
            assert_eq!(answered, expected, "unpaired tool calls at {i}");
            i = j;
        }
    }

    fn text(s: &str) -> ChatResponse {
        ChatResponse::Text(s.to_string(), TokenUsage::default())
    }

    fn edit_call(id: &str, target: &str, instruction: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "edit".to_string(),
            arguments: serde_json::json!({"input_artifacts": [target], "instruction": instruction}),
        }
    }

    #[tokio::test]
    async fn text_turn_persists_user_and_assistant_messages() {
        let llm = Arc::new(MockLlm::new(vec![text("Hello! Upload a photo to begin.")]));
        let runtime = runtime_with(llm, Arc::new(MemoryArtifactStore::new()), 4).await;
        let conv = ConversationId::from("conv-text");

        let response = runtime
            .process_turn(InboundTurn::text(conv.clone(), "hi"), &CancellationToken::new(), None)
            .await
            .expect("turn succeeds");
        assert_eq!(response.content, "Hello! Upload a photo to begin.");
        assert!(response.produced.is_empty());

        let history = runtime.turn_log().load_conversation(&conv).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn upload_then_edit_produces_new_version_and_reports_it() {
        let llm = Arc::new(MockLlm::new(vec![
            ChatResponse::ToolCalls(
                vec![edit_call("call-1", "soap.png", "add lavender sprigs")],
                TokenUsage::default(),
            ),
            text("Added lavender to soap.png."),
        ]));
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let runtime = runtime_with(llm.clone(), store.clone(), 4).await;
        let conv = ConversationId::from("conv-edit");
        let turn = InboundTurn::text(conv.clone(), "add lavender sprigs").with_media(
            MediaAttachment::new(Some("soap.png".into()), b"RAWSOAP".to_vec(), "image/png"),
        );

        let (tx, mut rx) = mpsc::channel(32);
        let response = runtime
            .process_turn(turn, &CancellationToken::new(), Some(tx))
            .await
            .expect("turn succeeds");
        assert_eq!(response.produced, vec![ArtifactRef::new("soap.png", 1)]);
        assert!(response.failed_steps.is_empty());

        let latest = store.get(&conv, "soap.png", None).await.expect("latest");
        assert_eq!(latest.data, b"RAWSOAP+edit");
        assert_eq!(latest.meta.produced_by, "edit");

        {
            let seen = llm.seen.lock().expect("seen");
            assert_eq!(seen[0].artifacts.len(), 1);
            assert_eq!(seen[0].artifacts[0].latest_version, 0);
            assert_eq!(seen[1].artifacts[0].latest_version, 1);
            assert!(seen[0].messages.iter().all(|m| !m.content.contains("RAWSOAP")));
            assert!(seen[0].messages.iter().any(|m| m.content.contains("soap.png (image)")));
        }

        let mut saw_upload = false;
        let mut saw_finish = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                ProgressEvent::UploadStored { artifact, .. } => {
                    saw_upload = artifact == ArtifactRef::new("soap.png", 0);
                }
                ProgressEvent::ToolCallFinished { output, .. } => {
                    saw_finish = output == Some(ArtifactRef::new("soap.png", 1));
                }
                _ => {}
            }
        }
        assert!(saw_upload && saw_finish);
    }

    #[tokio::test]
    async fn failed_step_is_reported_without_ending_turn() {
        let llm = Arc::new(MockLlm::new(vec![
            ChatResponse::ToolCalls(
                vec![edit_call("call-1", "ghost.png", "brighter")],
                TokenUsage::default(),
            ),
            text("I could not find ghost.png."),
        ]));
        let runtime = runtime_with(llm, Arc::new(MemoryArtifactStore::new()), 4).await;
        let response = runtime
            .process_turn(
                InboundTurn::text(ConversationId::from("conv-ghost"), "edit ghost.png"),
                &CancellationToken::new(),
                None,
            )
            .await
            .expect("turn succeeds");
        assert_eq!(response.failed_steps.len(), 1);
        assert_eq!(response.failed_steps[0].error_kind, "unresolved_reference");
    }

    #[tokio::test]
    async fn max_tool_rounds_is_enforced() {
        let llm = Arc::new(MockLlm::new(vec![
            ChatResponse::ToolCalls(
                vec![edit_call("c1", "x.png", "a")],
                TokenUsage::default(),
            ),
            ChatResponse::ToolCalls(
                vec![edit_call("c2", "x.png", "b")],
                TokenUsage::default(),
            ),
        ]));
        let runtime = runtime_with(llm, Arc::new(MemoryArtifactStore::new()), 1).await;
        let err = runtime
            .process_turn(
                InboundTurn::text(ConversationId::from("conv-rounds"), "loop"),
                &CancellationToken::new(),
                None,
            )
            .await
            .expect_err("rounds exceeded");
        assert!(matches!(err, Error::Llm(LlmError::MaxToolRoundsExceeded)));
    }

    #[tokio::test]
    async fn cancelled_turn_writes_nothing() {
        let llm = Arc::new(MockLlm::new(vec![text("never")]));
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let runtime = runtime_with(llm, store.clone(), 4).await;
        let conv = ConversationId::from("conv-cancel");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let turn = InboundTurn::text(conv.clone(), "x").with_media(MediaAttachment::new(
            Some("a.png".into()),
            b"a".to_vec(),
            "image/png",
        ));
        let err = runtime
            .process_turn(turn, &cancel, None)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, Error::Cancelled));
        assert!(store.list(&conv).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn abandoned_turn_leaves_a_usable_history() {
        let llm = Arc::new(MockLlm::new(vec![
            ChatResponse::ToolCalls(
                vec![edit_call("call_0", "soap.png", "add lavender sprigs")],
                TokenUsage::default(),
            ),
            text("Sorry, that edit was interrupted."),
        ]));
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let runtime =
            runtime_with_backend(llm.clone(), store.clone(), Arc::new(StalledBackend), 4).await;
        let conv = ConversationId::from("conv-abandoned");

        let first = InboundTurn::text(conv.clone(), "add lavender").with_media(MediaAttachment::new(
            Some("soap.png".into()),
            b"RAW".to_vec(),
            "image/png",
        ));
        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            runtime.process_turn(first, &CancellationToken::new(), None),
        )
        .await;
        assert!(abandoned.is_err(), "turn should still be waiting on the backend");

        let response = runtime
            .process_turn(InboundTurn::text(conv.clone(), "what happened?"), &CancellationToken::new(), None)
            .await
            .expect("second turn succeeds");
        assert_eq!(response.content, "Sorry, that edit was interrupted.");

        assert_eq!(
            store.history(&conv, "soap.png").await.expect("history").len(),
            1,
            "interrupted edit wrote nothing"
        );

        let seen = llm.seen.lock().expect("seen");
        let next = &seen[1].messages;
        assert_tool_calls_paired(next);
        let filler = next
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("call_0"))
            .expect("interrupted call is answered");
        assert!(filler.content.contains("\"cancelled\""));
        assert_eq!(next.last().map(|m| m.content.as_str()), Some("what happened?"));
    }

    #[tokio::test]
    async fn store_write_failure_is_fatal() {
        let llm = Arc::new(MockLlm::new(vec![text("unreachable")]));
        let runtime = runtime_with(llm, Arc::new(BrokenStore), 4).await;
        let turn = InboundTurn::text(ConversationId::from("conv-broken"), "x").with_media(
            MediaAttachment::new(Some("a.png".into()), b"a".to_vec(), "image/png"),
        );
        let err = runtime
            .process_turn(turn, &CancellationToken::new(), None)
            .await
            .expect_err("fatal");
        assert!(matches!(err, Error::Store(StoreError::Storage(_))));
    }

    #[tokio::test]
    async fn close_with_purge_removes_artifacts_and_transcript() {
        let llm = Arc::new(MockLlm::new(vec![text("stored")]));
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let runtime = runtime_with(llm, store.clone(), 4).await;
        let conv = ConversationId::from("conv-close");
        let turn = InboundTurn::text(conv.clone(), "keep this").with_media(MediaAttachment::new(
            Some("a.png".into()),
            b"a".to_vec(),
            "image/png",
        ));
        runtime
            .process_turn(turn, &CancellationToken::new(), None)
            .await
            .expect("turn");
        assert_eq!(runtime.artifacts(&conv).await.expect("list").len(), 1);

        let report = runtime.close_conversation(&conv, true).await.expect("close");
        assert!(report.was_open);
        assert_eq!(report.artifacts_removed, 1);
        assert!(report.transcript_removed);
        assert!(runtime.artifacts(&conv).await.expect("list").is_empty());
    }

    #[test]
    fn trim_history_aligns_to_user_boundary() {
        let conv = ConversationId::from("c");
        let mut history = vec![AgentMessage::new(conv.clone(), Role::User, "start")];
        for i in 0..MAX_CONTEXT_MESSAGES {
            let role = if i % 3 == 0 { Role::User } else { Role::Tool };
            history.push(AgentMessage::new(conv.clone(), role, format!("m{i}")));
        }
        let trimmed = trim_conversation_history(history);
        assert!(trimmed.len() <= MAX_CONTEXT_MESSAGES);
        assert_eq!(trimmed[0].role, Role::User);
    }

    #[test]
    fn history_conversion_drops_orphaned_tool_results() {
        let conv = ConversationId::from("c");
        let history = vec![
            AgentMessage::tool_result(conv.clone(), "call-stale", "edit", "{}"),
            AgentMessage::new(conv.clone(), Role::User, "hello"),
            AgentMessage::assistant_tool_calls(conv.clone(), vec![edit_call("a", "x.png", "b")]),
            AgentMessage::tool_result(conv.clone(), "a", "edit", "{\"status\":\"success\"}"),
            AgentMessage::tool_result(conv, "a", "edit", "{}"),
        ];
        let messages = history_to_chat_messages("prompt", &history);
        assert_tool_calls_paired(&messages);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[3].content, "{\"status\":\"success\"}");
    }

    #[test]
    fn history_conversion_skips_stored_system_entries() {
        let conv = ConversationId::from("c");
        let history = vec![
            AgentMessage::new(conv.clone(), Role::System, "old prompt"),
            AgentMessage::new(conv.clone(), Role::User, "soap.png (image)"),
            AgentMessage::assistant_tool_calls(conv.clone(), vec![edit_call("call-1", "soap.png", "b")]),
            AgentMessage::tool_result(conv, "call-1", "edit", "{}"),
        ];
        let messages = history_to_chat_messages("prompt", &history);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].content, "prompt");
        assert_eq!(messages[3].tool_name.as_deref(), Some("edit"));
    }
}
