//! Tool invocation mediation.
//!
//! Every tool call goes through the same ordered steps: validate against the
//! tool's schema, resolve references through the conversation's binder,
//! fetch inputs, enrich generation instructions, call the backend, commit the
//! output as a new artifact version, register it with the binder. Nothing is
//! written unless every earlier step succeeded.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;
use proto::{
    ArtifactMeta, ArtifactRef, FailedStep, InvocationError, MediaKind, NewArtifact, ProgressEvent,
    ToolCall, ToolResult,
};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tools::{ClipOptions, GenerationRequest, InputMedia, MediaBackend, ToolSpec};
use tracing::{debug, info, warn};

use crate::binder::ContextBinder;
use crate::enrichment::enrich;
use crate::interceptor::sanitize_filename;
use crate::store::ArtifactStore;
use crate::tool_registry::ToolRegistry;

/// A tool call's arguments, parsed but not yet validated against a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub call_id: String,
    pub tool_name: String,
    /// `name` or `name@vN`, in call order.
    pub input_references: Vec<String>,
    pub instruction: Option<String>,
    pub output_artifact_name: Option<String>,
    pub duration_seconds: Option<u64>,
    pub negative_prompt: Option<String>,
}

impl ToolInvocation {
    pub fn from_call(call: &ToolCall) -> Result<Self, InvocationError> {
        let Some(args) = call.arguments.as_object() else {
            return Err(InvocationError::InvalidArgs(format!(
                "arguments for '{}' must be a JSON object",
                call.name
            )));
        };

        let input_references = match args.get("input_artifacts") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(single)) => vec![single.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        InvocationError::InvalidArgs(
                            "input_artifacts must be a list of artifact names".to_string(),
                        )
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(InvocationError::InvalidArgs(
                    "input_artifacts must be a list of artifact names".to_string(),
                ));
            }
        };

        Ok(Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            input_references,
            instruction: optional_string(args, "instruction")?,
            output_artifact_name: optional_string(args, "output_artifact_name")?
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty()),
            duration_seconds: optional_seconds(args, "duration_seconds")?,
            negative_prompt: optional_string(args, "negative_prompt")?,
        })
    }

    /// Base names read by this invocation (pins stripped).
    pub fn read_names(&self) -> Vec<&str> {
        self.input_references
            .iter()
            .map(|r| {
                ArtifactRef::split_pin(r.trim())
                    .map(|(name, _)| name)
                    .unwrap_or(r.as_str())
            })
            .collect()
    }
}

fn optional_string(args: &Map<String, Value>, key: &str) -> Result<Option<String>, InvocationError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(InvocationError::InvalidArgs(format!("{key} must be a string"))),
    }
}

fn optional_seconds(args: &Map<String, Value>, key: &str) -> Result<Option<u64>, InvocationError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            InvocationError::InvalidArgs(format!("{key} must be a whole number of seconds"))
        }),
    }
}

/// An invocation that passed schema validation.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    pub invocation: ToolInvocation,
    pub spec: ToolSpec,
    /// Instruction after validation, before enrichment.
    pub instruction: String,
    /// Instruction as the backend receives it.
    pub backend_instruction: String,
    pub clip: ClipOptions,
    /// Name the output will be written under.
    pub output_name: String,
}

/// Result of one tool call.
#[derive(Debug)]
pub struct InvocationOutcome {
    pub call_id: String,
    pub tool_name: String,
    /// Instruction sent to the backend, when the call got that far.
    pub instruction: Option<String>,
    pub result: Result<ArtifactMeta, InvocationError>,
}

impl InvocationOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(&self.result, Err(e) if e.is_fatal())
    }

    /// JSON tool result fed back to the reasoning engine.
    pub fn to_tool_result(&self) -> ToolResult {
        match &self.result {
            Ok(meta) => {
                let mut body = serde_json::json!({
                    "status": "success",
                    "artifact": meta.name,
                    "version": meta.version,
                    "reference": meta.artifact_ref().to_string(),
                    "media_kind": meta.media_kind,
                    "inputs": meta.inputs.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "message": format!(
                        "Saved as '{}' version {}. Refer to it as {} in later steps.",
                        meta.name, meta.version, meta.name
                    ),
                });
                if let Some(instruction) = self.instruction.as_deref().filter(|i| !i.is_empty()) {
                    body["instruction"] = Value::String(instruction.to_string());
                }
                ToolResult::success(&self.call_id, &self.tool_name, body.to_string())
            }
            Err(e) => {
                let body = serde_json::json!({
                    "status": "error",
                    "error_kind": e.kind(),
                    "message": e.to_string(),
                });
                ToolResult::error(&self.call_id, &self.tool_name, body.to_string())
            }
        }
    }

    pub fn failed_step(&self) -> Option<FailedStep> {
        let Err(e) = &self.result else {
            return None;
        };
        Some(FailedStep {
            call_id: self.call_id.clone(),
            tool_name: self.tool_name.clone(),
            error_kind: e.kind().to_string(),
            message: e.to_string(),
        })
    }
}

/// Validates, executes, and commits tool calls.
pub struct ToolMediator {
    store: Arc<dyn ArtifactStore>,
    backend: Arc<dyn MediaBackend>,
    registry: Arc<ToolRegistry>,
}

impl ToolMediator {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        backend: Arc<dyn MediaBackend>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            store,
            backend,
            registry,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Parses and validates a tool call without touching the store or backend.
    /// `is_taken` reports names a synthesized output name must avoid.
    pub fn prepare(
        &self,
        call: &ToolCall,
        is_taken: &dyn Fn(&str) -> bool,
    ) -> Result<PreparedCall, InvocationError> {
        let invocation = ToolInvocation::from_call(call)?;
        let spec = self.registry.get(&invocation.tool_name)?.clone();
        spec.check_arity(invocation.input_references.len())?;
        let instruction = spec.check_instruction(invocation.instruction.as_deref())?;
        let clip = spec.check_clip_options(
            invocation.duration_seconds,
            invocation.negative_prompt.as_deref(),
        )?;
        let backend_instruction = if spec.generation_class {
            enrich(&instruction, spec.kind)
        } else {
            instruction.clone()
        };

        let output_name = match &invocation.output_artifact_name {
            Some(name) => {
                if sanitize_filename(name) != *name {
                    return Err(InvocationError::InvalidArgs(format!(
                        "output_artifact_name '{name}' is not a valid artifact name"
                    )));
                }
                name.clone()
            }
            None => spec.default_output_name(&invocation.read_names(), is_taken),
        };

        Ok(PreparedCall {
            invocation,
            spec,
            instruction,
            backend_instruction,
            clip,
            output_name,
        })
    }

    /// Runs one prepared call to completion.
    pub async fn execute(
        &self,
        prepared: &PreparedCall,
        binder: &RwLock<ContextBinder>,
        cancel: &CancellationToken,
    ) -> Result<ArtifactMeta, InvocationError> {
        let PreparedCall {
            invocation,
            spec,
            backend_instruction,
            clip,
            output_name,
            ..
        } = prepared;
        if cancel.is_cancelled() {
            return Err(InvocationError::Cancelled);
        }

        // Resolve every reference before any side effect.
        let (conversation, resolved) = {
            let binder = binder.read();
            let resolved = invocation
                .input_references
                .iter()
                .map(|r| binder.resolve(r))
                .collect::<Result<Vec<_>, _>>()?;
            if let Some(existing) = binder.latest(output_name)
                && existing.media_kind != spec.output_kind
            {
                return Err(InvocationError::InvalidArgs(format!(
                    "'{output_name}' holds {} artifacts, '{}' produces {}",
                    existing.media_kind, spec.name, spec.output_kind
                )));
            }
            (binder.conversation_id().clone(), resolved)
        };

        let mut inputs = Vec::with_capacity(resolved.len());
        for reference in &resolved {
            let artifact = self
                .store
                .get(&conversation, &reference.name, Some(reference.version))
                .await?;
            inputs.push(InputMedia {
                name: artifact.meta.name,
                version: artifact.meta.version,
                mime_type: artifact.meta.mime_type,
                data: artifact.data,
            });
        }

        info!(
            conversation = %conversation,
            tool = %spec.name,
            call_id = %invocation.call_id,
            inputs = ?resolved.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Invoking media backend"
        );
        let request = GenerationRequest {
            tool_name: spec.name.clone(),
            kind: spec.kind,
            inputs,
            instruction: backend_instruction.clone(),
            output_kind: spec.output_kind,
            clip: clip.clone(),
        };
        let generated = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InvocationError::Cancelled),
            result = self.backend.generate(request) => result,
        };
        let generated = generated.map_err(|diagnostic| InvocationError::GenerationFailed {
            tool: spec.name.clone(),
            diagnostic,
        })?;

        if generated.data.is_empty() {
            return Err(InvocationError::GenerationFailed {
                tool: spec.name.clone(),
                diagnostic: "backend returned an empty payload".to_string(),
            });
        }
        let media_kind = MediaKind::from_mime(&generated.mime_type);
        if media_kind != Some(spec.output_kind) {
            return Err(InvocationError::GenerationFailed {
                tool: spec.name.clone(),
                diagnostic: format!(
                    "backend returned '{}', expected {}",
                    generated.mime_type, spec.output_kind
                ),
            });
        }

        // Last chance to honour cancellation; `put` itself is atomic.
        if cancel.is_cancelled() {
            return Err(InvocationError::Cancelled);
        }
        let meta = self
            .store
            .put(
                &conversation,
                NewArtifact {
                    name: output_name.clone(),
                    data: generated.data,
                    media_kind: spec.output_kind,
                    mime_type: generated.mime_type,
                    produced_by: spec.name.clone(),
                    inputs: resolved,
                },
            )
            .await?;
        binder.write().register(&meta);

        info!(
            conversation = %conversation,
            tool = %spec.name,
            call_id = %invocation.call_id,
            artifact = %meta.name,
            version = meta.version,
            "Tool output committed"
        );
        Ok(meta)
    }

    /// Prepares and executes a single call.
    pub async fn invoke(
        &self,
        call: &ToolCall,
        binder: &RwLock<ContextBinder>,
        cancel: &CancellationToken,
    ) -> InvocationOutcome {
        let prepared = self.prepare(call, &|name: &str| binder.read().contains(name));
        match prepared {
            Ok(prepared) => {
                let result = self.execute(&prepared, binder, cancel).await;
                outcome(call, Some(&prepared), result)
            }
            Err(e) => outcome(call, None, Err(e)),
        }
    }

    /// Runs every call of one reasoning round.
    ///
    /// Calls are grouped into waves: a call that reads or writes a name that
    /// an earlier call of the current wave writes (or reads, for writes)
    /// starts the next wave. Calls within a wave run concurrently. After a
    /// fatal store failure the remaining waves are not run and report
    /// `Cancelled`. Outcomes come back in call order.
    pub async fn invoke_batch(
        &self,
        calls: &[ToolCall],
        binder: &RwLock<ContextBinder>,
        cancel: &CancellationToken,
        progress: Option<&mpsc::Sender<ProgressEvent>>,
    ) -> Vec<InvocationOutcome> {
        let mut results: Vec<Option<Result<ArtifactMeta, InvocationError>>> =
            calls.iter().map(|_| None).collect();
        let mut prepared = Vec::new();
        // Output names chosen earlier in this batch but not yet written.
        let mut claimed: HashSet<String> = HashSet::new();
        for (i, call) in calls.iter().enumerate() {
            let is_taken = |name: &str| claimed.contains(name) || binder.read().contains(name);
            match self.prepare(call, &is_taken) {
                Ok(p) => {
                    claimed.insert(p.output_name.clone());
                    prepared.push((i, p));
                }
                Err(e) => {
                    warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool call rejected");
                    results[i] = Some(Err(e));
                }
            }
        }

        let waves = schedule_waves(&prepared);
        debug!(calls = calls.len(), waves = waves.len(), "Tool calls scheduled");

        let mut halted = false;
        for wave in waves {
            if halted {
                for &slot in &wave {
                    results[prepared[slot].0] = Some(Err(InvocationError::Cancelled));
                }
                continue;
            }

            if let Some(tx) = progress {
                for &slot in &wave {
                    let p = &prepared[slot].1;
                    let _ = tx.try_send(ProgressEvent::ToolCallStarted {
                        call_id: p.invocation.call_id.clone(),
                        tool_name: p.spec.name.clone(),
                        inputs: p.invocation.input_references.clone(),
                    });
                }
            }

            let finished = join_all(
                wave.iter()
                    .map(|&slot| self.execute(&prepared[slot].1, binder, cancel)),
            )
            .await;

            for (&slot, result) in wave.iter().zip(finished) {
                let (index, p) = &prepared[slot];
                if let Err(e) = &result {
                    halted |= e.is_fatal();
                    warn!(tool = %p.spec.name, call_id = %p.invocation.call_id, error = %e, "Tool call failed");
                }
                if let Some(tx) = progress {
                    let _ = tx.try_send(ProgressEvent::ToolCallFinished {
                        call_id: p.invocation.call_id.clone(),
                        tool_name: p.spec.name.clone(),
                        output: result.as_ref().ok().map(ArtifactMeta::artifact_ref),
                        error: result.as_ref().err().map(ToString::to_string),
                    });
                }
                results[*index] = Some(result);
            }
        }

        let mut by_call: Vec<Option<&PreparedCall>> = calls.iter().map(|_| None).collect();
        for (index, p) in &prepared {
            by_call[*index] = Some(p);
        }
        calls
            .iter()
            .zip(results)
            .zip(by_call)
            .map(|((call, result), p)| {
                outcome(call, p, result.unwrap_or(Err(InvocationError::Cancelled)))
            })
            .collect()
    }
}

fn outcome(
    call: &ToolCall,
    prepared: Option<&PreparedCall>,
    result: Result<ArtifactMeta, InvocationError>,
) -> InvocationOutcome {
    InvocationOutcome {
        call_id: call.id.clone(),
        tool_name: call.name.clone(),
        instruction: prepared.map(|p| p.backend_instruction.clone()),
        result,
    }
}

/// Groups prepared calls (by position in `prepared`) into dependency waves.
fn schedule_waves(prepared: &[(usize, PreparedCall)]) -> Vec<Vec<usize>> {
    let mut waves: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut writes: HashSet<&str> = HashSet::new();
    let mut reads: HashSet<&str> = HashSet::new();

    for (slot, (_, p)) in prepared.iter().enumerate() {
        let my_reads = p.invocation.read_names();
        let my_write = p.output_name.as_str();
        let conflicts = my_reads.iter().any(|r| writes.contains(r))
            || writes.contains(my_write)
            || reads.contains(my_write);
        if conflicts && !current.is_empty() {
            waves.push(std::mem::take(&mut current));
            writes.clear();
            reads.clear();
        }
        current.push(slot);
        writes.insert(my_write);
        reads.extend(my_reads);
    }
    if !current.is_empty() {
        waves.push(current);
    }
    waves
}
