//! Per-tool schemas: input arity, instruction rule, output naming.

use proto::{InvocationError, MediaKind, ToolDefinition};
use serde::{Deserialize, Serialize};

/// What a tool does with its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// Synthesizes new media with no reference input.
    Create,
    /// Modifies a single input.
    Edit,
    /// Merges several inputs into one output.
    Combine,
    /// Produces a video clip from a starting frame.
    Animate,
    /// Deterministic pixel transform with no instruction.
    Transform,
}

impl ToolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::Create => "create",
            ToolKind::Edit => "edit",
            ToolKind::Combine => "combine",
            ToolKind::Animate => "animate",
            ToolKind::Transform => "transform",
        }
    }
}

/// Whether a tool call must, may, or must not carry an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionRule {
    Required,
    Optional,
    Ignored,
}

/// How the output artifact is named when the call does not choose a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputNaming {
    /// Write a new version of the first input's name.
    ReuseFirstInput,
    /// Prefix the first input's name (`bw_soap.png`).
    Prefixed(String),
    /// `<stem>.<ext>`, numbered `<stem>_2.<ext>`, `<stem>_3.<ext>`, ... when taken.
    Synthesized(String),
}

/// Clip lengths the video backend accepts, in seconds.
pub const CLIP_DURATIONS: [u64; 3] = [4, 6, 8];

/// Extra settings for video tools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClipOptions {
    /// One of [`CLIP_DURATIONS`]; `None` leaves the length to the backend.
    pub duration_seconds: Option<u64>,
    /// Things the clip should avoid.
    pub negative_prompt: Option<String>,
}

/// Explicit schema for one tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub kind: ToolKind,
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub instruction: InstructionRule,
    pub output_kind: MediaKind,
    pub naming: OutputNaming,
    /// Generation-class tools route their instruction through enrichment.
    pub generation_class: bool,
}

impl ToolSpec {
    /// Returns the JSON schema offered to the reasoning engine.
    pub fn parameters_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        if self.max_inputs > 0 {
            properties.insert(
                "input_artifacts".to_string(),
                serde_json::json!({
                    "type": "array",
                    "items": {"type": "string"},
                    "minItems": self.min_inputs,
                    "maxItems": self.max_inputs,
                    "description": "Artifact names exactly as listed in the available artifacts. \
                                    Append @vN to pin an older version."
                }),
            );
            if self.min_inputs > 0 {
                required.push("input_artifacts");
            }
        }

        if self.instruction != InstructionRule::Ignored {
            properties.insert(
                "instruction".to_string(),
                serde_json::json!({
                    "type": "string",
                    "description": "What to do. Be specific about colors, positions, lighting and mood."
                }),
            );
            if self.instruction == InstructionRule::Required {
                required.push("instruction");
            }
        }

        if self.kind == ToolKind::Animate {
            properties.insert(
                "duration_seconds".to_string(),
                serde_json::json!({
                    "type": "integer",
                    "enum": CLIP_DURATIONS,
                    "description": "Clip length in seconds. Defaults to 4."
                }),
            );
            properties.insert(
                "negative_prompt".to_string(),
                serde_json::json!({
                    "type": "string",
                    "description": "Things to keep out of the clip, e.g. text overlays or people."
                }),
            );
        }

        properties.insert(
            "output_artifact_name".to_string(),
            serde_json::json!({
                "type": "string",
                "description": "Optional name for the result. Reusing an existing name adds a new version."
            }),
        );

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(&self.name, &self.description, self.parameters_schema())
    }

    /// Validates the number of input references.
    pub fn check_arity(&self, count: usize) -> Result<(), InvocationError> {
        if count == 0 && self.min_inputs > 0 {
            return Err(InvocationError::MissingInput {
                tool: self.name.clone(),
                required: self.min_inputs,
            });
        }
        if count < self.min_inputs || count > self.max_inputs {
            return Err(InvocationError::InvalidArgs(format!(
                "'{}' takes {} input artifact(s), got {count}",
                self.name,
                arity_label(self.min_inputs, self.max_inputs),
            )));
        }
        Ok(())
    }

    /// Validates the instruction against the tool's rule and returns the
    /// trimmed instruction to forward.
    pub fn check_instruction(&self, instruction: Option<&str>) -> Result<String, InvocationError> {
        let text = instruction.map(str::trim).unwrap_or_default();
        match self.instruction {
            InstructionRule::Required if text.is_empty() => Err(InvocationError::InvalidArgs(
                format!("'{}' requires a non-empty instruction", self.name),
            )),
            InstructionRule::Ignored => Ok(String::new()),
            _ => Ok(text.to_string()),
        }
    }

    /// Validates video settings. Tools other than `animate` drop them.
    pub fn check_clip_options(
        &self,
        duration_seconds: Option<u64>,
        negative_prompt: Option<&str>,
    ) -> Result<ClipOptions, InvocationError> {
        if self.kind != ToolKind::Animate {
            return Ok(ClipOptions::default());
        }
        if let Some(duration) = duration_seconds
            && !CLIP_DURATIONS.contains(&duration)
        {
            return Err(InvocationError::InvalidArgs(format!(
                "duration_seconds must be one of {CLIP_DURATIONS:?}, got {duration}"
            )));
        }
        Ok(ClipOptions {
            duration_seconds,
            negative_prompt: negative_prompt
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(str::to_string),
        })
    }

    /// Output name used when the call does not name its result.
    /// `input_names` are the resolved base names, in call order. Synthesized
    /// names skip anything `is_taken` reports, so a fresh result never lands
    /// on an earlier artifact.
    pub fn default_output_name(&self, input_names: &[&str], is_taken: &dyn Fn(&str) -> bool) -> String {
        let first = input_names.first().copied();
        match (&self.naming, first) {
            (OutputNaming::ReuseFirstInput, Some(first)) => first.to_string(),
            (OutputNaming::Prefixed(prefix), Some(first)) => format!("{prefix}{first}"),
            (OutputNaming::Synthesized(stem), _) => self.synthesized_name(stem, is_taken),
            (_, None) => self.synthesized_name(self.kind.as_str(), is_taken),
        }
    }

    fn synthesized_name(&self, stem: &str, is_taken: &dyn Fn(&str) -> bool) -> String {
        let ext = match self.output_kind {
            MediaKind::Image => "png",
            MediaKind::Video => "mp4",
        };
        let mut candidate = format!("{stem}.{ext}");
        let mut suffix = 2u32;
        while is_taken(&candidate) {
            candidate = format!("{stem}_{suffix}.{ext}");
            suffix += 1;
        }
        candidate
    }
}

fn arity_label(min: usize, max: usize) -> String {
    if min == max {
        min.to_string()
    } else {
        format!("{min} to {max}")
    }
}

/// The product-studio tool set.
pub fn builtin_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "generate_image".to_string(),
            description: "Create a new product or concept image from a text description only. \
                          Use when the user has no photo to start from."
                .to_string(),
            kind: ToolKind::Create,
            min_inputs: 0,
            max_inputs: 0,
            instruction: InstructionRule::Required,
            output_kind: MediaKind::Image,
            naming: OutputNaming::Synthesized("generated".to_string()),
            generation_class: true,
        },
        ToolSpec {
            name: "edit".to_string(),
            description: "Modify one existing photo: background, lighting, props, colors or \
                          arrangement. Make ONE type of change per call and chain calls for \
                          complex edits. The result is a new version of the same artifact \
                          unless output_artifact_name is given."
                .to_string(),
            kind: ToolKind::Edit,
            min_inputs: 1,
            max_inputs: 1,
            instruction: InstructionRule::Required,
            output_kind: MediaKind::Image,
            naming: OutputNaming::ReuseFirstInput,
            generation_class: false,
        },
        ToolSpec {
            name: "combine".to_string(),
            description: "Combine several product photos into one image (bundles, gift sets, \
                          comparison shots). Describe the arrangement, background and lighting."
                .to_string(),
            kind: ToolKind::Combine,
            min_inputs: 2,
            max_inputs: 8,
            instruction: InstructionRule::Required,
            output_kind: MediaKind::Image,
            naming: OutputNaming::Synthesized("combined".to_string()),
            generation_class: false,
        },
        ToolSpec {
            name: "animate".to_string(),
            description: "Generate a short marketing video clip that starts from an existing \
                          image. Describe camera movement, lighting, mood and subject action."
                .to_string(),
            kind: ToolKind::Animate,
            min_inputs: 1,
            max_inputs: 1,
            instruction: InstructionRule::Required,
            output_kind: MediaKind::Video,
            naming: OutputNaming::Synthesized("video".to_string()),
            generation_class: true,
        },
        ToolSpec {
            name: "grayscale".to_string(),
            description: "Convert an image to black and white.".to_string(),
            kind: ToolKind::Transform,
            min_inputs: 1,
            max_inputs: 1,
            instruction: InstructionRule::Ignored,
            output_kind: MediaKind::Image,
            naming: OutputNaming::Prefixed("bw_".to_string()),
            generation_class: false,
        },
        ToolSpec {
            name: "flip".to_string(),
            description: "Mirror an image horizontally.".to_string(),
            kind: ToolKind::Transform,
            min_inputs: 1,
            max_inputs: 1,
            instruction: InstructionRule::Ignored,
            output_kind: MediaKind::Image,
            naming: OutputNaming::Prefixed("flipped_".to_string()),
            generation_class: false,
        },
    ]
}
