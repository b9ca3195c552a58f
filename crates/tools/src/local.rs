use std::io::Cursor;

use async_trait::async_trait;
use image::ImageFormat;
use tracing::debug;

use crate::{GeneratedMedia, GenerationRequest, MediaBackend};

/// Runs the deterministic transform tools in-process with the `image` crate.
///
/// Output is always re-encoded as PNG.
#[derive(Debug, Default, Clone)]
pub struct LocalImageBackend;

impl LocalImageBackend {
    pub fn new() -> Self {
        Self
    }

    /// Tool names this backend knows how to execute.
    pub fn supported_tools() -> &'static [&'static str] {
        &["grayscale", "flip"]
    }
}

#[async_trait]
impl MediaBackend for LocalImageBackend {
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedMedia, String> {
        let Some(input) = request.inputs.first() else {
            return Err(format!("'{}' needs one input image", request.tool_name));
        };
        let tool = request.tool_name.clone();
        let data = input.data.clone();

        // Decoding and encoding are CPU bound.
        let png = tokio::task::spawn_blocking(move || transform(&tool, &data))
            .await
            .map_err(|e| format!("transform task failed: {e}"))??;

        debug!(
            tool = %request.tool_name,
            input = %input.name,
            bytes = png.len(),
            "Local transform complete"
        );
        Ok(GeneratedMedia {
            data: png,
            mime_type: "image/png".to_string(),
        })
    }
}

fn transform(tool: &str, data: &[u8]) -> Result<Vec<u8>, String> {
    let img = image::load_from_memory(data).map_err(|e| format!("cannot decode input: {e}"))?;
    let out = match tool {
        "grayscale" => img.grayscale(),
        "flip" => img.fliph(),
        other => return Err(format!("local backend cannot run '{other}'")),
    };

    let mut png = Vec::new();
    out.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| format!("cannot encode output: {e}"))?;
    Ok(png)
}
