//! Production-quality directives appended to generation instructions.

use tools::ToolKind;

/// Appended to every video-generation instruction.
pub const VIDEO_DIRECTIVES: &str = "Production requirements:\n\
- Keep the camera stable. Any movement must be slow and smooth, with no shake or abrupt cuts.\n\
- Keep lighting and color temperature consistent from the first frame to the last.\n\
- Use a steady, unhurried pace suited to a short product showcase.\n\
- Keep the product sharp, correctly proportioned and faithful to the starting frame.";

/// Returns the instruction to forward to the backend.
///
/// The user's text is always kept verbatim as the prefix; directives only
/// follow it. Tool kinds other than video generation pass through unchanged.
pub fn enrich(instruction: &str, kind: ToolKind) -> String {
    match kind {
        ToolKind::Animate if instruction.is_empty() => VIDEO_DIRECTIVES.to_string(),
        ToolKind::Animate => format!("{instruction}\n\n{VIDEO_DIRECTIVES}"),
        _ => instruction.to_string(),
    }
}
