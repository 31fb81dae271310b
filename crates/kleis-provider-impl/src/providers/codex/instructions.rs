/// Built-in instructions sent when a responses request arrives without
/// its own `instructions` field. The Codex backend rejects empty
/// instructions outright.
pub(super) const DEFAULT_INSTRUCTIONS: &str = include_str!("instructions.md");
