pub mod sse;
pub mod usage;

pub use sse::SseParser;
pub use usage::{TokenUsage, UsageExtractor, UsageProtocol};
