//! Local Inference Gateway common types
//!
//! Shared types used by both the model server and the gateway.

pub mod category;
pub mod chat;
pub mod cost;
pub mod priority;
pub mod protocol;

pub use category::Category;
pub use chat::{ChatMessage, ChatOptions, ChatRequest, ChatResponse, DEFAULT_NUM_PREDICT};
pub use cost::{CostModel, CostProfile};
pub use priority::{Priority, PRIORITY_HEADER};
pub use protocol::{
    CachedModelInfo, GenerateChunk, GenerateRequest, GenerateResponse, HealthReport,
    MemoryReport, TagModel, TagsResponse,
};
