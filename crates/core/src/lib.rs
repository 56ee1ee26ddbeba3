//! 核心类型和工具模块
//!
//! 包含 OpenAI 兼容的消息模型等跨 crate 共享的基础类型

pub mod models;

pub use models::{ChatMessage, ContentPart, MessageContent, Role};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
