//! 数据模型
//!
//! OpenAI 兼容的消息类型，会话识别与上游调用都以它为输入。

pub mod openai;

pub use openai::{ChatMessage, ContentPart, MessageContent, Role};
