//! 消息历史指纹
//!
//! 对规范化后的历史消息序列求摘要，相同的逻辑历史无论来自哪个
//! 客户端、哪个凭证都得到相同指纹，这是"自动识别会话"的基础。
//!
//! 规范化规则：
//! - 只有 system 和 user 消息参与（assistant 回复由上游持有，不参与）；
//! - 分段内容拍平为各 text 分段的拼接；
//! - 每条消息渲染为 `role:内容`，内容去除首尾空白；
//! - 各行以 `\n` 连接后做 SHA-256，取十六进制前 16 位作为键。
//!
//! 存储时对全部 user 消息求摘要；查找时仅当历史中已出现过
//! assistant 消息（说明是续接请求）才排除最后一条 user 消息，
//! 这样"上次存下的 hash(sys+u1+u2)"恰好等于"这次查找的
//! hash(sys+u1+u2)"（排除了新的 u3）。

use relaycast_core::{ChatMessage, Role};
use sha2::{Digest, Sha256};

/// 指纹键长度（十六进制字符数）
const FINGERPRINT_HEX_LEN: usize = 16;

/// 查找指纹：匹配已存储的会话
pub fn lookup_fingerprint(messages: &[ChatMessage]) -> Option<String> {
    digest(messages, true)
}

/// 存储指纹：成功回合后作为下次查找的目标
pub fn store_fingerprint(messages: &[ChatMessage]) -> Option<String> {
    digest(messages, false)
}

fn digest(messages: &[ChatMessage], exclude_last_user: bool) -> Option<String> {
    if messages.is_empty() {
        return None;
    }

    let mut system_parts = Vec::new();
    let mut user_parts = Vec::new();
    let mut has_assistant = false;

    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(format!("system:{}", msg.text().trim())),
            Role::User => user_parts.push(format!("user:{}", msg.text().trim())),
            Role::Assistant => has_assistant = true,
            Role::Tool => {}
        }
    }

    // 查找模式：仅续接请求（已有 assistant 消息）才排除最后一条 user
    if exclude_last_user && has_assistant && !user_parts.is_empty() {
        user_parts.pop();
    }

    let mut key_parts = system_parts;
    key_parts.extend(user_parts);
    if key_parts.is_empty() {
        return None;
    }

    let mut hasher = Sha256::new();
    hasher.update(key_parts.join("\n").as_bytes());
    let full = hex::encode(hasher.finalize());
    Some(full[..FINGERPRINT_HEX_LEN].to_string())
}
