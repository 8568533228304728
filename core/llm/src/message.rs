//! リクエスト 1 回分のメッセージ列

use crate::error::Error;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// `{role, content}` の組
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// user メッセージが 1 件以上あることを確認する
pub fn ensure_user_message(messages: &[Message]) -> Result<(), Error> {
    if messages.iter().any(|m| m.role == Role::User) {
        Ok(())
    } else {
        Err(Error::config("request must contain at least one user message"))
    }
}

/// system と user の本文を改行で連結する（プロンプト側トークン数の見積もり用）
pub fn prompt_text(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| matches!(m.role, Role::System | Role::User))
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::user("Hello").role, Role::User);
        assert_eq!(Message::system("Be brief").role, Role::System);
        let msg = Message::assistant("Hi there");
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content, "Hi there");
    }

    #[test]
    fn test_message_serialize() {
        let json = serde_json::to_value(Message::user("Hello")).unwrap();
        assert_eq!(json, serde_json::json!({ "role": "user", "content": "Hello" }));
    }

    #[test]
    fn test_ensure_user_message() {
        assert!(ensure_user_message(&[Message::user("q")]).is_ok());
        assert!(ensure_user_message(&[Message::system("s")]).is_err());
        assert!(ensure_user_message(&[]).is_err());
    }

    #[test]
    fn test_prompt_text_skips_assistant() {
        let msgs = vec![
            Message::system("sys"),
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("second"),
        ];
        assert_eq!(prompt_text(&msgs), "sys\nfirst\nsecond");
    }
}
