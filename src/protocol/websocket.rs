//! WebSocket mocks: per-message matchers with echo fallback.

use crate::error::ValidationError;
use crate::matcher::{json_path_matches, Pattern};
use serde::{Deserialize, Serialize};

/// WebSocket mock payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct WebSocketSpec {
    pub path: String,

    /// Evaluated in declaration order; the first hit replies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<WsMatcher>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_response: Option<WsMessage>,

    /// Echo unmatched messages back to the sender
    #[serde(default)]
    pub echo_mode: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subprotocols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMatcher {
    #[serde(rename = "match")]
    pub condition: WsCondition,
    pub response: WsMessage,
}

/// Condition on an incoming message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsCondition {
    Exact { value: String },
    Contains { value: String },
    Regex { pattern: Pattern },
    /// JSON path must resolve to `value` (null = must resolve)
    Json {
        path: String,
        #[serde(default)]
        value: serde_json::Value,
    },
}

/// An outgoing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsMessage {
    Text { value: String },
    Json { value: serde_json::Value },
}

impl WsMessage {
    pub fn to_text(&self) -> String {
        match self {
            WsMessage::Text { value } => value.clone(),
            WsMessage::Json { value } => value.to_string(),
        }
    }
}

/// How the engine answers one incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum WsReply {
    Message(String),
    Echo(String),
    Silent,
}

impl WsCondition {
    fn matches(&self, message: &str) -> bool {
        match self {
            WsCondition::Exact { value } => message == value,
            WsCondition::Contains { value } => message.contains(value.as_str()),
            WsCondition::Regex { pattern } => pattern.is_match(message),
            WsCondition::Json { path, value } => serde_json::from_str::<serde_json::Value>(message)
                .map(|json| json_path_matches(&json, path, value))
                .unwrap_or(false),
        }
    }
}

impl WebSocketSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.path.starts_with('/') {
            return Err(ValidationError::Invalid(format!(
                "websocket.path {:?} must start with '/'",
                self.path
            )));
        }
        for matcher in &self.matchers {
            if let WsCondition::Json { path, .. } = &matcher.condition {
                jsonpath_rust::JsonPath::<serde_json::Value>::try_from(path.as_str()).map_err(|_| {
                    ValidationError::Invalid(format!("invalid JSON path {path:?}"))
                })?;
            }
        }
        Ok(())
    }

    /// Answer one incoming text message.
    pub fn reply_to(&self, message: &str) -> WsReply {
        if let Some(hit) = self.matchers.iter().find(|m| m.condition.matches(message)) {
            return WsReply::Message(hit.response.to_text());
        }
        if let Some(default) = &self.default_response {
            return WsReply::Message(default.to_text());
        }
        if self.echo_mode {
            return WsReply::Echo(message.to_string());
        }
        WsReply::Silent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> WebSocketSpec {
        serde_yaml::from_str(
            r#"
path: /chat
echoMode: true
matchers:
  - match: {type: exact, value: ping}
    response: {type: text, value: pong}
  - match: {type: regex, pattern: "^join:\\w+$"}
    response: {type: json, value: {joined: true}}
  - match: {type: json, path: "$.action", value: subscribe}
    response: {type: text, value: subscribed}
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_exact_match_replies() {
        assert_eq!(spec().reply_to("ping"), WsReply::Message("pong".into()));
    }

    #[test]
    fn test_regex_match_replies_json() {
        assert_eq!(
            spec().reply_to("join:lobby"),
            WsReply::Message(r#"{"joined":true}"#.into())
        );
    }

    #[test]
    fn test_unmatched_message_echoes() {
        assert_eq!(spec().reply_to("hello"), WsReply::Echo("hello".into()));
    }

    #[test]
    fn test_default_response_beats_echo() {
        let mut spec = spec();
        spec.default_response = Some(WsMessage::Text {
            value: "unknown".into(),
        });
        assert_eq!(spec.reply_to("hello"), WsReply::Message("unknown".into()));
    }

    #[test]
    fn test_silent_without_echo() {
        let mut spec = spec();
        spec.echo_mode = false;
        assert_eq!(spec.reply_to("hello"), WsReply::Silent);
    }
}
