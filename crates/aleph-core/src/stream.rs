//! Typed view of the agent runtime's stream-json protocol.
//!
//! The harness only consumes a small slice of what the runtime emits:
//! assistant text, thinking, tool-use boundaries, and turn completion.
//! Everything else passes through untouched for the UI to ignore.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<NestedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedMessage {
    pub role: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub thinking: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub content: FlexContent,
    #[serde(default)]
    pub tool_use_id: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Tool results arrive either as a bare string or a list of text parts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlexContent(pub String);

impl<'de> Deserialize<'de> for FlexContent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(FlexContent(s)),
            Value::Array(parts) => {
                #[derive(Deserialize)]
                struct Part {
                    #[serde(default)]
                    text: String,
                }

                let mut texts = Vec::new();
                for part in parts {
                    if let Ok(p) = serde_json::from_value::<Part>(part) {
                        if !p.text.is_empty() {
                            texts.push(p.text);
                        }
                    }
                }
                Ok(FlexContent(texts.join("\n")))
            }
            other => Ok(FlexContent(other.to_string())),
        }
    }
}

impl Serialize for FlexContent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

/// A user-turn injected into the runtime's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMessage {
    #[serde(rename = "type")]
    pub r#type: String,
    pub message: MessageBody,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub role: String,
    pub content: String,
}

pub fn user_turn(content: impl Into<String>) -> InputMessage {
    InputMessage {
        r#type: "user".to_owned(),
        message: MessageBody {
            role: "user".to_owned(),
            content: content.into(),
        },
        session_id: "default".to_owned(),
        parent_tool_use_id: None,
    }
}

/// The event sequence the harness actually consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    TextDelta(String),
    ThinkingDelta(String),
    ToolUseStart {
        tool_use_id: String,
        tool_name: String,
        arguments: Value,
    },
    ToolUseComplete {
        tool_use_id: String,
        result: String,
        is_error: bool,
    },
    TurnEnd {
        result: Option<String>,
        is_error: bool,
    },
}

impl StreamMessage {
    /// Flatten one stream message into harness events, preserving block
    /// order. Unknown message and block types produce nothing.
    pub fn to_events(&self) -> Vec<RuntimeEvent> {
        if self.r#type == "result" {
            return vec![RuntimeEvent::TurnEnd {
                result: self.result.clone(),
                is_error: self.is_error,
            }];
        }

        let Some(message) = &self.message else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for block in &message.content {
            match block.r#type.as_str() {
                "text" => {
                    if !block.text.is_empty() {
                        out.push(RuntimeEvent::TextDelta(block.text.clone()));
                    }
                }
                "thinking" => {
                    if !block.thinking.is_empty() {
                        out.push(RuntimeEvent::ThinkingDelta(block.thinking.clone()));
                    }
                }
                "tool_use" => {
                    out.push(RuntimeEvent::ToolUseStart {
                        tool_use_id: block.id.clone(),
                        tool_name: block.name.clone(),
                        arguments: block.input.clone(),
                    });
                }
                "tool_result" => {
                    out.push(RuntimeEvent::ToolUseComplete {
                        tool_use_id: block.tool_use_id.clone(),
                        result: block.content.0.clone(),
                        is_error: block.is_error,
                    });
                }
                _ => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flex_content_accepts_string_and_parts() {
        let got: FlexContent = serde_json::from_str(r#""hello""#).unwrap();
        assert_eq!(got.0, "hello");

        let got: FlexContent =
            serde_json::from_str(r#"[{"type":"text","text":"a"},{"type":"text","text":"b"}]"#)
                .unwrap();
        assert_eq!(got.0, "a\nb");
    }

    #[test]
    fn assistant_blocks_flatten_in_order() {
        let raw = r#"{
            "type": "assistant",
            "message": {
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "on it"},
                    {"type": "tool_use", "id": "tu-1", "name": "Bash",
                     "input": {"command": "ls"}}
                ]
            }
        }"#;
        let msg: StreamMessage = serde_json::from_str(raw).unwrap();
        let events = msg.to_events();

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], RuntimeEvent::ThinkingDelta("hmm".to_owned()));
        assert_eq!(events[1], RuntimeEvent::TextDelta("on it".to_owned()));
        match &events[2] {
            RuntimeEvent::ToolUseStart {
                tool_use_id,
                tool_name,
                arguments,
            } => {
                assert_eq!(tool_use_id, "tu-1");
                assert_eq!(tool_name, "Bash");
                assert_eq!(arguments["command"], "ls");
            }
            other => panic!("expected ToolUseStart, got {other:?}"),
        }
    }

    #[test]
    fn tool_result_becomes_tool_use_complete() {
        let raw = r#"{
            "type": "user",
            "message": {
                "role": "user",
                "content": [
                    {"type": "tool_result", "tool_use_id": "tu-1",
                     "content": "ok", "is_error": false}
                ]
            }
        }"#;
        let msg: StreamMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg.to_events(),
            vec![RuntimeEvent::ToolUseComplete {
                tool_use_id: "tu-1".to_owned(),
                result: "ok".to_owned(),
                is_error: false,
            }]
        );
    }

    #[test]
    fn result_message_ends_the_turn() {
        let raw = r#"{"type":"result","subtype":"success","result":"done","is_error":false}"#;
        let msg: StreamMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg.to_events(),
            vec![RuntimeEvent::TurnEnd {
                result: Some("done".to_owned()),
                is_error: false,
            }]
        );
    }

    #[test]
    fn unknown_message_types_produce_nothing() {
        let raw = r#"{"type":"system","subtype":"init"}"#;
        let msg: StreamMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.to_events().is_empty());
    }

    #[test]
    fn user_turn_has_expected_wire_shape() {
        let json = serde_json::to_value(user_turn("hi")).unwrap();
        assert_eq!(json["type"], "user");
        assert_eq!(json["message"]["role"], "user");
        assert_eq!(json["message"]["content"], "hi");
        assert_eq!(json["session_id"], "default");
    }
}
