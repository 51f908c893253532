use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Typed view of the agent's output for one turn.
///
/// Serialized tagged by `type`, which is also the record kind used by the web
/// surface (`init`, `user`, `assistant`, `result`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Init(InitEvent),
    User(UserEcho),
    Assistant(AssistantMessage),
    Result(ResultEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitEvent {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Echo of a user message, carrying the checkpoint it was recorded under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEcho {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Present only for plain-text messages; tool-result continuations have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

impl AssistantMessage {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
            Self::Result(_) => "result",
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    /// Translate one stdout message of the agent CLI. Messages outside the
    /// four turn kinds (stream deltas, status updates, ...) yield `None`.
    pub fn from_wire(value: &Value) -> Option<Self> {
        let kind = value.get("type").and_then(Value::as_str)?;
        let session_id = string_field(value, "session_id");
        let uuid = string_field(value, "uuid");

        match kind {
            "system" => {
                if value.get("subtype").and_then(Value::as_str) != Some("init") {
                    return None;
                }
                Some(Self::Init(InitEvent {
                    session_id: session_id?,
                    model: string_field(value, "model"),
                    cwd: string_field(value, "cwd"),
                }))
            }
            "user" => {
                let text = value
                    .pointer("/message/content")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned);
                Some(Self::User(UserEcho {
                    uuid,
                    session_id,
                    text,
                }))
            }
            "assistant" => {
                let content = value
                    .pointer("/message/content")
                    .and_then(Value::as_array)
                    .map(|blocks| {
                        blocks
                            .iter()
                            .map(|block| {
                                serde_json::from_value::<ContentBlock>(block.clone())
                                    .unwrap_or(ContentBlock::Other)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Some(Self::Assistant(AssistantMessage {
                    uuid,
                    session_id,
                    content,
                }))
            }
            "result" => Some(Self::Result(ResultEvent {
                session_id,
                subtype: string_field(value, "subtype").unwrap_or_else(|| "success".to_string()),
                is_error: value
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                result: string_field(value, "result"),
            })),
            _ => None,
        }
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(ToOwned::to_owned)
}
