use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One line of a streaming `/api/chat` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChunkMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatChunk {
    pub fn content(&self) -> &str {
        self.message
            .as_ref()
            .map_or("", |message| message.content.as_str())
    }

    pub fn thinking(&self) -> &str {
        self.message
            .as_ref()
            .and_then(|message| message.thinking.as_deref())
            .unwrap_or("")
    }

    pub fn tool_calls(&self) -> &[WireToolCall] {
        self.message
            .as_ref()
            .and_then(|message| message.tool_calls.as_deref())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

/// `{"function": {"name": ..., "arguments": {...}}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    pub function: WireFunctionCall,
}

impl WireToolCall {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            function: WireFunctionCall {
                name: name.into(),
                arguments: Value::Object(arguments),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFunctionCall {
    pub name: String,
    /// Usually an object; some models send a JSON-encoded string instead.
    #[serde(default)]
    pub arguments: Value,
}

impl WireFunctionCall {
    /// Arguments as an object, decoding string-encoded JSON when needed.
    pub fn arguments_map(&self) -> Map<String, Value> {
        match &self.arguments {
            Value::Object(map) => map.clone(),
            Value::String(encoded) => match serde_json::from_str::<Value>(encoded) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            },
            _ => Map::new(),
        }
    }
}

/// `GET /api/tags`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<ModelTag>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelTag {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub details: Option<Value>,
}

/// `POST /api/show`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ShowResponse {
    #[serde(default)]
    pub model_info: Map<String, Value>,
    #[serde(default)]
    pub parameters: Option<String>,
}

impl ShowResponse {
    /// Context length from the first `<arch>.context_length` key.
    pub fn context_length(&self) -> Option<u64> {
        self.model_info
            .iter()
            .filter(|(key, _)| key.ends_with(".context_length"))
            .find_map(|(_, value)| value.as_u64())
            .filter(|length| *length > 0)
    }
}
