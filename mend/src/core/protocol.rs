//! Streamed agent protocol decoding.
//!
//! Each stdout line is either a JSON record discriminated by `type` or plain
//! text. Records are decoded once into tagged enums; a single record may
//! expand into several [`AgentEvent`]s (an assistant message carrying a
//! thinking block, a tool call and text yields three events, in order).
//! Unknown discriminators are surfaced as [`ErrorKind::UnknownRecord`] so the
//! caller can log them instead of silently dropping them.

use serde::Deserialize;
use serde_json::Value;

use crate::core::provider::Protocol;

/// Unified event emitted while an agent runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    TextDelta { text: String },
    ToolCall { name: String, params: Value },
    Thinking { text: String },
    Result { text: String },
    Error {
        kind: ErrorKind,
        code: Option<String>,
        message: String,
    },
    RawLine { text: String },
}

impl AgentEvent {
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            AgentEvent::Error {
                kind: ErrorKind::RateLimit,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Provider refused the request for quota or throughput reasons.
    RateLimit,
    /// Record with a `type` this decoder does not know.
    UnknownRecord,
    /// Line looked like JSON but did not decode.
    Malformed,
    /// Error reported by the agent itself.
    Agent,
}

const RATE_LIMIT_CODES: &[&str] = &[
    "429",
    "resource_exhausted",
    "rate_limit_error",
    "usage_limit_reached",
];
const RATE_LIMIT_MARKERS: &[&str] = &[
    "usage_limit_reached",
    "rate_limit",
    "rate limit",
    "429",
    "too many requests",
    "quota exceeded",
    "resource_exhausted",
];
const ERROR_HINTS: &[&str] = &["error", "exception", "http", "status", "response"];

/// Decode one stdout line. Empty and ignorable lines yield no events.
pub fn parse_line(protocol: Protocol, raw: &str) -> Vec<AgentEvent> {
    let line = raw.trim();
    if line.is_empty() {
        return Vec::new();
    }
    if !line.starts_with('{') {
        return plain_line(line);
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            // keep the text; a cut or mangled record still says something
            let mut events = plain_line(line);
            events.push(AgentEvent::Error {
                kind: ErrorKind::Malformed,
                code: None,
                message: format!("undecodable record: {err}"),
            });
            return events;
        }
    };
    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
        return untyped_record(&value, line);
    };
    match protocol {
        Protocol::ClaudeStream => decode_claude(&kind, value),
        Protocol::CodexJson => decode_codex(&kind, value),
    }
}

/// True if the message or code carries a provider rate-limit signal.
pub fn is_rate_limit_signal(code: Option<&str>, message: &str) -> bool {
    if let Some(code) = code
        && RATE_LIMIT_CODES.contains(&code.trim().to_ascii_lowercase().as_str())
    {
        return true;
    }
    let lower = message.to_ascii_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Plain text needs both a rate-limit marker and an error hint to count.
pub fn plain_text_signals_rate_limit(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
        && ERROR_HINTS.iter().any(|h| lower.contains(h))
}

fn plain_line(line: &str) -> Vec<AgentEvent> {
    let mut events = vec![AgentEvent::RawLine {
        text: line.to_string(),
    }];
    if plain_text_signals_rate_limit(line) {
        events.push(AgentEvent::Error {
            kind: ErrorKind::RateLimit,
            code: None,
            message: line.to_string(),
        });
    }
    events
}

fn untyped_record(value: &Value, line: &str) -> Vec<AgentEvent> {
    match value.get("error") {
        Some(error) => match serde_json::from_value::<ErrorBody>(error.clone()) {
            Ok(body) => vec![body.into_event()],
            Err(_) => vec![error_event(None, error.to_string())],
        },
        None => vec![AgentEvent::RawLine {
            text: line.to_string(),
        }],
    }
}

fn error_event(code: Option<String>, message: String) -> AgentEvent {
    let kind = if is_rate_limit_signal(code.as_deref(), &message) {
        ErrorKind::RateLimit
    } else {
        ErrorKind::Agent
    };
    AgentEvent::Error {
        kind,
        code,
        message,
    }
}

fn unknown_record(kind: &str) -> AgentEvent {
    AgentEvent::Error {
        kind: ErrorKind::UnknownRecord,
        code: Some(kind.to_string()),
        message: format!("unknown record type '{kind}'"),
    }
}

fn malformed_record(kind: &str, err: &serde_json::Error) -> AgentEvent {
    AgentEvent::Error {
        kind: ErrorKind::Malformed,
        code: Some(kind.to_string()),
        message: format!("malformed '{kind}' record: {err}"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Text(String),
    Detail {
        #[serde(default)]
        code: Option<Value>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default, rename = "type")]
        kind: Option<String>,
        #[serde(default)]
        message: String,
    },
}

impl ErrorBody {
    fn into_event(self) -> AgentEvent {
        match self {
            ErrorBody::Text(message) => error_event(None, message),
            ErrorBody::Detail {
                code,
                status,
                kind,
                message,
            } => {
                let code = code
                    .map(|c| match c {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .or(status)
                    .or(kind);
                error_event(code, message)
            }
        }
    }
}

// --- claude stream-json (also spoken by the gemini adapter) ---

const CLAUDE_TYPES: &[&str] = &[
    "system",
    "assistant",
    "user",
    "message_start",
    "message_delta",
    "message_stop",
    "content_block_start",
    "content_block_delta",
    "content_block_stop",
    "stream_event",
    "result",
    "error",
    "tool_code",
    "tool_result",
];

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeRecord {
    System {},
    Assistant {
        message: AssistantMessage,
    },
    User {},
    MessageStart {},
    MessageDelta {},
    MessageStop {},
    ContentBlockStart {
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    ContentBlockStop {},
    StreamEvent {
        event: Value,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        result: Option<String>,
    },
    Error {
        error: ErrorBody,
    },
    ToolCode {
        name: String,
        #[serde(default)]
        args: Value,
    },
    ToolResult {},
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

fn decode_claude(kind: &str, value: Value) -> Vec<AgentEvent> {
    match serde_json::from_value::<ClaudeRecord>(value) {
        Ok(record) => claude_events(record),
        Err(err) if CLAUDE_TYPES.contains(&kind) => vec![malformed_record(kind, &err)],
        Err(_) => vec![unknown_record(kind)],
    }
}

fn claude_events(record: ClaudeRecord) -> Vec<AgentEvent> {
    match record {
        ClaudeRecord::System {}
        | ClaudeRecord::User {}
        | ClaudeRecord::MessageStart {}
        | ClaudeRecord::MessageDelta {}
        | ClaudeRecord::MessageStop {}
        | ClaudeRecord::ContentBlockStop {}
        | ClaudeRecord::ToolResult {} => Vec::new(),
        ClaudeRecord::Assistant { message } => message
            .content
            .into_iter()
            .filter_map(block_event)
            .collect(),
        ClaudeRecord::ContentBlockStart { content_block } => match content_block {
            ContentBlock::ToolUse { .. } => block_event(content_block).into_iter().collect(),
            _ => Vec::new(),
        },
        ClaudeRecord::ContentBlockDelta { delta } => match delta {
            Delta::TextDelta { text } => vec![AgentEvent::TextDelta { text }],
            Delta::ThinkingDelta { thinking } => vec![AgentEvent::Thinking { text: thinking }],
            Delta::Other => Vec::new(),
        },
        ClaudeRecord::StreamEvent { event } => {
            match event.get("type").and_then(Value::as_str).map(str::to_string) {
                Some(kind) => decode_claude(&kind, event),
                None => Vec::new(),
            }
        }
        ClaudeRecord::Result {
            is_error,
            subtype,
            result,
        } => {
            if is_error {
                let message = result
                    .or(subtype)
                    .unwrap_or_else(|| "agent reported an error result".to_string());
                vec![error_event(None, message)]
            } else {
                vec![AgentEvent::Result {
                    text: result.unwrap_or_default(),
                }]
            }
        }
        ClaudeRecord::Error { error } => vec![error.into_event()],
        ClaudeRecord::ToolCode { name, args } => vec![AgentEvent::ToolCall { name, params: args }],
    }
}

fn block_event(block: ContentBlock) -> Option<AgentEvent> {
    match block {
        ContentBlock::Text { text } => Some(AgentEvent::TextDelta { text }),
        ContentBlock::Thinking { thinking } => Some(AgentEvent::Thinking { text: thinking }),
        ContentBlock::ToolUse { name, input } => Some(AgentEvent::ToolCall {
            name,
            params: input,
        }),
        ContentBlock::Other => None,
    }
}

// --- codex exec --json ---

const CODEX_TYPES: &[&str] = &[
    "thread.started",
    "turn.started",
    "turn.completed",
    "turn.failed",
    "item.started",
    "item.updated",
    "item.completed",
    "error",
];

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum CodexRecord {
    #[serde(rename = "thread.started")]
    ThreadStarted {},
    #[serde(rename = "turn.started")]
    TurnStarted {},
    #[serde(rename = "turn.completed")]
    TurnCompleted {},
    #[serde(rename = "turn.failed")]
    TurnFailed { error: ErrorBody },
    #[serde(rename = "item.started")]
    ItemStarted {},
    #[serde(rename = "item.updated")]
    ItemUpdated {},
    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CodexItem {
    AgentMessage {
        text: String,
    },
    Reasoning {
        text: String,
    },
    CommandExecution {
        command: String,
        #[serde(default)]
        exit_code: Option<i64>,
    },
    FileChange {
        #[serde(default)]
        changes: Value,
    },
    McpToolCall {
        #[serde(default)]
        server: String,
        tool: String,
        #[serde(default)]
        arguments: Value,
    },
    WebSearch {
        query: String,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Other,
}

fn decode_codex(kind: &str, value: Value) -> Vec<AgentEvent> {
    match serde_json::from_value::<CodexRecord>(value) {
        Ok(record) => codex_events(record),
        Err(err) if CODEX_TYPES.contains(&kind) => vec![malformed_record(kind, &err)],
        Err(_) => vec![unknown_record(kind)],
    }
}

fn codex_events(record: CodexRecord) -> Vec<AgentEvent> {
    match record {
        CodexRecord::ThreadStarted {}
        | CodexRecord::TurnStarted {}
        | CodexRecord::TurnCompleted {}
        | CodexRecord::ItemStarted {}
        | CodexRecord::ItemUpdated {} => Vec::new(),
        CodexRecord::TurnFailed { error } => vec![error.into_event()],
        CodexRecord::Error { message } => vec![error_event(None, message)],
        CodexRecord::ItemCompleted { item } => codex_item_event(item).into_iter().collect(),
    }
}

fn codex_item_event(item: CodexItem) -> Option<AgentEvent> {
    match item {
        CodexItem::AgentMessage { text } => Some(AgentEvent::TextDelta { text }),
        CodexItem::Reasoning { text } => Some(AgentEvent::Thinking { text }),
        CodexItem::CommandExecution { command, exit_code } => Some(AgentEvent::ToolCall {
            name: "shell".to_string(),
            params: serde_json::json!({ "command": command, "exit_code": exit_code }),
        }),
        CodexItem::FileChange { changes } => Some(AgentEvent::ToolCall {
            name: "apply_patch".to_string(),
            params: changes,
        }),
        CodexItem::McpToolCall {
            server,
            tool,
            arguments,
        } => Some(AgentEvent::ToolCall {
            name: if server.is_empty() {
                tool
            } else {
                format!("{server}.{tool}")
            },
            params: arguments,
        }),
        CodexItem::WebSearch { query } => Some(AgentEvent::ToolCall {
            name: "web_search".to_string(),
            params: serde_json::json!({ "query": query }),
        }),
        CodexItem::Error { message } => Some(error_event(None, message)),
        CodexItem::Other => None,
    }
}

/// Splits a chunked byte stream into complete lines.
///
/// Records may be arbitrarily long, so stdout is read in fixed-size chunks and
/// reassembled here rather than with unbounded line reads. Each byte is
/// scanned once; a line longer than the limit keeps its first `limit` bytes
/// and the rest is counted in [`LineBuffer::truncated`].
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    limit: usize,
    truncated: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(usize::MAX)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            limit,
            truncated: 0,
        }
    }

    /// Bytes dropped so far from over-long lines.
    pub fn truncated(&self) -> usize {
        self.truncated
    }

    /// Append a chunk and return every line it completed (without the newline).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.append(&rest[..pos]);
            if self.pending.last() == Some(&b'\r') {
                self.pending.pop();
            }
            lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            self.pending.clear();
            rest = &rest[pos + 1..];
        }
        self.append(rest);
        lines
    }

    /// Flush a trailing line that had no newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn append(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.pending.len());
        let keep = bytes.len().min(room);
        self.pending.extend_from_slice(&bytes[..keep]);
        self.truncated += bytes.len() - keep;
    }
}
