//! Decoding of the assistant CLI's `stream-json` output.
//!
//! Each stdout line is one JSON event tagged by `type`. [`StreamAccumulator`]
//! folds a run's events into the final response text and session id.

use serde::Deserialize;
use serde_json::Value;

/// Events from the assistant CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "system")]
    System {
        subtype: String,
        #[serde(default)]
        session_id: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Short description of a tool call for debug logs.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());
    match name {
        "Read" | "Write" | "Edit" => match field("file_path") {
            Some(path) => format!("{} {}", name, path),
            None => name.to_string(),
        },
        "Bash" => format!("Bash {}", field("command").map(|c| truncate_str(c, 60)).unwrap_or_default()),
        "Glob" | "Grep" => format!("{} {}", name, field("pattern").unwrap_or("*")),
        _ => name.to_string(),
    }
}

fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

/// Text fragment produced while folding a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Folded {
    /// Assistant text to forward to streaming consumers
    Text(String),
    Nothing,
}

/// Accumulates one run of stream events.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    final_result: Option<String>,
    session_id: Option<String>,
    is_error: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stdout line. Lines that are not stream events are kept as text.
    pub fn push_line(&mut self, line: &str) -> Folded {
        if line.trim().is_empty() {
            return Folded::Nothing;
        }
        match serde_json::from_str::<StreamEvent>(line) {
            Ok(event) => self.push_event(event),
            Err(_) => {
                self.text.push_str(line);
                self.text.push('\n');
                Folded::Text(line.to_string())
            }
        }
    }

    pub fn push_event(&mut self, event: StreamEvent) -> Folded {
        match event {
            StreamEvent::Assistant {
                message,
                session_id,
            } => {
                self.note_session(session_id);
                let mut emitted = String::new();
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            self.text.push_str(&text);
                            self.text.push('\n');
                            emitted.push_str(&text);
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            tracing::debug!(tool = %describe_tool_use(&name, &input), "Assistant tool use");
                        }
                        ContentBlock::Other => {}
                    }
                }
                if emitted.is_empty() {
                    Folded::Nothing
                } else {
                    Folded::Text(emitted)
                }
            }
            StreamEvent::Result {
                result,
                is_error,
                session_id,
                ..
            } => {
                self.note_session(session_id);
                self.final_result = result;
                self.is_error = is_error;
                Folded::Nothing
            }
            StreamEvent::System { session_id, .. } => {
                self.note_session(session_id);
                Folded::Nothing
            }
            StreamEvent::User {} => Folded::Nothing,
        }
    }

    fn note_session(&mut self, session_id: String) {
        if !session_id.is_empty() {
            self.session_id = Some(session_id);
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    /// The final result when reported, otherwise all accumulated text.
    pub fn into_output(self) -> String {
        self.final_result.unwrap_or(self.text)
    }
}
