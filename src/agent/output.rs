//! The agent child-process wire contract: JSON input on stdin, a
//! marker-delimited JSON payload somewhere in stdout.

use crate::error::{Result, RouterError};
use serde::{Deserialize, Serialize};

pub const OUTPUT_START: &str = "---NANOCLAW_OUTPUT_START---";
pub const OUTPUT_END: &str = "---NANOCLAW_OUTPUT_END---";

/// Prefix on stderr lines destined for the status relay.
pub const STATUS_PREFIX: &str = "STATUS:";

/// The single JSON document written to the agent's stdin.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInput<'a> {
    pub prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<&'a str>,
    pub group_folder: &'a str,
    pub chat_jid: &'a str,
    pub is_main: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_scheduled_task: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Message,
    Log,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub output_type: OutputKind,
    #[serde(default)]
    pub user_message: Option<String>,
    #[serde(default)]
    pub internal_log: Option<String>,
}

/// The payload found between the output markers.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub status: AgentStatus,
    #[serde(default)]
    pub result: Option<AgentResult>,
    #[serde(default)]
    pub new_session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Incremental stdout scanner. Free text outside the markers is ignored;
/// the payload between them is captured raw and parsed at the end so a
/// partial result survives an agent that crashes after emitting it.
#[derive(Debug, Default)]
pub struct OutputScanner {
    in_payload: bool,
    payload: String,
    captured: Option<String>,
}

impl OutputScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_line(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed == OUTPUT_START {
            self.in_payload = true;
            self.payload.clear();
            return;
        }
        if trimmed == OUTPUT_END {
            if self.in_payload {
                self.captured = Some(self.payload.clone());
            }
            self.in_payload = false;
            return;
        }
        if self.in_payload {
            self.payload.push_str(line);
            self.payload.push('\n');
        }
    }

    /// The parsed payload, if a complete marker block was seen.
    pub fn response(&self) -> Result<Option<AgentResponse>> {
        let Some(raw) = &self.captured else {
            return Ok(None);
        };
        let response: AgentResponse = serde_json::from_str(raw).map_err(|error| {
            RouterError::Agent(format!("unparseable agent payload: {error}"))
        })?;
        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_extracts_payload_between_markers() {
        let mut scanner = OutputScanner::new();
        scanner.feed_line("booting agent...");
        scanner.feed_line(OUTPUT_START);
        scanner.feed_line(r#"{"status":"success","result":{"outputType":"message","userMessage":"hello"},"#);
        scanner.feed_line(r#" "newSessionId":"sess-9"}"#);
        scanner.feed_line(OUTPUT_END);
        scanner.feed_line("trailing noise");

        let response = scanner.response().unwrap().unwrap();
        assert_eq!(response.status, AgentStatus::Success);
        assert_eq!(response.new_session_id.as_deref(), Some("sess-9"));
        let result = response.result.unwrap();
        assert_eq!(result.output_type, OutputKind::Message);
        assert_eq!(result.user_message.as_deref(), Some("hello"));
    }

    #[test]
    fn missing_markers_yield_no_payload() {
        let mut scanner = OutputScanner::new();
        scanner.feed_line("just logs");
        assert!(scanner.response().unwrap().is_none());

        // An unterminated block is not a payload either.
        scanner.feed_line(OUTPUT_START);
        scanner.feed_line("{\"status\":\"success\"}");
        assert!(scanner.response().unwrap().is_none());
    }

    #[test]
    fn garbage_payload_is_an_error() {
        let mut scanner = OutputScanner::new();
        scanner.feed_line(OUTPUT_START);
        scanner.feed_line("not json");
        scanner.feed_line(OUTPUT_END);
        assert!(scanner.response().is_err());
    }

    #[test]
    fn input_serialization_uses_camel_case_and_skips_absent_fields() {
        let input = AgentInput {
            prompt: "<messages/>",
            session_id: None,
            group_folder: "garden",
            chat_jid: "g1",
            is_main: false,
            is_scheduled_task: false,
        };
        let raw = serde_json::to_string(&input).unwrap();
        assert!(raw.contains("\"groupFolder\":\"garden\""));
        assert!(!raw.contains("sessionId"));
        assert!(!raw.contains("isScheduledTask"));

        let input = AgentInput {
            session_id: Some("sess-1"),
            is_scheduled_task: true,
            ..input
        };
        let raw = serde_json::to_string(&input).unwrap();
        assert!(raw.contains("\"sessionId\":\"sess-1\""));
        assert!(raw.contains("\"isScheduledTask\":true"));
    }
}
