//! Batch shaping: prompt serialisation and the trigger gate.

use crate::error::Result;
use crate::store::StoredMessage;
use regex::Regex;

/// Escape a string for use in XML attribute or body position.
pub fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Serialise a batch as the agent prompt:
/// `<messages><message sender time>…</message>…</messages>`.
pub fn render_prompt(messages: &[StoredMessage]) -> String {
    let mut out = String::from("<messages>");
    for message in messages {
        out.push_str(&format!(
            "<message sender=\"{}\" time=\"{}\">{}</message>",
            xml_escape(&message.sender_name),
            xml_escape(&message.timestamp),
            xml_escape(&message.content)
        ));
    }
    out.push_str("</messages>");
    out
}

/// Compile a trigger word into its gate pattern: case-insensitive, anchored
/// at the start, closed with a word boundary.
pub fn trigger_regex(word: &str) -> Result<Regex> {
    let pattern = format!(r"(?i)^\s*{}\b", regex::escape(word.trim()));
    Regex::new(&pattern).map_err(|error| {
        crate::RouterError::Other(anyhow::anyhow!("bad trigger pattern {word:?}: {error}"))
    })
}

/// Whether any message in the batch matches the trigger.
pub fn batch_matches_trigger(messages: &[StoredMessage], word: &str) -> bool {
    let Ok(regex) = trigger_regex(word) else {
        return false;
    };
    messages.iter().any(|m| regex.is_match(&m.content))
}
