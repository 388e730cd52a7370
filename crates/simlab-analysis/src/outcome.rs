//! Per-agent log scoring.
//!
//! The agent runtime records its conversation as a list of turn records
//! (`{"role": ..., "content": ...}`), either as a bare JSON array or under a
//! top-level `turns` key. Only `system` turns carry the terminal message that
//! decides the outcome; the patterns below are the single place those
//! messages are recognised.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::warn;

pub const SYSTEM_ROLE: &str = "system";
pub const TIMEOUT_MARKER: &str = "Task timeout reached";
pub const SCORE_MARKER: &str = "Task ended with score : ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    Success,
    FailedScoreZero,
    FailedPartialScore,
    TimedOut,
    NoScoreLogged,
    LogFileError,
}

impl CompletionStatus {
    pub const ALL: [CompletionStatus; 6] = [
        CompletionStatus::Success,
        CompletionStatus::FailedScoreZero,
        CompletionStatus::FailedPartialScore,
        CompletionStatus::TimedOut,
        CompletionStatus::NoScoreLogged,
        CompletionStatus::LogFileError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::FailedScoreZero => "FAILED_SCORE_ZERO",
            Self::FailedPartialScore => "FAILED_PARTIAL_SCORE",
            Self::TimedOut => "TIMED_OUT",
            Self::NoScoreLogged => "NO_SCORE_LOGGED",
            Self::LogFileError => "LOG_FILE_ERROR",
        }
    }

    pub fn from_score(score: f64) -> Self {
        if score == 1.0 {
            Self::Success
        } else if score == 0.0 {
            Self::FailedScoreZero
        } else {
            Self::FailedPartialScore
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TerminalMessage {
    Timeout,
    Score(f64),
}

/// Classifies one system message. Timeout wins over a score in the same text.
pub fn match_terminal_message(content: &str) -> Option<TerminalMessage> {
    if content.contains(TIMEOUT_MARKER) {
        return Some(TerminalMessage::Timeout);
    }
    parse_score(content).map(TerminalMessage::Score)
}

fn parse_score(content: &str) -> Option<f64> {
    let start = content.find(SCORE_MARKER)? + SCORE_MARKER.len();
    let rest = &content[start..];
    let mut seen_dot = false;
    let end = rest
        .char_indices()
        .find(|(idx, ch)| {
            if ch.is_ascii_digit() {
                return false;
            }
            if *ch == '.' && !seen_dot && *idx > 0 {
                seen_dot = true;
                return false;
            }
            true
        })
        .map(|(idx, _)| idx)
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    rest[..end].parse::<f64>().ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub log_file: String,
    pub raw_score: f64,
    pub status: CompletionStatus,
    pub final_message: String,
    pub log_readable: bool,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl AgentOutcome {
    fn log_error(log_file: String, error: String) -> Self {
        Self {
            log_file,
            raw_score: 0.0,
            status: CompletionStatus::LogFileError,
            final_message: String::new(),
            log_readable: false,
            timed_out: false,
            parse_error: Some(error),
        }
    }
}

/// Scores one agent log. Never fails: unreadable or malformed logs become
/// `LOG_FILE_ERROR`. The file is only read.
pub fn extract_agent_outcome(path: &Path) -> AgentOutcome {
    let log_file = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    match fs::read(path) {
        Ok(bytes) => {
            let outcome = extract_agent_outcome_from_bytes(&log_file, &bytes);
            if let Some(err) = outcome.parse_error.as_deref() {
                warn!(path = %path.display(), error = %err, "agent log could not be parsed");
            }
            outcome
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "agent log could not be read");
            AgentOutcome::log_error(log_file, format!("read error: {}", err))
        }
    }
}

pub fn extract_agent_outcome_from_bytes(log_file: &str, bytes: &[u8]) -> AgentOutcome {
    let value: Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(err) => return AgentOutcome::log_error(log_file.to_string(), format!("invalid JSON: {}", err)),
    };
    let turns = match &value {
        Value::Array(turns) => turns,
        Value::Object(map) => match map.get("turns") {
            Some(Value::Array(turns)) => turns,
            _ => {
                return AgentOutcome::log_error(
                    log_file.to_string(),
                    "log object has no 'turns' array".to_string(),
                )
            }
        },
        _ => {
            return AgentOutcome::log_error(
                log_file.to_string(),
                "log is neither a turn list nor an object with 'turns'".to_string(),
            )
        }
    };
    outcome_from_turns(log_file, turns)
}

fn system_messages(turns: &[Value]) -> impl DoubleEndedIterator<Item = &str> {
    turns.iter().filter_map(|turn| {
        if turn.get("role").and_then(Value::as_str) != Some(SYSTEM_ROLE) {
            return None;
        }
        turn.get("content").and_then(Value::as_str)
    })
}

fn outcome_from_turns(log_file: &str, turns: &[Value]) -> AgentOutcome {
    let mut outcome = AgentOutcome {
        log_file: log_file.to_string(),
        raw_score: 0.0,
        status: CompletionStatus::NoScoreLogged,
        final_message: String::new(),
        log_readable: true,
        timed_out: false,
        parse_error: None,
    };

    if let Some(message) = system_messages(turns)
        .rev()
        .find(|content| matches!(match_terminal_message(content), Some(TerminalMessage::Timeout)))
    {
        outcome.status = CompletionStatus::TimedOut;
        outcome.timed_out = true;
        outcome.final_message = message.to_string();
        return outcome;
    }

    for content in system_messages(turns).rev() {
        if let Some(TerminalMessage::Score(score)) = match_terminal_message(content) {
            outcome.raw_score = score;
            outcome.status = CompletionStatus::from_score(score);
            outcome.final_message = content.to_string();
            break;
        }
    }
    outcome
}
