//! Outcome classification and error extraction

use forge_core::text::tail_chars;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Characters of stdout/stderr kept on a result
pub const OUTPUT_TAIL_CHARS: usize = 2000;

/// Lines kept from the end of a traceback block
const TRACEBACK_LINES: usize = 10;

/// Lines kept when no error marker is found
const FALLBACK_LINES: usize = 5;

const ERROR_KEYWORDS: [&str; 7] = [
    "Error:",
    "ERROR",
    "FATAL",
    "ModuleNotFoundError",
    "ImportError",
    "SyntaxError",
    "Exception",
];

/// Terminal state of one sandbox attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxClassification {
    /// Exit code zero
    Success,
    /// Non-zero exit
    RuntimeError,
    /// Wall clock exceeded with some output
    Timeout,
    /// Wall clock exceeded with no output on either stream
    Hang,
}

impl fmt::Display for SandboxClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SandboxClassification::Success => "SUCCESS",
            SandboxClassification::RuntimeError => "RUNTIME_ERROR",
            SandboxClassification::Timeout => "TIMEOUT",
            SandboxClassification::Hang => "HANG",
        };
        f.write_str(label)
    }
}

/// What a boundary observed, before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawOutcome {
    /// Process ended on its own
    Exited {
        /// Exit code; `None` when killed by a signal
        code: Option<i32>,
        /// Captured stdout
        stdout: String,
        /// Captured stderr
        stderr: String,
    },
    /// Process was killed at the deadline
    TimedOut {
        /// Output captured before the kill
        stdout: String,
        /// Output captured before the kill
        stderr: String,
    },
}

/// Classified result of one sandbox attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxResult {
    /// `classification == Success`
    pub success: bool,
    /// Tail of stdout
    pub stdout: String,
    /// Tail of stderr
    pub stderr: String,
    /// Exit code when the process exited
    pub return_code: Option<i32>,
    /// Exactly one terminal state
    pub classification: SandboxClassification,
    /// Most relevant error text; empty on success
    pub error_summary: String,
    /// Command that was run
    pub command: String,
}

impl SandboxResult {
    /// Classify a raw boundary outcome
    pub fn classify(command: &str, raw: RawOutcome, timeout: Duration) -> Self {
        let (classification, code, stdout, stderr) = match raw {
            RawOutcome::Exited {
                code: Some(0),
                stdout,
                stderr,
            } => (SandboxClassification::Success, Some(0), stdout, stderr),
            RawOutcome::Exited {
                code,
                stdout,
                stderr,
            } => (SandboxClassification::RuntimeError, code, stdout, stderr),
            RawOutcome::TimedOut { stdout, stderr } => {
                if stdout.trim().is_empty() && stderr.trim().is_empty() {
                    (SandboxClassification::Hang, None, stdout, stderr)
                } else {
                    (SandboxClassification::Timeout, None, stdout, stderr)
                }
            }
        };

        let secs = timeout.as_secs();
        let error_summary = match classification {
            SandboxClassification::Success => String::new(),
            SandboxClassification::RuntimeError => {
                extract_error_summary(&format!("{}{}", stderr, stdout))
            }
            SandboxClassification::Timeout => format!("Execution timed out after {}s", secs),
            SandboxClassification::Hang => format!(
                "HANG DETECTED: program survived {}s but produced no output. \
                 Likely an infinite loop without I/O or sleep.",
                secs
            ),
        };

        Self {
            success: classification == SandboxClassification::Success,
            stdout: tail_chars(&stdout, OUTPUT_TAIL_CHARS).to_string(),
            stderr: tail_chars(&stderr, OUTPUT_TAIL_CHARS).to_string(),
            return_code: code,
            classification,
            error_summary,
            command: command.to_string(),
        }
    }

    /// Result for a boundary that could not even start the program
    pub fn boundary_failure(command: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            stdout: String::new(),
            stderr: message.clone(),
            return_code: None,
            classification: SandboxClassification::RuntimeError,
            error_summary: message,
            command: command.to_string(),
        }
    }
}

/// Pick the most meaningful error text from program output.
///
/// Order: the last traceback block (at most 10 lines), the last line
/// carrying an error keyword, the last five lines.
pub fn extract_error_summary(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return "No error output captured.".to_string();
    }
    let lines: Vec<&str> = trimmed.lines().collect();

    let mut traceback: Vec<&str> = Vec::new();
    let mut in_traceback = false;
    for line in &lines {
        if line.contains("Traceback") {
            in_traceback = true;
            traceback = vec![*line];
        } else if in_traceback {
            traceback.push(*line);
        }
    }
    if !traceback.is_empty() {
        let start = traceback.len().saturating_sub(TRACEBACK_LINES);
        return traceback[start..].join("\n");
    }

    for line in lines.iter().rev() {
        if ERROR_KEYWORDS.iter().any(|k| line.contains(k)) {
            return line.trim().to_string();
        }
    }

    let start = lines.len().saturating_sub(FALLBACK_LINES);
    lines[start..].join("\n")
}
