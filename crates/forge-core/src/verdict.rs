//! Review verdicts
//!
//! Judges answer in loosely structured JSON. [`AuditVerdict::parse`] turns
//! any answer into a verdict; ambiguous answers approve.

use crate::text::{extract_json_object, head_chars};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Review outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditStatus {
    /// File may be written
    Approved,
    /// File should be regenerated
    Rejected,
}

/// How serious a review issue is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Informational
    Low,
    /// Should be fixed
    #[default]
    Medium,
    /// Must be fixed
    High,
    /// Security or data-loss problem
    Critical,
}

impl Severity {
    /// Issues at this level are turned into permanent rules
    pub fn is_learnable(&self) -> bool {
        matches!(self, Severity::High | Severity::Medium)
    }

    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LOW" | "INFO" | "MINOR" => Severity::Low,
            "HIGH" | "MAJOR" => Severity::High,
            "CRITICAL" | "BLOCKER" => Severity::Critical,
            _ => Severity::Medium,
        }
    }
}

/// One problem a reviewer reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditIssue {
    /// Severity
    #[serde(default)]
    pub severity: Severity,
    /// What is wrong
    pub description: String,
    /// Suggested remedy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

/// Result of one review attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditVerdict {
    /// Approved or rejected
    pub status: AuditStatus,
    /// Short explanation
    pub reason: String,
    /// Structured issues, if the reviewer gave any
    #[serde(default)]
    pub issues: Vec<AuditIssue>,
}

impl AuditVerdict {
    /// Approving verdict
    pub fn approved(reason: impl Into<String>) -> Self {
        Self {
            status: AuditStatus::Approved,
            reason: reason.into(),
            issues: Vec::new(),
        }
    }

    /// Rejecting verdict
    pub fn rejected(reason: impl Into<String>, issues: Vec<AuditIssue>) -> Self {
        Self {
            status: AuditStatus::Rejected,
            reason: reason.into(),
            issues,
        }
    }

    /// Whether the file may be written
    pub fn is_approved(&self) -> bool {
        self.status == AuditStatus::Approved
    }

    /// Interpret a reviewer answer.
    ///
    /// JSON without a `status` approves. Non-JSON text rejects only if it
    /// says "REJECTED" somewhere.
    pub fn parse(raw: &str) -> Self {
        let value = match extract_json_object(raw) {
            Some(value) => value,
            None => {
                if raw.to_ascii_uppercase().contains("REJECTED") {
                    return Self::rejected(head_chars(raw.trim(), 200), Vec::new());
                }
                return Self::approved("Reviewer parse fallback - auto-approved.");
            }
        };

        let status = match value.get("status").and_then(|s| s.as_str()) {
            Some(status) => status.to_ascii_uppercase(),
            None => return Self::approved("Reviewer returned no status - auto-approved."),
        };

        let issues: Vec<AuditIssue> = value
            .get("issues")
            .and_then(|i| i.as_array())
            .map(|items| items.iter().filter_map(parse_issue).collect())
            .unwrap_or_default();

        let reason = value
            .get("reason")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| {
                issues
                    .iter()
                    .map(|i| i.description.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            });

        if status.contains("REJECT") {
            Self::rejected(reason, issues)
        } else {
            Self {
                status: AuditStatus::Approved,
                reason,
                issues,
            }
        }
    }
}

fn parse_issue(item: &serde_json::Value) -> Option<AuditIssue> {
    if let Some(text) = item.as_str() {
        return Some(AuditIssue {
            severity: Severity::Medium,
            description: text.to_string(),
            fix: None,
        });
    }
    let description = item
        .get("description")
        .or_else(|| item.get("issue"))
        .and_then(|d| d.as_str())?
        .to_string();
    Some(AuditIssue {
        severity: item
            .get("severity")
            .and_then(|s| s.as_str())
            .map(Severity::parse)
            .unwrap_or_default(),
        description,
        fix: item
            .get("fix")
            .and_then(|f| f.as_str())
            .map(str::to_string),
    })
}

impl fmt::Display for AuditVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status {
            AuditStatus::Approved => "APPROVED",
            AuditStatus::Rejected => "REJECTED",
        };
        write!(f, "{}: {}", status, self.reason)
    }
}
