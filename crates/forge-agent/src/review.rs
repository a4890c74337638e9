//! Review gate
//!
//! Deterministic prechecks run first and can reject without a judge call.
//! Otherwise the reviewer model judges the file. Rejections are resubmitted
//! to the developer with the reason attached, up to a fixed number of total
//! attempts; after that the last content is accepted (fail-open). A judge
//! call that fails counts as approval.

use crate::prompts;
use crate::roster::Role;
use crate::session::BuildContext;
use forge_core::verdict::{AuditIssue, AuditVerdict, Severity};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref PRECHECKS: Vec<(Regex, Severity, &'static str, &'static str)> = vec![
        (
            Regex::new(r"before_first_request").unwrap(),
            Severity::High,
            "Uses Flask before_first_request, removed in Flask 2.3",
            "Run one-time setup at application startup instead",
        ),
        (
            Regex::new(r"(?i)your[-_ ]?api[-_ ]?key").unwrap(),
            Severity::High,
            "Contains a placeholder credential",
            "Read credentials from environment variables",
        ),
        (
            Regex::new(r"sk-[A-Za-z0-9_\-]{20,}").unwrap(),
            Severity::Critical,
            "Contains a hardcoded API key literal",
            "Load the key from the environment (os.getenv)",
        ),
    ];
}

/// Where a verdict came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictSource {
    /// A deterministic precheck
    Precheck,
    /// The reviewer model
    Reviewer,
    /// The judge call failed; treated as approval
    ReviewTimeout,
}

/// Run the deterministic prechecks; `Some` means rejected
pub fn precheck(content: &str, prohibited: &[String]) -> Option<AuditVerdict> {
    let mut issues: Vec<AuditIssue> = PRECHECKS
        .iter()
        .filter(|(regex, _, _, _)| regex.is_match(content))
        .map(|(_, severity, description, fix)| AuditIssue {
            severity: *severity,
            description: description.to_string(),
            fix: Some(fix.to_string()),
        })
        .collect();

    issues.extend(prohibited.iter().map(|pattern| AuditIssue {
        severity: Severity::High,
        description: format!("Uses prohibited pattern: {}", pattern),
        fix: Some(format!("Remove every use of {}", pattern)),
    }));

    if issues.is_empty() {
        return None;
    }
    let reason = issues
        .iter()
        .map(|i| i.description.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    Some(AuditVerdict::rejected(reason, issues))
}

/// How to regenerate a rejected file
#[derive(Debug, Clone, Copy)]
pub struct Resubmission<'a> {
    /// Developer directive
    pub directive: &'a str,
    /// The original file prompt
    pub original: &'a str,
}

/// What the gate let through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewOutcome {
    /// Content to write
    pub content: String,
    /// Judge rounds used
    pub attempts: u32,
    /// Rejections seen
    pub rejections: u32,
    /// False when the content was accepted by exhaustion
    pub approved: bool,
    /// Constraint ids learned from rejections
    pub learned: Vec<String>,
}

/// Bounded review loop
#[derive(Debug)]
pub struct ReviewGate<'a> {
    ctx: &'a BuildContext,
    max_attempts: u32,
}

impl<'a> ReviewGate<'a> {
    pub fn new(ctx: &'a BuildContext, max_attempts: u32) -> Self {
        Self {
            ctx,
            max_attempts: max_attempts.max(1),
        }
    }

    /// One verdict for `content`
    pub async fn judge(&self, path: &str, content: &str, manifest_summary: &str) -> (AuditVerdict, VerdictSource) {
        let prohibited = self.ctx.constraints().prohibited_in(content).await;
        if let Some(verdict) = precheck(content, &prohibited) {
            return (verdict, VerdictSource::Precheck);
        }

        let rules = self.ctx.constraints().rules_summary().await;
        let directive = prompts::reviewer_directive(&rules);
        let review = prompts::review_content(path, content, manifest_summary);
        match self.ctx.call(Role::Reviewer, &directive, &review).await {
            Ok(raw) => (AuditVerdict::parse(&raw), VerdictSource::Reviewer),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Review call failed - auto-approving");
                (
                    AuditVerdict::approved("Review timed out - auto-approved."),
                    VerdictSource::ReviewTimeout,
                )
            }
        }
    }

    /// Judge, resubmit on rejection, accept the last content on exhaustion
    #[tracing::instrument(skip(self, content, manifest_summary, resubmission))]
    pub async fn review(
        &self,
        path: &str,
        mut content: String,
        manifest_summary: &str,
        resubmission: Resubmission<'_>,
    ) -> ReviewOutcome {
        let mut rejections = 0;
        let mut learned = Vec::new();

        for attempt in 1..=self.max_attempts {
            let (verdict, source) = self.judge(path, &content, manifest_summary).await;
            if verdict.is_approved() {
                tracing::debug!(attempt, ?source, "Approved");
                return ReviewOutcome {
                    content,
                    attempts: attempt,
                    rejections,
                    approved: true,
                    learned,
                };
            }

            rejections += 1;
            tracing::info!(attempt, ?source, reason = %verdict.reason, "Rejected");
            match self.ctx.constraints().learn_from_rejection(path, &verdict.issues).await {
                Ok(ids) => learned.extend(ids),
                Err(e) => tracing::warn!("Could not record learned constraint: {}", e),
            }

            if attempt == self.max_attempts {
                break;
            }

            let retry = prompts::rejection_content(resubmission.original, &verdict, &content);
            match self.ctx.call(Role::Developer, resubmission.directive, &retry).await {
                Ok(regenerated) => content = regenerated,
                Err(e) => {
                    tracing::warn!(error = %e, "Resubmission failed - keeping last content");
                    return ReviewOutcome {
                        content,
                        attempts: attempt,
                        rejections,
                        approved: false,
                        learned,
                    };
                }
            }
        }

        tracing::warn!(attempts = self.max_attempts, "Review attempts exhausted - accepting last content");
        ReviewOutcome {
            content,
            attempts: self.max_attempts,
            rejections,
            approved: false,
            learned,
        }
    }
}
