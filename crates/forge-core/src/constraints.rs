//! Constraint memory
//!
//! Cross-build store of failure patterns. Rules are only ever appended,
//! deduplicated by case-insensitive issue text, and persisted after every
//! change. The store provides three things:
//!
//! 1. A rule summary injected into synthesis and review prompts
//! 2. A deterministic pattern -> replacement [`AutoFixer`] applied to every
//!    file before it is written, with no remote calls
//! 3. A learning hook that turns medium/high severity review issues into
//!    new permanent rules
//!
//! Several builds may share one store through an `Arc`; the document is
//! re-read from disk before every append so separate processes do not
//! overwrite each other's rules.

use crate::error::{ConstraintError, Result};
use crate::text::head_chars;
use crate::verdict::AuditIssue;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Longest issue text kept in a learned rule
const MAX_ISSUE_CHARS: usize = 120;

/// Fixed-point passes before the auto-fixer gives up
const MAX_FIX_PASSES: usize = 16;

/// A permanent rule learned from an earlier failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintRule {
    /// Stable identifier (`AUTO-001`)
    pub id: String,
    /// What went wrong
    pub issue: String,
    /// What to do instead
    pub lesson: String,
    /// How the rule came to be
    #[serde(default)]
    pub enforcement: String,
    /// RFC 3339 timestamp
    #[serde(default)]
    pub learned_at: String,
}

/// A literal find/replace correction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixRule {
    /// Rule family shown in logs
    pub rule: String,
    /// Text to find
    pub pattern: String,
    /// Text to put in its place
    pub replacement: String,
    /// Only apply to paths with this suffix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applies_to: Option<String>,
}

impl FixRule {
    /// Validated rule; the replacement may not reintroduce the pattern
    pub fn new(
        rule: impl Into<String>,
        pattern: impl Into<String>,
        replacement: impl Into<String>,
    ) -> std::result::Result<Self, ConstraintError> {
        let pattern = pattern.into();
        let replacement = replacement.into();
        if pattern.is_empty() {
            return Err(ConstraintError::EmptyPattern);
        }
        if replacement.contains(&pattern) {
            return Err(ConstraintError::NonIdempotentRule(pattern));
        }
        Ok(Self {
            rule: rule.into(),
            pattern,
            replacement,
            applies_to: None,
        })
    }

    /// Restrict to paths ending in `suffix`
    pub fn for_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.applies_to = Some(suffix.into());
        self
    }

    fn applies(&self, path: &str) -> bool {
        self.applies_to
            .as_deref()
            .map(|suffix| path.ends_with(suffix))
            .unwrap_or(true)
    }

    fn is_valid(&self) -> bool {
        !self.pattern.is_empty() && !self.replacement.contains(&self.pattern)
    }
}

/// Result of running the auto-fixer over one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixOutcome {
    /// Corrected content
    pub content: String,
    /// Descriptions of the rules that fired
    pub applied: Vec<String>,
}

/// Deterministic pattern -> replacement corrector
#[derive(Debug, Clone)]
pub struct AutoFixer {
    rules: Vec<FixRule>,
}

impl AutoFixer {
    /// Fixer with no rules
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Fixer with the built-in migration table
    pub fn builtin() -> Self {
        let table: [(&str, &str, &str); 18] = [
            ("MoviePy V2 imports", "from moviepy.editor import", "from moviepy import"),
            ("MoviePy V2 imports", "from moviepy.editor", "from moviepy"),
            (
                "Flask 2.3+ removed APIs",
                "@app.before_first_request\n",
                "# Flask 2.3 removed before_first_request; run setup once at startup\n",
            ),
            (
                "Python 3.13 stdlib removals",
                "import audioop\n",
                "import audioop_lts as audioop\n",
            ),
            ("Python 3.13 stdlib removals", "from audioop import", "from audioop_lts import"),
            (
                "Pydantic V2 migration",
                "from pydantic import validator",
                "from pydantic import field_validator",
            ),
            ("Pydantic V2 migration", "@validator(", "@field_validator("),
            ("MoviePy V2 renames", ".subclip(", ".subclipped("),
            ("MoviePy V2 renames", ".set_position(", ".with_position("),
            ("MoviePy V2 renames", ".set_duration(", ".with_duration("),
            ("MoviePy V2 renames", ".set_audio(", ".with_audio("),
            ("MoviePy V2 renames", ".set_start(", ".with_start("),
            ("MoviePy V2 renames", ".set_end(", ".with_end("),
            ("MoviePy V2 renames", ".set_opacity(", ".with_opacity("),
            ("MoviePy V2 renames", ".set_fps(", ".with_fps("),
            ("MoviePy V2 renames", ".volumex(", ".with_volume_scaled("),
            ("MoviePy V2 renames", "fontsize=", "font_size="),
            (
                "Datetime deprecations",
                "datetime.utcnow()",
                "datetime.now(timezone.utc)",
            ),
        ];

        let rules = table
            .iter()
            .filter_map(|(rule, pattern, replacement)| {
                FixRule::new(*rule, *pattern, *replacement)
                    .ok()
                    .map(|r| r.for_suffix(".py"))
            })
            .collect();
        Self { rules }
    }

    /// Add a rule
    pub fn push(&mut self, rule: FixRule) {
        if rule.is_valid() && !self.rules.contains(&rule) {
            self.rules.push(rule);
        }
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply every rule for `path` until the content stops changing.
    ///
    /// Running to a fixed point makes the fixer idempotent:
    /// `apply(apply(x)) == apply(x)`.
    pub fn apply(&self, path: &str, content: &str) -> FixOutcome {
        let mut current = content.to_string();
        let mut applied: Vec<String> = Vec::new();

        for _ in 0..MAX_FIX_PASSES {
            let mut changed = false;
            for rule in self.rules.iter().filter(|r| r.applies(path)) {
                if current.contains(&rule.pattern) {
                    current = current.replace(&rule.pattern, &rule.replacement);
                    changed = true;
                    let desc = format!(
                        "{}: '{}' -> '{}'",
                        rule.rule,
                        rule.pattern.trim(),
                        rule.replacement.trim()
                    );
                    if !applied.contains(&desc) {
                        applied.push(desc);
                    }
                }
            }
            if !changed {
                break;
            }
        }

        if !applied.is_empty() {
            tracing::debug!(path = %path, fixes = applied.len(), "Auto-fix applied");
        }
        FixOutcome {
            content: current,
            applied,
        }
    }
}

impl Default for AutoFixer {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Persisted constraint document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintDocument {
    /// Learned rules
    #[serde(default)]
    pub permanent_rules: Vec<ConstraintRule>,
    /// Literal text that must not appear in generated code
    #[serde(default)]
    pub prohibited_patterns: Vec<String>,
    /// User- or build-registered find/replace fixes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auto_fixes: Vec<FixRule>,
    /// Unknown keys are preserved
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ConstraintDocument {
    fn knows_issue(&self, issue: &str) -> bool {
        let needle = issue.trim().to_lowercase();
        self.permanent_rules
            .iter()
            .any(|r| r.issue.trim().to_lowercase() == needle)
    }

    fn next_id(&self) -> String {
        let taken: BTreeSet<&str> = self.permanent_rules.iter().map(|r| r.id.as_str()).collect();
        let mut n = self.permanent_rules.len() + 1;
        loop {
            let id = format!("AUTO-{:03}", n);
            if !taken.contains(id.as_str()) {
                return id;
            }
            n += 1;
        }
    }

    /// Merge another snapshot, keeping this one's order and deduplicating
    fn merge(&mut self, other: ConstraintDocument) {
        for rule in other.permanent_rules {
            if !self.knows_issue(&rule.issue) {
                self.permanent_rules.push(rule);
            }
        }
        for pattern in other.prohibited_patterns {
            let lower = pattern.to_lowercase();
            if !self.prohibited_patterns.iter().any(|p| p.to_lowercase() == lower) {
                self.prohibited_patterns.push(pattern);
            }
        }
        for fix in other.auto_fixes {
            if !self.auto_fixes.contains(&fix) {
                self.auto_fixes.push(fix);
            }
        }
        for (key, value) in other.extra {
            self.extra.entry(key).or_insert(value);
        }
    }
}

/// Shared, persistent constraint store
#[derive(Debug)]
pub struct ConstraintMemory {
    doc: RwLock<ConstraintDocument>,
    path: Option<PathBuf>,
}

impl ConstraintMemory {
    /// In-memory store (tests, dry runs)
    pub fn in_memory() -> Self {
        Self {
            doc: RwLock::new(ConstraintDocument::default()),
            path: None,
        }
    }

    /// Store backed by a JSON document; a missing or corrupt file starts empty
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = read_document(&path).await.unwrap_or_default();
        tracing::info!(
            rules = doc.permanent_rules.len(),
            patterns = doc.prohibited_patterns.len(),
            "Constraint memory loaded from {}",
            path.display()
        );
        Ok(Self {
            doc: RwLock::new(doc),
            path: Some(path),
        })
    }

    /// Snapshot of the document
    pub async fn snapshot(&self) -> ConstraintDocument {
        self.doc.read().await.clone()
    }

    /// Number of permanent rules
    pub async fn rule_count(&self) -> usize {
        self.doc.read().await.permanent_rules.len()
    }

    /// Prompt block listing every rule and prohibited pattern
    pub async fn rules_summary(&self) -> String {
        let doc = self.doc.read().await;
        if doc.permanent_rules.is_empty() && doc.prohibited_patterns.is_empty() {
            return String::new();
        }
        let mut lines = vec!["PERMANENT CONSTRAINTS (learned from earlier builds):".to_string()];
        for rule in &doc.permanent_rules {
            lines.push(format!("  [{}] {}: {}", rule.id, rule.issue, rule.lesson));
        }
        if !doc.prohibited_patterns.is_empty() {
            lines.push("  PROHIBITED:".to_string());
            for pattern in &doc.prohibited_patterns {
                lines.push(format!("    - {}", pattern));
            }
        }
        lines.join("\n")
    }

    /// Prohibited patterns present in `content` (case-insensitive)
    pub async fn prohibited_in(&self, content: &str) -> Vec<String> {
        let lowered = content.to_lowercase();
        self.doc
            .read()
            .await
            .prohibited_patterns
            .iter()
            .filter(|p| !p.trim().is_empty() && lowered.contains(&p.to_lowercase()))
            .cloned()
            .collect()
    }

    /// Built-in fixes plus any stored in the document
    pub async fn auto_fixer(&self) -> AutoFixer {
        let mut fixer = AutoFixer::builtin();
        for rule in &self.doc.read().await.auto_fixes {
            fixer.push(rule.clone());
        }
        fixer
    }

    /// Record one rule unless an equivalent issue is already known.
    ///
    /// Returns the new rule id, or `None` for a duplicate.
    pub async fn learn(
        &self,
        issue: &str,
        lesson: &str,
        enforcement: &str,
    ) -> Result<Option<String>> {
        let mut doc = self.doc.write().await;
        self.merge_from_disk(&mut doc).await;

        let issue = head_chars(issue.trim(), MAX_ISSUE_CHARS).to_string();
        if issue.is_empty() || doc.knows_issue(&issue) {
            tracing::debug!(issue = %issue, "Constraint already known");
            return Ok(None);
        }

        let id = doc.next_id();
        doc.permanent_rules.push(ConstraintRule {
            id: id.clone(),
            issue: issue.clone(),
            lesson: lesson.to_string(),
            enforcement: enforcement.to_string(),
            learned_at: Utc::now().to_rfc3339(),
        });
        self.persist(&doc).await?;
        tracing::info!(id = %id, issue = %issue, "New constraint learned");
        Ok(Some(id))
    }

    /// Turn medium/high severity review issues into rules
    pub async fn learn_from_rejection(&self, file: &str, issues: &[AuditIssue]) -> Result<Vec<String>> {
        let mut learned = Vec::new();
        for issue in issues.iter().filter(|i| i.severity.is_learnable()) {
            let lesson = issue
                .fix
                .clone()
                .unwrap_or_else(|| "Avoid this pattern in future builds.".to_string());
            let enforcement = format!("Auto-learned from review rejection of {}", file);
            if let Some(id) = self.learn(&issue.description, &lesson, &enforcement).await? {
                learned.push(id);
            }
        }
        Ok(learned)
    }

    /// Add a prohibited pattern (case-insensitive dedup); true if added
    pub async fn learn_prohibited_pattern(&self, pattern: &str) -> Result<bool> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Ok(false);
        }
        let mut doc = self.doc.write().await;
        self.merge_from_disk(&mut doc).await;

        let lower = pattern.to_lowercase();
        if doc.prohibited_patterns.iter().any(|p| p.to_lowercase() == lower) {
            return Ok(false);
        }
        doc.prohibited_patterns.push(pattern.to_string());
        self.persist(&doc).await?;
        tracing::info!(pattern = %pattern, "New prohibited pattern");
        Ok(true)
    }

    /// Store a find/replace fix for future builds
    pub async fn register_auto_fix(&self, rule: FixRule) -> Result<bool> {
        if !rule.is_valid() {
            return Err(ConstraintError::NonIdempotentRule(rule.pattern).into());
        }
        let mut doc = self.doc.write().await;
        self.merge_from_disk(&mut doc).await;
        if doc.auto_fixes.contains(&rule) {
            return Ok(false);
        }
        doc.auto_fixes.push(rule);
        self.persist(&doc).await?;
        Ok(true)
    }

    async fn merge_from_disk(&self, doc: &mut ConstraintDocument) {
        if let Some(path) = &self.path {
            if let Some(disk) = read_document(path).await {
                doc.merge(disk);
            }
        }
    }

    async fn persist(&self, doc: &ConstraintDocument) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(doc)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

async fn read_document(path: &Path) -> Option<ConstraintDocument> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&content) {
        Ok(doc) => Some(doc),
        Err(e) => {
            tracing::warn!("Ignoring corrupt constraint document {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::Severity;
    use proptest::prelude::*;

    fn issue(severity: Severity, description: &str) -> AuditIssue {
        AuditIssue {
            severity,
            description: description.to_string(),
            fix: Some("do it properly".to_string()),
        }
    }

    #[test]
    fn test_builtin_fixes() {
        let fixer = AutoFixer::builtin();
        let out = fixer.apply(
            "video.py",
            "from moviepy.editor import VideoFileClip\nclip = clip.subclip(0, 5)\n",
        );
        assert_eq!(out.content, "from moviepy import VideoFileClip\nclip = clip.subclipped(0, 5)\n");
        assert_eq!(out.applied.len(), 2);

        let untouched = fixer.apply("notes.md", "from moviepy.editor import x");
        assert!(untouched.applied.is_empty());
    }

    #[test]
    fn test_rejects_self_reintroducing_rule() {
        assert!(matches!(
            FixRule::new("bad", "foo", "foobar"),
            Err(ConstraintError::NonIdempotentRule(_))
        ));
        assert!(matches!(FixRule::new("bad", "", "x"), Err(ConstraintError::EmptyPattern)));
    }

    #[tokio::test]
    async fn test_learning_dedups_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory/constraints.json");
        let memory = ConstraintMemory::open(&path).await.unwrap();

        let first = memory.learn("Unbounded while loop", "add sleep", "test").await.unwrap();
        assert_eq!(first.as_deref(), Some("AUTO-001"));
        let dup = memory.learn("unbounded WHILE loop", "other", "test").await.unwrap();
        assert!(dup.is_none());
        assert_eq!(memory.rule_count().await, 1);

        let reopened = ConstraintMemory::open(&path).await.unwrap();
        assert_eq!(reopened.rule_count().await, 1);
        assert!(reopened.rules_summary().await.contains("[AUTO-001] Unbounded while loop"));
    }

    #[tokio::test]
    async fn test_learn_from_rejection_filters_severity() {
        let memory = ConstraintMemory::in_memory();
        let learned = memory
            .learn_from_rejection(
                "main.py",
                &[
                    issue(Severity::High, "Hardcoded credentials"),
                    issue(Severity::Low, "Naming"),
                    issue(Severity::Medium, "Missing timeout on requests"),
                    issue(Severity::Medium, "hardcoded CREDENTIALS"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(learned, vec!["AUTO-001", "AUTO-002"]);
    }

    #[tokio::test]
    async fn test_prohibited_patterns() {
        let memory = ConstraintMemory::in_memory();
        assert!(memory.learn_prohibited_pattern("eval(").await.unwrap());
        assert!(!memory.learn_prohibited_pattern("EVAL(").await.unwrap());
        assert_eq!(memory.prohibited_in("x = eval(data)").await, vec!["eval("]);
        assert!(memory.rules_summary().await.contains("PROHIBITED"));
    }

    #[tokio::test]
    async fn test_separate_handles_do_not_lose_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("constraints.json");
        let a = ConstraintMemory::open(&path).await.unwrap();
        let b = ConstraintMemory::open(&path).await.unwrap();

        a.learn("issue one", "lesson", "a").await.unwrap();
        b.learn("issue two", "lesson", "b").await.unwrap();

        let merged = ConstraintMemory::open(&path).await.unwrap();
        assert_eq!(merged.rule_count().await, 2);
    }

    #[tokio::test]
    async fn test_stored_auto_fixes_extend_builtin() {
        let memory = ConstraintMemory::in_memory();
        let rule = FixRule::new("Requests timeout", "requests.get(url)", "requests.get(url, timeout=10)")
            .unwrap();
        assert!(memory.register_auto_fix(rule).await.unwrap());
        let fixer = memory.auto_fixer().await;
        assert_eq!(fixer.len(), AutoFixer::builtin().len() + 1);
        assert_eq!(
            fixer.apply("a.py", "r = requests.get(url)").content,
            "r = requests.get(url, timeout=10)"
        );
    }

    proptest! {
        #[test]
        fn auto_fix_is_idempotent(
            parts in proptest::collection::vec(
                prop_oneof![
                    Just("from moviepy.editor import x\n".to_string()),
                    Just("clip.subclip(1)".to_string()),
                    Just("fontsize=12".to_string()),
                    Just("@app.before_first_request\n".to_string()),
                    Just("datetime.utcnow()".to_string()),
                    Just("from pydantic import validator\n".to_string()),
                    "[a-z ().=\n]{0,12}",
                ],
                0..12,
            )
        ) {
            let fixer = AutoFixer::builtin();
            let source: String = parts.concat();
            let once = fixer.apply("f.py", &source).content;
            let twice = fixer.apply("f.py", &once).content;
            prop_assert_eq!(once, twice);
        }
    }
}
