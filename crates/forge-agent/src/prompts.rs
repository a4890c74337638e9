//! Directive and content builders for every synthesis call

use forge_core::platform::PlatformProfile;
use forge_core::text::head_chars;
use forge_core::verdict::AuditVerdict;
use forge_sandbox::SandboxResult;

/// Appended to the planning directive on the strict retry
pub const STRICT_JSON_SUFFIX: &str = " Output raw JSON only.";

const ERROR_SUMMARY_CHARS: usize = 3000;
const STREAM_CHARS: usize = 2000;

fn with_rules(base: String, rules: &str) -> String {
    if rules.trim().is_empty() {
        base
    } else {
        format!("{}\n\n{}", base, rules)
    }
}

/// Architect directive for the blueprint call
pub fn architect_directive(profile: &PlatformProfile, rules: &str) -> String {
    with_rules(
        format!(
            "You are a senior software architect. Design the smallest complete codebase that \
             satisfies the request. {arch}\n\
             Respond with a single JSON object:\n\
             {{\"project_name\": \"snake_case_name\", \"stack\": [\"...\"], \
             \"files\": [{{\"path\": \"relative/path\", \"task\": \"what this file must implement\"}}], \
             \"dependencies\": [\"package\"], \"run_command\": \"{run}\", \
             \"entry_point\": \"{entry}\"}}\n\
             Paths are relative to the project root. List every source file exactly once.",
            arch = profile.arch_directive,
            run = profile.run_command,
            entry = profile.entry_point,
        ),
        rules,
    )
}

/// Planning content: the request plus optional research notes
pub fn planning_content(request: &str, research: Option<&str>) -> String {
    match research.filter(|r| !r.trim().is_empty()) {
        Some(research) => format!("REQUEST:\n{}\n\nRESEARCH NOTES:\n{}", request, research),
        None => format!("REQUEST:\n{}", request),
    }
}

/// Developer directive for file synthesis, repairs and patches
pub fn developer_directive(profile: &PlatformProfile, rules: &str) -> String {
    with_rules(
        format!(
            "You are a meticulous {label} developer. Write the COMPLETE content of exactly one file. \
             Honor every import the entry point expects from this file. \
             Every long-running loop must contain a sleep or blocking wait. \
             Read secrets from environment variables, never hardcode them. \
             Output ONLY raw file content. No markdown fences, no explanations.",
            label = profile.label
        ),
        rules,
    )
}

/// Everything the developer sees when writing one file
#[derive(Debug, Clone, Default)]
pub struct FilePrompt<'a> {
    pub path: &'a str,
    pub task: &'a str,
    pub manifest_summary: &'a str,
    pub import_contract: Option<&'a str>,
    pub symbol_summary: &'a str,
    pub context: &'a str,
    pub findings: &'a str,
}

impl FilePrompt<'_> {
    /// Render as the user message
    pub fn render(&self) -> String {
        let mut sections = vec![
            format!("FILE: {}\nTASK: {}", self.path, self.task),
            format!("PROJECT PLAN:\n{}", self.manifest_summary),
        ];
        if let Some(contract) = self.import_contract {
            sections.push(format!(
                "IMPORT CONTRACT (the entry point imports these from this file; provide every name):\n{}",
                contract
            ));
        }
        if !self.symbol_summary.trim().is_empty() {
            sections.push(format!("SYMBOLS ALREADY DEFINED:\n{}", self.symbol_summary));
        }
        if !self.findings.trim().is_empty() {
            sections.push(format!("CROSS-FILE ISSUES TO AVOID:\n{}", self.findings));
        }
        if !self.context.trim().is_empty() {
            sections.push(format!("RELATED FILES:\n{}", self.context));
        }
        sections.join("\n\n")
    }
}

/// Resubmission after a review rejection
pub fn rejection_content(original: &str, verdict: &AuditVerdict, previous: &str) -> String {
    let mut fixes: Vec<String> = verdict
        .issues
        .iter()
        .map(|i| match &i.fix {
            Some(fix) => format!("- [{:?}] {} -> {}", i.severity, i.description, fix),
            None => format!("- [{:?}] {}", i.severity, i.description),
        })
        .collect();
    if fixes.is_empty() {
        fixes.push(format!("- {}", verdict.reason));
    }
    format!(
        "{}\n\nPREVIOUS ATTEMPT WAS REJECTED: {}\nRequired fixes:\n{}\n\nPrevious attempt:\n{}",
        original,
        verdict.reason,
        fixes.join("\n"),
        previous
    )
}

/// Resubmission after a failed syntax check
pub fn lint_repair_content(path: &str, content: &str, issue: &str) -> String {
    format!(
        "The file {} does not parse.\n{}\n\nFix the syntax error and return the COMPLETE corrected file.\n\n{}",
        path, issue, content
    )
}

/// Reviewer directive
pub fn reviewer_directive(rules: &str) -> String {
    with_rules(
        "You are a strict senior code reviewer. Judge whether the file is complete, runnable and \
         consistent with the project plan. Respond with JSON only:\n\
         {\"status\": \"APPROVED\" | \"REJECTED\", \"reason\": \"...\", \
         \"issues\": [{\"severity\": \"low|medium|high|critical\", \"description\": \"...\", \"fix\": \"...\"}]}"
            .to_string(),
        rules,
    )
}

/// Review content
pub fn review_content(path: &str, content: &str, manifest_summary: &str) -> String {
    format!(
        "PROJECT PLAN:\n{}\n\nFILE UNDER REVIEW: {}\n\n{}",
        manifest_summary, path, content
    )
}

/// Diagnoser directive
pub fn diagnoser_directive() -> String {
    "You diagnose failures of generated programs. Read the error carefully and name the single \
     file that must change. Respond with JSON only: \
     {\"root_cause\": \"...\", \"fix_file\": \"path/in/project\", \"fix_instruction\": \"exactly what to change\"}"
        .to_string()
}

/// Diagnosis content with bounded error output
pub fn diagnosis_content(result: &SandboxResult, files: &[String], findings: &str) -> String {
    let mut content = format!(
        "A program execution FAILED ({classification}).\nCommand: {command}\nProject files: {files:?}\n\n\
         ERROR OUTPUT:\n{summary}\n\nSTDOUT:\n{stdout}\n\nSTDERR:\n{stderr}",
        classification = result.classification,
        command = result.command,
        files = files,
        summary = head_chars(&result.error_summary, ERROR_SUMMARY_CHARS),
        stdout = head_chars(&result.stdout, STREAM_CHARS),
        stderr = head_chars(&result.stderr, STREAM_CHARS),
    );
    if !findings.trim().is_empty() {
        content.push_str(&format!("\n\nSTATIC CONSISTENCY FINDINGS:\n{}", findings));
    }
    content
}

/// Patch content: the current file plus the diagnosis
pub fn patch_content(
    path: &str,
    current: &str,
    root_cause: &str,
    instruction: &str,
    error_summary: &str,
    context: &str,
) -> String {
    let mut content = format!(
        "The program FAILED.\nRoot cause: {}\nFix instruction: {}\n\nError output:\n{}\n\n\
         Current source of {}:\n{}\n\nRewrite the COMPLETE file with the fix applied.",
        root_cause,
        instruction,
        head_chars(error_summary, STREAM_CHARS),
        path,
        current
    );
    if !context.trim().is_empty() {
        content.push_str(&format!("\n\nRELATED FILES:\n{}", context));
    }
    content
}

/// Directive for the README
pub fn readme_directive() -> String {
    "You write concise project READMEs in Markdown: a one-paragraph overview, setup steps, \
     how to run, and the environment variables used. Output only the Markdown."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::verdict::{AuditIssue, Severity};

    #[test]
    fn test_file_prompt_sections() {
        let text = FilePrompt {
            path: "engine.py",
            task: "Run the loop",
            manifest_summary: "main.py, engine.py",
            import_contract: Some("from engine import start"),
            ..FilePrompt::default()
        }
        .render();
        assert!(text.contains("IMPORT CONTRACT"));
        assert!(text.contains("from engine import start"));
        assert!(!text.contains("RELATED FILES"));
    }

    #[test]
    fn test_rejection_lists_fixes() {
        let verdict = AuditVerdict::rejected(
            "unsafe",
            vec![AuditIssue {
                severity: Severity::High,
                description: "hardcoded key".into(),
                fix: Some("read from env".into()),
            }],
        );
        let text = rejection_content("TASK", &verdict, "KEY = 'sk-...'");
        assert!(text.contains("hardcoded key -> read from env"));
        assert!(text.ends_with("KEY = 'sk-...'"));
    }

    #[test]
    fn test_rules_are_appended() {
        let profile = PlatformProfile::python();
        assert!(!developer_directive(&profile, "").contains("PERMANENT"));
        assert!(developer_directive(&profile, "PERMANENT CONSTRAINTS:\n  [AUTO-001] x: y")
            .ends_with("[AUTO-001] x: y"));
        assert!(architect_directive(&profile, "").contains("python main.py"));
    }
}
