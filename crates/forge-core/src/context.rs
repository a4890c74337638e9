//! Context assembly for file synthesis
//!
//! Previously written files are ranked by lexical overlap with the task of
//! the file about to be synthesized and packed into a character budget.
//! Files that do not fit, or do not overlap at all, are only listed by
//! path.

use crate::state::CodebaseState;
use crate::text::path_stem;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

/// Default character budget for assembled context
pub const DEFAULT_CONTEXT_BUDGET: usize = 12_000;

/// Bonus when the target and a candidate reference each other by stem
const STEM_MATCH_BONUS: usize = 10;

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap();
}

/// Lowercased identifier tokens of at least three characters
pub fn keywords(text: &str) -> HashSet<String> {
    IDENTIFIER
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| t.len() >= 3)
        .collect()
}

/// Ranked, budgeted context from already-written files
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    budget: usize,
}

/// Assembled context and what was left out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledContext {
    /// Prompt text
    pub text: String,
    /// Files included in full
    pub included: Vec<String>,
    /// Files only listed by path
    pub listed: Vec<String>,
}

impl ContextAssembler {
    /// Assembler with a character budget
    pub fn new(budget: usize) -> Self {
        Self { budget }
    }

    /// Score every written file against `target_path`/`task` and pack them
    pub fn assemble(&self, state: &CodebaseState, target_path: &str, task: &str) -> AssembledContext {
        let target_stem = path_stem(target_path).to_lowercase();
        let mut query = keywords(task);
        query.insert(target_stem.clone());

        let mut scored: Vec<(usize, &str, &str)> = state
            .records()
            .filter(|r| r.path != target_path)
            .map(|r| {
                let stem = path_stem(&r.path).to_lowercase();
                let mut index = keywords(&r.content);
                index.insert(stem.clone());

                let mut score = index.intersection(&query).count();
                if query.contains(&stem) || index.contains(&target_stem) {
                    score += STEM_MATCH_BONUS;
                }
                (score, r.path.as_str(), r.content.as_str())
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

        let mut out = AssembledContext::default();
        let mut used = 0usize;
        for (score, path, content) in scored {
            let block = format!("--- {} ---\n{}\n", path, content);
            let size = block.chars().count();
            if score > 0 && used + size <= self.budget {
                used += size;
                out.text.push_str(&block);
                out.included.push(path.to_string());
            } else {
                out.listed.push(path.to_string());
            }
        }

        if !out.listed.is_empty() {
            out.text.push_str("\n[OTHER FILES - summaries only]\n");
            for path in &out.listed {
                out.text.push_str(&format!("  - {}\n", path));
            }
        }
        out
    }
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_BUDGET)
    }
}

/// Import lines of the entry file that mention `target_path`'s module.
///
/// Later files must provide exactly what the entry point imports from them.
pub fn import_contract(entry_content: &str, target_path: &str) -> Option<String> {
    let stem = path_stem(target_path);
    let lines: Vec<&str> = entry_content
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("import ") || line.starts_with("from "))
        .filter(|line| line.contains(stem))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
