//! Consistency validator
//!
//! Cross-references the symbol inventories of every generated file.
//! Findings are advisory: they feed prompts and diagnosis, they never stop
//! the pipeline, and producing them never fails.

use crate::state::CodebaseState;
use crate::symbols::{ParserRegistry, SymbolInventory};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// What kind of inconsistency was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FindingKind {
    /// `from module import name` where the module file does not export `name`
    MissingExport {
        /// Statement as written
        import: String,
        /// Project file the module resolved to
        module_file: String,
        /// Imported name
        name: String,
        /// What the module actually exports
        available: Vec<String>,
    },
    /// `config.attr` where no configuration type declares `attr`
    UnknownConfigAttribute {
        /// Reference as written
        reference: String,
        /// Declared configuration fields
        available: Vec<String>,
    },
}

/// An advisory finding about one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFinding {
    /// File containing the reference
    pub file: String,
    /// 1-based line
    pub line: usize,
    /// Details
    #[serde(flatten)]
    pub kind: FindingKind,
}

impl fmt::Display for ValidationFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FindingKind::MissingExport {
                import,
                module_file,
                available,
                ..
            } => write!(
                f,
                "{}:{}: `{}` - not exported by {} (available: {})",
                self.file,
                self.line,
                import,
                module_file,
                available.join(", ")
            ),
            FindingKind::UnknownConfigAttribute {
                reference,
                available,
            } => write!(
                f,
                "{}:{}: `{}` - not declared by any config type (available: {})",
                self.file,
                self.line,
                reference,
                available.join(", ")
            ),
        }
    }
}

/// Symbol inventories for every parsed file, keyed by path
#[derive(Debug, Default)]
pub struct SymbolManifest {
    inventories: BTreeMap<String, SymbolInventory>,
}

impl SymbolManifest {
    /// Parse every record in `state`
    pub fn build(state: &CodebaseState, parsers: &ParserRegistry) -> Self {
        let inventories = state
            .records()
            .map(|r| (r.path.clone(), parsers.parse(&r.path, &r.content)))
            .collect();
        Self { inventories }
    }

    /// Re-parse one file after it changed
    pub fn refresh(&mut self, path: &str, content: &str, parsers: &ParserRegistry) {
        self.inventories
            .insert(path.to_string(), parsers.parse(path, content));
    }

    /// Inventory for `path`
    pub fn get(&self, path: &str) -> Option<&SymbolInventory> {
        self.inventories.get(path)
    }

    /// Prompt text describing what every file defines
    pub fn summary(&self) -> String {
        self.inventories
            .iter()
            .filter(|(_, inv)| !inv.summary().is_empty())
            .map(|(path, inv)| format!("## {}\n{}", path, inv.summary()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Resolve a Python module reference made from `importer` to a project file
    fn resolve_module(&self, importer: &str, module: &str) -> Option<&str> {
        let dots = module.chars().take_while(|c| *c == '.').count();
        let rest = &module[dots..];

        let mut base: Vec<&str> = Vec::new();
        if dots > 0 {
            base = importer.split('/').collect();
            base.pop();
            for _ in 1..dots {
                base.pop()?;
            }
        }
        let mut parts = base;
        parts.extend(rest.split('.').filter(|p| !p.is_empty()));
        if parts.is_empty() {
            return None;
        }

        let stem = parts.join("/");
        let candidates = [format!("{}.py", stem), format!("{}/__init__.py", stem)];
        candidates
            .iter()
            .find_map(|c| self.inventories.get_key_value(c.as_str()).map(|(k, _)| k.as_str()))
    }

    fn is_submodule(&self, module_file: &str, name: &str) -> bool {
        let dir = module_file.strip_suffix("__init__.py").unwrap_or("");
        if dir.is_empty() && !module_file.ends_with("__init__.py") {
            return false;
        }
        self.inventories.contains_key(&format!("{}{}.py", dir, name))
            || self.inventories.contains_key(&format!("{}{}/__init__.py", dir, name))
    }
}

/// Cross-file consistency checker
#[derive(Debug, Default)]
pub struct ConsistencyValidator;

impl ConsistencyValidator {
    /// Create a validator
    pub fn new() -> Self {
        Self
    }

    /// All findings for the current symbol manifest
    pub fn validate(&self, manifest: &SymbolManifest) -> Vec<ValidationFinding> {
        let mut findings = self.check_imports(manifest);
        findings.extend(self.check_config_attributes(manifest));
        if !findings.is_empty() {
            tracing::info!(count = findings.len(), "Consistency findings");
        }
        findings
    }

    /// Imported names must exist in the target module's export set
    pub fn check_imports(&self, manifest: &SymbolManifest) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();
        for (file, inventory) in &manifest.inventories {
            for import in inventory.imports.iter().filter(|i| !i.names.is_empty()) {
                let module_file = match manifest.resolve_module(file, &import.module) {
                    Some(target) => target,
                    None => continue,
                };
                let target = match manifest.get(module_file) {
                    Some(target) => target,
                    None => continue,
                };
                let exports = target.exports();
                for name in &import.names {
                    if exports.contains(name) || manifest.is_submodule(module_file, name) {
                        continue;
                    }
                    findings.push(ValidationFinding {
                        file: file.clone(),
                        line: import.line,
                        kind: FindingKind::MissingExport {
                            import: format!("from {} import {}", import.module, name),
                            module_file: module_file.to_string(),
                            name: name.clone(),
                            available: exports.iter().cloned().collect(),
                        },
                    });
                }
            }
        }
        findings
    }

    /// Attribute references must match a declared configuration field
    pub fn check_config_attributes(&self, manifest: &SymbolManifest) -> Vec<ValidationFinding> {
        let mut declared = BTreeSet::new();
        let mut declaring_files = BTreeSet::new();
        for (file, inventory) in &manifest.inventories {
            for config in &inventory.config_types {
                declared.extend(config.fields.iter().cloned());
                declaring_files.insert(file.as_str());
            }
        }
        if declared.is_empty() {
            return Vec::new();
        }

        let available: Vec<String> = declared.iter().cloned().collect();
        let mut findings = Vec::new();
        for (file, inventory) in &manifest.inventories {
            if declaring_files.contains(file.as_str()) {
                continue;
            }
            for reference in &inventory.attribute_refs {
                if declared.contains(&reference.attribute) {
                    continue;
                }
                findings.push(ValidationFinding {
                    file: file.clone(),
                    line: reference.line,
                    kind: FindingKind::UnknownConfigAttribute {
                        reference: format!("{}.{}", reference.base, reference.attribute),
                        available: available.clone(),
                    },
                });
            }
        }
        findings
    }
}

/// Render findings as a prompt block; empty when there are none
pub fn findings_digest(findings: &[ValidationFinding]) -> String {
    if findings.is_empty() {
        return String::new();
    }
    let mut out = String::from("CROSS-FILE CONSISTENCY FINDINGS:\n");
    for finding in findings {
        out.push_str(&format!("  - {}\n", finding));
    }
    out
}
