//! Forge Core - domain model of the build orchestration engine
//!
//! Forge turns a natural-language feature request into a runnable codebase by
//! sequencing fallible code-generation calls, verifying the result in a
//! sandbox and patching it within bounded retry budgets. This crate holds the
//! parts of that pipeline that never talk to the network:
//!
//! 1. **Manifest** (`manifest`): the planned file list, dependencies and run command
//! 2. **Build state** (`state`): generated files, persisted after every write
//! 3. **Symbols & validation** (`symbols`, `validator`): cross-file export/import
//!    and configuration-attribute checks, advisory only
//! 4. **Context** (`context`): relevance-ranked prompt context under a budget
//! 5. **Cost governor** (`cost`): spend accounting, budget flag, daily cap
//! 6. **Constraint memory** (`constraints`): learned rules and the auto-fixer
//!
//! # Quick Start
//!
//! ```
//! use forge_core::constraints::AutoFixer;
//! use forge_core::cost::{BudgetStatus, CostLedger};
//!
//! let fixer = AutoFixer::builtin();
//! let fixed = fixer.apply("main.py", "from moviepy.editor import VideoFileClip");
//! assert_eq!(fixed.content, "from moviepy import VideoFileClip");
//!
//! let mut ledger = CostLedger::new(0.001);
//! assert_eq!(ledger.record_call("gpt-4o", 1_000, 0), BudgetStatus::JustExceeded);
//! assert!(ledger.budget_exceeded());
//! ```

#![deny(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod constraints;
pub mod context;
pub mod cost;
pub mod error;
pub mod manifest;
pub mod platform;
pub mod state;
pub mod symbols;
pub mod text;
pub mod validator;
pub mod verdict;

// Re-export commonly used types for convenience
pub use constraints::{AutoFixer, ConstraintMemory, ConstraintRule, FixOutcome, FixRule};
pub use context::{import_contract, AssembledContext, ContextAssembler};
pub use cost::{BudgetStatus, CostGovernor, CostLedger, CostReport, PriceTable, Pricing};
pub use error::{ForgeError, PlanningError, Result, ResultExt, StateError, SynthesisError};
pub use manifest::{BuildManifest, FileTask};
pub use platform::PlatformProfile;
pub use state::{CodebaseState, FileRecord};
pub use symbols::{ParserRegistry, PythonSymbolParser, SymbolInventory, SymbolParser, SyntaxIssue};
pub use validator::{ConsistencyValidator, FindingKind, SymbolManifest, ValidationFinding};
pub use verdict::{AuditIssue, AuditStatus, AuditVerdict, Severity};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[tokio::test]
    async fn test_state_feeds_validator() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CodebaseState::new(dir.path());
        state
            .write("main.py", "from engine import start, stop\nstart()\n", 0)
            .await
            .unwrap();
        state
            .write("engine.py", "def start():\n    return 1\n", 0)
            .await
            .unwrap();

        let parsers = ParserRegistry::default();
        let symbols = SymbolManifest::build(&state, &parsers);
        let findings = ConsistencyValidator::new().validate(&symbols);

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].file, "main.py");
        assert!(symbols.summary().contains("def start()"));
    }
}
