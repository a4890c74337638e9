//! Per-build call context
//!
//! A [`BuildContext`] bundles what every stage needs for a synthesis call:
//! the shared synthesizer, this build's cost governor, the model roster and
//! the shared constraint memory. Every call goes through
//! [`BuildContext::call`], which is also the budget checkpoint.

use crate::client::Synthesizer;
use crate::roster::{ModelRoster, Role};
use forge_core::constraints::ConstraintMemory;
use forge_core::cost::{BudgetStatus, CostGovernor};
use forge_core::error::SynthesisError;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared handles for one build
pub struct BuildContext {
    synthesizer: Arc<dyn Synthesizer>,
    governor: CostGovernor,
    roster: Mutex<ModelRoster>,
    constraints: Arc<ConstraintMemory>,
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("roster", &*self.roster())
            .field("cost", &self.governor.total_cost())
            .finish_non_exhaustive()
    }
}

impl BuildContext {
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        governor: CostGovernor,
        roster: ModelRoster,
        constraints: Arc<ConstraintMemory>,
    ) -> Self {
        Self {
            synthesizer,
            governor,
            roster: Mutex::new(roster),
            constraints,
        }
    }

    /// This build's cost governor
    pub fn governor(&self) -> &CostGovernor {
        &self.governor
    }

    /// Shared constraint memory
    pub fn constraints(&self) -> &ConstraintMemory {
        &self.constraints
    }

    /// Current model for `role`
    pub fn model_for(&self, role: Role) -> String {
        self.roster().model_for(role).to_string()
    }

    /// Whether the roster has been moved to the fallback model
    pub fn is_downgraded(&self) -> bool {
        self.roster().is_downgraded()
    }

    fn roster(&self) -> MutexGuard<'_, ModelRoster> {
        self.roster.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One synthesis call on behalf of `role`, priced and budget-checked
    pub async fn call(&self, role: Role, directive: &str, content: &str) -> Result<String, SynthesisError> {
        let model = self.model_for(role);
        let synthesis = self.synthesizer.synthesize(&model, directive, content).await?;

        let status = self
            .governor
            .record_call(&synthesis.model, synthesis.input_tokens, synthesis.output_tokens);
        self.checkpoint(status);
        Ok(synthesis.text)
    }

    /// Downgrade every role once the budget is crossed
    fn checkpoint(&self, status: BudgetStatus) {
        if status == BudgetStatus::WithinBudget || !self.governor.trigger_pivot() {
            return;
        }
        let mut roster = self.roster();
        if roster.downgrade_all() {
            tracing::warn!(
                cost = self.governor.total_cost(),
                fallback = %roster.fallback,
                "Budget exceeded - all roles pivoted to fallback model"
            );
        }
    }
}
