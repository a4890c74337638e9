//! Cost governor
//!
//! Every synthesis call is priced from its token counts and added to a
//! running total. Crossing the budget flips a one-way flag; the orchestrator
//! reacts by moving every role onto the fallback backend, it does not stop
//! the build. A coarser daily aggregation over past cost reports can refuse
//! to *start* a build.

use crate::error::{ForgeError, Result};
use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use walkdir::WalkDir;

/// File name of the end-of-build cost report
pub const COST_REPORT_FILE: &str = "cost_report.json";

/// USD per 1K tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Prompt token rate
    pub input_per_1k: f64,
    /// Completion token rate
    pub output_per_1k: f64,
}

impl Pricing {
    /// Construct a rate pair
    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// Cost of one call
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

/// Rate applied to models missing from the table
pub const DEFAULT_PRICING: Pricing = Pricing::new(0.002, 0.006);

/// Model prefixes served locally, always free
const FREE_PREFIXES: [&str; 2] = ["local/", "ollama/"];

/// Per-model price table
#[derive(Debug, Clone)]
pub struct PriceTable {
    rates: BTreeMap<String, Pricing>,
    fallback: Pricing,
}

impl PriceTable {
    /// Table with known hosted models
    pub fn standard() -> Self {
        let rates = [
            ("gpt-4o", Pricing::new(0.0025, 0.010)),
            ("gpt-4o-mini", Pricing::new(0.00015, 0.0006)),
            ("gpt-4-turbo", Pricing::new(0.01, 0.03)),
            ("gpt-3.5-turbo", Pricing::new(0.0005, 0.0015)),
            ("o1", Pricing::new(0.015, 0.06)),
            ("o1-mini", Pricing::new(0.003, 0.012)),
            ("gemini-2.0-flash", Pricing::new(0.0001, 0.0004)),
            ("gemini-1.5-pro", Pricing::new(0.00125, 0.005)),
            ("claude-3-5-sonnet", Pricing::new(0.003, 0.015)),
            ("claude-3-5-haiku", Pricing::new(0.0008, 0.004)),
            ("llama3-70b-8192", Pricing::new(0.00059, 0.00079)),
            ("llama3-8b-8192", Pricing::new(0.00005, 0.00008)),
            ("mixtral-8x7b-32768", Pricing::new(0.00024, 0.00024)),
            ("llama3", Pricing::new(0.0, 0.0)),
            ("codellama", Pricing::new(0.0, 0.0)),
            ("mistral", Pricing::new(0.0, 0.0)),
        ]
        .into_iter()
        .map(|(model, rate)| (model.to_string(), rate))
        .collect();

        Self {
            rates,
            fallback: DEFAULT_PRICING,
        }
    }

    /// Override or add a model rate
    pub fn with_rate(mut self, model: impl Into<String>, pricing: Pricing) -> Self {
        self.rates.insert(model.into(), pricing);
        self
    }

    /// Rate for `model`: exact entry, then free local prefixes, then fallback
    pub fn lookup(&self, model: &str) -> Pricing {
        if let Some(rate) = self.rates.get(model) {
            return *rate;
        }
        if FREE_PREFIXES.iter().any(|p| model.starts_with(p)) {
            return Pricing::new(0.0, 0.0);
        }
        self.fallback
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Spend attributed to one backend model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendSpend {
    /// USD
    pub cost: f64,
    /// Number of calls
    pub calls: u64,
    /// Prompt + completion tokens
    pub tokens: u64,
}

/// What a recorded call did to the budget state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    /// Still under budget
    WithinBudget,
    /// This call crossed the budget (reported exactly once per ledger)
    JustExceeded,
    /// Budget was already exceeded before this call
    AlreadyExceeded,
}

/// Running spend for one build
#[derive(Debug, Clone)]
pub struct CostLedger {
    budget: f64,
    total_cost: f64,
    total_calls: u64,
    total_input_tokens: u64,
    total_output_tokens: u64,
    per_backend: BTreeMap<String, BackendSpend>,
    budget_exceeded: bool,
    pivot_triggered: bool,
    prices: PriceTable,
}

impl CostLedger {
    /// Ledger with the standard price table
    pub fn new(budget: f64) -> Self {
        Self::with_prices(budget, PriceTable::standard())
    }

    /// Ledger with a custom price table
    pub fn with_prices(budget: f64, prices: PriceTable) -> Self {
        Self {
            budget,
            total_cost: 0.0,
            total_calls: 0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            per_backend: BTreeMap::new(),
            budget_exceeded: false,
            pivot_triggered: false,
            prices,
        }
    }

    /// Account one call
    pub fn record_call(&mut self, model: &str, input_tokens: u64, output_tokens: u64) -> BudgetStatus {
        let cost = self.prices.lookup(model).cost(input_tokens, output_tokens).max(0.0);

        self.total_cost += cost;
        self.total_calls += 1;
        self.total_input_tokens += input_tokens;
        self.total_output_tokens += output_tokens;

        let entry = self.per_backend.entry(model.to_string()).or_default();
        entry.cost += cost;
        entry.calls += 1;
        entry.tokens += input_tokens + output_tokens;

        if self.budget_exceeded {
            return BudgetStatus::AlreadyExceeded;
        }
        if self.total_cost >= self.budget {
            self.budget_exceeded = true;
            tracing::warn!(
                total = self.total_cost,
                budget = self.budget,
                "Budget exceeded - downgrading to fallback backend"
            );
            return BudgetStatus::JustExceeded;
        }
        BudgetStatus::WithinBudget
    }

    /// Configured budget
    pub fn budget(&self) -> f64 {
        self.budget
    }

    /// Cumulative spend
    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    /// Budget minus spend, floored at zero
    pub fn remaining(&self) -> f64 {
        (self.budget - self.total_cost).max(0.0)
    }

    /// Whether the budget has ever been crossed
    pub fn budget_exceeded(&self) -> bool {
        self.budget_exceeded
    }

    /// Whether the downgrade has been applied
    pub fn pivot_triggered(&self) -> bool {
        self.pivot_triggered
    }

    /// Mark the downgrade; returns false if it had already happened
    pub fn trigger_pivot(&mut self) -> bool {
        let first = !self.pivot_triggered;
        self.pivot_triggered = true;
        first
    }

    /// Snapshot for persistence and the build report
    pub fn report(&self) -> CostReport {
        CostReport {
            budget: self.budget,
            total_cost: round6(self.total_cost),
            remaining: round6(self.remaining()),
            budget_exceeded: self.budget_exceeded,
            pivot_triggered: self.pivot_triggered,
            total_calls: self.total_calls,
            total_input_tokens: self.total_input_tokens,
            total_output_tokens: self.total_output_tokens,
            per_backend: self.per_backend.clone(),
        }
    }

    /// Human-readable summary, most expensive backend first
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Total: ${:.4} / ${:.2} budget", self.total_cost, self.budget),
            format!(
                "Calls: {} | Tokens: {} in + {} out",
                self.total_calls, self.total_input_tokens, self.total_output_tokens
            ),
        ];
        let mut backends: Vec<_> = self.per_backend.iter().collect();
        backends.sort_by(|a, b| b.1.cost.total_cmp(&a.1.cost));
        for (model, spend) in backends {
            lines.push(format!(
                "  {}: ${:.4} ({} calls, {} tokens)",
                model, spend.cost, spend.calls, spend.tokens
            ));
        }
        lines.join("\n")
    }
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// End-of-build cost report (`cost_report.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostReport {
    /// Configured budget
    pub budget: f64,
    /// Spend
    pub total_cost: f64,
    /// Budget left
    pub remaining: f64,
    /// One-way exceeded flag
    pub budget_exceeded: bool,
    /// Whether roles were downgraded
    #[serde(default)]
    pub pivot_triggered: bool,
    /// Calls made
    #[serde(default)]
    pub total_calls: u64,
    /// Prompt tokens
    #[serde(default)]
    pub total_input_tokens: u64,
    /// Completion tokens
    #[serde(default)]
    pub total_output_tokens: u64,
    /// Per-model breakdown
    #[serde(default)]
    pub per_backend: BTreeMap<String, BackendSpend>,
}

impl CostReport {
    /// Write as `cost_report.json` inside `dir`
    pub async fn save(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(dir.join(COST_REPORT_FILE), json).await?;
        Ok(())
    }
}

/// Shared handle to one build's ledger
#[derive(Debug, Clone)]
pub struct CostGovernor {
    ledger: Arc<Mutex<CostLedger>>,
}

impl CostGovernor {
    /// Governor over a fresh ledger
    pub fn new(budget: f64) -> Self {
        Self::from_ledger(CostLedger::new(budget))
    }

    /// Governor over an existing ledger
    pub fn from_ledger(ledger: CostLedger) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(ledger)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CostLedger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Account one call
    pub fn record_call(&self, model: &str, input_tokens: u64, output_tokens: u64) -> BudgetStatus {
        self.lock().record_call(model, input_tokens, output_tokens)
    }

    /// Whether the budget has been crossed
    pub fn budget_exceeded(&self) -> bool {
        self.lock().budget_exceeded()
    }

    /// Mark the downgrade; returns true only the first time
    pub fn trigger_pivot(&self) -> bool {
        self.lock().trigger_pivot()
    }

    /// Cumulative spend
    pub fn total_cost(&self) -> f64 {
        self.lock().total_cost()
    }

    /// Report snapshot
    pub fn report(&self) -> CostReport {
        self.lock().report()
    }

    /// Summary text
    pub fn summary(&self) -> String {
        self.lock().summary()
    }
}

/// Sum `total_cost` of every cost report under `builds_root` modified on `day`
pub fn daily_spend(builds_root: &Path, day: NaiveDate) -> f64 {
    if !builds_root.exists() {
        return 0.0;
    }
    WalkDir::new(builds_root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name() == COST_REPORT_FILE)
        .filter(|entry| {
            entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|t| DateTime::<Local>::from(t).date_naive() == day)
                .unwrap_or(false)
        })
        .filter_map(|entry| std::fs::read_to_string(entry.path()).ok())
        .filter_map(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .filter_map(|report| report.get("total_cost").and_then(|c| c.as_f64()))
        .sum()
}

/// Refuse to start a build when today's spend has reached `cap`
pub fn check_daily_cap(builds_root: &Path, cap: f64) -> Result<f64> {
    let spent = daily_spend(builds_root, Local::now().date_naive());
    if spent >= cap {
        return Err(ForgeError::DailySpendCap { spent, cap });
    }
    tracing::info!(spent, cap, "Daily spend within cap");
    Ok(spent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_pricing_lookup() {
        let table = PriceTable::standard();
        assert_eq!(table.lookup("gpt-4o").input_per_1k, 0.0025);
        assert_eq!(table.lookup("local/qwen2.5-coder").output_per_1k, 0.0);
        assert_eq!(table.lookup("some-new-model"), DEFAULT_PRICING);
    }

    #[test]
    fn test_budget_crossing_flips_once() {
        let mut ledger = CostLedger::new(0.01);
        assert_eq!(ledger.record_call("gpt-4o", 1000, 0), BudgetStatus::WithinBudget);
        assert_eq!(ledger.record_call("gpt-4o", 0, 1000), BudgetStatus::JustExceeded);
        assert_eq!(ledger.record_call("gpt-4o", 0, 1000), BudgetStatus::AlreadyExceeded);
        assert!(ledger.budget_exceeded());
        assert_eq!(ledger.remaining(), 0.0);

        let report = ledger.report();
        assert_eq!(report.per_backend["gpt-4o"].calls, 3);
        assert_eq!(report.total_calls, 3);
    }

    #[test]
    fn test_pivot_is_one_shot() {
        let governor = CostGovernor::new(1.0);
        assert!(governor.trigger_pivot());
        assert!(!governor.trigger_pivot());
        assert!(governor.report().pivot_triggered);
    }

    #[tokio::test]
    async fn test_daily_spend_gate() {
        let root = tempfile::tempdir().unwrap();
        for (name, cost) in [("a", 1.5), ("b", 2.0)] {
            let mut ledger = CostLedger::new(10.0);
            ledger.record_call("gpt-4o", (cost * 400.0) as u64, 0);
            let mut report = ledger.report();
            report.total_cost = cost;
            report.save(&root.path().join(name)).await.unwrap();
        }

        let today = Local::now().date_naive();
        assert!((daily_spend(root.path(), today) - 3.5).abs() < 1e-9);
        assert!(check_daily_cap(root.path(), 10.0).is_ok());
        assert!(matches!(
            check_daily_cap(root.path(), 3.0),
            Err(ForgeError::DailySpendCap { .. })
        ));
        assert_eq!(daily_spend(&root.path().join("nope"), today), 0.0);
    }

    proptest! {
        #[test]
        fn total_cost_is_monotonic(
            calls in proptest::collection::vec((0u64..50_000, 0u64..50_000, 0usize..3), 1..40),
            budget in 0.0f64..5.0,
        ) {
            let models = ["gpt-4o", "unknown-model", "local/llama3"];
            let mut ledger = CostLedger::new(budget);
            let mut previous = 0.0;
            let mut exceeded_seen = false;
            let mut crossings = 0;
            for (input, output, idx) in calls {
                let status = ledger.record_call(models[idx], input, output);
                if status == BudgetStatus::JustExceeded {
                    crossings += 1;
                }
                prop_assert!(ledger.total_cost() >= previous);
                if exceeded_seen {
                    prop_assert!(ledger.budget_exceeded());
                }
                exceeded_seen = ledger.budget_exceeded();
                previous = ledger.total_cost();
            }
            prop_assert!(crossings <= 1);
        }
    }
}
