//! Blueprint planner
//!
//! One architect call turns the request into a [`BuildManifest`]. Output that
//! does not parse (or parses into an invalid plan) gets exactly one stricter
//! retry; a second failure is a fatal [`PlanningError`]. A valid manifest is
//! persisted immediately so an interrupted build can resume.

use crate::prompts;
use crate::roster::Role;
use crate::session::BuildContext;
use forge_core::error::{PlanningError, Result, ResultExt};
use forge_core::manifest::BuildManifest;
use forge_core::platform::PlatformProfile;
use forge_core::text::{extract_json_object, head_chars};
use std::path::Path;

/// Turns a feature request into a validated manifest
#[derive(Debug)]
pub struct BlueprintPlanner<'a> {
    ctx: &'a BuildContext,
    profile: &'a PlatformProfile,
}

impl<'a> BlueprintPlanner<'a> {
    pub fn new(ctx: &'a BuildContext, profile: &'a PlatformProfile) -> Self {
        Self { ctx, profile }
    }

    /// Plan, validate and persist into `project_dir`
    #[tracing::instrument(skip(self, request, research), fields(platform = %self.profile.name))]
    pub async fn plan(
        &self,
        request: &str,
        research: Option<&str>,
        project_dir: &Path,
    ) -> Result<BuildManifest> {
        let rules = self.ctx.constraints().rules_summary().await;
        let directive = prompts::architect_directive(self.profile, &rules);
        let content = prompts::planning_content(request, research);

        let manifest = match self.attempt(&directive, &content).await {
            Ok(manifest) => manifest,
            Err(first) => {
                tracing::warn!("Blueprint rejected ({}), retrying with strict directive", first);
                let strict = format!("{}{}", directive, prompts::STRICT_JSON_SUFFIX);
                self.attempt(&strict, &content).await?
            }
        };

        manifest
            .save(project_dir)
            .await
            .context("Persisting blueprint")?;
        tracing::info!(
            project = %manifest.project_name,
            files = manifest.files.len(),
            run = %manifest.run_command,
            "Blueprint ready"
        );
        Ok(manifest)
    }

    async fn attempt(&self, directive: &str, content: &str) -> std::result::Result<BuildManifest, PlanningError> {
        let raw = self
            .ctx
            .call(Role::Architect, directive, content)
            .await
            .map_err(|e| PlanningError::Backend(e.to_string()))?;
        let value = extract_json_object(&raw)
            .ok_or_else(|| PlanningError::Unparseable(head_chars(raw.trim(), 200).to_string()))?;
        BuildManifest::from_value(value, self.profile)
    }
}
