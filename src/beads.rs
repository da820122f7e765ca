//! Ticket tool integration (beads)
//!
//! The dashboard reads three things from the tracker: a summary for the beads
//! panel, triage recommendations for auto-assignment and a drift check. All of
//! them come from `bv` robot modes that print JSON on stdout. When `bv` is not
//! installed every call returns `Unavailable` and the panel goes inert.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::FetchContext;
use crate::errors::{NtmError, Result};
use crate::tools::run_tool;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BeadCounts {
    #[serde(default)]
    pub open: u32,
    #[serde(default)]
    pub in_progress: u32,
    #[serde(default)]
    pub blocked: u32,
    #[serde(default)]
    pub ready: u32,
    #[serde(default)]
    pub closed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeadItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BeadsSummary {
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default)]
    pub counts: BeadCounts,
    #[serde(default)]
    pub ready_preview: Vec<BeadItem>,
    #[serde(default)]
    pub in_progress_list: Vec<BeadItem>,
    /// Result of `bv --check-drift`, when it ran
    #[serde(default)]
    pub drift: Option<DriftReport>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// 0 is most urgent
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub unblocks_ids: Vec<String>,
    #[serde(default)]
    pub status: String,
}

impl Recommendation {
    pub fn is_blocked(&self) -> bool {
        self.status.eq_ignore_ascii_case("blocked")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Triage {
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
}

impl Triage {
    /// Recommendations in assignment order: most urgent priority first, then highest score
    pub fn ranked(&self) -> Vec<Recommendation> {
        let mut recs = self.recommendations.clone();
        recs.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.score.total_cmp(&a.score))
                .then_with(|| a.id.cmp(&b.id))
        });
        recs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    Ok,
    Warning,
    Critical,
    NoBaseline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub status: DriftStatus,
    pub message: String,
}

#[async_trait]
pub trait TicketTool: Send + Sync {
    async fn beads_summary(
        &self,
        ctx: &FetchContext,
        project_dir: &Path,
        limit: usize,
    ) -> Result<BeadsSummary>;

    async fn triage(&self, ctx: &FetchContext, project_dir: &Path) -> Result<Triage>;

    async fn check_drift(&self, ctx: &FetchContext, project_dir: &Path) -> Result<DriftReport>;
}

/// [`TicketTool`] backed by the `bv` CLI
#[derive(Debug, Clone)]
pub struct BvCli {
    binary: String,
}

impl Default for BvCli {
    fn default() -> Self {
        Self {
            binary: "bv".to_string(),
        }
    }
}

impl BvCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn robot(&self, ctx: &FetchContext, project_dir: &Path, args: &[&str]) -> Result<String> {
        let out = run_tool(ctx, &self.binary, args, Some(project_dir)).await?;
        if !out.success() {
            let stderr = out.stderr.trim();
            if stderr.contains("no .beads") || stderr.contains("not initialized") {
                return Err(NtmError::NotFound {
                    op: self.binary.clone(),
                    what: ".beads".to_string(),
                });
            }
            return Err(NtmError::unknown(self.binary.clone(), stderr));
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl TicketTool for BvCli {
    async fn beads_summary(
        &self,
        ctx: &FetchContext,
        project_dir: &Path,
        limit: usize,
    ) -> Result<BeadsSummary> {
        let limit = limit.to_string();
        let stdout = self
            .robot(ctx, project_dir, &["--robot-summary", "--limit", &limit])
            .await?;
        let mut summary: BeadsSummary = serde_json::from_str(stdout.trim())?;
        summary.available = true;
        Ok(summary)
    }

    async fn triage(&self, ctx: &FetchContext, project_dir: &Path) -> Result<Triage> {
        let stdout = self.robot(ctx, project_dir, &["--robot-triage"]).await?;
        Ok(serde_json::from_str(stdout.trim())?)
    }

    async fn check_drift(&self, ctx: &FetchContext, project_dir: &Path) -> Result<DriftReport> {
        let out = run_tool(ctx, &self.binary, &["--check-drift"], Some(project_dir)).await?;
        Ok(drift_from_output(out.code, &out.stdout, &out.stderr))
    }
}

/// Map `bv --check-drift` exit codes: 0 ok, 1 critical, 2 warning
pub fn drift_from_output(code: Option<i32>, stdout: &str, stderr: &str) -> DriftReport {
    let text = if stdout.trim().is_empty() { stderr } else { stdout };
    let message = text.lines().next().unwrap_or("").trim().to_string();
    if text.to_lowercase().contains("no baseline") {
        return DriftReport {
            status: DriftStatus::NoBaseline,
            message,
        };
    }
    let status = match code {
        Some(0) => DriftStatus::Ok,
        Some(2) => DriftStatus::Warning,
        _ => DriftStatus::Critical,
    };
    DriftReport { status, message }
}
