//! Project-level CLI tools polled by the dashboard
//!
//! Each tool is optional. A missing binary is `NtmError::Unavailable`, which
//! the panel renders as an inert placeholder rather than an error.
//!
//! - `ubs`: code scanner (findings by severity)
//! - `cass`: semantic search over past agent sessions
//! - `dcg`: destructive-command guard
//! - `git status --porcelain`: files changed in the working tree
//!
//! Uses direct CLI commands with JSON output where the tool has one.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::context::FetchContext;
use crate::errors::{NtmError, Result};

/// Captured subprocess result
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run `binary args...` in `cwd` under `ctx`
///
/// Non-zero exit codes are returned, not turned into errors; callers decide
/// what an exit code means for their tool.
pub async fn run_tool(
    ctx: &FetchContext,
    binary: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<ToolOutput> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = ctx
        .run(binary, async {
            cmd.output().await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    NtmError::unavailable(binary)
                } else {
                    NtmError::transport(binary, e)
                }
            })
        })
        .await?;

    Ok(ToolOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Scanner findings by severity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanTotals {
    #[serde(default)]
    pub critical: u32,
    #[serde(default)]
    pub warning: u32,
    #[serde(default)]
    pub info: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    #[serde(default)]
    pub totals: ScanTotals,
    #[serde(default)]
    pub files: u32,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.totals.critical == 0 && self.totals.warning == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CassHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub source_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CassContext {
    pub query: String,
    pub hits: Vec<CassHit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DcgStatus {
    pub version: String,
    /// Guard hook installed for the agents
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    /// Two-letter porcelain status (e.g. ` M`, `??`)
    pub status: String,
}

#[async_trait]
pub trait ProjectTools: Send + Sync {
    async fn code_scan(&self, ctx: &FetchContext, project_dir: &Path) -> Result<ScanReport>;

    async fn cass_context(
        &self,
        ctx: &FetchContext,
        project_dir: &Path,
        query: &str,
    ) -> Result<CassContext>;

    async fn dcg_status(&self, ctx: &FetchContext) -> Result<DcgStatus>;

    async fn file_changes(&self, ctx: &FetchContext, project_dir: &Path) -> Result<Vec<FileChange>>;
}

/// [`ProjectTools`] backed by the real CLIs on `PATH`
#[derive(Debug, Clone)]
pub struct CliTools {
    pub ubs: String,
    pub cass: String,
    pub dcg: String,
    pub git: String,
}

impl Default for CliTools {
    fn default() -> Self {
        Self {
            ubs: "ubs".to_string(),
            cass: "cass".to_string(),
            dcg: "dcg".to_string(),
            git: "git".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct UbsOutput {
    #[serde(default)]
    totals: ScanTotals,
    #[serde(default)]
    files: u32,
}

#[derive(Deserialize)]
struct CassOutput {
    #[serde(default)]
    hits: Vec<CassHit>,
}

#[async_trait]
impl ProjectTools for CliTools {
    async fn code_scan(&self, ctx: &FetchContext, project_dir: &Path) -> Result<ScanReport> {
        let started = std::time::Instant::now();
        let out = run_tool(ctx, &self.ubs, &["--format=json", "."], Some(project_dir)).await?;
        // ubs exits 1 when it reports findings
        if !matches!(out.code, Some(0 | 1)) {
            return Err(NtmError::unknown("ubs", out.stderr.trim()));
        }
        let parsed: UbsOutput = serde_json::from_str(out.stdout.trim())?;
        Ok(ScanReport {
            totals: parsed.totals,
            files: parsed.files,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn cass_context(
        &self,
        ctx: &FetchContext,
        project_dir: &Path,
        query: &str,
    ) -> Result<CassContext> {
        let out = run_tool(
            ctx,
            &self.cass,
            &["search", query, "--robot", "--limit", "5"],
            Some(project_dir),
        )
        .await?;
        if !out.success() {
            return Err(NtmError::unknown("cass", out.stderr.trim()));
        }
        let parsed: CassOutput = serde_json::from_str(out.stdout.trim())?;
        Ok(CassContext {
            query: query.to_string(),
            hits: parsed.hits,
        })
    }

    async fn dcg_status(&self, ctx: &FetchContext) -> Result<DcgStatus> {
        let out = run_tool(ctx, &self.dcg, &["--version"], None).await?;
        if !out.success() {
            return Err(NtmError::unknown("dcg", out.stderr.trim()));
        }
        let version = out
            .stdout
            .split_whitespace()
            .last()
            .unwrap_or("")
            .to_string();
        let hook = run_tool(ctx, &self.dcg, &["status"], None).await?;
        Ok(DcgStatus {
            version,
            active: hook.success() && !hook.stdout.to_lowercase().contains("not installed"),
        })
    }

    async fn file_changes(&self, ctx: &FetchContext, project_dir: &Path) -> Result<Vec<FileChange>> {
        let out = run_tool(
            ctx,
            &self.git,
            &["status", "--porcelain=v1", "--untracked-files=normal"],
            Some(project_dir),
        )
        .await?;
        if !out.success() {
            let stderr = out.stderr.trim();
            if stderr.contains("not a git repository") {
                return Err(NtmError::NotFound {
                    op: "git status".to_string(),
                    what: project_dir.display().to_string(),
                });
            }
            return Err(NtmError::unknown("git status", stderr));
        }
        Ok(parse_porcelain(&out.stdout))
    }
}

/// Parse `git status --porcelain=v1`; renames report the new path
pub fn parse_porcelain(output: &str) -> Vec<FileChange> {
    output
        .lines()
        .filter(|l| l.len() > 3)
        .map(|l| {
            let (status, rest) = l.split_at(2);
            let path = rest.trim_start();
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            FileChange {
                path: path.trim_matches('"').to_string(),
                status: status.to_string(),
            }
        })
        .collect()
}

/// Resolve the project directory: explicit flag, else the current directory
pub fn resolve_project_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::time::Duration;

    #[test]
    fn test_parse_porcelain() {
        let out = " M src/main.rs\n?? notes.txt\nR  old.rs -> new.rs\n";
        let changes = parse_porcelain(out);
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].path, "src/main.rs");
        assert_eq!(changes[0].status, " M");
        assert_eq!(changes[1].status, "??");
        assert_eq!(changes[2].path, "new.rs");
    }

    #[tokio::test]
    async fn test_missing_tool_is_unavailable() {
        let tools = CliTools {
            ubs: "ntm-test-no-such-ubs".into(),
            ..CliTools::default()
        };
        let ctx = FetchContext::new(Duration::from_secs(5));
        let err = tools
            .code_scan(&ctx, Path::new("."))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_canceled_before_spawn() {
        let ctx = FetchContext::new(Duration::from_secs(5));
        ctx.cancel();
        let err = run_tool(&ctx, "sh", &["-c", "sleep 5"], None)
            .await
            .unwrap_err();
        assert!(err.is_canceled());
    }
}
