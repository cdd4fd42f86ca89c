//! Toolchain, scanner and platform backed by external commands.
//!
//! Each task is an argv vector from `keel.toml`. The revision is passed
//! through the environment (`KEEL_WORKLOAD`, `KEEL_COMMIT`,
//! `KEEL_BUILD_NUMBER`). Exit status 75 (`EX_TEMPFAIL`) is reported as a
//! transient failure so the pipeline retries it; any other non-zero exit
//! is definitive. Platform commands may also exit 69 (`EX_UNAVAILABLE`)
//! to say the platform itself cannot be reached.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use keel_core::config::{PlatformConfig, ScannerConfig, ToolchainConfig};
use keel_core::{
    ResourceFailure, ResourceHealth, ResourceKey, ResourceSelector, ResourceTree, Revision,
    ScanReport, ScanTarget,
};

use crate::error::{GatewayError, GatewayResult};
use crate::traits::{Platform, ScannerGateway, ToolOutput, ToolTask, Toolchain, WorkloadLoad};

const EXIT_TEMPFAIL: i32 = 75;
const EXIT_UNAVAILABLE: i32 = 69;

struct CommandOutput {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: String,
}

async fn execute(
    label: &str,
    argv: &[String],
    envs: &[(&str, String)],
    stdin: Option<Vec<u8>>,
    timeout: Duration,
) -> GatewayResult<CommandOutput> {
    let Some((exe, args)) = argv.split_first() else {
        return Err(GatewayError::Failed(format!("{label}: empty command")));
    };
    let start = Instant::now();

    let mut child = Command::new(exe)
        .args(args)
        .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| GatewayError::Failed(format!("{label}: spawn {exe}: {e}")))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(&input)
            .await
            .map_err(|e| GatewayError::Transient(format!("{label}: write stdin: {e}")))?;
        drop(pipe);
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            GatewayError::Transient(format!("{label}: timed out after {}s", timeout.as_secs()))
        })?
        .map_err(|e| GatewayError::Transient(format!("{label}: {e}")))?;

    let exit_code = output.status.code().unwrap_or(-1);
    debug!(
        task = label,
        exit_code,
        duration_ms = start.elapsed().as_millis() as u64,
        "command finished"
    );

    Ok(CommandOutput {
        exit_code,
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

fn check_exit(label: &str, out: &CommandOutput) -> GatewayResult<()> {
    match out.exit_code {
        0 => Ok(()),
        EXIT_TEMPFAIL => Err(GatewayError::Transient(format!(
            "{label} exited {EXIT_TEMPFAIL}: {}",
            out.stderr.trim()
        ))),
        code => Err(GatewayError::Failed(format!(
            "{label} exited {code}: {}",
            out.stderr.trim()
        ))),
    }
}

fn revision_env(revision: &Revision) -> Vec<(&'static str, String)> {
    vec![
        ("KEEL_WORKLOAD", revision.workload.clone()),
        ("KEEL_COMMIT", revision.commit.clone()),
        ("KEEL_BUILD_NUMBER", revision.build_number.to_string()),
    ]
}

// ── Toolchain ─────────────────────────────────────────────────────

pub struct CommandToolchain {
    config: ToolchainConfig,
    timeout: Duration,
}

impl CommandToolchain {
    pub fn new(config: ToolchainConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    fn argv(&self, task: ToolTask) -> &[String] {
        match task {
            ToolTask::Checkout => &self.config.checkout,
            ToolTask::Compile => &self.config.compile,
            ToolTask::Test => &self.config.test,
            ToolTask::Package => &self.config.package,
            ToolTask::ImageBuild => &self.config.image_build,
        }
    }
}

#[async_trait]
impl Toolchain for CommandToolchain {
    async fn run(&self, task: ToolTask, revision: &Revision) -> GatewayResult<ToolOutput> {
        let argv = self.argv(task);
        if argv.is_empty() {
            debug!(task = task.name(), %revision, "no command configured, skipping");
            return Ok(ToolOutput::default());
        }

        let out = execute(task.name(), argv, &revision_env(revision), None, self.timeout).await?;
        check_exit(task.name(), &out)?;
        Ok(ToolOutput {
            stdout: out.stdout,
            log: out.stderr,
        })
    }
}

// ── Scanner ───────────────────────────────────────────────────────

/// Runs the configured scanner with the target as JSON on stdin and
/// expects a `ScanReport` as JSON on stdout.
pub struct CommandScanner {
    config: ScannerConfig,
    timeout: Duration,
}

impl CommandScanner {
    pub fn new(config: ScannerConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }
}

#[async_trait]
impl ScannerGateway for CommandScanner {
    async fn scan(&self, target: &ScanTarget) -> GatewayResult<ScanReport> {
        if self.config.command.is_empty() {
            return Ok(ScanReport::clean());
        }

        let input =
            serde_json::to_vec(target).map_err(|e| GatewayError::Failed(e.to_string()))?;
        let out = execute("scan", &self.config.command, &[], Some(input), self.timeout).await?;
        check_exit("scan", &out)?;
        serde_json::from_slice(&out.stdout)
            .map_err(|e| GatewayError::Failed(format!("scanner produced invalid report: {e}")))
    }
}

// ── Platform ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct HealthEntry {
    key: ResourceKey,
    health: ResourceHealth,
}

/// Drives a live platform through the commands in `[platform]`.
///
/// An operation whose command is empty reports `Unreachable`, so a
/// reconciler without a configured platform records `Unknown` instead of
/// guessing.
pub struct CommandPlatform {
    config: PlatformConfig,
    timeout: Duration,
}

impl CommandPlatform {
    pub fn new(config: PlatformConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    async fn call(
        &self,
        label: &str,
        argv: &[String],
        envs: &[(&str, String)],
        input: Option<Vec<u8>>,
    ) -> GatewayResult<Vec<u8>> {
        if argv.is_empty() {
            return Err(GatewayError::Unreachable(format!("{label} is not configured")));
        }
        let out = execute(label, argv, envs, input, self.timeout).await?;
        if out.exit_code == EXIT_UNAVAILABLE {
            return Err(GatewayError::Unreachable(format!(
                "{label}: {}",
                out.stderr.trim()
            )));
        }
        check_exit(label, &out)?;
        Ok(out.stdout)
    }
}

fn to_json<T: Serialize + ?Sized>(label: &str, value: &T) -> GatewayResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| GatewayError::Failed(format!("{label}: {e}")))
}

fn from_json<T: DeserializeOwned>(label: &str, bytes: &[u8]) -> GatewayResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| GatewayError::Failed(format!("{label} produced invalid output: {e}")))
}

#[async_trait]
impl Platform for CommandPlatform {
    async fn get_observed(&self, selector: &ResourceSelector) -> GatewayResult<ResourceTree> {
        let label = "platform.observe";
        let input = to_json(label, selector)?;
        let stdout = self.call(label, &self.config.observe, &[], Some(input)).await?;
        from_json(label, &stdout)
    }

    async fn apply(&self, tree: &ResourceTree) -> GatewayResult<()> {
        let label = "platform.apply";
        let input = to_json(label, tree)?;
        let stdout = self.call(label, &self.config.apply, &[], Some(input)).await?;
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        let failures: Vec<ResourceFailure> = from_json(label, &stdout)?;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::PartialFailure(failures))
        }
    }

    async fn delete(&self, keys: &[ResourceKey]) -> GatewayResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let label = "platform.delete";
        let input = to_json(label, keys)?;
        self.call(label, &self.config.delete, &[], Some(input)).await?;
        Ok(())
    }

    async fn health(
        &self,
        keys: &[ResourceKey],
    ) -> GatewayResult<BTreeMap<ResourceKey, ResourceHealth>> {
        if keys.is_empty() {
            return Ok(BTreeMap::new());
        }
        let label = "platform.health";
        let input = to_json(label, keys)?;
        let stdout = self.call(label, &self.config.health, &[], Some(input)).await?;
        let reported: Vec<HealthEntry> = from_json(label, &stdout)?;
        let mut health: BTreeMap<ResourceKey, ResourceHealth> =
            reported.into_iter().map(|e| (e.key, e.health)).collect();
        // Keys the command says nothing about are treated as absent.
        for key in keys {
            health.entry(key.clone()).or_insert(ResourceHealth::Missing);
        }
        Ok(health)
    }

    async fn set_replicas(&self, workload: &str, count: u32) -> GatewayResult<()> {
        let envs = [
            ("KEEL_WORKLOAD", workload.to_string()),
            ("KEEL_REPLICAS", count.to_string()),
        ];
        self.call("platform.scale", &self.config.scale, &envs, None).await?;
        Ok(())
    }

    async fn load(&self, workload: &str) -> GatewayResult<WorkloadLoad> {
        let label = "platform.load";
        let envs = [("KEEL_WORKLOAD", workload.to_string())];
        let stdout = self.call(label, &self.config.load, &envs, None).await?;
        from_json(label, &stdout)
    }
}
