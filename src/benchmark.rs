//! # Benchmark Engine Module
//!
//! This module contains the state machine that drives one benchmark run from
//! provisioning through repeated execution to analysis, and guarantees that
//! every instance it creates is destroyed exactly once.
//!
//! ## Key Components
//!
//! - **BenchmarkSpec**: Immutable description of a run (kind, shape, release, iterations)
//! - **RunnerConfig**: Engine knobs that are not part of the measurement (poll budget, tags, format)
//! - **BenchmarkRunner**: Owns the active instances and sequences the lifecycle
//! - **InstanceSession**: The view of one live instance (and its peer) handed to workloads
//!
//! ## Test Execution Lifecycle
//!
//! ```text
//! Idle -> Provisioning -> Executing -> CollectingIteration --+--> Analyzing -> Done
//!              ^                                             |
//!              +---------------- next iteration -------------+
//! ```
//!
//! `Failed` is reachable from every state. Workloads that need a pristine
//! machine for every measurement (boot timing) go back through
//! `Provisioning` each iteration; all others provision once and reuse the
//! instance. Workloads that measure between two machines (netperf) get a
//! server instance launched in the primary's availability zone.
//!
//! ## Cleanup
//!
//! Active handles live on the runner, not inside the run future. When a run
//! fails, or its `CancellationToken` fires and the run future is dropped
//! mid-await, `run` takes every handle and destroys it before returning. A
//! handle is moved into `destroy`, so a second destroy cannot be expressed.
//!
//! `create` runs in a spawned task whose `JoinHandle` is also kept on the
//! runner. Dropping the run future does not abort that task, so a launch
//! interrupted by cancellation is awaited during cleanup and the instance it
//! produced is destroyed with the others.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cli::{BenchmarkKind, ReportFormat, RunArgs};
use crate::cloud::{
    CommandOutput, InstanceClient, InstanceHandle, InstanceState, LaunchRequest, Tag,
};
use crate::error::{BenchError, CloudError, ConfigError, RunError, RunStage};
use crate::parsers;
use crate::poller::{poll_until_ready, PollConfig, PollError, Probe};
use crate::records::{IterationSeries, SeriesError};
use crate::report::Report;
use crate::results::{BenchmarkResults, ResultsManager};
use crate::stats::summarize;
use crate::versions::{self, SystemInfo};
use crate::workloads::Workload;

/// Immutable description of one benchmark invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BenchmarkSpec {
    pub kind: BenchmarkKind,
    /// Provider instance type
    pub shape: String,
    pub release: String,
    /// Pinned image; skips image resolution when set
    pub image: Option<String>,
    pub iterations: usize,
}

impl BenchmarkSpec {
    pub fn new(
        kind: BenchmarkKind,
        shape: impl Into<String>,
        release: impl Into<String>,
        iterations: usize,
    ) -> Result<Self, ConfigError> {
        let spec = Self {
            kind,
            shape: shape.into(),
            release: release.into(),
            image: None,
            iterations,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Create a benchmark spec from CLI arguments
    ///
    /// ## Validation
    /// - iterations must be at least 1 (per-kind default when omitted)
    /// - shape and release must be non-empty
    pub fn from_args(args: &RunArgs) -> Result<Self, ConfigError> {
        let spec = Self {
            kind: args.kind,
            shape: args.instance_type.trim().to_string(),
            release: args.release.trim().to_string(),
            image: args.image.clone(),
            iterations: args
                .iterations
                .unwrap_or_else(|| args.kind.default_iterations()),
        };
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if self.shape.trim().is_empty() {
            return Err(ConfigError::EmptyShape);
        }
        if self.release.trim().is_empty() {
            return Err(ConfigError::EmptyRelease);
        }
        Ok(())
    }
}

impl fmt::Display for BenchmarkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting Benchmark for: {}", self.kind)?;
        writeln!(f, "  Instance Type:      {}", self.shape)?;
        writeln!(f, "  Release:            {}", self.release)?;
        match &self.image {
            Some(image) => writeln!(f, "  Image:              {} (pinned)", image)?,
            None => writeln!(f, "  Image:              latest daily")?,
        }
        writeln!(f, "  Iterations:         {}", self.iterations)?;
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Engine settings that do not change what is measured.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub poll: PollConfig,
    pub format: ReportFormat,
    /// Tags applied to every created instance
    pub tags: Vec<Tag>,
    /// Record kernel and package versions after the first preparation
    pub collect_versions: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            format: ReportFormat::Text,
            tags: vec![("Name".to_string(), crate::defaults::INSTANCE_NAME.to_string())],
            collect_versions: true,
        }
    }
}

impl RunnerConfig {
    pub fn from_args(args: &RunArgs) -> Result<Self, ConfigError> {
        if args.poll_attempts == 0 {
            return Err(ConfigError::ZeroPollAttempts);
        }
        Ok(Self {
            poll: PollConfig::new(args.poll_interval, args.poll_attempts),
            format: args.format,
            collect_versions: !args.no_versions,
            ..Self::default()
        })
    }
}

/// Lifecycle state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Provisioning,
    Executing,
    CollectingIteration,
    Analyzing,
    Done,
    Failed,
}

/// Current state, the stage to blame on failure, and the transition log.
#[derive(Debug)]
struct Lifecycle {
    state: RunState,
    stage: RunStage,
    history: Vec<RunState>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
            stage: RunStage::Provisioning,
            history: vec![RunState::Idle],
        }
    }

    fn enter(&mut self, state: RunState, stage: RunStage) {
        debug!(from = ?self.state, to = ?state, "State transition");
        self.state = state;
        self.stage = stage;
        self.history.push(state);
    }

    fn finish(&mut self, state: RunState) {
        self.state = state;
        self.history.push(state);
    }

    fn fail(&mut self, source: BenchError) -> RunError {
        self.finish(RunState::Failed);
        RunError {
            stage: self.stage,
            source,
        }
    }
}

/// A live instance as seen by a workload.
///
/// Wraps the client and handle so workloads can run commands and wait on
/// readiness without ever owning the handle. Workloads that need a second
/// machine reach it through [`InstanceSession::peer`].
pub struct InstanceSession<'a> {
    client: &'a dyn InstanceClient,
    handle: &'a InstanceHandle,
    poll: &'a PollConfig,
    peer: Option<&'a InstanceHandle>,
}

fn poll_failure(err: PollError<CloudError>) -> BenchError {
    match err {
        PollError::Exhausted(err) => BenchError::NotReady(err),
        PollError::Fatal(err) => err.into(),
    }
}

impl<'a> InstanceSession<'a> {
    pub fn new(
        client: &'a dyn InstanceClient,
        handle: &'a InstanceHandle,
        poll: &'a PollConfig,
    ) -> Self {
        Self {
            client,
            handle,
            poll,
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: Option<&'a InstanceHandle>) -> Self {
        self.peer = peer;
        self
    }

    pub fn handle(&self) -> &InstanceHandle {
        self.handle
    }

    /// Session on the server instance, when the runner launched one.
    pub fn peer(&self) -> Option<InstanceSession<'a>> {
        self.peer
            .map(|handle| InstanceSession::new(self.client, handle, self.poll))
    }

    pub async fn zone(&self) -> Result<Option<String>, BenchError> {
        Ok(self.client.zone(self.handle).await?)
    }

    /// Run a command; a non-zero exit status is returned, not raised.
    pub async fn run(&self, command: &str) -> Result<CommandOutput, BenchError> {
        debug!(instance = %self.handle, command, "Running");
        Ok(self.client.run(self.handle, command).await?)
    }

    /// Run a command and fail with `BenchError::Command` on non-zero exit.
    pub async fn run_checked(&self, command: &str) -> Result<CommandOutput, BenchError> {
        let output = self.run(command).await?;
        if !output.success() {
            return Err(BenchError::Command {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Wait for the provider to report the instance as running.
    pub async fn wait_until_running(&self) -> Result<(), BenchError> {
        let (client, handle) = (self.client, self.handle);
        poll_until_ready("instance running", self.poll, move || {
            power_state_probe(client, handle)
        })
        .await
        .map_err(poll_failure)
    }

    /// Wait until the remote command channel accepts commands.
    pub async fn wait_until_reachable(&self) -> Result<(), BenchError> {
        let (client, handle) = (self.client, self.handle);
        poll_until_ready("instance reachable", self.poll, move || {
            reachability_probe(client, handle)
        })
        .await
        .map_err(poll_failure)
    }

    /// Wait until `command` exits 0 and return its output.
    ///
    /// Connection errors that the poller treats as transient are absorbed,
    /// so this also bridges the window where the instance is rebooting.
    pub async fn wait_for_success(
        &self,
        what: &str,
        command: &str,
    ) -> Result<CommandOutput, BenchError> {
        let (client, handle) = (self.client, self.handle);
        poll_until_ready(what, self.poll, move || success_probe(client, handle, command))
            .await
            .map_err(poll_failure)
    }

    /// Restart the instance and wait until it is back on a new boot.
    ///
    /// The kernel boot id is captured before the restart; the wait only ends
    /// once the instance answers with a different one, so a command channel
    /// that is still open to the old boot is not mistaken for a finished
    /// reboot.
    pub async fn restart_and_wait(&self) -> Result<(), BenchError> {
        let output = self.run_checked(BOOT_ID_COMMAND).await?;
        let before = output.stdout.trim();
        info!(instance = %self.handle, "Restarting");
        self.client.restart(self.handle).await?;

        self.wait_until_running().await?;
        let (client, handle) = (self.client, self.handle);
        poll_until_ready("instance rebooted", self.poll, move || {
            boot_id_probe(client, handle, before)
        })
        .await
        .map_err(poll_failure)
    }
}

async fn power_state_probe(
    client: &dyn InstanceClient,
    handle: &InstanceHandle,
) -> Result<Probe<()>, CloudError> {
    match client.state(handle).await? {
        InstanceState::Running => Ok(Probe::Ready(())),
        InstanceState::Pending => Ok(Probe::NotReady),
        InstanceState::Other(state) => Err(CloudError::Provisioning(format!(
            "{} entered state '{}' while starting",
            handle, state
        ))),
    }
}

async fn reachability_probe(
    client: &dyn InstanceClient,
    handle: &InstanceHandle,
) -> Result<Probe<()>, CloudError> {
    client.run(handle, "true").await?;
    Ok(Probe::Ready(()))
}

async fn success_probe(
    client: &dyn InstanceClient,
    handle: &InstanceHandle,
    command: &str,
) -> Result<Probe<CommandOutput>, CloudError> {
    let output = client.run(handle, command).await?;
    if output.success() {
        Ok(Probe::Ready(output))
    } else {
        debug!(command, exit_code = output.exit_code, "Not finished yet");
        Ok(Probe::NotReady)
    }
}

async fn boot_id_probe(
    client: &dyn InstanceClient,
    handle: &InstanceHandle,
    before: &str,
) -> Result<Probe<()>, CloudError> {
    let output = client.run(handle, BOOT_ID_COMMAND).await?;
    let current = output.stdout.trim();
    if output.success() && !current.is_empty() && current != before {
        Ok(Probe::Ready(()))
    } else {
        Ok(Probe::NotReady)
    }
}

/// Session on the primary instance, with the server as its peer.
fn session_for<'a>(
    client: &'a dyn InstanceClient,
    active: &'a [InstanceHandle],
    poll: &'a PollConfig,
) -> Result<InstanceSession<'a>, BenchError> {
    let (primary, rest) = active
        .split_first()
        .ok_or_else(|| BenchError::Provisioning("no active instance".to_string()))?;
    Ok(InstanceSession::new(client, primary, poll).with_peer(rest.first()))
}

type Launch = tokio::task::JoinHandle<Result<InstanceHandle, CloudError>>;

/// What a successful `execute` hands back to `run`.
struct Outcome {
    image_id: String,
    report: Report,
    rendered: String,
}

const BOOT_ID_COMMAND: &str = "cat /proc/sys/kernel/random/boot_id";

/// Benchmark runner that sequences one benchmark run
///
/// The runner exclusively owns the instance handles while a run is active.
/// It is single-use in spirit: run it once, then inspect `state()` and
/// `transitions()`.
pub struct BenchmarkRunner {
    client: Arc<dyn InstanceClient>,
    workload: Box<dyn Workload>,
    spec: BenchmarkSpec,
    config: RunnerConfig,
    lifecycle: Lifecycle,
    /// Primary first, then the server if the workload needs one
    active: Vec<InstanceHandle>,
    /// `create` call that has not returned yet
    launching: Option<Launch>,
    system_info: Option<SystemInfo>,
}

impl BenchmarkRunner {
    pub fn new(
        client: Arc<dyn InstanceClient>,
        workload: Box<dyn Workload>,
        spec: BenchmarkSpec,
        config: RunnerConfig,
    ) -> Self {
        Self {
            client,
            workload,
            spec,
            config,
            lifecycle: Lifecycle::new(),
            active: Vec::new(),
            launching: None,
            system_info: None,
        }
    }

    pub fn spec(&self) -> &BenchmarkSpec {
        &self.spec
    }

    pub fn state(&self) -> RunState {
        self.lifecycle.state
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn transitions(&self) -> &[RunState] {
        &self.lifecycle.history
    }

    /// Run the benchmark and return its results
    ///
    /// ## Parameters
    /// - `results_manager`: when present, raw captures and the final report
    ///   are persisted as they are produced
    /// - `cancel`: cancels the run; every created instance is still destroyed
    ///
    /// ## Returns
    /// - `Ok(BenchmarkResults)`: report and run metadata
    /// - `Err(RunError)`: the stage that failed and why; no report is produced
    pub async fn run(
        &mut self,
        results_manager: Option<&mut ResultsManager>,
        cancel: &CancellationToken,
    ) -> Result<BenchmarkResults, RunError> {
        let run_id = Uuid::new_v4().to_string();
        let short_id = run_id[..8].to_string();
        let span = info_span!(
            "run",
            run_id = %short_id,
            kind = %self.spec.kind,
            shape = %self.spec.shape
        );

        async move {
            let started_at = Utc::now();
            let started = Instant::now();
            info!(provider = self.client.name(), "Starting benchmark run");

            // The execution future is dropped before cleanup runs, whichever
            // branch wins.
            let outcome = tokio::select! {
                outcome = self.execute(results_manager) => Some(outcome),
                _ = cancel.cancelled() => None,
            };

            let outcome = match outcome {
                Some(outcome) => outcome,
                None => {
                    warn!(stage = %self.lifecycle.stage, "Run cancelled");
                    Err(self.lifecycle.fail(BenchError::Cancelled))
                }
            };

            // Cleanup on every exit path.
            self.release_active().await;

            let outcome = outcome?;
            self.lifecycle.finish(RunState::Done);
            let duration = started.elapsed();
            info!(?duration, "Benchmark run complete");

            Ok(BenchmarkResults {
                run_id,
                spec: self.spec.clone(),
                image_id: outcome.image_id,
                format: self.config.format,
                report: outcome.report,
                rendered: outcome.rendered,
                started_at,
                duration,
                system_info: self.system_info.take(),
            })
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &mut self,
        mut results_manager: Option<&mut ResultsManager>,
    ) -> Result<Outcome, RunError> {
        self.lifecycle
            .enter(RunState::Provisioning, RunStage::Provisioning);
        let image_id = match &self.spec.image {
            Some(image) => image.clone(),
            None => {
                let resolved = self.client.resolve_image(&self.spec.release).await;
                resolved.map_err(|e| self.lifecycle.fail(e.into()))?
            }
        };
        info!(image_id, "Using image");

        let mut series: Vec<IterationSeries> = self
            .workload
            .series()
            .into_iter()
            .map(|(name, kind)| IterationSeries::new(name, kind))
            .collect();

        if !self.workload.fresh_instance_per_iteration() {
            self.provision_and_prepare(&image_id).await?;
        }

        for iteration in 1..=self.spec.iterations {
            let span = info_span!("iteration", n = iteration);
            self.run_iteration(
                iteration,
                &image_id,
                &mut series,
                results_manager.as_deref_mut(),
            )
            .instrument(span)
            .await?;
        }

        self.lifecycle.enter(RunState::Analyzing, RunStage::Analyzing);
        let analysis = self.analyze(series, results_manager);
        let (report, rendered) = analysis.map_err(|e| self.lifecycle.fail(e))?;
        Ok(Outcome {
            image_id,
            report,
            rendered,
        })
    }

    async fn run_iteration(
        &mut self,
        iteration: usize,
        image_id: &str,
        series: &mut [IterationSeries],
        mut results_manager: Option<&mut ResultsManager>,
    ) -> Result<(), RunError> {
        info!(
            "Running iteration {} of {}",
            iteration, self.spec.iterations
        );
        let fresh = self.workload.fresh_instance_per_iteration();
        if fresh {
            self.lifecycle
                .enter(RunState::Provisioning, RunStage::Provisioning);
            self.provision_and_prepare(image_id).await?;
        }

        self.lifecycle
            .enter(RunState::Executing, RunStage::Executing { iteration });
        let captures = match session_for(self.client.as_ref(), &self.active, &self.config.poll) {
            Ok(session) => self.workload.run_iteration(&session, iteration).await,
            Err(err) => Err(err),
        };
        let captures = captures.map_err(|e| self.lifecycle.fail(e))?;

        self.lifecycle.enter(
            RunState::CollectingIteration,
            RunStage::Collecting { iteration },
        );
        for capture in &captures {
            if let Some(manager) = results_manager.as_deref_mut() {
                manager
                    .save_capture(capture)
                    .map_err(|e| self.lifecycle.fail(e.into()))?;
            }
            let record = parsers::parse(capture).map_err(|e| self.lifecycle.fail(e.into()))?;
            debug!(series = %capture.series, ?record, "Parsed capture");

            let target = series
                .iter_mut()
                .find(|s| s.name() == capture.series)
                .ok_or_else(|| SeriesError::UnknownSeries(capture.series.clone()));
            target
                .and_then(|s| s.push(record))
                .map_err(|e| self.lifecycle.fail(e.into()))?;
        }

        if fresh {
            self.release_active().await;
        }
        Ok(())
    }

    fn analyze(
        &self,
        series: Vec<IterationSeries>,
        results_manager: Option<&mut ResultsManager>,
    ) -> Result<(Report, String), BenchError> {
        let summaries = series
            .iter()
            .map(summarize)
            .collect::<Result<Vec<_>, _>>()?;
        let report = Report {
            header: self.workload.header(),
            series,
            summaries,
        };
        let rendered = report.render(self.config.format)?;
        if let Some(manager) = results_manager {
            if let Some(info) = &self.system_info {
                let path = manager.save_system_info(info)?;
                info!("Versions written to {}", path.display());
            }
            let path = manager.save_report(&rendered, self.config.format)?;
            info!("Report written to {}", path.display());
        }
        Ok((report, rendered))
    }

    async fn provision_and_prepare(&mut self, image_id: &str) -> Result<(), RunError> {
        let provisioned = self.provision(image_id).await;
        provisioned.map_err(|e| self.lifecycle.fail(e))?;

        self.lifecycle.enter(RunState::Provisioning, RunStage::Preparing);
        let prepared = self.prepare().await;
        prepared.map_err(|e| self.lifecycle.fail(e))
    }

    /// Launch the primary, and the server next to it when the workload
    /// needs one, and wait until both accept commands.
    async fn provision(&mut self, image_id: &str) -> Result<(), BenchError> {
        self.launch(image_id, "primary", None).await?;
        let zone = {
            let session = session_for(self.client.as_ref(), &self.active, &self.config.poll)?;
            session.wait_until_running().await?;
            if self.workload.needs_server() {
                session.zone().await?
            } else {
                None
            }
        };

        if self.workload.needs_server() {
            match &zone {
                Some(zone) => info!(zone = %zone, "Launching server next to the primary"),
                None => warn!("Primary reported no zone, server placement left to the provider"),
            }
            self.launch(image_id, "server", zone).await?;
        }

        let session = session_for(self.client.as_ref(), &self.active, &self.config.poll)?;
        if let Some(server) = session.peer() {
            server.wait_until_running().await?;
            server.wait_until_reachable().await?;
        }
        session.wait_until_reachable().await
    }

    /// Create one instance and keep its handle.
    ///
    /// The provider call runs in its own task and the `JoinHandle` is parked
    /// in `self.launching` while it is in flight, so `release_active` can
    /// still collect the instance if this future is dropped.
    async fn launch(
        &mut self,
        image_id: &str,
        role: &str,
        zone: Option<String>,
    ) -> Result<(), BenchError> {
        let mut tags = self.config.tags.clone();
        tags.push(("benchmark".to_string(), self.spec.kind.to_string()));
        tags.push(("role".to_string(), role.to_string()));
        let request = LaunchRequest::new(image_id, self.spec.shape.as_str(), tags).in_zone(zone);

        let client = Arc::clone(&self.client);
        let task = self
            .launching
            .insert(tokio::spawn(async move { client.create(&request).await }));
        let joined = task.await;
        self.launching = None;

        let handle = joined
            .map_err(|e| CloudError::Provisioning(format!("launch task failed: {}", e)))??;
        info!(instance = %handle, role, "Instance created");
        self.active.push(handle);
        Ok(())
    }

    async fn prepare(&mut self) -> Result<(), BenchError> {
        let session = session_for(self.client.as_ref(), &self.active, &self.config.poll)?;
        self.workload.prepare(&session).await?;

        if self.config.collect_versions && self.system_info.is_none() {
            self.system_info = Some(versions::collect(&session).await?);
        }
        Ok(())
    }

    /// Destroy every instance this run created, server first. Failures are
    /// logged, not raised: each handle is consumed either way.
    async fn release_active(&mut self) {
        if let Some(task) = self.launching.take() {
            match task.await {
                Ok(Ok(handle)) => {
                    warn!(instance = %handle, "Instance created after the run stopped");
                    self.active.push(handle);
                }
                Ok(Err(err)) => debug!(error = %err, "Interrupted launch failed"),
                Err(err) => error!(error = %err, "Launch task failed"),
            }
        }

        while let Some(handle) = self.active.pop() {
            let id = handle.id().to_string();
            match self.client.destroy(handle).await {
                Ok(()) => info!(instance = %id, "Instance destroyed"),
                Err(err) => error!(instance = %id, error = %err, "Failed to destroy instance"),
            }
        }
    }
}
