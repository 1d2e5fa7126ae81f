//! Update orchestrator - drives one manifest from download to restart.
//!
//! Phases run strictly in order:
//! - stop every running executable target
//! - download and verify every file into its staging path
//! - replace files one by one, keeping backups
//! - restart executables, then delete backups
//!
//! Any error or cancellation during download, verify or replace rolls back
//! every file already replaced and restarts what the run stopped.

mod state;
mod steps;

pub use state::RunState;

use crate::config::{Config, RestartPolicy};
use crate::manifest::{FileTarget, Manifest, ManifestSource, TransportManifestSource};
use crate::process::ProcessControl;
use crate::report::{LogLevel, LogSink, ProgressSink, TracingReporter};
use crate::transaction::FileTransactor;
use crate::transport::{format_bytes, ProgressCallback, TransferProgress, Transport};
use crate::verify::Verifier;
use crate::{Result, UpdateError};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use steps::StepCounter;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Knobs for a run that do not belong to any single component
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub restart: RestartPolicy,
    /// Files downloaded at once; 1 keeps downloads sequential
    pub max_parallel_downloads: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            restart: RestartPolicy::All,
            max_parallel_downloads: 1,
        }
    }
}

impl From<&Config> for OrchestratorOptions {
    fn from(config: &Config) -> Self {
        Self {
            restart: config.updater.restart,
            max_parallel_downloads: config.updater.max_parallel_downloads.max(1),
        }
    }
}

/// What a successful run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub replaced: usize,
    pub restarted: usize,
}

/// Targets backed up and replaced so far, in commit order. Only these are
/// eligible for rollback.
#[derive(Debug, Default)]
struct UpdateOutcome {
    committed: Vec<usize>,
}

impl UpdateOutcome {
    fn record(&mut self, index: usize) {
        self.committed.push(index);
    }

    fn contains(&self, index: usize) -> bool {
        self.committed.contains(&index)
    }

    fn len(&self) -> usize {
        self.committed.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prepared {
    UpToDate,
    Staged,
}

/// Download-phase state shared by concurrent downloads
struct Downloads {
    steps: Arc<StepCounter>,
    /// Targets whose staging file this run may have written
    started: Mutex<HashSet<usize>>,
}

impl Downloads {
    fn mark_started(&self, index: usize) {
        if let Ok(mut started) = self.started.lock() {
            started.insert(index);
        }
    }

    fn started(&self) -> Vec<usize> {
        self.started
            .lock()
            .map(|started| started.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Everything one run owns. Never shared between runs.
struct Run {
    downloads: Downloads,
    transactor: FileTransactor,
    outcome: UpdateOutcome,
    /// Executables this run stopped
    stopped: Vec<PathBuf>,
    prepared: Vec<Option<Prepared>>,
    summary: RunSummary,
}

impl Run {
    fn new(manifest: &Manifest, progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            downloads: Downloads {
                steps: Arc::new(StepCounter::new(manifest.len(), progress)),
                started: Mutex::new(HashSet::new()),
            },
            transactor: FileTransactor::new(),
            outcome: UpdateOutcome::default(),
            stopped: Vec::new(),
            prepared: vec![None; manifest.len()],
            summary: RunSummary::default(),
        }
    }

    fn steps(&self) -> &StepCounter {
        &self.downloads.steps
    }

    fn has_side_effects(&self) -> bool {
        !self.stopped.is_empty() || self.outcome.len() > 0 || !self.downloads.started().is_empty()
    }
}

/// Main update orchestrator
pub struct UpdateOrchestrator {
    transport: Arc<dyn Transport>,
    processes: Arc<dyn ProcessControl>,
    manifests: Arc<dyn ManifestSource>,
    progress: Arc<dyn ProgressSink>,
    log: Arc<dyn LogSink>,
    options: OrchestratorOptions,
    cancel_token: CancellationToken,
    state: watch::Sender<RunState>,
}

impl UpdateOrchestrator {
    /// Create an orchestrator that loads manifests over `transport` and
    /// reports through `tracing`.
    pub fn new(transport: Arc<dyn Transport>, processes: Arc<dyn ProcessControl>) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            manifests: Arc::new(TransportManifestSource::new(transport.clone())),
            transport,
            processes,
            progress: Arc::new(TracingReporter),
            log: Arc::new(TracingReporter),
            options: OrchestratorOptions::default(),
            cancel_token: CancellationToken::new(),
            state,
        }
    }

    /// Use one object for both progress and log callbacks.
    pub fn with_reporter<R>(mut self, reporter: Arc<R>) -> Self
    where
        R: ProgressSink + LogSink + 'static,
    {
        self.progress = reporter.clone();
        self.log = reporter;
        self
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    /// Share an externally owned cancellation token.
    pub fn with_cancel(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Fetch the manifest at `locator` and apply it.
    pub async fn run(&self, locator: &str) -> Result<RunSummary> {
        let span = tracing::info_span!("update", run_id = %Uuid::new_v4());
        async {
            self.set_state(RunState::FetchingManifest);
            self.log(LogLevel::Info, format!("Loading update manifest from {}", locator));

            let manifest = match self.manifests.get_manifest(locator, &self.cancel_token).await {
                Ok(manifest) => manifest,
                Err(e) => return Err(self.finish_with(e)),
            };
            self.execute(manifest).await
        }
        .instrument(span)
        .await
    }

    /// Apply an already loaded manifest.
    pub async fn run_manifest(&self, manifest: Manifest) -> Result<RunSummary> {
        let span = tracing::info_span!("update", run_id = %Uuid::new_v4());
        self.execute(manifest).instrument(span).await
    }

    async fn execute(&self, manifest: Manifest) -> Result<RunSummary> {
        if let Err(e) = manifest.validate() {
            return Err(self.finish_with(e));
        }

        if manifest.is_empty() {
            self.log(LogLevel::Info, "Manifest lists no files, nothing to update");
            self.progress.on_progress(100, "Nothing to update");
            self.set_state(RunState::Done);
            return Ok(RunSummary::default());
        }

        info!("Starting update of {} file(s)", manifest.len());
        let mut run = Run::new(&manifest, self.progress.clone());

        if let Err(e) = self.apply(&manifest, &mut run).await {
            return Err(self.abort(&manifest, run, e).await);
        }

        self.set_state(RunState::StartingProcesses);
        run.summary.restarted = self.start_processes(&manifest, &run);

        self.set_state(RunState::CleaningUp);
        self.cleanup(&manifest, &run).await;

        run.steps().finish("Update completed successfully");
        self.log(LogLevel::Success, "Update completed successfully");
        self.set_state(RunState::Done);

        info!(
            "Update finished: {} downloaded, {} up to date, {} replaced, {} restarted",
            run.summary.downloaded, run.summary.skipped, run.summary.replaced, run.summary.restarted
        );
        Ok(run.summary)
    }

    /// The phases that can be rolled back: stop, download/verify, replace.
    async fn apply(&self, manifest: &Manifest, run: &mut Run) -> Result<()> {
        self.checkpoint()?;
        self.set_state(RunState::StoppingProcesses);
        self.stop_processes(manifest, run).await?;

        self.checkpoint()?;
        self.set_state(RunState::Downloading);
        self.download_all(manifest, run).await?;

        self.checkpoint()?;
        self.set_state(RunState::Replacing);
        self.replace_all(manifest, run).await
    }

    async fn stop_processes(&self, manifest: &Manifest, run: &mut Run) -> Result<()> {
        for target in manifest.files.iter().filter(|t| t.is_executable) {
            let executable = &target.current_path;
            if run.stopped.contains(executable) || !self.processes.is_running(executable) {
                continue;
            }

            self.log(
                LogLevel::Info,
                format!("Stopping process: {}", target.display_name()),
            );
            self.processes.stop(executable).await?;
            run.stopped.push(executable.clone());
        }
        Ok(())
    }

    async fn download_all(&self, manifest: &Manifest, run: &mut Run) -> Result<()> {
        let parallel = self.options.max_parallel_downloads.max(1);
        if parallel > 1 {
            debug!("Downloading up to {} files at once", parallel);
        }

        // Tripped when this phase ends, so transfers still running on the
        // blocking pool stop once a sibling has failed.
        let phase = self.cancel_token.child_token();
        let _stop_siblings = phase.clone().drop_guard();

        let downloads = &run.downloads;
        let transactor = &run.transactor;
        let mut results = stream::iter(manifest.files.iter().enumerate())
            .map(|(index, target)| self.prepare(index, target, downloads, transactor, &phase))
            .buffered(parallel);

        // Results arrive in manifest order; the first error drops the rest.
        let mut prepared = Vec::with_capacity(manifest.len());
        while let Some(result) = results.next().await {
            prepared.push(result?);
        }
        drop(results);

        for (index, outcome) in prepared.into_iter().enumerate() {
            match outcome {
                Prepared::UpToDate => run.summary.skipped += 1,
                Prepared::Staged => run.summary.downloaded += 1,
            }
            run.prepared[index] = Some(outcome);
        }
        Ok(())
    }

    /// Download and verify one file, unless it is already current.
    async fn prepare(
        &self,
        index: usize,
        target: &FileTarget,
        downloads: &Downloads,
        transactor: &FileTransactor,
        cancel: &CancellationToken,
    ) -> Result<Prepared> {
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        let name = target.display_name();

        if Verifier::is_up_to_date(&target.current_path, &target.expected_hash, cancel).await?
        {
            self.log(LogLevel::Info, format!("{} is already up to date", name));
            downloads
                .steps
                .complete(2, &format!("{} is already up to date", name));
            return Ok(Prepared::UpToDate);
        }

        self.set_state(RunState::Downloading);
        self.log(LogLevel::Info, format!("Downloading {}...", name));
        downloads.mark_started(index);

        let progress = download_progress(&downloads.steps, &name);
        let fetched = self
            .transport
            .fetch_to_file(&target.download_url, &target.new_path, cancel, progress)
            .await;
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => {
                self.discard_staged(transactor, target).await;
                return Err(e);
            }
        };
        downloads
            .steps
            .complete(1, &format!("Downloaded {} ({})", name, format_bytes(bytes)));

        self.set_state(RunState::Verifying);
        let verified = Verifier::digest_matches(&target.new_path, &target.expected_hash, cancel).await;
        let actual = match verified {
            Ok((true, _)) => {
                downloads.steps.complete(1, &format!("Verified {}", name));
                return Ok(Prepared::Staged);
            }
            Ok((false, actual)) => actual,
            Err(e) => {
                self.discard_staged(transactor, target).await;
                return Err(e);
            }
        };

        self.discard_staged(transactor, target).await;
        Err(UpdateError::HashMismatch {
            name,
            expected: target.expected_hash.clone(),
            actual,
        })
    }

    async fn replace_all(&self, manifest: &Manifest, run: &mut Run) -> Result<()> {
        for (index, target) in manifest.files.iter().enumerate() {
            self.checkpoint()?;
            let name = target.display_name();

            if run.prepared[index] != Some(Prepared::Staged) {
                run.steps().complete(1, &format!("{} is already up to date", name));
                continue;
            }

            self.log(LogLevel::Info, format!("Replacing {}...", name));
            if let Err(e) = run.transactor.commit(target).await {
                if let Err(recovery) = run.transactor.recover_failed_commit(target).await {
                    self.log(
                        LogLevel::Error,
                        format!("Failed to restore {}: {}", name, recovery),
                    );
                }
                return Err(e);
            }

            run.outcome.record(index);
            run.summary.replaced += 1;
            run.steps().complete(1, &format!("Replaced {}", name));
        }
        Ok(())
    }

    /// Start executable targets according to the restart policy. Start
    /// failures are reported and do not undo the update.
    fn start_processes(&self, manifest: &Manifest, run: &Run) -> usize {
        let mut started = 0;
        for target in manifest.files.iter().filter(|t| t.is_executable) {
            if self.options.restart == RestartPolicy::PreviouslyRunning
                && !run.stopped.contains(&target.current_path)
            {
                continue;
            }
            if self.start(target) {
                started += 1;
            }
        }
        started
    }

    fn start(&self, target: &FileTarget) -> bool {
        let name = target.display_name();
        match self.processes.start(&target.current_path) {
            Ok(()) => {
                self.log(LogLevel::Info, format!("Started {}", name));
                true
            }
            Err(e) => {
                self.log(LogLevel::Error, format!("Failed to start {}: {}", name, e));
                false
            }
        }
    }

    async fn cleanup(&self, manifest: &Manifest, run: &Run) {
        for target in &manifest.files {
            if let Err(e) = run.transactor.discard_backup(target).await {
                self.log(
                    LogLevel::Warning,
                    format!("Could not delete backup of {}: {}", target.display_name(), e),
                );
            }
        }
    }

    /// Unwind a failed or cancelled run, then report its terminal state.
    async fn abort(&self, manifest: &Manifest, run: Run, error: UpdateError) -> UpdateError {
        if !run.has_side_effects() {
            return self.finish_with(error);
        }

        self.set_state(RunState::RollingBack);
        self.log(LogLevel::Warning, "Rolling back changes");

        for &index in &run.outcome.committed {
            let target = &manifest.files[index];
            let name = target.display_name();
            match run.transactor.rollback(target).await {
                Ok(()) => self.log(LogLevel::Info, format!("Restored {}", name)),
                Err(e) => self.log(LogLevel::Error, format!("Failed to restore {}: {}", name, e)),
            }
        }

        for index in run.downloads.started() {
            if !run.outcome.contains(index) {
                self.discard_staged(&run.transactor, &manifest.files[index]).await;
            }
        }

        // The previous fileset is back in place.
        for executable in &run.stopped {
            if let Some(target) = manifest.files.iter().find(|t| &t.current_path == executable) {
                self.start(target);
            }
        }

        self.finish_with(error)
    }

    /// Report a terminal error exactly once and enter `Cancelled` or `Failed`.
    fn finish_with(&self, error: UpdateError) -> UpdateError {
        if error.is_cancelled() {
            self.log(LogLevel::Warning, "Update cancelled");
            self.set_state(RunState::Cancelled);
        } else {
            self.log(LogLevel::Error, format!("Update failed: {}", error));
            self.set_state(RunState::Failed);
        }
        error
    }

    async fn discard_staged(&self, transactor: &FileTransactor, target: &FileTarget) {
        if let Err(e) = transactor.discard_staged(target).await {
            warn!("Could not delete staged {}: {}", target.new_path.display(), e);
        }
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            Err(UpdateError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: RunState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Run state: {} -> {}", previous, state);
        }
    }

    fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        self.log.on_log(message.as_ref(), level);
    }
}

/// Map per-file transfer progress into the file's download step.
fn download_progress(steps: &Arc<StepCounter>, name: &str) -> ProgressCallback {
    let steps = steps.clone();
    let name = name.to_string();
    Arc::new(move |progress: &TransferProgress| {
        let fraction = progress
            .percent()
            .map(|percent| f64::from(percent) / 100.0)
            .unwrap_or(0.0);
        steps.partial(fraction, &format!("{}: {}", name, progress.label()));
    })
}
