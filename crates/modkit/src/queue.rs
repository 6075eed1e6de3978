//! Serialized job executor
//!
//! A single background task drains the queue one job at a time; the public
//! surface talks to it over a command channel and may interleave freely
//! with an in-progress job. Registry mutations around the long-running
//! suspension points (transfer, extraction) are short and lock-scoped, and
//! the registry commit always happens after the disk mutation it records.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::archive::ArchiveEngine;
use crate::config::ModKitConfig;
use crate::error::{ModError, Result};
use crate::events::{EventBus, EventKind, OperationKind};
use crate::install;
use crate::progress::ProgressSlot;
use crate::reconcile::{Job, JobKind};
use crate::registry::{LocalRegistry, ModId, ModStatus, ProfileId};
use crate::remote::DesiredState;
use crate::storage::DiskGuard;
use crate::transport::{Transport, TransferCallback};

/// Commands accepted by the executor task
pub(crate) enum Command {
    /// Enqueue jobs, optionally refreshing the desired snapshot jobs
    /// resolve their catalog metadata against. `None` leaves the live
    /// snapshot untouched (uninstall-only passes need no metadata).
    RunJobs {
        desired: Option<Arc<DesiredState>>,
        jobs: Vec<Job>,
    },
    /// Preempt: cancel a different in-flight job and run this mod next
    DownloadNow { mod_id: ModId, user: ProfileId },
    /// Uninstall regardless of subscription intent
    ForceUninstall { mod_id: ModId, user: ProfileId },
    /// Cancel the in-flight job and drop everything queued
    CancelAll,
    /// Resolved once the queue is empty and nothing is running
    WaitIdle(oneshot::Sender<()>),
    Shutdown,
}

/// How a processed job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobDisposition {
    Succeeded,
    Failed,
    Cancelled,
    /// Refused before running (space, entitlement); re-derived next pass
    Parked,
}

/// Shared collaborators handed to every job
pub(crate) struct ExecutorContext {
    pub config: ModKitConfig,
    pub registry: Arc<Mutex<LocalRegistry>>,
    pub transport: Arc<dyn Transport>,
    pub archive: Arc<dyn ArchiveEngine>,
    pub disk: Arc<dyn DiskGuard>,
    pub bus: EventBus,
    pub progress: ProgressSlot,
}

impl ExecutorContext {
    fn archive_dest(&self, mod_id: &ModId) -> std::path::PathBuf {
        self.config.downloads_dir.join(format!("{mod_id}.archive"))
    }
}

/// Handle to the background executor task
pub(crate) struct JobExecutor {
    tx: mpsc::UnboundedSender<Command>,
}

impl JobExecutor {
    pub(crate) fn spawn(ctx: ExecutorContext) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_loop(rx, Arc::new(ctx)));
        Self { tx }
    }

    pub(crate) fn send(&self, command: Command) {
        // A dropped executor only happens after Shutdown; late commands
        // are then intentionally ignored.
        self.tx.send(command).ok();
    }

    /// Wait until the queue is drained and no job is running
    pub(crate) async fn wait_idle(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Command::WaitIdle(tx));
        rx.await.ok();
    }
}

impl Drop for JobExecutor {
    fn drop(&mut self) {
        self.tx.send(Command::Shutdown).ok();
    }
}

/// Skip jobs already queued for the same (mod, kind), or equal to the one
/// currently running
fn enqueue_deduplicated(queue: &mut VecDeque<Job>, jobs: Vec<Job>, running: Option<&Job>) {
    for job in jobs {
        let duplicate_queued = queue
            .iter()
            .any(|q| q.mod_id == job.mod_id && q.kind == job.kind);
        let duplicate_running =
            running.is_some_and(|r| r.mod_id == job.mod_id && r.kind == job.kind);
        if duplicate_queued || duplicate_running {
            debug!("dropping duplicate job {:?} for {}", job.kind, job.mod_id);
            continue;
        }
        queue.push_back(job);
    }
}

/// Promote a job to the head of the queue, displacing any queued duplicate
/// for the same (mod, kind) so the artifact is only fetched once
fn push_front_deduplicated(queue: &mut VecDeque<Job>, job: Job) {
    queue.retain(|q| !(q.mod_id == job.mod_id && q.kind == job.kind));
    queue.push_front(job);
}

async fn run_loop(mut rx: mpsc::UnboundedReceiver<Command>, ctx: Arc<ExecutorContext>) {
    let mut queue: VecDeque<Job> = VecDeque::new();
    let mut desired: Arc<DesiredState> = Arc::new(DesiredState::default());
    let mut idle_waiters: Vec<oneshot::Sender<()>> = Vec::new();

    'outer: loop {
        if queue.is_empty() {
            for waiter in idle_waiters.drain(..) {
                waiter.send(()).ok();
            }
        }

        let job = match queue.pop_front() {
            Some(job) => job,
            None => match rx.recv().await {
                None | Some(Command::Shutdown) => break,
                Some(Command::RunJobs { desired: snapshot, jobs }) => {
                    if let Some(snapshot) = snapshot {
                        desired = snapshot;
                    }
                    enqueue_deduplicated(&mut queue, jobs, None);
                    continue;
                }
                Some(Command::DownloadNow { mod_id, user }) => {
                    push_front_deduplicated(&mut queue, Job::new(JobKind::Download, mod_id, user));
                    continue;
                }
                Some(Command::ForceUninstall { mod_id, user }) => {
                    push_front_deduplicated(
                        &mut queue,
                        Job::new(JobKind::Uninstall { force: true }, mod_id, user),
                    );
                    continue;
                }
                Some(Command::CancelAll) => continue,
                Some(Command::WaitIdle(tx)) => {
                    idle_waiters.push(tx);
                    continue;
                }
            },
        };

        // Exactly one job in flight: the task below is the only writer to
        // the mod's archive/extracted namespace until it resolves.
        let cancel = CancellationToken::new();
        let mut task = tokio::spawn(run_job(
            ctx.clone(),
            desired.clone(),
            job.clone(),
            cancel.clone(),
        ));

        let mut promoted: Option<Job> = None;
        let mut requeue_current = false;
        let mut shutdown = false;

        let disposition = loop {
            tokio::select! {
                joined = &mut task => {
                    break joined.unwrap_or_else(|e| {
                        warn!("job task for {} aborted: {}", job.mod_id, e);
                        JobDisposition::Failed
                    });
                }
                command = rx.recv() => match command {
                    None | Some(Command::Shutdown) => {
                        cancel.cancel();
                        shutdown = true;
                    }
                    Some(Command::RunJobs { desired: snapshot, jobs }) => {
                        if let Some(snapshot) = snapshot {
                            desired = snapshot;
                        }
                        enqueue_deduplicated(&mut queue, jobs, Some(&job));
                    }
                    Some(Command::DownloadNow { mod_id, user }) => {
                        if mod_id == job.mod_id {
                            debug!("download-now for {} is already running", mod_id);
                        } else {
                            promoted = Some(Job::new(JobKind::Download, mod_id, user));
                            requeue_current = true;
                            cancel.cancel();
                        }
                    }
                    Some(Command::ForceUninstall { mod_id, user }) => {
                        push_front_deduplicated(
                            &mut queue,
                            Job::new(JobKind::Uninstall { force: true }, mod_id, user),
                        );
                    }
                    Some(Command::CancelAll) => {
                        queue.clear();
                        cancel.cancel();
                    }
                    Some(Command::WaitIdle(tx)) => idle_waiters.push(tx),
                }
            }
        };

        ctx.progress.clear();

        // A job preempted by download-now is still wanted: requeue it right
        // behind the promoted download.
        if requeue_current && disposition == JobDisposition::Cancelled {
            let mut retry = job.clone();
            retry.attempt += 1;
            push_front_deduplicated(&mut queue, retry);
        }
        if let Some(promoted) = promoted.take() {
            push_front_deduplicated(&mut queue, promoted);
        }
        if shutdown {
            break 'outer;
        }
    }

    for waiter in idle_waiters {
        waiter.send(()).ok();
    }
}

async fn run_job(
    ctx: Arc<ExecutorContext>,
    desired: Arc<DesiredState>,
    job: Job,
    cancel: CancellationToken,
) -> JobDisposition {
    let result = match job.kind {
        JobKind::Download | JobKind::Update => run_download(&ctx, &desired, &job, &cancel).await,
        JobKind::Install => run_install(&ctx, &job, &cancel).await,
        JobKind::Uninstall { force } => run_uninstall(&ctx, &job, force).await,
    };

    match result {
        Ok(disposition) => disposition,
        Err(err) if matches!(err, ModError::Cancelled { .. }) => {
            debug!("job {:?} for {} cancelled", job.kind, job.mod_id);
            let operation = operation_of(&job);
            if let Ok(mut registry) = ctx.registry.lock() {
                if let Some(record) = registry.get_mut(&job.mod_id) {
                    // Cancellation is not failure; leave the record in the
                    // state the next diff can pick up from.
                    record.status = if record.extracted_path.is_some() {
                        ModStatus::Installed
                    } else if record.archive_path.is_some() {
                        ModStatus::Queued
                    } else {
                        ModStatus::NotInstalled
                    };
                }
                registry.commit().ok();
            }
            ctx.bus
                .emit_for(&job.mod_id, EventKind::Cancelled { operation });
            JobDisposition::Cancelled
        }
        Err(err) => {
            warn!("job {:?} for {} failed: {}", job.kind, job.mod_id, err);
            if let Ok(mut registry) = ctx.registry.lock() {
                registry.entry(&job.mod_id).status = ModStatus::Failed;
                registry.commit().ok();
            }
            let kind = err.failure_kind();
            let message = err.to_string();
            let event = match job.kind {
                JobKind::Download | JobKind::Update => EventKind::DownloadFailed { kind, message },
                JobKind::Install => EventKind::InstallFailed { kind, message },
                JobKind::Uninstall { .. } => EventKind::UninstallFailed { kind, message },
            };
            ctx.bus.emit_for(&job.mod_id, event);
            JobDisposition::Failed
        }
    }
}

fn operation_of(job: &Job) -> OperationKind {
    match job.kind {
        JobKind::Download => OperationKind::Download,
        JobKind::Update => OperationKind::Update,
        JobKind::Install => OperationKind::Install,
        JobKind::Uninstall { .. } => OperationKind::Uninstall,
    }
}

async fn run_download(
    ctx: &ExecutorContext,
    desired: &DesiredState,
    job: &Job,
    cancel: &CancellationToken,
) -> Result<JobDisposition> {
    let meta = desired.meta(&job.mod_id)?.clone();

    // Entitlement gate: a paid mod without a grant is parked, not failed;
    // a purchase landing later unlocks it on the next pass.
    if !desired.is_entitled(&job.mod_id) {
        debug!("{} is paid and not entitled for {}, parking", job.mod_id, job.initiating_user);
        return Ok(JobDisposition::Parked);
    }

    // Space guard: park with a distinct status and event instead of
    // busy-looping on retries.
    let required = ctx.config.required_bytes(meta.size_bytes);
    if !ctx.disk.has_space_for(&ctx.config.downloads_dir, required) {
        let available = ctx.disk.available_space(&ctx.config.downloads_dir);
        {
            let mut registry = ctx.registry.lock().unwrap();
            let record = registry.entry(&job.mod_id);
            record.status = ModStatus::InsufficientSpace;
            record.latest_known_version = Some(meta.version.clone());
            registry.commit()?;
        }
        ctx.bus.emit_for(
            &job.mod_id,
            EventKind::InsufficientSpace { required, available },
        );
        return Ok(JobDisposition::Parked);
    }

    {
        let mut registry = ctx.registry.lock().unwrap();
        let record = registry.entry(&job.mod_id);
        record.status = ModStatus::Downloading;
        record.latest_known_version = Some(meta.version.clone());
        registry.commit()?;
    }

    let operation = operation_of(job);
    ctx.bus.emit_for(&job.mod_id, EventKind::Started { operation });
    let handle = ctx.progress.begin(job.mod_id.clone(), operation);
    handle.set_total(meta.size_bytes);

    let dest = ctx.archive_dest(&job.mod_id);
    let progress_callback: TransferCallback = {
        let handle = handle.clone();
        let bus = ctx.bus.clone();
        let mod_id = job.mod_id.clone();
        Arc::new(move |transferred, total| {
            if let Some(total) = total {
                handle.set_total(total);
            }
            handle.record_transferred(transferred);
            bus.emit_for(
                &mod_id,
                EventKind::Progressing {
                    operation,
                    bytes_transferred: transferred,
                    bytes_total: total,
                },
            );
        })
    };

    let size = ctx
        .transport
        .download(&meta.download_url, &dest, Some(progress_callback), cancel)
        .await?;

    // Corrupt artifacts are discarded; the next pass re-derives the job.
    if let Err(err) = install::verify_archive(&dest, meta.checksum.as_deref()).await {
        tokio::fs::remove_file(&dest).await.ok();
        return Err(err);
    }
    handle.mark_completed();

    // Disk work is done; the registry commit comes last.
    {
        let mut registry = ctx.registry.lock().unwrap();
        let record = registry.entry(&job.mod_id);
        record.archive_path = Some(dest);
        record.downloaded_version = Some(meta.version.clone());
        record.size_bytes = size;
        record.status = ModStatus::Queued;
        record.referencing_users.insert(job.initiating_user.clone());
        registry.commit()?;
    }
    ctx.bus.emit_for(&job.mod_id, EventKind::Downloaded);
    Ok(JobDisposition::Succeeded)
}

async fn run_install(
    ctx: &ExecutorContext,
    job: &Job,
    cancel: &CancellationToken,
) -> Result<JobDisposition> {
    let (archive_path, size_bytes, was_installed) = {
        let registry = ctx.registry.lock().unwrap();
        let record = registry
            .get(&job.mod_id)
            .ok_or_else(|| ModError::Registry(format!("no record for {}", job.mod_id)))?;
        let archive = record
            .archive_path
            .clone()
            .ok_or_else(|| ModError::Registry(format!("no archive for {}", job.mod_id)))?;
        (archive, record.size_bytes, record.installed_version.is_some())
    };

    let required = ctx.config.required_bytes(size_bytes);
    if !ctx.disk.has_space_for(&ctx.config.install_dir, required) {
        let available = ctx.disk.available_space(&ctx.config.install_dir);
        {
            let mut registry = ctx.registry.lock().unwrap();
            registry.entry(&job.mod_id).status = ModStatus::InsufficientSpace;
            registry.commit()?;
        }
        ctx.bus.emit_for(
            &job.mod_id,
            EventKind::InsufficientSpace { required, available },
        );
        return Ok(JobDisposition::Parked);
    }

    // Cancellation checkpoint before extraction starts; extraction itself
    // is never interrupted mid-write.
    if cancel.is_cancelled() {
        return Err(ModError::Cancelled {
            reason: format!("install of {} cancelled before extraction", job.mod_id),
        });
    }

    {
        let mut registry = ctx.registry.lock().unwrap();
        registry.entry(&job.mod_id).status = ModStatus::Installing;
        registry.commit()?;
    }
    ctx.bus.emit_for(
        &job.mod_id,
        EventKind::Started {
            operation: OperationKind::Install,
        },
    );
    let handle = ctx.progress.begin(job.mod_id.clone(), OperationKind::Install);
    handle.set_total(size_bytes);

    let published = install::stage_and_publish(
        ctx.archive.as_ref(),
        &archive_path,
        &ctx.config.staging_dir,
        &ctx.config.install_dir,
        job.mod_id.as_str(),
    )
    .await?;
    handle.record_transferred(size_bytes);
    handle.mark_completed();

    {
        let mut registry = ctx.registry.lock().unwrap();
        let record = registry.entry(&job.mod_id);
        record.extracted_path = Some(published);
        record.installed_version = record.downloaded_version.clone();
        record.status = ModStatus::Installed;
        record.referencing_users.insert(job.initiating_user.clone());
        registry.commit()?;
    }
    ctx.bus.emit_for(
        &job.mod_id,
        if was_installed {
            EventKind::Updated
        } else {
            EventKind::Installed
        },
    );
    Ok(JobDisposition::Succeeded)
}

async fn run_uninstall(
    ctx: &ExecutorContext,
    job: &Job,
    force: bool,
) -> Result<JobDisposition> {
    ctx.bus.emit_for(
        &job.mod_id,
        EventKind::Started {
            operation: OperationKind::Uninstall,
        },
    );

    let (orphaned, archive_path, extracted_path) = {
        let mut registry = ctx.registry.lock().unwrap();
        let Some(record) = registry.get_mut(&job.mod_id) else {
            debug!("uninstall for unknown mod {}, nothing to do", job.mod_id);
            return Ok(JobDisposition::Succeeded);
        };
        if force {
            record.referencing_users.clear();
        } else {
            let user = job.initiating_user.clone();
            record.referencing_users.remove(&user);
        }
        (
            record.is_orphaned(),
            record.archive_path.clone(),
            record.extracted_path.clone(),
        )
    };

    if orphaned {
        // Last reference gone: the files follow. Deletion happens before
        // the registry commit so the registry never claims files that are
        // already gone only transiently.
        install::delete_mod_files(archive_path.as_deref(), extracted_path.as_deref()).await?;
        let mut registry = ctx.registry.lock().unwrap();
        if let Some(record) = registry.get_mut(&job.mod_id) {
            record.archive_path = None;
            record.extracted_path = None;
            record.installed_version = None;
            record.downloaded_version = None;
            record.size_bytes = 0;
            record.status = ModStatus::NotInstalled;
        }
        registry.commit()?;
    } else {
        let registry = ctx.registry.lock().unwrap();
        registry.commit()?;
    }

    ctx.bus.emit_for(&job.mod_id, EventKind::Uninstalled);
    Ok(JobDisposition::Succeeded)
}
