//! Public facade over the mod management core
//!
//! `ModManager` wires the registry, catalog, transport, archive engine and
//! disk guard together and owns the background executor. All methods are
//! safe to call from any task at any time, including while a job runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::archive::{ArchiveEngine, GzipArchiveEngine};
use crate::config::ModKitConfig;
use crate::error::{FileOperation, ModError, Result};
use crate::events::{EventBus, EventCallback, EventKind, SubscriberId};
use crate::progress::{ProgressSlot, ProgressSnapshot};
use crate::queue::{Command, ExecutorContext, JobExecutor};
use crate::reconcile::{self, Job, JobKind};
use crate::registry::{LocalRegistry, ModId, ModRecord, ModStatus, ProfileId};
use crate::remote::{CatalogClient, DesiredState, HttpCatalogClient};
use crate::session::Session;
use crate::storage::{DiskGuard, SystemDiskGuard};
use crate::transport::{HttpTransport, Transport};

/// Orchestrates mod state reconciliation for the host application
pub struct ModManager {
    config: ModKitConfig,
    registry: Arc<Mutex<LocalRegistry>>,
    catalog: Arc<dyn CatalogClient>,
    bus: EventBus,
    progress: ProgressSlot,
    executor: JobExecutor,
    enabled: AtomicBool,
    session: Mutex<Option<Session>>,
}

impl ModManager {
    /// Build a manager with explicit collaborators
    ///
    /// Loads (and startup-validates) the registry, then spawns the
    /// executor, so this must run inside a tokio runtime.
    pub fn new(
        config: ModKitConfig,
        catalog: Arc<dyn CatalogClient>,
        transport: Arc<dyn Transport>,
        archive: Arc<dyn ArchiveEngine>,
        disk: Arc<dyn DiskGuard>,
    ) -> Result<Self> {
        let registry = Arc::new(Mutex::new(LocalRegistry::load(&config.registry_path)?));

        // A crash mid-extraction strands temp dirs under staging; nothing
        // in there ever outlives a run, so clear it wholesale.
        if config.staging_dir.exists() {
            std::fs::remove_dir_all(&config.staging_dir)
                .map_err(|e| ModError::io(&config.staging_dir, FileOperation::Delete, e))?;
        }

        let bus = EventBus::new();
        let progress = ProgressSlot::new();
        let executor = JobExecutor::spawn(ExecutorContext {
            config: config.clone(),
            registry: registry.clone(),
            transport,
            archive,
            disk,
            bus: bus.clone(),
            progress: progress.clone(),
        });
        Ok(Self {
            config,
            registry,
            catalog,
            bus,
            progress,
            executor,
            enabled: AtomicBool::new(false),
            session: Mutex::new(None),
        })
    }

    /// Build a manager against a live catalog service with the default
    /// HTTP transport, gzip archive engine and system disk guard
    pub fn with_defaults(config: ModKitConfig, catalog_base_url: &str) -> Result<Self> {
        let catalog = Arc::new(HttpCatalogClient::new(&config, catalog_base_url)?);
        let transport = Arc::new(HttpTransport::new(&config)?);
        Self::new(
            config,
            catalog,
            transport,
            Arc::new(GzipArchiveEngine::new()),
            Arc::new(SystemDiskGuard::new()),
        )
    }

    // --- session/auth gate ---

    /// Turn mod management on for an authenticated session
    ///
    /// Creates the local profile on first authentication under this
    /// identifier. Reconciliation starts with the next [`Self::sync`].
    pub fn enable_management(
        &self,
        session: Session,
        callback: Option<EventCallback>,
    ) -> Result<Option<SubscriberId>> {
        let subscriber = callback.map(|cb| self.bus.subscribe(cb));
        {
            let mut registry = self.registry.lock().unwrap();
            registry.ensure_profile(&session.user);
            registry.commit()?;
        }
        *self.session.lock().unwrap() = Some(session);
        self.enabled.store(true, Ordering::SeqCst);
        self.bus.emit_global(EventKind::ManagementEnabled);
        Ok(subscriber)
    }

    /// Turn mod management off: cancels the in-flight job and clears the
    /// queue. The registry and everything on disk stay untouched.
    pub fn disable_management(&self) -> Result<()> {
        self.enabled.store(false, Ordering::SeqCst);
        self.executor.send(Command::CancelAll);
        self.bus.emit_global(EventKind::ManagementDisabled);
        Ok(())
    }

    /// Sign the current session out; installed mods remain for re-auth
    pub fn sign_out(&self) -> Result<()> {
        self.disable_management()?;
        *self.session.lock().unwrap() = None;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn current_session(&self) -> Result<Session> {
        if !self.is_enabled() {
            return Err(ModError::ManagementDisabled);
        }
        self.session
            .lock()
            .unwrap()
            .clone()
            .ok_or(ModError::ManagementDisabled)
    }

    // --- reconciliation ---

    /// Fetch desired state and drive reconciliation passes until actual
    /// state converges (or a pass makes no further progress)
    pub async fn sync(&self) -> Result<()> {
        let session = self.current_session()?;
        let desired = Arc::new(self.catalog.fetch_desired_state(&session).await?);
        self.absorb_desired_state(&desired)?;

        let mut previous: Option<Vec<Job>> = None;
        loop {
            let jobs = {
                let registry = self.registry.lock().unwrap();
                reconcile::diff(&desired, &registry, &desired.user)
            };
            if jobs.is_empty() {
                break;
            }
            if previous.as_ref() == Some(&jobs) {
                // Failed jobs re-derive identically; one retry per pass,
                // never a retry storm inside one sync.
                debug!("reconciliation made no progress, stopping this sync");
                break;
            }
            previous = Some(jobs.clone());
            self.executor.send(Command::RunJobs {
                desired: Some(desired.clone()),
                jobs,
            });
            self.executor.wait_idle().await;
        }
        Ok(())
    }

    /// Align local intent with the remote snapshot and surface available
    /// updates. Intent is the sole source of truth for what should exist;
    /// this is where it gets written.
    fn absorb_desired_state(&self, desired: &DesiredState) -> Result<()> {
        let mut updates = Vec::new();
        {
            let mut registry = self.registry.lock().unwrap();
            registry.ensure_profile(&desired.user);

            for mod_id in &desired.subscriptions {
                if registry.intent_for(&desired.user, mod_id).is_none() {
                    registry.set_intent(&desired.user, mod_id, true);
                }
                // A subscription to a mod some other profile already
                // installed only needs a reference, not a job.
                if let Some(record) = registry.get(mod_id) {
                    if record.is_installed() && !record.referencing_users.contains(&desired.user) {
                        registry.add_reference(mod_id, &desired.user);
                    }
                }
                if let (Some(record), Some(meta)) =
                    (registry.get_mut(mod_id), desired.mods.get(mod_id))
                {
                    if record.is_installed()
                        && record.installed_version.as_deref() != Some(meta.version.as_str())
                    {
                        record.status = ModStatus::UpdateAvailable;
                        record.latest_known_version = Some(meta.version.clone());
                        updates.push((mod_id.clone(), meta.version.clone()));
                    }
                }
            }

            let stale: Vec<ModId> = registry
                .intents_for(&desired.user)
                .into_iter()
                .map(|intent| intent.mod_id)
                .filter(|mod_id| !desired.subscriptions.contains(mod_id))
                .collect();
            for mod_id in stale {
                registry.remove_intent(&desired.user, &mod_id);
            }
            registry.commit()?;
        }

        for (mod_id, version) in updates {
            self.bus
                .emit_for(&mod_id, EventKind::UpdateAvailable { version });
        }
        Ok(())
    }

    // --- direct controls ---

    /// Promote a mod to the front of the queue, preempting a different
    /// in-flight download
    pub fn download_now(&self, mod_id: &ModId) -> Result<()> {
        let session = self.current_session()?;
        self.executor.send(Command::DownloadNow {
            mod_id: mod_id.clone(),
            user: session.user,
        });
        Ok(())
    }

    /// Remove a mod from disk regardless of anyone's subscription intent
    pub fn force_uninstall(&self, mod_id: &ModId) -> Result<()> {
        let session = self.current_session()?;
        self.executor.send(Command::ForceUninstall {
            mod_id: mod_id.clone(),
            user: session.user,
        });
        Ok(())
    }

    /// Flip the per-user enablement flag; independent of subscription, so
    /// a mod can stay installed but inactive for this user
    pub fn set_mod_enabled(&self, mod_id: &ModId, enabled: bool) -> Result<()> {
        let session = self.current_session()?;
        let mut registry = self.registry.lock().unwrap();
        registry.set_intent(&session.user, mod_id, enabled);
        registry.commit()
    }

    /// Remove one local user's data: their subscription intents disappear
    /// and uninstall jobs release their references, deleting mods no one
    /// else references
    pub fn remove_user_data(&self, user: &ProfileId) -> Result<()> {
        if !self.is_enabled() {
            return Err(ModError::ManagementDisabled);
        }
        let referenced: Vec<ModId> = {
            let mut registry = self.registry.lock().unwrap();
            let referenced = registry
                .records()
                .filter(|record| record.referencing_users.contains(user))
                .map(|record| record.mod_id.clone())
                .collect();
            registry.remove_profile(user);
            registry.commit()?;
            referenced
        };
        let jobs: Vec<Job> = referenced
            .into_iter()
            .map(|mod_id| Job::new(JobKind::Uninstall { force: false }, mod_id, user.clone()))
            .collect();
        if !jobs.is_empty() {
            // Uninstalls never consult catalog metadata; keep whatever
            // desired snapshot a concurrent sync may be running under.
            self.executor.send(Command::RunJobs {
                desired: None,
                jobs,
            });
        }
        Ok(())
    }

    /// Wait for the queue to drain; useful after direct controls
    pub async fn wait_idle(&self) {
        self.executor.wait_idle().await;
    }

    // --- observers & queries ---

    pub fn subscribe_events(&self, callback: EventCallback) -> SubscriberId {
        self.bus.subscribe(callback)
    }

    pub fn unsubscribe_events(&self, id: SubscriberId) {
        self.bus.unsubscribe(id);
    }

    /// Snapshot of the single in-flight operation, if any
    pub fn current_progress(&self) -> Option<ProgressSnapshot> {
        self.progress.snapshot()
    }

    pub fn subscribed_mods(&self, user: &ProfileId) -> Vec<ModId> {
        let registry = self.registry.lock().unwrap();
        registry
            .intents_for(user)
            .into_iter()
            .map(|intent| intent.mod_id)
            .collect()
    }

    /// Mods the session user holds entitlements for, per the catalog
    pub async fn purchased_mods(&self) -> Result<Vec<ModId>> {
        let session = self.current_session()?;
        let desired = self.catalog.fetch_desired_state(&session).await?;
        Ok(desired.entitlements.into_iter().collect())
    }

    pub fn installed_mods(&self, user: &ProfileId, include_disabled: bool) -> Vec<ModRecord> {
        self.registry
            .lock()
            .unwrap()
            .list_installed(user, include_disabled)
    }

    /// Status as seen by one user; `Installing` means not yet usable
    pub fn status_of(&self, mod_id: &ModId, user: &ProfileId) -> ModStatus {
        self.registry.lock().unwrap().status_for_user(mod_id, user)
    }

    pub fn record_of(&self, mod_id: &ModId) -> Option<ModRecord> {
        self.registry.lock().unwrap().get(mod_id).cloned()
    }

    pub fn config(&self) -> &ModKitConfig {
        &self.config
    }
}
