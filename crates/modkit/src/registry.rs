//! Persisted local registry: per-user subscription intent and the
//! device-wide mod install table
//!
//! The registry file is the durable contract across process restarts. Every
//! commit goes through a temp-file write followed by an atomic rename, and
//! callers commit *after* the disk mutation the entry records, so a crash
//! between the two leaves disk truth ahead of the registry, never behind it.
//! The load path reconciles the registry against the filesystem and demotes
//! records whose paths no longer exist.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FileOperation, ModError, Result};

/// Opaque identifier of a mod in the remote catalog
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModId(String);

impl ModId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ModId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ModId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ModId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a local user profile on this device
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(String);

impl ProfileId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProfileId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ProfileId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ProfileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a mod on this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModStatus {
    NotInstalled,
    Queued,
    Downloading,
    Installing,
    Installed,
    UpdateAvailable,
    Disabled,
    InsufficientSpace,
    Failed,
}

impl ModStatus {
    /// Whether the host may treat the mod's extracted files as usable
    pub fn is_usable(self) -> bool {
        matches!(self, ModStatus::Installed | ModStatus::UpdateAvailable)
    }
}

/// What a single local user wants for a single mod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionIntent {
    pub mod_id: ModId,
    pub enabled: bool,
}

/// Device-wide install record for a mod, shared across local users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModRecord {
    pub mod_id: ModId,
    pub installed_version: Option<String>,
    /// Version of the downloaded archive, which may be ahead of the
    /// installed version between a download and its install
    #[serde(default)]
    pub downloaded_version: Option<String>,
    pub latest_known_version: Option<String>,
    pub archive_path: Option<PathBuf>,
    pub extracted_path: Option<PathBuf>,
    pub size_bytes: u64,
    /// The only ownership signal: the record's files are deletable exactly
    /// when this set is empty.
    pub referencing_users: BTreeSet<ProfileId>,
    pub status: ModStatus,
}

impl ModRecord {
    pub fn new(mod_id: ModId) -> Self {
        Self {
            mod_id,
            installed_version: None,
            downloaded_version: None,
            latest_known_version: None,
            archive_path: None,
            extracted_path: None,
            size_bytes: 0,
            referencing_users: BTreeSet::new(),
            status: ModStatus::NotInstalled,
        }
    }

    pub fn is_orphaned(&self) -> bool {
        self.referencing_users.is_empty()
    }

    pub fn is_installed(&self) -> bool {
        self.extracted_path.is_some() && self.status.is_usable()
    }

    /// Whether the installed version lags the latest the catalog reported
    pub fn is_outdated(&self) -> bool {
        match (&self.installed_version, &self.latest_known_version) {
            (Some(installed), Some(latest)) => installed != latest,
            _ => false,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ProfileEntry {
    subscriptions: BTreeMap<ModId, SubscriptionIntent>,
}

/// On-disk document layout, versioned for forward migration
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    profiles: BTreeMap<ProfileId, ProfileEntry>,
    #[serde(default)]
    mods: BTreeMap<ModId, ModRecord>,
}

/// The local registry: in-memory state plus its persistence path
///
/// Mutations are in-memory until [`LocalRegistry::commit`]; the executor
/// commits once per completed disk mutation, keeping registry writes short
/// and lock-scoped.
pub struct LocalRegistry {
    path: PathBuf,
    doc: RegistryDocument,
}

impl LocalRegistry {
    /// Load the registry from disk (or start empty) and validate every
    /// record against filesystem truth before accepting new jobs
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| ModError::io(&path, FileOperation::Read, e))?;
            serde_json::from_str(&raw)?
        } else {
            debug!("no registry at {}, starting empty", path.display());
            RegistryDocument::default()
        };

        let mut registry = Self { path, doc };
        let demoted = registry.validate_against_disk();
        if !demoted.is_empty() {
            warn!("demoted {} registry record(s) with missing files", demoted.len());
            registry.commit()?;
        }
        Ok(registry)
    }

    /// Start an empty registry without touching disk (tests, dry runs)
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            doc: RegistryDocument::default(),
        }
    }

    /// Atomically persist the current state: temp-file write + rename
    pub fn commit(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ModError::io(parent, FileOperation::CreateDir, e))?;
            }
        }
        let raw = serde_json::to_string_pretty(&self.doc)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw).map_err(|e| ModError::io(&tmp, FileOperation::Write, e))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| ModError::io(&self.path, FileOperation::Rename, e))?;
        Ok(())
    }

    /// Check each record's paths against the filesystem, demoting records
    /// whose claims no longer hold. Returns the demoted mod ids.
    pub fn validate_against_disk(&mut self) -> Vec<ModId> {
        let mut demoted = Vec::new();
        for record in self.doc.mods.values_mut() {
            let mut dirty = false;

            if let Some(extracted) = &record.extracted_path {
                if !extracted.exists() {
                    warn!(
                        "registry claims install at {} but nothing is there, demoting {}",
                        extracted.display(),
                        record.mod_id
                    );
                    record.extracted_path = None;
                    record.installed_version = None;
                    dirty = true;
                }
            }
            if let Some(archive) = &record.archive_path {
                if !archive.exists() {
                    record.archive_path = None;
                    dirty = true;
                }
            }
            if dirty {
                if record.extracted_path.is_none() {
                    record.status = ModStatus::NotInstalled;
                }
                demoted.push(record.mod_id.clone());
            } else if matches!(
                record.status,
                ModStatus::Downloading | ModStatus::Installing
            ) {
                // Actively-running statuses cannot survive a restart; the
                // next reconciliation pass re-derives the job. `Queued`
                // stays: its archive was verified above.
                record.status = if record.extracted_path.is_some() {
                    ModStatus::Installed
                } else {
                    ModStatus::NotInstalled
                };
                demoted.push(record.mod_id.clone());
            }
        }
        demoted
    }

    // --- mod table ---

    pub fn get(&self, mod_id: &ModId) -> Option<&ModRecord> {
        self.doc.mods.get(mod_id)
    }

    pub fn get_mut(&mut self, mod_id: &ModId) -> Option<&mut ModRecord> {
        self.doc.mods.get_mut(mod_id)
    }

    pub fn upsert(&mut self, record: ModRecord) {
        self.doc.mods.insert(record.mod_id.clone(), record);
    }

    /// Fetch-or-create the record for a mod
    pub fn entry(&mut self, mod_id: &ModId) -> &mut ModRecord {
        self.doc
            .mods
            .entry(mod_id.clone())
            .or_insert_with(|| ModRecord::new(mod_id.clone()))
    }

    pub fn remove(&mut self, mod_id: &ModId) -> Option<ModRecord> {
        self.doc.mods.remove(mod_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ModRecord> {
        self.doc.mods.values()
    }

    pub fn add_reference(&mut self, mod_id: &ModId, user: &ProfileId) {
        self.entry(mod_id).referencing_users.insert(user.clone());
    }

    /// Drop one user's reference; returns true when the record is now
    /// orphaned and its files are eligible for deletion
    pub fn remove_reference(&mut self, mod_id: &ModId, user: &ProfileId) -> bool {
        match self.doc.mods.get_mut(mod_id) {
            Some(record) => {
                record.referencing_users.remove(user);
                record.is_orphaned()
            }
            None => false,
        }
    }

    /// Installed mods referenced by a user, honoring the user's enablement
    pub fn list_installed(&self, user: &ProfileId, include_disabled: bool) -> Vec<ModRecord> {
        self.doc
            .mods
            .values()
            .filter(|record| record.is_installed() && record.referencing_users.contains(user))
            .filter(|record| include_disabled || self.is_enabled_for(&record.mod_id, user))
            .cloned()
            .collect()
    }

    /// Status of a mod as seen by one user: a mod installed but disabled in
    /// that user's intent projects as `Disabled`
    pub fn status_for_user(&self, mod_id: &ModId, user: &ProfileId) -> ModStatus {
        let Some(record) = self.doc.mods.get(mod_id) else {
            return ModStatus::NotInstalled;
        };
        if record.is_installed() && !self.is_enabled_for(mod_id, user) {
            return ModStatus::Disabled;
        }
        record.status
    }

    // --- profiles & intent ---

    /// Create the profile on first authentication under this identifier
    pub fn ensure_profile(&mut self, user: &ProfileId) {
        self.doc.profiles.entry(user.clone()).or_default();
    }

    pub fn profiles(&self) -> impl Iterator<Item = &ProfileId> {
        self.doc.profiles.keys()
    }

    pub fn intents_for(&self, user: &ProfileId) -> Vec<SubscriptionIntent> {
        self.doc
            .profiles
            .get(user)
            .map(|p| p.subscriptions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn intent_for(&self, user: &ProfileId, mod_id: &ModId) -> Option<&SubscriptionIntent> {
        self.doc
            .profiles
            .get(user)
            .and_then(|p| p.subscriptions.get(mod_id))
    }

    pub fn is_enabled_for(&self, mod_id: &ModId, user: &ProfileId) -> bool {
        self.intent_for(user, mod_id).map(|i| i.enabled).unwrap_or(false)
    }

    pub fn set_intent(&mut self, user: &ProfileId, mod_id: &ModId, enabled: bool) {
        self.doc
            .profiles
            .entry(user.clone())
            .or_default()
            .subscriptions
            .insert(
                mod_id.clone(),
                SubscriptionIntent {
                    mod_id: mod_id.clone(),
                    enabled,
                },
            );
    }

    pub fn remove_intent(&mut self, user: &ProfileId, mod_id: &ModId) {
        if let Some(profile) = self.doc.profiles.get_mut(user) {
            profile.subscriptions.remove(mod_id);
        }
    }

    /// Delete a profile and all of its intents; the caller reconciles the
    /// resulting orphans into uninstall jobs
    pub fn remove_profile(&mut self, user: &ProfileId) {
        self.doc.profiles.remove(user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record_with_files(dir: &Path, mod_id: &str) -> ModRecord {
        let archive = dir.join(format!("{mod_id}.archive"));
        let extracted = dir.join(mod_id);
        std::fs::write(&archive, b"payload").unwrap();
        std::fs::create_dir_all(&extracted).unwrap();
        ModRecord {
            installed_version: Some("1.0".into()),
            latest_known_version: Some("1.0".into()),
            archive_path: Some(archive),
            extracted_path: Some(extracted),
            size_bytes: 7,
            status: ModStatus::Installed,
            ..ModRecord::new(ModId::from(mod_id))
        }
    }

    #[test]
    fn roundtrips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let mut registry = LocalRegistry::empty(&path);
        let mut record = record_with_files(dir.path(), "mod-1");
        record.referencing_users.insert(ProfileId::from("alice"));
        registry.upsert(record);
        registry.set_intent(&ProfileId::from("alice"), &ModId::from("mod-1"), true);
        registry.commit().unwrap();

        let reloaded = LocalRegistry::load(&path).unwrap();
        let record = reloaded.get(&ModId::from("mod-1")).unwrap();
        assert_eq!(record.status, ModStatus::Installed);
        assert!(record.referencing_users.contains(&ProfileId::from("alice")));
        assert!(reloaded.is_enabled_for(&ModId::from("mod-1"), &ProfileId::from("alice")));
    }

    #[test]
    fn load_demotes_records_with_missing_extracted_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let mut registry = LocalRegistry::empty(&path);
        let mut record = record_with_files(dir.path(), "mod-2");
        // Simulate a crash between extraction and cleanup: the install
        // directory vanished but the registry still claims it.
        std::fs::remove_dir_all(record.extracted_path.as_ref().unwrap()).unwrap();
        record.referencing_users.insert(ProfileId::from("alice"));
        registry.upsert(record);
        registry.commit().unwrap();

        let reloaded = LocalRegistry::load(&path).unwrap();
        let record = reloaded.get(&ModId::from("mod-2")).unwrap();
        assert_eq!(record.status, ModStatus::NotInstalled);
        assert!(record.extracted_path.is_none());
        assert!(record.installed_version.is_none());
        // The archive survived, so it is still referenced.
        assert!(record.archive_path.is_some());
    }

    #[test]
    fn load_resets_in_flight_statuses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let mut registry = LocalRegistry::empty(&path);
        let mut record = ModRecord::new(ModId::from("mod-3"));
        record.status = ModStatus::Downloading;
        registry.upsert(record);
        registry.commit().unwrap();

        let reloaded = LocalRegistry::load(&path).unwrap();
        assert_eq!(
            reloaded.get(&ModId::from("mod-3")).unwrap().status,
            ModStatus::NotInstalled
        );
    }

    #[test]
    fn reference_counting_signals_orphans() {
        let dir = tempdir().unwrap();
        let mut registry = LocalRegistry::empty(dir.path().join("registry.json"));
        let mod_id = ModId::from("shared-mod");
        let alice = ProfileId::from("alice");
        let bob = ProfileId::from("bob");

        registry.add_reference(&mod_id, &alice);
        registry.add_reference(&mod_id, &bob);

        assert!(!registry.remove_reference(&mod_id, &alice));
        assert!(registry.get(&mod_id).unwrap().referencing_users.contains(&bob));
        assert!(registry.remove_reference(&mod_id, &bob));
    }

    #[test]
    fn status_projects_disabled_per_user() {
        let dir = tempdir().unwrap();
        let mut registry = LocalRegistry::empty(dir.path().join("registry.json"));
        let mod_id = ModId::from("mod-4");
        let alice = ProfileId::from("alice");
        let bob = ProfileId::from("bob");

        let mut record = record_with_files(dir.path(), "mod-4");
        record.referencing_users.insert(alice.clone());
        record.referencing_users.insert(bob.clone());
        registry.upsert(record);
        registry.set_intent(&alice, &mod_id, true);
        registry.set_intent(&bob, &mod_id, false);

        assert_eq!(registry.status_for_user(&mod_id, &alice), ModStatus::Installed);
        assert_eq!(registry.status_for_user(&mod_id, &bob), ModStatus::Disabled);

        assert_eq!(registry.list_installed(&bob, false).len(), 0);
        assert_eq!(registry.list_installed(&bob, true).len(), 1);
    }
}
