//! Reconciler: diff desired state against the local registry into jobs
//!
//! Jobs are never persisted. On restart the same diff re-derives whatever
//! was in flight, which makes recovery idempotent: a diff over unchanged
//! desired and actual state yields nothing.

use tracing::debug;

use crate::registry::{LocalRegistry, ModId, ModStatus, ProfileId};
use crate::remote::DesiredState;

/// The kind of work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Download,
    Install,
    Update,
    /// `force` bypasses subscription intent and removes every reference
    Uninstall {
        force: bool,
    },
}

/// A unit of work for the executor; consumed exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub kind: JobKind,
    pub mod_id: ModId,
    pub initiating_user: ProfileId,
    pub attempt: u32,
}

impl Job {
    pub fn new(kind: JobKind, mod_id: ModId, initiating_user: ProfileId) -> Self {
        Self {
            kind,
            mod_id,
            initiating_user,
            attempt: 0,
        }
    }
}

/// Statuses with a job actively running; diffing must not produce a second
/// job for them. `Queued` is not in flight: it marks a verified archive
/// waiting for its install, which the diff itself derives.
fn is_in_flight(status: ModStatus) -> bool {
    matches!(status, ModStatus::Downloading | ModStatus::Installing)
}

/// Compute the ordered job list that moves actual state toward desired
/// state for one user.
///
/// Ordering: downloads and updates first, then installs, then uninstalls.
/// Space freed by an uninstall is claimed by a parked download on the next
/// pass; `download_now` promotion reorders within the running queue instead.
pub fn diff(desired: &DesiredState, registry: &LocalRegistry, user: &ProfileId) -> Vec<Job> {
    let mut downloads = Vec::new();
    let mut installs = Vec::new();
    let mut uninstalls = Vec::new();

    for mod_id in &desired.subscriptions {
        let Some(meta) = desired.mods.get(mod_id) else {
            debug!("subscription to {} has no catalog metadata, skipping", mod_id);
            continue;
        };
        let record = registry.get(mod_id);

        let status = record.map(|r| r.status).unwrap_or(ModStatus::NotInstalled);
        if is_in_flight(status) {
            continue;
        }

        match record {
            None => {
                downloads.push(Job::new(JobKind::Download, mod_id.clone(), user.clone()));
            }
            Some(record) => {
                let has_archive = record.archive_path.is_some()
                    && record.downloaded_version.as_deref() == Some(meta.version.as_str());
                let installed_current =
                    record.installed_version.as_deref() == Some(meta.version.as_str());

                if record.extracted_path.is_some() && installed_current {
                    // Fully converged for this mod; nothing but perhaps a
                    // missing reference, which the executor records on
                    // job success and the manager on subscription sync.
                    continue;
                } else if has_archive {
                    installs.push(Job::new(JobKind::Install, mod_id.clone(), user.clone()));
                } else if record.extracted_path.is_some() {
                    // Installed but outdated: fetch the new archive.
                    downloads.push(Job::new(JobKind::Update, mod_id.clone(), user.clone()));
                } else {
                    downloads.push(Job::new(JobKind::Download, mod_id.clone(), user.clone()));
                }
            }
        }
    }

    // References held by this user for mods no longer in the desired set
    // are released; physical deletion is a consequence of the reference
    // set draining, decided by the executor, never requested here.
    for record in registry.records() {
        if !record.referencing_users.contains(user) {
            continue;
        }
        if desired.subscriptions.contains(&record.mod_id) {
            continue;
        }
        if is_in_flight(record.status) {
            continue;
        }
        uninstalls.push(Job::new(
            JobKind::Uninstall { force: false },
            record.mod_id.clone(),
            user.clone(),
        ));
    }

    let mut jobs = downloads;
    jobs.append(&mut installs);
    jobs.append(&mut uninstalls);
    debug!("diff for {} produced {} job(s)", user, jobs.len());
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModRecord;
    use crate::remote::RemoteMod;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn meta(id: &str, version: &str) -> RemoteMod {
        RemoteMod {
            mod_id: ModId::from(id),
            name: id.to_string(),
            version: version.to_string(),
            size_bytes: 100,
            download_url: format!("https://cdn.example/{id}"),
            checksum: None,
            paid: false,
        }
    }

    fn desired_with(user: &str, mods: &[(&str, &str)]) -> DesiredState {
        let mut state = DesiredState {
            user: ProfileId::from(user),
            ..DesiredState::default()
        };
        for (id, version) in mods {
            state.subscriptions.insert(ModId::from(*id));
            state.mods.insert(ModId::from(*id), meta(id, version));
        }
        state
    }

    fn empty_registry() -> LocalRegistry {
        LocalRegistry::empty("unused-registry.json")
    }

    #[test]
    fn fresh_subscription_yields_download() {
        let desired = desired_with("alice", &[("mod-42", "1.0")]);
        let registry = empty_registry();
        let jobs = diff(&desired, &registry, &ProfileId::from("alice"));

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Download);
        assert_eq!(jobs[0].mod_id, ModId::from("mod-42"));
    }

    #[test]
    fn downloaded_archive_yields_install() {
        let desired = desired_with("alice", &[("mod-42", "1.0")]);
        let mut registry = empty_registry();
        let mut record = ModRecord::new(ModId::from("mod-42"));
        record.archive_path = Some(PathBuf::from("/downloads/mod-42.archive"));
        record.downloaded_version = Some("1.0".into());
        registry.upsert(record);

        let jobs = diff(&desired, &registry, &ProfileId::from("alice"));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Install);
    }

    #[test]
    fn outdated_install_yields_update() {
        let desired = desired_with("alice", &[("mod-42", "2.0")]);
        let mut registry = empty_registry();
        let mut record = ModRecord::new(ModId::from("mod-42"));
        record.extracted_path = Some(PathBuf::from("/mods/mod-42"));
        record.installed_version = Some("1.0".into());
        record.status = ModStatus::Installed;
        registry.upsert(record);

        let jobs = diff(&desired, &registry, &ProfileId::from("alice"));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Update);
    }

    #[test]
    fn dropped_subscription_yields_scoped_uninstall() {
        let desired = desired_with("alice", &[]);
        let mut registry = empty_registry();
        let mut record = ModRecord::new(ModId::from("mod-42"));
        record.extracted_path = Some(PathBuf::from("/mods/mod-42"));
        record.installed_version = Some("1.0".into());
        record.status = ModStatus::Installed;
        record.referencing_users =
            BTreeSet::from([ProfileId::from("alice"), ProfileId::from("bob")]);
        registry.upsert(record);

        let jobs = diff(&desired, &registry, &ProfileId::from("alice"));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Uninstall { force: false });
        assert_eq!(jobs[0].initiating_user, ProfileId::from("alice"));
    }

    #[test]
    fn uninstalls_order_after_downloads() {
        let desired = desired_with("alice", &[("mod-new", "1.0")]);
        let mut registry = empty_registry();
        let mut old = ModRecord::new(ModId::from("mod-old"));
        old.extracted_path = Some(PathBuf::from("/mods/mod-old"));
        old.status = ModStatus::Installed;
        old.referencing_users = BTreeSet::from([ProfileId::from("alice")]);
        registry.upsert(old);

        let jobs = diff(&desired, &registry, &ProfileId::from("alice"));
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].kind, JobKind::Download);
        assert_eq!(jobs[1].kind, JobKind::Uninstall { force: false });
    }

    #[test]
    fn in_flight_mods_are_not_diffed_twice() {
        let desired = desired_with("alice", &[("mod-42", "1.0")]);
        let mut registry = empty_registry();
        let mut record = ModRecord::new(ModId::from("mod-42"));
        record.status = ModStatus::Downloading;
        registry.upsert(record);

        let jobs = diff(&desired, &registry, &ProfileId::from("alice"));
        assert!(jobs.is_empty());
    }

    #[test]
    fn converged_state_diffs_to_nothing() {
        let desired = desired_with("alice", &[("mod-42", "1.0")]);
        let mut registry = empty_registry();
        let mut record = ModRecord::new(ModId::from("mod-42"));
        record.extracted_path = Some(PathBuf::from("/mods/mod-42"));
        record.installed_version = Some("1.0".into());
        record.downloaded_version = Some("1.0".into());
        record.archive_path = Some(PathBuf::from("/downloads/mod-42.archive"));
        record.status = ModStatus::Installed;
        record.referencing_users = BTreeSet::from([ProfileId::from("alice")]);
        registry.upsert(record);

        let first = diff(&desired, &registry, &ProfileId::from("alice"));
        assert!(first.is_empty());
        // Idempotence: a second diff over unchanged state is still empty.
        let second = diff(&desired, &registry, &ProfileId::from("alice"));
        assert!(second.is_empty());
    }
}
