//! Mod Management SDK
//!
//! This library lets a host application (a game) browse, subscribe to and
//! run third-party mods hosted on a remote catalog service. Its core
//! reconciles a user's desired mod set against local disk state and drives
//! that reconciliation through a serialized queue of resumable,
//! cancellable jobs, while multiple local user profiles share installed
//! content through reference counting.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use modkit::{Event, EventKind, ModKitConfig, ModManager, Session};
//! use std::sync::Arc;
//!
//! # async fn example() -> modkit::Result<()> {
//! // Point the SDK at a data directory and the catalog service.
//! let config = ModKitConfig::rooted_at("/var/lib/game/modkit");
//! let manager = ModManager::with_defaults(config, "https://catalog.example")?;
//!
//! // Observe lifecycle events (UI, logging).
//! manager.subscribe_events(Arc::new(|event: &Event| {
//!     match &event.kind {
//!         EventKind::Installed => println!("installed: {:?}", event.mod_id),
//!         EventKind::InsufficientSpace { required, available } => {
//!             println!("need {} bytes, only {} free", required, available);
//!         }
//!         _ => {}
//!     }
//! }));
//!
//! // Enable management for an authenticated session and converge.
//! let session = Session {
//!     user: "local-profile-1".into(),
//!     access_token: "token".into(),
//! };
//! manager.enable_management(session, None)?;
//! manager.sync().await?;
//!
//! // Poll the single in-flight operation, if any.
//! if let Some(progress) = manager.current_progress() {
//!     println!("{}: {} bytes", progress.operation, progress.bytes_transferred);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Idempotent reconciliation**: jobs are re-derived from a diff of
//!   desired vs. actual state, never persisted, so restarts recover cleanly
//! - **Serialized execution**: at most one job in flight, with a single
//!   live progress handle
//! - **Shared installs**: reference-counted across local user profiles;
//!   files are deleted only when the last reference drops
//! - **Atomic publishes**: extraction stages into a temp location and
//!   appears with a single rename
//! - **Typed failure events**: insufficient space is distinguishable from
//!   corruption, network failure and I/O failure
//! - **Cooperative cancellation**: observed between transfer chunks and
//!   before extraction, never mid-write

pub mod archive;
pub mod config;
pub mod error;
pub mod events;
pub mod install;
pub mod manager;
pub mod progress;
pub mod reconcile;
pub mod registry;
pub mod remote;
pub mod session;
pub mod storage;
pub mod transport;

mod queue;

// Re-export commonly used types for convenience
pub use archive::{ArchiveEngine, GzipArchiveEngine};
pub use config::{ModKitConfig, ModKitConfigBuilder};
pub use error::{FailureKind, FileOperation, ModError, Result};
pub use events::{Event, EventBus, EventCallback, EventKind, OperationKind, SubscriberId};
pub use manager::ModManager;
pub use progress::{ProgressHandle, ProgressSnapshot};
pub use reconcile::{Job, JobKind, diff};
pub use registry::{
    LocalRegistry, ModId, ModRecord, ModStatus, ProfileId, SubscriptionIntent,
};
pub use remote::{CatalogClient, DesiredState, HttpCatalogClient, RemoteMod};
pub use session::{
    AuthProvider, DeviceAuthFlow, DeviceCode, Session, authenticate_with_device_code,
};
pub use storage::{DiskGuard, FixedDiskGuard, SystemDiskGuard};
pub use transport::{HttpTransport, TransferCallback, Transport, upload_archive};
