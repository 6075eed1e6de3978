//! Configuration types for the mod management core

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the mod manager and its collaborators
#[derive(Debug, Clone)]
pub struct ModKitConfig {
    /// Directory where downloaded archives are kept
    pub downloads_dir: PathBuf,
    /// Directory where extracted mods are published
    pub install_dir: PathBuf,
    /// Directory for in-flight extraction before atomic publish
    pub staging_dir: PathBuf,
    /// Path of the persisted registry file
    pub registry_path: PathBuf,
    pub user_agent: String,
    /// HTTP timeout for catalog calls
    pub timeout: Duration,
    /// Whether interrupted downloads resume from their partial artifact
    pub allow_resume: bool,
    /// Chunk size for resumable artifact uploads
    pub upload_chunk_size: usize,
    /// Upper bound on waiting for an external device-code authentication
    pub auth_timeout: Duration,
    /// Extra headroom demanded on top of a job's byte requirement
    pub space_headroom: u64,
}

impl ModKitConfig {
    /// Root all directories and the registry file under a single data dir
    pub fn rooted_at(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            downloads_dir: data_dir.join("downloads"),
            install_dir: data_dir.join("mods"),
            staging_dir: data_dir.join("staging"),
            registry_path: data_dir.join("registry.json"),
            ..Self::default()
        }
    }

    /// Bytes required on disk for a job, headroom included
    pub fn required_bytes(&self, payload: u64) -> u64 {
        payload.saturating_add(self.space_headroom)
    }
}

impl Default for ModKitConfig {
    fn default() -> Self {
        Self {
            downloads_dir: PathBuf::from("./downloads"),
            install_dir: PathBuf::from("./mods"),
            staging_dir: PathBuf::from("./staging"),
            registry_path: PathBuf::from("./registry.json"),
            user_agent: "modkit/0.1.0".to_string(),
            timeout: Duration::from_secs(30),
            allow_resume: true,
            upload_chunk_size: 4 * 1024 * 1024, // 4MB chunks, each acknowledged
            auth_timeout: Duration::from_secs(15 * 60),
            space_headroom: 0,
        }
    }
}

/// Builder for [`ModKitConfig`]
#[derive(Debug, Default)]
pub struct ModKitConfigBuilder {
    config: ModKitConfig,
}

impl ModKitConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downloads_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.downloads_dir = dir.into();
        self
    }

    pub fn install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.install_dir = dir.into();
        self
    }

    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.staging_dir = dir.into();
        self
    }

    pub fn registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.registry_path = path.into();
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = agent.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn allow_resume(mut self, allow: bool) -> Self {
        self.config.allow_resume = allow;
        self
    }

    pub fn upload_chunk_size(mut self, bytes: usize) -> Self {
        self.config.upload_chunk_size = bytes;
        self
    }

    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.config.auth_timeout = timeout;
        self
    }

    pub fn space_headroom(mut self, bytes: u64) -> Self {
        self.config.space_headroom = bytes;
        self
    }

    pub fn build(self) -> ModKitConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_config_places_everything_under_data_dir() {
        let config = ModKitConfig::rooted_at("/var/lib/game");
        assert_eq!(config.downloads_dir, PathBuf::from("/var/lib/game/downloads"));
        assert_eq!(config.install_dir, PathBuf::from("/var/lib/game/mods"));
        assert_eq!(config.registry_path, PathBuf::from("/var/lib/game/registry.json"));
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = ModKitConfigBuilder::new()
            .user_agent("host-game/2.1")
            .allow_resume(false)
            .space_headroom(1024)
            .build();
        assert_eq!(config.user_agent, "host-game/2.1");
        assert!(!config.allow_resume);
        assert_eq!(config.required_bytes(100), 1124);
    }
}
