//! Remote state fetcher: subscriptions, purchases and mod metadata
//!
//! Pure read side. The desired-state snapshot is the reconciler's input and
//! never mutates the local registry directly.

use std::collections::{BTreeMap, BTreeSet};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ModKitConfig;
use crate::error::{ModError, Result};
use crate::registry::{ModId, ProfileId};
use crate::session::Session;

/// Catalog metadata for one mod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMod {
    pub mod_id: ModId,
    pub name: String,
    pub version: String,
    pub size_bytes: u64,
    pub download_url: String,
    /// xxHash64 digest of the archive, base64-encoded
    pub checksum: Option<String>,
    #[serde(default)]
    pub paid: bool,
}

/// Snapshot of what *should* exist for the session user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub user: ProfileId,
    pub subscriptions: BTreeSet<ModId>,
    pub mods: BTreeMap<ModId, RemoteMod>,
    /// Purchases/grants for the session user; gates paid downloads
    pub entitlements: BTreeSet<ModId>,
}

impl DesiredState {
    pub fn meta(&self, mod_id: &ModId) -> Result<&RemoteMod> {
        self.mods
            .get(mod_id)
            .ok_or_else(|| ModError::UnknownMod(mod_id.to_string()))
    }

    /// Whether the user may download this mod: free, or paid and granted
    pub fn is_entitled(&self, mod_id: &ModId) -> bool {
        match self.mods.get(mod_id) {
            Some(meta) if meta.paid => self.entitlements.contains(mod_id),
            Some(_) => true,
            None => false,
        }
    }
}

/// Read-only catalog collaborator
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Fetch the desired-state snapshot for the session user.
    /// Safe to call concurrently with job execution.
    async fn fetch_desired_state(&self, session: &Session) -> Result<DesiredState>;
}

/// Wire layout of the catalog's per-user state endpoint
#[derive(Debug, Deserialize)]
struct UserStateResponse {
    subscriptions: Vec<ModId>,
    mods: Vec<RemoteMod>,
    #[serde(default)]
    entitlements: Vec<ModId>,
}

/// Catalog client over the service's HTTP API
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalogClient {
    pub fn new(config: &ModKitConfig, base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(ModError::from)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn fetch_desired_state(&self, session: &Session) -> Result<DesiredState> {
        let url = format!("{}/v1/users/{}/state", self.base_url, session.user);
        debug!("fetching desired state from {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&session.access_token)
            .send()
            .await?;

        if matches!(response.status().as_u16(), 401 | 403) {
            // Propagated upstream, triggers session invalidation.
            return Err(ModError::Authentication(format!(
                "catalog rejected session for user '{}' ({})",
                session.user,
                response.status()
            )));
        }
        let response = response.error_for_status()?;
        let body: UserStateResponse = response.json().await?;

        let mut state = DesiredState {
            user: session.user.clone(),
            ..DesiredState::default()
        };
        state.subscriptions = body.subscriptions.into_iter().collect();
        state.entitlements = body.entitlements.into_iter().collect();
        for meta in body.mods {
            state.mods.insert(meta.mod_id.clone(), meta);
        }
        debug!(
            "desired state for {}: {} subscription(s), {} entitlement(s)",
            state.user,
            state.subscriptions.len(),
            state.entitlements.len()
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session() -> Session {
        Session {
            user: ProfileId::from("alice"),
            access_token: "token-abc".into(),
        }
    }

    #[tokio::test]
    async fn fetches_and_shapes_desired_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/users/alice/state"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "subscriptions": ["mod-42"],
                "mods": [{
                    "mod_id": "mod-42",
                    "name": "Better Textures",
                    "version": "2.0",
                    "size_bytes": 200_000_000u64,
                    "download_url": "https://cdn.example/mod-42",
                    "checksum": "qFQYSrFxT1I=",
                    "paid": true
                }],
                "entitlements": ["mod-42"]
            })))
            .mount(&server)
            .await;

        let client = HttpCatalogClient::new(&ModKitConfig::default(), server.uri()).unwrap();
        let state = client.fetch_desired_state(&session()).await.unwrap();

        assert!(state.subscriptions.contains(&ModId::from("mod-42")));
        assert_eq!(state.meta(&ModId::from("mod-42")).unwrap().version, "2.0");
        assert!(state.is_entitled(&ModId::from("mod-42")));
    }

    #[tokio::test]
    async fn paid_mod_without_grant_is_not_entitled() {
        let mut state = DesiredState::default();
        let meta = RemoteMod {
            mod_id: ModId::from("mod-7"),
            name: "Premium Pack".into(),
            version: "1.0".into(),
            size_bytes: 10,
            download_url: "https://cdn.example/mod-7".into(),
            checksum: None,
            paid: true,
        };
        state.mods.insert(meta.mod_id.clone(), meta);
        assert!(!state.is_entitled(&ModId::from("mod-7")));
    }

    #[tokio::test]
    async fn unauthorized_maps_to_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/users/alice/state"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = HttpCatalogClient::new(&ModKitConfig::default(), server.uri()).unwrap();
        let result = client.fetch_desired_state(&session()).await;
        assert!(matches!(result, Err(ModError::Authentication(_))));
    }
}
