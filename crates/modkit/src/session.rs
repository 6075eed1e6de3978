//! Session establishment and the external device-code auth flow
//!
//! Identity providers are collaborators: they take an opaque token and
//! produce a session, or they hand out a device code the end user completes
//! out of band. The core only bounds the wait.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ModError, Result};
use crate::registry::ProfileId;

/// An authenticated session for one local user profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user: ProfileId,
    pub access_token: String,
}

/// Identity-provider collaborator: opaque token in, session out
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, provider_token: &str) -> Result<Session>;
}

/// A pending device-code authentication issued by an external provider
///
/// The host shows `verification_url` and `user_code` to the end user;
/// `cancel` aborts the attempt.
pub struct DeviceCode {
    pub verification_url: String,
    pub user_code: String,
    pub cancel: CancellationToken,
}

/// Provider-side of the device-code flow
#[async_trait]
pub trait DeviceAuthFlow: Send + Sync {
    /// Begin a device-code attempt
    async fn begin(&self) -> Result<DeviceCode>;

    /// Await the user completing the code entry; resolves to a session.
    /// Implementations poll their provider and must observe `cancel`.
    async fn wait(&self, code: &DeviceCode) -> Result<Session>;
}

/// Run a device-code flow to completion, bounded by `timeout`
///
/// A timed-out or cancelled attempt is an authentication failure; nothing
/// about local state changes.
pub async fn authenticate_with_device_code(
    flow: &dyn DeviceAuthFlow,
    timeout: std::time::Duration,
) -> Result<Session> {
    let code = flow.begin().await?;
    debug!(
        "device auth pending: visit {} and enter {}",
        code.verification_url, code.user_code
    );

    let waited = tokio::time::timeout(timeout, flow.wait(&code)).await;
    match waited {
        Ok(result) => result,
        Err(_elapsed) => {
            code.cancel.cancel();
            Err(ModError::Authentication(format!(
                "device code authentication timed out after {}s",
                timeout.as_secs()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct InstantFlow;

    #[async_trait]
    impl DeviceAuthFlow for InstantFlow {
        async fn begin(&self) -> Result<DeviceCode> {
            Ok(DeviceCode {
                verification_url: "https://auth.example/device".into(),
                user_code: "ABCD-1234".into(),
                cancel: CancellationToken::new(),
            })
        }

        async fn wait(&self, _code: &DeviceCode) -> Result<Session> {
            Ok(Session {
                user: ProfileId::from("alice"),
                access_token: "granted".into(),
            })
        }
    }

    struct NeverCompletesFlow;

    #[async_trait]
    impl DeviceAuthFlow for NeverCompletesFlow {
        async fn begin(&self) -> Result<DeviceCode> {
            Ok(DeviceCode {
                verification_url: "https://auth.example/device".into(),
                user_code: "WXYZ-0000".into(),
                cancel: CancellationToken::new(),
            })
        }

        async fn wait(&self, code: &DeviceCode) -> Result<Session> {
            code.cancel.cancelled().await;
            Err(ModError::Authentication("cancelled".into()))
        }
    }

    #[tokio::test]
    async fn successful_flow_yields_session() {
        let session = authenticate_with_device_code(&InstantFlow, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(session.user, ProfileId::from("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn flow_is_bounded_by_timeout() {
        let result =
            authenticate_with_device_code(&NeverCompletesFlow, Duration::from_secs(15 * 60)).await;
        assert!(matches!(result, Err(ModError::Authentication(_))));
    }
}
