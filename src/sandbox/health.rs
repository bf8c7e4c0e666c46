//! Sandbox health: derive a project's sandbox status from the provider's lease
//! data, and extend leases.

use super::{ProviderError, SandboxClient, SessionRegistry};
use crate::error::{SyncError, SyncResult};
use crate::model::{SandboxSession, StatusCheckResult};
use crate::reconcile::StatusProbe;
use crate::store::ProjectStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

pub struct SandboxHealthClient {
    provider: Arc<dyn SandboxClient>,
    store: Arc<dyn ProjectStore>,
    registry: Arc<SessionRegistry>,
}

impl SandboxHealthClient {
    pub fn new(
        provider: Arc<dyn SandboxClient>,
        store: Arc<dyn ProjectStore>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            provider,
            store,
            registry,
        }
    }

    /// The session tracked for a project: registry first, then the store.
    ///
    /// Registry entries only exist for the owner that recorded them, so a
    /// miss falls through to the store, which rejects foreign owners.
    pub async fn current_session(
        &self,
        owner_id: &str,
        project_id: &str,
    ) -> SyncResult<Option<SandboxSession>> {
        if let Some(session) = self.registry.get(owner_id, project_id) {
            return Ok(Some(session));
        }
        let stored = self.store.load_session(owner_id, project_id).await?;
        if let Some(session) = &stored {
            self.registry.insert(owner_id, project_id, session.clone());
        }
        Ok(stored)
    }

    /// Current status of the project's sandbox.
    ///
    /// A missing session or one the provider no longer knows is `not_found`.
    /// Network and API failures are returned as errors so callers can count them.
    pub async fn check_status(
        &self,
        owner_id: &str,
        project_id: &str,
    ) -> SyncResult<StatusCheckResult> {
        self.check_status_at(owner_id, project_id, Utc::now()).await
    }

    pub(crate) async fn check_status_at(
        &self,
        owner_id: &str,
        project_id: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<StatusCheckResult> {
        let Some(session) = self.current_session(owner_id, project_id).await? else {
            return Ok(StatusCheckResult::not_found(
                "No sandbox session for this project",
            ));
        };

        let info = match self.provider.get_info(&session.session_id).await {
            Ok(info) => info,
            Err(ProviderError::NotFound(_)) => {
                tracing::info!(
                    project_id = %project_id,
                    session_id = %session.session_id,
                    "sandbox no longer exists at provider"
                );
                self.forget(owner_id, project_id).await;
                return Ok(StatusCheckResult::not_found(format!(
                    "Sandbox {} no longer exists",
                    session.session_id
                )));
            }
            Err(e) => return Err(e.into()),
        };

        // The lease may have been extended by someone else; trust the provider.
        let session = info.into_session(session.preview_url);
        self.registry.insert(owner_id, project_id, session.clone());

        if session.is_expired_at(now) {
            Ok(StatusCheckResult::expired(&session, now))
        } else {
            Ok(StatusCheckResult::running(&session, now))
        }
    }

    /// Push the lease end out to `duration` from now.
    pub async fn extend_lease(
        &self,
        owner_id: &str,
        project_id: &str,
        duration: std::time::Duration,
    ) -> SyncResult<SandboxSession> {
        let mut session = self
            .current_session(owner_id, project_id)
            .await?
            .ok_or_else(|| SyncError::NotFound("sandbox session".to_string()))?;

        let duration_ms = u64::try_from(duration.as_millis())
            .map_err(|_| SyncError::Validation("lease duration too large".to_string()))?;
        let now = Utc::now();
        self.provider
            .set_timeout(&session.session_id, duration_ms)
            .await?;

        session.end_time = now + Duration::milliseconds(duration_ms as i64);
        self.registry.insert(owner_id, project_id, session.clone());
        self.store
            .save_session(owner_id, project_id, &session)
            .await?;
        Ok(session)
    }

    async fn forget(&self, owner_id: &str, project_id: &str) {
        self.registry.remove(owner_id, project_id);
        if let Err(e) = self.store.clear_session(owner_id, project_id).await {
            tracing::warn!(project_id = %project_id, error = %e, "failed to clear stored session");
        }
    }

    /// A [`StatusProbe`] that checks projects on behalf of `owner_id`.
    pub fn for_owner(self: &Arc<Self>, owner_id: impl Into<String>) -> OwnerStatusProbe {
        OwnerStatusProbe {
            client: Arc::clone(self),
            owner_id: owner_id.into(),
        }
    }
}

/// In-process status probe bound to one owner.
pub struct OwnerStatusProbe {
    client: Arc<SandboxHealthClient>,
    owner_id: String,
}

#[async_trait]
impl StatusProbe for OwnerStatusProbe {
    async fn probe(&self, project_id: &str) -> SyncResult<StatusCheckResult> {
        self.client.check_status(&self.owner_id, project_id).await
    }
}
