//! Sync orchestrator: bring a project's sandbox back in line with durable state.
//!
//! A resync resumes the project's session if its lease is still live (and
//! extends it), otherwise creates a new one, then pushes every durable file into
//! the sandbox and runs the bootstrap commands. One resync per project runs at a
//! time; a second request for the same project waits for the running one and
//! gets its result.

use super::files::{FileSync, ReplaceOutcome};
use crate::error::{SyncError, SyncResult};
use crate::model::{ChangeType, FileMap, SandboxSession};
use crate::reconcile::SyncRequired;
use crate::sandbox::{ProviderError, SandboxClient, SessionRegistry};
use crate::store::ProjectStore;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub template: String,
    /// Lease length for new sessions, and for resumed ones.
    pub timeout_ms: u64,
    pub workdir: String,
    pub preview_port: u16,
    pub bootstrap_commands: Vec<String>,
    pub command_timeout_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            template: "code-interpreter-v1".to_string(),
            timeout_ms: 600_000,
            workdir: "/home/user/project".to_string(),
            preview_port: 3000,
            bootstrap_commands: vec!["npm install".to_string()],
            command_timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub project_id: String,
    pub session: SandboxSession,
    /// `true` when an existing session was reused rather than created.
    pub resumed: bool,
    pub files_pushed: usize,
    pub version: i64,
}

type SharedSync = Shared<BoxFuture<'static, SyncResult<SyncReport>>>;

pub struct SyncOrchestrator {
    provider: Arc<dyn SandboxClient>,
    store: Arc<dyn ProjectStore>,
    registry: Arc<SessionRegistry>,
    files: FileSync,
    settings: OrchestratorSettings,
    in_flight: Mutex<HashMap<(String, String), SharedSync>>,
}

impl SyncOrchestrator {
    pub fn new(
        provider: Arc<dyn SandboxClient>,
        store: Arc<dyn ProjectStore>,
        registry: Arc<SessionRegistry>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            files: FileSync::new(Arc::clone(&store)),
            provider,
            store,
            registry,
            settings,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Resume or recreate the project's sandbox and push durable files into it.
    pub async fn resync(self: &Arc<Self>, owner_id: &str, project_id: &str) -> SyncResult<SyncReport> {
        let shared = {
            let mut in_flight = self.in_flight.lock();
            let key = (owner_id.to_string(), project_id.to_string());
            if let Some(running) = in_flight.get(&key) {
                tracing::debug!(project_id = %project_id, "waiting for running sync");
                running.clone()
            } else {
                let this = Arc::clone(self);
                let (owner, project) = key.clone();
                let fut = async move {
                    let result = this.run(&owner, &project).await;
                    this.in_flight.lock().remove(&(owner, project));
                    result
                }
                .boxed()
                .shared();
                in_flight.insert(key, fut.clone());
                fut
            }
        };
        shared.await
    }

    async fn run(&self, owner_id: &str, project_id: &str) -> SyncResult<SyncReport> {
        tracing::info!(project_id = %project_id, "sync started");

        let (mut session, resumed) = self.acquire_session(owner_id, project_id).await?;
        self.store
            .save_session(owner_id, project_id, &session)
            .await?;
        self.registry.insert(owner_id, project_id, session.clone());

        let current = self.store.get_files(owner_id, project_id).await?;
        for (path, content) in &current.files {
            let target = self.sandbox_path(path);
            self.provider
                .write_file(&session.session_id, &target, content)
                .await?;
        }
        tracing::info!(
            project_id = %project_id,
            session_id = %session.session_id,
            files = current.files.len(),
            "project files pushed to sandbox"
        );

        for command in &self.settings.bootstrap_commands {
            let output = self
                .provider
                .run_command(
                    &session.session_id,
                    command,
                    &self.settings.workdir,
                    self.settings.command_timeout_ms,
                )
                .await?;
            if output.exit_code != 0 {
                tracing::warn!(
                    project_id = %project_id,
                    command = %command,
                    exit_code = output.exit_code,
                    "bootstrap command failed"
                );
                return Err(SyncError::Remote(format!(
                    "`{command}` exited with code {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                )));
            }
        }

        match self
            .provider
            .get_preview_url(&session.session_id, self.settings.preview_port)
            .await
        {
            Ok(url) => session.preview_url = Some(url),
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "preview URL unavailable");
            }
        }
        self.store
            .save_session(owner_id, project_id, &session)
            .await?;
        self.registry.insert(owner_id, project_id, session.clone());

        tracing::info!(
            project_id = %project_id,
            session_id = %session.session_id,
            resumed,
            version = current.version,
            "sync finished"
        );
        Ok(SyncReport {
            project_id: project_id.to_string(),
            session,
            resumed,
            files_pushed: current.files.len(),
            version: current.version,
        })
    }

    /// Live session extended to a fresh lease, or a newly created one.
    async fn acquire_session(
        &self,
        owner_id: &str,
        project_id: &str,
    ) -> SyncResult<(SandboxSession, bool)> {
        let known = match self.registry.get(owner_id, project_id) {
            Some(session) => Some(session),
            None => self.store.load_session(owner_id, project_id).await?,
        };

        if let Some(previous) = known {
            let probed = self.provider.get_info(&previous.session_id).await;
            match probed {
                Ok(info) if Utc::now() < info.end_at => {
                    let now = Utc::now();
                    self.provider
                        .set_timeout(&previous.session_id, self.settings.timeout_ms)
                        .await?;
                    let mut session = info.into_session(previous.preview_url);
                    session.end_time = now + Duration::milliseconds(self.settings.timeout_ms as i64);
                    tracing::info!(
                        project_id = %project_id,
                        session_id = %session.session_id,
                        "resuming sandbox session"
                    );
                    return Ok((session, true));
                }
                Ok(_) => {
                    if let Err(e) = self.provider.kill_sandbox(&previous.session_id).await {
                        tracing::debug!(session_id = %previous.session_id, error = %e, "kill of expired sandbox failed");
                    }
                }
                Err(ProviderError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let info = self
            .provider
            .create_sandbox(&self.settings.template, self.settings.timeout_ms)
            .await?;
        tracing::info!(
            project_id = %project_id,
            session_id = %info.session_id,
            "created sandbox session"
        );
        Ok((info.into_session(None), false))
    }

    /// Pull the sandbox's source files back into durable storage.
    pub async fn capture(&self, owner_id: &str, project_id: &str) -> SyncResult<ReplaceOutcome> {
        let session = match self.registry.get(owner_id, project_id) {
            Some(session) => session,
            None => self
                .store
                .load_session(owner_id, project_id)
                .await?
                .ok_or_else(|| SyncError::NotFound("sandbox session".to_string()))?,
        };

        let collected = self
            .provider
            .collect_snapshot_files(&session.session_id, &self.settings.workdir)
            .await?;

        let root = format!("{}/", self.settings.workdir.trim_end_matches('/'));
        let files: FileMap = collected
            .into_iter()
            .filter_map(|(path, content)| {
                path.strip_prefix(&root)
                    .map(|relative| (relative.to_string(), content))
            })
            .collect();

        if files.is_empty() {
            return Err(SyncError::Validation(format!(
                "no files found in {}",
                self.settings.workdir
            )));
        }

        self.files
            .replace_files_as(owner_id, project_id, files, ChangeType::Sync)
            .await
    }

    /// Terminate the project's sandbox and forget it.
    ///
    /// Ownership is checked against the store before anything is killed.
    pub async fn teardown(&self, owner_id: &str, project_id: &str) -> SyncResult<()> {
        let stored = self.store.load_session(owner_id, project_id).await?;
        let session = self.registry.remove(owner_id, project_id).or(stored);
        if let Some(session) = session {
            self.provider.kill_sandbox(&session.session_id).await?;
            tracing::info!(project_id = %project_id, session_id = %session.session_id, "sandbox terminated");
        }
        self.store.clear_session(owner_id, project_id).await
    }

    fn sandbox_path(&self, relative: &str) -> String {
        format!("{}/{relative}", self.settings.workdir.trim_end_matches('/'))
    }

    /// Sync callback for a status loop checking `owner_id`'s projects.
    pub fn for_owner(self: &Arc<Self>, owner_id: impl Into<String>) -> OwnerSync {
        OwnerSync {
            orchestrator: Arc::clone(self),
            owner_id: owner_id.into(),
        }
    }
}

pub struct OwnerSync {
    orchestrator: Arc<SyncOrchestrator>,
    owner_id: String,
}

#[async_trait]
impl SyncRequired for OwnerSync {
    async fn sync_required(&self, project_id: &str) -> SyncResult<()> {
        self.orchestrator
            .resync(&self.owner_id, project_id)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DependencyMap;
    use crate::sandbox::mock::MockSandbox;
    use crate::store::SqliteStore;
    use std::sync::atomic::Ordering;

    struct Fixture {
        provider: Arc<MockSandbox>,
        store: Arc<SqliteStore>,
        registry: Arc<SessionRegistry>,
        orchestrator: Arc<SyncOrchestrator>,
        project_id: String,
    }

    async fn fixture(files: &[(&str, &str)]) -> Fixture {
        let provider = Arc::new(MockSandbox::default());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = Arc::new(SessionRegistry::new());
        let project = store
            .create_project(
                "owner",
                files
                    .iter()
                    .map(|(p, c)| (p.to_string(), c.to_string()))
                    .collect(),
                DependencyMap::new(),
            )
            .await
            .unwrap();
        let orchestrator = Arc::new(SyncOrchestrator::new(
            provider.clone(),
            store.clone(),
            registry.clone(),
            OrchestratorSettings {
                workdir: "/w".into(),
                ..Default::default()
            },
        ));
        Fixture {
            provider,
            store,
            registry,
            orchestrator,
            project_id: project.id,
        }
    }

    #[tokio::test]
    async fn resync_without_session_creates_and_pushes() {
        let f = fixture(&[("package.json", "{}"), ("src/app/page.tsx", "page")]).await;

        let report = f.orchestrator.resync("owner", &f.project_id).await.unwrap();
        assert!(!report.resumed);
        assert_eq!(report.files_pushed, 2);
        assert_eq!(f.provider.created.load(Ordering::SeqCst), 1);

        let sid = report.session.session_id.clone();
        let written = f.provider.files.lock();
        assert_eq!(written[&(sid.clone(), "/w/src/app/page.tsx".to_string())], "page");
        assert_eq!(written[&(sid.clone(), "/w/package.json".to_string())], "{}");
        drop(written);
        assert_eq!(*f.provider.commands.lock(), vec!["npm install".to_string()]);

        let stored = f
            .store
            .load_session("owner", &f.project_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.session_id, sid);
        assert!(stored.preview_url.unwrap().starts_with("https://3000-"));
        assert_eq!(f.registry.get("owner", &f.project_id).unwrap().session_id, sid);
    }

    #[tokio::test]
    async fn live_session_is_resumed_and_extended() {
        let f = fixture(&[("a.ts", "x")]).await;
        let info = f.provider.add_session("sb-live", Duration::minutes(2));
        f.store
            .save_session("owner", &f.project_id, &info.into_session(None))
            .await
            .unwrap();

        let report = f.orchestrator.resync("owner", &f.project_id).await.unwrap();
        assert!(report.resumed);
        assert_eq!(report.session.session_id, "sb-live");
        assert_eq!(f.provider.created.load(Ordering::SeqCst), 0);
        assert_eq!(f.provider.info_calls.load(Ordering::SeqCst), 1);
        assert!(report.session.remaining_minutes_at(Utc::now()) >= 9);
    }

    #[tokio::test]
    async fn expired_session_is_replaced() {
        let f = fixture(&[("a.ts", "x")]).await;
        let info = f.provider.add_session("sb-old", Duration::minutes(-1));
        f.store
            .save_session("owner", &f.project_id, &info.into_session(None))
            .await
            .unwrap();

        let report = f.orchestrator.resync("owner", &f.project_id).await.unwrap();
        assert!(!report.resumed);
        assert_ne!(report.session.session_id, "sb-old");
        assert!(!f.provider.sessions.lock().contains_key("sb-old"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_resyncs_for_one_project_share_a_run() {
        let f = fixture(&[("a.ts", "x")]).await;
        *f.provider.create_delay.lock() = Some(std::time::Duration::from_secs(3));

        let (a, b) = tokio::join!(
            f.orchestrator.resync("owner", &f.project_id),
            f.orchestrator.resync("owner", &f.project_id)
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(f.provider.created.load(Ordering::SeqCst), 1);
        assert_eq!(f.provider.commands.lock().len(), 1);
        assert!(f.orchestrator.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn failing_bootstrap_fails_the_sync() {
        struct FailingInstall(MockSandbox);

        #[async_trait]
        impl SandboxClient for FailingInstall {
            async fn create_sandbox(&self, t: &str, ms: u64) -> crate::sandbox::ProviderResult<crate::sandbox::SandboxInfo> {
                self.0.create_sandbox(t, ms).await
            }
            async fn get_info(&self, id: &str) -> crate::sandbox::ProviderResult<crate::sandbox::SandboxInfo> {
                self.0.get_info(id).await
            }
            async fn set_timeout(&self, id: &str, ms: u64) -> crate::sandbox::ProviderResult<()> {
                self.0.set_timeout(id, ms).await
            }
            async fn kill_sandbox(&self, id: &str) -> crate::sandbox::ProviderResult<()> {
                self.0.kill_sandbox(id).await
            }
            async fn run_command(
                &self,
                _id: &str,
                _command: &str,
                _workdir: &str,
                _ms: u64,
            ) -> crate::sandbox::ProviderResult<crate::sandbox::CommandOutput> {
                Ok(crate::sandbox::CommandOutput {
                    stdout: String::new(),
                    stderr: "npm ERR! missing script\n".into(),
                    exit_code: 1,
                })
            }
            async fn write_file(&self, id: &str, p: &str, c: &str) -> crate::sandbox::ProviderResult<()> {
                self.0.write_file(id, p, c).await
            }
            async fn read_file(&self, id: &str, p: &str) -> crate::sandbox::ProviderResult<String> {
                self.0.read_file(id, p).await
            }
            async fn list_dir(&self, id: &str, p: &str) -> crate::sandbox::ProviderResult<Vec<crate::sandbox::DirEntry>> {
                self.0.list_dir(id, p).await
            }
            async fn get_preview_url(&self, id: &str, port: u16) -> crate::sandbox::ProviderResult<String> {
                self.0.get_preview_url(id, port).await
            }
        }

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let project = store
            .create_project("owner", FileMap::new(), DependencyMap::new())
            .await
            .unwrap();
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::new(FailingInstall(MockSandbox::default())),
            store,
            Arc::new(SessionRegistry::new()),
            OrchestratorSettings::default(),
        ));

        let err = orchestrator.resync("owner", &project.id).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::Remote("`npm install` exited with code 1: npm ERR! missing script".into())
        );
    }

    #[tokio::test]
    async fn capture_pulls_relative_paths_into_storage() {
        let f = fixture(&[("a.ts", "old")]).await;
        let report = f.orchestrator.resync("owner", &f.project_id).await.unwrap();
        let sid = report.session.session_id;
        for (path, content) in [
            ("/w/a.ts", "edited in sandbox"),
            ("/w/src/new.ts", "new"),
            ("/w/node_modules/x/index.js", "dep"),
        ] {
            f.provider.write_file(&sid, path, content).await.unwrap();
        }

        let outcome = f.orchestrator.capture("owner", &f.project_id).await.unwrap();
        assert_eq!(outcome.file_count, 2);

        let current = f.store.get_files("owner", &f.project_id).await.unwrap();
        assert_eq!(current.files["a.ts"], "edited in sandbox");
        assert_eq!(current.files["src/new.ts"], "new");
        let versions = f
            .store
            .list_versions("owner", &f.project_id, 1, 0)
            .await
            .unwrap();
        assert_eq!(versions[0].change_type, ChangeType::Sync);
    }

    #[tokio::test]
    async fn teardown_kills_and_forgets() {
        let f = fixture(&[("a.ts", "x")]).await;
        let report = f.orchestrator.resync("owner", &f.project_id).await.unwrap();

        f.orchestrator.teardown("owner", &f.project_id).await.unwrap();
        assert!(f.registry.get("owner", &f.project_id).is_none());
        assert!(!f
            .provider
            .sessions
            .lock()
            .contains_key(&report.session.session_id));
        assert!(f
            .store
            .load_session("owner", &f.project_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn foreign_owner_cannot_touch_a_tracked_sandbox() {
        let f = fixture(&[("a.ts", "x")]).await;
        let report = f.orchestrator.resync("owner", &f.project_id).await.unwrap();
        let sid = report.session.session_id.clone();
        f.provider.write_file(&sid, "/w/a.ts", "mine").await.unwrap();

        let err = f
            .orchestrator
            .resync("mallory", &f.project_id)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert_eq!(f.provider.created.load(Ordering::SeqCst), 1);
        assert_eq!(f.provider.commands.lock().len(), 1);

        let err = f
            .orchestrator
            .capture("mallory", &f.project_id)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));

        let err = f
            .orchestrator
            .teardown("mallory", &f.project_id)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));

        assert!(f.provider.sessions.lock().contains_key(&sid));
        assert_eq!(f.registry.get("owner", &f.project_id).unwrap().session_id, sid);
        let stored = f
            .store
            .load_session("owner", &f.project_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.session_id, sid);
        let current = f.store.get_files("owner", &f.project_id).await.unwrap();
        assert_eq!(current.files["a.ts"], "x");
    }
}
