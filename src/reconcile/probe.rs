//! Status probes: where the reconciliation loop gets its sandbox status from.

use crate::error::{SyncError, SyncResult};
use crate::model::StatusCheckResult;
use async_trait::async_trait;

/// One remote health probe for a project's sandbox.
///
/// Errors are counted by the loop; they never stop it.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn probe(&self, project_id: &str) -> SyncResult<StatusCheckResult>;
}

/// Polls a status endpoint over HTTP:
/// `GET {base}/api/projects/{id}/sandbox/status`.
pub struct HttpStatusProbe {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpStatusProbe {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::TransientProvider(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl StatusProbe for HttpStatusProbe {
    async fn probe(&self, project_id: &str) -> SyncResult<StatusCheckResult> {
        let url = format!(
            "{}/api/projects/{}/sandbox/status",
            self.base_url,
            urlencoding::encode(project_id)
        );

        let mut request = self.http.get(&url);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::RemoteTimeout(format!("status request timed out: {e}"))
            } else {
                SyncError::TransientProvider(format!("status request failed: {e}"))
            }
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(format!("project {project_id}")));
        }
        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable>".to_string());
        if !status.is_success() {
            return Err(SyncError::Remote(format!(
                "status endpoint returned {status}: {body}"
            )));
        }

        let result: StatusCheckResult = serde_json::from_str(&body)
            .map_err(|e| SyncError::Remote(format!("unparseable status response: {e}")))?;
        if !result.success {
            return Err(SyncError::Remote(result.message));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionRequired, SandboxStatus};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn parses_status_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/projects/p1/sandbox/status"))
            .and(header("Authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "status": "expired",
                "sandbox": {
                    "sandboxId": "sb-1",
                    "url": null,
                    "startTime": "2026-01-01T10:00:00Z",
                    "endTime": "2026-01-01T10:10:00Z",
                    "remainingTimeMinutes": 0
                },
                "message": "Sandbox lease has expired",
                "actionRequired": "sync_needed"
            })))
            .mount(&server)
            .await;

        let probe = HttpStatusProbe::new(server.uri(), Some("t0k".into())).unwrap();
        let result = probe.probe("p1").await.unwrap();
        assert_eq!(result.status, SandboxStatus::Expired);
        assert_eq!(result.action_required, ActionRequired::SyncNeeded);
        assert_eq!(result.sandbox.unwrap().sandbox_id, "sb-1");
    }

    #[tokio::test]
    async fn non_success_responses_are_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/projects/p1/sandbox/status"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/projects/p2/sandbox/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "status": "not_found",
                "message": "provider unreachable",
                "actionRequired": "sync_needed"
            })))
            .mount(&server)
            .await;

        let probe = HttpStatusProbe::new(server.uri(), None).unwrap();
        assert!(matches!(probe.probe("p1").await, Err(SyncError::Remote(_))));
        assert_eq!(
            probe.probe("p2").await.unwrap_err(),
            SyncError::Remote("provider unreachable".into())
        );
    }
}
