//! E2B sandbox provider: HTTP client for the E2B REST API.

use super::{CommandOutput, DirEntry, ProviderError, ProviderResult, SandboxClient, SandboxInfo};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// Base URL for the E2B REST API.
pub const E2B_API_BASE: &str = "https://api.e2b.dev";

/// HTTP client for E2B API calls.
pub struct E2bSandboxClient {
    api_key: String,
    api_base: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SandboxDetail {
    #[serde(rename = "sandboxID", alias = "sandbox_id")]
    sandbox_id: String,
    #[serde(default, rename = "startedAt", alias = "started_at")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "endAt", alias = "end_at")]
    end_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    name: String,
    #[serde(default, rename = "type")]
    entry_type: Option<String>,
}

impl E2bSandboxClient {
    pub fn new(api_key: impl Into<String>) -> ProviderResult<Self> {
        Self::with_base(api_key, E2B_API_BASE)
    }

    /// Client against a non-default API base (self-hosted or test server).
    pub fn with_base(api_key: impl Into<String>, api_base: impl Into<String>) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| ProviderError::Transient(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v0{path}", self.api_base)
    }

    fn files_url(&self, session_id: &str, path: &str) -> String {
        self.url(&format!(
            "/sandboxes/{session_id}/files?path={encoded}",
            encoded = urlencoding::encode(path)
        ))
    }

    fn require_key(&self) -> ProviderResult<&str> {
        if self.api_key.is_empty() {
            return Err(ProviderError::Api {
                status: 401,
                body: "E2B_API_KEY is not set".to_string(),
            });
        }
        Ok(&self.api_key)
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> ProviderResult<String> {
        let api_key = self.require_key()?;
        let resp = request
            .header("Authorization", format!("Bearer {api_key}"))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(format!("E2B {what} request timed out: {e}"))
                } else {
                    ProviderError::Transient(format!("E2B {what} request failed: {e}"))
                }
            })?;

        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable>".to_string());

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body: body_text,
            });
        }
        Ok(body_text)
    }

    fn parse_detail(body: &str, fallback_lease_ms: Option<u64>) -> ProviderResult<SandboxInfo> {
        let detail: SandboxDetail = serde_json::from_str(body).map_err(|e| ProviderError::Api {
            status: 200,
            body: format!("failed to parse E2B response: {e}\nBody: {body}"),
        })?;

        if detail.sandbox_id.is_empty() {
            return Err(ProviderError::Api {
                status: 200,
                body: format!("E2B returned no sandbox id. Response: {body}"),
            });
        }

        let started_at = detail.started_at.unwrap_or_else(Utc::now);
        let end_at = match (detail.end_at, fallback_lease_ms) {
            (Some(end), _) => end,
            (None, Some(ms)) => started_at + Duration::milliseconds(ms as i64),
            (None, None) => {
                return Err(ProviderError::Api {
                    status: 200,
                    body: format!("E2B response has no lease end. Response: {body}"),
                })
            }
        };

        Ok(SandboxInfo {
            session_id: detail.sandbox_id,
            started_at,
            end_at,
        })
    }
}

#[async_trait]
impl SandboxClient for E2bSandboxClient {
    async fn create_sandbox(&self, template: &str, timeout_ms: u64) -> ProviderResult<SandboxInfo> {
        let body = serde_json::json!({
            "templateID": template,
            "timeout": timeout_ms / 1000,
        });
        let text = self
            .send(self.http.post(self.url("/sandboxes")).json(&body), "create sandbox")
            .await?;
        Self::parse_detail(&text, Some(timeout_ms))
    }

    async fn get_info(&self, session_id: &str) -> ProviderResult<SandboxInfo> {
        let text = self
            .send(
                self.http.get(self.url(&format!("/sandboxes/{session_id}"))),
                &format!("sandbox {session_id}"),
            )
            .await?;
        Self::parse_detail(&text, None)
    }

    async fn set_timeout(&self, session_id: &str, duration_ms: u64) -> ProviderResult<()> {
        let body = serde_json::json!({ "timeout": duration_ms / 1000 });
        self.send(
            self.http
                .post(self.url(&format!("/sandboxes/{session_id}/timeout")))
                .json(&body),
            &format!("sandbox {session_id}"),
        )
        .await?;
        Ok(())
    }

    async fn kill_sandbox(&self, session_id: &str) -> ProviderResult<()> {
        match self
            .send(
                self.http.delete(self.url(&format!("/sandboxes/{session_id}"))),
                &format!("sandbox {session_id}"),
            )
            .await
        {
            Ok(_) | Err(ProviderError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn run_command(
        &self,
        session_id: &str,
        command: &str,
        workdir: &str,
        timeout_ms: u64,
    ) -> ProviderResult<CommandOutput> {
        let body = serde_json::json!({
            "cmd": command,
            "workdir": workdir,
            "timeout": timeout_ms / 1000,
        });
        let text = self
            .send(
                self.http
                    .post(self.url(&format!("/sandboxes/{session_id}/commands")))
                    .json(&body),
                "run_command",
            )
            .await?;

        let parsed: serde_json::Value = serde_json::from_str(&text).map_err(|e| ProviderError::Api {
            status: 200,
            body: format!("failed to parse E2B response: {e}\nBody: {text}"),
        })?;

        Ok(CommandOutput {
            stdout: parsed["stdout"].as_str().unwrap_or("").to_string(),
            stderr: parsed["stderr"].as_str().unwrap_or("").to_string(),
            exit_code: parsed["exitCode"]
                .as_i64()
                .or_else(|| parsed["exit_code"].as_i64())
                .unwrap_or(0),
        })
    }

    async fn write_file(&self, session_id: &str, path: &str, content: &str) -> ProviderResult<()> {
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        let part = reqwest::multipart::Part::bytes(content.as_bytes().to_vec())
            .file_name(file_name)
            .mime_str("text/plain")
            .map_err(|e| ProviderError::Transient(format!("MIME type error: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("path", path.to_string())
            .part("file", part);

        self.send(
            self.http
                .post(self.url(&format!("/sandboxes/{session_id}/files")))
                .multipart(form),
            "write_file",
        )
        .await?;
        Ok(())
    }

    async fn read_file(&self, session_id: &str, path: &str) -> ProviderResult<String> {
        self.send(self.http.get(self.files_url(session_id, path)), path)
            .await
    }

    async fn list_dir(&self, session_id: &str, path: &str) -> ProviderResult<Vec<DirEntry>> {
        let text = self
            .send(self.http.get(self.files_url(session_id, path)), path)
            .await?;
        let entries: Vec<FileEntry> = serde_json::from_str(&text).unwrap_or_default();
        Ok(entries
            .into_iter()
            .map(|e| DirEntry {
                is_dir: matches!(e.entry_type.as_deref(), Some("dir" | "directory")),
                name: e.name,
            })
            .collect())
    }

    async fn get_preview_url(&self, session_id: &str, port: u16) -> ProviderResult<String> {
        let text = self
            .send(
                self.http
                    .get(self.url(&format!("/sandboxes/{session_id}/hosts/{port}"))),
                &format!("port {port} on sandbox {session_id}"),
            )
            .await?;

        let raw = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(parsed) => parsed["url"]
                .as_str()
                .or_else(|| parsed["host"].as_str())
                .map(str::to_string)
                .unwrap_or_else(|| text.trim().trim_matches('"').to_string()),
            Err(_) => text.trim().trim_matches('"').to_string(),
        };

        Ok(if raw.starts_with("http") {
            raw
        } else {
            format!("https://{raw}")
        })
    }
}
