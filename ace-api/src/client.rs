//! Remote core client.
//!
//! [`RemoteCore`] mirrors the core operations over the HTTP facade with
//! identical semantics, so callers swap between a local [`CoreSystem`] and
//! a remote deployment without changing call shapes. Wire errors map back
//! to [`CoreError`] kinds; the retry policy (backoff on timeout, deadlock,
//! unavailable — never on validation or auth) is the caller's.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use uuid::Uuid;

use ace_core::{
    AnalysisModuleType, AnalysisRequest, CoreError, CoreResult, RootAnalysis,
};

/// HTTP mirror of the core API.
#[derive(Debug, Clone)]
pub struct RemoteCore {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl RemoteCore {
    /// Connect to a facade at `base_url` (`ACE_URI`), authenticating with
    /// `api_key` (`ACE_API_KEY`) when set.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn check(response: reqwest::Response) -> CoreResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body: Value = response.json().await.unwrap_or_default();
        let kind = body["error"].as_str().unwrap_or("");
        let message = body["message"].as_str().unwrap_or("");
        if kind.is_empty() {
            return Err(CoreError::unavailable(
                "remote",
                format!("unexpected status {status}"),
            ));
        }
        Err(CoreError::from_wire(kind, message))
    }

    fn transport(err: reqwest::Error) -> CoreError {
        if err.is_timeout() {
            CoreError::timeout("remote call", 0)
        } else {
            CoreError::unavailable("remote", err.to_string())
        }
    }

    /// Submit a root analysis.
    pub async fn submit(&self, root: &RootAnalysis) -> CoreResult<Uuid> {
        let response = self
            .request(reqwest::Method::POST, "/analysis/root")
            .json(root)
            .send()
            .await
            .map_err(Self::transport)?;
        let body: Value = Self::check(response)
            .await?
            .json()
            .await
            .map_err(Self::transport)?;
        body["uuid"]
            .as_str()
            .and_then(|uuid| uuid.parse().ok())
            .ok_or_else(|| CoreError::validation("malformed submit response"))
    }

    /// Post a completed observable analysis result.
    pub async fn post_result(&self, request: &AnalysisRequest) -> CoreResult<()> {
        let response = self
            .request(reqwest::Method::POST, "/analysis/result")
            .json(request)
            .send()
            .await
            .map_err(Self::transport)?;
        Self::check(response).await.map(|_| ())
    }

    /// Fetch a tracked root, or `None` if it is unknown.
    pub async fn get_root(&self, uuid: &Uuid) -> CoreResult<Option<RootAnalysis>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/analysis/root/{uuid}"))
            .send()
            .await
            .map_err(Self::transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check(response)
            .await?
            .json()
            .await
            .map(Some)
            .map_err(Self::transport)
    }

    /// Register (or re-register) an analysis module type.
    pub async fn register_analysis_module_type(
        &self,
        amt: &AnalysisModuleType,
    ) -> CoreResult<AnalysisModuleType> {
        let response = self
            .request(reqwest::Method::POST, "/module/type")
            .json(amt)
            .send()
            .await
            .map_err(Self::transport)?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(Self::transport)
    }

    /// Fetch a registered module type, or `None` if absent.
    pub async fn get_analysis_module_type(
        &self,
        name: &str,
    ) -> CoreResult<Option<AnalysisModuleType>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/module/type/{name}"))
            .send()
            .await
            .map_err(Self::transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check(response)
            .await?
            .json()
            .await
            .map(Some)
            .map_err(Self::transport)
    }

    /// Lease the next work item for a module instance.
    pub async fn get_next_analysis_request(
        &self,
        owner: &str,
        amt_name: &str,
        version: &str,
        wait: Duration,
    ) -> CoreResult<Option<AnalysisRequest>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/work/{amt_name}"))
            .query(&[
                ("owner", owner),
                ("version", version),
                ("wait_secs", &wait.as_secs().to_string()),
            ])
            .send()
            .await
            .map_err(Self::transport)?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Self::check(response)
            .await?
            .json()
            .await
            .map(Some)
            .map_err(Self::transport)
    }

    /// Acknowledge a leased request.
    pub async fn ack_analysis_request(&self, id: &Uuid) -> CoreResult<bool> {
        let response = self
            .request(reqwest::Method::POST, &format!("/work/{id}/ack"))
            .send()
            .await
            .map_err(Self::transport)?;
        let body: Value = Self::check(response)
            .await?
            .json()
            .await
            .map_err(Self::transport)?;
        Ok(body["acked"].as_bool().unwrap_or(false))
    }

    /// Upload a blob out-of-band, returning its handle.
    pub async fn store_blob(&self, data: Vec<u8>) -> CoreResult<String> {
        let response = self
            .request(reqwest::Method::POST, "/blob")
            .body(data)
            .send()
            .await
            .map_err(Self::transport)?;
        let body: Value = Self::check(response)
            .await?
            .json()
            .await
            .map_err(Self::transport)?;
        body["sha256"]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| CoreError::validation("malformed blob response"))
    }

    /// Download a blob by handle.
    pub async fn load_blob(&self, sha256: &str) -> CoreResult<Option<Vec<u8>>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/blob/{sha256}"))
            .send()
            .await
            .map_err(Self::transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check(response)
            .await?
            .bytes()
            .await
            .map(|bytes| Some(bytes.to_vec()))
            .map_err(Self::transport)
    }
}
