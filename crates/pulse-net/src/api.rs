//! Client for the sentiment API (`/auth/login`, `/analyze`).

use std::sync::Arc;

use http::{header, HeaderValue, StatusCode};
use pulse_core::{
    AnalyzeRequest, AnalyzeResponse, ErrorBody, LoginRequest, LoginResponse, WorkerConfig,
    MAX_TEXT_CHARS,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::{Fetcher, NetError, Request, Response};

/// Typed client for the backend, issuing requests through any [`Fetcher`]
/// (directly over HTTP, or through the offline worker).
pub struct ApiClient {
    fetcher: Arc<dyn Fetcher>,
    page: Url,
    login_url: Url,
    analyze_url: Url,
    token: RwLock<Option<String>>,
}

impl ApiClient {
    pub fn new(config: &WorkerConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self, NetError> {
        let endpoint = |path: &str| {
            config
                .api_url(path)
                .map_err(|e| NetError::InvalidUrl(e.to_string()))
        };

        Ok(Self {
            fetcher,
            page: config.origin.clone(),
            login_url: endpoint("auth/login")?,
            analyze_url: endpoint("analyze")?,
            token: RwLock::new(None),
        })
    }

    /// Exchange credentials for a bearer token and keep it for later calls.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), NetError> {
        let payload = LoginRequest {
            username: username.trim().to_string(),
            password: password.trim().to_string(),
        };
        let request = Request::post_json(self.login_url.clone(), &payload)?.referrer(self.page.clone());

        let response = self.fetcher.fetch(&request).await?;
        if !response.ok() {
            return Err(upstream_error(&response, "Login failed"));
        }

        let login: LoginResponse = response.json()?;
        *self.token.write().await = Some(login.access_token);
        info!(user = %payload.username, "Logged in");
        Ok(())
    }

    /// Forget the bearer token.
    pub async fn logout(&self) {
        *self.token.write().await = None;
        debug!("Logged out");
    }

    pub async fn is_authenticated(&self) -> bool {
        self.token.read().await.is_some()
    }

    /// Analyze `text`. The text is trimmed and checked locally before any
    /// request is made.
    pub async fn analyze(&self, text: &str) -> Result<AnalyzeResponse, NetError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(NetError::InvalidInput("Please enter some text".to_string()));
        }
        if text.chars().count() > MAX_TEXT_CHARS {
            return Err(NetError::InvalidInput(format!(
                "Text exceeds {MAX_TEXT_CHARS} characters"
            )));
        }

        let token = self
            .token
            .read()
            .await
            .clone()
            .ok_or(NetError::Unauthenticated)?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| NetError::InvalidInput(e.to_string()))?;

        let payload = AnalyzeRequest {
            text: text.to_string(),
        };
        let request = Request::post_json(self.analyze_url.clone(), &payload)?
            .header(header::AUTHORIZATION, bearer)
            .referrer(self.page.clone());

        let response = self.fetcher.fetch(&request).await?;
        if response.status == StatusCode::UNAUTHORIZED {
            warn!("Token rejected, clearing session");
            *self.token.write().await = None;
        }
        if !response.ok() {
            return Err(upstream_error(&response, "Analysis failed"));
        }

        let analysis: AnalyzeResponse = response.json()?;
        debug!(sentiment = %analysis.sentiment, "Analysis received");
        Ok(analysis)
    }
}

fn upstream_error(response: &Response, fallback: &str) -> NetError {
    let detail = response
        .json::<ErrorBody>()
        .map(|body| body.message())
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| fallback.to_string());
    NetError::Upstream {
        status: response.status,
        detail,
    }
}
