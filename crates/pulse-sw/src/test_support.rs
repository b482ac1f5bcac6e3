//! Shared fixtures for unit tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderValue, StatusCode};
use pulse_core::{AssetManifest, WorkerConfig};
use pulse_net::{Fetcher, NetError, Request, Response};
use url::Url;

pub fn test_config() -> WorkerConfig {
    WorkerConfig {
        manifest: AssetManifest::new(["/", "/index.html", "/style.css", "/offline.html"]),
        ..Default::default()
    }
}

pub fn origin_url(path: &str) -> Url {
    WorkerConfig::default().origin.join(path).unwrap()
}

#[derive(Clone)]
enum Script {
    Respond {
        status: u16,
        body: Bytes,
        delay: Option<Duration>,
    },
    Fail,
}

/// Fetcher answering from a per-URL script. Unscripted URLs fail like an
/// unreachable network.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: Url, status: u16, body: &str) {
        self.script(
            url,
            Script::Respond {
                status,
                body: Bytes::from(body.to_string()),
                delay: None,
            },
        );
    }

    pub fn respond_after(&self, url: Url, delay: Duration, status: u16, body: &str) {
        self.script(
            url,
            Script::Respond {
                status,
                body: Bytes::from(body.to_string()),
                delay: Some(delay),
            },
        );
    }

    pub fn fail(&self, url: Url) {
        self.script(url, Script::Fail);
    }

    /// Script every manifest entry of `config` with a 200 body naming its path.
    pub fn serve_manifest(&self, config: &WorkerConfig) {
        for (path, url) in config
            .manifest
            .paths()
            .iter()
            .zip(config.manifest_urls().unwrap())
        {
            self.respond(url, 200, &format!("asset {path}"));
        }
    }

    pub fn calls_for(&self, url: &Url) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(url.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    fn script(&self, url: Url, script: Script) {
        self.scripts.lock().unwrap().insert(url.to_string(), script);
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let key = request.url.to_string();
        *self.calls.lock().unwrap().entry(key.clone()).or_default() += 1;
        let script = self.scripts.lock().unwrap().get(&key).cloned();

        match script {
            Some(Script::Respond {
                status,
                body,
                delay,
            }) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let mut headers = HeaderMap::new();
                headers.insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain"),
                );
                Ok(Response::new(
                    request,
                    StatusCode::from_u16(status).unwrap(),
                    headers,
                    body,
                ))
            }
            Some(Script::Fail) | None => Err(NetError::RequestFailed(format!(
                "connection refused: {key}"
            ))),
        }
    }
}
