//! Pulling the raw content of an external resource.

use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use mesh_kernel::NetMeshBaseIdentifier;
use parking_lot::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ProbeError, ProbeResult};

/// Response header pointing at a Yadis service descriptor.
pub const XRDS_LOCATION_HEADER: &str = "x-xrds-location";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchedContent {
    /// Media type without parameters, lower-cased.
    pub content_type: Option<String>,
    /// Response headers with lower-cased names.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl FetchedContent {
    pub fn new(content_type: Option<&str>, body: impl Into<String>) -> Self {
        Self {
            content_type: content_type.map(normalize_content_type),
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// `text/html; charset=utf-8` becomes `text/html`.
pub fn normalize_content_type(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, source: &NetMeshBaseIdentifier) -> ProbeResult<FetchedContent>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    pub request_timeout: Duration,
    pub initial_retry_interval: Duration,
    pub max_retry_interval: Duration,
    /// Total time spent retrying transient failures.
    pub max_elapsed: Duration,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            initial_retry_interval: Duration::from_secs(1),
            max_retry_interval: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(60),
        }
    }
}

/// GET over HTTP(S), retrying transient failures with exponential backoff.
pub struct HttpFetcher {
    client: reqwest::Client,
    config: HttpFetcherConfig,
}

impl HttpFetcher {
    pub fn new(config: HttpFetcherConfig) -> ProbeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProbeError::Client(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn fetch_once(&self, source: &NetMeshBaseIdentifier) -> ProbeResult<FetchedContent> {
        let response = self
            .client
            .get(source.resolution_url())
            .header(reqwest::header::ACCEPT, "application/xrds+xml, text/html;q=0.9, */*;q=0.5")
            .send()
            .await
            .map_err(|e| ProbeError::Fetch {
                source_id: source.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::HttpStatus {
                source_id: source.clone(),
                status: status.as_u16(),
            });
        }

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let content_type = headers
            .get("content-type")
            .map(|ct| normalize_content_type(ct));
        let body = response.text().await.map_err(|e| ProbeError::Fetch {
            source_id: source.clone(),
            reason: e.to_string(),
        })?;
        Ok(FetchedContent {
            content_type,
            headers,
            body,
        })
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, source: &NetMeshBaseIdentifier) -> ProbeResult<FetchedContent> {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_retry_interval)
            .with_max_interval(self.config.max_retry_interval)
            .with_max_elapsed_time(Some(self.config.max_elapsed))
            .build();

        backoff::future::retry(backoff, || async {
            match self.fetch_once(source).await {
                Ok(content) => {
                    debug!(source = %source, bytes = content.body.len(), "Fetched");
                    Ok(content)
                }
                Err(e) if e.is_permanent() => Err(backoff::Error::permanent(e)),
                Err(e) => {
                    warn!(source = %source, error = %e, "Fetch failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await
    }
}

/// Reads `file:` resources from the local file system.
#[derive(Debug, Clone, Default)]
pub struct FileFetcher;

impl FileFetcher {
    fn guess_content_type(path: &Path) -> Option<&'static str> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "html" | "htm" => Some("text/html"),
            "xhtml" => Some("application/xhtml+xml"),
            "xrds" => Some("application/xrds+xml"),
            "xml" => Some("application/xml"),
            "txt" => Some("text/plain"),
            _ => None,
        }
    }
}

#[async_trait]
impl ContentFetcher for FileFetcher {
    async fn fetch(&self, source: &NetMeshBaseIdentifier) -> ProbeResult<FetchedContent> {
        let path = Url::parse(source.as_str())
            .ok()
            .and_then(|u| u.to_file_path().ok())
            .ok_or_else(|| ProbeError::UnsupportedScheme {
                source_id: source.clone(),
                scheme: source.scheme().to_string(),
            })?;
        let body = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ProbeError::Fetch {
                source_id: source.clone(),
                reason: format!("{}: {e}", path.display()),
            })?;
        Ok(FetchedContent::new(Self::guess_content_type(&path), body))
    }
}

/// Serves content registered in memory. Unknown sources fail to fetch.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    pages: RwLock<HashMap<NetMeshBaseIdentifier, FetchedContent>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source: NetMeshBaseIdentifier, content: FetchedContent) {
        self.pages.write().insert(source, content);
    }

    pub fn remove(&self, source: &NetMeshBaseIdentifier) -> Option<FetchedContent> {
        self.pages.write().remove(source)
    }
}

#[async_trait]
impl ContentFetcher for StaticFetcher {
    async fn fetch(&self, source: &NetMeshBaseIdentifier) -> ProbeResult<FetchedContent> {
        self.pages
            .read()
            .get(source)
            .cloned()
            .ok_or_else(|| ProbeError::Fetch {
                source_id: source.clone(),
                reason: "no content registered".to_string(),
            })
    }
}

/// Picks a fetcher by the scheme of the source.
pub struct SchemeFetcher {
    http: Arc<dyn ContentFetcher>,
    file: Arc<dyn ContentFetcher>,
}

impl SchemeFetcher {
    pub fn new(http: Arc<dyn ContentFetcher>, file: Arc<dyn ContentFetcher>) -> Self {
        Self { http, file }
    }

    pub fn with_defaults(config: HttpFetcherConfig) -> ProbeResult<Self> {
        Ok(Self::new(
            Arc::new(HttpFetcher::new(config)?),
            Arc::new(FileFetcher),
        ))
    }
}

#[async_trait]
impl ContentFetcher for SchemeFetcher {
    async fn fetch(&self, source: &NetMeshBaseIdentifier) -> ProbeResult<FetchedContent> {
        match source.scheme() {
            "http" | "https" | "xri" => self.http.fetch(source).await,
            "file" => self.file.fetch(source).await,
            other => Err(ProbeError::UnsupportedScheme {
                source_id: source.clone(),
                scheme: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn nid(raw: &str) -> NetMeshBaseIdentifier {
        NetMeshBaseIdentifier::from_external_form(raw).unwrap()
    }

    #[test]
    fn test_normalize_content_type() {
        assert_eq!(normalize_content_type("Text/HTML; charset=UTF-8"), "text/html");
        assert_eq!(normalize_content_type("application/xrds+xml"), "application/xrds+xml");
    }

    #[tokio::test]
    async fn test_file_fetcher_reads_and_guesses_type() {
        let mut file = tempfile::Builder::new().suffix(".html").tempfile().unwrap();
        write!(file, "<html><title>Local</title></html>").unwrap();
        let url = Url::from_file_path(file.path()).unwrap();

        let content = FileFetcher.fetch(&nid(url.as_str())).await.unwrap();
        assert_eq!(content.content_type.as_deref(), Some("text/html"));
        assert!(content.body.contains("Local"));
    }

    #[tokio::test]
    async fn test_file_fetcher_missing_file() {
        let err = FileFetcher
            .fetch(&nid("file:///definitely/not/here.html"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Fetch { .. }));
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn test_scheme_fetcher_routes_by_scheme() {
        let web = Arc::new(StaticFetcher::new());
        web.insert(nid("http://example.com/"), FetchedContent::new(Some("text/html"), "web"));
        let files = Arc::new(StaticFetcher::new());
        files.insert(nid("file:///tmp/a.html"), FetchedContent::new(None, "file"));
        let fetcher = SchemeFetcher::new(web, files);

        let body = fetcher.fetch(&nid("http://example.com/")).await.unwrap().body;
        assert_eq!(body, "web");
        let body = fetcher.fetch(&nid("file:///tmp/a.html")).await.unwrap().body;
        assert_eq!(body, "file");
        let err = fetcher.fetch(&nid("mesh://node-a")).await.unwrap_err();
        assert!(matches!(err, ProbeError::UnsupportedScheme { .. }));
    }

    #[test]
    fn test_http_status_permanence() {
        let status = |status| ProbeError::HttpStatus {
            source_id: nid("http://example.com/"),
            status,
        };
        assert!(status(404).is_permanent());
        assert!(!status(503).is_permanent());
        assert!(!status(429).is_permanent());
    }
}
