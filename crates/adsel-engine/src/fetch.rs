//! Script and trusted-signal fetching.
//!
//! [`Fetcher`] is the network collaborator: it returns the body of a script
//! or signals document plus the version side channels carried in response
//! headers. [`HttpFetcher`] is the production implementation. It fetches
//! `https` only, unless [`FetchConfig::allow_insecure_schemes`] also admits
//! plain `http` and local `file` URLs for development.
//!
//! [`FetchCache`] sits in front of a fetcher for the lifetime of one auction:
//! it bounds concurrent fetches with the I/O semaphore and guarantees at
//! most one fetch in flight per URL. Concurrent callers for the same URL
//! await the same fetch; only successful responses are cached.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use adsel_core::config::FetchConfig;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tracing::{debug, warn};
use url::Url;

use crate::deadline::Deadline;

/// Response header carrying the buyer bidding logic version.
pub const BIDDING_LOGIC_VERSION_HEADER: &str = "X-FLEDGE-BUYER-BIDDING-LOGIC-VERSION";

/// Response header carrying the trusted signals data version.
pub const DATA_VERSION_HEADER: &str = "Data-Version";

/// Maximum number of distinct URLs cached per auction.
pub const MAX_CACHED_URLS: usize = 1024;

// =============================================================================
// Types
// =============================================================================

/// Caller identity and developer mode flag forwarded with every fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevContext {
    /// Whether developer options (overrides) are enabled for this caller.
    pub dev_options_enabled: bool,
    /// Calling package or principal.
    pub caller: String,
}

impl DevContext {
    /// A context for `caller` with developer options as given.
    #[must_use]
    pub fn new(caller: impl Into<String>, dev_options_enabled: bool) -> Self {
        Self {
            dev_options_enabled,
            caller: caller.into(),
        }
    }
}

/// A fetched document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// Response body as text.
    pub body: String,
    /// Declared bidding logic version, if any.
    pub version: Option<u64>,
    /// Declared trusted signals data version, if any.
    pub data_version: Option<u32>,
}

impl FetchResponse {
    /// A response with no version side channels.
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            version: None,
            data_version: None,
        }
    }
}

/// Errors from fetching a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// The URL scheme is not supported.
    #[error("unsupported scheme in {uri}")]
    UnsupportedScheme {
        /// Offending URL.
        uri: String,
    },

    /// The server answered with a non-success status.
    #[error("{uri} returned status {status}")]
    Status {
        /// Requested URL.
        uri: String,
        /// HTTP status code.
        status: u16,
    },

    /// The body exceeded the configured limit.
    #[error("{uri} response exceeds {limit} bytes")]
    TooLarge {
        /// Requested URL.
        uri: String,
        /// Limit in bytes.
        limit: usize,
    },

    /// The fetch did not finish in time.
    #[error("fetching {uri} timed out")]
    Timeout {
        /// Requested URL.
        uri: String,
    },

    /// Transport or filesystem failure.
    #[error("fetching {uri} failed: {message}")]
    Transport {
        /// Requested URL.
        uri: String,
        /// Underlying error.
        message: String,
    },

    /// Nothing is served at this URL.
    #[error("{uri} not found")]
    NotFound {
        /// Requested URL.
        uri: String,
    },
}

impl FetchError {
    /// Returns the error kind as a stable label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedScheme { .. } => "unsupported_scheme",
            Self::Status { .. } => "status",
            Self::TooLarge { .. } => "too_large",
            Self::Timeout { .. } => "timeout",
            Self::Transport { .. } => "transport",
            Self::NotFound { .. } => "not_found",
        }
    }

    /// Returns `true` if a later attempt may succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            Self::UnsupportedScheme { .. } | Self::TooLarge { .. } | Self::NotFound { .. } => false,
        }
    }
}

// =============================================================================
// Fetcher
// =============================================================================

/// Network collaborator for scripts and trusted signals.
#[async_trait]
pub trait Fetcher: Send + Sync + fmt::Debug {
    /// Fetches the document at `uri`.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] if the document cannot be obtained.
    async fn fetch_text(&self, uri: &Url, dev: &DevContext) -> Result<FetchResponse, FetchError>;
}

/// Fetches over HTTPS with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_response_bytes: usize,
    allow_insecure_schemes: bool,
}

impl HttpFetcher {
    /// Builds a fetcher from fetch settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &FetchConfig, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport {
                uri: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            max_response_bytes: config.max_response_bytes,
            allow_insecure_schemes: config.allow_insecure_schemes,
        })
    }

    async fn fetch_http(&self, uri: &Url) -> Result<FetchResponse, FetchError> {
        let transport = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchError::Timeout {
                    uri: uri.to_string(),
                }
            } else {
                FetchError::Transport {
                    uri: uri.to_string(),
                    message: e.to_string(),
                }
            }
        };
        let mut response = self
            .client
            .get(uri.clone())
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                uri: uri.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                uri: uri.to_string(),
                status: status.as_u16(),
            });
        }
        let too_large = || FetchError::TooLarge {
            uri: uri.to_string(),
            limit: self.max_response_bytes,
        };
        if response
            .content_length()
            .is_some_and(|len| len > self.max_response_bytes as u64)
        {
            return Err(too_large());
        }
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
        };
        let version = header(BIDDING_LOGIC_VERSION_HEADER).and_then(|v| v.parse().ok());
        let data_version = header(DATA_VERSION_HEADER).and_then(|v| v.parse().ok());

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(transport)? {
            if body.len() + chunk.len() > self.max_response_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(FetchResponse {
            body: String::from_utf8_lossy(&body).into_owned(),
            version,
            data_version,
        })
    }

    async fn fetch_file(&self, uri: &Url) -> Result<FetchResponse, FetchError> {
        let path = uri.to_file_path().map_err(|()| FetchError::UnsupportedScheme {
            uri: uri.to_string(),
        })?;
        let io = |e: std::io::Error| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FetchError::NotFound {
                    uri: uri.to_string(),
                }
            } else {
                FetchError::Transport {
                    uri: uri.to_string(),
                    message: e.to_string(),
                }
            }
        };
        let size = tokio::fs::metadata(&path).await.map_err(io)?.len();
        if size > self.max_response_bytes as u64 {
            return Err(FetchError::TooLarge {
                uri: uri.to_string(),
                limit: self.max_response_bytes,
            });
        }
        let body = tokio::fs::read_to_string(&path).await.map_err(io)?;
        Ok(FetchResponse::text(body))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_text(&self, uri: &Url, _dev: &DevContext) -> Result<FetchResponse, FetchError> {
        match (uri.scheme(), self.allow_insecure_schemes) {
            ("https", _) | ("http", true) => self.fetch_http(uri).await,
            ("file", true) => self.fetch_file(uri).await,
            _ => {
                warn!(%uri, "refusing to fetch");
                Err(FetchError::UnsupportedScheme {
                    uri: uri.to_string(),
                })
            },
        }
    }
}

// =============================================================================
// FetchCache
// =============================================================================

type Slot = Arc<OnceCell<FetchResponse>>;

/// Per-auction single-flight cache over a [`Fetcher`].
#[derive(Debug, Clone)]
pub struct FetchCache {
    fetcher: Arc<dyn Fetcher>,
    permits: Arc<Semaphore>,
    slots: Arc<Mutex<HashMap<Url, Slot>>>,
    dev: DevContext,
}

impl FetchCache {
    /// Creates an empty cache sharing the I/O pool `permits`.
    #[must_use]
    pub fn new(fetcher: Arc<dyn Fetcher>, permits: Arc<Semaphore>, dev: DevContext) -> Self {
        Self {
            fetcher,
            permits,
            slots: Arc::new(Mutex::new(HashMap::new())),
            dev,
        }
    }

    /// The developer context forwarded with every fetch.
    #[must_use]
    pub const fn dev_context(&self) -> &DevContext {
        &self.dev
    }

    /// Fetches `uri` once, bounded by `deadline`.
    ///
    /// # Errors
    ///
    /// Returns the fetcher's error, or [`FetchError::Timeout`] if the
    /// deadline passes first. Failures are not cached.
    pub async fn get(&self, uri: &Url, deadline: Deadline) -> Result<FetchResponse, FetchError> {
        let slot = {
            let mut slots = self.slots.lock().await;
            if let Some(slot) = slots.get(uri) {
                Arc::clone(slot)
            } else {
                let slot = Slot::default();
                if slots.len() < MAX_CACHED_URLS {
                    slots.insert(uri.clone(), Arc::clone(&slot));
                }
                slot
            }
        };
        let fetch = slot.get_or_try_init(|| async {
            let _permit = self.permits.acquire().await.map_err(|_| FetchError::Transport {
                uri: uri.to_string(),
                message: "fetch pool closed".to_string(),
            })?;
            debug!(%uri, "fetching");
            self.fetcher.fetch_text(uri, &self.dev).await
        });
        match deadline.run(fetch).await {
            Some(Ok(response)) => Ok(response.clone()),
            Some(Err(e)) => {
                warn!(%uri, error = %e, "fetch failed");
                Err(e)
            },
            None => Err(FetchError::Timeout {
                uri: uri.to_string(),
            }),
        }
    }
}
