use crate::local::LocalBackend;
use crate::retry::{RetryBackend, RetryConfig};
use crate::s3::S3Backend;
use async_trait::async_trait;
use ghostpack_core::{Backend, Error, LayoutKind, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A parsed repository location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub scheme: String,
    /// Scheme specific part: a directory for `local`, `bucket[/prefix]` for `s3`.
    pub location: String,
    /// Service endpoint for S3-compatible stores, e.g. `http://localhost:9000`.
    pub endpoint: Option<String>,
    /// Explicit layout; detected from the stored files on open when unset.
    pub layout: Option<LayoutKind>,
}

impl BackendConfig {
    pub fn with_layout(mut self, layout: LayoutKind) -> Self {
        self.layout = Some(layout);
        self
    }
}

/// Constructs backends for one URI scheme.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Connects to an existing repository.
    async fn open(&self, config: &BackendConfig) -> Result<Arc<dyn Backend>>;

    /// Prepares storage for a new repository.
    async fn create(&self, config: &BackendConfig) -> Result<Arc<dyn Backend>>;
}

struct LocalFactory;

#[async_trait]
impl BackendFactory for LocalFactory {
    async fn open(&self, config: &BackendConfig) -> Result<Arc<dyn Backend>> {
        Ok(Arc::new(LocalBackend::open(&config.location, config.layout).await?))
    }

    async fn create(&self, config: &BackendConfig) -> Result<Arc<dyn Backend>> {
        let kind = config.layout.unwrap_or(LayoutKind::Default);
        Ok(Arc::new(LocalBackend::create(&config.location, kind).await?))
    }
}

struct S3Factory;

impl S3Factory {
    fn bucket_and_prefix(location: &str) -> Result<(String, String)> {
        let (bucket, prefix) = location.split_once('/').unwrap_or((location, ""));
        if bucket.is_empty() {
            return Err(Error::Config(format!("s3 location {location:?} has no bucket")));
        }
        Ok((bucket.to_string(), prefix.to_string()))
    }

    async fn connect(config: &BackendConfig, layout: Option<LayoutKind>) -> Result<Arc<dyn Backend>> {
        let (bucket, prefix) = Self::bucket_and_prefix(&config.location)?;
        let backend = match &config.endpoint {
            Some(endpoint) => S3Backend::with_endpoint(bucket, prefix, endpoint.clone(), layout).await?,
            None => S3Backend::new(bucket, prefix, layout).await?,
        };
        Ok(Arc::new(backend))
    }
}

#[async_trait]
impl BackendFactory for S3Factory {
    async fn open(&self, config: &BackendConfig) -> Result<Arc<dyn Backend>> {
        Self::connect(config, config.layout).await
    }

    async fn create(&self, config: &BackendConfig) -> Result<Arc<dyn Backend>> {
        Self::connect(config, Some(config.layout.unwrap_or(LayoutKind::Default))).await
    }
}

/// Maps URI schemes to backend factories.
///
/// Build one at startup and pass it to whatever resolves repository URIs.
/// Every backend it hands out is wrapped in a [`RetryBackend`].
pub struct BackendRegistry {
    factories: HashMap<String, Arc<dyn BackendFactory>>,
    retry: RetryConfig,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BackendRegistry {
    /// A registry without any schemes.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            retry: RetryConfig::default(),
        }
    }

    /// `local` and `s3`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("local", Arc::new(LocalFactory));
        registry.register("s3", Arc::new(S3Factory));
        registry
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn register(&mut self, scheme: impl Into<String>, factory: Arc<dyn BackendFactory>) {
        self.factories.insert(scheme.into(), factory);
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Parses `scheme:location`. Anything without a known scheme is a local path.
    ///
    /// A location starting with `http://` or `https://` names a service
    /// endpoint, e.g. `s3:http://localhost:9000/bucket/prefix`.
    pub fn parse(&self, uri: &str) -> Result<BackendConfig> {
        let (scheme, rest) = match uri.split_once(':') {
            Some((scheme, rest)) if self.factories.contains_key(scheme) => (scheme, rest),
            Some((scheme, _))
                if scheme.len() > 1 && scheme.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                return Err(Error::Config(format!("unknown backend scheme {scheme:?}")));
            }
            _ => ("local", uri),
        };

        let (endpoint, location) = split_endpoint(rest);
        if location.is_empty() {
            return Err(Error::Config(format!("backend URI {uri:?} has no location")));
        }
        Ok(BackendConfig {
            scheme: scheme.to_string(),
            location: location.to_string(),
            endpoint: endpoint.map(str::to_string),
            layout: None,
        })
    }

    fn factory(&self, config: &BackendConfig) -> Result<&Arc<dyn BackendFactory>> {
        self.factories
            .get(&config.scheme)
            .ok_or_else(|| Error::Config(format!("unknown backend scheme {:?}", config.scheme)))
    }

    pub async fn open(&self, config: &BackendConfig) -> Result<Arc<dyn Backend>> {
        let inner = self.factory(config)?.open(config).await?;
        debug!(location = %inner.location(), "opened backend");
        Ok(Arc::new(RetryBackend::new(inner, self.retry.clone())))
    }

    pub async fn create(&self, config: &BackendConfig) -> Result<Arc<dyn Backend>> {
        let inner = self.factory(config)?.create(config).await?;
        debug!(location = %inner.location(), "created backend");
        Ok(Arc::new(RetryBackend::new(inner, self.retry.clone())))
    }
}

fn split_endpoint(rest: &str) -> (Option<&str>, &str) {
    for scheme in ["http://", "https://"] {
        if let Some(after) = rest.strip_prefix(scheme) {
            let host_len = after.find('/').unwrap_or(after.len());
            let (endpoint, location) = rest.split_at(scheme.len() + host_len);
            return (Some(endpoint), location.trim_start_matches('/'));
        }
    }
    (None, rest)
}
