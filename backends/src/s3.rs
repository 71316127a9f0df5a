use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use ghostpack_core::{
    Backend, Error, FileInfo, FileType, Handle, Layout, LayoutKind, ListVisitor, Result,
    detect_layout,
};
use std::fmt::Display;
use tracing::{debug, info};

/// Repository stored as objects in an S3-compatible bucket.
pub struct S3Backend {
    client: Client,
    bucket: String,
    layout: Layout,
}

impl S3Backend {
    /// Connects with the default AWS credential chain, detecting the layout
    /// from the keys under `prefix` when `kind` is `None`.
    pub async fn new(bucket: String, prefix: String, kind: Option<LayoutKind>) -> Result<Self> {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Self::from_client(Client::new(&config), bucket, prefix, kind).await
    }

    /// Connects to an S3-compatible service such as MinIO. Path-style
    /// addressing is used since most self-hosted services expect it.
    pub async fn with_endpoint(
        bucket: String,
        prefix: String,
        endpoint: String,
        kind: Option<LayoutKind>,
    ) -> Result<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(endpoint)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(true)
            .build();
        Self::from_client(Client::from_conf(s3_config), bucket, prefix, kind).await
    }

    pub async fn from_client(
        client: Client,
        bucket: String,
        prefix: String,
        kind: Option<LayoutKind>,
    ) -> Result<Self> {
        let prefix = prefix.trim_matches('/').to_string();
        let mut backend = Self {
            client,
            bucket,
            layout: Layout::new(kind.unwrap_or(LayoutKind::Default), prefix),
        };
        if kind.is_none() {
            let detected = backend.probe_layout().await?;
            debug!(bucket = %backend.bucket, layout = ?detected, "probed layout");
            if let Some(detected) = detected {
                backend.layout = Layout::new(detected, backend.layout.root().to_string());
            }
        }
        info!(bucket = %backend.bucket, layout = %backend.layout.kind(), "connected to bucket");
        Ok(backend)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn key(&self, handle: &Handle) -> String {
        self.layout.filename(handle)
    }

    /// Keys of the first listing page, relative to the repository root.
    async fn probe_layout(&self) -> Result<Option<LayoutKind>> {
        let root = dir_prefix(self.layout.root());
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&root)
            .send()
            .await
            .map_err(|e| sdk_error(e, format!("listing {}", self.bucket)))?;

        let keys: Vec<&str> = response
            .contents()
            .iter()
            .filter_map(|object| object.key())
            .filter_map(|key| key.strip_prefix(root.as_str()))
            .collect();
        Ok(detect_layout(&keys))
    }

    async fn list_prefix(
        &self,
        prefix: String,
        visit: &mut ListVisitor<'_>,
    ) -> Result<()> {
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| sdk_error(e, format!("listing {prefix}")))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                let name = key.rsplit('/').next().unwrap_or(key);
                visit(FileInfo {
                    name: name.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                })?;
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(())
    }
}

fn dir_prefix(dir: &str) -> String {
    if dir.is_empty() {
        String::new()
    } else {
        format!("{dir}/")
    }
}

/// Maps SDK failures onto the engine's taxonomy: timeouts, dispatch
/// failures, throttling and 5xx responses are transient.
fn sdk_error<E>(err: SdkError<E, HttpResponse>, context: impl Display) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            status == 429 || status >= 500
        }
        _ => false,
    };
    let message = format!("{context}: {}", DisplayErrorContext(&err));
    if transient {
        Error::TransientIo(message)
    } else {
        Error::Backend(message)
    }
}

fn status_of<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|response| response.status().as_u16())
}

#[async_trait]
impl Backend for S3Backend {
    fn location(&self) -> String {
        if self.layout.root().is_empty() {
            format!("s3:{}", self.bucket)
        } else {
            format!("s3:{}/{}", self.bucket, self.layout.root())
        }
    }

    async fn save(&self, handle: &Handle, data: Bytes) -> Result<()> {
        handle.validate()?;
        let key = self.key(handle);
        let size = data.len();
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .if_none_match("*")
            .content_length(size as i64)
            .body(ByteStream::from(data))
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(key = %key, size, "uploaded object");
                Ok(())
            }
            Err(e) if status_of(&e) == Some(412) => {
                Err(Error::Backend(format!("{handle} already exists")))
            }
            Err(e) => Err(sdk_error(e, format!("writing {key}"))),
        }
    }

    async fn load(&self, handle: &Handle, length: usize, offset: u64) -> Result<Bytes> {
        handle.validate()?;
        let key = self.key(handle);
        let mut request = self.client.get_object().bucket(&self.bucket).key(&key);
        if length > 0 {
            request = request.range(format!("bytes={}-{}", offset, offset + length as u64 - 1));
        } else if offset > 0 {
            request = request.range(format!("bytes={offset}-"));
        }

        let response = request.send().await.map_err(|e| {
            if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                Error::not_found(handle.to_string())
            } else {
                sdk_error(e, format!("reading {key}"))
            }
        })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| Error::TransientIo(format!("reading body of {key}: {e}")))?;
        Ok(data.into_bytes())
    }

    async fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        handle.validate()?;
        let key = self.key(handle);
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    Error::not_found(handle.to_string())
                } else {
                    sdk_error(e, format!("stat {key}"))
                }
            })?;

        Ok(FileInfo {
            name: handle.name.clone(),
            size: response.content_length().unwrap_or(0).max(0) as u64,
        })
    }

    async fn test(&self, handle: &Handle) -> Result<bool> {
        match self.stat(handle).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, handle: &Handle) -> Result<()> {
        handle.validate()?;
        let key = self.key(handle);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| sdk_error(e, format!("deleting {key}")))?;
        Ok(())
    }

    async fn list(&self, file_type: FileType, visit: &mut ListVisitor<'_>) -> Result<()> {
        if file_type == FileType::Config {
            return match self.stat(&Handle::config()).await {
                Ok(fi) => visit(FileInfo {
                    name: "config".to_string(),
                    size: fi.size,
                }),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            };
        }
        let (dir, _) = self.layout.basedir(file_type);
        self.list_prefix(dir_prefix(&dir), visit).await
    }

    async fn delete(&self) -> Result<()> {
        for file_type in FileType::ALL {
            if file_type == FileType::Config {
                continue;
            }
            let mut names = Vec::new();
            self.list(file_type, &mut |fi| {
                names.push(fi.name);
                Ok(())
            })
            .await?;
            for name in names {
                self.remove(&Handle::new(file_type, name)).await?;
            }
        }
        self.remove(&Handle::config()).await?;
        info!(bucket = %self.bucket, prefix = %self.layout.root(), "deleted repository");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
