#![deny(missing_docs)]

//! A client for the parcel package registry.
//!
//! The [`RegistryClient`] wraps the REST API the push and install pipelines
//! need: pushing trees, fetching trees with their download urls, and the tag,
//! version and log endpoints. Its behavior is controlled by an explicit
//! [`RegistryConfig`] value; there is no global session.

mod api;
mod config;
mod resolve;
pub mod retry;

use async_compression::tokio::bufread::GzipEncoder;
use http::{
    header::{CONTENT_ENCODING, CONTENT_TYPE},
    Method, StatusCode,
};
use parcel_digest::Sha256Hash;
use parcel_tree::PackageRef;
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use reqwest_retry::RetryTransientMiddleware;
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;
use url::Url;

pub use api::{
    HashBody, LogEntry, PackageResponse, PushRequest, PushResponse, TagEntry, UploadUrls,
    VersionEntry,
};
pub use config::{
    parse_registry_url, LoadError, RegistryConfig, ValidationError, DEFAULT_REGISTRY_URL,
    REGISTRY_URL_ENV, TOKEN_ENV,
};
pub use resolve::{match_hash, ResolveError};

use crate::retry::{retry_policy, ExponentialBackoff, TransientStrategy};

/// The user agent sent with every request.
pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// An error that occurred while talking to the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The request could not be completed, even after retrying.
    #[error("failed to communicate with the registry")]
    Transport(#[source] reqwest_middleware::Error),

    /// The registry answered with a failure status.
    #[error("{url} returned {status}: {message}")]
    Status {
        /// The requested url.
        url: Url,
        /// The status code of the response.
        status: StatusCode,
        /// The error message sent by the server, or the raw body.
        message: String,
    },

    /// The response body is not what the API promises.
    #[error("failed to decode the response of {url}")]
    Decode {
        /// The requested url.
        url: Url,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The request body could not be encoded.
    #[error("failed to encode the request body")]
    Encode(#[source] std::io::Error),

    /// The configured registry url cannot be extended with API paths.
    #[error("cannot construct a request url from {0}")]
    InvalidUrl(Url),

    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ValidationError),

    /// A version string is not PEP 440 compatible.
    #[error(transparent)]
    InvalidVersion(#[from] VersionError),
}

impl RegistryError {
    /// Returns true for connection failures, dropped connections, timeouts
    /// and interrupted bodies.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RegistryError::Transport(reqwest_middleware::Error::Reqwest(err))
                if retry::is_transient_error(err)
        )
    }

    /// Returns true for failures that may succeed when retried: connection
    /// errors and the server errors accepted by [`retry::is_retryable_status`].
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::Status { status, .. } => retry::is_retryable_status(*status),
            other => other.is_connection_error(),
        }
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        RegistryError::Transport(reqwest_middleware::Error::Reqwest(err))
    }
}

impl From<reqwest_middleware::Error> for RegistryError {
    fn from(err: reqwest_middleware::Error) -> Self {
        RegistryError::Transport(err)
    }
}

/// A version string that does not follow PEP 440.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{version}' is not a valid version: {reason} (see https://peps.python.org/pep-0440/)")]
pub struct VersionError {
    /// The rejected version string.
    pub version: String,
    /// Why the version was rejected.
    pub reason: String,
}

/// Checks that `version` follows PEP 440. Versions are permanent once
/// created, so this runs before any request is made.
pub fn validate_version(version: &str) -> Result<pep440_rs::Version, VersionError> {
    version
        .parse::<pep440_rs::Version>()
        .map_err(|err| VersionError {
            version: version.to_string(),
            reason: err.to_string(),
        })
}

/// Returns `response` if it has a success status, otherwise turns it into a
/// [`RegistryError::Status`].
pub async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<api::ErrorBody>(&body)
        .map(|body| body.message)
        .unwrap_or(body);
    Err(RegistryError::Status {
        url,
        status,
        message,
    })
}

/// A client for the registry REST API and for the object urls it hands out.
#[derive(Clone)]
pub struct RegistryClient {
    config: RegistryConfig,
    client: ClientWithMiddleware,
    transfer: reqwest::Client,
}

impl RegistryClient {
    /// Constructs a client. Both timeouts of `config` bound every request.
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        config.validate()?;

        // Objects are stored gzip compressed; they must not be decompressed
        // on the fly or resuming a download becomes impossible.
        let transfer = reqwest::Client::builder()
            .no_gzip()
            .user_agent(APP_USER_AGENT)
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()?;

        let client = reqwest_middleware::ClientBuilder::new(transfer.clone())
            .with(RetryTransientMiddleware::new_with_policy_and_strategy(
                retry_policy(&config),
                TransientStrategy,
            ))
            .build();

        Ok(Self {
            config,
            client,
            transfer,
        })
    }

    /// Returns the configuration of this client.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Returns the backoff policy for requests that are retried by hand.
    pub fn retry_policy(&self) -> ExponentialBackoff {
        retry_policy(&self.config)
    }

    /// Returns the client used for requests with streaming bodies. Requests
    /// made with it are not retried automatically.
    pub fn transfer_client(&self) -> &reqwest::Client {
        &self.transfer
    }

    /// Returns true if the existence check url of an object answers with a
    /// success status.
    pub async fn object_exists(&self, head_url: &Url) -> Result<bool, RegistryError> {
        let response = self.client.head(head_url.clone()).send().await?;
        Ok(response.status().is_success())
    }

    /// Pushes a package instance. With `request.dry_run` set, nothing is
    /// committed and the response carries the upload url of every object.
    pub async fn push_package(
        &self,
        package: &PackageRef,
        hash: &Sha256Hash,
        request: &PushRequest<'_>,
    ) -> Result<PushResponse, RegistryError> {
        let url = self.api_url(&["package", &package.owner, &package.name, &format!("{hash:x}")])?;
        let body = serde_json::to_vec(request).map_err(|e| RegistryError::Encode(e.into()))?;
        let body = gzip(&body).await.map_err(RegistryError::Encode)?;
        self.send(
            self.request(Method::PUT, url)
                .header(CONTENT_TYPE, "application/json")
                .header(CONTENT_ENCODING, "gzip")
                .body(body),
        )
        .await
    }

    /// Fetches the tree of a package instance together with the download url
    /// of every object. The subpath of `package` scopes the urls.
    pub async fn get_package(
        &self,
        package: &PackageRef,
        hash: &Sha256Hash,
    ) -> Result<PackageResponse, RegistryError> {
        let url = self.api_url(&["package", &package.owner, &package.name, &format!("{hash:x}")])?;
        self.send(
            self.request(Method::GET, url)
                .query(&[("subpath", package.subpath_str())]),
        )
        .await
    }

    /// Lists the tags of a package.
    pub async fn list_tags(&self, package: &PackageRef) -> Result<Vec<TagEntry>, RegistryError> {
        let url = self.api_url(&["tag", &package.owner, &package.name, ""])?;
        let list: api::TagList = self.send(self.request(Method::GET, url)).await?;
        Ok(list.tags)
    }

    /// Returns the package hash a tag points at.
    pub async fn get_tag(&self, package: &PackageRef, tag: &str) -> Result<Sha256Hash, RegistryError> {
        let url = self.api_url(&["tag", &package.owner, &package.name, tag])?;
        let body: HashBody = self.send(self.request(Method::GET, url)).await?;
        Ok(body.hash)
    }

    /// Points a tag at a package hash, creating or moving it.
    pub async fn put_tag(
        &self,
        package: &PackageRef,
        tag: &str,
        hash: &Sha256Hash,
    ) -> Result<(), RegistryError> {
        let url = self.api_url(&["tag", &package.owner, &package.name, tag])?;
        self.send_empty(self.request(Method::PUT, url).json(&HashBody { hash: *hash }))
            .await
    }

    /// Deletes a tag.
    pub async fn delete_tag(&self, package: &PackageRef, tag: &str) -> Result<(), RegistryError> {
        let url = self.api_url(&["tag", &package.owner, &package.name, tag])?;
        self.send_empty(self.request(Method::DELETE, url)).await
    }

    /// Lists the versions of a package.
    pub async fn list_versions(
        &self,
        package: &PackageRef,
    ) -> Result<Vec<VersionEntry>, RegistryError> {
        let url = self.api_url(&["version", &package.owner, &package.name, ""])?;
        let list: api::VersionList = self.send(self.request(Method::GET, url)).await?;
        Ok(list.versions)
    }

    /// Returns the package hash of a version.
    pub async fn get_version(
        &self,
        package: &PackageRef,
        version: &str,
    ) -> Result<Sha256Hash, RegistryError> {
        validate_version(version)?;
        let url = self.api_url(&["version", &package.owner, &package.name, version])?;
        let body: HashBody = self.send(self.request(Method::GET, url)).await?;
        Ok(body.hash)
    }

    /// Creates a version. Versions are permanent; the version string is
    /// validated before the request is sent.
    pub async fn put_version(
        &self,
        package: &PackageRef,
        version: &str,
        hash: &Sha256Hash,
    ) -> Result<(), RegistryError> {
        validate_version(version)?;
        let url = self.api_url(&["version", &package.owner, &package.name, version])?;
        self.send_empty(self.request(Method::PUT, url).json(&HashBody { hash: *hash }))
            .await
    }

    /// Returns the push history of a package, newest first.
    pub async fn get_log(&self, package: &PackageRef) -> Result<Vec<LogEntry>, RegistryError> {
        let url = self.api_url(&["log", &package.owner, &package.name, ""])?;
        let mut list: api::LogList = self.send(self.request(Method::GET, url)).await?;
        list.logs.sort_by(|a, b| b.created.total_cmp(&a.created));
        Ok(list.logs)
    }

    fn api_url(&self, segments: &[&str]) -> Result<Url, RegistryError> {
        let mut url = self.config.registry_url.clone();
        url.path_segments_mut()
            .map_err(|_| RegistryError::InvalidUrl(self.config.registry_url.clone()))?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RegistryError> {
        let response = check_status(request.send().await?).await?;
        let url = response.url().clone();
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| RegistryError::Decode { url, source })
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<(), RegistryError> {
        check_status(request.send().await?).await?;
        Ok(())
    }
}

async fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzipEncoder::new(data);
    let mut compressed = Vec::new();
    encoder.read_to_end(&mut compressed).await?;
    Ok(compressed)
}
