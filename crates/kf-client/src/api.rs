//! Authenticated API server client

use std::fmt;

use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use kf_core::config::ApiConfig;

use crate::error::ClientError;

/// Client for one API server
///
/// Cloning is cheap; clones share the underlying connection pool.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    server: String,
    namespace: String,
    token: Option<String>,
}

impl ApiClient {
    /// Build a client from configuration
    ///
    /// The client speaks HTTP/1.1 only, since protocol upgrades do not
    /// exist in HTTP/2.
    pub fn new(config: &ApiConfig) -> Result<Self, ClientError> {
        let token = config.bearer_token().map_err(ClientError::Token)?;

        let http = Client::builder()
            .http1_only()
            .connect_timeout(config.connect_timeout)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify)
            .build()
            .map_err(|e| ClientError::Build(e.to_string()))?;

        Ok(Self {
            http,
            server: config.server.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            token,
        })
    }

    /// Base URL of the server, without a trailing slash
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Default namespace from configuration
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Absolute URL for a server-relative path
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.server, path.trim_start_matches('/'))
    }

    /// Start a request with authentication attached
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.http.request(method, self.url(path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// GET a path and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.get_json_query(path, &[]).await
    }

    /// GET a path with query parameters and decode the JSON body
    pub async fn get_json_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ClientError> {
        let mut request = self.request(Method::GET, path);
        if !query.is_empty() {
            request = request.query(query);
        }
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Query the server's version endpoint
    pub async fn version(&self) -> Result<ServerVersion, ClientError> {
        let version: ServerVersion = self.get_json("/version").await?;
        tracing::debug!(server = %self.server, version = %version, "Server version");
        Ok(version)
    }
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("server", &self.server)
            .field("namespace", &self.namespace)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Body of the `/version` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerVersion {
    pub major: String,
    pub minor: String,
    pub git_version: String,
    #[serde(default)]
    pub platform: String,
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.git_version)
    }
}
