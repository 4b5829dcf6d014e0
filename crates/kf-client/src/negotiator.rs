//! Port-forward negotiation over an HTTP/1.1 protocol upgrade

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{CONNECTION, UPGRADE};
use reqwest::{Method, StatusCode};

use kf_core::traits::{BoxedTransport, Negotiator, TargetResolver};
use kf_core::{NegotiationError, Target};
use kf_protocol::UPGRADE_PROTOCOL;

use crate::api::ApiClient;

/// Upper bound on how much of an error body ends up in a message
const MAX_ERROR_BODY: usize = 512;

/// Negotiates the channel transport with the API server
///
/// Each call issues one `GET .../portforward?ports=N` carrying
/// `Connection: Upgrade`. A `101 Switching Protocols` answer hands the
/// underlying connection over as the raw transport. With a resolver
/// set, the target is resolved again before every attempt.
#[derive(Clone)]
pub struct HttpUpgradeNegotiator {
    client: ApiClient,
    protocol: String,
    resolver: Option<Arc<dyn TargetResolver>>,
}

impl HttpUpgradeNegotiator {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            protocol: UPGRADE_PROTOCOL.to_string(),
            resolver: None,
        }
    }

    /// Resolve targets through `resolver` before each upgrade
    pub fn with_resolver(mut self, resolver: Arc<dyn TargetResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Override the protocol token sent in the `Upgrade` header
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }
}

impl fmt::Debug for HttpUpgradeNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpUpgradeNegotiator")
            .field("client", &self.client)
            .field("protocol", &self.protocol)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

/// Server-relative path of the port-forward subresource
pub fn portforward_path(target: &Target, remote_port: u16) -> String {
    format!("{}/portforward?ports={}", target.api_path(), remote_port)
}

/// Map a non-101 answer to a negotiation error
pub fn status_error(status: StatusCode, body: &str) -> NegotiationError {
    let mut message = body.trim().to_string();
    if message.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    if message.is_empty() {
        message = status.canonical_reason().unwrap_or("no reason").to_string();
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => NegotiationError::Rejected {
            status: status.as_u16(),
            message,
        },
        _ => NegotiationError::Handshake(format!(
            "expected 101 Switching Protocols, got {}: {}",
            status.as_u16(),
            message
        )),
    }
}

#[async_trait]
impl Negotiator for HttpUpgradeNegotiator {
    async fn negotiate_upgrade(
        &self,
        target: &Target,
        remote_port: u16,
    ) -> Result<BoxedTransport, NegotiationError> {
        let resolved;
        let target = match &self.resolver {
            Some(resolver) => {
                resolved = resolver.resolve(target).await?;
                &resolved
            }
            None => target,
        };

        let path = portforward_path(target, remote_port);
        tracing::debug!(url = %self.client.url(&path), protocol = %self.protocol, "Requesting upgrade");

        let response = self
            .client
            .request(Method::GET, &path)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, &self.protocol)
            .send()
            .await
            .map_err(|e| NegotiationError::Http(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let accepted = response
            .headers()
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case(&self.protocol))
            .unwrap_or(false);
        if !accepted {
            return Err(NegotiationError::Handshake(format!(
                "server did not agree to upgrade to {}",
                self.protocol
            )));
        }

        let upgraded = response
            .upgrade()
            .await
            .map_err(|e| NegotiationError::Handshake(format!("upgrade failed: {}", e)))?;

        tracing::info!(forward = %target, remote_port, "Transport upgraded");
        Ok(Box::new(upgraded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_portforward_path() {
        let target = Target::pod("staging", "web-0");
        assert_eq!(
            portforward_path(&target, 8080),
            "/api/v1/namespaces/staging/pods/web-0/portforward?ports=8080"
        );
    }

    #[test]
    fn test_auth_statuses_are_rejections() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let err = status_error(status, "");
            assert!(!err.is_retryable());
            assert!(matches!(err, NegotiationError::Rejected { status: s, .. } if s == status.as_u16()));
        }
    }

    #[test]
    fn test_other_statuses_are_retryable_handshake_failures() {
        let err = status_error(StatusCode::SERVICE_UNAVAILABLE, "try later\n");
        assert!(err.is_retryable());
        match err {
            NegotiationError::Handshake(message) => {
                assert!(message.contains("503"));
                assert!(message.contains("try later"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "é".repeat(MAX_ERROR_BODY);
        match status_error(StatusCode::FORBIDDEN, &body) {
            NegotiationError::Rejected { message, .. } => assert!(message.len() <= MAX_ERROR_BODY),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
