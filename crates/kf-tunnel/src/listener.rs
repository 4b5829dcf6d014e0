//! Local TCP listeners for a forward

use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpListener;

use kf_core::TunnelError;

/// Sockets bound for one forward, all on the same port
#[derive(Debug)]
pub struct LocalListener {
    listeners: Vec<TcpListener>,
    addrs: Vec<SocketAddr>,
}

impl LocalListener {
    /// Bind `port` on every address
    ///
    /// With port 0 the first bind picks an ephemeral port and the
    /// remaining addresses reuse it. If any bind fails, every socket bound
    /// so far is closed before the error is returned.
    pub async fn bind(addresses: &[IpAddr], port: u16) -> Result<Self, TunnelError> {
        if addresses.is_empty() {
            return Err(TunnelError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no local address to bind",
            )));
        }

        let mut port = port;
        let mut listeners = Vec::with_capacity(addresses.len());
        let mut addrs = Vec::with_capacity(addresses.len());

        for ip in addresses {
            let addr = SocketAddr::new(*ip, port);
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| TunnelError::Bind { addr, source })?;
            let bound = listener.local_addr()?;
            port = bound.port();

            tracing::info!("Forwarding from {}", bound);
            listeners.push(listener);
            addrs.push(bound);
        }

        Ok(Self { listeners, addrs })
    }

    /// Addresses actually bound, ephemeral port resolved
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub(crate) fn into_listeners(self) -> Vec<TcpListener> {
        self.listeners
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_ephemeral_port_resolved() {
        let listener = LocalListener::bind(&[IpAddr::V4(Ipv4Addr::LOCALHOST)], 0)
            .await
            .unwrap();
        assert_ne!(listener.local_addrs()[0].port(), 0);
    }

    #[tokio::test]
    async fn test_port_in_use_fails_without_leaving_sockets() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = LocalListener::bind(&[IpAddr::V4(Ipv4Addr::LOCALHOST)], port)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Bind { addr, .. } if addr.port() == port));
    }

    #[tokio::test]
    async fn test_partial_bind_is_rolled_back() {
        // Second address is not local, so binding it fails after the first succeeded
        let addresses = [
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        ];
        let scratch = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = scratch.local_addr().unwrap().port();
        drop(scratch);

        assert!(LocalListener::bind(&addresses, port).await.is_err());
        // The first socket was released with the error
        assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_addresses_rejected() {
        assert!(matches!(
            LocalListener::bind(&[], 0).await,
            Err(TunnelError::Io(_))
        ));
    }
}
