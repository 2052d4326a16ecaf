use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    sync::Arc,
};

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use tracing::debug;

use crate::{Error, Session, TlsConfig, TrustBundle};

/// Server name sent when connecting. Peers are identified by their chain, not by name.
const SERVER_NAME: &str = "peer.nih.invalid";

/// A QUIC endpoint secured by a [`TrustBundle`].
///
/// Each endpoint both accepts connections from and makes connections to other instances. Every
/// connection is mutually authenticated: both sides present their bundle's chain, and both sides
/// verify the other's against their own roots.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub(crate) tls: Arc<TlsConfig>,
    pub(crate) client_config: quinn::ClientConfig,
    pub(crate) endpoint: quinn::Endpoint,
}

impl Endpoint {
    /// Create and bind an endpoint.
    ///
    /// You must provide a local or unspecified address to bind the endpoint to. In most cases,
    /// `"[::]:0"` suffices: this binds to all IP interfaces and selects a random port. Use
    /// [`Endpoint::local_addr()`] to discover the randomly-assigned port.
    ///
    /// If `bind_to` resolves to multiple socket addresses, the first that succeeds creation of the
    /// socket will be used.
    ///
    /// Requires a Tokio runtime, even though the function is not async.
    pub fn new(bind_to: impl ToSocketAddrs, bundle: TrustBundle) -> Result<Self, Error> {
        let tls = Arc::new(bundle.tls_config());

        let server_config = quinn::ServerConfig::with_crypto(Arc::new(
            QuicServerConfig::try_from(tls.server_config()?)?,
        ));
        let client_config =
            quinn::ClientConfig::new(Arc::new(QuicClientConfig::try_from(tls.client_config()?)?));

        let mut last_err = None;
        let mut endpoint = None;
        for addr in bind_to.to_socket_addrs()? {
            match quinn::Endpoint::server(server_config.clone(), addr) {
                Ok(s) => {
                    endpoint = Some(s);
                    break;
                }
                Err(err) => {
                    last_err = Some(err);
                }
            }
        }
        let mut endpoint = match (endpoint, last_err) {
            (Some(e), _) => e,
            (None, Some(err)) => return Err(err.into()),
            (None, None) => return Err(Error::NoAddrs),
        };
        endpoint.set_default_client_config(client_config.clone());
        debug!(
            addr = ?endpoint.local_addr().ok(),
            leaf = tls.bundle().leaf().subject_name(),
            "endpoint bound"
        );

        Ok(Self {
            tls,
            client_config,
            endpoint,
        })
    }

    /// Get the local address the underlying socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.endpoint.local_addr().map_err(Error::from)
    }

    /// Get the number of connections that are currently open.
    pub fn open_connections(&self) -> usize {
        self.endpoint.open_connections()
    }

    /// The bundle this endpoint authenticates with.
    pub fn bundle(&self) -> &TrustBundle {
        self.tls.bundle()
    }

    /// Connect to a peer.
    ///
    /// Each address is tried in turn until a handshake succeeds, and the last error is returned
    /// if none does. A handshake fails if the peer's chain doesn't pass this endpoint's trust
    /// policy, or if ours doesn't pass theirs.
    ///
    /// If `addrs` contains unspecified addresses (e.g. `[::]` or `0.0.0.0`), they will be
    /// converted to localhost. This is a convenience for testing; in production you should prefer
    /// providing the correct addresses.
    pub async fn connect(&self, addrs: impl ToSocketAddrs) -> Result<Session, Error> {
        let mut last_err = None;
        for addr in normalise_addrs(addrs)? {
            let conn = self
                .endpoint
                .connect_with(self.client_config.clone(), addr, SERVER_NAME)?;
            match conn.await {
                Ok(conn) => return Session::new(conn),
                Err(err) => last_err = Some(Error::from(err)),
            }
        }

        Err(last_err.unwrap_or(Error::NoAddrs))
    }

    /// Accept an incoming session.
    ///
    /// Returns `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<Result<Session, Error>> {
        let incoming = self.endpoint.accept().await?;
        Some(match incoming.await {
            Ok(conn) => Session::new(conn),
            Err(err) => Err(err.into()),
        })
    }

    /// Wait for all connections on the endpoint to be cleanly shut down.
    ///
    /// Waiting for this condition before exiting ensures that a good-faith effort is made to
    /// notify peers of recent closures, whereas exiting immediately could force them to wait out
    /// the idle timeout period.
    pub async fn wait_idle(&self) {
        self.endpoint.wait_idle().await
    }

    /// Close all connections immediately.
    ///
    /// `code` and `reason` are not interpreted, and are provided directly to the peers.
    pub fn close(&self, code: u32, reason: impl AsRef<[u8]>) {
        self.endpoint.close(code.into(), reason.as_ref());
    }
}

pub(crate) fn normalise_addrs(addrs: impl ToSocketAddrs) -> Result<Vec<SocketAddr>, Error> {
    let addrs: Vec<SocketAddr> = addrs
        .to_socket_addrs()?
        .map(|mut addr| {
            if addr.ip().is_unspecified() {
                addr.set_ip(match addr.ip() {
                    IpAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                    IpAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
                });
            }

            addr
        })
        .collect();

    if addrs.is_empty() {
        return Err(Error::NoAddrs);
    }

    Ok(addrs)
}
