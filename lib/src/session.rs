use std::net::SocketAddr;

use bytes::Bytes;
use quinn::{ApplicationClose, ConnectionError, VarInt};
use rustls::pki_types::CertificateDer;

use crate::{Certificate, Error};

/// A mutually-authenticated QUIC connection to a peer.
///
/// By the time a `Session` exists, the peer's chain has passed the local trust policy, and the
/// peer has accepted ours. Can be cloned to create multiple handles to the same underlying
/// connection.
///
/// If all references to a connection (including every clone of the `Session` handle and the
/// various stream types) have been dropped, then the session will be automatically closed with a
/// `code` of 0 and an empty reason. You can also close the session explicitly by calling
/// [`Session::close()`].
#[derive(Debug, Clone)]
pub struct Session {
    conn: quinn::Connection,
    peer: Certificate,
}

impl Session {
    pub(crate) fn new(conn: quinn::Connection) -> Result<Self, Error> {
        let peer = match peer_leaf(&conn) {
            Some(der) => Certificate::from_der(der)?,
            None => {
                conn.close(VarInt::from_u32(0), b"no peer certificate");
                return Err(Error::NoPeerCertificate);
            }
        };

        Ok(Self { conn, peer })
    }

    /// The leaf certificate the peer authenticated with.
    pub fn peer(&self) -> &Certificate {
        &self.peer
    }

    /// The peer's address.
    pub fn remote_address(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    /// Wait until the peer creates a new unidirectional stream.
    ///
    /// Will error if the connection is closed.
    pub async fn accept_uni(&self) -> Result<RecvStream, Error> {
        let stream = self.conn.accept_uni().await?;
        Ok(RecvStream::new(stream))
    }

    /// Wait until the peer creates a new bidirectional stream.
    ///
    /// Will error if the connection is closed.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), Error> {
        let (s, r) = self.conn.accept_bi().await?;
        Ok((SendStream::new(s), RecvStream::new(r)))
    }

    /// Open a new bidirectional stream.
    ///
    /// May wait when there are too many concurrent streams. The peer only learns of the stream
    /// once data is written to it.
    ///
    /// Will error if the connection is closed.
    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream), Error> {
        let (s, r) = self.conn.open_bi().await?;
        Ok((SendStream::new(s), RecvStream::new(r)))
    }

    /// Open a new unidirectional stream.
    ///
    /// May wait when there are too many concurrent streams.
    ///
    /// Will error if the connection is closed.
    pub async fn open_uni(&self) -> Result<SendStream, Error> {
        Ok(SendStream::new(self.conn.open_uni().await?))
    }

    /// Close the session immediately.
    ///
    /// Pending operations will fail immediately with `Connection(ConnectionError::LocallyClosed)`.
    /// No more data is sent to the peer beyond a `CONNECTION_CLOSE` frame, and the peer may drop
    /// buffered data upon receiving the `CONNECTION_CLOSE` frame.
    ///
    /// `code` and `reason` are not interpreted, and are provided directly to the peer.
    ///
    /// `reason` will be truncated to fit in a single packet with overhead; to improve odds that it
    /// is preserved in full, it should be kept under 1KiB.
    ///
    /// # Gracefully closing a session
    ///
    /// Only the peer last receiving application data can be certain that all data is delivered.
    /// The only reliable action it can then take is to close the session, potentially with a
    /// custom error code. The delivery of the final `CONNECTION_CLOSE` frame is very likely if
    /// both endpoints stay online long enough, and [`Endpoint::wait_idle()`](crate::Endpoint::wait_idle)
    /// can be used to provide sufficient time. Otherwise, the remote peer will time out the
    /// session after 30 seconds.
    pub fn close(&self, code: u32, reason: impl AsRef<[u8]>) {
        self.conn.close(VarInt::from_u32(code), reason.as_ref())
    }

    /// Wait until the connection is closed.
    ///
    /// Returns `Ok(None)` if the connection was closed locally, `Ok(Some(_))` if the connection
    /// was closed by a peer (e.g. with `close()`), and `Err(_)` for other unexpected reasons.
    pub async fn closed(&self) -> Result<Option<ApplicationClose>, Error> {
        match self.conn.closed().await {
            ConnectionError::LocallyClosed => Ok(None),
            ConnectionError::ApplicationClosed(ac) => Ok(Some(ac)),
            e => Err(Error::Connection(e)),
        }
    }
}

fn peer_leaf(conn: &quinn::Connection) -> Option<CertificateDer<'static>> {
    let certs: Vec<CertificateDer<'static>> = *conn.peer_identity()?.downcast().ok()?;
    certs.into_iter().next()
}

/// An outgoing stream of bytes to the peer.
///
/// QUIC streams have flow control, which means the send rate is limited by the peer's receive
/// window. The stream will be closed with a graceful FIN when dropped.
#[derive(Debug)]
pub struct SendStream {
    inner: quinn::SendStream,
}

impl SendStream {
    fn new(inner: quinn::SendStream) -> Self {
        Self { inner }
    }

    /// Write *all* of the buffer to the stream.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.inner.write_all(buf).await?;
        Ok(())
    }

    /// Signal that no more data will be written.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.inner.finish()?;
        Ok(())
    }
}

/// An incoming stream of bytes from the peer.
///
/// All bytes are flushed in order and the stream is flow controlled.
///
/// The stream will be closed with STOP_SENDING code=0 when dropped.
#[derive(Debug)]
pub struct RecvStream {
    inner: quinn::RecvStream,
}

impl RecvStream {
    fn new(inner: quinn::RecvStream) -> Self {
        Self { inner }
    }

    /// Read the next chunk of data with the provided maximum size.
    ///
    /// Returns `None` once the peer has finished the stream.
    pub async fn read(&mut self, max: usize) -> Result<Option<Bytes>, Error> {
        Ok(self
            .inner
            .read_chunk(max, true)
            .await?
            .map(|chunk| chunk.bytes))
    }

    /// Read until the peer finishes the stream, failing if more than `limit` bytes arrive.
    pub async fn read_to_end(&mut self, limit: usize) -> Result<Vec<u8>, Error> {
        Ok(self.inner.read_to_end(limit).await?)
    }
}
