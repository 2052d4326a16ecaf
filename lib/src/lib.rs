//! Mutual TLS between instances of a system, anchored in a small private PKI.
//!
//! Every instance holds a [`TrustBundle`]: a certificate chain (leaf, then intermediates), the
//! private key of the leaf, and the set of trusted roots. The PKI is three levels deep: a root
//! signs intermediates, intermediates sign leaves, and leaves authenticate instances. Each
//! instance is both a client and a server, and presents the same leaf in either role.
//!
//! Trust is decided structurally, not by name. A peer is accepted if its chain meets the role
//! policy (CAs may only sign certificates; leaves may only authenticate, as both client and
//! server) and leads through valid signatures to one of the local roots. Hostnames and IP
//! addresses in certificates are never consulted.
//!
//! A bundle is validated once, when it's made or loaded. Any misconfiguration is reported with
//! the position of the offending certificate and the rule it broke:
//!
//! ```text
//! etc/trust/cert.pem: chain[0]: invalid extended key usage
//! ```
//!
//! From a valid bundle, [`TlsConfig`] builds rustls client and server configurations (TLS 1.3
//! only, client certificates mandatory, RSA disallowed), and [`Endpoint`] runs them over QUIC.
//!
//! # Example
//!
//! ```no_run
//! use nih_trust::{Endpoint, TrustBundle};
//!
//! # async fn run() -> Result<(), nih_trust::Error> {
//! let bundle = TrustBundle::load("etc/trust/cert.pem", "etc/trust/key.pem", "etc/trust/ca.pem")?;
//! let end = Endpoint::new("[::]:0", bundle)?;
//!
//! let session = end.connect("peer.example.com:1310").await?;
//! println!("connected to {}", session.peer().subject_name());
//!
//! let (mut s, mut r) = session.open_bi().await?;
//! s.write(b"How are you today?").await?;
//! s.finish()?;
//! let response = r.read_to_end(1024).await?;
//! println!("peer said: {response:x?}");
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]

pub use crate::{
    bundle::*,
    cert::{Certificate, ExtKeyUsage, KeyAlgorithm, KeyUsage, PublicKey, SignatureAlgorithm},
    endpoint::*,
    error::*,
    generate::*,
    key::*,
    pemfile::DecodeError,
    provider::crypto_provider,
    session::*,
    tls::*,
};
pub use quinn;
pub use rcgen;
pub use rustls;

mod bundle;
pub mod cert;
mod endpoint;
mod error;
mod generate;
mod key;
pub mod pemfile;
mod provider;
mod session;
mod tls;
pub mod verify;
