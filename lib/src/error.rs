use std::{fmt, path::PathBuf};

use quinn::crypto::rustls::NoInitialCipherSuite;
use x509_parser::error::X509Error;

use crate::pemfile::DecodeError;

/// A trust error.
///
/// Construction of a [`TrustBundle`](crate::TrustBundle) fails with one of the policy variants
/// (`EmptyChain` through `KeyBindingMismatch`), each precise enough to find the misconfigured
/// credential without re-running validation. The remaining variants come from file loading and
/// from the QUIC transport.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("empty chain")]
    EmptyChain,

    #[error("empty roots")]
    EmptyRoots,

    #[error("{position}: {rule}")]
    PolicyViolation { position: Position, rule: Rule },

    #[error("{position}: {cause}")]
    PathValidation { position: Position, cause: PathError },

    #[error("private key does not match the leaf certificate")]
    KeyBindingMismatch,

    #[error("load {}: {source}", .file.display())]
    Pem {
        file: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("{}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("read {}: {source}", .path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("x509: {0}")]
    Parse(#[from] X509Error),

    #[error("unsupported key algorithm")]
    UnsupportedKey,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate generation error: {0}")]
    Rcgen(#[from] rcgen::Error),

    #[error("serial numbers exhausted")]
    SerialsExhausted,

    #[error("quic error: {0}")]
    NoInitialCipherSuite(#[from] NoInitialCipherSuite),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("write error: {0}")]
    Write(quinn::WriteError),

    #[error("read error: {0}")]
    Read(quinn::ReadError),

    #[error("read error: {0}")]
    ReadToEnd(quinn::ReadToEndError),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("peer presented no certificate")]
    NoPeerCertificate,

    #[error("no addresses found")]
    NoAddrs,
}

impl Error {
    /// The error underneath any [`Error::File`] wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::File { source, .. } => source.root_cause(),
            e => e,
        }
    }

    pub(crate) fn in_file(self, path: impl Into<PathBuf>) -> Self {
        Error::File {
            path: path.into(),
            source: Box::new(self),
        }
    }
}

impl From<quinn::WriteError> for Error {
    fn from(e: quinn::WriteError) -> Self {
        match e {
            quinn::WriteError::ConnectionLost(e) => Error::Connection(e),
            e => Error::Write(e),
        }
    }
}

impl From<quinn::ReadError> for Error {
    fn from(e: quinn::ReadError) -> Self {
        match e {
            quinn::ReadError::ConnectionLost(e) => Error::Connection(e),
            e => Error::Read(e),
        }
    }
}

impl From<quinn::ReadToEndError> for Error {
    fn from(e: quinn::ReadToEndError) -> Self {
        match e {
            quinn::ReadToEndError::Read(e) => e.into(),
            e => Error::ReadToEnd(e),
        }
    }
}

/// Where in the presented material a certificate sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Index into the trusted roots.
    Root(usize),

    /// Index into the chain; 0 is the leaf.
    Chain(usize),
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Root(i) => write!(f, "root[{i}]"),
            Position::Chain(i) => write!(f, "chain[{i}]"),
        }
    }
}

/// A structural policy rule a certificate failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rule {
    /// The basicConstraints extension is missing.
    #[error("basic constraints invalid")]
    BasicConstraintsInvalid,

    /// A CA position holds a certificate that isn't a CA.
    #[error("not a CA")]
    NotCa,

    /// The leaf position holds a CA certificate.
    #[error("is a CA")]
    IsCa,

    /// The key usage bits are not exactly those the role needs.
    #[error("invalid key usage")]
    KeyUsage,

    /// The extended key usages are not exactly those the role needs.
    #[error("invalid extended key usage")]
    ExtendedKeyUsage,
}

/// Why path validation of a certificate failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// The certificate's validity period ended before the verification time.
    #[error("certificate has expired")]
    Expired,

    /// The certificate's validity period starts after the verification time.
    #[error("certificate is not yet valid")]
    NotYetValid,

    /// No trusted root or intermediate issued the certificate.
    #[error("certificate signed by unknown authority")]
    UnknownIssuer,

    /// The issuer's key does not verify the certificate's signature.
    #[error("bad certificate signature")]
    BadSignature,

    /// The signature or key algorithm isn't supported.
    #[error("unsupported signature algorithm")]
    UnsupportedAlgorithm,

    /// The issuer candidate is not allowed to sign certificates.
    #[error("issuer is not authorised to sign certificates")]
    IssuerNotCa,

    /// An issuer's path length constraint is smaller than the number of CAs below it.
    #[error("path length constraint exceeded")]
    PathLenExceeded,

    /// The certificate has a critical extension that isn't understood.
    #[error("unhandled critical extension")]
    UnhandledCriticalExtension,

    /// The path is longer than the maximum depth.
    #[error("certificate path too long")]
    TooDeep,
}
