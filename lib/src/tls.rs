use std::{fmt, iter, sync::Arc};

use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, OtherError, SignatureScheme,
    client::{
        ResolvesClientCert,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::{CryptoProvider, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, SubjectPublicKeyInfoDer, UnixTime},
    server::{
        ClientHello, ResolvesServerCert,
        danger::{ClientCertVerified, ClientCertVerifier},
    },
    sign::{CertifiedKey, SigningKey},
};
use time::OffsetDateTime;
use tracing::{trace, warn};

use crate::{
    Certificate, Error, PathError, Signer, TrustBundle, provider::crypto_provider,
    verify::verify_chain_at,
};

/// The ALPN protocol negotiated between instances.
pub const ALPN: &[u8] = b"nih/1";

/// A TLS configuration backed by a [`TrustBundle`].
///
/// The same configuration serves both ends of a connection: it always offers the bundle's own
/// chain and key, whether acting as server or client and whatever server name is asked for, and it
/// verifies the peer's chain with the bundle's policy and roots. rustls' built-in WebPKI
/// verification is never consulted. Client authentication is mandatory, and only TLS 1.3 is
/// enabled.
#[derive(Clone)]
pub struct TlsConfig {
    bundle: Arc<TrustBundle>,
    certified: Arc<CertifiedKey>,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("bundle", &self.bundle)
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Wrap a bundle.
    pub fn new(bundle: Arc<TrustBundle>) -> Self {
        let chain = bundle.chain().iter().map(|c| c.der().clone()).collect();
        let key = Arc::new(BundleKey(bundle.key().clone()));
        Self {
            certified: Arc::new(CertifiedKey::new(chain, key)),
            provider: crypto_provider(),
            bundle,
        }
    }

    /// The bundle this configuration is backed by.
    pub fn bundle(&self) -> &TrustBundle {
        &self.bundle
    }

    /// A rustls server configuration.
    pub fn server_config(&self) -> Result<rustls::ServerConfig, Error> {
        let this = Arc::new(self.clone());
        let mut config = rustls::ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(this.clone())
            .with_cert_resolver(this);
        config.alpn_protocols = vec![ALPN.to_vec()];
        Ok(config)
    }

    /// A rustls client configuration.
    pub fn client_config(&self) -> Result<rustls::ClientConfig, Error> {
        let this = Arc::new(self.clone());
        let mut config = rustls::ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(this.clone())
            .with_client_cert_resolver(this);
        config.alpn_protocols = vec![ALPN.to_vec()];
        Ok(config)
    }

    /// Verify a chain presented by a peer, leaf first, returning the peer's leaf.
    pub fn verify_peer_chain(&self, certs: &[CertificateDer<'_>]) -> Result<Certificate, Error> {
        self.verify_peer_chain_at(certs, OffsetDateTime::now_utc())
    }

    fn verify_peer_chain_at(
        &self,
        certs: &[CertificateDer<'_>],
        now: OffsetDateTime,
    ) -> Result<Certificate, Error> {
        let chain = certs
            .iter()
            .map(|der| Certificate::from_der(der.clone().into_owned()))
            .collect::<Result<Vec<_>, _>>()?;
        verify_chain_at(&chain, self.bundle.roots(), now).cloned()
    }

    fn verify_presented(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), rustls::Error> {
        let now = i64::try_from(now.as_secs())
            .ok()
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
            .ok_or(rustls::Error::FailedToGetCurrentTime)?;
        let certs: Vec<_> = iter::once(end_entity)
            .chain(intermediates)
            .cloned()
            .collect();

        match self.verify_peer_chain_at(&certs, now) {
            Ok(leaf) => {
                trace!(peer = leaf.subject_name(), "peer chain verified");
                Ok(())
            }
            Err(err) => {
                warn!(%err, "rejected peer certificate chain");
                Err(rustls::Error::InvalidCertificate(certificate_error(err)))
            }
        }
    }

    fn verify_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }
}

fn certificate_error(err: Error) -> CertificateError {
    match err {
        Error::PathValidation { cause, .. } => match cause {
            PathError::Expired => CertificateError::Expired,
            PathError::NotYetValid => CertificateError::NotValidYet,
            PathError::UnknownIssuer => CertificateError::UnknownIssuer,
            PathError::BadSignature => CertificateError::BadSignature,
            _ => CertificateError::Other(OtherError(Arc::new(err))),
        },
        Error::Parse(_) => CertificateError::BadEncoding,
        err => CertificateError::Other(OtherError(Arc::new(err))),
    }
}

impl ResolvesServerCert for TlsConfig {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.certified.clone())
    }
}

impl ResolvesClientCert for TlsConfig {
    fn resolve(&self, _hints: &[&[u8]], _schemes: &[SignatureScheme]) -> Option<Arc<CertifiedKey>> {
        Some(self.certified.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

impl ServerCertVerifier for TlsConfig {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.verify_presented(end_entity, intermediates, now)
            .map(|()| ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::General("TLS 1.2 is not supported".into()))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.verify_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ClientCertVerifier for TlsConfig {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.verify_presented(end_entity, intermediates, now)
            .map(|()| ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::General("TLS 1.2 is not supported".into()))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.verify_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// A bundle's [`Signer`] as a rustls signing key.
#[derive(Debug, Clone)]
struct BundleKey(Arc<dyn Signer>);

impl SigningKey for BundleKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn rustls::sign::Signer>> {
        if offered.contains(&self.0.scheme()) {
            Some(Box::new(self.clone()))
        } else {
            None
        }
    }

    fn public_key(&self) -> Option<SubjectPublicKeyInfoDer<'_>> {
        Some(self.0.subject_public_key_info().into())
    }

    fn algorithm(&self) -> rustls::SignatureAlgorithm {
        match self.0.scheme() {
            SignatureScheme::ED25519 => rustls::SignatureAlgorithm::ED25519,
            SignatureScheme::ECDSA_NISTP256_SHA256
            | SignatureScheme::ECDSA_NISTP384_SHA384
            | SignatureScheme::ECDSA_NISTP521_SHA512 => rustls::SignatureAlgorithm::ECDSA,
            _ => rustls::SignatureAlgorithm::Unknown(0),
        }
    }
}

impl rustls::sign::Signer for BundleKey {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        self.0
            .sign(message)
            .map_err(|err| rustls::Error::General(err.to_string()))
    }

    fn scheme(&self) -> SignatureScheme {
        self.0.scheme()
    }
}
