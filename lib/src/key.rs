use std::{fmt, sync::Arc};

use rcgen::KeyPair;
use rustls::{
    SignatureScheme,
    crypto::ring::sign::any_supported_type,
    pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer},
    sign::SigningKey,
};

use crate::Error;

/// Something that can produce a signature over arbitrary bytes, verifiable with a known public key.
///
/// A [`TrustBundle`](crate::TrustBundle) holds its private key as a `Signer`, so the key material
/// can live anywhere (in memory, in a hardware token, behind a remote service) as long as it can
/// sign. [`Key`] is the in-memory implementation.
pub trait Signer: fmt::Debug + Send + Sync + 'static {
    /// The TLS signature scheme this key signs with.
    fn scheme(&self) -> SignatureScheme;

    /// The DER-encoded SubjectPublicKeyInfo of the public half.
    fn subject_public_key_info(&self) -> Vec<u8>;

    /// Sign `message` with [`scheme()`](Signer::scheme).
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, Error>;

    /// Export the private key in PKCS#8 DER form.
    ///
    /// Signers that hold their key elsewhere return an error.
    fn to_pkcs8_der(&self) -> Result<Vec<u8>, Error>;
}

/// A key pair that can sign certificates and TLS handshakes.
#[derive(Clone)]
pub struct Key {
    pub(crate) scheme: SigScheme,
    pub(crate) key: Arc<KeyPair>,
    signing: Arc<dyn SigningKey>,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("scheme", &self.scheme.0)
            .finish_non_exhaustive()
    }
}

/// A signature scheme for generating and using a [`Key`].
///
/// A SigScheme is the tuple of the [rustls] type (for TLS) and the corresponding [rcgen] type (for
/// generating certificates). The `SIGSCHEME_*` constants provide for the supported schemes.
pub type SigScheme = (SignatureScheme, &'static rcgen::SignatureAlgorithm);

/// Small keys using the [Ed25519](https://ed25519.cr.yp.to/) scheme.
pub const SIGSCHEME_ED25519: SigScheme = (SignatureScheme::ED25519, &rcgen::PKCS_ED25519);

/// Keys using the [ECDSA] scheme and the NIST P-256 curve.
///
/// [ECDSA]: https://en.wikipedia.org/wiki/Elliptic_Curve_Digital_Signature_Algorithm
pub const SIGSCHEME_ECDSA256: SigScheme = (
    SignatureScheme::ECDSA_NISTP256_SHA256,
    &rcgen::PKCS_ECDSA_P256_SHA256,
);

/// Keys using the [ECDSA] scheme and the NIST P-384 curve.
///
/// [ECDSA]: https://en.wikipedia.org/wiki/Elliptic_Curve_Digital_Signature_Algorithm
pub const SIGSCHEME_ECDSA384: SigScheme = (
    SignatureScheme::ECDSA_NISTP384_SHA384,
    &rcgen::PKCS_ECDSA_P384_SHA384,
);

const SIGSCHEMES: [SigScheme; 3] = [SIGSCHEME_ED25519, SIGSCHEME_ECDSA256, SIGSCHEME_ECDSA384];

impl Key {
    /// Generate a new random key using the default scheme.
    pub fn generate() -> Result<Self, Error> {
        Self::generate_for(SIGSCHEME_ED25519)
    }

    /// Generate a new random key using a particular scheme.
    pub fn generate_for(scheme: SigScheme) -> Result<Self, Error> {
        Self::load(KeyPair::generate_for(scheme.1)?)
    }

    /// Load an existing key from a [`rcgen::KeyPair`].
    ///
    /// Fails with [`Error::UnsupportedKey`] if the key isn't one of the `SIGSCHEME_*` schemes.
    pub fn load(key: KeyPair) -> Result<Self, Error> {
        let scheme = SIGSCHEMES
            .into_iter()
            .find(|scheme| key.algorithm() == scheme.1)
            .ok_or(Error::UnsupportedKey)?;
        let der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let signing = any_supported_type(&der)?;

        Ok(Self {
            scheme,
            key: Arc::new(key),
            signing,
        })
    }

    /// Load a key from its PKCS#8 DER form.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, Error> {
        Self::load(KeyPair::try_from(der)?)
    }

    /// The scheme this key was generated or loaded for.
    pub fn sig_scheme(&self) -> SigScheme {
        self.scheme
    }
}

impl Signer for Key {
    fn scheme(&self) -> SignatureScheme {
        self.scheme.0
    }

    fn subject_public_key_info(&self) -> Vec<u8> {
        self.key.public_key_der()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        let signer = self
            .signing
            .choose_scheme(&[self.scheme.0])
            .ok_or(Error::UnsupportedKey)?;
        Ok(signer.sign(message)?)
    }

    fn to_pkcs8_der(&self) -> Result<Vec<u8>, Error> {
        Ok(self.key.serialize_der())
    }
}
