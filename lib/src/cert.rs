//! X.509 certificates, reduced to what the trust policy looks at.

use std::fmt;

use rustls::pki_types::CertificateDer;
use time::OffsetDateTime;
use x509_parser::{
    certificate::X509Certificate, error::X509Error, nom, oid_registry::Oid,
    x509::SubjectPublicKeyInfo,
};

use crate::Error;

const OID_ED25519: &str = "1.3.101.112";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_CURVE_P256: &str = "1.2.840.10045.3.1.7";
const OID_CURVE_P384: &str = "1.3.132.0.34";
const OID_ECDSA_SHA256: &str = "1.2.840.10045.4.3.2";
const OID_ECDSA_SHA384: &str = "1.2.840.10045.4.3.3";

// extensions whose criticality the validator honours
const HANDLED_EXTENSIONS: [&str; 6] = [
    "2.5.29.14", // subjectKeyIdentifier
    "2.5.29.15", // keyUsage
    "2.5.29.17", // subjectAltName
    "2.5.29.19", // basicConstraints
    "2.5.29.35", // authorityKeyIdentifier
    "2.5.29.37", // extKeyUsage
];

/// Key usage bits, in X.509 bit order.
///
/// Policy compares these exactly: a leaf must carry [`DIGITAL_SIGNATURE`](Self::DIGITAL_SIGNATURE)
/// and nothing else, a CA [`CERT_SIGN`](Self::CERT_SIGN) and nothing else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct KeyUsage(pub u16);

#[allow(missing_docs)]
impl KeyUsage {
    pub const NONE: Self = Self(0);
    pub const DIGITAL_SIGNATURE: Self = Self(1 << 0);
    pub const CONTENT_COMMITMENT: Self = Self(1 << 1);
    pub const KEY_ENCIPHERMENT: Self = Self(1 << 2);
    pub const DATA_ENCIPHERMENT: Self = Self(1 << 3);
    pub const KEY_AGREEMENT: Self = Self(1 << 4);
    pub const CERT_SIGN: Self = Self(1 << 5);
    pub const CRL_SIGN: Self = Self(1 << 6);
    pub const ENCIPHER_ONLY: Self = Self(1 << 7);
    pub const DECIPHER_ONLY: Self = Self(1 << 8);

    /// Whether every bit of `other` is set in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no bits are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for KeyUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// An extended key usage purpose.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ExtKeyUsage {
    Any,
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    TimeStamping,
    OcspSigning,
    /// Any other purpose, by dotted OID.
    Other(String),
}

/// Algorithm of a subject public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum KeyAlgorithm {
    Ed25519,
    EcdsaP256,
    EcdsaP384,
    Unsupported,
}

/// Algorithm of a certificate signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SignatureAlgorithm {
    Ed25519,
    EcdsaSha256,
    EcdsaSha384,
    Unsupported,
}

/// A subject public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// The full SubjectPublicKeyInfo, DER-encoded.
    pub spki: Vec<u8>,

    /// Which algorithm the key is for.
    pub algorithm: KeyAlgorithm,

    /// The key bits, as consumed by signature verification.
    pub raw: Vec<u8>,
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("algorithm", &self.algorithm)
            .field("raw", &Hex(&self.raw))
            .finish_non_exhaustive()
    }
}

/// A structural view of an X.509 certificate.
///
/// This carries only what trust policy and path validation need, so the validator doesn't depend
/// on any one parser's representation. The policy fields are public: they are what the validator
/// checks, and can be altered freely (e.g. in tests) without touching the signed bytes, which stay
/// as they were parsed from [`der`](Self::der). A [`TrustBundle`](crate::TrustBundle) checks both
/// the descriptors it was given and the ones parsed afresh from their DER, and keeps the latter.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    /// Whether the certificate claims to be a CA.
    pub is_ca: bool,

    /// Whether the basicConstraints extension is present.
    pub basic_constraints_valid: bool,

    /// Most CA certificates allowed below this one in a path, if limited.
    pub path_len_constraint: Option<u32>,

    /// Key usage bits; empty if the extension is absent.
    pub key_usage: KeyUsage,

    /// Extended key usages; empty if the extension is absent.
    pub ext_key_usage: Vec<ExtKeyUsage>,

    /// Start of the validity period.
    pub not_before: OffsetDateTime,

    /// End of the validity period.
    pub not_after: OffsetDateTime,

    /// The subject public key.
    pub public_key: PublicKey,

    /// Raw DER of the subject name.
    pub subject: Vec<u8>,

    /// Raw DER of the issuer name.
    pub issuer: Vec<u8>,

    der: CertificateDer<'static>,
    subject_name: String,
    serial: Vec<u8>,
    tbs: Vec<u8>,
    signature_algorithm: SignatureAlgorithm,
    signature: Vec<u8>,
    unhandled_critical: Vec<String>,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject_name)
            .field("serial", &Hex(&self.serial))
            .field("is_ca", &self.is_ca)
            .field("basic_constraints_valid", &self.basic_constraints_valid)
            .field("path_len_constraint", &self.path_len_constraint)
            .field("key_usage", &self.key_usage)
            .field("ext_key_usage", &self.ext_key_usage)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl Certificate {
    /// Parse a DER-encoded certificate.
    ///
    /// Fails on trailing data, duplicate or malformed extensions, and anything else the parser
    /// rejects.
    pub fn from_der(der: impl Into<CertificateDer<'static>>) -> Result<Self, Error> {
        let der = der.into();
        let (rest, cert) = x509_parser::parse_x509_certificate(&der).map_err(|err| match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => e,
            nom::Err::Incomplete(_) => X509Error::InvalidCertificate,
        })?;
        if !rest.is_empty() {
            return Err(X509Error::InvalidCertificate.into());
        }

        Self::from_parsed(&cert, der.clone())
    }

    fn from_parsed(
        cert: &X509Certificate<'_>,
        der: CertificateDer<'static>,
    ) -> Result<Self, Error> {
        let malformed = cert.extensions().iter().any(|ext| {
            ext.parsed_extension().error().is_some()
                && HANDLED_EXTENSIONS.contains(&ext.oid.to_id_string().as_str())
        });
        if malformed {
            return Err(X509Error::InvalidExtensions.into());
        }

        let basic = cert.basic_constraints()?;
        let key_usage = cert
            .key_usage()?
            .map(|ku| KeyUsage(ku.value.flags))
            .unwrap_or_default();
        let ext_key_usage = cert
            .extended_key_usage()?
            .map(|eku| {
                let eku = eku.value;
                let mut usages = Vec::new();
                for (set, usage) in [
                    (eku.any, ExtKeyUsage::Any),
                    (eku.server_auth, ExtKeyUsage::ServerAuth),
                    (eku.client_auth, ExtKeyUsage::ClientAuth),
                    (eku.code_signing, ExtKeyUsage::CodeSigning),
                    (eku.email_protection, ExtKeyUsage::EmailProtection),
                    (eku.time_stamping, ExtKeyUsage::TimeStamping),
                    (eku.ocsp_signing, ExtKeyUsage::OcspSigning),
                ] {
                    if set {
                        usages.push(usage);
                    }
                }
                usages.extend(
                    eku.other
                        .iter()
                        .map(|oid| ExtKeyUsage::Other(oid.to_id_string())),
                );
                usages
            })
            .unwrap_or_default();

        let unhandled_critical = cert
            .extensions()
            .iter()
            .filter(|ext| ext.critical)
            .map(|ext| ext.oid.to_id_string())
            .filter(|oid| !HANDLED_EXTENSIONS.contains(&oid.as_str()))
            .collect();

        let validity = cert.validity();

        Ok(Self {
            is_ca: basic.as_ref().is_some_and(|bc| bc.value.ca),
            basic_constraints_valid: basic.is_some(),
            path_len_constraint: basic.as_ref().and_then(|bc| bc.value.path_len_constraint),
            key_usage,
            ext_key_usage,
            not_before: validity.not_before.to_datetime(),
            not_after: validity.not_after.to_datetime(),
            public_key: public_key(cert.public_key()),
            subject: cert.subject().as_raw().to_vec(),
            issuer: cert.issuer().as_raw().to_vec(),
            subject_name: cert.subject().to_string(),
            serial: cert.raw_serial().to_vec(),
            tbs: cert.tbs_certificate.as_ref().to_vec(),
            signature_algorithm: signature_algorithm(&cert.signature_algorithm.algorithm),
            signature: cert.signature_value.data.to_vec(),
            unhandled_critical,
            der,
        })
    }

    /// The certificate as it was parsed.
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    /// The subject name, for display.
    pub fn subject_name(&self) -> &str {
        &self.subject_name
    }

    /// The serial number, as big-endian bytes.
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    /// Whether the issuer and subject names are the same.
    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }

    pub(crate) fn tbs(&self) -> &[u8] {
        &self.tbs
    }

    pub(crate) fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.signature_algorithm
    }

    pub(crate) fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Critical extensions the validator doesn't understand, by dotted OID.
    pub fn unhandled_critical_extensions(&self) -> &[String] {
        &self.unhandled_critical
    }
}

fn public_key(spki: &SubjectPublicKeyInfo<'_>) -> PublicKey {
    let algorithm = match spki.algorithm.algorithm.to_id_string().as_str() {
        OID_ED25519 => KeyAlgorithm::Ed25519,
        OID_EC_PUBLIC_KEY => {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|params| params.as_oid().ok())
                .map(|oid| oid.to_id_string());
            match curve.as_deref() {
                Some(OID_CURVE_P256) => KeyAlgorithm::EcdsaP256,
                Some(OID_CURVE_P384) => KeyAlgorithm::EcdsaP384,
                _ => KeyAlgorithm::Unsupported,
            }
        }
        _ => KeyAlgorithm::Unsupported,
    };

    PublicKey {
        spki: spki.raw.to_vec(),
        algorithm,
        raw: spki.subject_public_key.data.to_vec(),
    }
}

fn signature_algorithm(oid: &Oid<'_>) -> SignatureAlgorithm {
    match oid.to_id_string().as_str() {
        OID_ED25519 => SignatureAlgorithm::Ed25519,
        OID_ECDSA_SHA256 => SignatureAlgorithm::EcdsaSha256,
        OID_ECDSA_SHA384 => SignatureAlgorithm::EcdsaSha384,
        _ => SignatureAlgorithm::Unsupported,
    }
}

struct Hex<'a>(&'a [u8]);

impl fmt::Debug for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}
