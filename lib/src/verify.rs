//! Trust policy over certificate chains.
//!
//! Every function here is pure: it reads the certificates it's given and the verification time,
//! nothing else. Checks run in a fixed order and the first failure is returned.
//!
//! The policy separates roles strictly:
//!
//! - a **leaf** has basic constraints, is not a CA, has key usage `digitalSignature` and nothing
//!   else, and extended key usages `clientAuth` and `serverAuth` and nothing else;
//! - a **CA** (root or intermediate) has basic constraints, is a CA, has key usage `keyCertSign`
//!   and nothing else, and no extended key usages.
//!
//! On top of that, every certificate must chain to a trusted root through valid signatures and
//! validity periods.

use ring::signature::{self, UnparsedPublicKey, VerificationAlgorithm};
use rustls::SignatureScheme;
use time::OffsetDateTime;

use crate::{
    Certificate, Error, ExtKeyUsage, KeyUsage, PathError, Position, Rule, Signer,
    cert::{KeyAlgorithm, PublicKey, SignatureAlgorithm},
};

/// Longest issuer path followed from a certificate to a root.
pub const MAX_DEPTH: usize = 8;

const KEY_BINDING_CONTEXT: &[u8] = b"nih-trust key binding\0";

/// Why a certificate failed the CA policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    /// A structural rule failed.
    #[error(transparent)]
    Policy(#[from] Rule),

    /// Path validation failed.
    #[error(transparent)]
    Path(#[from] PathError),
}

impl Violation {
    /// Attach the position of the offending certificate.
    pub fn at(self, position: Position) -> Error {
        match self {
            Violation::Policy(rule) => Error::PolicyViolation { position, rule },
            Violation::Path(cause) => Error::PathValidation { position, cause },
        }
    }
}

/// Check a certificate against the leaf policy.
pub fn validate_leaf(cert: &Certificate) -> Result<(), Rule> {
    if !cert.basic_constraints_valid {
        return Err(Rule::BasicConstraintsInvalid);
    }

    if cert.is_ca {
        return Err(Rule::IsCa);
    }

    if cert.key_usage != KeyUsage::DIGITAL_SIGNATURE {
        return Err(Rule::KeyUsage);
    }

    let client_auth = cert.ext_key_usage.contains(&ExtKeyUsage::ClientAuth);
    let server_auth = cert.ext_key_usage.contains(&ExtKeyUsage::ServerAuth);
    let only_auth = cert
        .ext_key_usage
        .iter()
        .all(|u| matches!(u, ExtKeyUsage::ClientAuth | ExtKeyUsage::ServerAuth));
    if !(client_auth && server_auth && only_auth) {
        return Err(Rule::ExtendedKeyUsage);
    }

    Ok(())
}

/// Check a certificate against the CA policy, then validate its path to `roots`.
pub fn validate_ca(cert: &Certificate, roots: &[Certificate]) -> Result<(), Violation> {
    validate_ca_at(cert, roots, OffsetDateTime::now_utc())
}

/// Like [`validate_ca`], at a given time.
pub fn validate_ca_at(
    cert: &Certificate,
    roots: &[Certificate],
    now: OffsetDateTime,
) -> Result<(), Violation> {
    if !cert.basic_constraints_valid {
        return Err(Rule::BasicConstraintsInvalid.into());
    }

    if !cert.is_ca {
        return Err(Rule::NotCa.into());
    }

    if cert.key_usage != KeyUsage::CERT_SIGN {
        return Err(Rule::KeyUsage.into());
    }

    if !cert.ext_key_usage.is_empty() {
        return Err(Rule::ExtendedKeyUsage.into());
    }

    verify_path(cert, roots, &[], now)?;
    Ok(())
}

/// Check a root: the CA policy, verified against itself alone.
pub fn validate_root(cert: &Certificate) -> Result<(), Violation> {
    validate_ca(cert, std::slice::from_ref(cert))
}

/// Verify a chain against a set of roots, returning the leaf.
///
/// `chain[0]` must pass the leaf policy. Every later certificate must pass the CA policy against
/// `roots` directly, and is then available as an intermediate when validating the leaf's path.
pub fn verify_chain<'c>(
    chain: &'c [Certificate],
    roots: &[Certificate],
) -> Result<&'c Certificate, Error> {
    verify_chain_at(chain, roots, OffsetDateTime::now_utc())
}

/// Like [`verify_chain`], at a given time.
pub fn verify_chain_at<'c>(
    chain: &'c [Certificate],
    roots: &[Certificate],
    now: OffsetDateTime,
) -> Result<&'c Certificate, Error> {
    let (leaf, intermediates) = chain.split_first().ok_or(Error::EmptyChain)?;

    validate_leaf(leaf).map_err(|rule| Error::PolicyViolation {
        position: Position::Chain(0),
        rule,
    })?;

    for (i, cert) in intermediates.iter().enumerate() {
        validate_ca_at(cert, roots, now).map_err(|v| v.at(Position::Chain(i + 1)))?;
    }

    verify_path(leaf, roots, intermediates, now).map_err(|cause| Error::PathValidation {
        position: Position::Chain(0),
        cause,
    })?;

    Ok(leaf)
}

/// Validate the path from `cert` to one of `roots`, possibly through `intermediates`.
///
/// A certificate that is one of the roots is trusted as-is (its self-signature is checked if it
/// is self-issued). Otherwise each root or intermediate whose subject matches the certificate's
/// issuer is tried in turn: it must be allowed to sign certificates, its path length constraint
/// must admit the CAs below it, its key must verify the certificate's signature, and its own path
/// must validate. Every certificate on the path must have no critical extension the validator
/// doesn't understand.
pub fn verify_path(
    cert: &Certificate,
    roots: &[Certificate],
    intermediates: &[Certificate],
    now: OffsetDateTime,
) -> Result<(), PathError> {
    verify_path_from(cert, roots, intermediates, now, 0)
}

fn verify_path_from(
    cert: &Certificate,
    roots: &[Certificate],
    intermediates: &[Certificate],
    now: OffsetDateTime,
    depth: usize,
) -> Result<(), PathError> {
    if depth > MAX_DEPTH {
        return Err(PathError::TooDeep);
    }

    if now < cert.not_before {
        return Err(PathError::NotYetValid);
    }

    if now > cert.not_after {
        return Err(PathError::Expired);
    }

    if !cert.unhandled_critical_extensions().is_empty() {
        return Err(PathError::UnhandledCriticalExtension);
    }

    if roots.iter().any(|root| root.der() == cert.der()) {
        if cert.is_self_issued() {
            return verify_signature(cert, &cert.public_key);
        }
        return Ok(());
    }

    let mut last = PathError::UnknownIssuer;
    for issuer in roots.iter().chain(intermediates) {
        if issuer.subject != cert.issuer || issuer.der() == cert.der() {
            continue;
        }

        // CAs between the issuer and the start of the path, the start itself not counted
        let attempt = check_issuer(issuer, depth)
            .and_then(|()| verify_signature(cert, &issuer.public_key))
            .and_then(|()| verify_path_from(issuer, roots, intermediates, now, depth + 1));
        match attempt {
            Ok(()) => return Ok(()),
            Err(err) => last = err,
        }
    }

    Err(last)
}

fn check_issuer(issuer: &Certificate, cas_below: usize) -> Result<(), PathError> {
    if !(issuer.basic_constraints_valid && issuer.is_ca) {
        return Err(PathError::IssuerNotCa);
    }

    if issuer
        .path_len_constraint
        .is_some_and(|max| cas_below > max as usize)
    {
        return Err(PathError::PathLenExceeded);
    }

    if !issuer.key_usage.is_empty() && !issuer.key_usage.contains(KeyUsage::CERT_SIGN) {
        return Err(PathError::IssuerNotCa);
    }

    Ok(())
}

fn verify_signature(cert: &Certificate, key: &PublicKey) -> Result<(), PathError> {
    let alg: &'static dyn VerificationAlgorithm = match (cert.signature_algorithm(), key.algorithm)
    {
        (SignatureAlgorithm::Ed25519, KeyAlgorithm::Ed25519) => &signature::ED25519,
        (SignatureAlgorithm::EcdsaSha256, KeyAlgorithm::EcdsaP256) => {
            &signature::ECDSA_P256_SHA256_ASN1
        }
        (SignatureAlgorithm::EcdsaSha384, KeyAlgorithm::EcdsaP256) => {
            &signature::ECDSA_P256_SHA384_ASN1
        }
        (SignatureAlgorithm::EcdsaSha256, KeyAlgorithm::EcdsaP384) => {
            &signature::ECDSA_P384_SHA256_ASN1
        }
        (SignatureAlgorithm::EcdsaSha384, KeyAlgorithm::EcdsaP384) => {
            &signature::ECDSA_P384_SHA384_ASN1
        }
        _ => return Err(PathError::UnsupportedAlgorithm),
    };

    UnparsedPublicKey::new(alg, &key.raw)
        .verify(cert.tbs(), cert.signature())
        .map_err(|_| PathError::BadSignature)
}

/// Check that `key` is the private half of `leaf`'s public key.
///
/// The public keys must be identical, and a signature made by `key` must verify under the leaf's
/// key.
pub fn verify_key_binding(key: &dyn Signer, leaf: &Certificate) -> Result<(), Error> {
    if key.subject_public_key_info() != leaf.public_key.spki {
        return Err(Error::KeyBindingMismatch);
    }

    let alg: &'static dyn VerificationAlgorithm = match (key.scheme(), leaf.public_key.algorithm) {
        (SignatureScheme::ED25519, KeyAlgorithm::Ed25519) => &signature::ED25519,
        (SignatureScheme::ECDSA_NISTP256_SHA256, KeyAlgorithm::EcdsaP256) => {
            &signature::ECDSA_P256_SHA256_ASN1
        }
        (SignatureScheme::ECDSA_NISTP384_SHA384, KeyAlgorithm::EcdsaP384) => {
            &signature::ECDSA_P384_SHA384_ASN1
        }
        _ => return Err(Error::KeyBindingMismatch),
    };

    let challenge = [KEY_BINDING_CONTEXT, &leaf.public_key.spki].concat();
    let sig = key.sign(&challenge)?;
    UnparsedPublicKey::new(alg, &leaf.public_key.raw)
        .verify(&challenge, &sig)
        .map_err(|_| Error::KeyBindingMismatch)
}
