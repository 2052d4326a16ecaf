//! Credential generation for bootstrapping and tests.
//!
//! The certificates made here satisfy the trust policy exactly: roots and intermediates are CAs
//! with `keyCertSign` as their only key usage, leaves are non-CAs with `digitalSignature` and
//! the `clientAuth` and `serverAuth` extended key usages.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName as Dn, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyUsagePurpose, SerialNumber,
};
use time::{Duration, OffsetDateTime};
use tracing::trace;

use crate::{Certificate, Error, Key, SIGSCHEME_ED25519, SigScheme};

const ROOT_VALIDITY: Duration = Duration::days(10 * 365);
const INTERMEDIATE_VALIDITY: Duration = Duration::days(5 * 365);
const LEAF_VALIDITY: Duration = Duration::days(365);

/// A source of certificate serial numbers.
///
/// Serials are handed out in strictly increasing order, starting at 1, and are never repeated,
/// including when called from many threads at once. Once `u64::MAX` has been handed out the
/// counter is exhausted, and stays so.
#[derive(Debug, Default)]
pub struct SerialCounter(AtomicU64);

impl SerialCounter {
    /// A counter whose first serial is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// A counter whose first serial is `last + 1`.
    pub fn starting_after(last: u64) -> Self {
        Self(AtomicU64::new(last))
    }

    /// Take the next serial.
    pub fn next_serial(&self) -> Result<u64, Error> {
        self.0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| last.checked_add(1))
            .map(|last| last + 1)
            .map_err(|_| Error::SerialsExhausted)
    }
}

/// A certificate with its private key.
pub struct Credential {
    certificate: Certificate,
    key: Key,
    serial: u64,
    issuer: rcgen::Certificate,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("certificate", &self.certificate)
            .field("key", &self.key)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

impl Credential {
    /// The certificate.
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// The certificate's private key.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The serial number the certificate was issued with.
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

/// Mints roots, intermediates, and leaves.
#[derive(Debug, Clone)]
pub struct Generator {
    serials: Arc<SerialCounter>,
    scheme: SigScheme,
}

impl Default for Generator {
    fn default() -> Self {
        Self::with_counter(Default::default())
    }
}

impl Generator {
    /// A generator with its own serial counter, making Ed25519 keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// A generator drawing serials from `serials`.
    ///
    /// Generators sharing a counter never issue the same serial.
    pub fn with_counter(serials: Arc<SerialCounter>) -> Self {
        Self {
            serials,
            scheme: SIGSCHEME_ED25519,
        }
    }

    /// Make keys for a different scheme.
    pub fn with_scheme(mut self, scheme: SigScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Make a self-signed root, valid for about ten years.
    pub fn root(&self) -> Result<Credential, Error> {
        self.root_with(|_| {})
    }

    /// Make an intermediate signed by `issuer`, valid for about five years.
    pub fn intermediate(&self, issuer: &Credential) -> Result<Credential, Error> {
        self.intermediate_with(issuer, |_| {})
    }

    /// Make a leaf signed by `issuer`, valid for about a year.
    pub fn leaf(&self, issuer: &Credential) -> Result<Credential, Error> {
        self.leaf_with(issuer, |_| {})
    }

    /// Like [`root()`](Self::root), with `adjust` applied to the parameters before signing.
    ///
    /// Nothing stops `adjust` from producing a certificate the trust policy rejects.
    pub fn root_with(
        &self,
        adjust: impl FnOnce(&mut CertificateParams),
    ) -> Result<Credential, Error> {
        let key = Key::generate_for(self.scheme)?;
        let (serial, mut params) = self.ca_params("root", ROOT_VALIDITY)?;
        adjust(&mut params);
        let cert = params.self_signed(&*key.key)?;
        Self::credential(cert, key, serial)
    }

    /// Like [`intermediate()`](Self::intermediate), with `adjust` applied to the parameters
    /// before signing.
    pub fn intermediate_with(
        &self,
        issuer: &Credential,
        adjust: impl FnOnce(&mut CertificateParams),
    ) -> Result<Credential, Error> {
        let key = Key::generate_for(self.scheme)?;
        let (serial, mut params) = self.ca_params("intermediate", INTERMEDIATE_VALIDITY)?;
        adjust(&mut params);
        let cert = params.signed_by(&*key.key, &issuer.issuer, &*issuer.key.key)?;
        Self::credential(cert, key, serial)
    }

    /// Like [`leaf()`](Self::leaf), with `adjust` applied to the parameters before signing.
    pub fn leaf_with(
        &self,
        issuer: &Credential,
        adjust: impl FnOnce(&mut CertificateParams),
    ) -> Result<Credential, Error> {
        let key = Key::generate_for(self.scheme)?;
        let (serial, mut params) = self.params("leaf", LEAF_VALIDITY)?;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        adjust(&mut params);
        let cert = params.signed_by(&*key.key, &issuer.issuer, &*issuer.key.key)?;
        Self::credential(cert, key, serial)
    }

    fn ca_params(
        &self,
        role: &str,
        validity: Duration,
    ) -> Result<(u64, CertificateParams), Error> {
        let (serial, mut params) = self.params(role, validity)?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign];
        Ok((serial, params))
    }

    fn params(&self, role: &str, validity: Duration) -> Result<(u64, CertificateParams), Error> {
        let serial = self.serials.next_serial()?;

        let mut params = CertificateParams::default();
        params.serial_number = Some(SerialNumber::from(serial));
        params.distinguished_name = Dn::new();
        params
            .distinguished_name
            .push(DnType::CommonName, format!("nih {role} {serial}"));

        // start slightly in the past so that peers with skewed clocks accept fresh credentials
        let start = OffsetDateTime::now_utc() - Duration::MINUTE;
        params.not_before = start;
        params.not_after = start + validity;

        trace!(role, serial, "issuing certificate");
        Ok((serial, params))
    }

    fn credential(cert: rcgen::Certificate, key: Key, serial: u64) -> Result<Credential, Error> {
        Ok(Credential {
            certificate: Certificate::from_der(cert.der().clone())?,
            key,
            serial,
            issuer: cert,
        })
    }
}
