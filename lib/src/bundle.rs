use std::{fmt, fs, path::Path, sync::Arc};

use tracing::debug;

use crate::{
    Certificate, Error, Position, Signer, TlsConfig, pemfile,
    verify::{validate_root, verify_chain, verify_key_binding},
};

/// The credentials an instance uses to talk to the rest of the system.
///
/// A bundle is a certificate chain (leaf first), the private key for the leaf, and the set of
/// roots that peers' chains must lead to. All of it is validated once, when the bundle is made;
/// after that it's immutable and can be shared across any number of concurrent handshakes.
#[derive(Clone)]
pub struct TrustBundle {
    chain: Vec<Certificate>,
    key: Arc<dyn Signer>,
    roots: Vec<Certificate>,
}

impl fmt::Debug for TrustBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustBundle")
            .field("chain", &self.chain)
            .field("key", &self.key)
            .field("roots", &self.roots)
            .finish()
    }
}

impl TrustBundle {
    /// Validate and bundle a set of credentials.
    ///
    /// Each root must be a self-signed CA. The leaf `chain[0]` must pass the leaf policy, every
    /// intermediate the CA policy against `roots`, and the leaf must validate to `roots` through
    /// the intermediates. Finally, `key` must be the leaf's private key.
    ///
    /// The checks run on the certificates as given, then again on descriptors parsed afresh from
    /// their DER, which are what the bundle keeps.
    pub fn new(
        chain: Vec<Certificate>,
        key: impl Signer,
        roots: Vec<Certificate>,
    ) -> Result<Self, Error> {
        Self::with_signer(chain, Arc::new(key), roots)
    }

    /// Like [`new()`](TrustBundle::new), with a shared signer.
    pub fn with_signer(
        chain: Vec<Certificate>,
        key: Arc<dyn Signer>,
        roots: Vec<Certificate>,
    ) -> Result<Self, Error> {
        if chain.is_empty() {
            return Err(Error::EmptyChain);
        }

        if roots.is_empty() {
            return Err(Error::EmptyRoots);
        }

        validate(&chain, &roots)?;

        // the descriptors' policy fields are editable; peers only ever see the DER
        let chain = reparse(&chain)?;
        let roots = reparse(&roots)?;
        validate(&chain, &roots)?;

        let leaf = &chain[0];
        verify_key_binding(key.as_ref(), leaf)?;
        debug!(
            leaf = leaf.subject_name(),
            intermediates = chain.len() - 1,
            roots = roots.len(),
            "trust bundle accepted"
        );

        Ok(Self { chain, key, roots })
    }

    /// Load a bundle from PEM files.
    ///
    /// - `cert_file` holds `CERTIFICATE` blocks: the leaf first, then any intermediates.
    /// - `key_file` holds exactly one `PRIVATE KEY` block (PKCS#8).
    /// - `ca_file` holds one or more `CERTIFICATE` blocks, the trusted roots.
    ///
    /// Validation errors are reported against the file they concern.
    pub fn load(
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
        ca_file: impl AsRef<Path>,
    ) -> Result<Self, Error> {
        let cert_file = cert_file.as_ref();
        let key_file = key_file.as_ref();
        let ca_file = ca_file.as_ref();

        let chain = load_certificates(cert_file)?;
        let key = read(key_file).and_then(|text| {
            pemfile::decode_private_key(&text).map_err(|source| Error::Pem {
                file: key_file.into(),
                source,
            })
        })?;
        let roots = load_certificates(ca_file)?;

        Self::new(chain, key, roots).map_err(|err| {
            let file = match &err {
                Error::EmptyChain => cert_file,
                Error::EmptyRoots => ca_file,
                Error::PolicyViolation { position, .. } | Error::PathValidation { position, .. } => {
                    match position {
                        Position::Chain(_) => cert_file,
                        Position::Root(_) => ca_file,
                    }
                }
                _ => key_file,
            };
            err.in_file(file)
        })
    }

    /// Write the bundle out as PEM files, in the form [`load()`](TrustBundle::load) reads.
    ///
    /// On unix the key file is created readable by the owner only.
    pub fn write(
        &self,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
        ca_file: impl AsRef<Path>,
    ) -> Result<(), Error> {
        let key = pemfile::encode_private_key(self.key.as_ref())?;
        fs::write(cert_file, pemfile::encode_certificates(&self.chain))?;
        write_private(key_file.as_ref(), key.as_bytes())?;
        fs::write(ca_file, pemfile::encode_certificates(&self.roots))?;
        Ok(())
    }

    /// The validated leaf certificate.
    pub fn leaf(&self) -> &Certificate {
        &self.chain[0]
    }

    /// The certificate chain, leaf first.
    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    /// The trusted roots.
    pub fn roots(&self) -> &[Certificate] {
        &self.roots
    }

    /// The leaf's private key.
    pub fn key(&self) -> &Arc<dyn Signer> {
        &self.key
    }

    /// A TLS configuration backed by this bundle, usable by clients and servers alike.
    pub fn tls_config(&self) -> TlsConfig {
        TlsConfig::new(Arc::new(self.clone()))
    }
}

fn validate(chain: &[Certificate], roots: &[Certificate]) -> Result<(), Error> {
    for (i, root) in roots.iter().enumerate() {
        validate_root(root).map_err(|v| v.at(Position::Root(i)))?;
    }

    verify_chain(chain, roots)?;
    Ok(())
}

fn reparse(certs: &[Certificate]) -> Result<Vec<Certificate>, Error> {
    certs
        .iter()
        .map(|cert| Certificate::from_der(cert.der().clone()))
        .collect()
}

fn read(path: &Path) -> Result<String, Error> {
    fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.into(),
        source,
    })
}

fn load_certificates(path: &Path) -> Result<Vec<Certificate>, Error> {
    pemfile::decode_certificates(&read(path)?).map_err(|source| Error::Pem {
        file: path.into(),
        source,
    })
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::{io::Write, os::unix::fs::OpenOptionsExt};

    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?
        .write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)
}
