//! PEM encoding of certificates and private keys.
//!
//! Certificate files are sequences of `CERTIFICATE` blocks whose order is meaningful: for a chain
//! it's the leaf first, then intermediates from nearest to furthest. Key files hold a single
//! `PRIVATE KEY` block, and nothing else, containing the PKCS#8 DER form of the key.

use pem::Pem;

use crate::{Certificate, Error, Key, Signer};

const CERTIFICATE_TAG: &str = "CERTIFICATE";
const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";

/// Why PEM material couldn't be decoded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The text isn't well-formed PEM.
    #[error("malformed PEM: {0}")]
    Pem(#[from] pem::PemError),

    /// The first block isn't a `PRIVATE KEY`.
    #[error("no private key found")]
    NoPrivateKey,

    /// The `PRIVATE KEY` block is followed by other blocks.
    #[error("expected a single PRIVATE KEY block, found {0} blocks")]
    ExtraBlocks(usize),

    /// A `CERTIFICATE` block doesn't hold a valid certificate.
    #[error("certificate block {index}: {source}")]
    Certificate {
        /// Which certificate block, counting from zero.
        index: usize,
        #[source]
        source: Box<Error>,
    },

    /// The `PRIVATE KEY` block doesn't hold a usable key.
    #[error("private key: {0}")]
    Key(#[source] Box<Error>),
}

/// Encode certificates as concatenated `CERTIFICATE` blocks, in order.
pub fn encode_certificates(certs: &[Certificate]) -> String {
    let blocks: Vec<Pem> = certs
        .iter()
        .map(|cert| Pem::new(CERTIFICATE_TAG, cert.der().to_vec()))
        .collect();
    pem::encode_many(&blocks)
}

/// Encode a private key as a single `PRIVATE KEY` block.
pub fn encode_private_key(key: &dyn Signer) -> Result<String, Error> {
    Ok(pem::encode(&Pem::new(PRIVATE_KEY_TAG, key.to_pkcs8_der()?)))
}

/// Decode the `CERTIFICATE` blocks of a PEM file, in file order.
///
/// Blocks of other types are skipped.
pub fn decode_certificates(text: &str) -> Result<Vec<Certificate>, DecodeError> {
    pem::parse_many(text)?
        .into_iter()
        .filter(|block| block.tag() == CERTIFICATE_TAG)
        .enumerate()
        .map(|(index, block)| {
            Certificate::from_der(block.into_contents()).map_err(|err| {
                DecodeError::Certificate {
                    index,
                    source: Box::new(err),
                }
            })
        })
        .collect()
}

/// Decode a private key from a PEM file.
///
/// The file must hold exactly one block, a `PRIVATE KEY`.
pub fn decode_private_key(text: &str) -> Result<Key, DecodeError> {
    let blocks = pem::parse_many(text)?;
    let block = match blocks.as_slice() {
        [block] if block.tag() == PRIVATE_KEY_TAG => block,
        [block, ..] if block.tag() == PRIVATE_KEY_TAG => {
            return Err(DecodeError::ExtraBlocks(blocks.len()));
        }
        _ => return Err(DecodeError::NoPrivateKey),
    };

    Key::from_pkcs8_der(block.contents()).map_err(|err| DecodeError::Key(Box::new(err)))
}
