use std::sync::{Arc, LazyLock};

use rustls::{
    crypto::{CryptoProvider, WebPkiSupportedAlgorithms},
    pki_types::alg_id,
};
use tracing::trace;

static PROVIDER: LazyLock<Arc<CryptoProvider>> = LazyLock::new(|| {
    let mut provider = rustls::crypto::ring::default_provider();
    let algos = Box::leak(
        provider
            .signature_verification_algorithms
            .all
            .iter()
            .cloned()
            .filter(|a| a.public_key_alg_id() != alg_id::RSA_ENCRYPTION)
            .collect::<Vec<_>>()
            .into_boxed_slice(),
    );
    let mappings = Box::leak(
        provider
            .signature_verification_algorithms
            .mapping
            .iter()
            .cloned()
            .filter(|(sig, _)| sig.as_str().is_some_and(|s| !s.contains("RSA")))
            .collect::<Vec<_>>()
            .into_boxed_slice(),
    );
    provider.signature_verification_algorithms = WebPkiSupportedAlgorithms {
        all: algos,
        mapping: mappings,
    };
    trace!(?provider, "trust crypto provider");
    Arc::new(provider)
});

/// The [`CryptoProvider`] used by trust bundle TLS configurations.
///
/// This uses _ring_ and specifically disallows all uses of RSA, matching the certificate
/// algorithms the chain validator accepts.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    PROVIDER.clone()
}
