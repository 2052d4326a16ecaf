use std::sync::LazyLock;

use nih_trust::{
    Certificate, Credential, Error, ExtKeyUsage, Generator, Key, KeyUsage, PathError, Position,
    Rule, SIGSCHEME_ECDSA256, SIGSCHEME_ECDSA384, TrustBundle,
    rcgen::{
        BasicConstraints, CertificateParams, CustomExtension, ExtendedKeyUsagePurpose, IsCa,
        KeyPair, KeyUsagePurpose,
    },
    verify::verify_chain_at,
};
use time::Duration;
use x509_parser::error::X509Error;

const OID_EXT_KEY_USAGE: &[u64] = &[2, 5, 29, 37];
// SEQUENCE { id-kp-codeSigning }
const CODE_SIGNING: &[u8] = &[
    0x30, 0x0a, 0x06, 0x08, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x03, 0x03,
];

static SETUP: LazyLock<()> = LazyLock::new(|| {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
});

struct Pki {
    root: Credential,
    intermediate: Credential,
    leaf: Credential,
}

impl Pki {
    fn new(generator: &Generator) -> Self {
        let root = generator.root().unwrap();
        let intermediate = generator.intermediate(&root).unwrap();
        let leaf = generator.leaf(&intermediate).unwrap();
        Self {
            root,
            intermediate,
            leaf,
        }
    }

    fn chain(&self) -> Vec<Certificate> {
        vec![
            self.leaf.certificate().clone(),
            self.intermediate.certificate().clone(),
        ]
    }

    fn roots(&self) -> Vec<Certificate> {
        vec![self.root.certificate().clone()]
    }

    fn key(&self) -> Key {
        self.leaf.key().clone()
    }

    fn bundle(&self) -> Result<TrustBundle, Error> {
        TrustBundle::new(self.chain(), self.key(), self.roots())
    }
}

fn assert_policy(result: Result<TrustBundle, Error>, position: Position, rule: Rule) {
    match result {
        Err(Error::PolicyViolation {
            position: p,
            rule: r,
        }) => {
            assert_eq!(p, position);
            assert_eq!(r, rule);
        }
        other => panic!("expected {position}: {rule}, got {other:?}"),
    }
}

fn assert_path(result: Result<TrustBundle, Error>, position: Position, cause: PathError) {
    match result {
        Err(Error::PathValidation {
            position: p,
            cause: c,
        }) => {
            assert_eq!(p, position);
            assert_eq!(c, cause);
        }
        other => panic!("expected {position}: {cause}, got {other:?}"),
    }
}

#[test]
fn valid_bundle() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let bundle = pki.bundle().unwrap();
    assert_eq!(bundle.leaf(), pki.leaf.certificate());
    assert_eq!(bundle.chain().len(), 2);
    assert_eq!(bundle.roots(), pki.roots());
    assert_eq!(
        bundle.key().subject_public_key_info(),
        pki.leaf.certificate().public_key.spki
    );
}

#[test]
fn ecdsa_p256_bundle() {
    *SETUP;

    let pki = Pki::new(&Generator::new().with_scheme(SIGSCHEME_ECDSA256));
    pki.bundle().unwrap();
}

#[test]
fn ecdsa_p384_bundle() {
    *SETUP;

    let pki = Pki::new(&Generator::new().with_scheme(SIGSCHEME_ECDSA384));
    pki.bundle().unwrap();
}

#[test]
fn leaf_signed_by_root() {
    *SETUP;

    let generator = Generator::new();
    let root = generator.root().unwrap();
    let leaf = generator.leaf(&root).unwrap();
    TrustBundle::new(
        vec![leaf.certificate().clone()],
        leaf.key().clone(),
        vec![root.certificate().clone()],
    )
    .unwrap();
}

#[test]
fn empty_chain() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let err = TrustBundle::new(Vec::new(), pki.key(), pki.roots()).unwrap_err();
    assert!(matches!(err, Error::EmptyChain), "{err:?}");
}

#[test]
fn empty_roots() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let err = TrustBundle::new(pki.chain(), pki.key(), Vec::new()).unwrap_err();
    assert!(matches!(err, Error::EmptyRoots), "{err:?}");
}

#[test]
fn leaf_is_ca() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let mut chain = pki.chain();
    chain[0].is_ca = true;
    assert_policy(
        TrustBundle::new(chain, pki.key(), pki.roots()),
        Position::Chain(0),
        Rule::IsCa,
    );
}

#[test]
fn leaf_without_basic_constraints() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let mut chain = pki.chain();
    chain[0].basic_constraints_valid = false;
    assert_policy(
        TrustBundle::new(chain, pki.key(), pki.roots()),
        Position::Chain(0),
        Rule::BasicConstraintsInvalid,
    );
}

#[test]
fn leaf_with_cert_sign() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let mut chain = pki.chain();
    chain[0].key_usage = KeyUsage::DIGITAL_SIGNATURE | KeyUsage::CERT_SIGN;
    assert_policy(
        TrustBundle::new(chain, pki.key(), pki.roots()),
        Position::Chain(0),
        Rule::KeyUsage,
    );
}

#[test]
fn leaf_server_only() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let mut chain = pki.chain();
    chain[0].ext_key_usage = vec![ExtKeyUsage::ServerAuth];
    assert_policy(
        TrustBundle::new(chain, pki.key(), pki.roots()),
        Position::Chain(0),
        Rule::ExtendedKeyUsage,
    );
}

#[test]
fn leaf_with_extra_usage() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let mut chain = pki.chain();
    chain[0].ext_key_usage.push(ExtKeyUsage::CodeSigning);
    assert_policy(
        TrustBundle::new(chain, pki.key(), pki.roots()),
        Position::Chain(0),
        Rule::ExtendedKeyUsage,
    );
}

#[test]
fn intermediate_not_ca() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let mut chain = pki.chain();
    chain[1].is_ca = false;
    assert_policy(
        TrustBundle::new(chain, pki.key(), pki.roots()),
        Position::Chain(1),
        Rule::NotCa,
    );
}

#[test]
fn intermediate_with_digital_signature() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let mut chain = pki.chain();
    chain[1].key_usage = KeyUsage::CERT_SIGN | KeyUsage::DIGITAL_SIGNATURE;
    assert_policy(
        TrustBundle::new(chain, pki.key(), pki.roots()),
        Position::Chain(1),
        Rule::KeyUsage,
    );
}

#[test]
fn intermediate_with_ext_key_usage() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let mut chain = pki.chain();
    chain[1].ext_key_usage = vec![ExtKeyUsage::ServerAuth];
    assert_policy(
        TrustBundle::new(chain, pki.key(), pki.roots()),
        Position::Chain(1),
        Rule::ExtendedKeyUsage,
    );
}

#[test]
fn root_not_ca() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let mut roots = pki.roots();
    roots[0].is_ca = false;
    assert_policy(
        TrustBundle::new(pki.chain(), pki.key(), roots),
        Position::Root(0),
        Rule::NotCa,
    );
}

#[test]
fn root_without_key_usage() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let mut roots = pki.roots();
    roots[0].key_usage = KeyUsage::NONE;
    assert_policy(
        TrustBundle::new(pki.chain(), pki.key(), roots),
        Position::Root(0),
        Rule::KeyUsage,
    );
}

#[test]
fn second_root_checked() {
    *SETUP;

    let generator = Generator::new();
    let pki = Pki::new(&generator);
    let other = Pki::new(&generator);
    let mut roots = pki.roots();
    roots.push(other.leaf.certificate().clone());
    assert_policy(
        TrustBundle::new(pki.chain(), pki.key(), roots),
        Position::Root(1),
        Rule::NotCa,
    );
}

#[test]
fn chain_in_wrong_order() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let mut chain = pki.chain();
    chain.reverse();
    assert_policy(
        TrustBundle::new(chain, pki.key(), pki.roots()),
        Position::Chain(0),
        Rule::IsCa,
    );
}

#[test]
fn key_mismatch() {
    *SETUP;

    let generator = Generator::new();
    let pki = Pki::new(&generator);
    let other = generator.leaf(&pki.intermediate).unwrap();
    let err = TrustBundle::new(pki.chain(), other.key().clone(), pki.roots()).unwrap_err();
    assert!(matches!(err, Error::KeyBindingMismatch), "{err:?}");
}

#[test]
fn key_of_other_scheme() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let key = Key::generate_for(SIGSCHEME_ECDSA256).unwrap();
    let err = TrustBundle::new(pki.chain(), key, pki.roots()).unwrap_err();
    assert!(matches!(err, Error::KeyBindingMismatch), "{err:?}");
}

#[test]
fn foreign_root() {
    *SETUP;

    let generator = Generator::new();
    let pki = Pki::new(&generator);
    let other = Pki::new(&generator);
    assert_path(
        TrustBundle::new(pki.chain(), pki.key(), other.roots()),
        Position::Chain(1),
        PathError::UnknownIssuer,
    );
}

#[test]
fn impostor_root() {
    *SETUP;

    // independent counters issue the same names, so only the signature tells the roots apart
    let pki = Pki::new(&Generator::new());
    let other = Pki::new(&Generator::new());
    assert_eq!(
        pki.root.certificate().subject,
        other.root.certificate().subject
    );
    assert_path(
        TrustBundle::new(pki.chain(), pki.key(), other.roots()),
        Position::Chain(1),
        PathError::BadSignature,
    );
}

#[test]
fn missing_intermediate() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    assert_path(
        TrustBundle::new(
            vec![pki.leaf.certificate().clone()],
            pki.key(),
            pki.roots(),
        ),
        Position::Chain(0),
        PathError::UnknownIssuer,
    );
}

#[test]
fn intermediates_must_be_issued_by_roots() {
    *SETUP;

    let generator = Generator::new();
    let root = generator.root().unwrap();
    let upper = generator.intermediate(&root).unwrap();
    let lower = generator.intermediate(&upper).unwrap();
    let leaf = generator.leaf(&lower).unwrap();
    assert_path(
        TrustBundle::new(
            vec![
                leaf.certificate().clone(),
                lower.certificate().clone(),
                upper.certificate().clone(),
            ],
            leaf.key().clone(),
            vec![root.certificate().clone()],
        ),
        Position::Chain(1),
        PathError::UnknownIssuer,
    );
}

#[test]
fn expired_leaf() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let chain = pki.chain();
    let later = chain[0].not_after + Duration::days(1);
    let err = verify_chain_at(&chain, &pki.roots(), later).unwrap_err();
    assert!(
        matches!(
            err,
            Error::PathValidation {
                position: Position::Chain(0),
                cause: PathError::Expired
            }
        ),
        "{err:?}"
    );
}

#[test]
fn expired_intermediate() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let chain = pki.chain();
    let later = chain[1].not_after + Duration::days(1);
    let err = verify_chain_at(&chain, &pki.roots(), later).unwrap_err();
    assert!(
        matches!(
            err,
            Error::PathValidation {
                position: Position::Chain(1),
                cause: PathError::Expired
            }
        ),
        "{err:?}"
    );
}

#[test]
fn not_yet_valid() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let chain = pki.chain();
    let earlier = chain[0].not_before - Duration::days(1);
    let err = verify_chain_at(&chain, &pki.roots(), earlier).unwrap_err();
    assert!(
        matches!(
            err,
            Error::PathValidation {
                cause: PathError::NotYetValid,
                ..
            }
        ),
        "{err:?}"
    );
}

#[test]
fn error_names_position_and_rule() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let mut chain = pki.chain();
    chain[0].ext_key_usage = vec![ExtKeyUsage::ClientAuth];
    let err = TrustBundle::new(chain, pki.key(), pki.roots()).unwrap_err();
    assert_eq!(err.to_string(), "chain[0]: invalid extended key usage");
}

#[test]
fn root_without_basic_constraints() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let mut roots = pki.roots();
    roots[0].basic_constraints_valid = false;
    assert_policy(
        TrustBundle::new(pki.chain(), pki.key(), roots),
        Position::Root(0),
        Rule::BasicConstraintsInvalid,
    );
}

#[test]
fn root_with_ext_key_usage() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let mut roots = pki.roots();
    roots[0].ext_key_usage = vec![ExtKeyUsage::ClientAuth];
    assert_policy(
        TrustBundle::new(pki.chain(), pki.key(), roots),
        Position::Root(0),
        Rule::ExtendedKeyUsage,
    );
}

#[test]
fn intermediate_without_basic_constraints() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let mut chain = pki.chain();
    chain[1].basic_constraints_valid = false;
    assert_policy(
        TrustBundle::new(chain, pki.key(), pki.roots()),
        Position::Chain(1),
        Rule::BasicConstraintsInvalid,
    );
}

fn ca_der(extensions: Vec<CustomExtension>) -> Vec<u8> {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign];
    params.custom_extensions = extensions;
    let key = KeyPair::generate().unwrap();
    params.self_signed(&key).unwrap().der().to_vec()
}

#[test]
fn duplicate_ext_key_usage_rejected() {
    *SETUP;

    let der = ca_der(vec![
        CustomExtension::from_oid_content(OID_EXT_KEY_USAGE, CODE_SIGNING.to_vec()),
        CustomExtension::from_oid_content(OID_EXT_KEY_USAGE, CODE_SIGNING.to_vec()),
    ]);
    let err = Certificate::from_der(der).unwrap_err();
    assert!(
        matches!(err, Error::Parse(X509Error::DuplicateExtensions)),
        "{err:?}"
    );

    let generator = Generator::new();
    let root = generator.root().unwrap();
    let err = generator
        .intermediate_with(&root, |p| {
            p.custom_extensions = vec![
                CustomExtension::from_oid_content(OID_EXT_KEY_USAGE, CODE_SIGNING.to_vec()),
                CustomExtension::from_oid_content(OID_EXT_KEY_USAGE, CODE_SIGNING.to_vec()),
            ]
        })
        .unwrap_err();
    assert!(matches!(err, Error::Parse(_)), "{err:?}");
}

#[test]
fn malformed_ext_key_usage_rejected() {
    *SETUP;

    // an empty OCTET STRING where a SEQUENCE of purposes belongs
    let der = ca_der(vec![CustomExtension::from_oid_content(
        OID_EXT_KEY_USAGE,
        vec![0x04, 0x00],
    )]);
    let err = Certificate::from_der(der).unwrap_err();
    assert!(
        matches!(err, Error::Parse(X509Error::InvalidExtensions)),
        "{err:?}"
    );
}

#[test]
fn root_path_length_too_short() {
    *SETUP;

    let generator = Generator::new();
    let root = generator
        .root_with(|p| p.is_ca = IsCa::Ca(BasicConstraints::Constrained(0)))
        .unwrap();
    let intermediate = generator.intermediate(&root).unwrap();
    let leaf = generator.leaf(&intermediate).unwrap();
    assert_path(
        TrustBundle::new(
            vec![
                leaf.certificate().clone(),
                intermediate.certificate().clone(),
            ],
            leaf.key().clone(),
            vec![root.certificate().clone()],
        ),
        Position::Chain(0),
        PathError::PathLenExceeded,
    );
}

#[test]
fn root_path_length_zero_signs_leaves() {
    *SETUP;

    let generator = Generator::new();
    let root = generator
        .root_with(|p| p.is_ca = IsCa::Ca(BasicConstraints::Constrained(0)))
        .unwrap();
    let leaf = generator.leaf(&root).unwrap();
    TrustBundle::new(
        vec![leaf.certificate().clone()],
        leaf.key().clone(),
        vec![root.certificate().clone()],
    )
    .unwrap();
}

#[test]
fn intermediate_with_unknown_critical_extension() {
    *SETUP;

    let generator = Generator::new();
    let root = generator.root().unwrap();
    let intermediate = generator
        .intermediate_with(&root, |p| {
            let mut ext =
                CustomExtension::from_oid_content(&[1, 3, 6, 1, 4, 1, 55555, 1], vec![0x05, 0x00]);
            ext.set_criticality(true);
            p.custom_extensions.push(ext);
        })
        .unwrap();
    assert_eq!(
        intermediate.certificate().unhandled_critical_extensions(),
        ["1.3.6.1.4.1.55555.1"]
    );

    let leaf = generator.leaf(&intermediate).unwrap();
    assert_path(
        TrustBundle::new(
            vec![
                leaf.certificate().clone(),
                intermediate.certificate().clone(),
            ],
            leaf.key().clone(),
            vec![root.certificate().clone()],
        ),
        Position::Chain(1),
        PathError::UnhandledCriticalExtension,
    );
}

#[test]
fn unknown_noncritical_extension_ignored() {
    *SETUP;

    let generator = Generator::new();
    let root = generator.root().unwrap();
    let intermediate = generator
        .intermediate_with(&root, |p| {
            p.custom_extensions.push(CustomExtension::from_oid_content(
                &[1, 3, 6, 1, 4, 1, 55555, 1],
                vec![0x05, 0x00],
            ));
        })
        .unwrap();
    let leaf = generator.leaf(&intermediate).unwrap();
    TrustBundle::new(
        vec![
            leaf.certificate().clone(),
            intermediate.certificate().clone(),
        ],
        leaf.key().clone(),
        vec![root.certificate().clone()],
    )
    .unwrap();
}

#[test]
fn edited_descriptor_does_not_hide_der() {
    *SETUP;

    let generator = Generator::new();
    let root = generator.root().unwrap();
    let intermediate = generator.intermediate(&root).unwrap();
    let leaf = generator
        .leaf_with(&intermediate, |p| {
            p.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth]
        })
        .unwrap();

    let mut chain = vec![
        leaf.certificate().clone(),
        intermediate.certificate().clone(),
    ];
    chain[0].ext_key_usage = vec![ExtKeyUsage::ClientAuth, ExtKeyUsage::ServerAuth];
    assert_policy(
        TrustBundle::new(chain, leaf.key().clone(), vec![root.certificate().clone()]),
        Position::Chain(0),
        Rule::ExtendedKeyUsage,
    );
}

#[test]
fn peer_presenting_a_ca_as_leaf() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let config = pki.bundle().unwrap().tls_config();
    let err = config
        .verify_peer_chain(&[pki.intermediate.certificate().der().clone()])
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::PolicyViolation {
                position: Position::Chain(0),
                rule: Rule::IsCa
            }
        ),
        "{err:?}"
    );
}

#[test]
fn peer_with_server_only_leaf() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let config = pki.bundle().unwrap().tls_config();
    let leaf = Generator::new()
        .leaf_with(&pki.intermediate, |p| {
            p.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth]
        })
        .unwrap();
    let err = config
        .verify_peer_chain(&[
            leaf.certificate().der().clone(),
            pki.intermediate.certificate().der().clone(),
        ])
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::PolicyViolation {
                position: Position::Chain(0),
                rule: Rule::ExtendedKeyUsage
            }
        ),
        "{err:?}"
    );
}

#[test]
fn peer_chain_accepted() {
    *SETUP;

    let pki = Pki::new(&Generator::new());
    let config = pki.bundle().unwrap().tls_config();
    let peer = config
        .verify_peer_chain(&[
            pki.leaf.certificate().der().clone(),
            pki.intermediate.certificate().der().clone(),
        ])
        .unwrap();
    assert_eq!(&peer, pki.leaf.certificate());
}
