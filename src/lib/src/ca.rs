//! Certificate issuance for OS package signing.
//!
//! Two certificate tiers exist: a self-signed root CA and the signing
//! certificates it issues. Subjects carry no organizational meaning, so the
//! common name is simply the base64-encoded SHA-256 of the subject public
//! key, which is unique enough to satisfy issuer/subject chain matching.

use crate::error::TrustError;
use crate::keys::{
    self, KeyAlgorithm, KeyPair, SigningKey, VerifyingKey, CERTIFICATE_PEM_TYPE,
};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyUsagePurpose,
    SerialNumber,
};
use rustls_pki_types::CertificateDer;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};

pub const DEFAULT_CERT_NAME: &str = "cert.pem";
pub const DEFAULT_ROOT_CERT_NAME: &str = "rootcert.pem";
pub const DEFAULT_KEY_NAME: &str = "key.pem";
pub const DEFAULT_ROOT_KEY_NAME: &str = "rootkey.pem";

/// Signing certificates are meant to be short-lived.
pub const DEFAULT_VALIDITY: Duration = Duration::hours(72);

/// Serial numbers are drawn from a 128-bit range to avoid collisions.
const SERIAL_NUMBER_LEN: usize = 16;

/// Arguments for the file-level `certificate` operation.
#[derive(Debug, Default)]
pub struct CertificateArgs {
    pub is_ca: bool,
    /// Root certificate used to sign the new certificate. Ignored with a
    /// warning if `is_ca` is set.
    pub issuer_cert: Option<PathBuf>,
    /// Private key of the issuer. In CA mode this is the key the root
    /// certificate is created for.
    pub issuer_key: Option<PathBuf>,
    /// Public key to certify (PEM or OpenSSH). If absent, a fresh key pair
    /// is generated and its private half written to `key_out`.
    pub subject_key: Option<PathBuf>,
    pub algorithm: Option<KeyAlgorithm>,
    pub not_before: Option<OffsetDateTime>,
    pub not_after: Option<OffsetDateTime>,
    pub cert_out: Option<PathBuf>,
    pub key_out: Option<PathBuf>,
}

/// Create a new certificate, and possibly a new private key, on disk.
pub fn certificate(args: &CertificateArgs) -> Result<(), TrustError> {
    let mut issuer_cert = args.issuer_cert.as_deref();
    if args.is_ca && issuer_cert.is_some() {
        log::warn!("isCA specified, will ignore rootCert");
        issuer_cert = None;
    }
    if !args.is_ca && issuer_cert.is_none() && args.issuer_key.is_some() {
        return Err(TrustError::NoRootCert);
    }

    let key_out = default_path(args.key_out.as_deref(), args.is_ca, DEFAULT_ROOT_KEY_NAME, DEFAULT_KEY_NAME)?;
    let cert_out = default_path(args.cert_out.as_deref(), args.is_ca, DEFAULT_ROOT_CERT_NAME, DEFAULT_CERT_NAME)?;

    let algorithm = args.algorithm.unwrap_or(KeyAlgorithm::Ed25519);
    let not_before = args.not_before.unwrap_or_else(OffsetDateTime::now_utc);
    let not_after = args.not_after.unwrap_or(not_before + DEFAULT_VALIDITY);

    let (cert_der, new_key) = match issuer_cert {
        None => {
            // Self-signed certificate, with either a supplied or fresh key.
            let supplied = match &args.issuer_key {
                Some(path) => Some(SigningKey::from_file(path)?),
                None => None,
            };
            issue_root(supplied.as_ref(), algorithm, not_before, not_after)?
        }
        Some(cert_path) => {
            // Both halves of the issuer material must be present.
            let key_path = args.issuer_key.as_deref().ok_or(TrustError::NoRootKey)?;
            let issuer_der = keys::load_certificate_der(cert_path)?;
            let issuer_key = SigningKey::from_file(key_path)?;

            let subject = match &args.subject_key {
                Some(path) => Some(VerifyingKey::from_file(path)?),
                None => None,
            };
            issue_leaf(
                &issuer_der,
                &issuer_key,
                subject.as_ref(),
                algorithm,
                not_before,
                not_after,
            )?
        }
    };

    if let Some(kp) = new_key {
        kp.signing.to_file(&key_out)?;
        log::info!("New private key written to {}", key_out.display());
    }
    keys::write_pem_file(&cert_out, CERTIFICATE_PEM_TYPE, &cert_der)?;
    log::info!("New certificate written to {}", cert_out.display());

    Ok(())
}

/// Issue a self-signed CA certificate. Returns the fresh key pair when no
/// key was supplied; the caller must persist it.
pub fn issue_root(
    key: Option<&SigningKey>,
    algorithm: KeyAlgorithm,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> Result<(Vec<u8>, Option<KeyPair>), TrustError> {
    let (signing, generated) = match key {
        Some(sk) => (sk.clone(), None),
        None => {
            let kp = KeyPair::generate(algorithm);
            (kp.signing.clone(), Some(kp))
        }
    };

    let mut params = base_params(&signing.verifying_key(), not_before, not_after)?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];

    let keypair = rcgen_keypair(&signing)?;
    let cert = params.self_signed(&keypair)?;

    Ok((cert.der().to_vec(), generated))
}

/// Issue a certificate signed by the given CA. The subject key is either
/// supplied (public-key-only certification, no private key returned) or
/// freshly generated.
pub fn issue_leaf(
    issuer_cert_der: &[u8],
    issuer_key: &SigningKey,
    subject_key: Option<&VerifyingKey>,
    algorithm: KeyAlgorithm,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> Result<(Vec<u8>, Option<KeyPair>), TrustError> {
    let (subject, generated) = match subject_key {
        Some(vk) => (vk.clone(), None),
        None => {
            let kp = KeyPair::generate(algorithm);
            (kp.verifying.clone(), Some(kp))
        }
    };

    let mut params = base_params(&subject, not_before, not_after)?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

    // rcgen needs the issuer as a Certificate, which we only have as DER.
    // Rebuilding it from its own parameters preserves the distinguished
    // name, so issuer/subject chain matching against the original root
    // still holds.
    let issuer_der = CertificateDer::from(issuer_cert_der.to_vec());
    let issuer_params = CertificateParams::from_ca_cert_der(&issuer_der)
        .map_err(|e| TrustError::X509Error(format!("failed to parse issuer certificate: {}", e)))?;
    let issuer_keypair = rcgen_keypair(issuer_key)?;
    let issuer_cert = issuer_params.self_signed(&issuer_keypair)?;

    let subject_keypair = match generated.as_ref() {
        Some(kp) => rcgen_keypair(&kp.signing)?,
        None => remote_subject_keypair(&subject)?,
    };

    let cert = params.signed_by(&subject_keypair, &issuer_cert, &issuer_keypair)?;

    Ok((cert.der().to_vec(), generated))
}

/// Common certificate parameters: unique subject, random wide serial.
fn base_params(
    subject: &VerifyingKey,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> Result<CertificateParams, TrustError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject.key_hash_base64());
    params.distinguished_name = dn;

    params.not_before = not_before;
    params.not_after = not_after;

    let mut serial = [0u8; SERIAL_NUMBER_LEN];
    getrandom::getrandom(&mut serial)
        .map_err(|e| TrustError::InternalError(format!("random serial: {}", e)))?;
    params.serial_number = Some(SerialNumber::from(serial.to_vec()));

    Ok(params)
}

fn rcgen_keypair(key: &SigningKey) -> Result<rcgen::KeyPair, TrustError> {
    let pem = key.to_pkcs8_pem()?;
    rcgen::KeyPair::from_pem(&pem)
        .map_err(|e| TrustError::CertificateError(format!("failed to load key pair: {}", e)))
}

/// A subject for which only the public key is known. rcgen never calls
/// `sign` on the subject key when the certificate is signed by an issuer.
struct SubjectPublicKey {
    raw: Vec<u8>,
    algorithm: &'static rcgen::SignatureAlgorithm,
}

impl rcgen::RemoteKeyPair for SubjectPublicKey {
    fn public_key(&self) -> &[u8] {
        &self.raw
    }

    fn sign(&self, _msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        Err(rcgen::Error::RemoteKeyError)
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        self.algorithm
    }
}

fn remote_subject_keypair(subject: &VerifyingKey) -> Result<rcgen::KeyPair, TrustError> {
    let algorithm = match subject.algorithm() {
        KeyAlgorithm::Ed25519 => &rcgen::PKCS_ED25519,
        KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
    };
    rcgen::KeyPair::from_remote(Box::new(SubjectPublicKey {
        raw: subject.raw_bytes(),
        algorithm,
    }))
    .map_err(|e| TrustError::CertificateError(format!("failed to wrap subject key: {}", e)))
}

/// Resolve an output path, defaulting by CA mode; the parent directory of
/// an explicit path must already exist.
fn default_path(
    path: Option<&Path>,
    is_ca: bool,
    ca_default: &str,
    default: &str,
) -> Result<PathBuf, TrustError> {
    match path {
        None => Ok(PathBuf::from(if is_ca { ca_default } else { default })),
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(TrustError::IOError(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("directory {} does not exist", parent.display()),
                    )));
                }
            }
            Ok(path.to_path_buf())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    fn window() -> (OffsetDateTime, OffsetDateTime) {
        let now = OffsetDateTime::now_utc();
        (now - Duration::hours(1), now + DEFAULT_VALIDITY)
    }

    #[test]
    fn test_issue_root_structure() {
        let (nb, na) = window();
        let (der, kp) = issue_root(None, KeyAlgorithm::Ed25519, nb, na).unwrap();
        let kp = kp.expect("fresh key pair expected");

        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        assert_eq!(cert.issuer(), cert.subject());
        assert!(cert.basic_constraints().unwrap().map(|bc| bc.value.ca).unwrap_or(false));

        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(cn, kp.verifying.key_hash_base64());
    }

    #[test]
    fn test_issue_root_with_supplied_key_returns_no_keypair() {
        let (nb, na) = window();
        let kp = KeyPair::generate(KeyAlgorithm::Ed25519);
        let (der, generated) = issue_root(Some(&kp.signing), KeyAlgorithm::Ed25519, nb, na).unwrap();
        assert!(generated.is_none());
        assert!(!der.is_empty());
    }

    #[test]
    fn test_issue_leaf_chains_to_root() {
        let (nb, na) = window();
        let (root_der, root_kp) = issue_root(None, KeyAlgorithm::Ed25519, nb, na).unwrap();
        let root_kp = root_kp.unwrap();

        let (leaf_der, leaf_kp) =
            issue_leaf(&root_der, &root_kp.signing, None, KeyAlgorithm::Ed25519, nb, na).unwrap();
        assert!(leaf_kp.is_some());

        let (_, root) = X509Certificate::from_der(&root_der).unwrap();
        let (_, leaf) = X509Certificate::from_der(&leaf_der).unwrap();
        assert_eq!(leaf.issuer(), root.subject());
        assert_ne!(leaf.subject(), root.subject());
    }

    #[test]
    fn test_issue_leaf_for_supplied_public_key() {
        let (nb, na) = window();
        let (root_der, root_kp) = issue_root(None, KeyAlgorithm::Ed25519, nb, na).unwrap();
        let root_kp = root_kp.unwrap();

        let subject = KeyPair::generate(KeyAlgorithm::Ed25519);
        let (leaf_der, generated) = issue_leaf(
            &root_der,
            &root_kp.signing,
            Some(&subject.verifying),
            KeyAlgorithm::Ed25519,
            nb,
            na,
        )
        .unwrap();
        assert!(generated.is_none());

        // The certified key must be the supplied one.
        let embedded = VerifyingKey::from_certificate_der(&leaf_der).unwrap();
        assert_eq!(embedded.raw_bytes(), subject.verifying.raw_bytes());
    }

    #[test]
    fn test_serial_numbers_differ() {
        let (nb, na) = window();
        let (der1, _) = issue_root(None, KeyAlgorithm::Ed25519, nb, na).unwrap();
        let (der2, _) = issue_root(None, KeyAlgorithm::Ed25519, nb, na).unwrap();
        let (_, cert1) = X509Certificate::from_der(&der1).unwrap();
        let (_, cert2) = X509Certificate::from_der(&der2).unwrap();
        assert_ne!(cert1.serial, cert2.serial);
    }

    #[test]
    fn test_certificate_args_missing_root_key() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("root.pem");
        std::fs::write(&cert_path, "placeholder").unwrap();

        let args = CertificateArgs {
            issuer_cert: Some(cert_path),
            cert_out: Some(dir.path().join("cert.pem")),
            key_out: Some(dir.path().join("key.pem")),
            ..Default::default()
        };
        assert!(matches!(certificate(&args), Err(TrustError::NoRootKey)));
    }

    #[test]
    fn test_certificate_files_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let root_cert = dir.path().join("rootcert.pem");
        let root_key = dir.path().join("rootkey.pem");

        certificate(&CertificateArgs {
            is_ca: true,
            cert_out: Some(root_cert.clone()),
            key_out: Some(root_key.clone()),
            ..Default::default()
        })
        .unwrap();

        certificate(&CertificateArgs {
            issuer_cert: Some(root_cert.clone()),
            issuer_key: Some(root_key),
            cert_out: Some(dir.path().join("cert.pem")),
            key_out: Some(dir.path().join("key.pem")),
            ..Default::default()
        })
        .unwrap();

        let root_der = keys::load_certificate_der(&root_cert).unwrap();
        let leaf_der = keys::load_certificate_der(dir.path().join("cert.pem")).unwrap();
        let (_, root) = X509Certificate::from_der(&root_der).unwrap();
        let (_, leaf) = X509Certificate::from_der(&leaf_der).unwrap();
        assert_eq!(leaf.issuer(), root.subject());
    }
}
