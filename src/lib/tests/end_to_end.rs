//! Full provisioning flow: root CA, signing certificate, package
//! creation, signing, proof attachment and verification, all through the
//! file-level operations a host administrator would use.

use ostrust::ca::{self, CertificateArgs};
use ostrust::hash::sha256;
use ostrust::keys::{self, KeyAlgorithm, SigningKey, VerifyingKey};
use ostrust::package::{self, CreateArgs, OsPackage};
use ostrust::sigsum;
use ostrust::trustpolicy::{SIGNING_ROOT_NAME, TRUST_POLICY_NAME};
use ostrust::verify;
use ostrust::TrustError;

use std::fs;
use std::path::{Path, PathBuf};

struct Setup {
    _dir: tempfile::TempDir,
    root_cert: PathBuf,
    leaf_cert: PathBuf,
    leaf_key: PathBuf,
    pkg: String,
}

fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let root_cert = dir.path().join("rootcert.pem");
    let root_key = dir.path().join("rootkey.pem");
    let leaf_cert = dir.path().join("cert.pem");
    let leaf_key = dir.path().join("key.pem");

    ca::certificate(&CertificateArgs {
        is_ca: true,
        cert_out: Some(root_cert.clone()),
        key_out: Some(root_key.clone()),
        ..Default::default()
    })
    .unwrap();

    ca::certificate(&CertificateArgs {
        issuer_cert: Some(root_cert.clone()),
        issuer_key: Some(root_key),
        cert_out: Some(leaf_cert.clone()),
        key_out: Some(leaf_key.clone()),
        ..Default::default()
    })
    .unwrap();

    let kernel = dir.path().join("vmlinuz");
    let initramfs = dir.path().join("initramfs.cpio");
    fs::write(&kernel, b"kernel payload").unwrap();
    fs::write(&initramfs, b"initramfs payload").unwrap();

    let pkg = dir.path().join("pkg").to_str().unwrap().to_string();
    package::create(&CreateArgs {
        out: pkg.clone(),
        label: "test package".to_string(),
        url: String::new(),
        kernel,
        initramfs: Some(initramfs),
        cmdline: "console=ttyS0".to_string(),
    })
    .unwrap();

    Setup {
        _dir: dir,
        root_cert,
        leaf_cert,
        leaf_key,
        pkg,
    }
}

#[test]
fn provision_sign_verify() {
    let s = setup();

    package::sign_package(&s.leaf_key, &s.leaf_cert, &s.pkg).unwrap();

    let report = verify::verify_with_root_certs(&s.pkg, &s.root_cert, 1).unwrap();
    assert_eq!(report.found, 1);
    assert_eq!(report.valid, 1);
    assert_eq!(report.required, 1);
}

#[test]
fn tampered_archive_is_rejected() {
    let s = setup();
    package::sign_package(&s.leaf_key, &s.leaf_cert, &s.pkg).unwrap();

    // Flip one byte of the archive after signing.
    let archive_path = format!("{}.ospkg", s.pkg);
    let mut archive = fs::read(&archive_path).unwrap();
    archive[0] ^= 0xff;
    fs::write(&archive_path, &archive).unwrap();

    let err = verify::verify_with_root_certs(&s.pkg, &s.root_cert, 1).unwrap_err();
    assert!(matches!(
        err,
        TrustError::ThresholdNotMet {
            found: 1,
            valid: 0,
            required: 1
        }
    ));
}

#[test]
fn verify_through_trust_dir() {
    let s = setup();
    package::sign_package(&s.leaf_key, &s.leaf_cert, &s.pkg).unwrap();

    let trust_dir = tempfile::tempdir().unwrap();
    fs::write(
        trust_dir.path().join(TRUST_POLICY_NAME),
        r#"{"ospkg_signature_threshold": 1, "ospkg_fetch_method": "initramfs"}"#,
    )
    .unwrap();
    fs::copy(&s.root_cert, trust_dir.path().join(SIGNING_ROOT_NAME)).unwrap();

    let report = verify::verify_with_policy_dir(&s.pkg, trust_dir.path()).unwrap();
    assert_eq!(report.valid, 1);
}

#[test]
fn signing_is_append_only() {
    let s = setup();
    package::sign_package(&s.leaf_key, &s.leaf_cert, &s.pkg).unwrap();
    let first = OsPackage::load(&s.pkg).unwrap().descriptor.signatures;

    package::sign_package(&s.leaf_key, &s.leaf_cert, &s.pkg).unwrap();
    let second = OsPackage::load(&s.pkg).unwrap().descriptor.signatures;

    assert_eq!(second.len(), first.len() + 1);
    assert_eq!(second[0].certificate, first[0].certificate);
    assert_eq!(second[0].signature, first[0].signature);
}

fn write_proof(path: &Path, cert_path: &Path, key: &SigningKey, archive_hash: &[u8; 32]) {
    let signer = VerifyingKey::from_certificate_der(&keys::load_certificate_der(cert_path).unwrap())
        .unwrap();
    let signature = key.sign(&sigsum::leaf_signed_data(archive_hash));

    let hex = |bytes: &[u8]| {
        bytes
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>()
    };
    let proof = format!(
        "version=1\nlog={}\nleaf={} {}\n",
        "11".repeat(32),
        hex(&signer.key_hash()),
        hex(&signature),
    );
    fs::write(path, proof).unwrap();
}

#[test]
fn attach_and_verify_log_proof() {
    let s = setup();

    let pkg = OsPackage::load(&s.pkg).unwrap();
    let key = SigningKey::from_file(&s.leaf_key).unwrap();
    let proof_path = Path::new(&s.pkg).with_extension("proof");
    write_proof(&proof_path, &s.leaf_cert, &key, &pkg.archive_hash());

    sigsum::attach_proof(&proof_path, &s.leaf_cert, &s.pkg).unwrap();

    let reloaded = OsPackage::load(&s.pkg).unwrap();
    assert_eq!(reloaded.descriptor.signatures.len(), 1);
    assert!(reloaded.descriptor.signatures[0].proof.is_some());
    assert!(reloaded.descriptor.signatures[0].signature.is_none());

    let report = verify::verify_with_root_certs(&s.pkg, &s.root_cert, 1).unwrap();
    assert_eq!(report.valid, 1);
}

#[test]
fn failed_proof_attachment_leaves_descriptor_untouched() {
    let s = setup();

    // Proof signed over the wrong hash: the leaf check must fail and the
    // descriptor file must not change.
    let key = SigningKey::from_file(&s.leaf_key).unwrap();
    let proof_path = Path::new(&s.pkg).with_extension("proof");
    write_proof(&proof_path, &s.leaf_cert, &key, &sha256(b"some other archive"));

    let descriptor_path = format!("{}.json", s.pkg);
    let before = fs::read(&descriptor_path).unwrap();

    let err = sigsum::attach_proof(&proof_path, &s.leaf_cert, &s.pkg).unwrap_err();
    assert!(matches!(err, TrustError::InvalidLeafSignature));
    assert_eq!(fs::read(&descriptor_path).unwrap(), before);
}

#[test]
fn proof_for_foreign_certificate_is_rejected() {
    let s = setup();

    // Certificate and proof disagree on the submitter key.
    let other = ostrust::KeyPair::generate(KeyAlgorithm::Ed25519);
    let pkg = OsPackage::load(&s.pkg).unwrap();
    let signature = other.signing.sign(&sigsum::leaf_signed_data(&pkg.archive_hash()));
    let hex = |bytes: &[u8]| {
        bytes
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>()
    };
    let proof = format!(
        "version=1\nlog={}\nleaf={} {}\n",
        "11".repeat(32),
        hex(&other.verifying.key_hash()),
        hex(&signature),
    );
    let proof_path = Path::new(&s.pkg).with_extension("proof");
    fs::write(&proof_path, proof).unwrap();

    let err = sigsum::attach_proof(&proof_path, &s.leaf_cert, &s.pkg).unwrap_err();
    assert!(matches!(err, TrustError::PublicKeyMismatch { .. }));
}

#[test]
fn multi_signer_threshold() {
    let s = setup();

    // A second, independent signing chain trusted via the same bundle.
    let dir = tempfile::tempdir().unwrap();
    let root2_cert = dir.path().join("root2.pem");
    let root2_key = dir.path().join("root2key.pem");
    let leaf2_cert = dir.path().join("cert2.pem");
    let leaf2_key = dir.path().join("key2.pem");
    ca::certificate(&CertificateArgs {
        is_ca: true,
        cert_out: Some(root2_cert.clone()),
        key_out: Some(root2_key.clone()),
        algorithm: Some(KeyAlgorithm::EcdsaP256),
        ..Default::default()
    })
    .unwrap();
    ca::certificate(&CertificateArgs {
        issuer_cert: Some(root2_cert.clone()),
        issuer_key: Some(root2_key),
        cert_out: Some(leaf2_cert.clone()),
        key_out: Some(leaf2_key.clone()),
        algorithm: Some(KeyAlgorithm::EcdsaP256),
        ..Default::default()
    })
    .unwrap();

    package::sign_package(&s.leaf_key, &s.leaf_cert, &s.pkg).unwrap();
    package::sign_package(&leaf2_key, &leaf2_cert, &s.pkg).unwrap();

    let bundle_path = dir.path().join("bundle.pem");
    let mut bundle = fs::read(&s.root_cert).unwrap();
    bundle.extend_from_slice(&fs::read(&root2_cert).unwrap());
    fs::write(&bundle_path, &bundle).unwrap();

    let report = verify::verify_with_root_certs(&s.pkg, &bundle_path, 2).unwrap();
    assert_eq!(report.found, 2);
    assert_eq!(report.valid, 2);

    // With only the first root trusted the threshold of two cannot be met.
    let err = verify::verify_with_root_certs(&s.pkg, &s.root_cert, 2).unwrap_err();
    assert!(matches!(
        err,
        TrustError::ThresholdNotMet {
            found: 2,
            valid: 1,
            required: 2
        }
    ));
}
