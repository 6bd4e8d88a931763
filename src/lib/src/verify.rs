//! Signature verification for OS packages.
//!
//! Every signature record is checked independently against the trusted
//! signing roots; a record that fails any step is logged and skipped, it
//! never aborts the run. The verdict is reached by comparing the count of
//! valid records against the policy threshold at the end.

use crate::error::TrustError;
use crate::hash::{sha256, HASH_LEN};
use crate::keys::VerifyingKey;
use crate::package::{hex_string, OsPackage, SignatureRecord};
use crate::sigsum::SigsumProof;
use crate::trustpolicy::{self, Policy};

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
// x509-parser's prelude re-exports its own `time` module, so the crate
// path must be anchored.
use ::time::OffsetDateTime;
use x509_parser::prelude::*;

/// Counters from one verification run. `required` reflects the effective
/// threshold: with a zero policy threshold it equals the number of
/// signatures found, since strict mode demands all of them hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationReport {
    pub found: usize,
    pub valid: usize,
    pub required: usize,
}

/// Arguments for the file-level `verify` operation. Exactly one trust
/// source must be given: a trust directory, or a root bundle with an
/// explicit threshold.
#[derive(Debug, Default)]
pub struct VerifyArgs {
    pub pkg: String,
    pub policy_dir: Option<PathBuf>,
    pub root_certs: Option<PathBuf>,
    pub threshold: Option<usize>,
}

/// Verify an OS package on disk against one trust source.
pub fn verify(args: &VerifyArgs) -> Result<VerificationReport, TrustError> {
    match (&args.policy_dir, &args.root_certs) {
        (Some(_), Some(_)) => Err(TrustError::ConflictingPolicySources),
        (Some(dir), None) => verify_with_policy_dir(&args.pkg, dir),
        (None, Some(roots)) => {
            let threshold = args.threshold.unwrap_or(0);
            verify_with_root_certs(&args.pkg, roots, threshold)
        }
        (None, None) => Err(TrustError::MissingPolicySource),
    }
}

/// Verify against a trust directory holding the policy and root bundle.
pub fn verify_with_policy_dir(
    pkg_path: &str,
    dir: impl AsRef<Path>,
) -> Result<VerificationReport, TrustError> {
    let (policy, roots) = trustpolicy::load_trust_dir(dir)?;
    run(pkg_path, &roots, &policy)
}

/// Verify against an explicit root bundle and threshold, bypassing the
/// policy file.
pub fn verify_with_root_certs(
    pkg_path: &str,
    root_path: impl AsRef<Path>,
    threshold: usize,
) -> Result<VerificationReport, TrustError> {
    let bundle = fs::read(root_path.as_ref())?;
    let roots = trustpolicy::parse_certificate_bundle(&bundle)?;
    let policy = Policy {
        ospkg_signature_threshold: threshold,
        ospkg_fetch_method: trustpolicy::FetchMethod::Network,
    };
    run(pkg_path, &roots, &policy)
}

fn run(pkg_path: &str, roots: &[Vec<u8>], policy: &Policy) -> Result<VerificationReport, TrustError> {
    let pkg = OsPackage::load(pkg_path)?;
    let report = verify_package(&pkg, roots, policy.ospkg_signature_threshold)?;
    log::info!(
        "Package verified: {} of {} signature(s) valid, {} required",
        report.valid,
        report.found,
        report.required
    );
    Ok(report)
}

/// Verify a loaded package against root certificates and a threshold.
///
/// Signatures are checked against the freshly computed archive hash, not
/// the one recorded in the descriptor; a stale descriptor hash is worth a
/// warning but the signatures themselves decide the verdict.
pub fn verify_package(
    pkg: &OsPackage,
    roots: &[Vec<u8>],
    threshold: usize,
) -> Result<VerificationReport, TrustError> {
    verify_package_at(pkg, roots, threshold, OffsetDateTime::now_utc())
}

pub fn verify_package_at(
    pkg: &OsPackage,
    roots: &[Vec<u8>],
    threshold: usize,
    now: OffsetDateTime,
) -> Result<VerificationReport, TrustError> {
    let archive_hash = pkg.archive_hash();
    match hex_string(&archive_hash) {
        Ok(hex) if hex != pkg.descriptor.archive_hash => {
            log::warn!(
                "descriptor archive hash does not match the archive ({} != {})",
                pkg.descriptor.archive_hash,
                hex
            );
        }
        _ => {}
    }

    let found = pkg.descriptor.signatures.len();
    let mut valid = 0usize;
    let mut seen = HashSet::new();

    for (index, record) in pkg.descriptor.signatures.iter().enumerate() {
        match check_record(record, roots, &archive_hash, now) {
            Ok(()) => {
                if seen.insert(sha256(&record.certificate)) {
                    valid += 1;
                } else {
                    log::warn!("signature {}: duplicate certificate, not counted", index);
                }
            }
            Err(e) => log::warn!("signature {}: {}", index, e),
        }
    }

    // A zero policy threshold means every signature found must hold.
    let required = if threshold == 0 { found } else { threshold };

    if valid < required {
        return Err(TrustError::ThresholdNotMet {
            found,
            valid,
            required,
        });
    }

    Ok(VerificationReport {
        found,
        valid,
        required,
    })
}

fn check_record(
    record: &SignatureRecord,
    roots: &[Vec<u8>],
    archive_hash: &[u8; HASH_LEN],
    now: OffsetDateTime,
) -> Result<(), TrustError> {
    let (_, cert) = X509Certificate::from_der(&record.certificate)
        .map_err(|e| TrustError::X509Error(format!("{:?}", e)))?;

    chain_to_root(&cert, &record.certificate, roots, now)?;

    let signer = VerifyingKey::from_certificate_der(&record.certificate)?;

    match (&record.signature, &record.proof) {
        (Some(signature), None) => {
            if !signer.verify(archive_hash, signature) {
                return Err(TrustError::CertificateError(
                    "signature does not verify over the archive hash".to_string(),
                ));
            }
            Ok(())
        }
        (None, Some(proof)) => {
            let proof = SigsumProof::from_ascii(proof)?;
            if proof.leaf_key_hash != signer.key_hash() {
                return Err(TrustError::PublicKeyMismatch {
                    cert_key_hash: hex_string(&signer.key_hash())?,
                    proof_key_hash: hex_string(&proof.leaf_key_hash)?,
                });
            }
            proof.verify_leaf(&signer, archive_hash)
        }
        _ => Err(TrustError::MalformedDescriptor(
            "record must carry exactly one of signature or proof".to_string(),
        )),
    }
}

/// Check that a certificate was issued by one of the trusted roots and
/// that both certificates cover the given instant. Signing certificates
/// chain directly to a root, there are no intermediates.
fn chain_to_root(
    cert: &X509Certificate<'_>,
    cert_der: &[u8],
    roots: &[Vec<u8>],
    now: OffsetDateTime,
) -> Result<(), TrustError> {
    let asn1_now = ASN1Time::from_timestamp(now.unix_timestamp())
        .map_err(|e| TrustError::InternalError(format!("timestamp: {}", e)))?;

    if !cert.validity().is_valid_at(asn1_now) {
        return Err(TrustError::CertificateError(
            "certificate is outside its validity window".to_string(),
        ));
    }

    for root_der in roots {
        // Self-signed roots may appear in the signature list; trust them
        // directly when they are in the bundle.
        if root_der == cert_der {
            return Ok(());
        }

        let (_, root) = match X509Certificate::from_der(root_der) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("skipping unparsable root certificate: {:?}", e);
                continue;
            }
        };

        if cert.issuer().as_raw() != root.subject().as_raw() {
            continue;
        }
        if !root.validity().is_valid_at(asn1_now) {
            log::warn!("matching root certificate is outside its validity window");
            continue;
        }

        let root_key = VerifyingKey::from_certificate_der(root_der)?;
        if root_key.verify(cert.tbs_certificate.as_ref(), cert.signature_value.data.as_ref()) {
            return Ok(());
        }
        log::warn!("issuer name matches a root but the signature does not");
    }

    Err(TrustError::CertificateError(
        "certificate does not chain to any trusted root".to_string(),
    ))
}
