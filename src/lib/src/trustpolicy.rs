//! Host trust policy: the verification threshold and package fetch method
//! a host ships in its initramfs, next to the signing root certificate.

use crate::error::TrustError;
use crate::keys::{parse_single_pem, CERTIFICATE_PEM_TYPE};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// File name of the policy inside a trust directory.
pub const TRUST_POLICY_NAME: &str = "trust_policy.json";
/// File name of the signing root bundle inside a trust directory.
pub const SIGNING_ROOT_NAME: &str = "ospkg_signing_root.pem";

/// Where a host obtains OS packages at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMethod {
    Network,
    Initramfs,
}

/// The host trust policy. Unknown fields are rejected so that typos in a
/// policy file fail loudly instead of silently weakening verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Minimum number of valid signatures a package needs. Zero means
    /// every signature found must be valid.
    pub ospkg_signature_threshold: usize,
    pub ospkg_fetch_method: FetchMethod,
}

impl Policy {
    pub fn from_bytes(data: &[u8]) -> Result<Self, TrustError> {
        serde_json::from_slice(data).map_err(|e| TrustError::PolicyError(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TrustError> {
        let mut out = serde_json::to_vec_pretty(self)
            .map_err(|e| TrustError::InternalError(format!("policy encoding: {}", e)))?;
        out.push(b'\n');
        Ok(out)
    }
}

/// Validate a policy file, optionally rewriting it in canonical form.
pub fn check(policy_path: impl AsRef<Path>, out: Option<&Path>) -> Result<Policy, TrustError> {
    let data = fs::read(policy_path.as_ref())?;
    let policy = Policy::from_bytes(&data)?;
    log::info!(
        "Policy OK: threshold {}, fetch method {:?}",
        policy.ospkg_signature_threshold,
        policy.ospkg_fetch_method
    );
    if let Some(out) = out {
        fs::write(out, policy.to_bytes()?)?;
    }
    Ok(policy)
}

/// Load a trust directory: the policy plus the root certificate bundle.
/// The bundle may hold more than one root; each block must be a
/// certificate.
pub fn load_trust_dir(dir: impl AsRef<Path>) -> Result<(Policy, Vec<Vec<u8>>), TrustError> {
    let dir = dir.as_ref();

    let policy_data = fs::read(dir.join(TRUST_POLICY_NAME))?;
    let policy = Policy::from_bytes(&policy_data)?;

    let bundle = fs::read(dir.join(SIGNING_ROOT_NAME))?;
    let roots = parse_certificate_bundle(&bundle)?;

    Ok((policy, roots))
}

/// Parse a PEM bundle into DER certificates. A single-block bundle goes
/// through the strict single-PEM path so trailing garbage is rejected.
pub fn parse_certificate_bundle(data: &[u8]) -> Result<Vec<Vec<u8>>, TrustError> {
    let blocks = pem::parse_many(data).map_err(|e| TrustError::ParseError(e.to_string()))?;
    match blocks.len() {
        0 => Err(TrustError::NoPemBlock),
        1 => {
            let block = parse_single_pem(data)?;
            check_certificate_tag(&block)?;
            Ok(vec![block.contents().to_vec()])
        }
        _ => blocks
            .iter()
            .map(|block| {
                check_certificate_tag(block)?;
                Ok(block.contents().to_vec())
            })
            .collect(),
    }
}

fn check_certificate_tag(block: &pem::Pem) -> Result<(), TrustError> {
    if block.tag() != CERTIFICATE_PEM_TYPE {
        return Err(TrustError::UnexpectedPemType {
            expected: CERTIFICATE_PEM_TYPE,
            found: block.tag().to_string(),
        });
    }
    Ok(())
}
