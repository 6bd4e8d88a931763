//! Sigsum transparency-log proofs.
//!
//! A proof is an ASCII document whose header binds a log entry to the
//! submitter's Ed25519 key and to a checksum of the submitted message.
//! Attaching a proof to an OS package only succeeds after two local
//! checks: the proof's leaf key hash must match the supplied certificate,
//! and the leaf signature must verify over the package's archive hash.
//! Inclusion in the log itself is the verifier's business at boot time,
//! not ours.

use crate::error::TrustError;
use crate::hash::{sha256, HASH_LEN};
use crate::keys::{self, KeyAlgorithm, VerifyingKey};
use crate::package::{hex_string, OsPackage};

use ct_codecs::{Decoder, Hex};
use std::fs;
use std::path::Path;

const SIGNATURE_LEN: usize = 64;
const SSH_MAGIC: &[u8] = b"SSHSIG";
const LEAF_NAMESPACE: &str = "sigsum.org/v1/tree-leaf";

/// The header fields of a Sigsum proof. The tree head and inclusion path
/// that follow the header are carried along verbatim but not interpreted.
#[derive(Debug, Clone)]
pub struct SigsumProof {
    pub version: u64,
    pub log_key_hash: [u8; HASH_LEN],
    pub leaf_key_hash: [u8; HASH_LEN],
    pub leaf_signature: [u8; SIGNATURE_LEN],
    raw: Vec<u8>,
}

impl SigsumProof {
    /// Parse the ASCII proof format. The first lines are
    /// `version=N`, `log=<hex key hash>` and
    /// `leaf=<hex key hash> <hex signature>`.
    pub fn from_ascii(data: &[u8]) -> Result<Self, TrustError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| TrustError::ParseError("proof is not valid UTF-8".to_string()))?;

        let mut version = None;
        let mut log_key_hash = None;
        let mut leaf = None;

        for line in text.lines() {
            if let Some(value) = line.strip_prefix("version=") {
                version = Some(value.parse::<u64>().map_err(|_| {
                    TrustError::ParseError(format!("bad proof version {:?}", value))
                })?);
            } else if let Some(value) = line.strip_prefix("log=") {
                log_key_hash = Some(decode_hash(value)?);
            } else if let Some(value) = line.strip_prefix("leaf=") {
                leaf = Some(value);
                break;
            }
        }

        let version =
            version.ok_or_else(|| TrustError::ParseError("proof has no version line".into()))?;
        if version != 1 && version != 2 {
            return Err(TrustError::ParseError(format!(
                "unsupported proof version {}",
                version
            )));
        }
        let log_key_hash =
            log_key_hash.ok_or_else(|| TrustError::ParseError("proof has no log line".into()))?;
        let leaf = leaf.ok_or_else(|| TrustError::ParseError("proof has no leaf line".into()))?;

        let mut parts = leaf.split_whitespace();
        let leaf_key_hash = decode_hash(
            parts
                .next()
                .ok_or_else(|| TrustError::ParseError("empty leaf line".into()))?,
        )?;
        let signature_hex = parts
            .next()
            .ok_or_else(|| TrustError::ParseError("leaf line has no signature".into()))?;
        let signature_bytes = Hex::decode_to_vec(signature_hex, None)
            .map_err(|_| TrustError::ParseError("leaf signature is not valid hex".into()))?;
        let leaf_signature: [u8; SIGNATURE_LEN] = signature_bytes
            .try_into()
            .map_err(|_| TrustError::ParseError("leaf signature has wrong length".into()))?;

        Ok(SigsumProof {
            version,
            log_key_hash,
            leaf_key_hash,
            leaf_signature,
            raw: data.to_vec(),
        })
    }

    /// The proof document exactly as parsed.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Check the leaf signature against the archive hash it claims to
    /// cover, using the submitter key from the proof header.
    pub fn verify_leaf(
        &self,
        submitter: &VerifyingKey,
        archive_hash: &[u8; HASH_LEN],
    ) -> Result<(), TrustError> {
        let message = leaf_signed_data(archive_hash);
        if !submitter.verify(&message, &self.leaf_signature) {
            return Err(TrustError::InvalidLeafSignature);
        }
        Ok(())
    }
}

fn decode_hash(hex: &str) -> Result<[u8; HASH_LEN], TrustError> {
    let bytes = Hex::decode_to_vec(hex, None)
        .map_err(|_| TrustError::ParseError("key hash is not valid hex".into()))?;
    bytes
        .try_into()
        .map_err(|_| TrustError::ParseError("key hash has wrong length".into()))
}

/// The byte string a Sigsum leaf signature covers, derived from the
/// archive hash. Uses the SSH signature framing with the tree-leaf
/// namespace; the checksum submitted to the log is the hash of the
/// archive hash.
pub fn leaf_signed_data(archive_hash: &[u8; HASH_LEN]) -> Vec<u8> {
    let checksum = sha256(archive_hash);
    let message_hash = sha256(&checksum);

    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(SSH_MAGIC);
    ssh_string(&mut out, LEAF_NAMESPACE.as_bytes());
    ssh_string(&mut out, b"");
    ssh_string(&mut out, b"sha256");
    ssh_string(&mut out, &message_hash);
    out
}

fn ssh_string(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

/// Attach a log proof to an OS package on disk.
///
/// The proof file and the signing certificate are checked against each
/// other and against the archive before anything is written; on any
/// failure the descriptor on disk is left exactly as it was.
pub fn attach_proof(
    proof_path: impl AsRef<Path>,
    cert_path: impl AsRef<Path>,
    pkg_path: &str,
) -> Result<(), TrustError> {
    let mut pkg = OsPackage::load(pkg_path)?;

    let proof_bytes = fs::read(proof_path)?;
    let proof = SigsumProof::from_ascii(&proof_bytes)?;
    let certificate = keys::load_certificate_der(cert_path)?;

    let submitter = VerifyingKey::from_certificate_der(&certificate)?;
    if submitter.algorithm() != KeyAlgorithm::Ed25519 {
        return Err(TrustError::InvalidPublicKeyType(
            "Sigsum proofs require an Ed25519 submitter key".to_string(),
        ));
    }

    let cert_key_hash = submitter.key_hash();
    if cert_key_hash != proof.leaf_key_hash {
        return Err(TrustError::PublicKeyMismatch {
            cert_key_hash: hex_string(&cert_key_hash)?,
            proof_key_hash: hex_string(&proof.leaf_key_hash)?,
        });
    }

    proof.verify_leaf(&submitter, &pkg.archive_hash())?;

    pkg.descriptor.add_proof(&certificate, proof.as_bytes());
    pkg.persist_descriptor()?;
    log::info!("Log proof attached, leaf signature verified locally");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    fn proof_document(kp: &KeyPair, archive_hash: &[u8; HASH_LEN]) -> Vec<u8> {
        let signature = match &kp.signing {
            crate::keys::SigningKey::Ed25519(_) => kp.signing.sign(&leaf_signed_data(archive_hash)),
            _ => panic!("test proofs use Ed25519"),
        };
        format!(
            "version=1\nlog={}\nleaf={} {}\n",
            hex_string(&[0x11u8; HASH_LEN]).unwrap(),
            hex_string(&kp.verifying.key_hash()).unwrap(),
            hex_string(&signature).unwrap(),
        )
        .into_bytes()
    }

    #[test]
    fn test_parse_proof_header() {
        let kp = KeyPair::generate(KeyAlgorithm::Ed25519);
        let hash = sha256(b"archive");
        let data = proof_document(&kp, &hash);

        let proof = SigsumProof::from_ascii(&data).unwrap();
        assert_eq!(proof.version, 1);
        assert_eq!(proof.log_key_hash, [0x11u8; HASH_LEN]);
        assert_eq!(proof.leaf_key_hash, kp.verifying.key_hash());
        assert_eq!(proof.as_bytes(), data.as_slice());
    }

    #[test]
    fn test_parse_rejects_missing_leaf() {
        let err = SigsumProof::from_ascii(b"version=1\nlog=00\n").unwrap_err();
        assert!(matches!(err, TrustError::ParseError(_)));
    }

    #[test]
    fn test_parse_rejects_unknown_version() {
        let data = format!(
            "version=9\nlog={}\nleaf={} {}\n",
            "00".repeat(HASH_LEN),
            "00".repeat(HASH_LEN),
            "00".repeat(SIGNATURE_LEN),
        );
        assert!(SigsumProof::from_ascii(data.as_bytes()).is_err());
    }

    #[test]
    fn test_leaf_signature_verifies() {
        let kp = KeyPair::generate(KeyAlgorithm::Ed25519);
        let hash = sha256(b"archive");
        let proof = SigsumProof::from_ascii(&proof_document(&kp, &hash)).unwrap();

        assert!(proof.verify_leaf(&kp.verifying, &hash).is_ok());
        let other = sha256(b"tampered");
        assert!(matches!(
            proof.verify_leaf(&kp.verifying, &other),
            Err(TrustError::InvalidLeafSignature)
        ));
    }

    #[test]
    fn test_leaf_signed_data_framing() {
        let hash = sha256(b"archive");
        let data = leaf_signed_data(&hash);
        assert!(data.starts_with(SSH_MAGIC));
        let ns_len = u32::from_be_bytes(data[6..10].try_into().unwrap()) as usize;
        assert_eq!(&data[10..10 + ns_len], LEAF_NAMESPACE.as_bytes());
    }
}
