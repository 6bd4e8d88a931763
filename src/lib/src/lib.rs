//! Trust subsystem for OS packages.
//!
//! Provides the offline half of a system-transparency style boot chain:
//! a minimal certificate authority for signing certificates, packing of
//! kernel/initramfs payloads into immutable archives, descriptor-based
//! signature management, transparency-log proof attachment, and the
//! threshold verifier a host runs against its trust policy.

pub mod ca;
pub mod error;
pub mod hash;
pub mod keys;
pub mod package;
pub mod secure_file;
pub mod sigsum;
pub mod trustpolicy;
pub mod verify;

pub use error::TrustError;
pub use keys::{KeyAlgorithm, KeyPair, SigningKey, VerifyingKey};
pub use package::{Descriptor, OsPackage, SignatureRecord};
pub use trustpolicy::{FetchMethod, Policy};
pub use verify::VerificationReport;
