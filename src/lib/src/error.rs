/// The ostrust error type.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("Internal error: [{0}]")]
    InternalError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error")]
    IOError(#[from] std::io::Error),

    #[error("UTF-8 error")]
    UTF8Error(#[from] std::str::Utf8Error),

    #[error("Ed25519 signature function error")]
    CryptoError(#[from] ed25519_compact::Error),

    #[error("no PEM block found")]
    NoPemBlock,

    #[error("unexpected trailing data after PEM block")]
    TrailingPemData,

    #[error("expected PEM block of type {expected:?}, found {found:?}")]
    UnexpectedPemType { expected: &'static str, found: String },

    #[error("missing rootCert")]
    NoRootCert,

    #[error("missing rootKey")]
    NoRootKey,

    #[error("invalid file extension {0:?}")]
    InvalidSuffix(String),

    #[error("unsupported key type")]
    UnsupportedKeyType,

    #[error("invalid public key type in certificate: {0}")]
    InvalidPublicKeyType(String),

    #[error("public key mismatch, certificate key hash: {cert_key_hash}, proof key hash: {proof_key_hash}")]
    PublicKeyMismatch {
        cert_key_hash: String,
        proof_key_hash: String,
    },

    #[error("invalid leaf signature in sigsum proof")]
    InvalidLeafSignature,

    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("X509 error: {0}")]
    X509Error(String),

    #[error("certificate generation failed: {0}")]
    CertificateError(String),

    #[error("trust policy error: {0}")]
    PolicyError(String),

    #[error("the trust policy and root certificate sources cannot be used together")]
    ConflictingPolicySources,

    #[error("one of trust policy directory and root certificate file must be given")]
    MissingPolicySource,

    #[error("not enough valid signatures: {found} found, {valid} valid, {required} required")]
    ThresholdNotMet {
        found: usize,
        valid: usize,
        required: usize,
    },
}

impl From<x509_parser::error::X509Error> for TrustError {
    fn from(err: x509_parser::error::X509Error) -> Self {
        TrustError::X509Error(format!("{:?}", err))
    }
}

impl From<rcgen::Error> for TrustError {
    fn from(err: rcgen::Error) -> Self {
        TrustError::CertificateError(err.to_string())
    }
}
