//! OS package model: an immutable archive plus its mutable descriptor.
//!
//! The archive is a gzip-compressed tarball holding the boot manifest,
//! kernel and initramfs. Its identity for trust purposes is its SHA-256
//! content hash, computed once at creation. The descriptor references the
//! archive by that hash and carries an append-only list of signature
//! records; it is rewritten to disk in its entirety after every mutation.

use crate::error::TrustError;
use crate::hash::{sha256, HASH_LEN};
use crate::keys::{self, SigningKey};

use ct_codecs::{Encoder, Hex};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Suffix of the archive file.
pub const ARCHIVE_EXT: &str = ".ospkg";
/// Suffix of the descriptor file.
pub const DESCRIPTOR_EXT: &str = ".json";
/// Base name used when no output path is given.
pub const DEFAULT_OUT_NAME: &str = "os-package";

pub const DESCRIPTOR_VERSION: u32 = 1;
const MANIFEST_VERSION: u32 = 1;

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        match text {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// One signature attached to a descriptor: the full signing certificate
/// plus either a raw signature over the archive hash or a transparency-log
/// proof, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRecord {
    #[serde(with = "b64")]
    pub certificate: Vec<u8>,
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub proof: Option<Vec<u8>>,
}

/// Package metadata paired with one archive. The signature list only ever
/// grows; records are never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    pub version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(default, rename = "os_pkg_url", skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Hex SHA-256 of the archive, recorded at creation time.
    pub archive_hash: String,
    #[serde(default)]
    pub signatures: Vec<SignatureRecord>,
}

impl Descriptor {
    pub fn new(label: &str, url: &str, archive_hash: &[u8; HASH_LEN]) -> Result<Self, TrustError> {
        Ok(Descriptor {
            version: DESCRIPTOR_VERSION,
            label: label.to_string(),
            url: url.to_string(),
            archive_hash: hex_string(archive_hash)?,
            signatures: Vec::new(),
        })
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TrustError> {
        let descriptor: Descriptor = serde_json::from_slice(data)
            .map_err(|e| TrustError::MalformedDescriptor(e.to_string()))?;
        if descriptor.version != DESCRIPTOR_VERSION {
            return Err(TrustError::MalformedDescriptor(format!(
                "unsupported descriptor version {}",
                descriptor.version
            )));
        }
        Ok(descriptor)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TrustError> {
        let mut out = serde_json::to_vec_pretty(self)
            .map_err(|e| TrustError::InternalError(format!("descriptor encoding: {}", e)))?;
        out.push(b'\n');
        Ok(out)
    }

    /// Append a raw-signature record.
    pub fn add_signature(&mut self, certificate: &[u8], signature: &[u8]) {
        if self.signatures.iter().any(|r| r.certificate == certificate) {
            log::warn!("descriptor already carries a signature for this certificate");
        }
        self.signatures.push(SignatureRecord {
            certificate: certificate.to_vec(),
            signature: Some(signature.to_vec()),
            proof: None,
        });
    }

    /// Append a log-proof record.
    pub fn add_proof(&mut self, certificate: &[u8], proof: &[u8]) {
        if self.signatures.iter().any(|r| r.certificate == certificate) {
            log::warn!("descriptor already carries a signature for this certificate");
        }
        self.signatures.push(SignatureRecord {
            certificate: certificate.to_vec(),
            signature: None,
            proof: Some(proof.to_vec()),
        });
    }
}

/// Arguments for the file-level `create` operation.
#[derive(Debug, Default)]
pub struct CreateArgs {
    pub out: String,
    pub label: String,
    pub url: String,
    pub kernel: PathBuf,
    pub initramfs: Option<PathBuf>,
    pub cmdline: String,
}

/// Pack the boot inputs into an immutable archive and produce a descriptor
/// with an empty signature list.
pub fn create_package(
    kernel: &[u8],
    initramfs: Option<&[u8]>,
    cmdline: &str,
    label: &str,
    url: &str,
) -> Result<(Vec<u8>, Descriptor), TrustError> {
    #[derive(Serialize)]
    struct Manifest<'a> {
        version: u32,
        label: &'a str,
        kernel: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        initramfs: Option<&'a str>,
        cmdline: &'a str,
    }

    let manifest = serde_json::to_vec_pretty(&Manifest {
        version: MANIFEST_VERSION,
        label,
        kernel: "kernel",
        initramfs: initramfs.map(|_| "initramfs"),
        cmdline,
    })
    .map_err(|e| TrustError::InternalError(format!("manifest encoding: {}", e)))?;

    let encoder = GzEncoder::new(Vec::new(), Compression::best());
    let mut builder = tar::Builder::new(encoder);

    append_bytes(&mut builder, "manifest.json", &manifest)?;
    append_bytes(&mut builder, "kernel", kernel)?;
    if let Some(initramfs) = initramfs {
        append_bytes(&mut builder, "initramfs", initramfs)?;
    }

    let archive = builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(TrustError::IOError)?;

    let hash = sha256(&archive);
    let descriptor = Descriptor::new(label, url, &hash)?;

    Ok((archive, descriptor))
}

fn append_bytes(
    builder: &mut tar::Builder<GzEncoder<Vec<u8>>>,
    name: &str,
    data: &[u8],
) -> Result<(), TrustError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

/// Create an OS package on disk: `<base>.ospkg` plus `<base>.json`.
pub fn create(args: &CreateArgs) -> Result<(), TrustError> {
    let base = parse_package_path(&args.out)?;

    let kernel = fs::read(&args.kernel)?;
    let initramfs = match &args.initramfs {
        Some(path) => Some(fs::read(path)?),
        None => None,
    };

    let label = if args.label.is_empty() {
        format!("OS package {}", args.kernel.display())
    } else {
        args.label.clone()
    };

    let (archive, descriptor) =
        create_package(&kernel, initramfs.as_deref(), &args.cmdline, &label, &args.url)?;

    fs::write(with_ext(&base, ARCHIVE_EXT), &archive)?;
    fs::write(with_ext(&base, DESCRIPTOR_EXT), descriptor.to_bytes()?)?;
    log::info!("OS package written to {}{}", base.display(), ARCHIVE_EXT);

    Ok(())
}

/// Resolve a user-supplied package path to the canonical base name shared
/// by the archive and descriptor files.
///
/// Accepts an empty path (default name), an existing directory, a bare
/// base name, or a path carrying one of the two recognized suffixes.
pub fn parse_package_path(path: &str) -> Result<PathBuf, TrustError> {
    if path.is_empty() {
        return Ok(PathBuf::from(DEFAULT_OUT_NAME));
    }

    match fs::metadata(path) {
        Ok(stat) if stat.is_dir() => return Ok(Path::new(path).join(DEFAULT_OUT_NAME)),
        Ok(_) => {}
        Err(_) => {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(TrustError::IOError(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("directory {} does not exist", parent.display()),
                    )));
                }
            }
        }
    }

    if let Some(base) = path.strip_suffix(ARCHIVE_EXT) {
        return Ok(PathBuf::from(base));
    }
    if let Some(base) = path.strip_suffix(DESCRIPTOR_EXT) {
        return Ok(PathBuf::from(base));
    }
    if let Some(ext) = Path::new(path).extension() {
        return Err(TrustError::InvalidSuffix(format!(
            ".{}",
            ext.to_string_lossy()
        )));
    }

    Ok(PathBuf::from(path))
}

fn with_ext(base: &Path, ext: &str) -> PathBuf {
    let mut os_string = base.as_os_str().to_os_string();
    os_string.push(ext);
    PathBuf::from(os_string)
}

/// An archive/descriptor pair loaded from disk. The two files are only
/// ever read and written together.
pub struct OsPackage {
    base: PathBuf,
    pub archive: Vec<u8>,
    pub descriptor: Descriptor,
}

impl OsPackage {
    /// Load the pair addressed by a user-supplied package path.
    pub fn load(path: &str) -> Result<Self, TrustError> {
        let base = parse_package_path(path)?;
        let archive = fs::read(with_ext(&base, ARCHIVE_EXT))?;
        let descriptor_bytes = fs::read(with_ext(&base, DESCRIPTOR_EXT))?;
        let descriptor = Descriptor::from_bytes(&descriptor_bytes)?;
        Ok(OsPackage {
            base,
            archive,
            descriptor,
        })
    }

    /// SHA-256 of the archive bytes, freshly computed.
    pub fn archive_hash(&self) -> [u8; HASH_LEN] {
        sha256(&self.archive)
    }

    /// Sign the archive hash and append the record to the descriptor.
    /// Existing records are never touched.
    pub fn sign(&mut self, key: &SigningKey, certificate: &[u8]) -> Result<(), TrustError> {
        let hash = self.archive_hash();
        let signature = key.sign(&hash);
        self.descriptor.add_signature(certificate, &signature);
        Ok(())
    }

    /// Rewrite the descriptor file in its entirety.
    pub fn persist_descriptor(&self) -> Result<(), TrustError> {
        fs::write(with_ext(&self.base, DESCRIPTOR_EXT), self.descriptor.to_bytes()?)?;
        Ok(())
    }

    pub fn archive_path(&self) -> PathBuf {
        with_ext(&self.base, ARCHIVE_EXT)
    }

    pub fn descriptor_path(&self) -> PathBuf {
        with_ext(&self.base, DESCRIPTOR_EXT)
    }
}

/// Sign an OS package on disk with the given private key and certificate.
pub fn sign_package(
    key_path: impl AsRef<Path>,
    cert_path: impl AsRef<Path>,
    pkg_path: &str,
) -> Result<(), TrustError> {
    let mut pkg = OsPackage::load(pkg_path)?;

    let key = SigningKey::from_file(key_path)?;
    let certificate = keys::load_certificate_der(cert_path)?;

    pkg.sign(&key, &certificate)?;
    pkg.persist_descriptor()?;
    log::info!(
        "Signature added, descriptor now carries {} record(s)",
        pkg.descriptor.signatures.len()
    );

    Ok(())
}

pub(crate) fn hex_string(data: &[u8]) -> Result<String, TrustError> {
    Hex::encode_to_string(data).map_err(|e| TrustError::InternalError(format!("hex: {:?}", e)))
}
