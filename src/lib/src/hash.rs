use std::io::{self, Read, Write};

/// SHA-256 output length in bytes.
pub const HASH_LEN: usize = 32;

#[derive(Clone, Copy)]
pub struct Hash {
    hash: hmac_sha256::Hash,
}

impl Hash {
    pub fn new() -> Self {
        Hash {
            hash: hmac_sha256::Hash::new(),
        }
    }

    pub fn update<T: AsRef<[u8]>>(&mut self, data: T) {
        self.hash.update(data);
    }

    pub fn finalize(&self) -> [u8; HASH_LEN] {
        self.hash.finalize()
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for Hash {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hash.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One-shot SHA-256.
pub fn sha256<T: AsRef<[u8]>>(data: T) -> [u8; HASH_LEN] {
    let mut hash = Hash::new();
    hash.update(data);
    hash.finalize()
}

/// Hash everything a reader yields, without buffering it in memory.
pub fn hash_reader(reader: &mut impl Read) -> io::Result<[u8; HASH_LEN]> {
    let mut hash = Hash::new();
    io::copy(reader, &mut hash)?;
    Ok(hash.finalize())
}
