use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`, the form carried in `UPLOAD` headers.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut digester = Digester::new();
    digester.update(data);
    digester.finalize_hex()
}

/// Incremental SHA-256 over bytes as they arrive from the link.
#[derive(Default)]
pub struct Digester {
    hasher: Sha256,
    bytes: u64,
}

impl Digester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes fed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Consumes the digester and returns the lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}
