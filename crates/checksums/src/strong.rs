use digest::Digest;
use md4::Md4;

/// Length in bytes of the full strong checksum.
pub const SUM_LENGTH: usize = 16;

/// One-shot strong digest over a single signature block.
///
/// The 32-bit checksum seed, when non-zero, is appended after the block
/// bytes in little-endian order before hashing. This is the block-side
/// seed rule; whole files use [`FileDigest`], which seeds at the front.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlockDigest;

impl BlockDigest {
    /// Computes the seeded 16-byte digest of `data`.
    ///
    /// # Examples
    ///
    /// ```
    /// use checksums::BlockDigest;
    ///
    /// let unseeded = BlockDigest::digest(b"block", 0);
    /// let seeded = BlockDigest::digest(b"block", 0x1234);
    /// assert_ne!(unseeded, seeded);
    /// ```
    #[must_use]
    pub fn digest(data: &[u8], seed: u32) -> [u8; SUM_LENGTH] {
        let mut hasher = Md4::new();
        hasher.update(data);
        if seed != 0 {
            hasher.update(seed.to_le_bytes());
        }
        hasher.finalize().into()
    }
}

/// Streaming strong digest over a whole file.
///
/// The accumulator starts with the 4-byte little-endian checksum seed so
/// two transfers of identical content under different seeds produce
/// different transfer digests.
#[derive(Clone, Debug)]
pub struct FileDigest {
    inner: Md4,
}

impl FileDigest {
    /// Creates an accumulator seeded with `seed`.
    #[must_use]
    pub fn new(seed: u32) -> Self {
        let mut inner = Md4::new();
        inner.update(seed.to_le_bytes());
        Self { inner }
    }

    /// Feeds additional file bytes into the digest state.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalises the digest and returns the 128-bit output.
    #[must_use]
    pub fn finalize(self) -> [u8; SUM_LENGTH] {
        self.inner.finalize().into()
    }
}
