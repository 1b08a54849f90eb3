use thiserror::Error;

/// Per-byte offset added to every input byte before accumulation.
///
/// Standard deployments leave this at zero; it exists so the sum can be
/// salted against pathological inputs without changing the slide rule.
pub const CHAR_OFFSET: u32 = 0;

/// Error raised when a rolling-checksum slide is attempted on an
/// inconsistent window.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum RollingError {
    /// [`RollingChecksum::roll`] was called before any bytes were observed.
    #[error("cannot roll an empty checksum window")]
    EmptyWindow,
    /// The window grew past what a 32-bit slide factor can express.
    #[error("checksum window of {len} bytes is too large to roll")]
    WindowTooLarge {
        /// Size of the offending window.
        len: usize,
    },
}

/// Weak rolling checksum used for block matching.
///
/// `s1` accumulates the byte sum and `s2` accumulates the prefix sums;
/// only the low 16 bits of each half are significant. The packed value is
/// `(s2 << 16) | s1`, matching the classic rsync wire format, and the
/// 16-bit table tag is `(s1 + s2) & 0xffff`.
///
/// All arithmetic is wrapping; overflow into the upper bits is expected
/// and masked away.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RollingChecksum {
    s1: u32,
    s2: u32,
    len: usize,
}

impl RollingChecksum {
    /// Creates a checksum with zeroed state.
    #[must_use]
    pub const fn new() -> Self {
        Self { s1: 0, s2: 0, len: 0 }
    }

    /// Computes the checksum of `block` in one shot.
    ///
    /// # Examples
    ///
    /// ```
    /// use checksums::RollingChecksum;
    ///
    /// let sum = RollingChecksum::from_block(b"abcd");
    /// assert_eq!(sum.value() & 0xffff, b'a' as u32 + b'b' as u32 + b'c' as u32 + b'd' as u32);
    /// ```
    #[must_use]
    pub fn from_block(block: &[u8]) -> Self {
        let mut sum = Self::new();
        sum.update(block);
        sum
    }

    /// Resets the checksum back to its initial state.
    pub fn reset(&mut self) {
        self.s1 = 0;
        self.s2 = 0;
        self.len = 0;
    }

    /// Returns the number of bytes currently in the window.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no bytes have been observed yet.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Feeds a slice of bytes into the checksum.
    ///
    /// Splitting the input across several calls yields the same state as
    /// a single call over the concatenation.
    #[inline]
    pub fn update(&mut self, chunk: &[u8]) {
        let mut s1 = self.s1;
        let mut s2 = self.s2;

        let mut iter = chunk.chunks_exact(4);
        for quad in &mut iter {
            s1 = s1.wrapping_add(u32::from(quad[0]).wrapping_add(CHAR_OFFSET));
            s2 = s2.wrapping_add(s1);
            s1 = s1.wrapping_add(u32::from(quad[1]).wrapping_add(CHAR_OFFSET));
            s2 = s2.wrapping_add(s1);
            s1 = s1.wrapping_add(u32::from(quad[2]).wrapping_add(CHAR_OFFSET));
            s2 = s2.wrapping_add(s1);
            s1 = s1.wrapping_add(u32::from(quad[3]).wrapping_add(CHAR_OFFSET));
            s2 = s2.wrapping_add(s1);
        }
        for &byte in iter.remainder() {
            s1 = s1.wrapping_add(u32::from(byte).wrapping_add(CHAR_OFFSET));
            s2 = s2.wrapping_add(s1);
        }

        self.s1 = s1 & 0xffff;
        self.s2 = s2 & 0xffff;
        self.len = self.len.saturating_add(chunk.len());
    }

    /// Slides the window one byte: removes `outgoing` from the front and
    /// appends `incoming` at the back. The window size is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`RollingError::EmptyWindow`] if no bytes have been
    /// processed yet.
    ///
    /// # Examples
    ///
    /// ```
    /// use checksums::RollingChecksum;
    ///
    /// let data = b"ABCDE";
    /// let mut rolling = RollingChecksum::from_block(&data[0..3]);
    /// rolling.roll(data[0], data[3]).unwrap();
    /// assert_eq!(rolling.value(), RollingChecksum::from_block(&data[1..4]).value());
    /// ```
    #[inline]
    pub fn roll(&mut self, outgoing: u8, incoming: u8) -> Result<(), RollingError> {
        let window_len = self.window_len_u32()?;

        let out = u32::from(outgoing).wrapping_add(CHAR_OFFSET);
        let inn = u32::from(incoming).wrapping_add(CHAR_OFFSET);

        let s1 = self.s1.wrapping_sub(out).wrapping_add(inn) & 0xffff;
        let s2 = self
            .s2
            .wrapping_sub(window_len.wrapping_mul(out))
            .wrapping_add(s1)
            & 0xffff;

        self.s1 = s1;
        self.s2 = s2;
        Ok(())
    }

    /// Shrinks the window by one byte from the front without appending.
    ///
    /// Used at the tail of a file where no incoming byte exists.
    ///
    /// # Errors
    ///
    /// Returns [`RollingError::EmptyWindow`] if the window is empty.
    #[inline]
    pub fn roll_out(&mut self, outgoing: u8) -> Result<(), RollingError> {
        let window_len = self.window_len_u32()?;

        let out = u32::from(outgoing).wrapping_add(CHAR_OFFSET);

        self.s1 = self.s1.wrapping_sub(out) & 0xffff;
        self.s2 = self.s2.wrapping_sub(window_len.wrapping_mul(out)) & 0xffff;
        self.len -= 1;
        Ok(())
    }

    /// Returns the packed 32-bit checksum value, `(s2 << 16) | s1`.
    #[inline]
    #[must_use]
    pub const fn value(&self) -> u32 {
        (self.s2 << 16) | self.s1
    }

    /// Returns the 16-bit hash-table tag, `(s1 + s2) & 0xffff`.
    #[inline]
    #[must_use]
    pub const fn tag(&self) -> u16 {
        (self.s1.wrapping_add(self.s2) & 0xffff) as u16
    }

    #[inline]
    fn window_len_u32(&self) -> Result<u32, RollingError> {
        if self.len == 0 {
            return Err(RollingError::EmptyWindow);
        }
        u32::try_from(self.len).map_err(|_| RollingError::WindowTooLarge { len: self.len })
    }
}

/// Returns the 16-bit table tag for a packed 32-bit checksum value.
#[inline]
#[must_use]
pub fn tag_for(sum: u32) -> u16 {
    ((sum & 0xffff).wrapping_add(sum >> 16) & 0xffff) as u16
}
