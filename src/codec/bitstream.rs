//! Bit-level access to a stream of little-endian 64-bit words.
//!
//! Bit `i` of the stream is bit `i % 64` of word `i / 64`, so the first bit
//! written lands in the least significant position.

/// Appends bits into a zeroed word slice, starting at an arbitrary bit offset.
pub(crate) struct BitWriter<'a> {
    words: &'a mut [u64],
    pos: usize,
}

impl<'a> BitWriter<'a> {
    pub(crate) fn new(words: &'a mut [u64], pos: usize) -> Self {
        Self { words, pos }
    }

    pub(crate) fn write_bit(&mut self, bit: u64) {
        if bit & 1 != 0 {
            self.words[self.pos / 64] |= 1u64 << (self.pos % 64);
        }
        self.pos += 1;
    }

    /// Write the low `n` bits of `value`, least significant first.
    pub(crate) fn write_bits(&mut self, value: u64, n: u32) {
        for i in 0..n {
            self.write_bit(value >> i);
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }
}

/// Reads bits from a word slice, starting at an arbitrary bit offset.
pub(crate) struct BitReader<'a> {
    words: &'a [u64],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(words: &'a [u64], pos: usize) -> Self {
        Self { words, pos }
    }

    pub(crate) fn read_bit(&mut self) -> u64 {
        let bit = (self.words[self.pos / 64] >> (self.pos % 64)) & 1;
        self.pos += 1;
        bit
    }

    pub(crate) fn read_bits(&mut self, n: u32) -> u64 {
        let mut value = 0u64;
        for i in 0..n {
            value |= self.read_bit() << i;
        }
        value
    }
}

/// Decode a little-endian byte slice into words. The slice length must be a
/// multiple of eight.
pub(crate) fn words_from_le_bytes(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            u64::from_le_bytes(raw)
        })
        .collect()
}

/// Encode words into the front of a byte slice.
pub(crate) fn words_to_le_bytes(words: &[u64], bytes: &mut [u8]) {
    for (chunk, word) in bytes.chunks_exact_mut(8).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}
