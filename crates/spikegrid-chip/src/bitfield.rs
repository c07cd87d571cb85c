// SPDX-License-Identifier: AGPL-3.0-only

//! Bit-field codec.
//!
//! Every table and packet in the core array is a concatenation of
//! fixed-width integer fields. Widths come from the architecture record, so
//! nothing here knows about a particular layout: fields are encoded against
//! an explicit width and sign flag and then laid out LSB-first.
//!
//! ## Conventions
//!
//! | Representation | Bit order |
//! |----------------|-----------|
//! | Text lines (`.mem` images, packet files) | MSB first, one character per bit |
//! | [`BitString`] / [`BitWriter`] / [`BitReader`] | LSB first, bit 0 of word 0 is bit 0 |
//! | Payload words | 64-bit, fields may straddle a word boundary |
//!
//! Sign handling always uses the declared field width: a 9-bit field holding
//! `0b1_0000_0000` decodes as `-256` when signed and `256` when unsigned.

use crate::error::{ChipError, Result};
use std::fmt;

/// Widest field the codec accepts.
pub const MAX_FIELD_WIDTH: u32 = 64;

/// Logical word width used for core-memory payloads.
pub const PAYLOAD_WORD_WIDTH: u32 = 64;

/// Ceiling log2. `clog2(0) == clog2(1) == 0`.
#[must_use]
pub const fn clog2(n: u64) -> u32 {
    if n <= 1 {
        0
    } else {
        64 - (n - 1).leading_zeros()
    }
}

/// Smallest power of two `>= n` (`next_pow2(0) == 1`).
#[must_use]
pub const fn next_pow2(n: u64) -> u64 {
    if n <= 1 {
        1
    } else {
        1 << clog2(n)
    }
}

/// Round a field width up to the nearest machine word width (8/16/32/64).
///
/// # Errors
///
/// Returns [`ChipError::WidthTooLarge`] for widths above 64.
pub fn ceil_word_width(width: u32) -> Result<u32> {
    match width {
        0..=8 => Ok(8),
        9..=16 => Ok(16),
        17..=32 => Ok(32),
        33..=64 => Ok(64),
        _ => Err(ChipError::WidthTooLarge { width }),
    }
}

/// All-ones mask of `width` bits.
#[must_use]
pub const fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

fn check_width(width: u32) -> Result<()> {
    if width > MAX_FIELD_WIDTH {
        return Err(ChipError::WidthTooLarge { width });
    }
    Ok(())
}

/// Encode `value` into a `width`-bit field.
///
/// Signed values are stored in two's complement at the declared width.
///
/// # Errors
///
/// [`ChipError::WidthTooLarge`] when `width > 64`, [`ChipError::ValueOutOfRange`]
/// when `value` is not representable in the field.
#[allow(clippy::cast_sign_loss)]
pub fn encode_field(value: i64, width: u32, signed: bool) -> Result<u64> {
    check_width(width)?;
    let fits = match (width, signed) {
        (0, _) => value == 0,
        (64, true) => true,
        (64, false) => value >= 0,
        (w, true) => {
            let half = 1i64 << (w - 1);
            (-half..half).contains(&value)
        }
        (w, false) => value >= 0 && value.unsigned_abs() <= mask(w),
    };
    if !fits {
        return Err(ChipError::out_of_range(value, width));
    }
    Ok((value as u64) & mask(width))
}

/// Encode an unsigned quantity that may use all 64 bits.
///
/// # Errors
///
/// Same as [`encode_field`].
pub fn encode_unsigned(value: u64, width: u32) -> Result<u64> {
    check_width(width)?;
    if value & !mask(width) != 0 {
        return Err(ChipError::out_of_range(value, width));
    }
    Ok(value)
}

/// Decode a `width`-bit field.
///
/// # Errors
///
/// [`ChipError::WidthTooLarge`] when `width > 64`; [`ChipError::ValueOutOfRange`]
/// when `bits` carries set bits above `width`, or an unsigned 64-bit field
/// does not fit an `i64`.
#[allow(clippy::cast_possible_wrap)]
pub fn decode_field(bits: u64, width: u32, signed: bool) -> Result<i64> {
    check_width(width)?;
    if bits & !mask(width) != 0 {
        return Err(ChipError::out_of_range(bits, width));
    }
    if width == 0 {
        return Ok(0);
    }
    if signed {
        let shift = 64 - width;
        Ok(((bits << shift) as i64) >> shift)
    } else {
        i64::try_from(bits).map_err(|_| ChipError::out_of_range(bits, width))
    }
}

/// Growable bit sequence, LSB first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BitString {
    words: Vec<u64>,
    len: usize,
}

impl BitString {
    /// Empty bit string.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All-zero bit string of `len` bits.
    #[must_use]
    pub fn zeros(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// Wrap pre-packed words, truncating to `len` bits.
    ///
    /// # Errors
    ///
    /// Returns [`ChipError::ParseError`] if `words` holds fewer than `len` bits.
    pub fn from_words(words: &[u64], len: usize) -> Result<Self> {
        let needed = len.div_ceil(64);
        if words.len() < needed {
            return Err(ChipError::parse_error(format!(
                "need {needed} words for {len} bits, got {}",
                words.len()
            )));
        }
        let mut out = Self {
            words: words[..needed].to_vec(),
            len,
        };
        out.clear_tail();
        Ok(out)
    }

    /// Parse a textual line, most significant bit first.
    ///
    /// Interior whitespace is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ChipError::ParseError`] on any character other than `0`, `1`
    /// or whitespace.
    pub fn parse(text: &str) -> Result<Self> {
        let digits: Vec<bool> = text
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| match c {
                '0' => Ok(false),
                '1' => Ok(true),
                other => Err(ChipError::parse_error(format!(
                    "unexpected character {other:?} in bit line"
                ))),
            })
            .collect::<Result<_>>()?;
        let mut out = Self::zeros(digits.len());
        for (i, bit) in digits.iter().rev().enumerate() {
            if *bit {
                out.set(i, true);
            }
        }
        Ok(out)
    }

    /// Number of bits.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True when no bits are held.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backing words, LSB first. Bits past `len` are zero.
    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Bit `index` (LSB = 0). Out-of-range bits read as zero.
    #[must_use]
    pub fn bit(&self, index: usize) -> bool {
        index < self.len && (self.words[index / 64] >> (index % 64)) & 1 == 1
    }

    /// Set bit `index`, growing the string if needed.
    pub fn set(&mut self, index: usize, value: bool) {
        if index >= self.len {
            self.len = index + 1;
            self.words.resize(self.len.div_ceil(64), 0);
        }
        let word = &mut self.words[index / 64];
        if value {
            *word |= 1 << (index % 64);
        } else {
            *word &= !(1 << (index % 64));
        }
    }

    /// True when every bit is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Indices of set bits, ascending.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |i| self.bit(*i))
    }

    /// Reader positioned at bit 0.
    #[must_use]
    pub fn reader(&self) -> BitReader<'_> {
        BitReader::new(&self.words, self.len)
    }

    fn clear_tail(&mut self) {
        let rem = self.len % 64;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= mask(u32::try_from(rem).unwrap_or(64));
            }
        }
    }
}

impl fmt::Display for BitString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in (0..self.len).rev() {
            f.write_str(if self.bit(i) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// Appends fields LSB first.
#[derive(Debug, Clone, Default)]
pub struct BitWriter {
    bits: BitString,
}

impl BitWriter {
    /// New empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bits written so far.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bits.len
    }

    /// True when nothing was written.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bits.len == 0
    }

    /// Append the low `width` bits of `value`.
    ///
    /// # Errors
    ///
    /// [`ChipError::WidthTooLarge`] for widths above 64,
    /// [`ChipError::ValueOutOfRange`] if `value` has bits above `width`.
    pub fn push(&mut self, value: u64, width: u32) -> Result<()> {
        let value = encode_unsigned(value, width)?;
        if width == 0 {
            return Ok(());
        }
        let offset = self.bits.len % 64;
        let new_len = self.bits.len + width as usize;
        self.bits.words.resize(new_len.div_ceil(64), 0);
        let first = self.bits.len / 64;
        self.bits.words[first] |= value << offset;
        // straddles into the next word
        if offset != 0 && offset + width as usize > 64 {
            self.bits.words[first + 1] |= value >> (64 - offset);
        }
        self.bits.len = new_len;
        Ok(())
    }

    /// Encode and append a signed or unsigned field.
    ///
    /// # Errors
    ///
    /// Same as [`encode_field`].
    pub fn push_field(&mut self, value: i64, width: u32, signed: bool) -> Result<()> {
        let bits = encode_field(value, width, signed)?;
        self.push(bits, width)
    }

    /// Append every bit of `other`.
    pub fn push_bits(&mut self, other: &BitString) {
        let start = self.bits.len;
        for i in other.ones() {
            self.bits.set(start + i, true);
        }
        if other.len > 0 {
            let end = start + other.len;
            self.bits.len = end;
            self.bits.words.resize(end.div_ceil(64), 0);
        }
    }

    /// Append `width` zero bits.
    pub fn pad(&mut self, width: usize) {
        let end = self.bits.len + width;
        self.bits.len = end;
        self.bits.words.resize(end.div_ceil(64), 0);
    }

    /// Finish writing.
    #[must_use]
    pub fn finish(self) -> BitString {
        self.bits
    }
}

/// Reads fields LSB first from packed 64-bit words.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    words: &'a [u64],
    len: usize,
    pos: usize,
}

impl<'a> BitReader<'a> {
    /// Reader over `len` bits of `words`.
    #[must_use]
    pub fn new(words: &'a [u64], len: usize) -> Self {
        Self {
            words,
            len: len.min(words.len() * 64),
            pos: 0,
        }
    }

    /// Current bit position.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Bits left to read.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.len - self.pos
    }

    /// Read `width` raw bits.
    ///
    /// # Errors
    ///
    /// [`ChipError::WidthTooLarge`] above 64 bits, [`ChipError::ParseError`]
    /// when the stream is exhausted.
    pub fn read(&mut self, width: u32) -> Result<u64> {
        check_width(width)?;
        if width == 0 {
            return Ok(0);
        }
        if self.remaining() < width as usize {
            return Err(ChipError::parse_error(format!(
                "bit stream exhausted: need {width} bits at {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let offset = self.pos % 64;
        let first = self.pos / 64;
        let mut value = self.words[first] >> offset;
        if offset != 0 && offset + width as usize > 64 {
            value |= self.words[first + 1] << (64 - offset);
        }
        self.pos += width as usize;
        Ok(value & mask(width))
    }

    /// Read and decode a field.
    ///
    /// # Errors
    ///
    /// Same as [`BitReader::read`].
    pub fn read_field(&mut self, width: u32, signed: bool) -> Result<i64> {
        let bits = self.read(width)?;
        decode_field(bits, width, signed)
    }

    /// Read `len` bits into a [`BitString`].
    ///
    /// # Errors
    ///
    /// [`ChipError::ParseError`] when the stream is exhausted.
    pub fn read_bits(&mut self, len: usize) -> Result<BitString> {
        let mut writer = BitWriter::new();
        let mut left = len;
        while left > 0 {
            let chunk = left.min(64);
            #[allow(clippy::cast_possible_truncation)]
            let width = chunk as u32;
            writer.push(self.read(width)?, width)?;
            left -= chunk;
        }
        Ok(writer.finish())
    }

    /// Skip `len` bits.
    ///
    /// # Errors
    ///
    /// [`ChipError::ParseError`] when the stream is exhausted.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        if self.remaining() < len {
            return Err(ChipError::parse_error("bit stream exhausted while skipping"));
        }
        self.pos += len;
        Ok(())
    }
}

/// Parse one line of a bit-text file.
///
/// Returns `Ok(None)` for blank lines and comment lines (starting with `//`
/// or `#`).
///
/// # Errors
///
/// Returns [`ChipError::ParseError`] for any other non-binary content.
pub fn parse_bit_line(line: &str) -> Result<Option<BitString>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with("//") || trimmed.starts_with('#') {
        return Ok(None);
    }
    BitString::parse(trimmed).map(Some)
}

/// Parse every data line of a bit-text document.
///
/// # Errors
///
/// Propagates the first [`ChipError::ParseError`], tagged with its line number.
pub fn parse_bit_lines(text: &str) -> Result<Vec<BitString>> {
    let mut out = Vec::new();
    for (n, line) in text.lines().enumerate() {
        match parse_bit_line(line) {
            Ok(Some(bits)) => out.push(bits),
            Ok(None) => {}
            Err(ChipError::ParseError { reason }) => {
                return Err(ChipError::parse_error(format!("line {}: {reason}", n + 1)));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

/// Render the low `width` bits of `value`, most significant bit first.
#[must_use]
pub fn format_bits(value: u64, width: u32) -> String {
    (0..width.min(64))
        .rev()
        .map(|i| if (value >> i) & 1 == 1 { '1' } else { '0' })
        .collect()
}

/// Pad a field width to the next power of two, as the packed memory layout does.
#[must_use]
pub fn padded_width(width: u32) -> u32 {
    u32::try_from(next_pow2(u64::from(width))).unwrap_or(u32::MAX)
}

/// Pack equal-width elements into 64-bit words.
///
/// Each element is padded to [`padded_width`] and laid out LSB first; the
/// result holds `ceil(padded * count / 64)` words.
///
/// # Errors
///
/// [`ChipError::ValueOutOfRange`] if an element is wider than `width`.
pub fn pack_elements(elements: &[BitString], width: usize) -> Result<Vec<u64>> {
    let padded = next_pow2(width as u64) as usize;
    let mut writer = BitWriter::new();
    for element in elements {
        if element.len() > width {
            return Err(ChipError::out_of_range(
                i128::try_from(element.len()).unwrap_or(i128::MAX),
                u32::try_from(width).unwrap_or(u32::MAX),
            ));
        }
        let start = writer.len();
        writer.push_bits(element);
        writer.pad(padded - (writer.len() - start));
    }
    let total = (padded * elements.len()).div_ceil(64);
    let mut words = writer.finish().words;
    words.resize(total, 0);
    Ok(words)
}

/// Inverse of [`pack_elements`].
///
/// # Errors
///
/// [`ChipError::ParseError`] if `words` is too short for `count` elements.
pub fn unpack_elements(words: &[u64], width: usize, count: usize) -> Result<Vec<BitString>> {
    let padded = next_pow2(width as u64) as usize;
    let mut reader = BitReader::new(words, words.len() * 64);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(reader.read_bits(width)?);
        reader.skip(padded - width)?;
    }
    Ok(out)
}
