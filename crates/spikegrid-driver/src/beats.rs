// SPDX-License-Identifier: AGPL-3.0-only

//! Logical words to bus beats and back.
//!
//! When the bus is at least as wide as a word, `bus / word` words share a
//! beat, lowest index in the lowest bits. When it is narrower, each word
//! spans `word / bus` beats, least significant slice first.

use spikegrid_chip::frame::payload_beats;

fn mask(width: u32) -> u128 {
    if width >= 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    }
}

/// Contents of beat `beat` when streaming `words` of `word_width` bits over a
/// `bus_width`-bit bus. Words past the end read as zero.
#[must_use]
pub fn pack_beat(words: &[u64], beat: usize, word_width: u32, bus_width: u32) -> u128 {
    let word_mask = mask(word_width);
    if bus_width >= word_width {
        let per_beat = (bus_width / word_width) as usize;
        (0..per_beat).fold(0u128, |acc, i| {
            let word = words.get(beat * per_beat + i).copied().unwrap_or(0);
            acc | ((u128::from(word) & word_mask) << (i as u32 * word_width))
        })
    } else {
        let per_word = (word_width / bus_width) as usize;
        let word = words.get(beat / per_word).copied().unwrap_or(0);
        let shift = (beat % per_word) as u32 * bus_width;
        ((u128::from(word) & word_mask) >> shift) & mask(bus_width)
    }
}

/// Every beat needed for `words`.
#[must_use]
pub fn pack_words(words: &[u64], word_width: u32, bus_width: u32) -> Vec<u128> {
    let beats = payload_beats(words.len(), word_width, bus_width);
    (0..beats)
        .map(|beat| pack_beat(words, beat as usize, word_width, bus_width))
        .collect()
}

/// Reassemble logical words from beats. Every word slot the beats cover is
/// returned, including padding past the last real word.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn unpack_beats(beats: &[u128], word_width: u32, bus_width: u32) -> Vec<u64> {
    let word_mask = mask(word_width);
    if bus_width >= word_width {
        let per_beat = bus_width / word_width;
        beats
            .iter()
            .flat_map(|beat| (0..per_beat).map(move |i| ((beat >> (i * word_width)) & word_mask) as u64))
            .collect()
    } else {
        let per_word = (word_width / bus_width) as usize;
        beats
            .chunks(per_word)
            .map(|slices| {
                let word = slices
                    .iter()
                    .enumerate()
                    .fold(0u128, |acc, (i, s)| acc | ((s & mask(bus_width)) << (i as u32 * bus_width)));
                (word & word_mask) as u64
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_share_a_beat() {
        let words = [0x11, 0x22, 0x33];
        assert_eq!(pack_beat(&words, 0, 8, 32), 0x0033_2211);
        assert_eq!(pack_words(&words, 8, 32), vec![0x0033_2211]);
        assert_eq!(unpack_beats(&[0x0033_2211], 8, 32), vec![0x11, 0x22, 0x33, 0]);
    }

    #[test]
    fn test_word_spans_beats() {
        let words = [0x1122_3344_5566_7788];
        let beats = pack_words(&words, 64, 16);
        assert_eq!(beats, vec![0x7788, 0x5566, 0x3344, 0x1122]);
        assert_eq!(unpack_beats(&beats, 64, 16), words.to_vec());
    }

    #[test]
    fn test_wide_bus_holds_a_header() {
        let words = [3, 2, 0x40, 0];
        let beats = pack_words(&words, 32, 128);
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0], 3 | (2 << 32) | (0x40 << 64));
        assert_eq!(unpack_beats(&beats, 32, 128), words.to_vec());
    }

    #[test]
    fn test_words_are_masked() {
        assert_eq!(pack_beat(&[0x1FF], 0, 8, 8), 0xFF);
    }
}
