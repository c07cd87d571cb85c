// SPDX-License-Identifier: AGPL-3.0-only

//! Beat packing and header sizing across bus and word widths.

use spikegrid_chip::frame::payload_beats;
use spikegrid_chip::{ArchField, ArchitectureParams};
use spikegrid_driver::beats::{pack_words, unpack_beats};

#[test]
fn test_payloads_survive_every_bus() {
    for bus in [32, 64] {
        for width in [8u32, 16, 32, 64] {
            let mask = if width == 64 { u64::MAX } else { (1 << width) - 1 };
            let words: Vec<u64> = (0..16u64)
                .map(|i| (i * 0x0123_4567_89AB_CDEF + 7) & mask)
                .collect();
            let beats = pack_words(&words, width, bus);
            assert_eq!(beats.len() as u64, payload_beats(words.len(), width, bus));
            let back = unpack_beats(&beats, width, bus);
            assert_eq!(&back[..words.len()], &words[..], "bus {bus}, width {width}");
            assert!(back[words.len()..].iter().all(|w| *w == 0));
        }
    }
}

#[test]
fn test_header_beats_follow_bus() {
    for (bus, beats) in [(8, 16), (16, 8), (32, 4), (64, 2), (128, 1)] {
        let arch = ArchitectureParams::REFERENCE
            .with_field(ArchField::DmaBusWidth, bus)
            .expect("bus override");
        assert_eq!(arch.header_beats().expect("divides 128"), beats);
    }
    let odd = ArchitectureParams::REFERENCE
        .with_field(ArchField::DmaBusWidth, 48)
        .expect("bus override");
    assert!(odd.header_beats().is_err());
}
