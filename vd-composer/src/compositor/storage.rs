// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

/// Where an intermediate image of a layer composition lives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Location {
    /// The layer's own buffer.
    Source,
    /// One of the two alternating scratch buffers.
    Scratch(usize),
    /// The oversized scratch buffer used ahead of a scale or transpose.
    Special,
    /// The composition target.
    Dest,
}

/// Scratch memory for intermediate images. Image N is dead once image
/// N+1 exists, so two alternating buffers suffice.
#[derive(Debug, Default)]
pub struct ScratchStorage {
    scratch: [Vec<u8>; 2],
    special: Vec<u8>,
}

fn grow(buf: &mut Vec<u8>, len: usize) {
    if buf.len() < len {
        buf.resize(len, 0);
    }
}

impl ScratchStorage {
    pub fn reserve_scratch(&mut self, index: usize, len: usize) {
        grow(&mut self.scratch[index % 2], len);
    }

    pub fn reserve_special(&mut self, len: usize) {
        grow(&mut self.special, len);
    }

    /// Borrows the source and destination of one operation. Returns `None`
    /// if both would alias.
    pub fn split<'a>(
        &'a mut self,
        src: Location,
        dst: Location,
        source: &'a [u8],
        dest: &'a mut [u8],
    ) -> Option<(&'a [u8], &'a mut [u8])> {
        let [even, odd] = &mut self.scratch;
        let special = self.special.as_mut_slice();
        let (even, odd) = (even.as_mut_slice(), odd.as_mut_slice());

        let (from, to): (&'a [u8], &'a mut [u8]) = match (src, dst) {
            (Location::Source, Location::Scratch(j)) => (source, if j % 2 == 0 { even } else { odd }),
            (Location::Source, Location::Special) => (source, special),
            (Location::Source, Location::Dest) => (source, dest),
            (Location::Scratch(i), Location::Scratch(j)) if i % 2 != j % 2 => {
                if i % 2 == 0 {
                    (even, odd)
                } else {
                    (odd, even)
                }
            }
            (Location::Scratch(i), Location::Special) => (if i % 2 == 0 { even } else { odd }, special),
            (Location::Scratch(i), Location::Dest) => (if i % 2 == 0 { even } else { odd }, dest),
            (Location::Special, Location::Scratch(j)) => (special, if j % 2 == 0 { even } else { odd }),
            (Location::Special, Location::Dest) => (special, dest),
            _ => return None,
        };

        Some((from, to))
    }
}
