// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Synthetic EDID blobs for virtual displays, and the small amount of EDID
//! parsing needed to recover a display's physical size.

pub const EDID_LEN: usize = 128;

const HEADER: [u8; 38] = [
    0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x1c, 0xec, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00,
    0x1b, 0x10, 0x01, 0x03, 0x80, 0x50, 0x2d, 0x78, 0x0a, 0x0d, 0xc9, 0xa0, 0x57, 0x47, 0x98, 0x27,
    0x12, 0x48, 0x4c, 0x00, 0x00, 0x00,
];

/// The start of the preferred detailed timing descriptor.
const DTD_OFFSET: usize = 54;
const DTD_PREFIX: [u8; 10] = [0x02, 0x3a, 0x80, 0x18, 0x71, 0x38, 0x2d, 0x40, 0x58, 0x2c];

const NAME_DESCRIPTOR_OFFSET: usize = 108;
const NAME: &[u8; 12] = b"EMU_display_";

/// The byte holding the display number in the monitor name.
pub const NAME_ID_BYTE: usize = 125;

/// Builds the EDID for a virtual display. Ids 0-2 get the canonical blobs;
/// other ids reuse the last one with the name and checksum patched.
pub fn for_display(id: u32) -> [u8; EDID_LEN] {
    let mut edid = base(if id == 1 { 0x54 } else { 0x45 });

    // Only a single digit fits.
    edid[NAME_ID_BYTE] = b'0' + (id % 10) as u8;

    edid[EDID_LEN - 1] = checksum(&edid);
    edid
}

/// Builds an EDID advertising a physical size in millimetres.
pub fn synthesize(id: u32, width_mm: u32, height_mm: u32) -> [u8; EDID_LEN] {
    let mut edid = for_display(id);

    let dtd = &mut edid[DTD_OFFSET..DTD_OFFSET + 18];
    dtd[12] = (width_mm & 0xff) as u8;
    dtd[13] = (height_mm & 0xff) as u8;
    dtd[14] = (((width_mm >> 4) & 0xf0) | ((height_mm >> 8) & 0x0f)) as u8;

    edid[EDID_LEN - 1] = checksum(&edid);
    edid
}

fn base(byte64: u8) -> [u8; EDID_LEN] {
    let mut edid = [0; EDID_LEN];
    edid[..HEADER.len()].copy_from_slice(&HEADER);
    edid[HEADER.len()..DTD_OFFSET].fill(0x01);
    edid[DTD_OFFSET..DTD_OFFSET + DTD_PREFIX.len()].copy_from_slice(&DTD_PREFIX);
    edid[DTD_OFFSET + DTD_PREFIX.len()] = byte64;

    let name = &mut edid[NAME_DESCRIPTOR_OFFSET..];
    name[..5].copy_from_slice(&[0x00, 0x00, 0x00, 0xfc, 0x00]);
    name[5..5 + NAME.len()].copy_from_slice(NAME);

    edid
}

/// The byte that makes all 128 bytes sum to zero.
pub fn checksum(edid: &[u8; EDID_LEN]) -> u8 {
    let sum = edid[..EDID_LEN - 1]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

/// Extracts the physical size in millimetres from the preferred detailed
/// timing descriptor.
pub fn physical_size(edid: &[u8]) -> Option<(u32, u32)> {
    if edid.len() < EDID_LEN || edid[..8] != HEADER[..8] {
        return None;
    }

    let dtd = &edid[DTD_OFFSET..DTD_OFFSET + 18];

    // A zero pixel clock marks a display descriptor, not a timing.
    if dtd[0] == 0 && dtd[1] == 0 {
        return None;
    }

    let w = dtd[12] as u32 | ((dtd[14] as u32 & 0xf0) << 4);
    let h = dtd[13] as u32 | ((dtd[14] as u32 & 0x0f) << 8);
    if w == 0 || h == 0 {
        return None;
    }

    Some((w, h))
}

/// Converts a pixel count and a size in millimetres to dots per inch.
pub fn dpi(px: u32, mm: u32) -> u32 {
    const DEFAULT_DPI: u32 = 160;

    if mm == 0 {
        return DEFAULT_DPI;
    }

    ((px as f64 * 25.4) / mm as f64) as u32
}
