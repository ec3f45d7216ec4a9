// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Pixel operations over packed RGBA images. Every operation reads the
//! source region of one image and writes the destination region of
//! another. Operations that take a `vflip` read the source bottom-up.

const BPP: usize = 4;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Region {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Region {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// The part of a packed 32bpp image an operation works on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Surface {
    pub stride: usize,
    pub region: Region,
}

impl Surface {
    /// A whole image with rows aligned to four bytes.
    pub fn packed(width: usize, height: usize) -> Self {
        Self {
            stride: (width * BPP).next_multiple_of(4),
            region: Region::new(0, 0, width, height),
        }
    }

    fn offset(&self, x: usize, y: usize) -> usize {
        (self.region.y + y) * self.stride + (self.region.x + x) * BPP
    }

    fn row(&self, y: usize) -> std::ops::Range<usize> {
        let start = self.offset(0, y);
        start..start + self.region.width * BPP
    }

    /// The minimum number of bytes backing the image.
    pub fn min_len(&self) -> usize {
        if self.region.is_empty() {
            0
        } else {
            self.offset(self.region.width, self.region.height - 1)
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Rotation {
    None,
    Rot90,
    Rot180,
    Rot270,
}

impl Rotation {
    pub fn transposes(&self) -> bool {
        matches!(self, Rotation::Rot90 | Rotation::Rot270)
    }
}

/// The three planes of a YV12 image. V comes before U.
#[derive(Debug, Copy, Clone)]
pub struct Yv12<'a> {
    pub y: &'a [u8],
    pub y_stride: usize,
    pub v: &'a [u8],
    pub u: &'a [u8],
    pub c_stride: usize,
}

fn src_row(y: usize, height: usize, vflip: bool) -> usize {
    if vflip {
        height - 1 - y
    } else {
        y
    }
}

fn pixel(data: &[u8], surface: &Surface, x: usize, y: usize) -> [u8; 4] {
    let off = surface.offset(x, y);
    [data[off], data[off + 1], data[off + 2], data[off + 3]]
}

pub fn fill(dst: &mut [u8], ds: &Surface, rgba: [u8; 4]) {
    for y in 0..ds.region.height {
        for px in dst[ds.row(y)].chunks_exact_mut(BPP) {
            px.copy_from_slice(&rgba);
        }
    }
}

pub fn copy(src: &[u8], ss: &Surface, dst: &mut [u8], ds: &Surface, vflip: bool) {
    let height = ss.region.height;
    for y in 0..height {
        let from = ss.row(src_row(y, height, vflip));
        dst[ds.row(y)].copy_from_slice(&src[from]);
    }
}

fn expand(v: u16, bits: u32) -> u8 {
    let v = v as u32;
    ((v << (8 - bits)) | (v >> (2 * bits - 8))) as u8
}

/// Converts a little-endian RGB565 region, 2 bytes per pixel.
pub fn rgb565_to_rgba(
    src: &[u8],
    stride: usize,
    region: Region,
    dst: &mut [u8],
    ds: &Surface,
    vflip: bool,
) {
    for y in 0..region.height {
        let sy = region.y + src_row(y, region.height, vflip);
        let row = &src[sy * stride + region.x * 2..];
        let out = &mut dst[ds.row(y)];

        for (px, out) in row
            .chunks_exact(2)
            .take(region.width)
            .zip(out.chunks_exact_mut(BPP))
        {
            let v = u16::from_le_bytes([px[0], px[1]]);
            out[0] = expand(v >> 11, 5);
            out[1] = expand((v >> 5) & 0x3f, 6);
            out[2] = expand(v & 0x1f, 5);
            out[3] = 0xff;
        }
    }
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited range to RGB.
fn yuv_to_rgba(y: u8, u: u8, v: u8) -> [u8; 4] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    [
        clamp_u8((298 * c + 409 * e + 128) >> 8),
        clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((298 * c + 516 * d + 128) >> 8),
        0xff,
    ]
}

pub fn yv12_to_rgba(src: &Yv12<'_>, region: Region, dst: &mut [u8], ds: &Surface, vflip: bool) {
    for y in 0..region.height {
        let sy = region.y + src_row(y, region.height, vflip);
        let out = &mut dst[ds.row(y)];

        for (x, out) in out.chunks_exact_mut(BPP).enumerate() {
            let sx = region.x + x;
            let c = (sy / 2) * src.c_stride + sx / 2;
            out.copy_from_slice(&yuv_to_rgba(
                src.y[sy * src.y_stride + sx],
                src.u[c],
                src.v[c],
            ));
        }
    }
}

fn step(from: usize, to: usize) -> usize {
    if to > 1 {
        ((from - 1) << 16) / (to - 1)
    } else {
        0
    }
}

fn lerp(a: u8, b: u8, f: usize) -> usize {
    (a as usize * (0x10000 - f) + b as usize * f) >> 16
}

/// Bilinear scaling in 16.16 fixed point, with corners aligned.
pub fn scale(src: &[u8], ss: &Surface, dst: &mut [u8], ds: &Surface, vflip: bool) {
    let (sw, sh) = (ss.region.width, ss.region.height);
    let (dw, dh) = (ds.region.width, ds.region.height);
    if sw == 0 || sh == 0 {
        return;
    }

    let (step_x, step_y) = (step(sw, dw), step(sh, dh));
    for dy in 0..dh {
        let fy = dy * step_y;
        let y0 = fy >> 16;
        let y1 = (y0 + 1).min(sh - 1);
        let wy = fy & 0xffff;
        let (y0, y1) = (src_row(y0, sh, vflip), src_row(y1, sh, vflip));

        for dx in 0..dw {
            let fx = dx * step_x;
            let x0 = fx >> 16;
            let x1 = (x0 + 1).min(sw - 1);
            let wx = fx & 0xffff;

            let (a, b) = (pixel(src, ss, x0, y0), pixel(src, ss, x1, y0));
            let (c, d) = (pixel(src, ss, x0, y1), pixel(src, ss, x1, y1));

            let off = ds.offset(dx, dy);
            for i in 0..BPP {
                let top = lerp(a[i], b[i], wx);
                let bottom = lerp(c[i], d[i], wx);
                dst[off + i] = ((top * (0x10000 - wy) + bottom * wy) >> 16) as u8;
            }
        }
    }
}

/// Rotates clockwise. The destination region must already have the
/// rotated dimensions.
pub fn rotate(
    src: &[u8],
    ss: &Surface,
    dst: &mut [u8],
    ds: &Surface,
    rotation: Rotation,
    vflip: bool,
) {
    let (sw, sh) = (ss.region.width, ss.region.height);
    for dy in 0..ds.region.height {
        for dx in 0..ds.region.width {
            let (sx, sy) = match rotation {
                Rotation::None => (dx, dy),
                Rotation::Rot90 => (dy, sh - 1 - dx),
                Rotation::Rot180 => (sw - 1 - dx, sh - 1 - dy),
                Rotation::Rot270 => (sw - 1 - dy, dx),
            };

            let off = ds.offset(dx, dy);
            dst[off..off + BPP].copy_from_slice(&pixel(src, ss, sx, src_row(sy, sh, vflip)));
        }
    }
}

/// Premultiplies color by alpha.
pub fn attenuate(src: &[u8], ss: &Surface, dst: &mut [u8], ds: &Surface, vflip: bool) {
    let height = ds.region.height;
    for y in 0..height {
        let from = &src[ss.row(src_row(y, height, vflip))];
        for (px, out) in from
            .chunks_exact(BPP)
            .zip(dst[ds.row(y)].chunks_exact_mut(BPP))
        {
            let a = px[3] as u32;
            for i in 0..3 {
                out[i] = ((px[i] as u32 * a + 255) >> 8) as u8;
            }
            out[3] = px[3];
        }
    }
}

/// Multiplies every channel by the matching channel of `shade`.
pub fn shade(src: &[u8], ss: &Surface, dst: &mut [u8], ds: &Surface, shade: [u8; 4]) {
    for y in 0..ds.region.height {
        for (px, out) in src[ss.row(y)]
            .chunks_exact(BPP)
            .zip(dst[ds.row(y)].chunks_exact_mut(BPP))
        {
            for i in 0..BPP {
                let c = px[i] as u64 * 0x101;
                let s = shade[i] as u64 * 0x101;
                out[i] = ((c * s) >> 24) as u8;
            }
        }
    }
}

/// Blends premultiplied `src` over `dst` in place. The result is opaque.
pub fn blend(src: &[u8], ss: &Surface, dst: &mut [u8], ds: &Surface, vflip: bool) {
    let height = ds.region.height;
    for y in 0..height {
        let from = &src[ss.row(src_row(y, height, vflip))];
        for (px, out) in from
            .chunks_exact(BPP)
            .zip(dst[ds.row(y)].chunks_exact_mut(BPP))
        {
            let inv = 256 - px[3] as u32;
            for i in 0..3 {
                out[i] = (px[i] as u32 + ((inv * out[i] as u32) >> 8)).min(255) as u8;
            }
            out[3] = 0xff;
        }
    }
}

/// Converts a row-major float matrix to signed 6-bit fractional fixed
/// point, transposed so each output channel's coefficients are adjacent.
pub fn fixed_color_matrix(m: &[f32; 16]) -> [i8; 16] {
    let mut out = [0; 16];
    for r in 0..4 {
        for c in 0..4 {
            out[4 * c + r] = (m[4 * r + c] * 64.0 + 0.5).clamp(-128.0, 127.0) as i8;
        }
    }

    out
}

pub fn color_matrix(buf: &mut [u8], surface: &Surface, m: &[i8; 16]) {
    for y in 0..surface.region.height {
        for px in buf[surface.row(y)].chunks_exact_mut(BPP) {
            let input = [px[0] as i32, px[1] as i32, px[2] as i32, px[3] as i32];
            for (c, out) in px.iter_mut().enumerate() {
                let sum: i32 = (0..4).map(|k| input[k] * m[4 * c + k] as i32).sum();
                *out = clamp_u8(sum >> 6);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn image(width: usize, height: usize, pixels: &[[u8; 4]]) -> (Vec<u8>, Surface) {
        let surface = Surface::packed(width, height);
        let mut data = vec![0; surface.min_len()];
        for (i, px) in pixels.iter().enumerate() {
            let off = surface.offset(i % width, i / width);
            data[off..off + 4].copy_from_slice(px);
        }

        (data, surface)
    }

    fn pixels(data: &[u8], surface: &Surface) -> Vec<[u8; 4]> {
        let mut out = Vec::new();
        for y in 0..surface.region.height {
            for x in 0..surface.region.width {
                out.push(pixel(data, surface, x, y));
            }
        }

        out
    }

    const A: [u8; 4] = [1, 1, 1, 255];
    const B: [u8; 4] = [2, 2, 2, 255];
    const C: [u8; 4] = [3, 3, 3, 255];
    const D: [u8; 4] = [4, 4, 4, 255];
    const E: [u8; 4] = [5, 5, 5, 255];
    const F: [u8; 4] = [6, 6, 6, 255];

    #[test]
    fn fill_region_only() {
        let (mut data, mut surface) = image(3, 2, &[[0; 4]; 6]);
        surface.region = Region::new(1, 1, 2, 1);
        fill(&mut data, &surface, [9, 8, 7, 6]);

        let whole = Surface::packed(3, 2);
        assert_eq!(
            pixels(&data, &whole),
            vec![[0; 4], [0; 4], [0; 4], [0; 4], [9, 8, 7, 6], [9, 8, 7, 6]]
        );
    }

    #[test]
    fn copy_with_vflip() {
        let (src, ss) = image(2, 2, &[A, B, C, D]);
        let (mut dst, ds) = image(2, 2, &[[0; 4]; 4]);
        copy(&src, &ss, &mut dst, &ds, true);
        assert_eq!(pixels(&dst, &ds), vec![C, D, A, B]);
    }

    #[test]
    fn rgb565() {
        let src: Vec<u8> = [0xf800u16, 0x07e0, 0x001f, 0xffff]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();

        let (mut dst, ds) = image(4, 1, &[[0; 4]; 4]);
        rgb565_to_rgba(&src, 8, Region::new(0, 0, 4, 1), &mut dst, &ds, false);
        assert_eq!(
            pixels(&dst, &ds),
            vec![
                [255, 0, 0, 255],
                [0, 255, 0, 255],
                [0, 0, 255, 255],
                [255, 255, 255, 255]
            ]
        );
    }

    #[test]
    fn yv12() {
        // 2x2 luma, one chroma sample. Y=81 U=90 V=240 is pure red.
        let y = [81, 81, 16, 235];
        let planes = Yv12 {
            y: &y,
            y_stride: 2,
            v: &[240],
            u: &[90],
            c_stride: 1,
        };

        let (mut dst, ds) = image(2, 1, &[[0; 4]; 2]);
        yv12_to_rgba(&planes, Region::new(0, 0, 2, 1), &mut dst, &ds, false);
        assert_eq!(pixels(&dst, &ds), vec![[255, 0, 0, 255], [255, 0, 0, 255]]);

        let gray = Yv12 {
            v: &[128],
            u: &[128],
            ..planes
        };
        yv12_to_rgba(&gray, Region::new(0, 1, 2, 1), &mut dst, &ds, false);
        assert_eq!(pixels(&dst, &ds), vec![[0, 0, 0, 255], [255, 255, 255, 255]]);
    }

    #[test]
    fn scale_identity_and_upscale() {
        let (src, ss) = image(2, 1, &[[0, 0, 0, 255], [200, 100, 50, 255]]);

        let (mut dst, ds) = image(2, 1, &[[0; 4]; 2]);
        scale(&src, &ss, &mut dst, &ds, false);
        assert_eq!(pixels(&dst, &ds), pixels(&src, &ss));

        let (mut dst, ds) = image(3, 1, &[[0; 4]; 3]);
        scale(&src, &ss, &mut dst, &ds, false);
        assert_eq!(
            pixels(&dst, &ds),
            vec![[0, 0, 0, 255], [100, 50, 25, 255], [200, 100, 50, 255]]
        );
    }

    #[test]
    fn rotations() {
        // A B C
        // D E F
        let (src, ss) = image(3, 2, &[A, B, C, D, E, F]);

        let (mut dst, ds) = image(2, 3, &[[0; 4]; 6]);
        rotate(&src, &ss, &mut dst, &ds, Rotation::Rot90, false);
        assert_eq!(pixels(&dst, &ds), vec![D, A, E, B, F, C]);

        rotate(&src, &ss, &mut dst, &ds, Rotation::Rot270, false);
        assert_eq!(pixels(&dst, &ds), vec![C, F, B, E, A, D]);

        let (mut dst, ds) = image(3, 2, &[[0; 4]; 6]);
        rotate(&src, &ss, &mut dst, &ds, Rotation::Rot180, false);
        assert_eq!(pixels(&dst, &ds), vec![F, E, D, C, B, A]);

        // A horizontal flip is a 180 degree turn plus a vertical flip.
        rotate(&src, &ss, &mut dst, &ds, Rotation::Rot180, true);
        assert_eq!(pixels(&dst, &ds), vec![C, B, A, F, E, D]);
    }

    #[test]
    fn attenuate_premultiplies() {
        let (src, ss) = image(2, 1, &[[200, 100, 255, 128], [255, 255, 255, 255]]);
        let (mut dst, ds) = image(2, 1, &[[0; 4]; 2]);
        attenuate(&src, &ss, &mut dst, &ds, false);
        assert_eq!(
            pixels(&dst, &ds),
            vec![[100, 50, 128, 128], [255, 255, 255, 255]]
        );
    }

    #[test]
    fn shade_scales_channels() {
        let (src, ss) = image(1, 1, &[[200, 100, 50, 255]]);
        let (mut dst, ds) = image(1, 1, &[[0; 4]]);

        shade(&src, &ss, &mut dst, &ds, [255, 255, 255, 255]);
        assert_eq!(pixels(&dst, &ds), vec![[200, 100, 50, 255]]);

        shade(&src, &ss, &mut dst, &ds, [128, 128, 128, 255]);
        assert_eq!(pixels(&dst, &ds), vec![[100, 50, 25, 255]]);
    }

    #[test]
    fn blend_over() {
        let (src, ss) = image(2, 1, &[[0, 0, 0, 0], [100, 0, 0, 128]]);
        let (mut dst, ds) = image(2, 1, &[[10, 20, 30, 40], [200, 200, 200, 255]]);
        blend(&src, &ss, &mut dst, &ds, false);
        assert_eq!(
            pixels(&dst, &ds),
            vec![[10, 20, 30, 255], [200, 100, 100, 255]]
        );
    }

    #[test]
    fn color_matrix_identity_and_swap() {
        #[rustfmt::skip]
        let identity = [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];

        let fixed = fixed_color_matrix(&identity);
        assert_eq!(fixed[0], 64);
        assert_eq!(fixed[1], 0);

        let (mut data, surface) = image(1, 1, &[[10, 20, 30, 255]]);
        color_matrix(&mut data, &surface, &fixed);
        assert_eq!(pixels(&data, &surface), vec![[10, 20, 30, 255]]);

        // Row r holds the contribution of input channel r.
        #[rustfmt::skip]
        let red_to_blue = [
            0.0, 0.0, 1.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            1.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];

        color_matrix(&mut data, &surface, &fixed_color_matrix(&red_to_blue));
        assert_eq!(pixels(&data, &surface), vec![[30, 20, 10, 255]]);
    }

    #[test]
    fn clamps_out_of_range_coefficients() {
        let mut m = [0.0; 16];
        m[0] = 4.0;
        m[5] = -4.0;
        let fixed = fixed_color_matrix(&m);
        assert_eq!(fixed[0], 127);
        assert_eq!(fixed[5], -128);
    }
}
