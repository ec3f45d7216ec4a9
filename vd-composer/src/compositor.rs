// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Software composition of device layers into a display image.

mod ops;
mod storage;

use drm_fourcc::DrmFourcc;
use tracing::{error, instrument, warn};

use crate::{
    buffer::GraphicsBuffer,
    error::{Error, Result},
    fence,
    layer::{BlendMode, Composition, Layer, Rect, Transform},
};

use ops::{Region, Rotation, Surface, Yv12};
use storage::{Location, ScratchStorage};

/// Whether the compositor can read a buffer of this format.
pub fn is_format_supported(format: DrmFourcc) -> bool {
    matches!(
        format,
        DrmFourcc::Abgr8888 | DrmFourcc::Xbgr8888 | DrmFourcc::Rgb565 | DrmFourcc::Yvu420
    )
}

/// A locked composition target, tightly packed RGBA.
pub struct Target<'a> {
    pub data: &'a mut [u8],
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

impl Target<'_> {
    fn surface(&self) -> Surface {
        Surface {
            stride: self.stride as usize,
            region: Region::new(0, 0, self.width as usize, self.height as usize),
        }
    }
}

fn rotation_for(transform: Transform) -> Rotation {
    // Horizontal flips become a half turn plus a vertical flip.
    let quarter_turns = transform.contains(Transform::ROT_90) as u8
        + 2 * transform.contains(Transform::FLIP_H) as u8;
    match quarter_turns {
        0 => Rotation::None,
        1 => Rotation::Rot90,
        2 => Rotation::Rot180,
        _ => Rotation::Rot270,
    }
}

fn vflip_for(transform: Transform) -> bool {
    transform.contains(Transform::FLIP_V) ^ transform.contains(Transform::FLIP_H)
}

fn needs_scaling(crop: &Rect, frame: &Rect, transform: Transform) -> bool {
    let (from_w, from_h) = (crop.width(), crop.height());
    let (to_w, to_h) = (frame.width(), frame.height());
    if transform.contains(Transform::ROT_90) {
        from_w != to_h || from_h != to_w
    } else {
        from_w != to_w || from_h != to_h
    }
}

fn to_channel(v: f32) -> u8 {
    (v * 255.0) as u8
}

/// The shade applied for a layer brightness below one.
fn brightness_shade(brightness: f32, plane_alpha: f32) -> [u8; 4] {
    const MIX: f32 = 0.5;

    let gamma = brightness.powf(1.0 / 2.2);
    let level = gamma + (gamma * plane_alpha - gamma) * MIX;
    let c = (level * 255.0 + 0.5).min(255.0) as u8;
    [c, c, c, 0xff]
}

fn region_of(rect: &Rect) -> Option<Region> {
    if rect.left < 0 || rect.top < 0 || rect.width() <= 0 || rect.height() <= 0 {
        return None;
    }

    Some(Region::new(
        rect.left as usize,
        rect.top as usize,
        rect.width() as usize,
        rect.height() as usize,
    ))
}

fn fits(region: &Region, width: u32, height: u32) -> bool {
    region.x + region.width <= width as usize && region.y + region.height <= height as usize
}

/// How a layer's pixels are read.
enum Input<'a> {
    None,
    Packed(&'a [u8], Surface),
    Rgb565(&'a [u8], usize, Region),
    Yv12(Yv12<'a>, Region),
}

impl<'a> Input<'a> {
    fn new(buffer: &GraphicsBuffer, data: &'a [u8], crop: Region) -> Option<Self> {
        let planes = buffer.planes();
        let plane = |i: usize| -> Option<(&'a [u8], usize)> {
            let p = planes.get(i)?;
            Some((data.get(p.offset as usize..)?, p.stride as usize))
        };

        let input = match buffer.format() {
            DrmFourcc::Abgr8888 | DrmFourcc::Xbgr8888 => {
                let (data, stride) = plane(0)?;
                let surface = Surface {
                    stride,
                    region: crop,
                };

                if data.len() < surface.min_len() {
                    return None;
                }

                Input::Packed(data, surface)
            }
            DrmFourcc::Rgb565 => {
                let (data, stride) = plane(0)?;
                if data.len() < (crop.y + crop.height - 1) * stride + (crop.x + crop.width) * 2 {
                    return None;
                }

                Input::Rgb565(data, stride, crop)
            }
            DrmFourcc::Yvu420 => {
                let (y, y_stride) = plane(0)?;
                let (v, c_stride) = plane(1)?;
                let (u, _) = plane(2)?;

                let last_row = crop.y + crop.height - 1;
                let last_col = crop.x + crop.width - 1;
                let c_len = (last_row / 2) * c_stride + last_col / 2 + 1;
                if y.len() < last_row * y_stride + last_col + 1 || v.len() < c_len || u.len() < c_len {
                    return None;
                }

                Input::Yv12(
                    Yv12 {
                        y,
                        y_stride,
                        v,
                        u,
                        c_stride,
                    },
                    crop,
                )
            }
            _ => return None,
        };

        Some(input)
    }

    fn data(&self) -> &'a [u8] {
        match self {
            Input::None => &[],
            Input::Packed(data, _) => *data,
            Input::Rgb565(data, _, _) => *data,
            Input::Yv12(planes, _) => planes.y,
        }
    }
}

/// Composes layers one at a time into a target, reusing scratch memory
/// across frames.
#[derive(Debug, Default)]
pub struct Compositor {
    storage: ScratchStorage,
}

impl Compositor {
    /// Draws one DEVICE or SOLID_COLOR layer into the target. A layer whose
    /// frame falls outside the target is skipped.
    #[instrument(level = "trace", skip_all, fields(layer_id = layer.id()))]
    pub fn compose_layer(&mut self, layer: &Layer, target: &mut Target<'_>) -> Result<()> {
        let composition = layer.composition_type();
        let transform = layer.transform();
        let frame_rect = layer.display_frame();
        let Some(frame) = region_of(&frame_rect).filter(|r| fits(r, target.width, target.height))
        else {
            warn!(frame = ?frame_rect, "layer frame outside of target, skipping");
            return Ok(());
        };

        let buffer = match composition {
            Composition::Device => {
                fence::wait_logged(layer.buffer().fence(), "layer buffer");
                let Some(buffer) = layer.buffer().buffer() else {
                    error!("device layer without a buffer");
                    return Err(Error::NoResources);
                };

                Some(buffer)
            }
            Composition::SolidColor => None,
            _ => return Ok(()),
        };

        let mapped = buffer.map(GraphicsBuffer::lock);
        let crop_rect = layer.source_crop_int();

        let input = match (buffer, mapped.as_deref()) {
            (Some(buffer), Some(data)) => {
                let crop = region_of(&crop_rect)
                    .filter(|r| fits(r, buffer.width(), buffer.height()))
                    .and_then(|crop| Input::new(buffer, data, crop));

                match crop {
                    Some(input) => input,
                    None => {
                        error!(
                            crop = ?crop_rect,
                            format = ?buffer.format(),
                            "unable to read layer buffer"
                        );
                        return Err(Error::NoResources);
                    }
                }
            }
            _ => Input::None,
        };

        let rotation = rotation_for(transform);
        let needs_fill = composition == Composition::SolidColor;
        let needs_conversion = matches!(input, Input::Rgb565(..) | Input::Yv12(..));
        let needs_scaling = needs_scaling(&crop_rect, &frame_rect, transform);
        let needs_rotation = rotation != Rotation::None;
        let needs_transpose = rotation.transposes();
        let mut vflip = vflip_for(transform);
        let needs_attenuation = layer.blend_mode() == BlendMode::Coverage;
        let needs_blending = layer.blend_mode() != BlendMode::None;
        let needs_brightness = layer.brightness() != 1.0;
        let needs_copy = !(needs_conversion
            || needs_scaling
            || needs_rotation
            || needs_attenuation
            || needs_blending);

        let op_count = [
            needs_fill,
            needs_conversion,
            needs_scaling,
            needs_rotation,
            needs_attenuation,
            needs_blending,
            needs_copy,
            needs_brightness,
        ]
        .into_iter()
        .filter(|b| *b)
        .count();

        // Each operation pops its destination. The last one lands in the
        // target.
        let mut stack = vec![(
            Location::Dest,
            Surface {
                stride: target.stride as usize,
                region: frame,
            },
        )];

        let scratch = Surface::packed(frame.width, frame.height);
        for i in 0..op_count.saturating_sub(1) {
            self.storage.reserve_scratch(i, scratch.min_len());
            stack.push((Location::Scratch(i), scratch));
        }

        let mut src = match &input {
            Input::Packed(_, surface) => (Location::Source, *surface),
            _ => (Location::Source, scratch),
        };

        let source = input.data();
        let dest = &mut *target.data;
        let storage = &mut self.storage;

        if needs_fill {
            let (loc, ds) = stack.pop().ok_or(Error::NoResources)?;
            let (_, to) = buffers(storage, src.0, loc, source, dest)?;

            let c = layer.color();
            ops::fill(
                to,
                &ds,
                [to_channel(c.r), to_channel(c.g), to_channel(c.b), to_channel(c.a)],
            );
            src = (loc, ds);
        }

        if needs_conversion {
            let (mut loc, mut ds) = stack.pop().ok_or(Error::NoResources)?;
            if needs_scaling || needs_transpose {
                // The converted image keeps the crop size.
                ds = Surface::packed(crop_rect.width() as usize, crop_rect.height() as usize);
                storage.reserve_special(ds.min_len());
                loc = Location::Special;
            }

            let (_, to) = buffers(storage, src.0, loc, source, dest)?;
            match &input {
                Input::Rgb565(data, stride, region) => {
                    ops::rgb565_to_rgba(data, *stride, *region, to, &ds, vflip)
                }
                Input::Yv12(planes, region) => ops::yv12_to_rgba(planes, *region, to, &ds, vflip),
                _ => (),
            }

            vflip = false;
            src = (loc, ds);
        }

        if needs_scaling {
            let (loc, mut ds) = stack.pop().ok_or(Error::NoResources)?;
            if needs_transpose {
                ds = Surface::packed(ds.region.height, ds.region.width);
            }

            let (from, to) = buffers(storage, src.0, loc, source, dest)?;
            ops::scale(from, &src.1, to, &ds, vflip);
            vflip = false;
            src = (loc, ds);
        }

        if needs_rotation {
            let (loc, ds) = stack.pop().ok_or(Error::NoResources)?;
            let (from, to) = buffers(storage, src.0, loc, source, dest)?;
            ops::rotate(from, &src.1, to, &ds, rotation, vflip);
            vflip = false;
            src = (loc, ds);
        }

        if needs_attenuation {
            let (loc, ds) = stack.pop().ok_or(Error::NoResources)?;
            let (from, to) = buffers(storage, src.0, loc, source, dest)?;
            ops::attenuate(from, &src.1, to, &ds, vflip);
            vflip = false;
            src = (loc, ds);
        }

        if needs_brightness {
            let (loc, ds) = stack.pop().ok_or(Error::NoResources)?;
            let (from, to) = buffers(storage, src.0, loc, source, dest)?;
            let shade = brightness_shade(layer.brightness(), layer.plane_alpha());
            ops::shade(from, &src.1, to, &ds, shade);
            src = (loc, ds);
        }

        if needs_copy {
            let (loc, ds) = stack.pop().ok_or(Error::NoResources)?;
            let (from, to) = buffers(storage, src.0, loc, source, dest)?;
            ops::copy(from, &src.1, to, &ds, vflip);
            vflip = false;
            src = (loc, ds);
        }

        if needs_blending {
            let (loc, ds) = stack.pop().ok_or(Error::NoResources)?;
            let (from, to) = buffers(storage, src.0, loc, source, dest)?;
            ops::blend(from, &src.1, to, &ds, vflip);
        }

        debug_assert!(stack.is_empty());
        Ok(())
    }
}

fn buffers<'a>(
    storage: &'a mut ScratchStorage,
    src: Location,
    dst: Location,
    source: &'a [u8],
    dest: &'a mut [u8],
) -> Result<(&'a [u8], &'a mut [u8])> {
    storage.split(src, dst, source, dest).ok_or_else(|| {
        error!(?src, ?dst, "aliased composition buffers");
        Error::NoResources
    })
}

/// Multiplies every pixel of the target by a row-major 4x4 matrix.
#[instrument(level = "trace", skip_all)]
pub fn apply_color_transform(matrix: &[f32; 16], target: &mut Target<'_>) {
    let surface = target.surface();
    ops::color_matrix(target.data, &surface, &ops::fixed_color_matrix(matrix));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        buffer::{self, PlaneMetadata},
        layer::{Color, FRect},
    };
    use pretty_assertions::assert_eq;

    const RED: [u8; 4] = [255, 0, 0, 255];
    const GREEN: [u8; 4] = [0, 255, 0, 255];
    const BLUE: [u8; 4] = [0, 0, 255, 255];
    const WHITE: [u8; 4] = [255, 255, 255, 255];
    const CLEAR: [u8; 4] = [0; 4];

    fn rgba_buffer(width: u32, height: u32, pixels: &[[u8; 4]]) -> GraphicsBuffer {
        let (planes, _) = buffer::layout(DrmFourcc::Abgr8888, width, height).unwrap();
        let data = pixels.iter().flatten().copied().collect();
        GraphicsBuffer::from_heap(width, height, DrmFourcc::Abgr8888, planes, data)
    }

    fn device_layer(buffer: GraphicsBuffer, crop: FRect, frame: Rect) -> Layer {
        let mut layer = Layer::new();
        layer.set_composition_type(Composition::Device);
        layer.set_buffer(Some(buffer), None);
        layer.set_source_crop(crop);
        layer.set_display_frame(frame);
        layer
    }

    fn compose(layers: &[&Layer], width: u32, height: u32, init: [u8; 4]) -> Vec<[u8; 4]> {
        let mut data: Vec<u8> = std::iter::repeat(init)
            .take((width * height) as usize)
            .flatten()
            .collect();

        let mut target = Target {
            data: &mut data,
            width,
            height,
            stride: width * 4,
        };

        let mut compositor = Compositor::default();
        for layer in layers {
            compositor.compose_layer(layer, &mut target).unwrap();
        }

        data.chunks_exact(4)
            .map(|px| [px[0], px[1], px[2], px[3]])
            .collect()
    }

    #[test_log::test]
    fn solid_color_fills_frame() {
        let mut layer = Layer::new();
        layer.set_composition_type(Composition::SolidColor);
        layer.set_color(Color {
            r: 1.0,
            g: 0.0,
            b: 0.0,
            a: 1.0,
        });
        layer.set_display_frame(Rect::new(1, 1, 3, 3));

        #[rustfmt::skip]
        let expected = vec![
            CLEAR, CLEAR, CLEAR, CLEAR,
            CLEAR, RED,   RED,   CLEAR,
            CLEAR, RED,   RED,   CLEAR,
            CLEAR, CLEAR, CLEAR, CLEAR,
        ];

        assert_eq!(compose(&[&layer], 4, 4, CLEAR), expected);
    }

    #[test_log::test]
    fn device_layer_copies_crop() {
        #[rustfmt::skip]
        let buffer = rgba_buffer(3, 3, &[
            CLEAR, CLEAR, CLEAR,
            CLEAR, RED,   GREEN,
            CLEAR, BLUE,  WHITE,
        ]);

        let layer = device_layer(buffer, FRect::new(1.0, 1.0, 3.0, 3.0), Rect::new(0, 0, 2, 2));
        assert_eq!(
            compose(&[&layer], 2, 2, CLEAR),
            vec![RED, GREEN, BLUE, WHITE]
        );
    }

    #[test_log::test]
    fn vertical_flip() {
        let buffer = rgba_buffer(2, 2, &[RED, GREEN, BLUE, WHITE]);
        let mut layer = device_layer(buffer, FRect::new(0.0, 0.0, 2.0, 2.0), Rect::new(0, 0, 2, 2));
        layer.set_transform(Transform::FLIP_V.bits()).unwrap();

        assert_eq!(
            compose(&[&layer], 2, 2, CLEAR),
            vec![BLUE, WHITE, RED, GREEN]
        );
    }

    #[test_log::test]
    fn horizontal_flip() {
        let buffer = rgba_buffer(2, 2, &[RED, GREEN, BLUE, WHITE]);
        let mut layer = device_layer(buffer, FRect::new(0.0, 0.0, 2.0, 2.0), Rect::new(0, 0, 2, 2));
        layer.set_transform(Transform::FLIP_H.bits()).unwrap();

        assert_eq!(
            compose(&[&layer], 2, 2, CLEAR),
            vec![GREEN, RED, WHITE, BLUE]
        );
    }

    #[test_log::test]
    fn quarter_turn() {
        let buffer = rgba_buffer(2, 1, &[RED, GREEN]);
        let mut layer = device_layer(buffer, FRect::new(0.0, 0.0, 2.0, 1.0), Rect::new(0, 0, 1, 2));
        layer.set_transform(Transform::ROT_90.bits()).unwrap();

        assert_eq!(compose(&[&layer], 1, 2, CLEAR), vec![RED, GREEN]);
    }

    #[test_log::test]
    fn quarter_turn_with_scale() {
        let buffer = rgba_buffer(1, 1, &[BLUE]);
        let mut layer = device_layer(buffer, FRect::new(0.0, 0.0, 1.0, 1.0), Rect::new(0, 0, 2, 3));
        layer.set_transform(Transform::ROT_270.bits()).unwrap();

        assert_eq!(compose(&[&layer], 2, 3, CLEAR), vec![BLUE; 6]);
    }

    #[test_log::test]
    fn premultiplied_blend() {
        let buffer = rgba_buffer(2, 1, &[CLEAR, [0, 0, 128, 128]]);
        let mut layer = device_layer(buffer, FRect::new(0.0, 0.0, 2.0, 1.0), Rect::new(0, 0, 2, 1));
        layer.set_blend_mode(BlendMode::Premultiplied.into()).unwrap();

        assert_eq!(
            compose(&[&layer], 2, 1, [200, 0, 0, 255]),
            vec![[200, 0, 0, 255], [100, 0, 128, 255]]
        );
    }

    #[test_log::test]
    fn coverage_blend_attenuates() {
        let buffer = rgba_buffer(1, 1, &[[255, 255, 255, 128]]);
        let mut layer = device_layer(buffer, FRect::new(0.0, 0.0, 1.0, 1.0), Rect::new(0, 0, 1, 1));
        layer.set_blend_mode(BlendMode::Coverage.into()).unwrap();

        // 255 * 128 premultiplies to 128, then half the black background
        // shows through.
        assert_eq!(
            compose(&[&layer], 1, 1, [0, 0, 0, 255]),
            vec![[128, 128, 128, 255]]
        );
    }

    #[test_log::test]
    fn layers_stack_in_order() {
        let bottom = device_layer(
            rgba_buffer(2, 1, &[RED, RED]),
            FRect::new(0.0, 0.0, 2.0, 1.0),
            Rect::new(0, 0, 2, 1),
        );

        let top = device_layer(
            rgba_buffer(1, 1, &[GREEN]),
            FRect::new(0.0, 0.0, 1.0, 1.0),
            Rect::new(1, 0, 2, 1),
        );

        assert_eq!(compose(&[&bottom, &top], 2, 1, CLEAR), vec![RED, GREEN]);
    }

    #[test_log::test]
    fn rgb565_conversion() {
        let (planes, len) = buffer::layout(DrmFourcc::Rgb565, 2, 1).unwrap();
        let mut data = vec![0; len];
        data[0..2].copy_from_slice(&0xf800u16.to_le_bytes());
        data[2..4].copy_from_slice(&0x001fu16.to_le_bytes());
        let buffer = GraphicsBuffer::from_heap(2, 1, DrmFourcc::Rgb565, planes, data);

        let layer = device_layer(buffer, FRect::new(0.0, 0.0, 2.0, 1.0), Rect::new(0, 0, 2, 1));
        assert_eq!(compose(&[&layer], 2, 1, CLEAR), vec![RED, BLUE]);
    }

    #[test_log::test]
    fn rgb565_conversion_then_scale() {
        let planes = vec![PlaneMetadata {
            offset: 0,
            stride: 4,
        }];
        let buffer = GraphicsBuffer::from_heap(
            1,
            1,
            DrmFourcc::Rgb565,
            planes,
            0x07e0u16.to_le_bytes().to_vec(),
        );

        let layer = device_layer(buffer, FRect::new(0.0, 0.0, 1.0, 1.0), Rect::new(0, 0, 2, 2));
        assert_eq!(compose(&[&layer], 2, 2, CLEAR), vec![GREEN; 4]);
    }

    #[test_log::test]
    fn yv12_conversion() {
        let (planes, len) = buffer::layout(DrmFourcc::Yvu420, 2, 2).unwrap();
        let mut data = vec![0; len];
        for i in 0..2 {
            let row = i * planes[0].stride as usize;
            data[row..row + 2].copy_from_slice(&[235, 235]);
        }

        data[planes[1].offset as usize] = 128;
        data[planes[2].offset as usize] = 128;
        let buffer = GraphicsBuffer::from_heap(2, 2, DrmFourcc::Yvu420, planes, data);

        let layer = device_layer(buffer, FRect::new(0.0, 0.0, 2.0, 2.0), Rect::new(0, 0, 2, 2));
        assert_eq!(compose(&[&layer], 2, 2, CLEAR), vec![WHITE; 4]);
    }

    #[test_log::test]
    fn zero_brightness_is_black() {
        let buffer = rgba_buffer(1, 1, &[WHITE]);
        let mut layer = device_layer(buffer, FRect::new(0.0, 0.0, 1.0, 1.0), Rect::new(0, 0, 1, 1));
        layer.set_brightness(0.0).unwrap();

        assert_eq!(compose(&[&layer], 1, 1, CLEAR), vec![[0, 0, 0, 255]]);
    }

    #[test]
    fn brightness_mixes_plane_alpha() {
        assert_eq!(brightness_shade(1.0, 1.0), [255, 255, 255, 255]);
        assert_eq!(brightness_shade(1.0, 0.0), [128, 128, 128, 255]);
        assert_eq!(brightness_shade(0.0, 1.0), [0, 0, 0, 255]);
    }

    #[test_log::test]
    fn offscreen_layer_is_skipped() {
        let buffer = rgba_buffer(1, 1, &[WHITE]);
        let layer = device_layer(buffer, FRect::new(0.0, 0.0, 1.0, 1.0), Rect::new(4, 4, 5, 5));
        assert_eq!(compose(&[&layer], 2, 1, CLEAR), vec![CLEAR; 2]);
    }

    #[test_log::test]
    fn missing_buffer() {
        let mut layer = Layer::new();
        layer.set_composition_type(Composition::Device);
        layer.set_display_frame(Rect::new(0, 0, 1, 1));

        let mut data = vec![0; 4];
        let mut target = Target {
            data: &mut data,
            width: 1,
            height: 1,
            stride: 4,
        };

        assert_eq!(
            Compositor::default().compose_layer(&layer, &mut target),
            Err(Error::NoResources)
        );
    }

    #[test_log::test]
    fn crop_outside_buffer() {
        let buffer = rgba_buffer(1, 1, &[WHITE]);
        let layer = device_layer(buffer, FRect::new(0.0, 0.0, 2.0, 2.0), Rect::new(0, 0, 1, 1));

        let mut data = vec![0; 4];
        let mut target = Target {
            data: &mut data,
            width: 1,
            height: 1,
            stride: 4,
        };

        assert_eq!(
            Compositor::default().compose_layer(&layer, &mut target),
            Err(Error::NoResources)
        );
    }

    #[test]
    fn color_transform_in_place() {
        let mut data = vec![10, 20, 30, 255, 40, 50, 60, 255];
        let mut target = Target {
            data: &mut data,
            width: 2,
            height: 1,
            stride: 8,
        };

        let mut red_only = [0.0; 16];
        red_only[0] = 1.0;
        red_only[15] = 1.0;
        apply_color_transform(&red_only, &mut target);

        assert_eq!(data, vec![10, 0, 0, 255, 40, 0, 0, 255]);
    }
}
