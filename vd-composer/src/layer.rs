// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::atomic::{AtomicI64, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::trace;

use crate::{
    buffer::GraphicsBuffer,
    error::{Error, Result},
    fence::Fence,
};

static NEXT_LAYER_ID: AtomicI64 = AtomicI64::new(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum Composition {
    Invalid = 0,
    Client = 1,
    Device = 2,
    SolidColor = 3,
    Cursor = 4,
    Sideband = 5,
    DisplayDecoration = 6,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum BlendMode {
    Invalid = 0,
    None = 1,
    Premultiplied = 2,
    Coverage = 3,
}

bitflags::bitflags! {
    /// A layer's orientation. Rotations are composed from flips and a
    /// 90 degree turn.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Transform: i32 {
        const FLIP_H = 1;
        const FLIP_V = 2;
        const ROT_90 = 4;
        const ROT_180 = Self::FLIP_H.bits() | Self::FLIP_V.bits();
        const ROT_270 = Self::ROT_180.bits() | Self::ROT_90.bits();
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct FRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl FRect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }
}

/// An RGBA color with channels in `[0, 1]`.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

/// A buffer together with the fence guarding its contents.
#[derive(Debug, Default)]
pub struct FencedBuffer {
    buffer: Option<GraphicsBuffer>,
    fence: Option<Fence>,
}

impl FencedBuffer {
    pub fn set(&mut self, buffer: Option<GraphicsBuffer>, fence: Option<Fence>) {
        self.buffer = buffer;
        self.fence = fence;
    }

    pub fn buffer(&self) -> Option<&GraphicsBuffer> {
        self.buffer.as_ref()
    }

    pub fn fence(&self) -> Option<&Fence> {
        self.fence.as_ref()
    }

    pub fn take_fence(&mut self) -> Option<Fence> {
        self.fence.take()
    }
}

#[derive(Debug)]
pub struct Layer {
    id: i64,
    composition_type: Composition,
    buffer: FencedBuffer,
    source_crop: FRect,
    display_frame: Rect,
    visible_region: Vec<Rect>,
    plane_alpha: f32,
    brightness: f32,
    blend_mode: BlendMode,
    transform: Transform,
    color: Color,
    z_order: i64,
    dataspace: i32,
    color_transform: Option<[f32; 16]>,
    has_luts: bool,
}

impl Default for Layer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer {
    pub fn new() -> Self {
        Self {
            id: NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed),
            composition_type: Composition::Invalid,
            buffer: FencedBuffer::default(),
            source_crop: FRect::default(),
            display_frame: Rect::default(),
            visible_region: Vec::new(),
            plane_alpha: 1.0,
            brightness: 1.0,
            blend_mode: BlendMode::None,
            transform: Transform::empty(),
            color: Color::default(),
            z_order: 0,
            dataspace: 0,
            color_transform: None,
            has_luts: false,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn composition_type(&self) -> Composition {
        self.composition_type
    }

    pub fn set_composition_type(&mut self, composition: Composition) {
        trace!(layer_id = self.id, ?composition, "set composition type");
        self.composition_type = composition;
    }

    pub fn set_composition_type_raw(&mut self, raw: i32) -> Result<()> {
        self.set_composition_type(Composition::try_from(raw)?);
        Ok(())
    }

    pub fn buffer(&self) -> &FencedBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut FencedBuffer {
        &mut self.buffer
    }

    pub fn set_buffer(&mut self, buffer: Option<GraphicsBuffer>, fence: Option<Fence>) {
        self.buffer.set(buffer, fence);
    }

    pub fn source_crop(&self) -> FRect {
        self.source_crop
    }

    pub fn set_source_crop(&mut self, crop: FRect) {
        self.source_crop = crop;
    }

    /// The source crop, rounded outwards to whole pixels.
    pub fn source_crop_int(&self) -> Rect {
        Rect {
            left: self.source_crop.left.floor() as i32,
            top: self.source_crop.top.floor() as i32,
            right: self.source_crop.right.ceil() as i32,
            bottom: self.source_crop.bottom.ceil() as i32,
        }
    }

    pub fn display_frame(&self) -> Rect {
        self.display_frame
    }

    pub fn set_display_frame(&mut self, frame: Rect) {
        self.display_frame = frame;
    }

    pub fn visible_region(&self) -> &[Rect] {
        &self.visible_region
    }

    pub fn set_visible_region(&mut self, region: Vec<Rect>) {
        self.visible_region = region;
    }

    pub fn plane_alpha(&self) -> f32 {
        self.plane_alpha
    }

    pub fn set_plane_alpha(&mut self, alpha: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(Error::BadParameter);
        }

        self.plane_alpha = alpha;
        Ok(())
    }

    pub fn brightness(&self) -> f32 {
        self.brightness
    }

    pub fn set_brightness(&mut self, brightness: f32) -> Result<()> {
        // Rejects NaN as well.
        if !(0.0..=1.0).contains(&brightness) {
            return Err(Error::BadParameter);
        }

        self.brightness = brightness;
        Ok(())
    }

    pub fn blend_mode(&self) -> BlendMode {
        self.blend_mode
    }

    pub fn set_blend_mode(&mut self, raw: i32) -> Result<()> {
        self.blend_mode = BlendMode::try_from(raw)?;
        Ok(())
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn set_transform(&mut self, raw: i32) -> Result<()> {
        self.transform = Transform::from_bits(raw).ok_or(Error::BadParameter)?;
        Ok(())
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn set_color(&mut self, color: Color) {
        self.color = color;
    }

    pub fn z_order(&self) -> i64 {
        self.z_order
    }

    pub fn set_z_order(&mut self, z: i64) {
        self.z_order = z;
    }

    pub fn dataspace(&self) -> i32 {
        self.dataspace
    }

    pub fn set_dataspace(&mut self, dataspace: i32) {
        self.dataspace = dataspace;
    }

    pub fn color_transform(&self) -> Option<&[f32; 16]> {
        self.color_transform.as_ref()
    }

    pub fn set_color_transform(&mut self, matrix: &[f32]) -> Result<()> {
        let matrix: [f32; 16] = matrix.try_into().map_err(|_| Error::BadParameter)?;
        self.color_transform = Some(matrix);
        Ok(())
    }

    pub fn has_luts(&self) -> bool {
        self.has_luts
    }

    pub fn set_luts(&mut self, present: bool) {
        self.has_luts = present;
    }
}
