// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{io, os::fd::OwnedFd};

use drm_fourcc::DrmFourcc;

use crate::buffer::{GraphicsBuffer, PlaneMetadata};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PlaneType {
    Overlay,
    Primary,
    Cursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneInfo {
    pub id: u32,
    /// A bitmask of CRTC indices this plane can be attached to.
    pub possible_crtcs: u32,
    pub kind: PlaneType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    /// CRTC object ids, in index order.
    pub crtcs: Vec<u32>,
    pub connectors: Vec<u32>,
    pub planes: Vec<PlaneInfo>,
}

/// A mode-setting object that carries properties.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Object {
    Crtc(u32),
    Connector(u32),
    Plane(u32),
}

impl Object {
    pub fn id(&self) -> u32 {
        match *self {
            Object::Crtc(id) | Object::Connector(id) | Object::Plane(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub id: u32,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeInfo {
    /// The position of the mode in the connector's mode list.
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
    pub preferred: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub connected: bool,
    pub width_mm: u32,
    pub height_mm: u32,
    pub modes: Vec<ModeInfo>,
}

impl ConnectorInfo {
    /// The preferred mode, or the first one if none is marked preferred.
    pub fn default_mode(&self) -> Option<&ModeInfo> {
        self.modes
            .iter()
            .find(|m| m.preferred)
            .or_else(|| self.modes.first())
    }
}

/// A framebuffer to be registered with ADD_FB2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDesc {
    pub width: u32,
    pub height: u32,
    pub format: DrmFourcc,
    pub gem_handle: u32,
    pub planes: Vec<PlaneMetadata>,
}

/// A batch of property writes, committed all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    pub props: Vec<(u32, u32, u64)>,
    /// If set, the (crtc, OUT_FENCE_PTR) property to capture a completion
    /// fence through.
    pub out_fence: Option<(u32, u32)>,
}

impl AtomicRequest {
    pub fn add(&mut self, object: u32, prop: u32, value: u64) {
        self.props.push((object, prop, value));
    }

    /// Looks up the last value written for a property.
    pub fn get(&self, object: u32, prop: u32) -> Option<u64> {
        self.props
            .iter()
            .rev()
            .find(|(o, p, _)| *o == object && *p == prop)
            .map(|(_, _, v)| *v)
    }
}

/// The mode-setting operations the composer needs from a DRM device.
pub trait KmsDevice: Send + Sync {
    fn resources(&self) -> io::Result<Resources>;
    fn properties(&self, object: Object) -> io::Result<Vec<Property>>;
    fn connector(&self, connector: u32) -> io::Result<ConnectorInfo>;
    fn property_blob(&self, blob: u64) -> io::Result<Vec<u8>>;
    fn create_mode_blob(&self, connector: u32, mode: &ModeInfo) -> io::Result<u64>;

    /// Commits a request. If the request asked for an out fence, it's
    /// returned on success.
    fn atomic_commit(
        &self,
        req: &AtomicRequest,
        allow_modeset: bool,
    ) -> io::Result<Option<OwnedFd>>;

    /// Imports a buffer through PRIME, returning the GEM handle.
    fn import_buffer(&self, buffer: &GraphicsBuffer) -> io::Result<u32>;
    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<u32>;
    fn remove_framebuffer(&self, fb: u32) -> io::Result<()>;
    fn close_gem(&self, handle: u32) -> io::Result<()>;
}
