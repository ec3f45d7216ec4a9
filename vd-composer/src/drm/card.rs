// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{
    fs::{File, OpenOptions},
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::Path,
};

use drm::{
    buffer::{Buffer as _, PlanarBuffer},
    control::{
        self, atomic::AtomicModeReq, connector, property, AtomicCommitFlags, Device as _,
        FbCmd2Flags, ModeTypeFlags,
    },
    ClientCapability, Device as _,
};
use drm_fourcc::{DrmFourcc, DrmModifier};
use nix::fcntl::OFlag;
use tracing::{debug, error};

use super::device::*;
use crate::buffer::{BufferAllocator, GraphicsBuffer, PlaneMetadata};

/// A DRM card node opened for mode setting.
pub struct CardDevice(File);

impl AsFd for CardDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for CardDevice {}
impl drm::control::Device for CardDevice {}

impl CardDevice {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        options.write(true);

        Ok(Self(options.open(path)?))
    }

    /// Probes `/dev/dri/card0` through `/dev/dri/card{count-1}` and returns
    /// the first one whose driver name contains `driver_name`.
    pub fn find(count: u32, driver_name: &str) -> Option<Self> {
        for i in 0..count {
            let path = format!("/dev/dri/card{i}");
            debug!(path, "trying to open DRM device");

            let card = match Self::open(&path) {
                Ok(card) => card,
                Err(err) => {
                    debug!(path, %err, "failed to open DRM device");
                    continue;
                }
            };

            let name = match card.get_driver() {
                Ok(driver) => driver.name().to_string_lossy().into_owned(),
                Err(err) => {
                    error!(path, %err, "failed to query DRM driver");
                    continue;
                }
            };

            debug!(path, name, "found DRM device");
            if name.contains(driver_name) {
                return Some(card);
            }
        }

        error!(driver_name, "no matching DRM device found");
        None
    }

    /// Enables atomic mode setting and becomes DRM master.
    pub fn setup(&self) -> io::Result<()> {
        self.set_client_capability(ClientCapability::UniversalPlanes, true)?;
        self.set_client_capability(ClientCapability::Atomic, true)?;
        self.acquire_master_lock()?;
        Ok(())
    }
}

fn handle<T: From<control::RawResourceHandle>>(raw: u32) -> io::Result<T> {
    control::from_u32(raw).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid handle {raw}"))
    })
}

struct Framebuffer<'a>(&'a FramebufferDesc);

impl PlanarBuffer for Framebuffer<'_> {
    fn size(&self) -> (u32, u32) {
        (self.0.width, self.0.height)
    }

    fn format(&self) -> DrmFourcc {
        self.0.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        let mut out = [0; 4];
        for (i, p) in self.0.planes.iter().take(4).enumerate() {
            out[i] = p.stride;
        }

        out
    }

    fn handles(&self) -> [Option<drm::buffer::Handle>; 4] {
        let gem = control::from_u32(self.0.gem_handle);
        let mut out = [None; 4];
        for slot in out.iter_mut().take(self.0.planes.len().min(4)) {
            *slot = gem;
        }

        out
    }

    fn offsets(&self) -> [u32; 4] {
        let mut out = [0; 4];
        for (i, p) in self.0.planes.iter().take(4).enumerate() {
            out[i] = p.offset;
        }

        out
    }
}

impl KmsDevice for CardDevice {
    fn resources(&self) -> io::Result<Resources> {
        let handles = self.resource_handles()?;
        let crtcs = handles.crtcs().to_vec();

        let mut planes = Vec::new();
        for plane in self.plane_handles()? {
            let info = self.get_plane(plane)?;

            // Translate the filter back into a bitmask of CRTC indices.
            let compatible = handles.filter_crtcs(info.possible_crtcs());
            let mut possible_crtcs = 0;
            for (idx, crtc) in crtcs.iter().enumerate() {
                if compatible.contains(crtc) {
                    possible_crtcs |= 1 << idx;
                }
            }

            let id = u32::from(plane);
            let kind = match self
                .properties(Object::Plane(id))?
                .iter()
                .find(|p| p.name == "type")
                .map(|p| p.value)
            {
                Some(1) => PlaneType::Primary,
                Some(2) => PlaneType::Cursor,
                _ => PlaneType::Overlay,
            };

            planes.push(PlaneInfo {
                id,
                possible_crtcs,
                kind,
            });
        }

        Ok(Resources {
            crtcs: crtcs.into_iter().map(u32::from).collect(),
            connectors: handles.connectors().iter().copied().map(u32::from).collect(),
            planes,
        })
    }

    fn properties(&self, object: Object) -> io::Result<Vec<Property>> {
        let set = match object {
            Object::Crtc(id) => self.get_properties(handle::<control::crtc::Handle>(id)?)?,
            Object::Connector(id) => self.get_properties(handle::<connector::Handle>(id)?)?,
            Object::Plane(id) => self.get_properties(handle::<control::plane::Handle>(id)?)?,
        };
        let (ids, values) = set.as_props_and_values();

        let mut out = Vec::with_capacity(ids.len());
        for (&id, &value) in ids.iter().zip(values.iter()) {
            let info = self.get_property(id)?;
            out.push(Property {
                name: info.name().to_string_lossy().into_owned(),
                id: u32::from(id),
                value,
            });
        }

        Ok(out)
    }

    fn connector(&self, id: u32) -> io::Result<ConnectorInfo> {
        let info = self.get_connector(handle(id)?, true)?;
        let (width_mm, height_mm) = info.size().unwrap_or((0, 0));

        let modes = info
            .modes()
            .iter()
            .enumerate()
            .map(|(index, mode)| {
                let (w, h) = mode.size();
                ModeInfo {
                    index,
                    width: w as u32,
                    height: h as u32,
                    refresh_hz: mode.vrefresh(),
                    preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
                }
            })
            .collect();

        Ok(ConnectorInfo {
            connected: info.state() == connector::State::Connected,
            width_mm,
            height_mm,
            modes,
        })
    }

    fn property_blob(&self, blob: u64) -> io::Result<Vec<u8>> {
        self.get_property_blob(blob)
    }

    fn create_mode_blob(&self, connector: u32, mode: &ModeInfo) -> io::Result<u64> {
        let info = self.get_connector(handle(connector)?, false)?;
        let Some(mode) = info.modes().get(mode.index) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "connector mode list changed",
            ));
        };

        match self.create_property_blob(mode)? {
            property::Value::Blob(id) => Ok(id),
            v => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected blob value: {v:?}"),
            )),
        }
    }

    fn atomic_commit(
        &self,
        req: &AtomicRequest,
        allow_modeset: bool,
    ) -> io::Result<Option<OwnedFd>> {
        // The kernel writes the fence fd through this pointer, but only if
        // the commit succeeds.
        let mut out_fence: i32 = -1;

        let mut atomic = AtomicModeReq::new();
        for &(obj, prop, value) in &req.props {
            atomic.add_raw_property(handle(obj)?, handle(prop)?, value);
        }

        if let Some((crtc, prop)) = req.out_fence {
            let ptr = std::ptr::addr_of_mut!(out_fence) as u64;
            atomic.add_raw_property(handle(crtc)?, handle(prop)?, ptr);
        }

        let flags = if allow_modeset {
            AtomicCommitFlags::ALLOW_MODESET
        } else {
            AtomicCommitFlags::empty()
        };

        control::Device::atomic_commit(self, flags, atomic)?;

        if req.out_fence.is_some() && out_fence >= 0 {
            use std::os::fd::FromRawFd as _;
            Ok(Some(unsafe { OwnedFd::from_raw_fd(out_fence) }))
        } else {
            Ok(None)
        }
    }

    fn import_buffer(&self, buffer: &GraphicsBuffer) -> io::Result<u32> {
        let Some(fd) = buffer.dmabuf() else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "buffer has no dmabuf",
            ));
        };

        Ok(u32::from(self.prime_fd_to_buffer(fd)?))
    }

    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<u32> {
        let fb = self.add_planar_framebuffer(&Framebuffer(desc), FbCmd2Flags::empty())?;
        Ok(u32::from(fb))
    }

    fn remove_framebuffer(&self, fb: u32) -> io::Result<()> {
        self.destroy_framebuffer(handle(fb)?)
    }

    fn close_gem(&self, gem: u32) -> io::Result<()> {
        self.close_buffer(handle(gem)?)
    }
}

/// Allocates CPU-mappable dumb buffers on the card and exports them as
/// dmabufs, so they can be both composed into and scanned out.
pub struct DumbAllocator(pub std::sync::Arc<CardDevice>);

impl BufferAllocator for DumbAllocator {
    fn allocate(&self, width: u32, height: u32, format: DrmFourcc) -> io::Result<GraphicsBuffer> {
        use DrmFourcc::*;
        let bpp = match format {
            Abgr8888 | Xbgr8888 | Argb8888 | Xrgb8888 => 32,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("dumb buffers can't have format {format:?}"),
                ))
            }
        };

        let card = &self.0;
        let dumb = card.create_dumb_buffer((width, height), format, bpp)?;
        let stride = dumb.pitch();
        let flags = (OFlag::O_RDWR | OFlag::O_CLOEXEC).bits() as u32;
        let exported = card.buffer_to_prime_fd(dumb.handle(), flags);

        // The dmabuf holds its own reference to the memory.
        if let Err(err) = card.destroy_dumb_buffer(dumb) {
            error!(%err, "failed to destroy dumb buffer handle");
        }

        let fd = exported?;
        let len = (stride * height) as usize;
        GraphicsBuffer::from_dmabuf(
            width,
            height,
            format,
            vec![PlaneMetadata { offset: 0, stride }],
            fd,
            len,
        )
    }
}
