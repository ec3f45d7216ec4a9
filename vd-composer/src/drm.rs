// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

mod card;
mod device;
mod display;
pub mod edid;
#[cfg(test)]
pub mod fake;
mod hotplug;

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

pub use card::{CardDevice, DumbAllocator};
pub use device::*;
use display::{DrmDisplay, HotplugChange};
use hotplug::HotplugListener;

use crate::{
    buffer::GraphicsBuffer,
    config::DrmConfig,
    error::{Error, Result},
    fence::Fence,
};

/// A connection change reported by the DRM client.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub connected: bool,
    pub display_id: u32,
    pub width: u32,
    pub height: u32,
    pub dpi_x: u32,
    pub dpi_y: u32,
    pub refresh_rate: u32,
}

pub type HotplugCallback = Arc<dyn Fn(HotplugEvent) + Send + Sync>;

/// The mode of a connected display, as reported by the DRM client.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DrmDisplayConfig {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub dpi_x: u32,
    pub dpi_y: u32,
    pub refresh_rate: u32,
}

/// A buffer registered with KMS as a framebuffer. The framebuffer and GEM
/// handle are released on drop.
pub struct DrmBuffer {
    kms: Arc<dyn KmsDevice>,
    framebuffer: u32,
    gem_handle: u32,
    width: u32,
    height: u32,
}

impl std::fmt::Debug for DrmBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmBuffer")
            .field("framebuffer", &self.framebuffer)
            .field("gem_handle", &self.gem_handle)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl DrmBuffer {
    pub fn framebuffer(&self) -> u32 {
        self.framebuffer
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl Drop for DrmBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.kms.remove_framebuffer(self.framebuffer) {
            error!(%err, framebuffer = self.framebuffer, "RM_FB failed");
        }

        if let Err(err) = self.kms.close_gem(self.gem_handle) {
            error!(%err, gem_handle = self.gem_handle, "GEM_CLOSE failed");
        }
    }
}

/// The composer's connection to the virtual GPU.
pub struct DrmClient {
    kms: Arc<dyn KmsDevice>,
    displays: RwLock<Vec<DrmDisplay>>,
    hotplug_callback: Mutex<Option<HotplugCallback>>,
    listener: Mutex<Option<HotplugListener>>,
}

impl DrmClient {
    /// Opens the first matching card, becomes master, and starts listening
    /// for hotplug events.
    pub fn open(cfg: &DrmConfig) -> Result<(Arc<Self>, Arc<CardDevice>)> {
        let Some(card) = CardDevice::find(cfg.device_count, &cfg.driver_name) else {
            return Err(Error::NoResources);
        };

        if let Err(err) = card.setup() {
            error!(%err, "failed to enable atomic mode setting");
            return Err(Error::NoResources);
        }

        let card = Arc::new(card);
        let client = Arc::new(Self::new(card.clone())?);

        match HotplugListener::spawn(Self::hotplug_handler(&client)) {
            Ok(listener) => *client.listener.lock() = Some(listener),
            Err(err) => error!(%err, "failed to start hotplug listener"),
        }

        info!("initialized DRM backend");
        Ok((client, card))
    }

    /// Binds every connector to a CRTC and a plane.
    pub fn new(kms: Arc<dyn KmsDevice>) -> Result<Self> {
        let displays = load_displays(kms.as_ref()).map_err(|err| {
            error!(%err, "failed to load DRM displays");
            Error::NoResources
        })?;

        Ok(Self {
            kms,
            displays: RwLock::new(displays),
            hotplug_callback: Mutex::new(None),
            listener: Mutex::new(None),
        })
    }

    fn hotplug_handler(client: &Arc<Self>) -> impl Fn() + Send + 'static {
        let weak: Weak<Self> = Arc::downgrade(client);
        move || {
            if let Some(client) = weak.upgrade() {
                client.handle_hotplug();
            }
        }
    }

    pub fn register_hotplug_callback(&self, cb: HotplugCallback) {
        *self.hotplug_callback.lock() = Some(cb);
    }

    pub fn unregister_hotplug_callback(&self) {
        *self.hotplug_callback.lock() = None;
    }

    /// The configs of all connected displays.
    pub fn display_configs(&self) -> Vec<DrmDisplayConfig> {
        self.displays
            .read()
            .iter()
            .filter(|d| d.is_connected())
            .map(|d| DrmDisplayConfig {
                id: d.id(),
                width: d.width(),
                height: d.height(),
                dpi_x: d.dpi_x(),
                dpi_y: d.dpi_y(),
                refresh_rate: d.refresh_rate(),
            })
            .collect()
    }

    pub fn edid(&self, display_id: u32) -> Option<Vec<u8>> {
        let displays = self.displays.read();
        let Some(display) = displays.iter().find(|d| d.id() == display_id) else {
            debug!(display_id, "no such DRM display");
            return None;
        };

        display.edid().map(|e| e.to_vec())
    }

    /// Registers a buffer as a framebuffer.
    pub fn create_buffer(&self, buffer: &GraphicsBuffer) -> Result<DrmBuffer> {
        let gem_handle = self.kms.import_buffer(buffer).map_err(|err| {
            error!(%err, "PRIME import failed");
            Error::NoResources
        })?;

        let desc = FramebufferDesc {
            width: buffer.width(),
            height: buffer.height(),
            format: buffer.format(),
            gem_handle,
            planes: buffer.planes().to_vec(),
        };

        let framebuffer = match self.kms.add_framebuffer(&desc) {
            Ok(fb) => fb,
            Err(err) => {
                error!(%err, ?desc, "ADD_FB2 failed");
                if let Err(err) = self.kms.close_gem(gem_handle) {
                    error!(%err, "GEM_CLOSE failed");
                }

                return Err(Error::NoResources);
            }
        };

        debug!(framebuffer, "created framebuffer");
        Ok(DrmBuffer {
            kms: self.kms.clone(),
            framebuffer,
            gem_handle,
            width: buffer.width(),
            height: buffer.height(),
        })
    }

    /// Scans out a buffer on a display. Returns the fence that signals
    /// once the buffer is on screen.
    #[instrument(level = "trace", skip(self, buffer, in_fence))]
    pub fn flush_to_display(
        &self,
        display_id: u32,
        buffer: &DrmBuffer,
        in_fence: Option<&Fence>,
    ) -> Result<Option<Fence>> {
        use std::os::fd::AsFd as _;

        let displays = self.displays.read();
        let Some(display) = displays.iter().find(|d| d.id() == display_id) else {
            error!(display_id, "flush to unknown display");
            return Err(Error::NoResources);
        };

        if !display.is_connected() {
            warn!(display_id, "flush to disconnected display");
            return Err(Error::NoResources);
        }

        match display.flush(self.kms.as_ref(), buffer, in_fence.map(|f| f.as_fd())) {
            Ok(fence) => Ok(fence.map(Fence::new)),
            Err(err) => {
                error!(%err, display_id, "atomic commit failed");
                Err(Error::NoResources)
            }
        }
    }

    /// Reprobes every display, reporting those whose connection state
    /// changed.
    pub fn handle_hotplug(&self) {
        let mut events = Vec::new();

        {
            let mut displays = self.displays.write();
            for display in displays.iter_mut() {
                let change = match display.check_and_handle_hotplug(self.kms.as_ref()) {
                    Ok(HotplugChange::NoChange) => continue,
                    Ok(change) => change,
                    Err(err) => {
                        let display_id = display.id();
                        warn!(%err, display_id, "failed to handle hotplug");
                        continue;
                    }
                };

                events.push(HotplugEvent {
                    connected: change == HotplugChange::Connected,
                    display_id: display.id(),
                    width: display.width(),
                    height: display.height(),
                    dpi_x: display.dpi_x(),
                    dpi_y: display.dpi_y(),
                    refresh_rate: display.refresh_rate(),
                });
            }
        }

        let Some(cb) = self.hotplug_callback.lock().clone() else {
            return;
        };

        for ev in events {
            info!(?ev, "display hotplug");
            cb(ev);
        }
    }
}

fn load_displays(kms: &dyn KmsDevice) -> std::io::Result<Vec<DrmDisplay>> {
    let res = kms.resources()?;

    if res.crtcs.len() != res.connectors.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!(
                "expected as many CRTCs ({}) as connectors ({})",
                res.crtcs.len(),
                res.connectors.len()
            ),
        ));
    }

    let mut planes = res.planes;
    let mut displays = Vec::with_capacity(res.crtcs.len());
    for (idx, (&crtc, &connector)) in res.crtcs.iter().zip(res.connectors.iter()).enumerate() {
        let Some(pos) = planes.iter().position(|p| {
            matches!(p.kind, PlaneType::Overlay | PlaneType::Primary)
                && p.possible_crtcs & (1 << idx) != 0
        }) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no plane for display {idx}"),
            ));
        };

        let plane = planes.remove(pos);
        displays.push(DrmDisplay::new(
            kms,
            idx as u32,
            connector,
            crtc,
            plane.id,
        )?);
    }

    Ok(displays)
}
