// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{
    io,
    os::fd::{AsRawFd as _, BorrowedFd, OwnedFd},
};

use hashbrown::HashMap;
use tracing::{debug, instrument};

use super::{device::*, edid, DrmBuffer};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HotplugChange {
    NoChange,
    Connected,
    Disconnected,
}

/// The properties of one mode-setting object, by name.
#[derive(Debug, Clone)]
struct Props {
    object: Object,
    by_name: HashMap<String, Property>,
}

impl Props {
    fn load(kms: &dyn KmsDevice, object: Object) -> io::Result<Self> {
        let by_name = kms
            .properties(object)?
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        Ok(Self { object, by_name })
    }

    fn id(&self, name: &str) -> io::Result<u32> {
        self.by_name.get(name).map(|p| p.id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{:?} has no {name} property", self.object),
            )
        })
    }

    fn value(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).map(|p| p.value)
    }

    fn set(&self, req: &mut AtomicRequest, name: &str, value: u64) -> io::Result<()> {
        req.add(self.object.id(), self.id(name)?, value);
        Ok(())
    }
}

/// The connector state we care about, captured whenever it's probed.
#[derive(Debug, Clone, Default)]
struct ConnectorState {
    connected: bool,
    mode: Option<ModeInfo>,
    width_mm: u32,
    height_mm: u32,
    edid: Option<Vec<u8>>,
}

impl ConnectorState {
    fn probe(kms: &dyn KmsDevice, props: &Props) -> io::Result<Self> {
        let info = kms.connector(props.object.id())?;
        if !info.connected {
            return Ok(Self::default());
        }

        let edid = match props.value("EDID") {
            Some(blob) if blob != 0 => Some(kms.property_blob(blob)?),
            _ => None,
        };

        let (width_mm, height_mm) = edid
            .as_deref()
            .and_then(edid::physical_size)
            .unwrap_or((info.width_mm, info.height_mm));

        Ok(Self {
            connected: true,
            mode: info.default_mode().copied(),
            width_mm,
            height_mm,
            edid,
        })
    }
}

/// A bound connector, CRTC and plane, driven as one virtual display.
pub struct DrmDisplay {
    id: u32,
    connector: Props,
    crtc: Props,
    plane: Props,
    state: ConnectorState,
}

impl std::fmt::Debug for DrmDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmDisplay")
            .field("id", &self.id)
            .field("connector", &self.connector.object)
            .field("crtc", &self.crtc.object)
            .field("plane", &self.plane.object)
            .field("connected", &self.state.connected)
            .finish()
    }
}

impl DrmDisplay {
    pub fn new(
        kms: &dyn KmsDevice,
        id: u32,
        connector: u32,
        crtc: u32,
        plane: u32,
    ) -> io::Result<Self> {
        let connector = Props::load(kms, Object::Connector(connector))?;
        let crtc = Props::load(kms, Object::Crtc(crtc))?;
        let plane = Props::load(kms, Object::Plane(plane))?;

        let state = ConnectorState::probe(kms, &connector)?;
        let display = Self {
            id,
            connector,
            crtc,
            plane,
            state,
        };

        if display.state.connected {
            display.commit_mode(kms, &display.state)?;
        }

        let drm_display = &display;
        debug!(display = ?drm_display, "loaded DRM display");
        Ok(display)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected
    }

    pub fn width(&self) -> u32 {
        self.state.mode.map_or(0, |m| m.width)
    }

    pub fn height(&self) -> u32 {
        self.state.mode.map_or(0, |m| m.height)
    }

    pub fn refresh_rate(&self) -> u32 {
        self.state.mode.map_or(0, |m| m.refresh_hz)
    }

    pub fn dpi_x(&self) -> u32 {
        edid::dpi(self.width(), self.state.width_mm)
    }

    pub fn dpi_y(&self) -> u32 {
        edid::dpi(self.height(), self.state.height_mm)
    }

    pub fn edid(&self) -> Option<&[u8]> {
        self.state.edid.as_deref()
    }

    fn commit_mode(&self, kms: &dyn KmsDevice, state: &ConnectorState) -> io::Result<()> {
        let Some(mode) = state.mode else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "connector has no modes",
            ));
        };

        let blob = kms.create_mode_blob(self.connector.object.id(), &mode)?;

        let mut req = AtomicRequest::default();
        self.connector
            .set(&mut req, "CRTC_ID", self.crtc.object.id() as u64)?;
        self.crtc.set(&mut req, "ACTIVE", 1)?;
        self.crtc.set(&mut req, "MODE_ID", blob)?;

        kms.atomic_commit(&req, true)?;
        Ok(())
    }

    fn clear_plane(&self, kms: &dyn KmsDevice) -> io::Result<()> {
        let mut req = AtomicRequest::default();
        self.plane.set(&mut req, "CRTC_ID", 0)?;
        self.plane.set(&mut req, "FB_ID", 0)?;

        kms.atomic_commit(&req, true)?;
        Ok(())
    }

    /// Reprobes the connector, and mode sets or blanks the display if its
    /// connection state changed. On error the display keeps its previous
    /// state.
    #[instrument(level = "debug", skip_all, fields(display_id = self.id))]
    pub fn check_and_handle_hotplug(&mut self, kms: &dyn KmsDevice) -> io::Result<HotplugChange> {
        let probed = ConnectorState::probe(kms, &self.connector)?;
        if probed.connected == self.state.connected {
            return Ok(HotplugChange::NoChange);
        }

        let change = if probed.connected {
            self.commit_mode(kms, &probed)?;
            HotplugChange::Connected
        } else {
            self.clear_plane(kms)?;
            HotplugChange::Disconnected
        };

        debug!(?change, "display connection changed");
        self.state = probed;
        Ok(change)
    }

    /// Scans out a framebuffer, returning the fence that signals when it's
    /// on screen.
    pub fn flush(
        &self,
        kms: &dyn KmsDevice,
        buffer: &DrmBuffer,
        in_fence: Option<BorrowedFd<'_>>,
    ) -> io::Result<Option<OwnedFd>> {
        let (w, h) = (buffer.width() as u64, buffer.height() as u64);

        let mut req = AtomicRequest::default();
        let plane = &self.plane;
        plane.set(&mut req, "FB_ID", buffer.framebuffer() as u64)?;
        plane.set(&mut req, "CRTC_ID", self.crtc.object.id() as u64)?;
        plane.set(
            &mut req,
            "IN_FENCE_FD",
            in_fence.map_or(-1, |fd| fd.as_raw_fd() as i64) as u64,
        )?;
        plane.set(&mut req, "SRC_X", 0)?;
        plane.set(&mut req, "SRC_Y", 0)?;
        plane.set(&mut req, "SRC_W", w << 16)?;
        plane.set(&mut req, "SRC_H", h << 16)?;
        plane.set(&mut req, "CRTC_X", 0)?;
        plane.set(&mut req, "CRTC_Y", 0)?;
        plane.set(&mut req, "CRTC_W", w)?;
        plane.set(&mut req, "CRTC_H", h)?;
        req.out_fence = Some((self.crtc.object.id(), self.crtc.id("OUT_FENCE_PTR")?));

        kms.atomic_commit(&req, false)
    }
}
