// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! An in-memory KMS device for tests.

use std::{io, os::fd::OwnedFd};

use hashbrown::HashSet;
use parking_lot::Mutex;
use rustix::event::{PollFd, PollFlags};

use super::device::*;
use crate::{buffer::GraphicsBuffer, fence};

const PROPS: &[&str] = &[
    "CRTC_ID",
    "ACTIVE",
    "MODE_ID",
    "OUT_FENCE_PTR",
    "FB_ID",
    "IN_FENCE_FD",
    "SRC_X",
    "SRC_Y",
    "SRC_W",
    "SRC_H",
    "CRTC_X",
    "CRTC_Y",
    "CRTC_W",
    "CRTC_H",
    "type",
    "EDID",
];

const CONNECTOR_PROPS: &[&str] = &["CRTC_ID", "EDID"];
const CRTC_PROPS: &[&str] = &["ACTIVE", "MODE_ID", "OUT_FENCE_PTR"];
const PLANE_PROPS: &[&str] = &[
    "type",
    "FB_ID",
    "CRTC_ID",
    "IN_FENCE_FD",
    "SRC_X",
    "SRC_Y",
    "SRC_W",
    "SRC_H",
    "CRTC_X",
    "CRTC_Y",
    "CRTC_W",
    "CRTC_H",
];

pub fn prop_id(name: &str) -> u32 {
    PROPS
        .iter()
        .position(|p| *p == name)
        .map(|i| i as u32 + 1)
        .unwrap_or_else(|| panic!("unknown property {name}"))
}

pub fn crtc_id(index: usize) -> u32 {
    100 + index as u32
}

pub fn connector_id(index: usize) -> u32 {
    200 + index as u32
}

pub fn plane_id(index: usize) -> u32 {
    300 + index as u32
}

#[derive(Debug, Clone)]
pub struct FakeConnector {
    pub info: ConnectorInfo,
    pub edid: Option<Vec<u8>>,
}

impl FakeConnector {
    pub fn new(width: u32, height: u32, refresh_hz: u32) -> Self {
        Self {
            info: ConnectorInfo {
                connected: true,
                width_mm: 0,
                height_mm: 0,
                modes: vec![ModeInfo {
                    index: 0,
                    width,
                    height,
                    refresh_hz,
                    preferred: true,
                }],
            },
            edid: None,
        }
    }
}

#[derive(Default)]
struct State {
    connectors: Vec<FakeConnector>,
    commits: Vec<(AtomicRequest, bool)>,
    fail_commits: bool,
    next_handle: u32,
    framebuffers: HashSet<u32>,
    gem_handles: HashSet<u32>,
    blobs: Vec<Vec<u8>>,
    tracked_fences: Option<Vec<OwnedFd>>,
    live_fences: Vec<Vec<bool>>,
}

/// Each connector gets its own CRTC and overlay plane.
pub struct FakeKms(Mutex<State>);

impl FakeKms {
    pub fn new(connectors: Vec<FakeConnector>) -> Self {
        Self(Mutex::new(State {
            connectors,
            next_handle: 1,
            ..Default::default()
        }))
    }

    pub fn set_connected(&self, index: usize, connected: bool) {
        self.0.lock().connectors[index].info.connected = connected;
    }

    pub fn fail_commits(&self, fail: bool) {
        self.0.lock().fail_commits = fail;
    }

    pub fn commits(&self) -> Vec<(AtomicRequest, bool)> {
        self.0.lock().commits.clone()
    }

    pub fn last_commit(&self) -> Option<AtomicRequest> {
        self.0.lock().commits.last().map(|(r, _)| r.clone())
    }

    /// Hands out pipe-backed out-fences from now on, so that the fake can
    /// tell when every copy of a fence has been closed.
    pub fn track_fences(&self) {
        self.0.lock().tracked_fences.get_or_insert_with(Vec::new);
    }

    /// For each commit with an out-fence, whether each previously handed
    /// out fence was still held by someone when the commit arrived.
    pub fn live_fences_at_commits(&self) -> Vec<Vec<bool>> {
        self.0.lock().live_fences.clone()
    }

    pub fn framebuffers(&self) -> HashSet<u32> {
        self.0.lock().framebuffers.clone()
    }

    pub fn gem_handles(&self) -> HashSet<u32> {
        self.0.lock().gem_handles.clone()
    }

    fn next_handle(state: &mut State) -> u32 {
        let h = state.next_handle;
        state.next_handle += 1;
        h
    }

    fn tracked_fence(state: &mut State) -> io::Result<Option<OwnedFd>> {
        let Some(writers) = state.tracked_fences.as_mut() else {
            return Ok(None);
        };

        // A pipe's write end reports POLLERR once all readers are gone.
        let live = writers
            .iter()
            .map(|w| -> io::Result<bool> {
                let mut pollfd = [PollFd::new(w, PollFlags::OUT)];
                rustix::event::poll(&mut pollfd, 0)?;
                Ok(!pollfd[0].revents().contains(PollFlags::ERR))
            })
            .collect::<io::Result<Vec<_>>>()?;
        state.live_fences.push(live);

        let (reader, writer) = rustix::pipe::pipe()?;
        rustix::io::write(&writer, &[1])?;
        writers.push(writer);
        Ok(Some(reader))
    }
}

impl KmsDevice for FakeKms {
    fn resources(&self) -> io::Result<Resources> {
        let n = self.0.lock().connectors.len();
        Ok(Resources {
            crtcs: (0..n).map(crtc_id).collect(),
            connectors: (0..n).map(connector_id).collect(),
            planes: (0..n)
                .map(|i| PlaneInfo {
                    id: plane_id(i),
                    possible_crtcs: 1 << i,
                    kind: PlaneType::Overlay,
                })
                .collect(),
        })
    }

    fn properties(&self, object: Object) -> io::Result<Vec<Property>> {
        let names = match object {
            Object::Crtc(_) => CRTC_PROPS,
            Object::Connector(_) => CONNECTOR_PROPS,
            Object::Plane(_) => PLANE_PROPS,
        };

        // EDID blobs are numbered after the connector.
        let edid_blob = match object {
            Object::Connector(id) => {
                let idx = (id - connector_id(0)) as usize;
                match self.0.lock().connectors.get(idx) {
                    Some(c) if c.edid.is_some() => 1000 + idx as u64,
                    _ => 0,
                }
            }
            _ => 0,
        };

        Ok(names
            .iter()
            .map(|name| Property {
                name: name.to_string(),
                id: prop_id(name),
                value: if *name == "EDID" { edid_blob } else { 0 },
            })
            .collect())
    }

    fn connector(&self, connector: u32) -> io::Result<ConnectorInfo> {
        let idx = connector.wrapping_sub(connector_id(0)) as usize;
        self.0
            .lock()
            .connectors
            .get(idx)
            .map(|c| c.info.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn property_blob(&self, blob: u64) -> io::Result<Vec<u8>> {
        let state = self.0.lock();
        if blob >= 1000 {
            return state
                .connectors
                .get((blob - 1000) as usize)
                .and_then(|c| c.edid.clone())
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound));
        }

        state
            .blobs
            .get(blob as usize)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn create_mode_blob(&self, _connector: u32, mode: &ModeInfo) -> io::Result<u64> {
        let mut state = self.0.lock();
        state
            .blobs
            .push(format!("{}x{}@{}", mode.width, mode.height, mode.refresh_hz).into_bytes());
        Ok(state.blobs.len() as u64 - 1)
    }

    fn atomic_commit(
        &self,
        req: &AtomicRequest,
        allow_modeset: bool,
    ) -> io::Result<Option<OwnedFd>> {
        let mut state = self.0.lock();
        if state.fail_commits {
            return Err(io::Error::from_raw_os_error(22));
        }

        state.commits.push((req.clone(), allow_modeset));
        if req.out_fence.is_none() {
            return Ok(None);
        }

        match Self::tracked_fence(&mut state)? {
            Some(fd) => Ok(Some(fd)),
            None => Ok(Some(fence::signalled()?.into_fd())),
        }
    }

    fn import_buffer(&self, _buffer: &GraphicsBuffer) -> io::Result<u32> {
        let mut state = self.0.lock();
        let h = Self::next_handle(&mut state);
        state.gem_handles.insert(h);
        Ok(h)
    }

    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<u32> {
        let mut state = self.0.lock();
        if !state.gem_handles.contains(&desc.gem_handle) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }

        let fb = Self::next_handle(&mut state);
        state.framebuffers.insert(fb);
        Ok(fb)
    }

    fn remove_framebuffer(&self, fb: u32) -> io::Result<()> {
        if self.0.lock().framebuffers.remove(&fb) {
            Ok(())
        } else {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn close_gem(&self, handle: u32) -> io::Result<()> {
        if self.0.lock().gem_handles.remove(&handle) {
            Ok(())
        } else {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }
}
