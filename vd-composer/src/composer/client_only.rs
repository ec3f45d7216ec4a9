// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, error, instrument, warn};

use super::{DisplayChanges, FrameComposer, PresentFences};
use crate::{
    config::DrmConfig,
    display::DisplayState,
    drm::{DrmBuffer, DrmClient, HotplugCallback},
    error::{Error, Result},
    layer::Composition,
};

/// Lets the window system compose everything, then scans out its target.
pub struct ClientComposer {
    drm: Arc<DrmClient>,
    client_targets: Mutex<HashMap<u64, Option<DrmBuffer>>>,
}

impl ClientComposer {
    pub fn open(cfg: &DrmConfig) -> Result<Self> {
        let (drm, _card) = DrmClient::open(cfg)?;
        Ok(Self::new(drm))
    }

    pub fn new(drm: Arc<DrmClient>) -> Self {
        Self {
            drm,
            client_targets: Mutex::new(HashMap::new()),
        }
    }
}

impl FrameComposer for ClientComposer {
    fn register_hotplug_callback(&self, cb: HotplugCallback) {
        self.drm.register_hotplug_callback(cb);
    }

    fn unregister_hotplug_callback(&self) {
        self.drm.unregister_hotplug_callback();
    }

    fn on_display_create(&self, display: &mut DisplayState) -> Result<()> {
        let id = display.id();
        if let Some(edid) = self.drm.edid(id as u32) {
            display.set_edid(edid);
        }

        if self.client_targets.lock().insert(id, None).is_some() {
            warn!(display_id = id, "display created twice");
        }

        Ok(())
    }

    fn on_display_destroy(&self, display_id: u64) -> Result<()> {
        match self.client_targets.lock().remove(&display_id) {
            Some(_) => Ok(()),
            None => {
                error!(display_id, "destroying unknown display");
                Err(Error::BadDisplay)
            }
        }
    }

    fn on_display_client_target_set(&self, display: &DisplayState) -> Result<()> {
        let id = display.id();
        let mut targets = self.client_targets.lock();
        let Some(target) = targets.get_mut(&id) else {
            error!(display_id = id, "client target for unknown display");
            return Err(Error::BadDisplay);
        };

        *target = match display.client_target().buffer() {
            Some(buffer) => Some(self.drm.create_buffer(buffer)?),
            None => None,
        };

        Ok(())
    }

    fn on_active_config_change(&self, _display: &DisplayState) -> Result<()> {
        Ok(())
    }

    #[instrument(level = "trace", skip_all, fields(display_id = display_state.id()))]
    fn validate_display(&self, display_state: &DisplayState) -> Result<DisplayChanges> {
        let display = display_state;
        let mut changes = DisplayChanges::default();
        for layer in display.ordered_layers() {
            match layer.composition_type() {
                Composition::Invalid | Composition::Client => (),
                Composition::DisplayDecoration => {
                    error!(layer_id = layer.id(), "display decoration layers are unsupported");
                    return Err(Error::Unsupported);
                }
                _ => changes.add_composition_change(layer.id(), Composition::Client),
            }
        }

        Ok(changes)
    }

    #[instrument(level = "trace", skip_all, fields(display_id = display_state.id()))]
    fn present_display(&self, display_state: &mut DisplayState) -> Result<PresentFences> {
        let display = display_state;
        let id = display.id();
        let targets = self.client_targets.lock();
        let Some(Some(target)) = targets.get(&id) else {
            error!(display_id = id, "no client target to present");
            return Err(Error::NoResources);
        };

        let fence = self
            .drm
            .flush_to_display(id as u32, target, display.client_target().fence())?;

        debug!(display_id = id, "presented client target");
        Ok(PresentFences {
            display: fence,
            layers: Vec::new(),
        })
    }

    fn drm_client(&self) -> Option<&DrmClient> {
        Some(&self.drm)
    }
}
