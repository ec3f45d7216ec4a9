// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

mod client_only;
mod guest;
mod noop;

use std::sync::Arc;

use tracing::{info, warn};

pub use client_only::ClientComposer;
pub use guest::GuestComposer;
pub use noop::NoopComposer;

use crate::{
    config::{ComposerMode, Config},
    display::DisplayState,
    drm::{DrmClient, HotplugCallback},
    error::Result,
    fence::Fence,
    layer::Composition,
};

/// Composition types a composer wants changed, by layer id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayChanges {
    pub composition_changes: Vec<(i64, Composition)>,
}

impl DisplayChanges {
    pub fn is_empty(&self) -> bool {
        self.composition_changes.is_empty()
    }

    pub fn add_composition_change(&mut self, layer_id: i64, composition: Composition) {
        self.composition_changes.push((layer_id, composition));
    }

    /// The composition type a layer will have once the changes are accepted.
    pub fn effective_type(&self, layer_id: i64, current: Composition) -> Composition {
        self.composition_changes
            .iter()
            .rev()
            .find(|(id, _)| *id == layer_id)
            .map_or(current, |(_, c)| *c)
    }
}

/// Fences returned from a present.
#[derive(Debug, Default)]
pub struct PresentFences {
    /// Signals when the frame is on screen.
    pub display: Option<Fence>,
    /// Signal when each layer's buffer may be reused.
    pub layers: Vec<(i64, Fence)>,
}

/// A strategy for getting layers onto the screen.
pub trait FrameComposer: Send + Sync {
    fn register_hotplug_callback(&self, cb: HotplugCallback);
    fn unregister_hotplug_callback(&self);

    /// Called once a display has its configs. May replace the EDID.
    fn on_display_create(&self, display: &mut DisplayState) -> Result<()>;
    fn on_display_destroy(&self, display_id: u64) -> Result<()>;
    fn on_display_client_target_set(&self, display: &DisplayState) -> Result<()>;
    fn on_active_config_change(&self, display: &DisplayState) -> Result<()>;

    /// Decides how each layer is composed. Does not modify the layers.
    fn validate_display(&self, display: &DisplayState) -> Result<DisplayChanges>;
    fn present_display(&self, display: &mut DisplayState) -> Result<PresentFences>;

    /// The DRM connection, if the composer scans out through one.
    fn drm_client(&self) -> Option<&DrmClient> {
        None
    }
}

/// Builds the composer for the configured mode. Falls back to the noop
/// composer if the device can't be opened.
pub fn create(cfg: &Config) -> Arc<dyn FrameComposer> {
    let composer: Result<Arc<dyn FrameComposer>> = match cfg.composer.mode {
        ComposerMode::Noop => Ok(Arc::new(NoopComposer)),
        ComposerMode::Client | ComposerMode::Host => {
            ClientComposer::open(&cfg.drm).map(|c| Arc::new(c) as Arc<dyn FrameComposer>)
        }
        ComposerMode::Guest => {
            GuestComposer::open(&cfg.drm).map(|c| Arc::new(c) as Arc<dyn FrameComposer>)
        }
    };

    match composer {
        Ok(composer) => {
            info!(mode = ?cfg.composer.mode, "initialized composer");
            composer
        }
        Err(err) => {
            warn!(?err, mode = ?cfg.composer.mode, "failed to initialize composer, falling back to noop");
            Arc::new(NoopComposer)
        }
    }
}
