// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use super::{DisplayChanges, FrameComposer, PresentFences};
use crate::{display::DisplayState, drm::HotplugCallback, error::Result};

/// Accepts everything and draws nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopComposer;

impl FrameComposer for NoopComposer {
    fn register_hotplug_callback(&self, _cb: HotplugCallback) {}

    fn unregister_hotplug_callback(&self) {}

    fn on_display_create(&self, _display: &mut DisplayState) -> Result<()> {
        Ok(())
    }

    fn on_display_destroy(&self, _display_id: u64) -> Result<()> {
        Ok(())
    }

    fn on_display_client_target_set(&self, _display: &DisplayState) -> Result<()> {
        Ok(())
    }

    fn on_active_config_change(&self, _display: &DisplayState) -> Result<()> {
        Ok(())
    }

    fn validate_display(&self, _display: &DisplayState) -> Result<DisplayChanges> {
        Ok(DisplayChanges::default())
    }

    fn present_display(&self, _display: &mut DisplayState) -> Result<PresentFences> {
        Ok(PresentFences::default())
    }
}
