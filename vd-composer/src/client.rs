// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

mod commands;
mod finder;

use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, trace, warn};

pub use commands::*;
pub use finder::{find_displays, DisplayDescription};

use crate::{
    boot_config::BootConfigStore,
    composer::FrameComposer,
    config::Config,
    display::{Display, DisplayConfig, PowerMode},
    drm::HotplugEvent,
    error::{Error, Result},
    resources::Resources,
    vsync::{self, VsyncCallback},
};

/// How the composer reaches the window system.
pub trait ComposerCallback: Send + Sync {
    fn on_hotplug(&self, display_id: u64, connected: bool);
    fn on_vsync(&self, display_id: u64, timestamp_nanos: i64, period_nanos: i32);
}

/// The window system's view of the composer: a table of displays, the
/// buffers imported for them, and the batched command interface.
pub struct ComposerClient {
    composer: Arc<dyn FrameComposer>,
    resources: Resources,
    boot_configs: Arc<BootConfigStore>,
    kmsg_power_events: bool,
    displays: Mutex<BTreeMap<u64, Arc<Display>>>,
    callback: RwLock<Option<Arc<dyn ComposerCallback>>>,
}

impl ComposerClient {
    /// Creates a display for everything the finder reports, and starts
    /// listening for hotplugs.
    pub fn new(cfg: &Config, composer: Arc<dyn FrameComposer>) -> Result<Arc<Self>> {
        let client = Arc::new(Self {
            composer: composer.clone(),
            resources: Resources::default(),
            boot_configs: Arc::new(BootConfigStore::new(&cfg.display.boot_config_path)),
            kmsg_power_events: cfg.display.kmsg_power_events,
            displays: Mutex::new(BTreeMap::new()),
            callback: RwLock::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&client);
        composer.register_hotplug_callback(Arc::new(move |ev| {
            if let Some(client) = weak.upgrade() {
                client.handle_hotplug(ev);
            }
        }));

        {
            let mut displays = client.displays.lock();
            for desc in find_displays(&cfg.composer, composer.drm_client()) {
                client
                    .create_display_locked(&mut displays, desc.id, desc.active_config, desc.configs)
                    .inspect_err(|err| {
                        error!(?err, display_id = desc.id, "failed to create display");
                    })?;
            }
        }

        info!("composer client initialized");
        Ok(client)
    }

    pub fn display(&self, display_id: u64) -> Result<Arc<Display>> {
        match self.displays.lock().get(&display_id) {
            Some(display) => Ok(display.clone()),
            None => {
                error!(display_id, "no such display");
                Err(Error::BadDisplay)
            }
        }
    }

    pub fn display_ids(&self) -> Vec<u64> {
        self.displays.lock().keys().copied().collect()
    }

    /// Installs the window system's callback. The first registration
    /// reports every existing display as connected.
    pub fn register_callback(&self, callback: Arc<dyn ComposerCallback>) {
        let first = self.callback.write().replace(callback.clone()).is_none();

        let displays: Vec<Arc<Display>> = self.displays.lock().values().cloned().collect();
        for display in &displays {
            display.set_vsync_callback(Some(vsync_callback(&callback)));
        }

        if first {
            for display in &displays {
                let display_id = display.id();
                debug!(display_id, "initial registration, connecting display");
                callback.on_hotplug(display.id(), true);
            }
        }
    }

    pub fn create_layer(&self, display_id: u64, buffer_slot_count: usize) -> Result<i64> {
        let display = self.display(display_id)?;
        let layer_id = display.create_layer();
        self.resources
            .add_layer(display_id, layer_id, buffer_slot_count)
            .inspect_err(|err| error!(?err, display_id, "failed to add layer resources"))?;

        Ok(layer_id)
    }

    pub fn destroy_layer(&self, display_id: u64, layer_id: i64) -> Result<()> {
        let display = self.display(display_id)?;
        display.destroy_layer(layer_id)?;
        self.resources
            .remove_layer(display_id, layer_id)
            .inspect_err(|err| error!(?err, display_id, layer_id, "failed to remove layer resources"))
    }

    pub fn create_virtual_display(&self, _width: u32, _height: u32) -> Result<u64> {
        Err(Error::Unsupported)
    }

    pub fn destroy_virtual_display(&self, _display_id: u64) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn max_virtual_display_count(&self) -> i32 {
        0
    }

    pub fn set_client_target_slot_count(&self, display_id: u64, count: usize) -> Result<()> {
        self.display(display_id)?;
        self.resources.set_client_target_cache_size(display_id, count)
    }

    pub fn set_readback_buffer(&self, display_id: u64, buffer: Buffer) -> Result<()> {
        let display = self.display(display_id)?;
        let (buffer, fence) = buffer.split();
        let (imported, _releaser) = self.resources.readback_buffer(display_id, buffer)?;
        display.set_readback_buffer(Some(imported), fence)
    }

    /// Runs a batch of commands. Failures are reported per command and
    /// never stop the batch.
    #[instrument(level = "trace", skip_all)]
    pub fn execute_commands(&self, commands: Vec<DisplayCommand>) -> Vec<CommandResult> {
        let mut results = CommandResultWriter::default();
        for command in commands {
            self.execute_display_command(&mut results, command);
            results.next_command();
        }

        results.finish()
    }

    fn execute_display_command(&self, results: &mut CommandResultWriter, command: DisplayCommand) {
        let display = match self.display(command.display) {
            Ok(display) => display,
            Err(err) => {
                results.add_error(err);
                return;
            }
        };

        for layer_command in command.layers {
            self.execute_layer_command(results, &display, layer_command);
        }

        if let Some(matrix) = command.color_transform {
            report(results, display.set_color_transform(&matrix));
        }

        if let Some(brightness) = command.brightness {
            report(results, display.set_brightness(brightness));
        }

        if let Some(target) = command.client_target {
            let (buffer, fence) = target.buffer.split();
            let res = self
                .resources
                .client_target(display.id(), buffer)
                .and_then(|(imported, _releaser)| {
                    display.set_client_target(Some(imported), fence, target.dataspace, &target.damage)
                });
            report(results, res);
        }

        if let Some(output) = command.output_buffer {
            let (buffer, fence) = output.split();
            let res = self
                .resources
                .output_buffer(display.id(), buffer)
                .and_then(|(imported, _releaser)| display.set_output_buffer(Some(imported), fence));
            report(results, res);
        }

        if command.validate || command.present_or_validate {
            report(
                results,
                display.set_expected_present_time(command.expected_present_time),
            );

            match display.validate() {
                Ok(changes) => {
                    self.resources.set_must_validate(display.id(), false);
                    results.add_changes(display.id(), changes.composition_changes);
                    if command.present_or_validate {
                        results.add_present_or_validate(display.id(), PresentOrValidate::Validated);
                    }
                }
                Err(err) => results.add_error(err),
            }
        }

        if command.accept_changes {
            report(results, display.accept_changes());
        }

        if command.present {
            if self.resources.must_validate(display.id()) {
                let display_id = display.id();
                error!(display_id, "present before first validate");
                results.add_error(Error::NotValidated);
                return;
            }

            match display.present() {
                Ok(fences) => {
                    results.add_present_fence(display.id(), fences.display);
                    results.add_release_fences(display.id(), fences.layers);
                }
                Err(err) => results.add_error(err),
            }
        }
    }

    fn execute_layer_command(
        &self,
        results: &mut CommandResultWriter,
        display: &Display,
        command: LayerCommand,
    ) {
        let layer_id = command.layer;
        if let Err(err) = display.with_layer(layer_id, |_| ()) {
            results.add_error(err);
            return;
        }

        // Imported before taking the display lock. The displaced buffer is
        // released once the layer holds its replacement.
        let mut new_buffer = None;
        let mut _releaser = None;
        if let Some(buffer) = command.buffer {
            let (buffer, fence) = buffer.split();
            match self.resources.layer_buffer(display.id(), layer_id, buffer) {
                Ok((imported, releaser)) => {
                    new_buffer = Some((imported, fence));
                    _releaser = Some(releaser);
                }
                Err(err) => results.add_error(err),
            }
        }

        let errors = display.with_layer(layer_id, |layer| {
            let mut errors = Vec::new();
            let mut check = |res: Result<()>| {
                if let Err(err) = res {
                    errors.push(err);
                }
            };

            if let Some((buffer, fence)) = new_buffer {
                layer.set_buffer(Some(buffer), fence);
            }

            if let Some(mode) = command.blend_mode {
                check(layer.set_blend_mode(mode));
            }

            if let Some(color) = command.color {
                layer.set_color(color);
            }

            if let Some(composition) = command.composition {
                check(layer.set_composition_type_raw(composition));
            }

            if let Some(dataspace) = command.dataspace {
                layer.set_dataspace(dataspace);
            }

            if let Some(frame) = command.display_frame {
                layer.set_display_frame(frame);
            }

            if let Some(alpha) = command.plane_alpha {
                check(layer.set_plane_alpha(alpha));
            }

            if let Some(crop) = command.source_crop {
                layer.set_source_crop(crop);
            }

            if let Some(transform) = command.transform {
                check(layer.set_transform(transform));
            }

            if let Some(region) = command.visible_region {
                layer.set_visible_region(region);
            }

            if let Some(z) = command.z {
                layer.set_z_order(z);
            }

            if let Some(matrix) = command.color_transform {
                check(layer.set_color_transform(&matrix));
            }

            if let Some(brightness) = command.brightness {
                check(layer.set_brightness(brightness));
            }

            if let Some(metadata) = command.per_frame_metadata {
                trace!(layer_id, ?metadata, "ignoring per-frame metadata");
            }

            if let Some(luts) = command.luts {
                layer.set_luts(luts);
            }

            errors
        });

        match errors {
            Ok(errors) => {
                for err in errors {
                    let display_id = display.id();
                    error!(?err, display_id, layer_id, "layer command failed");
                    results.add_error(err);
                }
            }
            Err(err) => results.add_error(err),
        }
    }

    fn create_display_locked(
        &self,
        displays: &mut BTreeMap<u64, Arc<Display>>,
        display_id: u64,
        active_config: i32,
        configs: Vec<DisplayConfig>,
    ) -> Result<()> {
        debug!(display_id, active_config, "creating display");
        let display = Arc::new(Display::new(
            display_id,
            self.composer.clone(),
            self.boot_configs.clone(),
            self.kmsg_power_events,
        ));

        display.init(configs, active_config, None)?;
        if let Some(callback) = self.callback.read().as_ref() {
            display.set_vsync_callback(Some(vsync_callback(callback)));
        }

        display.set_power_mode(PowerMode::On.into())?;
        displays.insert(display_id, display);
        self.resources.add_physical_display(display_id)
    }

    fn destroy_display_locked(&self, displays: &mut BTreeMap<u64, Arc<Display>>, display_id: u64) -> Result<()> {
        let Some(display) = displays.remove(&display_id) else {
            error!(display_id, "no such display");
            return Err(Error::BadDisplay);
        };

        if let Err(err) = display.set_power_mode(PowerMode::Off.into()) {
            warn!(?err, display_id, "failed to power off display");
        }

        if let Err(err) = self.composer.on_display_destroy(display_id) {
            error!(?err, display_id, "failed to destroy display with composer");
        }

        if let Err(err) = self.resources.remove_display(display_id) {
            error!(?err, display_id, "failed to remove display resources");
        }

        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    fn handle_hotplug(&self, ev: HotplugEvent) {
        let Some(callback) = self.callback.read().clone() else {
            debug!("no callback registered, ignoring hotplug");
            return;
        };

        let display_id = ev.display_id as u64;
        if ev.connected {
            let existing = self.displays.lock().get(&display_id).cloned();
            let res = match existing {
                Some(display) => {
                    let edid = self
                        .composer
                        .drm_client()
                        .and_then(|drm| drm.edid(ev.display_id));
                    display.update_parameters(
                        ev.width,
                        ev.height,
                        ev.dpi_x,
                        ev.dpi_y,
                        ev.refresh_rate,
                        edid,
                    )
                }
                None => {
                    let config = DisplayConfig::new(
                        ev.display_id as i32,
                        ev.width as i32,
                        ev.height as i32,
                        ev.dpi_x as i32,
                        ev.dpi_y as i32,
                        vsync::period_from_hz(ev.refresh_rate),
                    );

                    let mut displays = self.displays.lock();
                    self.create_display_locked(&mut displays, display_id, config.id, vec![config])
                }
            };

            if let Err(err) = res {
                error!(?err, display_id, "failed to connect display");
            }

            info!(display_id, "hotplug connecting display");
            callback.on_hotplug(display_id, true);
        } else {
            info!(display_id, "hotplug disconnecting display");
            callback.on_hotplug(display_id, false);

            let mut displays = self.displays.lock();
            let _ = self.destroy_display_locked(&mut displays, display_id);
        }
    }
}

impl Drop for ComposerClient {
    fn drop(&mut self) {
        self.composer.unregister_hotplug_callback();

        let mut displays = std::mem::take(&mut *self.displays.lock());
        let ids: Vec<u64> = displays.keys().copied().collect();
        for id in ids {
            let _ = self.destroy_display_locked(&mut displays, id);
        }
    }
}

fn vsync_callback(callback: &Arc<dyn ComposerCallback>) -> VsyncCallback {
    let callback = callback.clone();
    Arc::new(move |display_id, timestamp, period| {
        callback.on_vsync(display_id, timestamp, period)
    })
}

fn report(results: &mut CommandResultWriter, res: Result<()>) {
    if let Err(err) = res {
        results.add_error(err);
    }
}
