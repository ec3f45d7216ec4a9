// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{cell::RefCell, collections::BTreeMap, io::Write as _, sync::Arc};

use hashbrown::HashMap;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::ReentrantMutex;
use tracing::{debug, error, instrument, trace, warn};

use crate::{
    boot_config::BootConfigStore,
    buffer::GraphicsBuffer,
    composer::{DisplayChanges, FrameComposer, PresentFences},
    drm::edid,
    error::{Error, Result},
    fence::Fence,
    layer::{Composition, FencedBuffer, Layer, Rect, Transform},
    vsync::{self, VsyncCallback, VsyncThread, VsyncTimeline},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum DisplayAttribute {
    Width = 1,
    Height = 2,
    VsyncPeriod = 3,
    DpiX = 4,
    DpiY = 5,
    ConfigGroup = 7,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum PowerMode {
    Off = 0,
    Doze = 1,
    On = 2,
    DozeSuspend = 3,
    OnSuspend = 4,
}

impl PowerMode {
    fn name(&self) -> &'static str {
        match self {
            PowerMode::Off => "OFF",
            PowerMode::Doze => "DOZE",
            PowerMode::On => "ON",
            PowerMode::DozeSuspend => "DOZE_SUSPEND",
            PowerMode::OnSuspend => "ON_SUSPEND",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum ColorMode {
    Native = 0,
    StandardBt601_625 = 1,
    StandardBt601_625Unadjusted = 2,
    StandardBt601_525 = 3,
    StandardBt601_525Unadjusted = 4,
    StandardBt709 = 5,
    DciP3 = 6,
    Srgb = 7,
    AdobeRgb = 8,
    DisplayP3 = 9,
    Bt2020 = 10,
    Bt2100Pq = 11,
    Bt2100Hlg = 12,
    DisplayBt2020 = 13,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum RenderIntent {
    Colorimetric = 0,
    Enhance = 1,
    ToneMapColorimetric = 2,
    ToneMapEnhance = 3,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum ContentType {
    None = 0,
    Graphics = 1,
    Photo = 2,
    Cinema = 3,
    Game = 4,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive)]
#[repr(i32)]
pub enum DisplayCapability {
    SkipClientColorTransform = 1,
    MultiThreadedPresent = 8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive)]
#[repr(i32)]
pub enum ConnectionType {
    Internal = 0,
    External = 1,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HdrCapabilities {
    pub types: Vec<i32>,
    pub max_luminance: f32,
    pub max_average_luminance: f32,
    pub min_luminance: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayIdentification {
    pub port: u8,
    pub data: Vec<u8>,
}

/// One mode a display can run in. DPI is stored as plain dots per inch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DisplayConfig {
    pub id: i32,
    pub width: i32,
    pub height: i32,
    pub dpi_x: i32,
    pub dpi_y: i32,
    pub vsync_period: i32,
    pub config_group: i32,
}

impl DisplayConfig {
    pub fn new(id: i32, width: i32, height: i32, dpi_x: i32, dpi_y: i32, vsync_period: i32) -> Self {
        Self {
            id,
            width,
            height,
            dpi_x,
            dpi_y,
            vsync_period,
            config_group: 0,
        }
    }

    /// The value reported to the window system. DPI is in dots per
    /// thousand inches.
    pub fn attribute(&self, attribute: DisplayAttribute) -> i32 {
        match attribute {
            DisplayAttribute::Width => self.width,
            DisplayAttribute::Height => self.height,
            DisplayAttribute::VsyncPeriod => self.vsync_period,
            DisplayAttribute::DpiX => self.dpi_x * 1000,
            DisplayAttribute::DpiY => self.dpi_y * 1000,
            DisplayAttribute::ConfigGroup => self.config_group,
        }
    }

    /// Puts configs that share a size and density in the same group.
    pub fn assign_groups<'a>(configs: impl IntoIterator<Item = &'a mut DisplayConfig>) {
        let mut groups: HashMap<(i32, i32, i32, i32), i32> = HashMap::new();
        for config in configs {
            let key = (config.width, config.height, config.dpi_x, config.dpi_y);
            let next = groups.len() as i32;
            config.config_group = *groups.entry(key).or_insert(next);
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PresentFlow {
    WaitingForValidate,
    WaitingForAccept,
    WaitingForPresent,
}

/// Everything about a display that composers get to see. Only reachable
/// with the display lock held.
pub struct DisplayState {
    id: u64,
    name: String,
    configs: BTreeMap<i32, DisplayConfig>,
    active_config: Option<i32>,
    power_mode: PowerMode,
    color_mode: ColorMode,
    layers: HashMap<i64, Layer>,
    ordered_layers: Vec<i64>,
    client_target: FencedBuffer,
    readback_buffer: Option<GraphicsBuffer>,
    color_transform: Option<[f32; 16]>,
    expected_present_time: Option<i64>,
    present_flow: PresentFlow,
    pending_changes: DisplayChanges,
    edid: Vec<u8>,
    vsync: Option<VsyncThread>,
    vsync_callback: Option<VsyncCallback>,
    vsync_enabled: bool,
}

impl DisplayState {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn active_config(&self) -> Option<&DisplayConfig> {
        self.configs.get(&self.active_config?)
    }

    /// Layers in the order set by the last validate.
    pub fn ordered_layers(&self) -> impl Iterator<Item = &Layer> {
        self.ordered_layers
            .iter()
            .filter_map(|id| self.layers.get(id))
    }

    pub fn layer(&self, id: i64) -> Option<&Layer> {
        self.layers.get(&id)
    }

    pub fn client_target(&self) -> &FencedBuffer {
        &self.client_target
    }

    pub fn client_target_mut(&mut self) -> &mut FencedBuffer {
        &mut self.client_target
    }

    pub fn color_transform(&self) -> Option<&[f32; 16]> {
        self.color_transform.as_ref()
    }

    pub fn set_edid(&mut self, edid: Vec<u8>) {
        self.edid = edid;
    }

    pub fn present_flow(&self) -> PresentFlow {
        self.present_flow
    }

    fn vsync_period(&self) -> Result<i32> {
        match self.active_config() {
            Some(config) => Ok(config.vsync_period),
            None => {
                error!(display_id = self.id, "no active config");
                Err(Error::BadConfig)
            }
        }
    }

    fn sort_layers(&mut self) {
        let mut ordered: Vec<(i64, i64)> = self
            .layers
            .values()
            .map(|layer| (layer.z_order(), layer.id()))
            .collect();
        ordered.sort_unstable();

        self.ordered_layers = ordered.into_iter().map(|(_, id)| id).collect();
    }
}

/// A physical display and its layers. Every operation takes the display's
/// recursive lock.
pub struct Display {
    id: u64,
    composer: Arc<dyn FrameComposer>,
    boot_configs: Arc<BootConfigStore>,
    kmsg_power_events: bool,
    state: ReentrantMutex<RefCell<DisplayState>>,
}

impl Display {
    pub fn new(
        id: u64,
        composer: Arc<dyn FrameComposer>,
        boot_configs: Arc<BootConfigStore>,
        kmsg_power_events: bool,
    ) -> Self {
        let state = DisplayState {
            id,
            name: format!("EMU_display_{id}"),
            configs: BTreeMap::new(),
            active_config: None,
            power_mode: PowerMode::Off,
            color_mode: ColorMode::Native,
            layers: HashMap::new(),
            ordered_layers: Vec::new(),
            client_target: FencedBuffer::default(),
            readback_buffer: None,
            color_transform: None,
            expected_present_time: None,
            present_flow: PresentFlow::WaitingForValidate,
            pending_changes: DisplayChanges::default(),
            edid: edid::for_display(id as u32).to_vec(),
            vsync: None,
            vsync_callback: None,
            vsync_enabled: false,
        };

        Self {
            id,
            composer,
            boot_configs,
            kmsg_power_events,
            state: ReentrantMutex::new(RefCell::new(state)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Runs `f` with the display locked.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut DisplayState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    /// Installs configs, picks the active one, starts vsync and registers
    /// the display with the composer.
    #[instrument(level = "debug", skip(self, configs, edid), fields(display_id = self.id))]
    pub fn init(
        &self,
        configs: Vec<DisplayConfig>,
        active_config: i32,
        edid: Option<Vec<u8>>,
    ) -> Result<()> {
        let boot_config = self.boot_configs.get(self.id);

        self.with_state(|state| {
            state.configs = configs.into_iter().map(|c| (c.id, c)).collect();
            state.active_config = Some(active_config);

            match boot_config {
                Some(id) if state.configs.contains_key(&id) => {
                    debug!(config_id = id, "using boot config");
                    state.active_config = Some(id);
                }
                Some(id) => warn!(config_id = id, "ignoring unknown boot config"),
                None => (),
            }

            if let Some(edid) = edid {
                state.edid = edid;
            }

            let Some(config) = state.active_config().copied() else {
                error!(active_config, "missing active config");
                return Err(Error::NoResources);
            };

            debug!(?config, "initializing display");

            let vsync = VsyncThread::start(self.id, config.vsync_period).map_err(|err| {
                error!(%err, "failed to start vsync thread");
                Error::NoResources
            })?;

            vsync.set_callback(state.vsync_callback.clone());
            vsync.set_enabled(state.vsync_enabled);
            state.vsync = Some(vsync);

            self.composer.on_display_create(state).inspect_err(|err| {
                error!(?err, "failed to register display with composer");
            })
        })
    }

    /// Applies new parameters from a hotplug to the active config.
    pub fn update_parameters(
        &self,
        width: u32,
        height: u32,
        dpi_x: u32,
        dpi_y: u32,
        refresh_rate_hz: u32,
        edid: Option<Vec<u8>>,
    ) -> Result<()> {
        debug!(
            display_id = self.id,
            width, height, dpi_x, dpi_y, refresh_rate_hz, "updating display parameters"
        );

        self.with_state(|state| {
            let id = self.id;
            let Some(config) = state
                .active_config
                .and_then(|active| state.configs.get_mut(&active))
            else {
                error!(display_id = id, "no active config to update");
                return Err(Error::NoResources);
            };

            let period = vsync::period_from_hz(refresh_rate_hz);
            if config.vsync_period != period {
                config.vsync_period = period;
                if let Some(vsync) = &state.vsync {
                    vsync.schedule_update(period, 0);
                }
            }

            config.width = width as i32;
            config.height = height as i32;
            config.dpi_x = dpi_x as i32;
            config.dpi_y = dpi_y as i32;
            DisplayConfig::assign_groups(state.configs.values_mut());

            if let Some(edid) = edid {
                state.edid = edid;
            }

            Ok(())
        })
    }

    pub fn create_layer(&self) -> i64 {
        self.with_state(|state| {
            let layer = Layer::new();
            let id = layer.id();
            state.layers.insert(id, layer);

            debug!(display_id = self.id, layer_id = id, "created layer");
            id
        })
    }

    pub fn destroy_layer(&self, layer_id: i64) -> Result<()> {
        self.with_state(|state| {
            if state.layers.remove(&layer_id).is_none() {
                error!(display_id = self.id, layer_id, "no such layer");
                return Err(Error::BadLayer);
            }

            state.ordered_layers.retain(|id| *id != layer_id);
            debug!(display_id = self.id, layer_id, "destroyed layer");
            Ok(())
        })
    }

    /// Runs `f` on one layer.
    pub fn with_layer<R>(&self, layer_id: i64, f: impl FnOnce(&mut Layer) -> R) -> Result<R> {
        self.with_state(|state| match state.layers.get_mut(&layer_id) {
            Some(layer) => Ok(f(layer)),
            None => {
                error!(display_id = self.id, layer_id, "no such layer");
                Err(Error::BadLayer)
            }
        })
    }

    pub fn active_config(&self) -> Result<i32> {
        self.with_state(|state| {
            state.active_config.ok_or_else(|| {
                warn!(display_id = self.id, "no active config");
                Error::BadConfig
            })
        })
    }

    pub fn display_attribute(&self, config_id: i32, attribute: DisplayAttribute) -> Result<i32> {
        self.with_state(|state| match state.configs.get(&config_id) {
            Some(config) => Ok(config.attribute(attribute)),
            None => {
                warn!(display_id = self.id, config_id, "bad config");
                Err(Error::BadConfig)
            }
        })
    }

    pub fn display_configs(&self) -> Vec<i32> {
        self.with_state(|state| state.configs.keys().copied().collect())
    }

    pub fn display_configurations(&self) -> Vec<DisplayConfig> {
        self.with_state(|state| state.configs.values().copied().collect())
    }

    pub fn color_modes(&self) -> Vec<ColorMode> {
        vec![ColorMode::Native]
    }

    pub fn capabilities(&self) -> Vec<DisplayCapability> {
        vec![
            DisplayCapability::SkipClientColorTransform,
            DisplayCapability::MultiThreadedPresent,
        ]
    }

    pub fn connection_type(&self) -> ConnectionType {
        ConnectionType::Internal
    }

    pub fn physical_orientation(&self) -> Transform {
        Transform::empty()
    }

    pub fn identification_data(&self) -> DisplayIdentification {
        self.with_state(|state| DisplayIdentification {
            port: self.id as u8,
            data: state.edid.clone(),
        })
    }

    pub fn name(&self) -> String {
        self.with_state(|state| state.name.clone())
    }

    pub fn vsync_period(&self) -> Result<i32> {
        self.with_state(|state| state.vsync_period())
    }

    pub fn hdr_capabilities(&self) -> HdrCapabilities {
        HdrCapabilities::default()
    }

    pub fn supported_content_types(&self) -> Vec<ContentType> {
        Vec::new()
    }

    pub fn render_intents(&self, mode: i32) -> Result<Vec<RenderIntent>> {
        ColorMode::try_from(mode)?;
        Ok(vec![RenderIntent::Colorimetric])
    }

    pub fn set_vsync_callback(&self, cb: Option<VsyncCallback>) {
        self.with_state(|state| {
            if let Some(vsync) = &state.vsync {
                vsync.set_callback(cb.clone());
            }

            state.vsync_callback = cb;
        })
    }

    pub fn set_vsync_enabled(&self, enabled: bool) -> Result<()> {
        self.with_state(|state| {
            state.vsync_enabled = enabled;
            if let Some(vsync) = &state.vsync {
                vsync.set_enabled(enabled);
            }
        });

        Ok(())
    }

    pub fn set_active_config(&self, config_id: i32) -> Result<VsyncTimeline> {
        self.set_active_config_with_constraints(config_id, 0, false)
    }

    #[instrument(level = "debug", skip(self), fields(display_id = self.id))]
    pub fn set_active_config_with_constraints(
        &self,
        config_id: i32,
        desired_time_nanos: i64,
        seamless_required: bool,
    ) -> Result<VsyncTimeline> {
        self.with_state(|state| {
            if state.active_config == Some(config_id) {
                return Ok(VsyncTimeline::default());
            }

            let Some(new_config) = state.configs.get(&config_id).copied() else {
                error!("bad config");
                return Err(Error::BadConfig);
            };

            if seamless_required {
                if let Some(old) = state.active_config {
                    let Some(old_config) = state.configs.get(&old) else {
                        error!(old, "missing active config");
                        return Err(Error::NoResources);
                    };

                    if old_config.config_group != new_config.config_group {
                        debug!(
                            old_group = old_config.config_group,
                            new_group = new_config.config_group,
                            "seamless switch across config groups"
                        );
                        return Err(Error::SeamlessNotAllowed);
                    }
                }
            }

            state.active_config = Some(config_id);
            self.composer.on_active_config_change(state)?;

            let period = state.vsync_period()?;
            match &state.vsync {
                Some(vsync) => Ok(vsync.schedule_update(period, desired_time_nanos)),
                None => Err(Error::NoResources),
            }
        })
    }

    pub fn boot_config(&self) -> Option<i32> {
        let id = self.boot_configs.get(self.id)?;
        self.with_state(|state| state.configs.contains_key(&id))
            .then_some(id)
    }

    pub fn set_boot_config(&self, config_id: i32) -> Result<()> {
        if !self.with_state(|state| state.configs.contains_key(&config_id)) {
            error!(display_id = self.id, config_id, "bad boot config");
            return Err(Error::BadConfig);
        }

        self.boot_configs
            .set(self.id, Some(config_id))
            .map_err(|err| {
                error!(?err, display_id = self.id, "failed to save boot config");
                Error::NoResources
            })
    }

    pub fn clear_boot_config(&self) -> Result<()> {
        self.boot_configs.set(self.id, None).map_err(|err| {
            error!(?err, display_id = self.id, "failed to clear boot config");
            Error::NoResources
        })
    }

    pub fn preferred_boot_config(&self) -> Result<i32> {
        self.with_state(|state| state.configs.keys().next().copied())
            .ok_or(Error::BadConfig)
    }

    pub fn set_auto_low_latency_mode(&self, _on: bool) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn set_color_mode(&self, mode: i32, intent: i32) -> Result<()> {
        let mode = ColorMode::try_from(mode).inspect_err(|_| {
            error!(display_id = self.id, mode, "invalid color mode");
        })?;
        RenderIntent::try_from(intent).inspect_err(|_| {
            error!(display_id = self.id, intent, "invalid render intent");
        })?;

        if !self.color_modes().contains(&mode) {
            error!(display_id = self.id, ?mode, "color mode not supported");
            return Err(Error::Unsupported);
        }

        self.with_state(|state| state.color_mode = mode);
        Ok(())
    }

    pub fn set_content_type(&self, content_type: i32) -> Result<()> {
        match ContentType::try_from(content_type)? {
            ContentType::None => Ok(()),
            _ => Err(Error::Unsupported),
        }
    }

    pub fn set_content_sampling_enabled(&self, _enabled: bool) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn displayed_content_sample(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn decoration_support(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn per_frame_metadata_keys(&self) -> Result<Vec<i32>> {
        Err(Error::Unsupported)
    }

    pub fn set_idle_timer_enabled(&self, timeout_ms: i32) -> Result<()> {
        trace!(display_id = self.id, timeout_ms, "idle timer requested");
        Err(Error::Unsupported)
    }

    pub fn set_power_mode(&self, mode: i32) -> Result<()> {
        let mode = PowerMode::try_from(mode).inspect_err(|_| {
            error!(display_id = self.id, mode, "invalid power mode");
        })?;

        if matches!(
            mode,
            PowerMode::Doze | PowerMode::DozeSuspend | PowerMode::OnSuspend
        ) {
            error!(display_id = self.id, ?mode, "power mode not supported");
            return Err(Error::Unsupported);
        }

        self.with_state(|state| {
            if self.kmsg_power_events {
                log_power_mode(self.id, mode);
            }

            debug!(display_id = self.id, ?mode, "set power mode");
            state.power_mode = mode;
        });

        Ok(())
    }

    pub fn power_mode(&self) -> PowerMode {
        self.with_state(|state| state.power_mode)
    }

    /// Stores the readback buffer. The fence is closed immediately since
    /// readback never happens.
    pub fn set_readback_buffer(&self, buffer: Option<GraphicsBuffer>, fence: Option<Fence>) -> Result<()> {
        drop(fence);
        self.with_state(|state| state.readback_buffer = buffer);
        Ok(())
    }

    pub fn readback_buffer_attributes(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn readback_buffer_fence(&self) -> Result<Fence> {
        Err(Error::Unsupported)
    }

    pub fn set_color_transform(&self, matrix: &[f32]) -> Result<()> {
        let Some(matrix) = matrix.get(..16) else {
            error!(display_id = self.id, len = matrix.len(), "color transform is not 4x4");
            return Err(Error::BadParameter);
        };

        let mut transform = [0.0; 16];
        transform.copy_from_slice(matrix);
        self.with_state(|state| state.color_transform = Some(transform));
        Ok(())
    }

    pub fn set_brightness(&self, brightness: f32) -> Result<()> {
        if brightness < 0.0 {
            error!(display_id = self.id, brightness, "invalid brightness");
            return Err(Error::BadParameter);
        }

        Err(Error::Unsupported)
    }

    pub fn set_client_target(
        &self,
        buffer: Option<GraphicsBuffer>,
        fence: Option<Fence>,
        _dataspace: i32,
        _damage: &[Rect],
    ) -> Result<()> {
        self.with_state(|state| {
            state.client_target.set(buffer, fence);
            self.composer.on_display_client_target_set(state)
        })
    }

    /// Output buffers only matter for virtual displays, which aren't
    /// supported.
    pub fn set_output_buffer(&self, _buffer: Option<GraphicsBuffer>, _fence: Option<Fence>) -> Result<()> {
        Ok(())
    }

    pub fn set_expected_present_time(&self, nanos: Option<i64>) -> Result<()> {
        if let Some(nanos) = nanos {
            self.with_state(|state| state.expected_present_time = Some(nanos));
        }

        Ok(())
    }

    #[instrument(level = "trace", skip_all, fields(display_id = self.id))]
    pub fn validate(&self) -> Result<DisplayChanges> {
        self.with_state(|state| {
            state.pending_changes = DisplayChanges::default();
            state.sort_layers();

            let changes = self.composer.validate_display(state).inspect_err(|err| {
                error!(?err, "failed to validate");
            })?;

            state.present_flow = if changes.is_empty() {
                PresentFlow::WaitingForPresent
            } else {
                PresentFlow::WaitingForAccept
            };

            trace!(flow = ?state.present_flow, "validated");
            state.pending_changes = changes.clone();
            Ok(changes)
        })
    }

    pub fn accept_changes(&self) -> Result<()> {
        self.with_state(|state| {
            if state.present_flow == PresentFlow::WaitingForValidate {
                error!(display_id = self.id, "accept before validate");
                return Err(Error::NotValidated);
            }

            let changes = std::mem::take(&mut state.pending_changes);
            for (layer_id, composition) in changes.composition_changes {
                match state.layers.get_mut(&layer_id) {
                    Some(layer) => layer.set_composition_type(composition),
                    None => warn!(
                        display_id = self.id,
                        layer_id, "layer destroyed before changes were accepted"
                    ),
                }
            }

            state.present_flow = PresentFlow::WaitingForPresent;
            Ok(())
        })
    }

    #[instrument(level = "trace", skip_all, fields(display_id = self.id))]
    pub fn present(&self) -> Result<PresentFences> {
        self.with_state(|state| {
            match state.present_flow {
                PresentFlow::WaitingForPresent => (),
                PresentFlow::WaitingForValidate => {
                    error!("present before validate");
                    return Err(Error::NotValidated);
                }
                PresentFlow::WaitingForAccept => {
                    error!("present before changes were accepted");
                    return Err(Error::NotValidated);
                }
            }

            state.present_flow = PresentFlow::WaitingForValidate;
            self.composer.present_display(state)
        })
    }

    /// Whether every layer ends up composed by the window system.
    pub fn all_layers_client_composed(&self) -> bool {
        self.with_state(|state| {
            state
                .ordered_layers()
                .all(|l| l.composition_type() == Composition::Client)
        })
    }
}

fn log_power_mode(display_id: u64, mode: PowerMode) {
    let res = std::fs::OpenOptions::new()
        .write(true)
        .open("/dev/kmsg")
        .and_then(|mut f| {
            writeln!(
                f,
                "VIRTUAL_DEVICE_DISPLAY_POWER_MODE_CHANGED display={display_id} mode={}",
                mode.name()
            )
        });

    if let Err(err) = res {
        warn!(%err, "failed to write power mode to kmsg");
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::drm::HotplugCallback;
    use pretty_assertions::assert_eq;

    /// Asks for every DEVICE layer to become CLIENT.
    #[derive(Default)]
    struct Demoting {
        presents: AtomicUsize,
    }

    impl FrameComposer for Demoting {
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

        fn validate_display(&self, display: &DisplayState) -> Result<DisplayChanges> {
            let mut changes = DisplayChanges::default();
            for layer in display.ordered_layers() {
                if layer.composition_type() == Composition::Device {
                    changes.add_composition_change(layer.id(), Composition::Client);
                }
            }

            Ok(changes)
        }

        fn present_display(&self, _display: &mut DisplayState) -> Result<PresentFences> {
            self.presents.fetch_add(1, Ordering::SeqCst);
            Ok(PresentFences::default())
        }
    }

    const PERIOD_60: i32 = 16_666_666;

    fn temp_store() -> Arc<BootConfigStore> {
        Arc::new(BootConfigStore::new(std::env::temp_dir().join(format!(
            "vdcomposer-{}/boot_config.json",
            uuid::Uuid::new_v4()
        ))))
    }

    fn configs() -> Vec<DisplayConfig> {
        let mut configs = vec![
            DisplayConfig::new(1, 1920, 1080, 160, 160, PERIOD_60),
            DisplayConfig::new(2, 1920, 1080, 160, 160, vsync::period_from_hz(48)),
            DisplayConfig::new(3, 1280, 720, 160, 160, PERIOD_60),
        ];
        DisplayConfig::assign_groups(&mut configs);
        configs
    }

    fn display_with(composer: Arc<dyn FrameComposer>, store: Arc<BootConfigStore>) -> Display {
        let display = Display::new(0, composer, store, false);
        display.init(configs(), 1, None).unwrap();
        display
    }

    fn display() -> (Arc<Demoting>, Display) {
        let composer = Arc::new(Demoting::default());
        let display = display_with(composer.clone(), temp_store());
        (composer, display)
    }

    fn flow(display: &Display) -> PresentFlow {
        display.with_state(|s| s.present_flow())
    }

    #[test_log::test]
    fn present_requires_validate() {
        let (composer, display) = display();
        assert!(matches!(display.present(), Err(Error::NotValidated)));
        assert_eq!(display.accept_changes(), Err(Error::NotValidated));
        assert_eq!(flow(&display), PresentFlow::WaitingForValidate);

        assert!(display.validate().unwrap().is_empty());
        assert_eq!(flow(&display), PresentFlow::WaitingForPresent);
        assert!(display.present().is_ok());
        assert_eq!(flow(&display), PresentFlow::WaitingForValidate);

        assert!(matches!(display.present(), Err(Error::NotValidated)));
        assert_eq!(composer.presents.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn present_requires_accept() {
        let (composer, display) = display();
        let layer = display.create_layer();
        display
            .with_layer(layer, |l| l.set_composition_type(Composition::Device))
            .unwrap();

        let changes = display.validate().unwrap();
        assert_eq!(changes.composition_changes, vec![(layer, Composition::Client)]);
        assert_eq!(flow(&display), PresentFlow::WaitingForAccept);

        assert!(matches!(display.present(), Err(Error::NotValidated)));
        assert_eq!(flow(&display), PresentFlow::WaitingForAccept);
        assert_eq!(composer.presents.load(Ordering::SeqCst), 0);

        display.accept_changes().unwrap();
        assert_eq!(
            display.with_layer(layer, |l| l.composition_type()),
            Ok(Composition::Client)
        );

        assert!(display.present().is_ok());
        assert_eq!(composer.presents.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn accepting_changes_for_destroyed_layer() {
        let (_composer, display) = display();
        let layer = display.create_layer();
        display
            .with_layer(layer, |l| l.set_composition_type(Composition::Device))
            .unwrap();

        display.validate().unwrap();
        display.destroy_layer(layer).unwrap();
        display.accept_changes().unwrap();
        assert!(display.present().is_ok());
    }

    #[test_log::test]
    fn layers_are_ordered() {
        let (_composer, display) = display();
        let a = display.create_layer();
        let b = display.create_layer();
        let c = display.create_layer();
        display.with_layer(a, |l| l.set_z_order(2)).unwrap();
        display.with_layer(b, |l| l.set_z_order(0)).unwrap();
        display.with_layer(c, |l| l.set_z_order(0)).unwrap();

        display.validate().unwrap();
        let ordered = |d: &Display| d.with_state(|s| s.ordered_layers().map(|l| l.id()).collect::<Vec<_>>());
        assert_eq!(ordered(&display), vec![b, c, a]);

        display.destroy_layer(c).unwrap();
        assert_eq!(ordered(&display), vec![b, a]);
        assert_eq!(display.destroy_layer(c), Err(Error::BadLayer));
        assert_eq!(display.with_layer(c, |_| ()), Err(Error::BadLayer));

        display.with_layer(b, |l| l.set_z_order(5)).unwrap();
        display.validate().unwrap();
        assert_eq!(ordered(&display), vec![a, b]);
    }

    #[test_log::test]
    fn seamless_switch_within_group() {
        let (_composer, display) = display();
        assert_eq!(display.active_config(), Ok(1));

        assert!(display.set_active_config_with_constraints(2, 0, true).is_ok());
        assert_eq!(display.active_config(), Ok(2));
        assert_eq!(display.vsync_period(), Ok(vsync::period_from_hz(48)));

        assert_eq!(
            display.set_active_config_with_constraints(3, 0, true),
            Err(Error::SeamlessNotAllowed)
        );
        assert_eq!(display.active_config(), Ok(2));

        assert!(display.set_active_config(3).is_ok());
        assert_eq!(display.active_config(), Ok(3));
        assert_eq!(display.set_active_config(9), Err(Error::BadConfig));
    }

    #[test_log::test]
    fn attributes() {
        let (_composer, display) = display();
        assert_eq!(display.display_configs(), vec![1, 2, 3]);
        assert_eq!(display.display_attribute(3, DisplayAttribute::Width), Ok(1280));
        assert_eq!(display.display_attribute(1, DisplayAttribute::DpiX), Ok(160_000));
        assert_eq!(display.display_attribute(2, DisplayAttribute::ConfigGroup), Ok(0));
        assert_eq!(display.display_attribute(3, DisplayAttribute::ConfigGroup), Ok(1));
        assert_eq!(
            display.display_attribute(4, DisplayAttribute::Height),
            Err(Error::BadConfig)
        );

        assert_eq!(display.name(), "EMU_display_0");
        let ident = display.identification_data();
        assert_eq!(ident.port, 0);
        assert_eq!(ident.data.len(), 128);
    }

    #[test_log::test]
    fn missing_active_config() {
        let display = Display::new(0, Arc::new(Demoting::default()), temp_store(), false);
        assert_eq!(display.init(configs(), 7, None), Err(Error::NoResources));
        assert_eq!(display.active_config(), Ok(7));
        assert_eq!(display.vsync_period(), Err(Error::BadConfig));
    }

    #[test_log::test]
    fn boot_config_survives_restart() {
        let store = temp_store();
        let composer: Arc<dyn FrameComposer> = Arc::new(Demoting::default());

        let display = display_with(composer.clone(), store.clone());
        assert_eq!(display.boot_config(), None);
        assert_eq!(display.preferred_boot_config(), Ok(1));
        assert_eq!(display.set_boot_config(9), Err(Error::BadConfig));

        display.set_boot_config(3).unwrap();
        assert_eq!(display.boot_config(), Some(3));
        drop(display);

        let display = display_with(composer.clone(), store.clone());
        assert_eq!(display.active_config(), Ok(3));

        display.clear_boot_config().unwrap();
        assert_eq!(display.boot_config(), None);
        drop(display);

        let display = display_with(composer, store);
        assert_eq!(display.active_config(), Ok(1));
    }

    #[test_log::test]
    fn power_modes() {
        let (_composer, display) = display();
        assert_eq!(display.power_mode(), PowerMode::Off);
        assert_eq!(display.set_power_mode(PowerMode::Doze.into()), Err(Error::Unsupported));
        assert_eq!(display.set_power_mode(PowerMode::OnSuspend.into()), Err(Error::Unsupported));
        assert_eq!(display.set_power_mode(17), Err(Error::BadParameter));

        display.set_power_mode(PowerMode::On.into()).unwrap();
        assert_eq!(display.power_mode(), PowerMode::On);
    }

    #[test_log::test]
    fn color_modes() {
        let (_composer, display) = display();
        assert_eq!(display.color_modes(), vec![ColorMode::Native]);
        assert_eq!(display.set_color_mode(0, 0), Ok(()));
        assert_eq!(display.set_color_mode(7, 0), Err(Error::Unsupported));
        assert_eq!(display.set_color_mode(14, 0), Err(Error::BadParameter));
        assert_eq!(display.set_color_mode(0, 4), Err(Error::BadParameter));

        assert_eq!(display.render_intents(9), Ok(vec![RenderIntent::Colorimetric]));
        assert_eq!(display.render_intents(-1), Err(Error::BadParameter));
    }

    #[test_log::test]
    fn unsupported_surface() {
        let (_composer, display) = display();
        assert_eq!(display.set_content_type(0), Ok(()));
        assert_eq!(display.set_content_type(4), Err(Error::Unsupported));
        assert_eq!(display.set_brightness(-0.5), Err(Error::BadParameter));
        assert_eq!(display.set_brightness(0.5), Err(Error::Unsupported));
        assert_eq!(display.set_auto_low_latency_mode(true), Err(Error::Unsupported));
        assert_eq!(display.set_idle_timer_enabled(100), Err(Error::Unsupported));
        assert!(display.readback_buffer_fence().is_err());
        assert!(display.supported_content_types().is_empty());
        assert_eq!(display.hdr_capabilities(), HdrCapabilities::default());
    }

    #[test_log::test]
    fn color_transform() {
        let (_composer, display) = display();
        assert_eq!(display.set_color_transform(&[1.0; 15]), Err(Error::BadParameter));

        let mut identity = [0.0; 16];
        for i in 0..4 {
            identity[i * 5] = 1.0;
        }
        display.set_color_transform(&identity).unwrap();
        assert_eq!(display.with_state(|s| s.color_transform().copied()), Some(identity));
    }

    #[test_log::test]
    fn update_parameters() {
        let (_composer, display) = display();
        display
            .update_parameters(2560, 1440, 200, 200, 30, Some(vec![1, 2, 3]))
            .unwrap();

        assert_eq!(display.vsync_period(), Ok(vsync::period_from_hz(30)));
        assert_eq!(display.display_attribute(1, DisplayAttribute::Width), Ok(2560));
        assert_eq!(display.display_attribute(1, DisplayAttribute::DpiY), Ok(200_000));
        assert_eq!(display.identification_data().data, vec![1, 2, 3]);
    }

    #[test_log::test]
    fn update_parameters_regroups_configs() {
        let (_composer, display) = display();
        assert_eq!(display.display_attribute(1, DisplayAttribute::ConfigGroup), Ok(0));
        assert_eq!(display.display_attribute(2, DisplayAttribute::ConfigGroup), Ok(0));

        // The active config now matches config 3 in size and density.
        display
            .update_parameters(1280, 720, 160, 160, 60, None)
            .unwrap();

        assert_eq!(display.display_attribute(1, DisplayAttribute::ConfigGroup), Ok(0));
        assert_eq!(display.display_attribute(2, DisplayAttribute::ConfigGroup), Ok(1));
        assert_eq!(display.display_attribute(3, DisplayAttribute::ConfigGroup), Ok(0));
    }

    #[test]
    fn config_groups() {
        let configs = configs();
        let groups: Vec<_> = configs.iter().map(|c| c.config_group).collect();
        assert_eq!(groups, vec![0, 0, 1]);
    }
}
