// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, error, instrument, trace, warn};

use super::{DisplayChanges, FrameComposer, PresentFences};
use crate::{
    buffer::BufferAllocator,
    compositor::{self, Compositor, Target},
    config::DrmConfig,
    display::DisplayState,
    drm::{DrmClient, DumbAllocator, HotplugCallback},
    error::{Error, Result},
    fence::{self, Fence},
    layer::{Composition, Layer},
    swapchain::{Swapchain, DEFAULT_IMAGE_COUNT},
};

struct DisplayInfo {
    swapchain: Swapchain,
    compositor: Compositor,
    present_disabled: bool,
}

/// Blends DEVICE and SOLID_COLOR layers in software, falling back to the
/// window system for anything it can't draw.
pub struct GuestComposer {
    drm: Arc<DrmClient>,
    allocator: Box<dyn BufferAllocator>,
    displays: Mutex<HashMap<u64, DisplayInfo>>,
}

impl GuestComposer {
    pub fn open(cfg: &DrmConfig) -> Result<Self> {
        let (drm, card) = DrmClient::open(cfg)?;
        Ok(Self::new(drm, Box::new(DumbAllocator(card))))
    }

    pub fn new(drm: Arc<DrmClient>, allocator: Box<dyn BufferAllocator>) -> Self {
        Self {
            drm,
            allocator,
            displays: Mutex::new(HashMap::new()),
        }
    }
}

fn can_compose(layer: &Layer, composition: Composition) -> bool {
    match composition {
        Composition::SolidColor => true,
        Composition::Device => {
            let Some(buffer) = layer.buffer().buffer() else {
                debug!(layer_id = layer.id(), "device layer without a buffer");
                return false;
            };

            if !compositor::is_format_supported(buffer.format()) {
                debug!(layer_id = layer.id(), format = ?buffer.format(), "unsupported format");
                return false;
            }

            !layer.has_luts()
        }
        _ => false,
    }
}

fn is_composed_here(composition: Composition) -> bool {
    matches!(composition, Composition::Device | Composition::SolidColor)
}

impl FrameComposer for GuestComposer {
    fn register_hotplug_callback(&self, cb: HotplugCallback) {
        self.drm.register_hotplug_callback(cb);
    }

    fn unregister_hotplug_callback(&self) {
        self.drm.unregister_hotplug_callback();
    }

    #[instrument(level = "debug", skip_all, fields(display_id = display_state.id()))]
    fn on_display_create(&self, display_state: &mut DisplayState) -> Result<()> {
        let display = display_state;
        let id = display.id();
        let Some(config) = display.active_config().copied() else {
            error!("display has no active config");
            return Err(Error::NoResources);
        };

        let mut swapchain = Swapchain::new(
            self.allocator.as_ref(),
            &self.drm,
            DEFAULT_IMAGE_COUNT,
            config.width as u32,
            config.height as u32,
        )?;

        // Put something on screen before the first frame arrives.
        let mut present_disabled = false;
        if id == 0 {
            let image = swapchain.next_image();
            match self.drm.flush_to_display(id as u32, image.drm_buffer(), None) {
                Ok(fence) => image.mark_in_use(fence),
                Err(err) => {
                    warn!(?err, "initial flush failed, disabling presents");
                    present_disabled = true;
                }
            }
        }

        if let Some(edid) = self.drm.edid(id as u32) {
            display.set_edid(edid);
        }

        self.displays.lock().insert(
            id,
            DisplayInfo {
                swapchain,
                compositor: Compositor::default(),
                present_disabled,
            },
        );

        Ok(())
    }

    fn on_display_destroy(&self, display_id: u64) -> Result<()> {
        match self.displays.lock().remove(&display_id) {
            Some(_) => Ok(()),
            None => {
                error!(display_id, "destroying unknown display");
                Err(Error::BadDisplay)
            }
        }
    }

    fn on_display_client_target_set(&self, _display: &DisplayState) -> Result<()> {
        Ok(())
    }

    fn on_active_config_change(&self, _display: &DisplayState) -> Result<()> {
        Ok(())
    }

    #[instrument(level = "trace", skip_all, fields(display_id = display_state.id()))]
    fn validate_display(&self, display_state: &DisplayState) -> Result<DisplayChanges> {
        let display = display_state;
        let mut changes = DisplayChanges::default();
        let mut fallback = false;

        for layer in display.ordered_layers() {
            let id = layer.id();
            let composition = match layer.composition_type() {
                Composition::Invalid => {
                    warn!(layer_id = id, "layer has invalid composition type");
                    continue;
                }
                Composition::Cursor => {
                    changes.add_composition_change(id, Composition::Device);
                    Composition::Device
                }
                Composition::Client | Composition::Sideband => {
                    fallback = true;
                    break;
                }
                Composition::DisplayDecoration => {
                    error!(layer_id = id, "display decoration layers are unsupported");
                    return Err(Error::Unsupported);
                }
                c => c,
            };

            if !can_compose(layer, composition) {
                fallback = true;
                break;
            }
        }

        if fallback {
            for layer in display.ordered_layers() {
                match layer.composition_type() {
                    Composition::Invalid | Composition::Client => (),
                    _ => changes.add_composition_change(layer.id(), Composition::Client),
                }
            }
        }

        // Nothing can be drawn underneath a client-composed layer.
        let effective: Vec<(i64, Composition)> = display
            .ordered_layers()
            .map(|l| (l.id(), changes.effective_type(l.id(), l.composition_type())))
            .collect();
        if let Some(topmost) = effective.iter().rposition(|(_, c)| *c == Composition::Client) {
            for (id, composition) in &effective[..topmost] {
                if !matches!(composition, Composition::Client | Composition::Invalid) {
                    changes.add_composition_change(*id, Composition::Client);
                }
            }
        }

        trace!(?changes, "validated");
        Ok(changes)
    }

    #[instrument(level = "trace", skip_all, fields(display_id = display_state.id()))]
    fn present_display(&self, display_state: &mut DisplayState) -> Result<PresentFences> {
        let display = display_state;
        let id = display.id();
        let mut displays = self.displays.lock();
        let Some(info) = displays.get_mut(&id) else {
            error!("present to unknown display");
            return Err(Error::BadDisplay);
        };

        if info.present_disabled {
            trace!("presents disabled");
            return Ok(PresentFences::default());
        }

        let image = info.swapchain.next_image();
        image.wait();

        {
            let buffer = image.buffer();
            let Some(stride) = buffer.planes().first().map(|p| p.stride) else {
                error!("swapchain image has no planes");
                return Err(Error::NoResources);
            };

            let mut mapped = buffer.lock();
            let mut target = Target {
                data: &mut mapped,
                width: buffer.width(),
                height: buffer.height(),
                stride,
            };

            compose(display, &mut info.compositor, &mut target)?;

            if let Some(matrix) = display.color_transform() {
                compositor::apply_color_transform(matrix, &mut target);
            }
        }

        let fence = match self.drm.flush_to_display(id as u32, image.drm_buffer(), None) {
            Ok(fence) => fence,
            Err(err) => {
                image.mark_in_use(None);
                error!(?err, "failed to flush composed frame");
                return Err(Error::NoResources);
            }
        };

        image.mark_in_use(fence.as_ref().and_then(dup));

        let layers = match &fence {
            Some(fence) => display
                .ordered_layers()
                .filter(|l| is_composed_here(l.composition_type()))
                .filter_map(|l| dup(fence).map(|f| (l.id(), f)))
                .collect(),
            None => Vec::new(),
        };

        Ok(PresentFences {
            display: fence,
            layers,
        })
    }

    fn drm_client(&self) -> Option<&DrmClient> {
        Some(&self.drm)
    }
}

fn compose(display: &DisplayState, compositor: &mut Compositor, target: &mut Target<'_>) -> Result<()> {
    let mut layers = display.ordered_layers().peekable();
    if layers.peek().is_none() {
        warn!("presenting with no layers");
        return Ok(());
    }

    if layers.all(|l| l.composition_type() == Composition::Client) {
        let client_target = display.client_target();
        let Some(buffer) = client_target.buffer() else {
            error!("all layers are client composed, but there's no client target");
            return Err(Error::NoResources);
        };

        fence::wait_logged(client_target.fence(), "client target");
        let src = buffer.lock();
        let len = src.len().min(target.data.len());
        target.data[..len].copy_from_slice(&src[..len]);
        return Ok(());
    }

    for layer in display.ordered_layers() {
        if !is_composed_here(layer.composition_type()) {
            continue;
        }

        fence::wait_logged(layer.buffer().fence(), "layer buffer");
        compositor.compose_layer(layer, target).inspect_err(|err| {
            error!(?err, layer_id = layer.id(), "failed to compose layer");
        })?;
    }

    Ok(())
}

fn dup(fence: &Fence) -> Option<Fence> {
    match fence.try_clone() {
        Ok(f) => Some(f),
        Err(err) => {
            warn!(%err, "failed to duplicate fence");
            None
        }
    }
}
