// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::{
    buffer::GraphicsBuffer,
    error::{Error, Result},
};

const DEFAULT_CLIENT_TARGET_SLOTS: usize = 1;

/// A buffer as referenced in a command: either a new buffer for a slot, or
/// the one already cached there.
#[derive(Debug, Clone)]
pub struct BufferRef {
    pub slot: usize,
    pub buffer: Option<GraphicsBuffer>,
}

impl BufferRef {
    pub fn cached(slot: usize) -> Self {
        Self { slot, buffer: None }
    }

    pub fn new(slot: usize, buffer: GraphicsBuffer) -> Self {
        Self {
            slot,
            buffer: Some(buffer),
        }
    }
}

/// Holds a buffer displaced from a slot. The buffer is released when this
/// is dropped, after whatever replaced it has been handed to the display.
#[derive(Debug, Default)]
#[must_use]
pub struct Releaser(Option<GraphicsBuffer>);

impl Drop for Releaser {
    fn drop(&mut self) {
        if let Some(buffer) = self.0.take() {
            trace!(buffer_id = buffer.id(), "releasing replaced buffer");
        }
    }
}

#[derive(Debug, Default)]
struct SlotCache(Vec<Option<GraphicsBuffer>>);

impl SlotCache {
    fn with_slots(n: usize) -> Self {
        Self(vec![None; n])
    }

    fn resize(&mut self, n: usize) {
        self.0.resize(n, None);
    }

    fn get(&mut self, buffer: BufferRef) -> Result<(GraphicsBuffer, Releaser)> {
        let Some(slot) = self.0.get_mut(buffer.slot) else {
            error!(slot = buffer.slot, slots = self.0.len(), "buffer slot out of range");
            return Err(Error::BadParameter);
        };

        match buffer.buffer {
            Some(new) => {
                let old = slot.replace(new.clone());
                Ok((new, Releaser(old)))
            }
            None => match slot {
                Some(cached) => Ok((cached.clone(), Releaser::default())),
                None => {
                    error!(slot = buffer.slot, "no buffer cached in slot");
                    Err(Error::BadParameter)
                }
            },
        }
    }
}

struct DisplayResources {
    must_validate: bool,
    client_targets: SlotCache,
    output: SlotCache,
    readback: SlotCache,
    layers: HashMap<i64, SlotCache>,
}

impl DisplayResources {
    fn new() -> Self {
        Self {
            must_validate: true,
            client_targets: SlotCache::with_slots(DEFAULT_CLIENT_TARGET_SLOTS),
            output: SlotCache::with_slots(1),
            readback: SlotCache::with_slots(1),
            layers: HashMap::new(),
        }
    }
}

/// Buffers imported on behalf of the window system, cached by slot.
#[derive(Default)]
pub struct Resources {
    displays: Mutex<HashMap<u64, DisplayResources>>,
}

impl Resources {
    fn with_display<T>(
        &self,
        display_id: u64,
        f: impl FnOnce(&mut DisplayResources) -> Result<T>,
    ) -> Result<T> {
        match self.displays.lock().get_mut(&display_id) {
            Some(display) => f(display),
            None => {
                error!(display_id, "no resources for display");
                Err(Error::BadDisplay)
            }
        }
    }

    pub fn add_physical_display(&self, display_id: u64) -> Result<()> {
        let mut displays = self.displays.lock();
        if displays.contains_key(&display_id) {
            error!(display_id, "display resources already exist");
            return Err(Error::BadDisplay);
        }

        displays.insert(display_id, DisplayResources::new());
        debug!(display_id, "added display resources");
        Ok(())
    }

    pub fn remove_display(&self, display_id: u64) -> Result<()> {
        match self.displays.lock().remove(&display_id) {
            Some(_) => Ok(()),
            None => {
                error!(display_id, "no resources for display");
                Err(Error::BadDisplay)
            }
        }
    }

    pub fn add_layer(&self, display_id: u64, layer_id: i64, slot_count: usize) -> Result<()> {
        self.with_display(display_id, |display| {
            display
                .layers
                .insert(layer_id, SlotCache::with_slots(slot_count));
            Ok(())
        })
    }

    /// Drops the layer's cached buffers. Any buffer still referenced by an
    /// in-flight frame stays alive until that frame lets go of it.
    pub fn remove_layer(&self, display_id: u64, layer_id: i64) -> Result<()> {
        self.with_display(display_id, |display| {
            match display.layers.remove(&layer_id) {
                Some(_) => Ok(()),
                None => {
                    error!(display_id, layer_id, "no resources for layer");
                    Err(Error::BadLayer)
                }
            }
        })
    }

    pub fn set_client_target_cache_size(&self, display_id: u64, slots: usize) -> Result<()> {
        if slots == 0 {
            return Err(Error::BadParameter);
        }

        self.with_display(display_id, |display| {
            display.client_targets.resize(slots);
            Ok(())
        })
    }

    pub fn layer_buffer(
        &self,
        display_id: u64,
        layer_id: i64,
        buffer: BufferRef,
    ) -> Result<(GraphicsBuffer, Releaser)> {
        self.with_display(display_id, |display| match display.layers.get_mut(&layer_id) {
            Some(cache) => cache.get(buffer),
            None => {
                error!(display_id, layer_id, "no resources for layer");
                Err(Error::BadLayer)
            }
        })
    }

    pub fn client_target(
        &self,
        display_id: u64,
        buffer: BufferRef,
    ) -> Result<(GraphicsBuffer, Releaser)> {
        self.with_display(display_id, |display| display.client_targets.get(buffer))
    }

    pub fn output_buffer(
        &self,
        display_id: u64,
        buffer: BufferRef,
    ) -> Result<(GraphicsBuffer, Releaser)> {
        self.with_display(display_id, |display| display.output.get(buffer))
    }

    pub fn readback_buffer(
        &self,
        display_id: u64,
        buffer: BufferRef,
    ) -> Result<(GraphicsBuffer, Releaser)> {
        self.with_display(display_id, |display| display.readback.get(buffer))
    }

    pub fn set_must_validate(&self, display_id: u64, must_validate: bool) {
        if let Some(display) = self.displays.lock().get_mut(&display_id) {
            display.must_validate = must_validate;
        }
    }

    pub fn must_validate(&self, display_id: u64) -> bool {
        self.displays
            .lock()
            .get(&display_id)
            .is_some_and(|d| d.must_validate)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buffer::{BufferAllocator as _, HeapAllocator};
    use drm_fourcc::DrmFourcc;
    use pretty_assertions::assert_eq;

    fn buffer() -> GraphicsBuffer {
        HeapAllocator.allocate(4, 4, DrmFourcc::Abgr8888).unwrap()
    }

    fn resources() -> Resources {
        let resources = Resources::default();
        resources.add_physical_display(0).unwrap();
        resources.add_layer(0, 10, 2).unwrap();
        resources
    }

    #[test_log::test]
    fn fresh_buffer_displaces_cached_one() {
        let resources = resources();
        let (a, b) = (buffer(), buffer());

        let (got, releaser) = resources.layer_buffer(0, 10, BufferRef::new(1, a.clone())).unwrap();
        assert_eq!(got, a);
        assert!(releaser.0.is_none());

        let (got, releaser) = resources.layer_buffer(0, 10, BufferRef::cached(1)).unwrap();
        assert_eq!(got, a);
        assert!(releaser.0.is_none());

        let (got, releaser) = resources.layer_buffer(0, 10, BufferRef::new(1, b.clone())).unwrap();
        assert_eq!(got, b);
        assert_eq!(releaser.0.as_ref(), Some(&a));
    }

    #[test_log::test]
    fn bad_slots() {
        let resources = resources();
        assert_eq!(
            resources.layer_buffer(0, 10, BufferRef::cached(0)).err(),
            Some(Error::BadParameter)
        );
        assert_eq!(
            resources.layer_buffer(0, 10, BufferRef::new(2, buffer())).err(),
            Some(Error::BadParameter)
        );
        assert_eq!(
            resources.layer_buffer(0, 11, BufferRef::cached(0)).err(),
            Some(Error::BadLayer)
        );
        assert_eq!(
            resources.client_target(1, BufferRef::cached(0)).err(),
            Some(Error::BadDisplay)
        );
    }

    #[test_log::test]
    fn client_target_cache_grows() {
        let resources = resources();
        assert!(resources.client_target(0, BufferRef::new(3, buffer())).is_err());

        resources.set_client_target_cache_size(0, 4).unwrap();
        assert!(resources.client_target(0, BufferRef::new(3, buffer())).is_ok());
        assert!(resources.client_target(0, BufferRef::cached(3)).is_ok());
        assert_eq!(
            resources.set_client_target_cache_size(0, 0),
            Err(Error::BadParameter)
        );
    }

    #[test_log::test]
    fn must_validate() {
        let resources = resources();
        assert!(resources.must_validate(0));
        resources.set_must_validate(0, false);
        assert!(!resources.must_validate(0));
        assert!(!resources.must_validate(5));
    }

    #[test_log::test]
    fn layers_and_displays_are_removed() {
        let resources = resources();
        resources.remove_layer(0, 10).unwrap();
        assert_eq!(resources.remove_layer(0, 10), Err(Error::BadLayer));

        assert_eq!(resources.add_physical_display(0), Err(Error::BadDisplay));
        resources.remove_display(0).unwrap();
        assert_eq!(resources.remove_display(0), Err(Error::BadDisplay));
    }
}
