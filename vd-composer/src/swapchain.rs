// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use drm_fourcc::DrmFourcc;
use tracing::{error, instrument};

use crate::{
    buffer::{BufferAllocator, GraphicsBuffer},
    drm::{DrmBuffer, DrmClient},
    error::{Error, Result},
    fence::{self, Fence},
};

pub const DEFAULT_IMAGE_COUNT: usize = 3;

/// A composition target that can be scanned out.
pub struct Image {
    buffer: GraphicsBuffer,
    drm_buffer: DrmBuffer,
    last_use: Option<Fence>,
}

impl Image {
    pub fn buffer(&self) -> &GraphicsBuffer {
        &self.buffer
    }

    pub fn drm_buffer(&self) -> &DrmBuffer {
        &self.drm_buffer
    }

    /// Waits until the display is no longer using the image.
    #[instrument(level = "trace", skip_all)]
    pub fn wait(&mut self) {
        fence::wait_logged(self.last_use.take().as_ref(), "swapchain image");
    }

    /// Records the fence that signals when the display is done with the
    /// image.
    pub fn mark_in_use(&mut self, fence: Option<Fence>) {
        self.last_use = fence;
    }
}

/// A ring of composition targets, reused in order.
pub struct Swapchain {
    images: Vec<Image>,
    next: usize,
}

impl Swapchain {
    pub fn new(
        allocator: &dyn BufferAllocator,
        drm: &DrmClient,
        count: usize,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let mut images = Vec::with_capacity(count);
        for _ in 0..count {
            let buffer = allocator
                .allocate(width, height, DrmFourcc::Abgr8888)
                .map_err(|err| {
                    error!(%err, width, height, "failed to allocate swapchain image");
                    Error::NoResources
                })?;

            let drm_buffer = drm.create_buffer(&buffer)?;
            images.push(Image {
                buffer,
                drm_buffer,
                last_use: None,
            });
        }

        Ok(Self { images, next: 0 })
    }

    /// Returns the next image in the ring. Callers must `wait` on it before
    /// writing to it.
    pub fn next_image(&mut self) -> &mut Image {
        let idx = self.next;
        self.next = (self.next + 1) % self.images.len();
        &mut self.images[idx]
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }
}
