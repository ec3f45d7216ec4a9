// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use crate::{
    buffer::GraphicsBuffer,
    error::Error,
    fence::Fence,
    layer::{Color, Composition, FRect, Rect},
    resources::BufferRef,
};

/// A buffer sent with a command, plus the fence guarding it.
#[derive(Debug, Default)]
pub struct Buffer {
    pub slot: usize,
    /// `None` refers to the buffer already cached in the slot.
    pub buffer: Option<GraphicsBuffer>,
    pub fence: Option<Fence>,
}

impl Buffer {
    pub(super) fn split(self) -> (BufferRef, Option<Fence>) {
        (
            BufferRef {
                slot: self.slot,
                buffer: self.buffer,
            },
            self.fence,
        )
    }
}

#[derive(Debug, Default)]
pub struct ClientTarget {
    pub buffer: Buffer,
    pub dataspace: i32,
    pub damage: Vec<Rect>,
}

/// Changes to one layer. Only the fields that are set are applied.
#[derive(Debug, Default)]
pub struct LayerCommand {
    pub layer: i64,
    pub buffer: Option<Buffer>,
    pub blend_mode: Option<i32>,
    pub color: Option<Color>,
    pub composition: Option<i32>,
    pub dataspace: Option<i32>,
    pub display_frame: Option<Rect>,
    pub plane_alpha: Option<f32>,
    pub source_crop: Option<FRect>,
    pub transform: Option<i32>,
    pub visible_region: Option<Vec<Rect>>,
    pub z: Option<i64>,
    pub color_transform: Option<Vec<f32>>,
    pub brightness: Option<f32>,
    pub per_frame_metadata: Option<Vec<(i32, f32)>>,
    pub luts: Option<bool>,
}

/// Everything the window system asks of one display in a batch, applied in
/// field order.
#[derive(Debug, Default)]
pub struct DisplayCommand {
    pub display: u64,
    pub layers: Vec<LayerCommand>,
    pub color_transform: Option<Vec<f32>>,
    pub brightness: Option<f32>,
    pub client_target: Option<ClientTarget>,
    pub output_buffer: Option<Buffer>,
    pub expected_present_time: Option<i64>,
    pub validate: bool,
    pub accept_changes: bool,
    pub present: bool,
    pub present_or_validate: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PresentOrValidate {
    Validated,
    Presented,
}

#[derive(Debug)]
pub enum CommandResult {
    Error {
        command_index: usize,
        error: Error,
    },
    ChangedCompositionTypes {
        display: u64,
        layers: Vec<(i64, Composition)>,
    },
    PresentFence {
        display: u64,
        fence: Fence,
    },
    ReleaseFences {
        display: u64,
        layers: Vec<(i64, Fence)>,
    },
    PresentOrValidate {
        display: u64,
        result: PresentOrValidate,
    },
}

impl CommandResult {
    /// The numeric error code, for error results.
    pub fn error_code(&self) -> Option<i32> {
        match self {
            CommandResult::Error { error, .. } => Some(error.code()),
            _ => None,
        }
    }
}

/// Accumulates results for a batch. Errors are tagged with the index of
/// the display command that produced them.
#[derive(Debug, Default)]
pub(super) struct CommandResultWriter {
    index: usize,
    results: Vec<CommandResult>,
}

impl CommandResultWriter {
    pub(super) fn next_command(&mut self) {
        self.index += 1;
    }

    pub(super) fn add_error(&mut self, error: Error) {
        self.results.push(CommandResult::Error {
            command_index: self.index,
            error,
        });
    }

    pub(super) fn add_changes(&mut self, display: u64, layers: Vec<(i64, Composition)>) {
        if !layers.is_empty() {
            self.results
                .push(CommandResult::ChangedCompositionTypes { display, layers });
        }
    }

    pub(super) fn add_present_fence(&mut self, display: u64, fence: Option<Fence>) {
        if let Some(fence) = fence {
            self.results
                .push(CommandResult::PresentFence { display, fence });
        }
    }

    pub(super) fn add_release_fences(&mut self, display: u64, layers: Vec<(i64, Fence)>) {
        self.results
            .push(CommandResult::ReleaseFences { display, layers });
    }

    pub(super) fn add_present_or_validate(&mut self, display: u64, result: PresentOrValidate) {
        self.results
            .push(CommandResult::PresentOrValidate { display, result });
    }

    pub(super) fn finish(self) -> Vec<CommandResult> {
        self.results
    }
}
