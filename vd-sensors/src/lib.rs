// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Mock sensors with an injection socket. Enabled sensors produce their last
//! reading at their sampling rate until a remote sends a real event, which
//! takes precedence for a short window.

mod error;
mod listener;
pub mod sensor;
mod sensor_core;
pub mod wire;

pub use error::SensorError;
pub use listener::Listener;
pub use sensor::{SensorInfo, SensorType, SENSORS};
pub use sensor_core::SensorCore;
pub use wire::{SensorEvent, SensorStatePacket};
