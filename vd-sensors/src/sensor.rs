// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use serde::Serialize;

/// Sensor type codes, as carried in events.
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Accelerometer = 1,
    MagneticField = 2,
    Gyroscope = 4,
    Light = 5,
    Pressure = 6,
    DeviceTemperature = 7,
    Proximity = 8,
    RelativeHumidity = 12,
    AmbientTemperature = 13,
}

/// A static description of a sensor. The handle is the index into
/// [`SENSORS`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SensorInfo {
    pub name: &'static str,
    pub handle: i32,
    pub sensor_type: SensorType,
    /// The shortest sampling period, in microseconds.
    pub min_delay_us: i64,
    pub max_range: f32,
    /// The reading reported until a real one is injected.
    pub default_reading: [f32; 3],
}

impl SensorInfo {
    pub fn min_delay_nanos(&self) -> i64 {
        self.min_delay_us * 1000
    }
}

pub const ACCELEROMETER: i32 = 0;
pub const GYROSCOPE: i32 = 1;
pub const LIGHT: i32 = 2;
pub const MAGNETIC_FIELD: i32 = 3;
pub const PRESSURE: i32 = 4;
pub const PROXIMITY: i32 = 5;
pub const AMBIENT_TEMPERATURE: i32 = 6;
pub const DEVICE_TEMPERATURE: i32 = 7;
pub const RELATIVE_HUMIDITY: i32 = 8;

pub static SENSORS: [SensorInfo; 9] = [
    SensorInfo {
        name: "Accelerometer",
        handle: ACCELEROMETER,
        sensor_type: SensorType::Accelerometer,
        min_delay_us: 5_000,
        max_range: 39.3,
        default_reading: [0.0, 9.81, 0.0],
    },
    SensorInfo {
        name: "Gyroscope",
        handle: GYROSCOPE,
        sensor_type: SensorType::Gyroscope,
        min_delay_us: 5_000,
        max_range: 16.46,
        default_reading: [0.0, 0.0, 0.0],
    },
    SensorInfo {
        name: "Light",
        handle: LIGHT,
        sensor_type: SensorType::Light,
        min_delay_us: 100_000,
        max_range: 40_000.0,
        default_reading: [400.0, 0.0, 0.0],
    },
    SensorInfo {
        name: "Magnetic field",
        handle: MAGNETIC_FIELD,
        sensor_type: SensorType::MagneticField,
        min_delay_us: 10_000,
        max_range: 4_900.0,
        default_reading: [0.0, 5.9, -48.4],
    },
    SensorInfo {
        name: "Pressure",
        handle: PRESSURE,
        sensor_type: SensorType::Pressure,
        min_delay_us: 100_000,
        max_range: 1_100.0,
        default_reading: [1_013.25, 0.0, 0.0],
    },
    SensorInfo {
        name: "Proximity",
        handle: PROXIMITY,
        sensor_type: SensorType::Proximity,
        min_delay_us: 100_000,
        max_range: 5.0,
        default_reading: [5.0, 0.0, 0.0],
    },
    SensorInfo {
        name: "Ambient temperature",
        handle: AMBIENT_TEMPERATURE,
        sensor_type: SensorType::AmbientTemperature,
        min_delay_us: 1_000_000,
        max_range: 80.0,
        default_reading: [22.0, 0.0, 0.0],
    },
    SensorInfo {
        name: "Device temperature",
        handle: DEVICE_TEMPERATURE,
        sensor_type: SensorType::DeviceTemperature,
        min_delay_us: 1_000_000,
        max_range: 80.0,
        default_reading: [25.0, 0.0, 0.0],
    },
    SensorInfo {
        name: "Relative humidity",
        handle: RELATIVE_HUMIDITY,
        sensor_type: SensorType::RelativeHumidity,
        min_delay_us: 1_000_000,
        max_range: 100.0,
        default_reading: [40.0, 0.0, 0.0],
    },
];

/// Looks up a sensor by handle.
pub fn info(handle: i32) -> Option<&'static SensorInfo> {
    usize::try_from(handle).ok().and_then(|i| SENSORS.get(i))
}
