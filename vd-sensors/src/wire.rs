// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Packets exchanged with remotes over the injection socket. All fields are
//! little-endian.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use crate::error::{Result, SensorError};

/// A sensor reading. The layout is fixed:
///
/// | offset | field     |
/// |--------|-----------|
/// | 0      | version   |
/// | 4      | sensor    |
/// | 8      | type      |
/// | 12     | reserved  |
/// | 16     | timestamp |
/// | 24     | data[16]  |
/// | 88     | flags     |
/// | 96     | reserved  |
#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct SensorEvent {
    pub version: i32,
    pub sensor: i32,
    #[serde(rename = "type")]
    pub sensor_type: i32,
    pub timestamp: i64,
    pub data: [f32; 16],
    pub flags: u64,
}

impl SensorEvent {
    pub const ENCODED_LEN: usize = 104;

    pub fn new(sensor: i32, sensor_type: i32, timestamp: i64, values: &[f32]) -> Self {
        let mut data = [0.0; 16];
        let n = values.len().min(data.len());
        data[..n].copy_from_slice(&values[..n]);

        Self {
            version: Self::ENCODED_LEN as i32,
            sensor,
            sensor_type,
            timestamp,
            data,
            flags: 0,
        }
    }

    /// Reads an event from the start of a packet. Trailing bytes are
    /// ignored.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(SensorError::ShortBuffer(Self::ENCODED_LEN));
        }

        let mut r = Cursor::new(buf);
        let version = r.read_i32::<LittleEndian>()?;
        let sensor = r.read_i32::<LittleEndian>()?;
        let sensor_type = r.read_i32::<LittleEndian>()?;
        let _reserved = r.read_i32::<LittleEndian>()?;
        let timestamp = r.read_i64::<LittleEndian>()?;

        let mut data = [0.0; 16];
        r.read_f32_into::<LittleEndian>(&mut data)?;
        let flags = r.read_u64::<LittleEndian>()?;

        Ok(Self {
            version,
            sensor,
            sensor_type,
            timestamp,
            data,
            flags,
        })
    }

    /// Writes the event into a buffer and returns the number of bytes used.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(SensorError::ShortBuffer(Self::ENCODED_LEN));
        }

        let mut w = Cursor::new(&mut buf[..Self::ENCODED_LEN]);
        w.write_i32::<LittleEndian>(self.version)?;
        w.write_i32::<LittleEndian>(self.sensor)?;
        w.write_i32::<LittleEndian>(self.sensor_type)?;
        w.write_i32::<LittleEndian>(0)?;
        w.write_i64::<LittleEndian>(self.timestamp)?;
        for v in self.data {
            w.write_f32::<LittleEndian>(v)?;
        }
        w.write_u64::<LittleEndian>(self.flags)?;
        w.write_u64::<LittleEndian>(0)?;

        Ok(Self::ENCODED_LEN)
    }
}

/// Sent to every connected remote when a sensor is enabled, disabled, or
/// changes its sampling period.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct SensorStatePacket {
    pub handle: i32,
    pub sensor_type: i32,
    pub enabled: bool,
    pub delay_nanos: i64,
}

impl SensorStatePacket {
    pub const ENCODED_LEN: usize = 24;

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(SensorError::ShortBuffer(Self::ENCODED_LEN));
        }

        let mut r = Cursor::new(buf);
        let handle = r.read_i32::<LittleEndian>()?;
        let sensor_type = r.read_i32::<LittleEndian>()?;
        let enabled = r.read_i32::<LittleEndian>()? != 0;
        let _reserved = r.read_i32::<LittleEndian>()?;
        let delay_nanos = r.read_i64::<LittleEndian>()?;

        Ok(Self {
            handle,
            sensor_type,
            enabled,
            delay_nanos,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(SensorError::ShortBuffer(Self::ENCODED_LEN));
        }

        let mut w = Cursor::new(&mut buf[..Self::ENCODED_LEN]);
        w.write_i32::<LittleEndian>(self.handle)?;
        w.write_i32::<LittleEndian>(self.sensor_type)?;
        w.write_i32::<LittleEndian>(self.enabled as i32)?;
        w.write_i32::<LittleEndian>(0)?;
        w.write_i64::<LittleEndian>(self.delay_nanos)?;

        Ok(Self::ENCODED_LEN)
    }
}
