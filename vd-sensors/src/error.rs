// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("bad sensor handle: {0}")]
    BadHandle(i32),
    #[error("bad event count: {0}")]
    BadCount(usize),
    #[error("short buffer, need {0} bytes")]
    ShortBuffer(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("sensor core closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SensorError>;
