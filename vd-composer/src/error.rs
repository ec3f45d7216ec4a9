// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

/// Errors surfaced to the window system. Success is `Ok(())`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Error {
    #[error("bad config")]
    BadConfig,
    #[error("bad display")]
    BadDisplay,
    #[error("bad layer")]
    BadLayer,
    #[error("bad parameter")]
    BadParameter,
    #[error("no resources")]
    NoResources,
    #[error("not validated")]
    NotValidated,
    #[error("unsupported")]
    Unsupported,
    #[error("seamless not allowed")]
    SeamlessNotAllowed,
}

impl Error {
    /// The numeric code carried in command results.
    pub fn code(&self) -> i32 {
        match self {
            Error::BadConfig => 1,
            Error::BadDisplay => 2,
            Error::BadLayer => 3,
            Error::BadParameter => 4,
            Error::NoResources => 6,
            Error::NotValidated => 7,
            Error::Unsupported => 8,
            Error::SeamlessNotAllowed => 9,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl<T: num_enum::TryFromPrimitive> From<num_enum::TryFromPrimitiveError<T>> for Error {
    fn from(_: num_enum::TryFromPrimitiveError<T>) -> Self {
        Error::BadParameter
    }
}
