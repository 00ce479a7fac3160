mod fmt;
mod shutdown;

pub use self::fmt::*;
pub use self::shutdown::{ShutdownController, ShutdownToken};

pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type BoxedErrorResult<T> = std::result::Result<T, BoxedError>;

pub type WhateverResult<T> = std::result::Result<T, snafu::Whatever>;
