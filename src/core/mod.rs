//! Core types shared by every layer: error taxonomy and default constants.

pub mod constants;
mod error;

pub use error::*;
