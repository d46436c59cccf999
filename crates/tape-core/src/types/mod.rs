//! Core data types shared across the collector.

pub mod enums;
pub mod market_data;

pub use enums::*;
pub use market_data::*;
