//! Wire-format and data-model types shared across the connectivity engine.

pub mod codec;
pub mod types;
