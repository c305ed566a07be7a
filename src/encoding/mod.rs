//! Binary data encodings.
//!
//! - wire: little-endian framing for chain messages, packed values, and map
//!   elements.
pub mod wire;
