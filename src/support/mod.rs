//! Cross-cutting utilities shared by all layers.

pub mod authutil;
pub mod errors;
pub mod frame;
pub mod shutdown;
pub mod timeutil;
