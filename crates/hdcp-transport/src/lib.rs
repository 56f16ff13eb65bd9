//! Hardware seams for the HDCP engine.
//!
//! This crate names the receiver and cipher engine registers and defines the
//! traits the engine talks through (DDC bus, cipher engine, key source,
//! revocation list), so platform adapters can be swapped without touching
//! the protocol code. Simulators for all of them live in [`testing`].

#![forbid(unsafe_code)]

pub mod regs;
pub mod retry;
pub mod testing;
pub mod traits;

pub use regs::*;
pub use retry::*;
pub use traits::*;
