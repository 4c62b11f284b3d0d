//! Ear core: zone hierarchy, routing matrices and the command dispatcher
//!
//! Nothing in this crate touches audio hardware. Engines plug in through
//! [`domain::backend::AudioBackend`].

pub mod domain;

pub use domain::*;
