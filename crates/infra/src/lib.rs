//! Hardware side of Ear: CPAL device enumeration, output streams and the
//! software mixdown that applies routing matrices

pub mod audio;

pub use audio::{CpalBackend, CpalSession};
