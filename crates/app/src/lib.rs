//! Shell around the Ear dispatcher: the stdio request loop

pub mod stdio;

pub use stdio::serve;
