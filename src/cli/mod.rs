//! Command line interface module
//!
//! Argument parsing and the runner that fetches an image and writes the
//! squashed rootfs to the user's home directory.

pub mod args;
pub mod runner;

pub use args::Args;
pub use runner::Runner;
