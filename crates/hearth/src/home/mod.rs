//! Home Definition
//!
//! Loads the home directory (settings and room files) and watches it for
//! edits.

mod config;
mod loader;
mod watcher;

pub use config::*;
pub use loader::*;
pub use watcher::*;
