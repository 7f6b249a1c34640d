pub mod content;
pub mod executor;
pub mod library;
pub mod validation;

pub use executor::{RunOptions, ScriptExecutor, UninstallStatusSink};
pub use library::ScriptLibrary;
