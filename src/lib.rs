pub mod batch;
pub mod config;
pub mod device;
pub mod error;
pub mod output;
pub mod queue;
pub mod scripts;
pub mod state;
