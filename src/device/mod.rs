//! Lock, unlock and wipe.
//!
//! The per-host actions row only stores references to the actions in
//! flight; the device state is derived from them on every read.

pub mod manager;
pub mod mdm;
pub mod platform;
pub mod state;

pub use manager::{DeviceActionManager, DeviceStatus};
pub use mdm::{LocalMdmCommander, MdmCommand, MdmCommandStatus, MdmCommander};
pub use state::{DeviceState, RefUpdate};
