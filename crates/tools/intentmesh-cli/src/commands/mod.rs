pub mod allocate;
pub mod config;
pub mod scan;

pub use allocate::{handle_allocate_command, AllocateArgs};
pub use config::{handle_config_command, ConfigCommands};
pub use scan::{handle_scan_command, ScanArgs};
