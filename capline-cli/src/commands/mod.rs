//! Subcommand implementations.

pub mod devices;
pub mod play;
pub mod record;

pub use devices::CmdDevices;
pub use play::CmdPlay;
pub use record::CmdRecord;
