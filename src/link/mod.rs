//! Radio-link control: transceiver power/mode lines and the register
//! programming handshake.

pub mod command;
pub mod configurator;
pub mod pins;

pub use command::ConfigCommand;
pub use configurator::{LinkConfigurator, LinkError, LinkTimings, MAX_COMMAND_RETRIES};
pub use pins::{ModeLines, Pin, RadioPower};
