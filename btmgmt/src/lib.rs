//! Bluetooth Management protocol engine.
//!
//! Talks to the Linux kernel's management control channel to bring a
//! controller up as an LE peripheral: powering it, toggling its state
//! flags, naming it and installing custom advertising data.
//!
//! The crate is layered bottom-up:
//! * [`types`], [`command`], [`event`] and [`buffer`] form the wire codec,
//! * [`transport`] owns the socket,
//! * [`adapter`] is the engine that correlates replies and caches state,
//! * [`mgmt`] holds the management operations on one controller.

use std::fmt;

use fixedstr::str64;
use thiserror::Error;

pub mod adapter;
pub mod buffer;
pub mod command;
pub mod config;
pub mod diag;
pub mod event;
pub mod mgmt;
pub mod transport;
pub mod types;

pub use adapter::{Ack, Adapter, NotifyData, StateNotifier};
pub use buffer::AdData;
pub use command::{opcodes, CommandPacket, DiscoverableMode, SecureConnectionsMode};
pub use config::{AdapterConfig, AdvertisingConfig};
pub use event::{evcodes, Event, EventFrame, Status};
pub use mgmt::Mgmt;
pub use transport::{MgmtSocket, Transport};
pub use types::{
    AdapterSettings, Address, AdvertisingFeatures, AdvertisingSettings, ControllerInformation, Header, LocalName,
    VersionInformation,
};

/// Upper bound on the wait for a command's completion.
pub const COMMAND_TIMEOUT_MILLIS: u64 = 1000;

/// Controller index for commands that address no particular controller.
pub const NON_CONTROLLER: u16 = 0xffff;

pub const DEFAULT_CONTROLLER_INDEX: u16 = 0;

pub type MsgStr = str64;
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgType(pub MsgStr);

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Failure of a single command round trip.
#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum CommandError {
    #[error("command {code:#06x} timed out")]
    Timeout { code: u16 },
    #[error("command {code:#06x} rejected with status {status:#04x}")]
    ControllerRejected { code: u16, status: u8 },
    #[error("link lost while waiting for command {code:#06x}")]
    LinkLost { code: u16 },
}

impl CommandError {
    pub fn code(&self) -> u16 {
        match self {
            CommandError::Timeout { code }
            | CommandError::ControllerRejected { code, .. }
            | CommandError::LinkLost { code } => *code,
        }
    }
}

/// Ordered steps of advertising configuration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AdvertisingStep {
    DisableAdvertising,
    ReadFeatures,
    RemoveInstance(u8),
    BuildPayload,
    AddInstance,
}

impl fmt::Display for AdvertisingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvertisingStep::DisableAdvertising => write!(f, "disable advertising"),
            AdvertisingStep::ReadFeatures => write!(f, "read advertising features"),
            AdvertisingStep::RemoveInstance(instance) => write!(f, "remove advertising instance {}", instance),
            AdvertisingStep::BuildPayload => write!(f, "build advertising payload"),
            AdvertisingStep::AddInstance => write!(f, "add advertising instance"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MgmtError {
    #[error("Transport Error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("Not Connected")]
    NotConnected,
    #[error("Malformed Frame: {0}")]
    MalformedFrame(MsgType),
    #[error("Invalid Parameter: {0}")]
    InvalidParameter(MsgType),
    #[error("Command Error: {0}")]
    Command(#[from] CommandError),
    #[error("Advertising configuration failed at '{step}'")]
    Configuration {
        step: AdvertisingStep,
        #[source]
        source: Box<MgmtError>,
    },
}

impl MgmtError {
    /// The command failure behind this error, looking through configuration steps.
    pub fn command_error(&self) -> Option<CommandError> {
        match self {
            MgmtError::Command(e) => Some(*e),
            MgmtError::Configuration { source, .. } => source.command_error(),
            _ => None,
        }
    }
}
