//! Engine and advertising configuration

use std::time::Duration;

use crate::types::FRAME_MAX_SIZE;
use crate::COMMAND_TIMEOUT_MILLIS;

/// Configuration for the protocol engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Maximum time to wait for a command's completion
    pub command_timeout: Duration,
    /// Size of the buffer one inbound frame is read into
    pub receive_buffer_size: usize,
    /// Name of the event loop thread
    pub event_thread_name: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(COMMAND_TIMEOUT_MILLIS),
            receive_buffer_size: FRAME_MAX_SIZE,
            event_thread_name: "btmgmt-events".to_string(),
        }
    }
}

impl AdapterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    pub fn with_event_thread_name(mut self, name: impl Into<String>) -> Self {
        self.event_thread_name = name.into();
        self
    }
}

/// Default custom service, `8e7934bd-f06d-48f6-8604-83c94e0ec8f9`.
pub const DEFAULT_SERVICE_UUID: u128 = 0x8e7934bd_f06d_48f6_8604_83c94e0ec8f9;

/// Rendering and Object Transfer services, Audio/Video device, Car Audio.
pub const DEFAULT_CLASS_OF_DEVICE: [u8; 3] = [0x20, 0x04, 0x14];

/// What the installed advertising instance carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingConfig {
    /// Instance slot the payload is installed in
    pub instance: u8,
    /// Service listed in the scan response
    pub service_uuid: u128,
    /// Class of device value advertised, in AD byte order
    pub class_of_device: [u8; 3],
    /// Seconds per rotation slot, 0 for the controller default
    pub duration: u16,
    /// Seconds until the instance expires, 0 for never
    pub timeout: u16,
}

impl Default for AdvertisingConfig {
    fn default() -> Self {
        Self {
            instance: 1,
            service_uuid: DEFAULT_SERVICE_UUID,
            class_of_device: DEFAULT_CLASS_OF_DEVICE,
            duration: 0,
            timeout: 0,
        }
    }
}

impl AdvertisingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(mut self, instance: u8) -> Self {
        self.instance = instance;
        self
    }

    pub fn with_service_uuid(mut self, uuid: u128) -> Self {
        self.service_uuid = uuid;
        self
    }

    pub fn with_class_of_device(mut self, class_of_device: [u8; 3]) -> Self {
        self.class_of_device = class_of_device;
        self
    }

    pub fn with_duration(mut self, seconds: u16) -> Self {
        self.duration = seconds;
        self
    }

    pub fn with_timeout(mut self, seconds: u16) -> Self {
        self.timeout = seconds;
        self
    }
}
