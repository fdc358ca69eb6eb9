//! Human-readable rendering of frames and records for logs.

use std::fmt::{self, Write};

use crate::command::{command_name, CommandPacket};
use crate::event::{event_name, status_name, Event, EventFrame};
use crate::types::{
    AdapterSettings, Address, AdvertisingFeatures, AdvertisingSettings, ControllerInformation, Header, LocalName,
    VersionInformation,
};

const ADAPTER_SETTING_LABELS: [(u32, &str); 16] = [
    (AdapterSettings::POWERED, "Powered"),
    (AdapterSettings::CONNECTABLE, "Connectable"),
    (AdapterSettings::FAST_CONNECTABLE, "FC"),
    (AdapterSettings::DISCOVERABLE, "Discov"),
    (AdapterSettings::BONDABLE, "Bondable"),
    (AdapterSettings::LINK_LEVEL_SECURITY, "LLS"),
    (AdapterSettings::SECURE_SIMPLE_PAIRING, "SSP"),
    (AdapterSettings::BREDR, "BR/EDR"),
    (AdapterSettings::HIGH_SPEED, "HS"),
    (AdapterSettings::LOW_ENERGY, "LE"),
    (AdapterSettings::ADVERTISING, "Adv"),
    (AdapterSettings::SECURE_CONNECTIONS, "SC"),
    (AdapterSettings::DEBUG_KEYS, "DebugKeys"),
    (AdapterSettings::PRIVACY, "Privacy"),
    (AdapterSettings::CONTROLLER_CONFIGURATION, "ControllerConfig"),
    (AdapterSettings::STATIC_ADDRESS, "StaticAddr"),
];

const ADVERTISING_SETTING_LABELS: [(u32, &str); 10] = [
    (AdvertisingSettings::SWITCH_CONNECTABLE, "Switch into Connectable"),
    (AdvertisingSettings::DISCOVERABLE, "Disc"),
    (AdvertisingSettings::LIMITED_DISCOVERABLE, "Limited Disc"),
    (AdvertisingSettings::ADD_FLAGS, "Add Flags"),
    (AdvertisingSettings::ADD_TX_POWER, "Add TX"),
    (AdvertisingSettings::ADD_APPEARANCE, "Add Appearance"),
    (AdvertisingSettings::ADD_LOCAL_NAME, "Add Local Name"),
    (AdvertisingSettings::SECONDARY_LE_1M, "LE1M"),
    (AdvertisingSettings::SECONDARY_LE_2M, "LE2M"),
    (AdvertisingSettings::SECONDARY_LE_CODED, "LECoded"),
];

// Major service classes, assigned numbers "Class of Device"
const MAJOR_SERVICE_CLASSES: [(u32, &str); 9] = [
    (1 << 13, "Limited Discoverable Mode"),
    (1 << 16, "Positioning"),
    (1 << 17, "Networking"),
    (1 << 18, "Rendering"),
    (1 << 19, "Capturing"),
    (1 << 20, "Object Transfer"),
    (1 << 21, "Audio"),
    (1 << 22, "Telephony"),
    (1 << 23, "Information"),
];

fn join_labels(bits: u32, labels: &[(u32, &str)]) -> String {
    labels
        .iter()
        .filter(|(mask, _)| bits & mask != 0)
        .map(|(_, label)| *label)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Comma separated names of the set flags, e.g. `"Powered, LE, Adv"`.
pub fn settings_string(settings: &AdapterSettings) -> String {
    join_labels(settings.bits(), &ADAPTER_SETTING_LABELS)
}

pub fn advertising_settings_string(settings: &AdvertisingSettings) -> String {
    join_labels(settings.bits(), &ADVERTISING_SETTING_LABELS)
}

fn major_device_class(major: u32) -> Option<&'static str> {
    let name = match major {
        0x00 => "Miscellaneous",
        0x01 => "Computer",
        0x02 => "Phone",
        0x03 => "Lan/Network Access Point",
        0x04 => "Audio/Video",
        0x05 => "Peripheral",
        0x06 => "Imaging",
        0x07 => "Wearable",
        0x08 => "Toy",
        0x09 => "Health",
        0x1f => "Uncategorized",
        _ => return None,
    };
    Some(name)
}

fn computer_minor_class(minor: u32) -> Option<&'static str> {
    let name = match minor {
        0x00 => "Uncategorized",
        0x01 => "Desktop Workstation",
        0x02 => "Server-class computer",
        0x03 => "Laptop",
        0x04 => "Handheld PC/PDA",
        0x05 => "Palm-size PC/PDA",
        0x06 => "Wearable computer",
        0x07 => "Tablet",
        _ => return None,
    };
    Some(name)
}

fn audio_video_minor_class(minor: u32) -> Option<&'static str> {
    let name = match minor {
        0x00 => "Uncategorized",
        0x01 => "Wearable Headset Device",
        0x02 => "Hands-free Device",
        0x04 => "Microphone",
        0x05 => "Loudspeaker",
        0x06 => "Headphones",
        0x07 => "Portable Audio",
        0x08 => "Car Audio",
        0x09 => "Set-top box",
        0x0a => "HiFi Audio Device",
        0x0b => "VCR",
        0x0c => "Video Camera",
        0x0d => "Camcorder",
        0x0e => "Video Monitor",
        0x0f => "Video Display and Loudspeaker",
        0x10 => "Video Conferencing",
        0x12 => "Gaming/Toy",
        _ => return None,
    };
    Some(name)
}

/// Decodes a class of device given in wire order (least significant byte first).
///
/// Only format #1 is broken down into service and device classes; any other
/// format is shown as raw hex.
pub fn class_of_device_string(class_of_device: &[u8; 3]) -> String {
    let bits = u32::from_le_bytes([class_of_device[0], class_of_device[1], class_of_device[2], 0]);
    if bits & 0x03 != 0 {
        return format!("CoD data {:#08x}", bits);
    }

    let major = (bits & 0x1f00) >> 8;
    let minor = (bits & 0xfc) >> 2;
    let mut text = format!("Format #1; Service: {}", join_labels(bits, &MAJOR_SERVICE_CLASSES));

    match major_device_class(major) {
        Some(name) => {
            let _ = write!(text, "; Device: {}", name);
        }
        None => {
            let _ = write!(text, "; Device: reserved {:#04x}", major);
        }
    }

    let minor_name = match major {
        0x01 => computer_minor_class(minor),
        0x04 => audio_video_minor_class(minor),
        _ => None,
    };
    match minor_name {
        Some(name) => {
            let _ = write!(text, " ({})", name);
        }
        None => {
            let _ = write!(text, " (minor {:#04x})", minor);
        }
    }
    text
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}", b[5], b[4], b[3], b[2], b[1], b[0])
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// One-line diagnostic rendering, kept apart from the records themselves.
pub trait Describe {
    fn describe(&self) -> String;
}

impl Describe for Header {
    fn describe(&self) -> String {
        format!(
            "code {:#06x}, controller {:#06x}, {} bytes",
            self.code, self.controller_index, self.data_size
        )
    }
}

impl Describe for AdapterSettings {
    fn describe(&self) -> String {
        format!("settings [{}]", settings_string(self))
    }
}

impl Describe for VersionInformation {
    fn describe(&self) -> String {
        format!("mgmt version {}.{}", self.version, self.revision)
    }
}

impl Describe for LocalName {
    fn describe(&self) -> String {
        format!("name '{}', short name '{}'", self.name(), self.short_name())
    }
}

impl Describe for ControllerInformation {
    fn describe(&self) -> String {
        format!(
            "controller {} (BT version {}, manufacturer {:#06x}), supported [{}], current [{}], {}, name '{}', short name '{}'",
            self.address,
            self.bluetooth_version,
            self.manufacturer,
            settings_string(&self.supported_settings),
            settings_string(&self.current_settings),
            class_of_device_string(&self.class_of_device),
            self.name(),
            self.short_name()
        )
    }
}

impl Describe for AdvertisingFeatures {
    fn describe(&self) -> String {
        format!(
            "advertising features [{}], max adv {}, max scan rsp {}, instances {}/{} {:?}",
            advertising_settings_string(&self.supported_flags),
            self.max_adv_data_len,
            self.max_scan_rsp_len,
            self.num_instances(),
            self.max_instances,
            self.instances.as_slice()
        )
    }
}

impl Describe for CommandPacket {
    fn describe(&self) -> String {
        let head = format!("{} ({:#06x}) to {:#06x}", command_name(self.opcode()), self.opcode(), self.controller());
        match self {
            CommandPacket::NoParameters { .. } => head,
            CommandPacket::SetState { state, .. } => format!("{}: state {}", head, state),
            CommandPacket::SetDiscoverable { mode, timeout, .. } => {
                format!("{}: {:?}, timeout {}s", head, mode, timeout)
            }
            CommandPacket::SetLocalName { name, .. } => format!("{}: {}", head, name.describe()),
            CommandPacket::AddAdvertising {
                instance,
                flags,
                duration,
                timeout,
                adv_data,
                scan_rsp,
                ..
            } => format!(
                "{}: instance {}, flags [{}], duration {}, timeout {}, adv {}, scan rsp {}",
                head,
                instance,
                advertising_settings_string(flags),
                duration,
                timeout,
                hex(adv_data),
                hex(scan_rsp)
            ),
            CommandPacket::RemoveAdvertising { instance, .. } => format!("{}: instance {}", head, instance),
        }
    }
}

impl Describe for Event {
    fn describe(&self) -> String {
        let name = event_name(self.code());
        match self {
            Event::CommandComplete(e) => format!(
                "{}: {} ({:#06x}) -> {}, {} parameter bytes",
                name,
                command_name(e.command_code),
                e.command_code,
                status_name(e.status),
                e.parameters.len()
            ),
            Event::CommandStatus(e) => format!(
                "{}: {} ({:#06x}) -> {}",
                name,
                command_name(e.command_code),
                e.command_code,
                status_name(e.status)
            ),
            Event::ControllerError(e) => format!("{}: code {:#04x}", name, e.error_code),
            Event::IndexAdded | Event::IndexRemoved => name.to_string(),
            Event::NewSettings(s) => format!("{}: [{}]", name, settings_string(s)),
            Event::ClassOfDeviceChanged(e) => format!("{}: {}", name, class_of_device_string(&e.class_of_device)),
            Event::LocalNameChanged(n) => format!("{}: {}", name, n.describe()),
            Event::NewLinkKey(e) => format!("{}: {} type {}, key type {}", name, e.address, e.address_type, e.key_type),
            Event::NewLongTermKey(e) => format!(
                "{}: {} type {}, key type {}, enc size {}",
                name, e.address, e.address_type, e.key_type, e.encryption_size
            ),
            Event::DeviceConnected(e) => format!(
                "{}: {} type {}, flags {:#010x}, eir {}",
                name,
                e.address,
                e.address_type,
                e.flags,
                hex(&e.eir_data)
            ),
            Event::DeviceDisconnected(e) => {
                format!("{}: {} type {}, reason {:#04x}", name, e.address, e.address_type, e.reason)
            }
            Event::UserConfirmationRequest(e) => format!(
                "{}: {} type {}, hint {}, value {}",
                name, e.address, e.address_type, e.confirm_hint, e.value
            ),
            Event::AuthenticationFailed(e) => format!(
                "{}: {} type {}, {}",
                name,
                e.address,
                e.address_type,
                status_name(e.status)
            ),
            Event::PasskeyNotify(e) => format!(
                "{}: {} type {}, passkey {:06}, entered {}",
                name, e.address, e.address_type, e.passkey, e.entered
            ),
            Event::NewIdentityResolvingKey(e) => {
                format!("{}: {} type {}, rpa {}", name, e.address, e.address_type, e.random_address)
            }
            Event::NewSignatureResolvingKey(e) => {
                format!("{}: {} type {}, key type {}", name, e.address, e.address_type, e.key_type)
            }
            Event::AdvertisingAdded(e) | Event::AdvertisingRemoved(e) => {
                format!("{}: instance {}", name, e.instance)
            }
            Event::Unrecognized { code, data } => format!("{} event {:#06x}: {}", name, code, hex(data)),
        }
    }
}

impl Describe for EventFrame {
    fn describe(&self) -> String {
        format!("[{:#06x}] {}", self.header.controller_index, self.event.describe())
    }
}
