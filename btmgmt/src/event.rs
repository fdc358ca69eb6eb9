use std::fmt;

use binrw::{binrw, helpers::until_eof, BinRead, BinWrite};
use fixedstr::str_format;
use log::trace;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::types::{decode_record, encode_record, AdapterSettings, Address, Header, LocalName, HEADER_SIZE};
use crate::{MgmtError, MsgStr, MsgType};

pub mod evcodes {
    pub const COMMAND_COMPLETE: u16 = 0x0001;
    pub const COMMAND_STATUS: u16 = 0x0002;
    pub const CONTROLLER_ERROR: u16 = 0x0003;
    pub const INDEX_ADDED: u16 = 0x0004;
    pub const INDEX_REMOVED: u16 = 0x0005;
    pub const NEW_SETTINGS: u16 = 0x0006;
    pub const CLASS_OF_DEVICE_CHANGED: u16 = 0x0007;
    pub const LOCAL_NAME_CHANGED: u16 = 0x0008;
    pub const NEW_LINK_KEY: u16 = 0x0009;
    pub const NEW_LONG_TERM_KEY: u16 = 0x000a;
    pub const DEVICE_CONNECTED: u16 = 0x000b;
    pub const DEVICE_DISCONNECTED: u16 = 0x000c;
    pub const USER_CONFIRMATION_REQUEST: u16 = 0x000f;
    pub const AUTHENTICATION_FAILED: u16 = 0x0011;
    pub const PASSKEY_NOTIFY: u16 = 0x0017;
    pub const NEW_IDENTITY_RESOLVING_KEY: u16 = 0x0018;
    pub const NEW_SIGNATURE_RESOLVING_KEY: u16 = 0x0019;
    pub const ADVERTISING_ADDED: u16 = 0x0023;
    pub const ADVERTISING_REMOVED: u16 = 0x0024;
}

pub const MIN_EVENT_CODE: u16 = 0x0001;
pub const MAX_EVENT_CODE: u16 = 0x0025;

const UNKNOWN: &str = "Unknown";

const EVENT_NAMES: [&str; MAX_EVENT_CODE as usize + 1] = [
    UNKNOWN,
    "Command Complete",
    "Command Status",
    "Controller Error",
    "Index Added",
    "Index Removed",
    "New Settings",
    "Class Of Device Changed",
    "Local Name Changed",
    "New Link Key",
    "New Long Term Key",
    "Device Connected",
    "Device Disconnected",
    "Connect Failed",
    "PIN Code Request",
    "User Confirmation Request",
    "User Passkey Request",
    "Authentication Failed",
    "Device Found",
    "Discovering",
    "Device Blocked",
    "Device Unblocked",
    "Device Unpaired",
    "Passkey Notify",
    "New Identity Resolving Key",
    "New Signature Resolving Key",
    "Device Added",
    "Device Removed",
    "New Connection Parameter",
    "Unconfigured Index Added",
    "Unconfigured Index Removed",
    "New Configuration Options",
    "Extended Index Added",
    "Extended Index Removed",
    "Local Out Of Band Extended Data Updated",
    "Advertising Added",
    "Advertising Removed",
    "Extended Controller Information Changed",
];

pub fn event_name(code: u16) -> &'static str {
    if !(MIN_EVENT_CODE..=MAX_EVENT_CODE).contains(&code) {
        return UNKNOWN;
    }
    EVENT_NAMES[code as usize]
}

pub const MIN_STATUS_CODE: u8 = 0x00;
pub const MAX_STATUS_CODE: u8 = 0x14;

// mgmt-api.txt, "Status codes"
#[derive(TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum Status {
    Success = 0x00,
    UnknownCommand = 0x01,
    NotConnected = 0x02,
    Failed = 0x03,
    ConnectFailed = 0x04,
    AuthenticationFailed = 0x05,
    NotPaired = 0x06,
    NoResources = 0x07,
    Timeout = 0x08,
    AlreadyConnected = 0x09,
    Busy = 0x0a,
    Rejected = 0x0b,
    NotSupported = 0x0c,
    InvalidParameters = 0x0d,
    Disconnected = 0x0e,
    NotPowered = 0x0f,
    Cancelled = 0x10,
    InvalidIndex = 0x11,
    RfKilled = 0x12,
    AlreadyPaired = 0x13,
    PermissionDenied = 0x14,
}

impl Status {
    pub const fn name(&self) -> &'static str {
        use Status::*;
        match self {
            Success => "Success",
            UnknownCommand => "Unknown Command",
            NotConnected => "Not Connected",
            Failed => "Failed",
            ConnectFailed => "Connect Failed",
            AuthenticationFailed => "Authentication Failed",
            NotPaired => "Not Paired",
            NoResources => "No Resources",
            Timeout => "Timeout",
            AlreadyConnected => "Already Connected",
            Busy => "Busy",
            Rejected => "Rejected",
            NotSupported => "Not Supported",
            InvalidParameters => "Invalid Parameters",
            Disconnected => "Disconnected",
            NotPowered => "Not Powered",
            Cancelled => "Cancelled",
            InvalidIndex => "Invalid Index",
            RfKilled => "RFKilled",
            AlreadyPaired => "Already Paired",
            PermissionDenied => "Permission Denied",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::error::Error for Status {}

pub fn status_name(status: u8) -> &'static str {
    Status::try_from(status).map(|s| s.name()).unwrap_or(UNKNOWN)
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Debug)]
#[brw(little)]
pub struct CommandCompleteEvent {
    pub command_code: u16,
    pub status: u8,
    #[br(parse_with = until_eof)]
    pub parameters: Vec<u8>,
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(little)]
pub struct CommandStatusEvent {
    pub command_code: u16,
    pub status: u8,
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(little)]
pub struct ControllerErrorEvent {
    pub error_code: u8,
}

#[binrw]
#[brw(little)]
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct DeviceConnectedEvent {
    pub address: Address,
    pub address_type: u8,
    pub flags: u32,
    #[bw(calc(eir_data.len() as u16))]
    eir_data_len: u16,
    #[br(count = eir_data_len)]
    pub eir_data: Vec<u8>,
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(little)]
pub struct DeviceDisconnectedEvent {
    pub address: Address,
    pub address_type: u8,
    pub reason: u8,
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(little)]
pub struct AuthenticationFailedEvent {
    pub address: Address,
    pub address_type: u8,
    pub status: u8,
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(little)]
pub struct ClassOfDeviceChangedEvent {
    pub class_of_device: [u8; 3],
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(little)]
pub struct NewLinkKeyEvent {
    pub store_hint: u8,
    pub address: Address,
    pub address_type: u8,
    pub key_type: u8,
    pub value: [u8; 16],
    pub pin_length: u8,
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(little)]
pub struct NewLongTermKeyEvent {
    pub store_hint: u8,
    pub address: Address,
    pub address_type: u8,
    pub key_type: u8,
    pub initiator: u8,
    pub encryption_size: u8,
    pub encrypted_diversifier: u16,
    pub random_number: [u8; 8],
    pub value: [u8; 16],
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(little)]
pub struct NewIdentityResolvingKeyEvent {
    pub store_hint: u8,
    pub random_address: Address,
    pub address: Address,
    pub address_type: u8,
    pub value: [u8; 16],
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(little)]
pub struct NewSignatureResolvingKeyEvent {
    pub store_hint: u8,
    pub address: Address,
    pub address_type: u8,
    pub key_type: u8,
    pub value: [u8; 16],
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(little)]
pub struct PasskeyNotifyEvent {
    pub address: Address,
    pub address_type: u8,
    pub passkey: u32,
    pub entered: u8,
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(little)]
pub struct UserConfirmationRequestEvent {
    pub address: Address,
    pub address_type: u8,
    pub confirm_hint: u8,
    pub value: u32,
}

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(little)]
pub struct AdvertisingInstanceEvent {
    pub instance: u8,
}

#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Event {
    CommandComplete(CommandCompleteEvent),
    CommandStatus(CommandStatusEvent),
    ControllerError(ControllerErrorEvent),
    IndexAdded,
    IndexRemoved,
    NewSettings(AdapterSettings),
    ClassOfDeviceChanged(ClassOfDeviceChangedEvent),
    LocalNameChanged(LocalName),
    NewLinkKey(NewLinkKeyEvent),
    NewLongTermKey(NewLongTermKeyEvent),
    DeviceConnected(DeviceConnectedEvent),
    DeviceDisconnected(DeviceDisconnectedEvent),
    UserConfirmationRequest(UserConfirmationRequestEvent),
    AuthenticationFailed(AuthenticationFailedEvent),
    PasskeyNotify(PasskeyNotifyEvent),
    NewIdentityResolvingKey(NewIdentityResolvingKeyEvent),
    NewSignatureResolvingKey(NewSignatureResolvingKeyEvent),
    AdvertisingAdded(AdvertisingInstanceEvent),
    AdvertisingRemoved(AdvertisingInstanceEvent),
    Unrecognized { code: u16, data: Vec<u8> },
}

impl Event {
    pub fn code(&self) -> u16 {
        use Event::*;
        match self {
            CommandComplete(_) => evcodes::COMMAND_COMPLETE,
            CommandStatus(_) => evcodes::COMMAND_STATUS,
            ControllerError(_) => evcodes::CONTROLLER_ERROR,
            IndexAdded => evcodes::INDEX_ADDED,
            IndexRemoved => evcodes::INDEX_REMOVED,
            NewSettings(_) => evcodes::NEW_SETTINGS,
            ClassOfDeviceChanged(_) => evcodes::CLASS_OF_DEVICE_CHANGED,
            LocalNameChanged(_) => evcodes::LOCAL_NAME_CHANGED,
            NewLinkKey(_) => evcodes::NEW_LINK_KEY,
            NewLongTermKey(_) => evcodes::NEW_LONG_TERM_KEY,
            DeviceConnected(_) => evcodes::DEVICE_CONNECTED,
            DeviceDisconnected(_) => evcodes::DEVICE_DISCONNECTED,
            UserConfirmationRequest(_) => evcodes::USER_CONFIRMATION_REQUEST,
            AuthenticationFailed(_) => evcodes::AUTHENTICATION_FAILED,
            PasskeyNotify(_) => evcodes::PASSKEY_NOTIFY,
            NewIdentityResolvingKey(_) => evcodes::NEW_IDENTITY_RESOLVING_KEY,
            NewSignatureResolvingKey(_) => evcodes::NEW_SIGNATURE_RESOLVING_KEY,
            AdvertisingAdded(_) => evcodes::ADVERTISING_ADDED,
            AdvertisingRemoved(_) => evcodes::ADVERTISING_REMOVED,
            Unrecognized { code, .. } => *code,
        }
    }

    /// Decodes the payload of an event with the given code.
    pub fn decode(code: u16, payload: &[u8]) -> Result<Self, MgmtError> {
        use Event::*;
        let event = match code {
            evcodes::COMMAND_COMPLETE => CommandComplete(decode_record(payload, "command complete")?),
            evcodes::COMMAND_STATUS => CommandStatus(decode_record(payload, "command status")?),
            evcodes::CONTROLLER_ERROR => ControllerError(decode_record(payload, "controller error")?),
            evcodes::INDEX_ADDED => IndexAdded,
            evcodes::INDEX_REMOVED => IndexRemoved,
            evcodes::NEW_SETTINGS => NewSettings(decode_record(payload, "new settings")?),
            evcodes::CLASS_OF_DEVICE_CHANGED => ClassOfDeviceChanged(decode_record(payload, "class of device")?),
            evcodes::LOCAL_NAME_CHANGED => LocalNameChanged(decode_record(payload, "local name")?),
            evcodes::NEW_LINK_KEY => NewLinkKey(decode_record(payload, "new link key")?),
            evcodes::NEW_LONG_TERM_KEY => NewLongTermKey(decode_record(payload, "new long term key")?),
            evcodes::DEVICE_CONNECTED => DeviceConnected(decode_record(payload, "device connected")?),
            evcodes::DEVICE_DISCONNECTED => DeviceDisconnected(decode_record(payload, "device disconnected")?),
            evcodes::USER_CONFIRMATION_REQUEST => UserConfirmationRequest(decode_record(payload, "user confirmation")?),
            evcodes::AUTHENTICATION_FAILED => AuthenticationFailed(decode_record(payload, "authentication failed")?),
            evcodes::PASSKEY_NOTIFY => PasskeyNotify(decode_record(payload, "passkey notify")?),
            evcodes::NEW_IDENTITY_RESOLVING_KEY => NewIdentityResolvingKey(decode_record(payload, "new irk")?),
            evcodes::NEW_SIGNATURE_RESOLVING_KEY => NewSignatureResolvingKey(decode_record(payload, "new csrk")?),
            evcodes::ADVERTISING_ADDED => AdvertisingAdded(decode_record(payload, "advertising added")?),
            evcodes::ADVERTISING_REMOVED => AdvertisingRemoved(decode_record(payload, "advertising removed")?),
            _ => Unrecognized {
                code,
                data: payload.to_vec(),
            },
        };
        Ok(event)
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, MgmtError> {
        use Event::*;
        match self {
            CommandComplete(e) => encode_record(e),
            CommandStatus(e) => encode_record(e),
            ControllerError(e) => encode_record(e),
            IndexAdded | IndexRemoved => Ok(Vec::new()),
            NewSettings(e) => encode_record(e),
            ClassOfDeviceChanged(e) => encode_record(e),
            LocalNameChanged(e) => encode_record(e),
            NewLinkKey(e) => encode_record(e),
            NewLongTermKey(e) => encode_record(e),
            DeviceConnected(e) => encode_record(e),
            DeviceDisconnected(e) => encode_record(e),
            UserConfirmationRequest(e) => encode_record(e),
            AuthenticationFailed(e) => encode_record(e),
            PasskeyNotify(e) => encode_record(e),
            NewIdentityResolvingKey(e) => encode_record(e),
            NewSignatureResolvingKey(e) => encode_record(e),
            AdvertisingAdded(e) | AdvertisingRemoved(e) => encode_record(e),
            Unrecognized { data, .. } => Ok(data.clone()),
        }
    }
}

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct EventFrame {
    pub header: Header,
    pub event: Event,
}

impl EventFrame {
    pub fn new(controller_index: u16, event: Event) -> Result<Self, MgmtError> {
        let size = event.encode_payload()?.len();
        let data_size = u16::try_from(size).map_err(|_| {
            MgmtError::InvalidParameter(MsgType(str_format!(MsgStr, "event payload of {} bytes", size)))
        })?;
        Ok(Self {
            header: Header {
                code: event.code(),
                controller_index,
                data_size,
            },
            event,
        })
    }

    /// Decodes one frame: the header first, then the payload selected by its code.
    pub fn decode(bytes: &[u8]) -> Result<Self, MgmtError> {
        let header = Header::decode(bytes)?;
        let total = HEADER_SIZE + header.data_size as usize;
        if bytes.len() < total {
            return Err(MgmtError::MalformedFrame(MsgType(str_format!(
                MsgStr,
                "{} frame: {} of {} bytes",
                event_name(header.code),
                bytes.len(),
                total
            ))));
        }
        if bytes.len() > total {
            trace!("ignoring {} trailing bytes after {}", bytes.len() - total, event_name(header.code));
        }

        let event = Event::decode(header.code, &bytes[HEADER_SIZE..total])?;
        Ok(Self { header, event })
    }

    pub fn encode(&self) -> Result<Vec<u8>, MgmtError> {
        let payload = self.event.encode_payload()?;
        let header = Header {
            data_size: payload.len() as u16,
            ..self.header
        };
        let mut bytes = encode_record(&header)?;
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }
}
