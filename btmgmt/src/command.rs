use binrw::{binrw, BinRead, BinWrite};
use fixedstr::str_format;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::types::{
    decode_record, encode_record, parse_vec, AdDataBuffer, AdvertisingSettings, Header, LocalName,
    HEADER_SIZE, NAME_BUFFER_SIZE, SHORT_NAME_BUFFER_SIZE,
};
use crate::{MgmtError, MsgStr, MsgType};

pub mod opcodes {
    pub const READ_VERSION_INFORMATION: u16 = 0x0001;
    pub const READ_SUPPORTED_COMMANDS: u16 = 0x0002;
    pub const READ_CONTROLLER_INDEX_LIST: u16 = 0x0003;
    pub const READ_CONTROLLER_INFORMATION: u16 = 0x0004;
    pub const SET_POWERED: u16 = 0x0005;
    pub const SET_DISCOVERABLE: u16 = 0x0006;
    pub const SET_CONNECTABLE: u16 = 0x0007;
    pub const SET_FAST_CONNECTABLE: u16 = 0x0008;
    pub const SET_BONDABLE: u16 = 0x0009;
    pub const SET_LINK_SECURITY: u16 = 0x000a;
    pub const SET_SECURE_SIMPLE_PAIRING: u16 = 0x000b;
    pub const SET_HIGH_SPEED: u16 = 0x000c;
    pub const SET_LOW_ENERGY: u16 = 0x000d;
    pub const SET_LOCAL_NAME: u16 = 0x000f;
    pub const SET_ADVERTISING: u16 = 0x0029;
    pub const SET_BREDR: u16 = 0x002a;
    pub const SET_SECURE_CONNECTIONS: u16 = 0x002d;
    pub const READ_ADVERTISING_FEATURES: u16 = 0x003d;
    pub const ADD_ADVERTISING: u16 = 0x003e;
    pub const REMOVE_ADVERTISING: u16 = 0x003f;
}

pub const MIN_COMMAND_CODE: u16 = 0x0001;
pub const MAX_COMMAND_CODE: u16 = 0x0043;

const UNKNOWN: &str = "Unknown";

const COMMAND_NAMES: [&str; MAX_COMMAND_CODE as usize + 1] = [
    UNKNOWN,
    "Read Management Version Information",
    "Read Management Supported Commands",
    "Read Controller Index List",
    "Read Controller Information",
    "Set Powered",
    "Set Discoverable",
    "Set Connectable",
    "Set Fast Connectable",
    "Set Bondable",
    "Set Link Security",
    "Set Secure Simple Pairing",
    "Set High Speed",
    "Set Low Energy",
    "Set Device Class",
    "Set Local Name",
    "Add UUID",
    "Remove UUID",
    "Load Link Keys",
    "Load Long Term Keys",
    "Disconnect",
    "Get Connections",
    "PIN Code Reply",
    "PIN Code Negative Reply",
    "Set IO Capability",
    "Pair Device",
    "Cancel Pair Device",
    "Unpair Device",
    "User Confirmation Reply",
    "User Confirmation Negative Reply",
    "User Passkey Reply",
    "User Passkey Negative Reply",
    "Read Local Out Of Band Data",
    "Add Remote Out Of Band Data",
    "Remove Remote Out Of Band Data",
    "Start Discovery",
    "Stop Discovery",
    "Confirm Name",
    "Block Device",
    "Unblock Device",
    "Set Device ID",
    "Set Advertising",
    "Set BR/EDR",
    "Set Static Address",
    "Set Scan Parameters",
    "Set Secure Connections",
    "Set Debug Keys",
    "Set Privacy",
    "Load Identity Resolving Keys",
    "Get Connection Information",
    "Get Clock Information",
    "Add Device",
    "Remove Device",
    "Load Connection Parameters",
    "Read Unconfigured Controller Index List",
    "Read Controller Configuration Information",
    "Set External Configuration",
    "Set Public Address",
    "Start Service Discovery",
    "Read Local Out Of Band Extended Data",
    "Read Extended Controller Index List",
    "Read Advertising Features",
    "Add Advertising",
    "Remove Advertising",
    "Get Advertising Size Information",
    "Start Limited Discovery",
    "Read Extended Controller Information",
    "Set Appearance",
];

pub fn command_name(code: u16) -> &'static str {
    if !(MIN_COMMAND_CODE..=MAX_COMMAND_CODE).contains(&code) {
        return UNKNOWN;
    }
    COMMAND_NAMES[code as usize]
}

/// Commands sent without parameters.
pub const NO_PARAMETER_COMMANDS: [u16; 4] = [
    opcodes::READ_VERSION_INFORMATION,
    opcodes::READ_CONTROLLER_INDEX_LIST,
    opcodes::READ_CONTROLLER_INFORMATION,
    opcodes::READ_ADVERTISING_FEATURES,
];

/// Commands carrying a single state byte and answered with the current settings.
pub const STATE_COMMANDS: [u16; 12] = [
    opcodes::SET_POWERED,
    opcodes::SET_CONNECTABLE,
    opcodes::SET_FAST_CONNECTABLE,
    opcodes::SET_BONDABLE,
    opcodes::SET_LINK_SECURITY,
    opcodes::SET_SECURE_SIMPLE_PAIRING,
    opcodes::SET_HIGH_SPEED,
    opcodes::SET_LOW_ENERGY,
    opcodes::SET_ADVERTISING,
    opcodes::SET_BREDR,
    opcodes::SET_SECURE_CONNECTIONS,
    opcodes::SET_DISCOVERABLE,
];

/// Instance, flags, duration, timeout and the two length bytes.
pub const ADD_ADVERTISING_FIXED_SIZE: usize = 11;

#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(repr(u8))]
pub enum DiscoverableMode {
    Disabled = 0x00,
    General = 0x01,
    Limited = 0x02,
}

#[derive(TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum SecureConnectionsMode {
    Disabled = 0x00,
    Enabled = 0x01,
    Only = 0x02,
}

#[binrw::parser(reader, endian)]
fn parse_ad_data(count: u8) -> binrw::BinResult<AdDataBuffer> {
    parse_vec(count as usize, reader, endian)
}

#[binrw]
#[brw(little)]
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum CommandPacket {
    NoParameters {
        #[br(assert(NO_PARAMETER_COMMANDS.contains(&code), "code({:#06x}) takes parameters", code))]
        code: u16,
        controller: u16,

        #[bw(calc(0u16))]
        #[br(assert(len == 0, "len({}) != 0", len))]
        len: u16,
    },

    SetState {
        #[br(assert(STATE_COMMANDS.contains(&code) && code != opcodes::SET_DISCOVERABLE, "code({:#06x}) is not a state command", code))]
        code: u16,
        controller: u16,

        #[bw(calc(1u16))]
        #[br(assert(len == 1, "len({}) != 1", len))]
        len: u16,
        state: u8,
    },

    SetDiscoverable {
        #[bw(calc(opcodes::SET_DISCOVERABLE))]
        #[br(assert(code == opcodes::SET_DISCOVERABLE))]
        code: u16,
        controller: u16,

        #[bw(calc(3u16))]
        #[br(assert(len == 3, "len({}) != 3", len))]
        len: u16,
        mode: DiscoverableMode,
        timeout: u16,
    },

    SetLocalName {
        #[bw(calc(opcodes::SET_LOCAL_NAME))]
        #[br(assert(code == opcodes::SET_LOCAL_NAME))]
        code: u16,
        controller: u16,

        #[bw(calc((NAME_BUFFER_SIZE + SHORT_NAME_BUFFER_SIZE) as u16))]
        #[br(assert(len as usize == NAME_BUFFER_SIZE + SHORT_NAME_BUFFER_SIZE, "len({}) != 260", len))]
        len: u16,
        name: LocalName,
    },

    #[br(assert(len as usize == ADD_ADVERTISING_FIXED_SIZE + adv_data.len() + scan_rsp.len(), "len({}) does not match payload", len))]
    AddAdvertising {
        #[bw(calc(opcodes::ADD_ADVERTISING))]
        #[br(assert(code == opcodes::ADD_ADVERTISING))]
        code: u16,
        controller: u16,

        #[bw(calc((ADD_ADVERTISING_FIXED_SIZE + adv_data.len() + scan_rsp.len()) as u16))]
        len: u16,
        instance: u8,
        flags: AdvertisingSettings,
        duration: u16,
        timeout: u16,
        #[bw(calc(adv_data.len() as u8))]
        adv_data_len: u8,
        #[bw(calc(scan_rsp.len() as u8))]
        scan_rsp_len: u8,
        #[br(parse_with = parse_ad_data, args(adv_data_len))]
        #[bw(map = |x| x.as_slice())]
        adv_data: AdDataBuffer,
        #[br(parse_with = parse_ad_data, args(scan_rsp_len))]
        #[bw(map = |x| x.as_slice())]
        scan_rsp: AdDataBuffer,
    },

    RemoveAdvertising {
        #[bw(calc(opcodes::REMOVE_ADVERTISING))]
        #[br(assert(code == opcodes::REMOVE_ADVERTISING))]
        code: u16,
        controller: u16,

        #[bw(calc(1u16))]
        #[br(assert(len == 1, "len({}) != 1", len))]
        len: u16,
        instance: u8,
    },
}

impl CommandPacket {
    pub fn encode(&self) -> Result<Vec<u8>, MgmtError> {
        encode_record(self)
    }

    /// Decodes one complete command frame; trailing bytes beyond `data_size` are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, MgmtError> {
        let header = Header::decode(bytes)?;
        let total = HEADER_SIZE + header.data_size as usize;
        if bytes.len() != total {
            return Err(MgmtError::MalformedFrame(MsgType(str_format!(
                MsgStr,
                "command frame is {} bytes, header says {}",
                bytes.len(),
                total
            ))));
        }
        decode_record(bytes, "command frame")
    }

    pub fn opcode(&self) -> u16 {
        use CommandPacket::*;
        match self {
            NoParameters { code, .. } => *code,
            SetState { code, .. } => *code,
            SetDiscoverable { .. } => opcodes::SET_DISCOVERABLE,
            SetLocalName { .. } => opcodes::SET_LOCAL_NAME,
            AddAdvertising { .. } => opcodes::ADD_ADVERTISING,
            RemoveAdvertising { .. } => opcodes::REMOVE_ADVERTISING,
        }
    }

    pub fn controller(&self) -> u16 {
        use CommandPacket::*;
        match self {
            NoParameters { controller, .. }
            | SetState { controller, .. }
            | SetDiscoverable { controller, .. }
            | SetLocalName { controller, .. }
            | AddAdvertising { controller, .. }
            | RemoveAdvertising { controller, .. } => *controller,
        }
    }

    pub fn data_size(&self) -> usize {
        use CommandPacket::*;
        match self {
            NoParameters { .. } => 0,
            SetState { .. } | RemoveAdvertising { .. } => 1,
            SetDiscoverable { .. } => 3,
            SetLocalName { .. } => NAME_BUFFER_SIZE + SHORT_NAME_BUFFER_SIZE,
            AddAdvertising { adv_data, scan_rsp, .. } => ADD_ADVERTISING_FIXED_SIZE + adv_data.len() + scan_rsp.len(),
        }
    }

    pub fn header(&self) -> Header {
        Header {
            code: self.opcode(),
            controller_index: self.controller(),
            data_size: self.data_size() as u16,
        }
    }
}
