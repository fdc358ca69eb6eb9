use heapless::Vec;
use binrw::{binrw, io::{Cursor, Read, Seek}, BinRead, BinResult, BinWrite, Endian};
use fixedstr::str_format;
use log::warn;
use modular_bitfield::{bitfield, prelude::*};

use crate::{MgmtError, MsgStr, MsgType};

pub const HEADER_SIZE: usize = 6;
pub const FRAME_MAX_SIZE: usize = HEADER_SIZE + u16::MAX as usize;

pub const MAX_NAME_LENGTH: usize = 248;
pub const MAX_SHORT_NAME_LENGTH: usize = 10;
pub const NAME_BUFFER_SIZE: usize = MAX_NAME_LENGTH + 1;
pub const SHORT_NAME_BUFFER_SIZE: usize = MAX_SHORT_NAME_LENGTH + 1;

pub const AD_DATA_MAX_SIZE: usize = 31;
pub type AdDataBuffer = Vec<u8, AD_DATA_MAX_SIZE>;

pub const MAX_ADV_INSTANCES: usize = 16;
pub type InstanceBuffer = Vec<u8, MAX_ADV_INSTANCES>;

pub const CONTROLLER_INFORMATION_SIZE: usize = 280;

/// Common header of every command and event frame.
#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[brw(little)]
pub struct Header {
    pub code: u16,
    pub controller_index: u16,
    pub data_size: u16,
}

impl Header {
    pub fn decode(bytes: &[u8]) -> Result<Self, MgmtError> {
        if bytes.len() < HEADER_SIZE {
            return Err(MgmtError::MalformedFrame(MsgType(str_format!(
                MsgStr,
                "{} bytes is shorter than a header",
                bytes.len()
            ))));
        }
        decode_record(&bytes[..HEADER_SIZE], "header")
    }
}

/// Bluetooth device address, least significant byte first as on the wire.
#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug, Default, Hash)]
pub struct Address(pub [u8; 6]);

/// Controller settings word, shared by the supported and current settings.
#[bitfield]
#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[br(map = Self::from_bytes)]
#[bw(map = |&x| Self::into_bytes(x))]
pub struct AdapterSettings {
    pub powered: bool,
    pub connectable: bool,
    pub fast_connectable: bool,
    pub discoverable: bool,
    pub bondable: bool,
    pub link_level_security: bool,
    pub secure_simple_pairing: bool,
    pub bredr: bool,
    pub high_speed: bool,
    pub low_energy: bool,
    pub advertising: bool,
    pub secure_connections: bool,
    pub debug_keys: bool,
    pub privacy: bool,
    pub controller_configuration: bool,
    pub static_address: bool,
    #[skip]
    __: B16,
}

impl AdapterSettings {
    pub const POWERED: u32 = 1 << 0;
    pub const CONNECTABLE: u32 = 1 << 1;
    pub const FAST_CONNECTABLE: u32 = 1 << 2;
    pub const DISCOVERABLE: u32 = 1 << 3;
    pub const BONDABLE: u32 = 1 << 4;
    pub const LINK_LEVEL_SECURITY: u32 = 1 << 5;
    pub const SECURE_SIMPLE_PAIRING: u32 = 1 << 6;
    pub const BREDR: u32 = 1 << 7;
    pub const HIGH_SPEED: u32 = 1 << 8;
    pub const LOW_ENERGY: u32 = 1 << 9;
    pub const ADVERTISING: u32 = 1 << 10;
    pub const SECURE_CONNECTIONS: u32 = 1 << 11;
    pub const DEBUG_KEYS: u32 = 1 << 12;
    pub const PRIVACY: u32 = 1 << 13;
    pub const CONTROLLER_CONFIGURATION: u32 = 1 << 14;
    pub const STATIC_ADDRESS: u32 = 1 << 15;

    pub fn from_bits(bits: u32) -> Self {
        Self::from_bytes(bits.to_le_bytes())
    }

    pub fn bits(&self) -> u32 {
        u32::from_le_bytes(self.into_bytes())
    }

    pub fn is_set(&self, mask: u32) -> bool {
        self.bits() & mask != 0
    }
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Advertising flags word: reported as capability by Read Advertising
/// Features and sent as the requested subset by Add Advertising.
#[bitfield]
#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug)]
#[br(map = Self::from_bytes)]
#[bw(map = |&x| Self::into_bytes(x))]
pub struct AdvertisingSettings {
    pub switch_connectable: bool,
    pub discoverable: bool,
    pub limited_discoverable: bool,
    pub add_flags: bool,
    pub add_tx_power: bool,
    pub add_appearance: bool,
    pub add_local_name: bool,
    pub secondary_le_1m: bool,
    pub secondary_le_2m: bool,
    pub secondary_le_coded: bool,
    #[skip]
    __: B22,
}

impl AdvertisingSettings {
    pub const SWITCH_CONNECTABLE: u32 = 1 << 0;
    pub const DISCOVERABLE: u32 = 1 << 1;
    pub const LIMITED_DISCOVERABLE: u32 = 1 << 2;
    pub const ADD_FLAGS: u32 = 1 << 3;
    pub const ADD_TX_POWER: u32 = 1 << 4;
    pub const ADD_APPEARANCE: u32 = 1 << 5;
    pub const ADD_LOCAL_NAME: u32 = 1 << 6;
    pub const SECONDARY_LE_1M: u32 = 1 << 7;
    pub const SECONDARY_LE_2M: u32 = 1 << 8;
    pub const SECONDARY_LE_CODED: u32 = 1 << 9;

    pub fn from_bits(bits: u32) -> Self {
        Self::from_bytes(bits.to_le_bytes())
    }

    pub fn bits(&self) -> u32 {
        u32::from_le_bytes(self.into_bytes())
    }

    pub fn is_set(&self, mask: u32) -> bool {
        self.bits() & mask != 0
    }

    /// Keeps only the flags also present in `supported`.
    pub fn masked(&self, supported: AdvertisingSettings) -> Self {
        Self::from_bits(self.bits() & supported.bits())
    }
}

impl Default for AdvertisingSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Return parameters of Read Controller Information.
#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Debug)]
#[brw(little)]
pub struct ControllerInformation {
    pub address: Address,
    pub bluetooth_version: u8,
    pub manufacturer: u16,
    pub supported_settings: AdapterSettings,
    pub current_settings: AdapterSettings,
    pub class_of_device: [u8; 3],
    pub name: [u8; NAME_BUFFER_SIZE],
    pub short_name: [u8; SHORT_NAME_BUFFER_SIZE],
}

impl Default for ControllerInformation {
    fn default() -> Self {
        Self {
            address: Address::default(),
            bluetooth_version: 0,
            manufacturer: 0,
            supported_settings: AdapterSettings::new(),
            current_settings: AdapterSettings::new(),
            class_of_device: [0; 3],
            name: [0; NAME_BUFFER_SIZE],
            short_name: [0; SHORT_NAME_BUFFER_SIZE],
        }
    }
}

impl ControllerInformation {
    pub fn name(&self) -> String {
        c_string(&self.name)
    }

    pub fn short_name(&self) -> String {
        c_string(&self.short_name)
    }
}

/// Return parameters of Read Management Version Information.
#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Copy, Debug, Default)]
#[brw(little)]
pub struct VersionInformation {
    pub version: u8,
    pub revision: u16,
}

/// Name pair carried by Set Local Name and Local Name Changed.
#[derive(BinRead, BinWrite, PartialEq, Eq, Clone, Debug)]
#[brw(little)]
pub struct LocalName {
    pub name: [u8; NAME_BUFFER_SIZE],
    pub short_name: [u8; SHORT_NAME_BUFFER_SIZE],
}

impl Default for LocalName {
    fn default() -> Self {
        Self {
            name: [0; NAME_BUFFER_SIZE],
            short_name: [0; SHORT_NAME_BUFFER_SIZE],
        }
    }
}

impl LocalName {
    /// Both strings are cut to fit their buffers, NUL terminated and NUL padded.
    pub fn new(name: &str, short_name: &str) -> Self {
        Self {
            name: fill_c_string(name),
            short_name: fill_c_string(short_name),
        }
    }

    pub fn name(&self) -> String {
        c_string(&self.name)
    }

    pub fn short_name(&self) -> String {
        c_string(&self.short_name)
    }
}

#[binrw::parser(reader, endian)]
fn parse_instances(count: u8) -> BinResult<InstanceBuffer> {
    parse_vec(count as usize, reader, endian)
}

/// Return parameters of Read Advertising Features.
#[binrw]
#[brw(little)]
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct AdvertisingFeatures {
    pub supported_flags: AdvertisingSettings,
    pub max_adv_data_len: u8,
    pub max_scan_rsp_len: u8,
    pub max_instances: u8,

    #[bw(calc(instances.len() as u8))]
    num_instances: u8,
    #[br(parse_with = parse_instances, args(num_instances))]
    #[bw(map = |x| x.as_slice())]
    pub instances: InstanceBuffer,
}

impl Default for AdvertisingFeatures {
    fn default() -> Self {
        Self {
            supported_flags: AdvertisingSettings::new(),
            max_adv_data_len: AD_DATA_MAX_SIZE as u8,
            max_scan_rsp_len: AD_DATA_MAX_SIZE as u8,
            max_instances: 0,
            instances: InstanceBuffer::new(),
        }
    }
}

impl AdvertisingFeatures {
    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }
}

/// Reads `count` bytes into a bounded buffer, failing instead of overflowing it.
pub(crate) fn parse_vec<R: Read + Seek, const N: usize>(count: usize, reader: &mut R, endian: Endian) -> BinResult<Vec<u8, N>> {
    let pos = reader.stream_position()?;
    let mut ret = Vec::new();
    for _ in 0..count {
        let byte = <u8>::read_options(reader, endian, ())?;
        ret.push(byte).map_err(|_| binrw::Error::AssertFail {
            pos,
            message: format!("{} bytes exceed capacity {}", count, N),
        })?;
    }
    Ok(ret)
}

/// Decodes a little-endian record, reporting any shortfall as a malformed frame.
pub(crate) fn decode_record<T>(bytes: &[u8], what: &'static str) -> Result<T, MgmtError>
where
    T: BinRead,
    for<'a> <T as BinRead>::Args<'a>: Default,
{
    T::read_le(&mut Cursor::new(bytes)).map_err(|e| {
        warn!("cannot decode {} from {} bytes: {}", what, bytes.len(), e);
        MgmtError::MalformedFrame(MsgType(str_format!(MsgStr, "bad {} ({} bytes)", what, bytes.len())))
    })
}

pub(crate) fn encode_record<T>(value: &T) -> Result<std::vec::Vec<u8>, MgmtError>
where
    T: BinWrite,
    for<'a> <T as BinWrite>::Args<'a>: Default,
{
    let mut writer = Cursor::new(std::vec::Vec::new());
    value.write_le(&mut writer).map_err(|e| {
        warn!("cannot encode record: {}", e);
        MgmtError::InvalidParameter(MsgType(str_format!(MsgStr, "unencodable record")))
    })?;
    Ok(writer.into_inner())
}

/// Text up to the first NUL.
pub(crate) fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Copies `text` into a NUL padded buffer, always leaving the final byte as terminator.
pub(crate) fn fill_c_string<const N: usize>(text: &str) -> [u8; N] {
    let mut buf = [0u8; N];
    let text = truncate_utf8(text, N.saturating_sub(1));
    buf[..text.len()].copy_from_slice(text.as_bytes());
    buf
}

/// Longest prefix of `text` no longer than `max` bytes that ends on a character boundary.
pub fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
