use fixedstr::str_format;

use crate::types::{AdDataBuffer, AD_DATA_MAX_SIZE};
use crate::{MgmtError, MsgStr, MsgType};

/// AD structure types used in advertising and scan response payloads.
pub mod ad_types {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_128_BIT_UUIDS: u8 = 0x06;
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const TX_POWER_LEVEL: u8 = 0x0a;
    pub const CLASS_OF_DEVICE: u8 = 0x0d;
}

/// Length and type bytes in front of every AD structure value.
pub const AD_FIELD_OVERHEAD: usize = 2;

/// Length-prefixed AD structures packed into a payload no larger than one
/// advertising PDU.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct AdData {
    data: AdDataBuffer,
    capacity: usize,
}

impl Default for AdData {
    fn default() -> Self {
        Self::new()
    }
}

impl AdData {
    pub fn new() -> Self {
        Self::with_capacity(AD_DATA_MAX_SIZE)
    }

    /// Capacity is clamped to the PDU limit.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: AdDataBuffer::new(),
            capacity: capacity.min(AD_DATA_MAX_SIZE),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Room left for a value once its length and type bytes are accounted for.
    pub fn remaining_value(&self) -> usize {
        self.remaining().saturating_sub(AD_FIELD_OVERHEAD)
    }

    /// Appends one `[len, type, value...]` structure; nothing is written when it does not fit.
    pub fn append(&mut self, ad_type: u8, value: &[u8]) -> Result<&mut Self, MgmtError> {
        let needed = AD_FIELD_OVERHEAD + value.len();
        if needed > self.remaining() {
            return Err(MgmtError::InvalidParameter(MsgType(str_format!(
                MsgStr,
                "AD type {:#04x} needs {} bytes, {} left",
                ad_type,
                needed,
                self.remaining()
            ))));
        }

        // the length byte counts the type byte as well
        let fits = self.data.push((value.len() + 1) as u8).is_ok()
            && self.data.push(ad_type).is_ok()
            && self.data.extend_from_slice(value).is_ok();
        if !fits {
            return Err(MgmtError::InvalidParameter(MsgType(str_format!(MsgStr, "AD buffer overflow"))));
        }
        Ok(self)
    }

    pub fn as_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn into_inner(self) -> AdDataBuffer {
        self.data
    }
}
