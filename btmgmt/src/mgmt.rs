//! Management operations an application performs on one controller.

use fixedstr::str_format;
use log::{debug, info, warn};

use crate::adapter::{Ack, Adapter};
use crate::buffer::{ad_types, AdData, AD_FIELD_OVERHEAD};
use crate::command::{opcodes, CommandPacket, DiscoverableMode, SecureConnectionsMode};
use crate::config::AdvertisingConfig;
use crate::diag::advertising_settings_string;
use crate::transport::Transport;
use crate::types::{
    decode_record, truncate_utf8, AdvertisingFeatures, AdvertisingSettings, LocalName, AD_DATA_MAX_SIZE,
    MAX_NAME_LENGTH, MAX_SHORT_NAME_LENGTH,
};
use crate::{AdvertisingStep, MgmtError, MsgStr, MsgType};

/// Bytes the kernel adds to the advertising data for each of the flags and
/// TX power fields.
const KERNEL_FIELD_SIZE: usize = 3;

/// Flags requested for the advertising instance before masking against what
/// the controller supports. Name and appearance are written by hand.
pub const WANTED_ADVERTISING_FLAGS: u32 = AdvertisingSettings::SWITCH_CONNECTABLE
    | AdvertisingSettings::DISCOVERABLE
    | AdvertisingSettings::ADD_FLAGS
    | AdvertisingSettings::ADD_TX_POWER;

fn at_step<R>(step: AdvertisingStep, result: Result<R, MgmtError>) -> Result<R, MgmtError> {
    result.map_err(|e| {
        warn!("advertising setup failed at '{}': {}", step, e);
        MgmtError::Configuration {
            step,
            source: Box::new(e),
        }
    })
}

pub struct Mgmt<T: Transport> {
    adapter: Adapter<T>,
    controller_index: u16,
    advertising: AdvertisingConfig,
}

impl<T: Transport> Mgmt<T> {
    /// Binds to one controller and syncs the adapter's snapshots.
    pub fn new(adapter: Adapter<T>, controller_index: u16) -> Self {
        let mgmt = Self {
            adapter,
            controller_index,
            advertising: AdvertisingConfig::default(),
        };
        mgmt.sync();
        mgmt
    }

    pub fn with_advertising_config(mut self, config: AdvertisingConfig) -> Self {
        self.advertising = config;
        self
    }

    pub fn adapter(&self) -> &Adapter<T> {
        &self.adapter
    }

    pub fn controller_index(&self) -> u16 {
        self.controller_index
    }

    pub fn sync(&self) {
        self.adapter.sync(self.controller_index);
    }

    fn send(&self, packet: CommandPacket) -> Result<Ack, MgmtError> {
        self.adapter.send_command(&packet)
    }

    fn set_state(&self, code: u16, state: u8) -> Result<(), MgmtError> {
        self.send(CommandPacket::SetState {
            code,
            controller: self.controller_index,
            state,
        })?;
        Ok(())
    }

    pub fn set_powered(&self, on: bool) -> Result<(), MgmtError> {
        self.set_state(opcodes::SET_POWERED, on as u8)
    }

    pub fn set_bredr(&self, on: bool) -> Result<(), MgmtError> {
        self.set_state(opcodes::SET_BREDR, on as u8)
    }

    pub fn set_connectable(&self, on: bool) -> Result<(), MgmtError> {
        self.set_state(opcodes::SET_CONNECTABLE, on as u8)
    }

    /// `timeout` is in seconds and must be non-zero for limited mode.
    pub fn set_discoverable(&self, mode: DiscoverableMode, timeout: u16) -> Result<(), MgmtError> {
        if mode == DiscoverableMode::Limited && timeout == 0 {
            return Err(MgmtError::InvalidParameter(MsgType(str_format!(
                MsgStr,
                "limited discoverable needs a timeout"
            ))));
        }
        self.send(CommandPacket::SetDiscoverable {
            controller: self.controller_index,
            mode,
            timeout,
        })?;
        Ok(())
    }

    pub fn set_bondable(&self, on: bool) -> Result<(), MgmtError> {
        self.set_state(opcodes::SET_BONDABLE, on as u8)
    }

    pub fn set_le(&self, on: bool) -> Result<(), MgmtError> {
        self.set_state(opcodes::SET_LOW_ENERGY, on as u8)
    }

    pub fn set_ssp(&self, on: bool) -> Result<(), MgmtError> {
        self.set_state(opcodes::SET_SECURE_SIMPLE_PAIRING, on as u8)
    }

    /// High speed.
    pub fn set_hc(&self, on: bool) -> Result<(), MgmtError> {
        self.set_state(opcodes::SET_HIGH_SPEED, on as u8)
    }

    /// Fast connectable.
    pub fn set_fc(&self, on: bool) -> Result<(), MgmtError> {
        self.set_state(opcodes::SET_FAST_CONNECTABLE, on as u8)
    }

    /// Link level security.
    pub fn set_lls(&self, on: bool) -> Result<(), MgmtError> {
        self.set_state(opcodes::SET_LINK_SECURITY, on as u8)
    }

    pub fn set_secure_connections(&self, mode: SecureConnectionsMode) -> Result<(), MgmtError> {
        self.set_state(opcodes::SET_SECURE_CONNECTIONS, mode.into())
    }

    /// Names longer than 248 bytes and short names longer than 10 bytes are
    /// cut at the last character boundary that fits.
    pub fn set_name(&self, name: &str, short_name: &str) -> Result<(), MgmtError> {
        let fitted_name = truncate_utf8(name, MAX_NAME_LENGTH);
        let fitted_short_name = truncate_utf8(short_name, MAX_SHORT_NAME_LENGTH);
        if fitted_name.len() < name.len() || fitted_short_name.len() < short_name.len() {
            warn!(
                "local name truncated to {} / {} bytes",
                fitted_name.len(),
                fitted_short_name.len()
            );
        }

        self.send(CommandPacket::SetLocalName {
            controller: self.controller_index,
            name: LocalName::new(fitted_name, fitted_short_name),
        })?;
        Ok(())
    }

    /// Replaces whatever advertising the controller runs with one instance
    /// carrying `name`, the class of device, the service UUID and `short_name`.
    ///
    /// With `enable == false` the existing instances are removed and nothing
    /// new is installed. Any failed step aborts the whole operation.
    pub fn set_advertising(&self, enable: bool, name: &str, short_name: &str) -> Result<(), MgmtError> {
        at_step(
            AdvertisingStep::DisableAdvertising,
            self.set_state(opcodes::SET_ADVERTISING, 0),
        )?;

        let features = at_step(AdvertisingStep::ReadFeatures, self.read_advertising_features())?;

        for &instance in features.instances.iter() {
            at_step(
                AdvertisingStep::RemoveInstance(instance),
                self.send(CommandPacket::RemoveAdvertising {
                    controller: self.controller_index,
                    instance,
                }),
            )?;
        }

        if !enable {
            info!("advertising disabled, {} instances removed", features.num_instances());
            return Ok(());
        }

        let flags = AdvertisingSettings::from_bits(WANTED_ADVERTISING_FLAGS).masked(features.supported_flags);
        debug!("advertising flags: {}", advertising_settings_string(&flags));

        let (adv_data, scan_rsp) = at_step(
            AdvertisingStep::BuildPayload,
            advertising_payload(&self.advertising, &features, &flags, name, short_name),
        )?;

        at_step(
            AdvertisingStep::AddInstance,
            self.send(CommandPacket::AddAdvertising {
                controller: self.controller_index,
                instance: self.advertising.instance,
                flags,
                duration: self.advertising.duration,
                timeout: self.advertising.timeout,
                adv_data: adv_data.into_inner(),
                scan_rsp: scan_rsp.into_inner(),
            }),
        )?;
        info!("advertising instance {} installed", self.advertising.instance);
        Ok(())
    }

    fn read_advertising_features(&self) -> Result<AdvertisingFeatures, MgmtError> {
        let ack = self.send(CommandPacket::NoParameters {
            code: opcodes::READ_ADVERTISING_FEATURES,
            controller: self.controller_index,
        })?;
        decode_record(&ack.parameters, "advertising features")
    }
}

/// Builds the advertising data and scan response for one instance.
///
/// The advertising data holds the local name and class of device, within
/// what the controller accepts minus the fields the kernel adds for `flags`.
/// A name that does not fit is shortened and tagged as such. The scan
/// response holds the service UUID and the short name.
pub fn advertising_payload(
    config: &AdvertisingConfig,
    features: &AdvertisingFeatures,
    flags: &AdvertisingSettings,
    name: &str,
    short_name: &str,
) -> Result<(AdData, AdData), MgmtError> {
    let mut capacity = AD_DATA_MAX_SIZE.min(features.max_adv_data_len as usize);
    if flags.add_flags() {
        capacity = capacity.saturating_sub(KERNEL_FIELD_SIZE);
    }
    if flags.add_tx_power() {
        capacity = capacity.saturating_sub(KERNEL_FIELD_SIZE);
    }

    let mut adv_data = AdData::with_capacity(capacity);
    let class_of_device_size = AD_FIELD_OVERHEAD + config.class_of_device.len();
    let name_room = adv_data
        .remaining()
        .saturating_sub(class_of_device_size)
        .saturating_sub(AD_FIELD_OVERHEAD);
    let fitted_name = truncate_utf8(name, name_room);
    if fitted_name.len() == name.len() {
        adv_data.append(ad_types::COMPLETE_LOCAL_NAME, name.as_bytes())?;
    } else if fitted_name.is_empty() {
        warn!("no room for the local name in {} bytes of advertising data", capacity);
    } else {
        warn!("local name shortened to '{}' to fit advertising data", fitted_name);
        adv_data.append(ad_types::SHORTENED_LOCAL_NAME, fitted_name.as_bytes())?;
    }
    adv_data.append(ad_types::CLASS_OF_DEVICE, &config.class_of_device)?;

    let mut scan_rsp = AdData::with_capacity(AD_DATA_MAX_SIZE.min(features.max_scan_rsp_len as usize));
    scan_rsp.append(ad_types::INCOMPLETE_128_BIT_UUIDS, &config.service_uuid.to_be_bytes())?;

    let short_name = if name.starts_with(short_name) {
        short_name
    } else {
        let prefix = truncate_utf8(name, short_name.len());
        warn!("short name '{}' is not a prefix of '{}', using '{}'", short_name, name, prefix);
        prefix
    };
    let short_name = truncate_utf8(short_name, MAX_SHORT_NAME_LENGTH.min(scan_rsp.remaining_value()));
    if !short_name.is_empty() {
        scan_rsp.append(ad_types::SHORTENED_LOCAL_NAME, short_name.as_bytes())?;
    }

    Ok((adv_data, scan_rsp))
}
