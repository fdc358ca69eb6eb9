use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use btmgmt::adapter::notify_keys;
use btmgmt::command::{command_name, opcodes, CommandPacket, DiscoverableMode, SecureConnectionsMode};
use btmgmt::event::{
    event_name, status_name, ClassOfDeviceChangedEvent, CommandCompleteEvent, CommandStatusEvent,
    DeviceConnectedEvent, DeviceDisconnectedEvent, Event, EventFrame, Status,
};
use btmgmt::types::{
    AdapterSettings, Address, AdvertisingFeatures, AdvertisingSettings, ControllerInformation, InstanceBuffer,
    LocalName, VersionInformation,
};
use btmgmt::{
    Ack, Adapter, AdapterConfig, AdvertisingStep, CommandError, MgmtError, Mgmt, NotifyData, Transport,
    DEFAULT_CONTROLLER_INDEX, NON_CONTROLLER,
};

#[derive(Clone, Copy, Debug)]
enum Reply {
    Status(u8),
    /// Acknowledge through Command Status instead of Command Complete.
    CommandStatus(u8),
    Silent,
    HangUp,
}

/// In-memory controller: decodes every written command, records it and
/// answers with encoded events.
struct MockController {
    inbox_tx: Mutex<Sender<Option<Vec<u8>>>>,
    inbox_rx: Mutex<Receiver<Option<Vec<u8>>>>,
    commands: Mutex<Vec<CommandPacket>>,
    overrides: Mutex<HashMap<u16, Reply>>,
    settings: Mutex<u32>,
    features: Mutex<AdvertisingFeatures>,
    reply_delay: Mutex<Option<Duration>>,
    connected: AtomicBool,
    closed: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
}

impl MockController {
    fn new(features: AdvertisingFeatures) -> Self {
        let (tx, rx) = channel();
        Self {
            inbox_tx: Mutex::new(tx),
            inbox_rx: Mutex::new(rx),
            commands: Mutex::new(Vec::new()),
            overrides: Mutex::new(HashMap::new()),
            settings: Mutex::new(AdapterSettings::LOW_ENERGY | AdapterSettings::BONDABLE),
            features: Mutex::new(features),
            reply_delay: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn on(&self, code: u16, reply: Reply) {
        self.overrides.lock().unwrap().insert(code, reply);
    }

    fn delay_replies(&self, delay: Duration) {
        *self.reply_delay.lock().unwrap() = Some(delay);
    }

    fn inject(&self, frame: Vec<u8>) {
        self.inbox_tx.lock().unwrap().send(Some(frame)).unwrap();
    }

    fn inject_event(&self, event: Event) {
        self.inject(EventFrame::new(DEFAULT_CONTROLLER_INDEX, event).unwrap().encode().unwrap());
    }

    fn commands(&self) -> Vec<CommandPacket> {
        self.commands.lock().unwrap().clone()
    }

    fn take_commands(&self) -> Vec<CommandPacket> {
        std::mem::take(&mut *self.commands.lock().unwrap())
    }

    fn codes(&self) -> Vec<u16> {
        self.commands().iter().map(|c| c.opcode()).collect()
    }

    fn controller_information(&self) -> ControllerInformation {
        let name = LocalName::new("mock-controller", "mock");
        let settings = *self.settings.lock().unwrap();
        ControllerInformation {
            address: Address([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]),
            bluetooth_version: 9,
            manufacturer: 0x000f,
            supported_settings: AdapterSettings::from_bits(0xffff),
            current_settings: AdapterSettings::from_bits(settings),
            class_of_device: [0x00, 0x00, 0x00],
            name: name.name,
            short_name: name.short_name,
        }
    }

    fn apply_state(&self, code: u16, state: u8) -> Vec<u8> {
        let bit = match code {
            opcodes::SET_POWERED => AdapterSettings::POWERED,
            opcodes::SET_CONNECTABLE => AdapterSettings::CONNECTABLE,
            opcodes::SET_FAST_CONNECTABLE => AdapterSettings::FAST_CONNECTABLE,
            opcodes::SET_DISCOVERABLE => AdapterSettings::DISCOVERABLE,
            opcodes::SET_BONDABLE => AdapterSettings::BONDABLE,
            opcodes::SET_LINK_SECURITY => AdapterSettings::LINK_LEVEL_SECURITY,
            opcodes::SET_SECURE_SIMPLE_PAIRING => AdapterSettings::SECURE_SIMPLE_PAIRING,
            opcodes::SET_HIGH_SPEED => AdapterSettings::HIGH_SPEED,
            opcodes::SET_LOW_ENERGY => AdapterSettings::LOW_ENERGY,
            opcodes::SET_ADVERTISING => AdapterSettings::ADVERTISING,
            opcodes::SET_BREDR => AdapterSettings::BREDR,
            opcodes::SET_SECURE_CONNECTIONS => AdapterSettings::SECURE_CONNECTIONS,
            _ => 0,
        };
        let mut settings = self.settings.lock().unwrap();
        if state != 0 {
            *settings |= bit;
        } else {
            *settings &= !bit;
        }
        settings.to_le_bytes().to_vec()
    }

    fn return_parameters(&self, command: &CommandPacket) -> Vec<u8> {
        match command {
            CommandPacket::NoParameters { code, .. } => match *code {
                opcodes::READ_VERSION_INFORMATION => vec![0x01, 0x16, 0x00],
                opcodes::READ_CONTROLLER_INFORMATION => encode_le(&self.controller_information()),
                opcodes::READ_ADVERTISING_FEATURES => encode_le(&*self.features.lock().unwrap()),
                _ => Vec::new(),
            },
            CommandPacket::SetState { code, state, .. } => self.apply_state(*code, *state),
            CommandPacket::SetDiscoverable { mode, .. } => {
                self.apply_state(opcodes::SET_DISCOVERABLE, (*mode != DiscoverableMode::Disabled) as u8)
            }
            CommandPacket::SetLocalName { name, .. } => encode_le(name),
            CommandPacket::AddAdvertising { instance, .. } | CommandPacket::RemoveAdvertising { instance, .. } => {
                vec![*instance]
            }
        }
    }
}

fn encode_le<T>(value: &T) -> Vec<u8>
where
    T: binrw::BinWrite,
    for<'a> <T as binrw::BinWrite>::Args<'a>: Default,
{
    let mut cursor = std::io::Cursor::new(Vec::new());
    value.write_le(&mut cursor).unwrap();
    cursor.into_inner()
}

fn complete_frame(code: u16, status: u8, parameters: Vec<u8>) -> Vec<u8> {
    let event = Event::CommandComplete(CommandCompleteEvent {
        command_code: code,
        status,
        parameters,
    });
    EventFrame::new(DEFAULT_CONTROLLER_INDEX, event).unwrap().encode().unwrap()
}

impl Transport for MockController {
    fn connect(&self) -> Result<(), MgmtError> {
        self.closed.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &[u8]) -> Result<(), MgmtError> {
        if !self.is_connected() {
            return Err(MgmtError::NotConnected);
        }
        let command = CommandPacket::decode(frame).unwrap();
        let code = command.opcode();
        self.commands.lock().unwrap().push(command.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let reply = self.overrides.lock().unwrap().get(&code).copied().unwrap_or(Reply::Status(0));
        let tx = self.inbox_tx.lock().unwrap().clone();
        let frame = match reply {
            Reply::Status(0) => complete_frame(code, 0, self.return_parameters(&command)),
            Reply::Status(status) => complete_frame(code, status, Vec::new()),
            Reply::CommandStatus(status) => {
                let event = Event::CommandStatus(CommandStatusEvent {
                    command_code: code,
                    status,
                });
                EventFrame::new(DEFAULT_CONTROLLER_INDEX, event).unwrap().encode().unwrap()
            }
            Reply::Silent => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                return Ok(());
            }
            Reply::HangUp => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                tx.send(None).unwrap();
                return Ok(());
            }
        };

        let in_flight = self.in_flight.clone();
        match *self.reply_delay.lock().unwrap() {
            Some(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    let _ = tx.send(Some(frame));
                });
            }
            None => {
                in_flight.fetch_sub(1, Ordering::SeqCst);
                tx.send(Some(frame)).unwrap();
            }
        }
        Ok(())
    }

    fn receive(&self) -> Result<Option<Vec<u8>>, MgmtError> {
        let rx = self.inbox_rx.lock().unwrap();
        loop {
            match rx.recv_timeout(Duration::from_millis(20)) {
                Ok(frame) => return Ok(frame),
                Err(RecvTimeoutError::Timeout) if self.closed.load(Ordering::SeqCst) => return Ok(None),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

fn features(supported: u32, instances: &[u8]) -> AdvertisingFeatures {
    AdvertisingFeatures {
        supported_flags: AdvertisingSettings::from_bits(supported),
        max_adv_data_len: 31,
        max_scan_rsp_len: 31,
        max_instances: 5,
        instances: InstanceBuffer::from_slice(instances).unwrap(),
    }
}

const ALL_ADVERTISING_FLAGS: u32 = 0x3ff;

fn setup_with(features: AdvertisingFeatures, config: AdapterConfig) -> Mgmt<MockController> {
    let _ = env_logger::builder().is_test(true).try_init();
    let adapter = Adapter::with_config(MockController::new(features), config);
    let mgmt = Mgmt::new(adapter, DEFAULT_CONTROLLER_INDEX);
    mgmt.adapter().transport().take_commands();
    mgmt
}

fn setup(features: AdvertisingFeatures) -> Mgmt<MockController> {
    setup_with(features, AdapterConfig::default())
}

fn add_advertising(commands: &[CommandPacket]) -> Option<CommandPacket> {
    commands
        .iter()
        .find(|c| c.opcode() == opcodes::ADD_ADVERTISING)
        .cloned()
}

/// Round trip through the event loop so every frame injected before it has been processed.
fn flush(mgmt: &Mgmt<MockController>) {
    mgmt.adapter()
        .send_command(&CommandPacket::NoParameters {
            code: opcodes::READ_VERSION_INFORMATION,
            controller: NON_CONTROLLER,
        })
        .unwrap();
}

#[test]
fn set_state_frame_layout() {
    let packet = CommandPacket::SetState {
        code: opcodes::SET_POWERED,
        controller: 0,
        state: 1,
    };
    let bytes = packet.encode().unwrap();
    assert_eq!(bytes, [0x05, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01]);
    assert_eq!(CommandPacket::decode(&bytes).unwrap(), packet);
    assert_eq!(packet.header().data_size, 1);
}

#[test]
fn discoverable_frame_layout() {
    let packet = CommandPacket::SetDiscoverable {
        controller: 0x0102,
        mode: DiscoverableMode::Limited,
        timeout: 0x0b4,
    };
    let bytes = packet.encode().unwrap();
    assert_eq!(bytes, [0x06, 0x00, 0x02, 0x01, 0x03, 0x00, 0x02, 0xb4, 0x00]);
    assert_eq!(CommandPacket::decode(&bytes).unwrap(), packet);
}

#[test]
fn add_advertising_frame_round_trip() {
    let packet = CommandPacket::AddAdvertising {
        controller: 0,
        instance: 1,
        flags: AdvertisingSettings::from_bits(0x0b),
        duration: 0x0102,
        timeout: 0,
        adv_data: heapless::Vec::from_slice(&[4, 0x0d, 0x20, 0x04, 0x14]).unwrap(),
        scan_rsp: heapless::Vec::from_slice(&[3, 0x08, b'h', b'i']).unwrap(),
    };
    let bytes = packet.encode().unwrap();
    assert_eq!(&bytes[..6], &[0x3e, 0x00, 0x00, 0x00, 20, 0x00]);
    assert_eq!(&bytes[6..17], &[0x01, 0x0b, 0x00, 0x00, 0x00, 0x02, 0x01, 0x00, 0x00, 5, 4]);
    assert_eq!(bytes.len(), 6 + 20);
    assert_eq!(CommandPacket::decode(&bytes).unwrap(), packet);
}

#[test]
fn command_decode_rejects_wrong_length() {
    let mut bytes = CommandPacket::RemoveAdvertising {
        controller: 0,
        instance: 2,
    }
    .encode()
    .unwrap();
    bytes.push(0);
    assert!(matches!(CommandPacket::decode(&bytes), Err(MgmtError::MalformedFrame(_))));
    assert!(matches!(CommandPacket::decode(&bytes[..3]), Err(MgmtError::MalformedFrame(_))));
}

#[test]
fn device_connected_event_decodes_eir() {
    let bytes = [
        0x0b, 0x00, 0x00, 0x00, 0x11, 0x00, // header
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, // address
        0x02, // LE random
        0x00, 0x00, 0x00, 0x00, // flags
        0x04, 0x00, // eir length
        0x03, 0x09, b'p', b'c',
    ];
    let frame = EventFrame::decode(&bytes).unwrap();
    assert_eq!(frame.header.data_size, 17);
    let Event::DeviceConnected(e) = &frame.event else {
        panic!("unexpected event {:?}", frame.event);
    };
    assert_eq!(e.address, Address([1, 2, 3, 4, 5, 6]));
    assert_eq!(e.address_type, 2);
    assert_eq!(e.eir_data, [0x03, 0x09, b'p', b'c']);
    assert_eq!(frame.encode().unwrap(), bytes);
}

#[test]
fn short_event_frame_is_malformed() {
    let bytes = complete_frame(opcodes::SET_POWERED, 0, vec![0x01, 0x00, 0x00, 0x00]);
    assert!(matches!(
        EventFrame::decode(&bytes[..bytes.len() - 1]),
        Err(MgmtError::MalformedFrame(_))
    ));
    assert!(matches!(EventFrame::decode(&bytes[..4]), Err(MgmtError::MalformedFrame(_))));
}

#[test]
fn unknown_event_code_is_unrecognized() {
    let bytes = [0x12, 0x00, 0x00, 0x00, 0x02, 0x00, 0xaa, 0xbb];
    let frame = EventFrame::decode(&bytes).unwrap();
    assert_eq!(
        frame.event,
        Event::Unrecognized {
            code: 0x12,
            data: vec![0xaa, 0xbb]
        }
    );
}

#[test]
fn new_long_term_key_event_layout() {
    let mut bytes = vec![
        0x0a, 0x00, 0x00, 0x00, 0x25, 0x00, // header
        0x01, // store hint
        0x11, 0x12, 0x13, 0x14, 0x15, 0x16, // address
        0x01, // LE public
        0x02, // key type
        0x01, // initiator
        0x10, // encryption size
        0x34, 0x12, // diversifier
    ];
    bytes.extend(0xa0..0xa8u8);
    bytes.extend(0x00..0x10u8);

    let frame = EventFrame::decode(&bytes).unwrap();
    assert_eq!(frame.header.data_size, 37);
    let Event::NewLongTermKey(e) = &frame.event else {
        panic!("unexpected event {:?}", frame.event);
    };
    assert_eq!(e.store_hint, 1);
    assert_eq!(e.address, Address([0x11, 0x12, 0x13, 0x14, 0x15, 0x16]));
    assert_eq!(e.address_type, 1);
    assert_eq!(e.key_type, 2);
    assert_eq!(e.initiator, 1);
    assert_eq!(e.encryption_size, 16);
    assert_eq!(e.encrypted_diversifier, 0x1234);
    assert_eq!(e.random_number, [0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7]);
    assert_eq!(e.value[0], 0x00);
    assert_eq!(e.value[15], 0x0f);
    assert_eq!(frame.encode().unwrap(), bytes);

    // one byte short of the record, but consistent with its header
    let mut short = bytes[..bytes.len() - 1].to_vec();
    short[4] = 0x24;
    assert!(matches!(EventFrame::decode(&short), Err(MgmtError::MalformedFrame(_))));
}

#[test]
fn passkey_notify_event_layout() {
    let bytes = [
        0x17, 0x00, 0x00, 0x00, 0x0c, 0x00, // header
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, // address
        0x02, // LE random
        0x40, 0xe2, 0x01, 0x00, // passkey
        0x03, // entered
    ];
    let frame = EventFrame::decode(&bytes).unwrap();
    let Event::PasskeyNotify(e) = &frame.event else {
        panic!("unexpected event {:?}", frame.event);
    };
    assert_eq!(e.address, Address([1, 2, 3, 4, 5, 6]));
    assert_eq!(e.address_type, 2);
    assert_eq!(e.passkey, 123456);
    assert_eq!(e.entered, 3);
    assert_eq!(frame.encode().unwrap(), bytes);
}

#[test]
fn user_confirmation_request_event_layout() {
    let bytes = [
        0x0f, 0x00, 0x01, 0x00, 0x0c, 0x00, // header, controller 1
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, // address
        0x01, // LE public
        0x01, // confirm hint
        0x3f, 0x42, 0x0f, 0x00, // value
    ];
    let frame = EventFrame::decode(&bytes).unwrap();
    assert_eq!(frame.header.controller_index, 1);
    let Event::UserConfirmationRequest(e) = &frame.event else {
        panic!("unexpected event {:?}", frame.event);
    };
    assert_eq!(e.address_type, 1);
    assert_eq!(e.confirm_hint, 1);
    assert_eq!(e.value, 999999);
    assert_eq!(frame.encode().unwrap(), bytes);
}

#[test]
fn key_and_pairing_failure_event_layouts() {
    let address = [0x21, 0x22, 0x23, 0x24, 0x25, 0x26];
    let key: Vec<u8> = (0x40..0x50u8).collect();

    let mut link_key = vec![0x09, 0x00, 0x00, 0x00, 0x1a, 0x00, 0x01];
    link_key.extend_from_slice(&address);
    link_key.extend_from_slice(&[0x00, 0x04]);
    link_key.extend_from_slice(&key);
    link_key.push(0x04);
    let frame = EventFrame::decode(&link_key).unwrap();
    let Event::NewLinkKey(e) = &frame.event else {
        panic!("unexpected event {:?}", frame.event);
    };
    assert_eq!(e.address, Address(address));
    assert_eq!(e.key_type, 4);
    assert_eq!(e.value.as_slice(), key.as_slice());
    assert_eq!(e.pin_length, 4);
    assert_eq!(frame.encode().unwrap(), link_key);

    let mut irk = vec![0x18, 0x00, 0x00, 0x00, 0x1e, 0x00, 0x00];
    irk.extend_from_slice(&[0x31, 0x32, 0x33, 0x34, 0x35, 0x76]);
    irk.extend_from_slice(&address);
    irk.push(0x01);
    irk.extend_from_slice(&key);
    let frame = EventFrame::decode(&irk).unwrap();
    let Event::NewIdentityResolvingKey(e) = &frame.event else {
        panic!("unexpected event {:?}", frame.event);
    };
    assert_eq!(e.random_address, Address([0x31, 0x32, 0x33, 0x34, 0x35, 0x76]));
    assert_eq!(e.address, Address(address));
    assert_eq!(e.address_type, 1);
    assert_eq!(frame.encode().unwrap(), irk);

    let mut csrk = vec![0x19, 0x00, 0x00, 0x00, 0x19, 0x00, 0x01];
    csrk.extend_from_slice(&address);
    csrk.extend_from_slice(&[0x02, 0x03]);
    csrk.extend_from_slice(&key);
    let frame = EventFrame::decode(&csrk).unwrap();
    let Event::NewSignatureResolvingKey(e) = &frame.event else {
        panic!("unexpected event {:?}", frame.event);
    };
    assert_eq!(e.address_type, 2);
    assert_eq!(e.key_type, 3);
    assert_eq!(e.value[15], 0x4f);
    assert_eq!(frame.encode().unwrap(), csrk);

    let mut auth_failed = vec![0x11, 0x00, 0x00, 0x00, 0x08, 0x00];
    auth_failed.extend_from_slice(&address);
    auth_failed.extend_from_slice(&[0x00, 0x05]);
    let frame = EventFrame::decode(&auth_failed).unwrap();
    let Event::AuthenticationFailed(e) = &frame.event else {
        panic!("unexpected event {:?}", frame.event);
    };
    assert_eq!(e.address_type, 0);
    assert_eq!(Status::try_from(e.status).unwrap(), Status::AuthenticationFailed);
    assert_eq!(frame.encode().unwrap(), auth_failed);
}

#[test]
fn name_tables_use_placeholder_out_of_range() {
    assert_eq!(command_name(opcodes::ADD_ADVERTISING), "Add Advertising");
    assert_eq!(command_name(0x0000), "Unknown");
    assert_eq!(command_name(0x0044), "Unknown");
    assert_eq!(command_name(0xffff), "Unknown");
    assert_eq!(event_name(0x000b), "Device Connected");
    assert_eq!(event_name(0x0026), "Unknown");
    assert_eq!(status_name(0x0f), "Not Powered");
    assert_eq!(status_name(0x15), "Unknown");
    assert_eq!(Status::try_from(0x14u8).unwrap(), Status::PermissionDenied);
    assert!(Status::try_from(0x15u8).is_err());
    assert_eq!(Status::Busy.name(), "Busy");
    assert_eq!(Status::RfKilled.to_string(), "RFKilled");
    for status in 0..=0x14u8 {
        assert_eq!(status_name(status), Status::try_from(status).unwrap().name());
    }
}

#[test]
fn sync_populates_snapshots() {
    let _ = env_logger::builder().is_test(true).try_init();
    let adapter = Adapter::new(MockController::new(features(ALL_ADVERTISING_FLAGS, &[2])));
    let mgmt = Mgmt::new(adapter, DEFAULT_CONTROLLER_INDEX);
    let adapter = mgmt.adapter();

    assert_eq!(
        adapter.transport().codes(),
        [
            opcodes::READ_VERSION_INFORMATION,
            opcodes::READ_CONTROLLER_INFORMATION,
            opcodes::READ_ADVERTISING_FEATURES
        ]
    );
    assert_eq!(adapter.transport().commands()[0].controller(), NON_CONTROLLER);
    assert_eq!(
        adapter.get_version_information(),
        VersionInformation {
            version: 1,
            revision: 0x16
        }
    );
    let info = adapter.get_controller_information();
    assert_eq!(info.name(), "mock-controller");
    assert_eq!(info.manufacturer, 0x000f);
    assert_eq!(adapter.get_local_name().short_name(), "mock");
    assert!(adapter.get_adapter_settings().low_energy());
    assert_eq!(adapter.get_advertising_features().instances.as_slice(), &[2]);
}

#[test]
fn sync_tolerates_failures() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mock = MockController::new(features(ALL_ADVERTISING_FLAGS, &[]));
    mock.on(opcodes::READ_VERSION_INFORMATION, Reply::Status(Status::NotSupported.into()));
    let mgmt = Mgmt::new(Adapter::new(mock), DEFAULT_CONTROLLER_INDEX);

    assert_eq!(mgmt.adapter().get_version_information(), VersionInformation::default());
    assert_eq!(mgmt.adapter().get_controller_information().name(), "mock-controller");
}

#[test]
fn command_success_updates_settings() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[]));
    assert!(!mgmt.adapter().get_adapter_settings().powered());

    mgmt.set_powered(true).unwrap();
    // the reply is applied before the caller wakes
    assert!(mgmt.adapter().get_adapter_settings().powered());
    assert!(mgmt.adapter().get_controller_information().current_settings.powered());

    mgmt.set_le(true).unwrap();
    mgmt.set_bredr(false).unwrap();
    mgmt.set_connectable(true).unwrap();
    mgmt.set_bondable(true).unwrap();
    mgmt.set_ssp(true).unwrap();
    mgmt.set_hc(false).unwrap();
    mgmt.set_fc(false).unwrap();
    mgmt.set_lls(false).unwrap();
    mgmt.set_secure_connections(SecureConnectionsMode::Enabled).unwrap();
    assert_eq!(
        mgmt.adapter().transport().codes(),
        [
            opcodes::SET_POWERED,
            opcodes::SET_LOW_ENERGY,
            opcodes::SET_BREDR,
            opcodes::SET_CONNECTABLE,
            opcodes::SET_BONDABLE,
            opcodes::SET_SECURE_SIMPLE_PAIRING,
            opcodes::SET_HIGH_SPEED,
            opcodes::SET_FAST_CONNECTABLE,
            opcodes::SET_LINK_SECURITY,
            opcodes::SET_SECURE_CONNECTIONS,
        ]
    );
    let settings = mgmt.adapter().get_adapter_settings();
    assert!(settings.connectable() && settings.secure_connections() && !settings.bredr());
}

#[test]
fn ack_carries_return_parameters() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[]));
    let ack = mgmt
        .adapter()
        .send_command(&CommandPacket::NoParameters {
            code: opcodes::READ_VERSION_INFORMATION,
            controller: NON_CONTROLLER,
        })
        .unwrap();
    assert_eq!(ack.command, opcodes::READ_VERSION_INFORMATION);
    assert_eq!(ack.parameters, [0x01, 0x16, 0x00]);
}

#[test]
fn controller_rejection_carries_status() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[]));
    mgmt.adapter().transport().on(opcodes::SET_POWERED, Reply::Status(Status::Busy.into()));

    let err = mgmt.set_powered(true).unwrap_err();
    assert_eq!(
        err.command_error(),
        Some(CommandError::ControllerRejected {
            code: opcodes::SET_POWERED,
            status: 0x0a
        })
    );
    assert!(!mgmt.adapter().get_adapter_settings().powered());
}

#[test]
fn timeout_releases_slot_and_late_reply_is_discarded() {
    let config = AdapterConfig::default().with_command_timeout(Duration::from_millis(100));
    let mgmt = setup_with(features(ALL_ADVERTISING_FLAGS, &[]), config);
    let mock = mgmt.adapter().transport();
    mock.on(opcodes::SET_BONDABLE, Reply::Silent);

    let started = Instant::now();
    let err = mgmt.set_bondable(true).unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(err.command_error(), Some(CommandError::Timeout { code: opcodes::SET_BONDABLE }));

    // a different command goes through straight away
    let started = Instant::now();
    mgmt.set_powered(true).unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));

    // the stale completion must not satisfy the next command
    mock.inject(complete_frame(opcodes::SET_BONDABLE, 0, vec![0xff, 0xff, 0x00, 0x00]));
    let ack = mgmt
        .adapter()
        .send_command(&CommandPacket::NoParameters {
            code: opcodes::READ_VERSION_INFORMATION,
            controller: NON_CONTROLLER,
        })
        .unwrap();
    assert_eq!(ack.command, opcodes::READ_VERSION_INFORMATION);
    assert_eq!(ack.parameters, [0x01, 0x16, 0x00]);
}

#[test]
fn advertising_flags_exclude_unsupported_tx_power() {
    let supported = ALL_ADVERTISING_FLAGS & !AdvertisingSettings::ADD_TX_POWER;
    let mgmt = setup(features(supported, &[]));

    mgmt.set_advertising(true, "Doppler-12345678", "Doppler").unwrap();

    let Some(CommandPacket::AddAdvertising {
        instance,
        flags,
        adv_data,
        scan_rsp,
        ..
    }) = add_advertising(&mgmt.adapter().transport().commands())
    else {
        panic!("no add advertising command sent");
    };
    assert_eq!(instance, 1);
    assert!(!flags.add_tx_power());
    assert_eq!(
        flags.bits(),
        AdvertisingSettings::SWITCH_CONNECTABLE | AdvertisingSettings::DISCOVERABLE | AdvertisingSettings::ADD_FLAGS
    );
    assert_eq!(adv_data.len(), 23);
    assert_eq!(&adv_data[..2], &[17, 0x09]);
    assert_eq!(&adv_data[2..18], b"Doppler-12345678");
    assert_eq!(scan_rsp.len(), 27);
    assert_eq!(&scan_rsp[18..], b"\x08\x08Doppler");
    assert_eq!(mgmt.adapter().get_advertising_features().instances.as_slice(), &[1]);
}

#[test]
fn advertising_removes_existing_instances_first() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[1, 3]));

    mgmt.set_advertising(true, "Doppler-12345678", "Doppler").unwrap();

    let commands = mgmt.adapter().transport().commands();
    let codes: Vec<u16> = commands.iter().map(|c| c.opcode()).collect();
    assert_eq!(
        codes,
        [
            opcodes::SET_ADVERTISING,
            opcodes::READ_ADVERTISING_FEATURES,
            opcodes::REMOVE_ADVERTISING,
            opcodes::REMOVE_ADVERTISING,
            opcodes::ADD_ADVERTISING,
        ]
    );
    assert_eq!(
        commands[0],
        CommandPacket::SetState {
            code: opcodes::SET_ADVERTISING,
            controller: DEFAULT_CONTROLLER_INDEX,
            state: 0
        }
    );
    assert!(matches!(commands[2], CommandPacket::RemoveAdvertising { instance: 1, .. }));
    assert!(matches!(commands[3], CommandPacket::RemoveAdvertising { instance: 3, .. }));
}

#[test]
fn advertising_disabled_stops_after_removal() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[1]));

    mgmt.set_advertising(false, "Doppler", "Dop").unwrap();

    assert_eq!(
        mgmt.adapter().transport().codes(),
        [
            opcodes::SET_ADVERTISING,
            opcodes::READ_ADVERTISING_FEATURES,
            opcodes::REMOVE_ADVERTISING
        ]
    );
    assert!(mgmt.adapter().get_advertising_features().instances.is_empty());
}

#[test]
fn advertising_failure_names_the_step() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[4]));
    mgmt.adapter()
        .transport()
        .on(opcodes::REMOVE_ADVERTISING, Reply::Status(Status::InvalidParameters.into()));

    let err = mgmt.set_advertising(true, "Doppler", "Dop").unwrap_err();
    assert!(matches!(
        err,
        MgmtError::Configuration {
            step: AdvertisingStep::RemoveInstance(4),
            ..
        }
    ));
    assert_eq!(
        err.command_error(),
        Some(CommandError::ControllerRejected {
            code: opcodes::REMOVE_ADVERTISING,
            status: 0x0d
        })
    );
    assert!(add_advertising(&mgmt.adapter().transport().commands()).is_none());
}

#[test]
fn advertising_aborts_when_disable_fails() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[]));
    mgmt.adapter()
        .transport()
        .on(opcodes::SET_ADVERTISING, Reply::Status(Status::Rejected.into()));

    let err = mgmt.set_advertising(true, "Doppler", "Dop").unwrap_err();
    assert!(matches!(
        err,
        MgmtError::Configuration {
            step: AdvertisingStep::DisableAdvertising,
            ..
        }
    ));
    assert_eq!(mgmt.adapter().transport().codes(), [opcodes::SET_ADVERTISING]);
}

#[test]
fn set_name_truncates_and_pads() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[]));

    mgmt.set_name(&"A".repeat(300), &"B".repeat(50)).unwrap();

    let commands = mgmt.adapter().transport().commands();
    let CommandPacket::SetLocalName { name, .. } = &commands[0] else {
        panic!("unexpected command {:?}", commands[0]);
    };
    assert_eq!(name.name(), "A".repeat(248));
    assert_eq!(name.name[248], 0);
    assert_eq!(name.short_name(), "B".repeat(10));
    assert_eq!(name.short_name[10], 0);
    assert_eq!(mgmt.adapter().get_local_name(), *name);

    mgmt.set_name("abc", "x").unwrap();
    let commands = mgmt.adapter().transport().commands();
    let bytes = commands[1].encode().unwrap();
    assert_eq!(bytes.len(), 6 + 260);
    assert_eq!(&bytes[6..10], b"abc\0");
    assert!(bytes[10..255].iter().all(|&b| b == 0));
    assert_eq!(&bytes[255..257], b"x\0");
    assert!(bytes[257..].iter().all(|&b| b == 0));
}

#[test]
fn limited_discoverable_needs_timeout() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[]));

    let err = mgmt.set_discoverable(DiscoverableMode::Limited, 0).unwrap_err();
    assert!(matches!(err, MgmtError::InvalidParameter(_)));
    assert!(mgmt.adapter().transport().commands().is_empty());

    mgmt.set_discoverable(DiscoverableMode::General, 0).unwrap();
    mgmt.set_discoverable(DiscoverableMode::Limited, 30).unwrap();
    assert!(mgmt.adapter().get_adapter_settings().discoverable());
    assert!(matches!(
        mgmt.adapter().transport().commands()[1],
        CommandPacket::SetDiscoverable {
            mode: DiscoverableMode::Limited,
            timeout: 30,
            ..
        }
    ));
}

fn connected(address: [u8; 6]) -> Event {
    Event::DeviceConnected(DeviceConnectedEvent {
        address: Address(address),
        address_type: 1,
        flags: 0,
        eir_data: Vec::new(),
    })
}

fn disconnected(address: [u8; 6]) -> Event {
    Event::DeviceDisconnected(DeviceDisconnectedEvent {
        address: Address(address),
        address_type: 1,
        reason: 0x03,
    })
}

#[test]
fn connection_count_balances_and_never_underflows() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[]));
    let mock = mgmt.adapter().transport();

    mock.inject_event(connected([1; 6]));
    mock.inject_event(disconnected([1; 6]));
    flush(&mgmt);
    assert_eq!(mgmt.adapter().get_active_connection_count(), 0);

    mock.inject_event(disconnected([9; 6]));
    mock.inject_event(connected([1; 6]));
    mock.inject_event(connected([2; 6]));
    flush(&mgmt);
    assert_eq!(mgmt.adapter().get_active_connection_count(), 2);

    mock.inject_event(disconnected([1; 6]));
    mock.inject_event(disconnected([2; 6]));
    mock.inject_event(disconnected([3; 6]));
    flush(&mgmt);
    assert_eq!(mgmt.adapter().get_active_connection_count(), 0);
}

#[test]
fn malformed_frames_do_not_stop_the_loop() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[]));
    let mock = mgmt.adapter().transport();

    mock.inject(vec![0x01, 0x00]);
    mock.inject(vec![0x0b, 0x00, 0x00, 0x00, 0x20, 0x00, 0x01, 0x02]);
    mock.inject(vec![0x12, 0x00, 0x00, 0x00, 0x00, 0x00]);
    mock.inject_event(connected([7; 6]));

    flush(&mgmt);
    assert!(mgmt.adapter().is_running());
    assert_eq!(mgmt.adapter().get_active_connection_count(), 1);
}

#[test]
fn unsolicited_events_update_state() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[]));
    let mock = mgmt.adapter().transport();

    let settings = AdapterSettings::from_bits(AdapterSettings::POWERED | AdapterSettings::ADVERTISING);
    mock.inject_event(Event::NewSettings(settings));
    mock.inject_event(Event::LocalNameChanged(LocalName::new("renamed", "ren")));
    mock.inject_event(Event::AdvertisingAdded(btmgmt::event::AdvertisingInstanceEvent { instance: 5 }));
    flush(&mgmt);

    let adapter = mgmt.adapter();
    assert_eq!(adapter.get_adapter_settings(), settings);
    assert_eq!(adapter.get_local_name().name(), "renamed");
    assert_eq!(adapter.get_controller_information().short_name(), "ren");
    assert_eq!(adapter.get_advertising_features().instances.as_slice(), &[5]);

    mock.inject_event(Event::AdvertisingRemoved(btmgmt::event::AdvertisingInstanceEvent { instance: 5 }));
    flush(&mgmt);
    assert!(adapter.get_advertising_features().instances.is_empty());
}

#[test]
fn command_status_completes_the_pending_command() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[]));
    let adapter = mgmt.adapter();
    adapter.transport().on(opcodes::SET_POWERED, Reply::CommandStatus(0));
    adapter.transport().on(opcodes::SET_LOW_ENERGY, Reply::CommandStatus(0x0c));
    let before = adapter.get_adapter_settings();

    let ack = adapter
        .send_command(&CommandPacket::SetState {
            code: opcodes::SET_POWERED,
            controller: DEFAULT_CONTROLLER_INDEX,
            state: 1,
        })
        .unwrap();
    assert_eq!(
        ack,
        Ack {
            command: opcodes::SET_POWERED,
            parameters: Vec::new()
        }
    );
    // no return parameters, so the cached settings stay as they were
    assert_eq!(adapter.get_adapter_settings(), before);

    let err = mgmt.set_le(false).unwrap_err();
    assert_eq!(
        err.command_error(),
        Some(CommandError::ControllerRejected {
            code: opcodes::SET_LOW_ENERGY,
            status: 0x0c
        })
    );
    assert!(mgmt.set_powered(true).is_ok());
}

#[test]
fn class_of_device_event_updates_controller_information() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[]));
    let adapter = mgmt.adapter();
    assert_eq!(adapter.get_controller_information().class_of_device, [0, 0, 0]);

    adapter
        .transport()
        .inject_event(Event::ClassOfDeviceChanged(ClassOfDeviceChangedEvent {
            class_of_device: [0x0c, 0x01, 0x02],
        }));
    flush(&mgmt);

    let controller = adapter.get_controller_information();
    assert_eq!(controller.class_of_device, [0x0c, 0x01, 0x02]);
    assert_eq!(controller.name(), "mock-controller");
}

#[test]
fn notifier_last_registration_wins() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[]));
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));

    let seen = first.clone();
    mgmt.adapter()
        .set_notifier(move |key: &str, data: &NotifyData| seen.lock().unwrap().push((key.to_string(), data.clone())));
    let seen = second.clone();
    mgmt.adapter()
        .set_notifier(move |key: &str, data: &NotifyData| seen.lock().unwrap().push((key.to_string(), data.clone())));

    mgmt.adapter().transport().inject_event(connected([4; 6]));
    mgmt.adapter().transport().inject_event(disconnected([4; 6]));
    flush(&mgmt);

    assert!(first.lock().unwrap().is_empty());
    assert_eq!(
        *second.lock().unwrap(),
        [
            (
                notify_keys::CONNECT.to_string(),
                NotifyData::Connection {
                    address: Address([4; 6]),
                    active_connections: 1
                }
            ),
            (
                notify_keys::DISCONNECT.to_string(),
                NotifyData::Connection {
                    address: Address([4; 6]),
                    active_connections: 0
                }
            ),
        ]
    );
}

#[test]
fn concurrent_callers_are_serialized() {
    let mgmt = Arc::new(setup(features(ALL_ADVERTISING_FLAGS, &[])));
    mgmt.adapter().transport().delay_replies(Duration::from_millis(10));

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let mgmt = mgmt.clone();
            thread::spawn(move || {
                for _ in 0..3 {
                    mgmt.set_powered(i % 2 == 0).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let mock = mgmt.adapter().transport();
    assert_eq!(mock.commands().len(), 12);
    assert_eq!(mock.max_in_flight.load(Ordering::SeqCst), 1);
}

#[test]
fn link_loss_fails_pending_command_and_later_ones() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[]));
    mgmt.adapter().transport().on(opcodes::SET_POWERED, Reply::HangUp);

    let err = mgmt.set_powered(true).unwrap_err();
    assert_eq!(err.command_error(), Some(CommandError::LinkLost { code: opcodes::SET_POWERED }));

    assert!(matches!(mgmt.set_le(true), Err(MgmtError::NotConnected)));
    assert!(matches!(mgmt.adapter().wait(), Err(MgmtError::Transport(_))));
    assert!(!mgmt.adapter().is_running());
}

#[test]
fn stop_ends_the_event_loop_cleanly() {
    let mgmt = setup(features(ALL_ADVERTISING_FLAGS, &[]));
    assert!(mgmt.adapter().is_running());

    mgmt.adapter().stop();
    assert!(mgmt.adapter().wait().is_ok());
    assert!(!mgmt.adapter().is_running());
    assert!(matches!(mgmt.set_powered(true), Err(MgmtError::NotConnected)));
}

#[test]
fn wait_before_start_leaves_engine_usable() {
    let _ = env_logger::builder().is_test(true).try_init();
    let adapter = Adapter::new(MockController::new(features(ALL_ADVERTISING_FLAGS, &[])));

    assert!(adapter.wait().is_ok());
    assert!(!adapter.is_running());

    adapter.connect().unwrap();
    assert!(adapter.is_running());
    let mgmt = Mgmt::new(adapter.clone(), DEFAULT_CONTROLLER_INDEX);
    assert!(mgmt.set_powered(true).is_ok());

    adapter.stop();
    assert!(adapter.wait().is_ok());
    assert!(!adapter.is_running());
}

#[test]
fn stop_before_start_keeps_engine_down() {
    let adapter = Adapter::new(MockController::new(features(ALL_ADVERTISING_FLAGS, &[])));
    adapter.stop();
    assert!(matches!(adapter.connect(), Err(MgmtError::NotConnected)));
    assert!(!adapter.transport().is_connected());
}
