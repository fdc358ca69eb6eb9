//! Protocol engine: command/reply correlation over the shared socket and the
//! cached controller state fed by the event stream.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, info, trace, warn};

use crate::command::{command_name, opcodes, CommandPacket, STATE_COMMANDS};
use crate::config::AdapterConfig;
use crate::diag::{settings_string, Describe};
use crate::event::{event_name, status_name, Event, EventFrame};
use crate::transport::{MgmtSocket, Transport};
use crate::types::{
    decode_record, AdapterSettings, Address, AdvertisingFeatures, ControllerInformation, LocalName,
    VersionInformation,
};
use crate::{CommandError, MgmtError, NON_CONTROLLER};

/// Keys passed to the [`StateNotifier`].
pub mod notify_keys {
    pub const CONNECT: &str = "hardware/connect";
    pub const DISCONNECT: &str = "hardware/disconnect";
    pub const SETTINGS: &str = "hardware/settings";
    pub const LOCAL_NAME: &str = "hardware/name";
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotifyData {
    Connection { address: Address, active_connections: usize },
    Settings(AdapterSettings),
    LocalName(LocalName),
}

/// Observer of state changes seen on the event stream.
///
/// Called from the event loop thread, so it must not block on commands.
pub trait StateNotifier: Send + Sync {
    fn notify(&self, key: &str, data: &NotifyData);
}

impl<F> StateNotifier for F
where
    F: Fn(&str, &NotifyData) + Send + Sync,
{
    fn notify(&self, key: &str, data: &NotifyData) {
        self(key, data)
    }
}

/// Successful completion of a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub command: u16,
    /// Return parameters; empty when acknowledged by Command Status.
    pub parameters: Vec<u8>,
}

#[derive(Default)]
struct PendingCommand {
    code: Option<u16>,
    result: Option<Result<Ack, CommandError>>,
}

#[derive(Default, Clone)]
struct CachedState {
    settings: AdapterSettings,
    controller: ControllerInformation,
    version: VersionInformation,
    features: AdvertisingFeatures,
    local_name: LocalName,
    active_connections: usize,
}

struct Shared<T> {
    transport: T,
    config: AdapterConfig,
    // serializes callers, one command in flight
    command_lock: Mutex<()>,
    pending: Mutex<PendingCommand>,
    completed: Condvar,
    state: RwLock<CachedState>,
    notifier: RwLock<Option<Arc<dyn StateNotifier>>>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    terminal: Mutex<Option<MgmtError>>,
    stop_requested: AtomicBool,
    stopped: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to the engine. Clones share one socket, one event loop and one
/// cached state.
pub struct Adapter<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Adapter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Adapter<MgmtSocket> {
    /// Engine on the kernel management socket, sized by `config`.
    pub fn open(config: AdapterConfig) -> Self {
        let socket = MgmtSocket::from_config(&config);
        Self::with_config(socket, config)
    }
}

impl<T: Transport> Adapter<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, AdapterConfig::default())
    }

    pub fn with_config(transport: T, config: AdapterConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                command_lock: Mutex::new(()),
                pending: Mutex::new(PendingCommand::default()),
                completed: Condvar::new(),
                state: RwLock::new(CachedState::default()),
                notifier: RwLock::new(None),
                event_thread: Mutex::new(None),
                terminal: Mutex::new(None),
                stop_requested: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.shared.config
    }

    /// Opens the transport and starts the event loop thread, unless both are
    /// already up. Fails with `NotConnected` once the engine has stopped.
    pub fn connect(&self) -> Result<(), MgmtError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(MgmtError::NotConnected);
        }

        let mut event_thread = lock(&self.shared.event_thread);
        if event_thread.is_some() && self.shared.transport.is_connected() {
            return Ok(());
        }

        self.shared.transport.connect()?;
        if event_thread.is_none() {
            let adapter = self.clone();
            let handle = thread::Builder::new()
                .name(self.shared.config.event_thread_name.clone())
                .spawn(move || adapter.event_thread_main())?;
            *event_thread = Some(handle);
            debug!("event thread started");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::SeqCst) && lock(&self.shared.event_thread).is_some()
    }

    /// Sends one command and blocks until the controller answers it or the
    /// command timeout elapses.
    ///
    /// Callers are served one at a time; a second caller waits here until the
    /// first one's slot is released.
    pub fn send_command(&self, packet: &CommandPacket) -> Result<Ack, MgmtError> {
        self.connect()?;

        let code = packet.opcode();
        let frame = packet.encode()?;

        let _serial = lock(&self.shared.command_lock);
        {
            let mut pending = lock(&self.shared.pending);
            pending.code = Some(code);
            pending.result = None;
        }

        debug!("> {}", packet.describe());
        if let Err(e) = self.shared.transport.send(&frame) {
            error!("cannot send {}: {}", command_name(code), e);
            *lock(&self.shared.pending) = PendingCommand::default();
            return Err(e);
        }

        let deadline = Instant::now() + self.shared.config.command_timeout;
        let mut pending = lock(&self.shared.pending);
        loop {
            if let Some(result) = pending.result.take() {
                pending.code = None;
                return match result {
                    Ok(ack) => Ok(ack),
                    Err(e) => {
                        if let CommandError::ControllerRejected { status, .. } = e {
                            warn!("{} rejected: {}", command_name(code), status_name(status));
                        }
                        Err(e.into())
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                pending.code = None;
                error!("{} ({:#06x}) timed out", command_name(code), code);
                return Err(CommandError::Timeout { code }.into());
            }

            pending = match self.shared.completed.wait_timeout(pending, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn event_thread_main(&self) {
        if let Err(e) = self.run_event_loop() {
            error!("event loop ended: {}", e);
            *lock(&self.shared.terminal) = Some(e);
        }
    }

    /// Receive loop: one frame per iteration, in arrival order, until the
    /// transport closes.
    ///
    /// [`connect`](Self::connect) runs this on its own thread; it is public for
    /// callers that manage threads themselves and must then be the only loop.
    pub fn run_event_loop(&self) -> Result<(), MgmtError> {
        info!("event loop running");
        let result = loop {
            match self.shared.transport.receive() {
                Ok(Some(bytes)) => self.process_frame(&bytes),
                Ok(None) if self.shared.stop_requested.load(Ordering::SeqCst) => break Ok(()),
                Ok(None) => {
                    break Err(MgmtError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "management socket closed",
                    )))
                }
                Err(e) => break Err(e),
            }
        };

        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.transport.close();
        {
            let mut pending = lock(&self.shared.pending);
            if let Some(code) = pending.code {
                if pending.result.is_none() {
                    pending.result = Some(Err(CommandError::LinkLost { code }));
                }
            }
            self.shared.completed.notify_all();
        }
        info!("event loop stopped");
        result
    }

    fn process_frame(&self, bytes: &[u8]) {
        let frame = match EventFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping frame: {}", e);
                return;
            }
        };
        debug!("< {}", frame.describe());

        match frame.event {
            Event::CommandComplete(e) => {
                if e.status == 0 {
                    self.apply_command_result(e.command_code, &e.parameters);
                }
                self.complete(e.command_code, e.status, e.parameters);
            }
            Event::CommandStatus(e) => self.complete(e.command_code, e.status, Vec::new()),
            Event::NewSettings(settings) => {
                self.update_settings(settings);
                self.notify(notify_keys::SETTINGS, NotifyData::Settings(settings));
            }
            Event::LocalNameChanged(name) => {
                self.update_local_name(&name);
                self.notify(notify_keys::LOCAL_NAME, NotifyData::LocalName(name));
            }
            Event::ClassOfDeviceChanged(e) => {
                write(&self.shared.state).controller.class_of_device = e.class_of_device;
            }
            Event::DeviceConnected(e) => {
                let active_connections = {
                    let mut state = write(&self.shared.state);
                    state.active_connections = state.active_connections.saturating_add(1);
                    state.active_connections
                };
                info!("{} connected, {} active", e.address, active_connections);
                self.notify(
                    notify_keys::CONNECT,
                    NotifyData::Connection {
                        address: e.address,
                        active_connections,
                    },
                );
            }
            Event::DeviceDisconnected(e) => {
                let active_connections = {
                    let mut state = write(&self.shared.state);
                    if state.active_connections == 0 {
                        warn!("disconnect from {} without a known connection", e.address);
                    }
                    state.active_connections = state.active_connections.saturating_sub(1);
                    state.active_connections
                };
                info!("{} disconnected, {} active", e.address, active_connections);
                self.notify(
                    notify_keys::DISCONNECT,
                    NotifyData::Connection {
                        address: e.address,
                        active_connections,
                    },
                );
            }
            Event::AdvertisingAdded(e) => self.add_instance(e.instance),
            Event::AdvertisingRemoved(e) => self.remove_instance(e.instance),
            Event::ControllerError(e) => warn!("controller error {:#04x}", e.error_code),
            Event::IndexAdded | Event::IndexRemoved => {
                info!("{} for controller {:#06x}", event_name(frame.header.code), frame.header.controller_index)
            }
            Event::Unrecognized { code, .. } => info!("ignoring {} event {:#06x}", event_name(code), code),
            // bonding material and pairing prompts are only logged
            _ => {}
        }
    }

    /// Settles the armed slot if it waits for `code`; anything else is stale.
    fn complete(&self, code: u16, status: u8, parameters: Vec<u8>) {
        let mut pending = lock(&self.shared.pending);
        if pending.code != Some(code) || pending.result.is_some() {
            debug!("discarding reply to {} ({:#06x}), nothing waits for it", command_name(code), code);
            return;
        }
        pending.result = Some(if status == 0 {
            Ok(Ack {
                command: code,
                parameters,
            })
        } else {
            Err(CommandError::ControllerRejected { code, status })
        });
        self.shared.completed.notify_all();
    }

    fn apply_command_result(&self, code: u16, parameters: &[u8]) {
        match code {
            opcodes::READ_VERSION_INFORMATION => {
                if let Ok(version) = decode_record::<VersionInformation>(parameters, "version information") {
                    info!("{}", version.describe());
                    write(&self.shared.state).version = version;
                }
            }
            opcodes::READ_CONTROLLER_INFORMATION => {
                if let Ok(controller) = decode_record::<ControllerInformation>(parameters, "controller information") {
                    info!("{}", controller.describe());
                    let mut state = write(&self.shared.state);
                    state.settings = controller.current_settings;
                    state.local_name = LocalName {
                        name: controller.name,
                        short_name: controller.short_name,
                    };
                    state.controller = controller;
                }
            }
            opcodes::SET_LOCAL_NAME => {
                if let Ok(name) = decode_record::<LocalName>(parameters, "local name") {
                    self.update_local_name(&name);
                }
            }
            opcodes::READ_ADVERTISING_FEATURES => {
                if let Ok(features) = decode_record::<AdvertisingFeatures>(parameters, "advertising features") {
                    debug!("{}", features.describe());
                    write(&self.shared.state).features = features;
                }
            }
            opcodes::ADD_ADVERTISING => {
                if let Some(&instance) = parameters.first() {
                    self.add_instance(instance);
                }
            }
            opcodes::REMOVE_ADVERTISING => {
                if let Some(&instance) = parameters.first() {
                    self.remove_instance(instance);
                }
            }
            code if STATE_COMMANDS.contains(&code) => {
                if let Ok(settings) = decode_record::<AdapterSettings>(parameters, "settings") {
                    self.update_settings(settings);
                }
            }
            _ => trace!("no cached state for {}", command_name(code)),
        }
    }

    fn update_settings(&self, settings: AdapterSettings) {
        debug!("current settings: {}", settings_string(&settings));
        let mut state = write(&self.shared.state);
        state.settings = settings;
        state.controller.current_settings = settings;
    }

    fn update_local_name(&self, name: &LocalName) {
        let mut state = write(&self.shared.state);
        state.local_name = name.clone();
        state.controller.name = name.name;
        state.controller.short_name = name.short_name;
    }

    fn add_instance(&self, instance: u8) {
        let mut state = write(&self.shared.state);
        if state.features.instances.contains(&instance) {
            return;
        }
        if state.features.instances.push(instance).is_err() {
            warn!("instance list full, not tracking advertising instance {}", instance);
        }
    }

    /// Instance 0 stands for all instances.
    fn remove_instance(&self, instance: u8) {
        let mut state = write(&self.shared.state);
        if instance == 0 {
            state.features.instances.clear();
        } else {
            state.features.instances.retain(|&i| i != instance);
        }
    }

    fn notify(&self, key: &str, data: NotifyData) {
        let notifier = read(&self.shared.notifier).clone();
        if let Some(notifier) = notifier {
            notifier.notify(key, &data);
        }
    }

    /// Registers the observer; a later registration replaces it.
    pub fn set_notifier<N: StateNotifier + 'static>(&self, notifier: N) {
        *write(&self.shared.notifier) = Some(Arc::new(notifier));
    }

    pub fn clear_notifier(&self) {
        *write(&self.shared.notifier) = None;
    }

    /// Refreshes the cached snapshots. Failures leave the previous snapshot in
    /// place and are only logged.
    pub fn sync(&self, controller_index: u16) {
        let reads = [
            CommandPacket::NoParameters {
                code: opcodes::READ_VERSION_INFORMATION,
                controller: NON_CONTROLLER,
            },
            CommandPacket::NoParameters {
                code: opcodes::READ_CONTROLLER_INFORMATION,
                controller: controller_index,
            },
            CommandPacket::NoParameters {
                code: opcodes::READ_ADVERTISING_FEATURES,
                controller: controller_index,
            },
        ];
        for packet in &reads {
            if let Err(e) = self.send_command(packet) {
                warn!("sync: {} failed: {}", command_name(packet.opcode()), e);
            }
        }
    }

    pub fn get_adapter_settings(&self) -> AdapterSettings {
        read(&self.shared.state).settings
    }

    pub fn get_controller_information(&self) -> ControllerInformation {
        read(&self.shared.state).controller.clone()
    }

    pub fn get_version_information(&self) -> VersionInformation {
        read(&self.shared.state).version
    }

    pub fn get_advertising_features(&self) -> AdvertisingFeatures {
        read(&self.shared.state).features.clone()
    }

    pub fn get_active_connection_count(&self) -> usize {
        read(&self.shared.state).active_connections
    }

    pub fn get_local_name(&self) -> LocalName {
        read(&self.shared.state).local_name.clone()
    }

    /// Closes the transport and joins the event loop.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.transport.close();
        self.join_event_thread();
    }

    /// Blocks until the event loop ends; returns the error that ended it, if
    /// it did not end through [`stop`](Self::stop). Returns at once when the
    /// loop was never started.
    pub fn wait(&self) -> Result<(), MgmtError> {
        self.join_event_thread();
        match lock(&self.shared.terminal).take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Joins the event thread if one was started. Without one there is
    /// nothing to wait for and the engine stays connectable.
    fn join_event_thread(&self) {
        let Some(handle) = lock(&self.shared.event_thread).take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("event thread panicked");
        }
        self.shared.stopped.store(true, Ordering::SeqCst);
    }
}
