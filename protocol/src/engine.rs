//! Protocol engine driving the link to the lock MCU.
//!
//! The [`Engine`] is a poll-driven state machine without any I/O of its own.
//! The owner feeds received bytes into [`Engine::handle_byte`], calls
//! [`Engine::tick`] periodically, and writes out whatever
//! [`Engine::take_transmit`] returns. [`Link`](crate::Link) does exactly this
//! for any port implementing [`Read`](crate::Read) and [`Write`](crate::Write).
//!
//! All time values are milliseconds of a monotonic clock chosen by the owner.

use crate::{
    base32,
    datapoint::{self, Datapoint, DatapointValue, Registry},
    frame::{Command, CommandType, Frame, FrameDecoder},
    otp,
    scheduler::{InitState, Scheduler, Timing},
    time::{MISSING_TIME_PAYLOAD, TimeSource},
};
use alloc::{
    boxed::Box,
    string::{String, ToString},
    vec::Vec,
};
use log::{debug, error, info, trace, warn};
use strum::FromRepr;

/// Product string stored when the MCU reports a non-printable product.
pub const INVALID_PRODUCT: &str = r#"{"p":"INVALID"}"#;

/// Length of the timestamp preceding the datapoints of a record report.
const RECORD_TIME_LEN: usize = 7;

/// Offset of the entered digits in a dynamic password request.
const DYNAMIC_PASSWORD_OFFSET: usize = 6;

/// Positive acknowledgment payload.
const ACK_SUCCESS: u8 = 0x00;

/// Negative acknowledgment payload.
const ACK_FAILURE: u8 = 0x01;

/// Engine configuration.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Config {
    /// Command scheduling parameters.
    pub timing: Timing,
    /// Length of a TOTP window in seconds.
    ///
    /// A code stays valid for the whole window, 300 s by default.
    pub totp_step: u64,
    /// Number of digits of a dynamic password.
    pub totp_digits: u32,
    /// Datapoints whose MCU reports are dropped.
    pub ignored_datapoints: Vec<u8>,
    /// Delays in ms after the enable sensor turns on at which the cloud
    /// connection is reported to the MCU.
    pub wifi_report_delays: [u64; 2],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timing: Timing::default(),
            totp_step: 300,
            totp_digits: 8,
            ignored_datapoints: Vec::new(),
            wifi_report_delays: [1250, 3000],
        }
    }
}

/// Network status code reported to the MCU.
#[derive(FromRepr, strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum WifiState {
    /// Pairing in smart config mode.
    SmartConfig = 0x00,
    /// Pairing in access point mode.
    ApMode = 0x01,
    /// Configured but not connected.
    NotConnected = 0x02,
    /// Connected to the network.
    Connected = 0x03,
    /// Connected to the cloud.
    CloudConnected = 0x04,
}

/// Source of the module's network status.
pub trait NetworkStatus {
    /// Returns the current network state.
    fn wifi_state(&self) -> WifiState;

    /// Returns the signal strength in dBm.
    fn rssi(&self) -> i8;
}

/// Master-side protocol engine.
///
/// Owns the receive buffer, the command queue and the datapoint registry.
/// Listeners and callbacks run synchronously inside [`Engine::handle_byte`]
/// and [`Engine::tick`], so they must not block.
pub struct Engine {
    config: Config,
    decoder: FrameDecoder,
    scheduler: Scheduler,
    registry: Registry,
    tx: Vec<u8>,
    now: u64,
    product: String,
    protocol_version: Option<u8>,
    totp_secret: String,
    totp_key: Option<Vec<u8>>,
    time_source: Option<Box<dyn TimeSource>>,
    time_sync: Option<CommandType>,
    network: Option<Box<dyn NetworkStatus>>,
    reported_wifi_state: Option<WifiState>,
    enabled: Option<bool>,
    wake_reported: bool,
    wake_reports: Vec<u64>,
    initialized_callbacks: Vec<Box<dyn FnMut()>>,
}

impl Engine {
    /// Constructs a new engine.
    ///
    /// Nothing is sent until [`Engine::setup`] is called.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            decoder: FrameDecoder::new(),
            scheduler: Scheduler::new(config.timing),
            registry: Registry::new(config.ignored_datapoints.clone()),
            config,
            tx: Vec::new(),
            now: 0,
            product: String::new(),
            protocol_version: None,
            totp_secret: String::new(),
            totp_key: None,
            time_source: None,
            time_sync: None,
            network: None,
            reported_wifi_state: None,
            enabled: None,
            wake_reported: false,
            wake_reports: Vec::new(),
            initialized_callbacks: Vec::new(),
        }
    }

    /// Starts initialization by querying the product information.
    ///
    /// Also parses the configured TOTP secret.
    pub fn setup(&mut self) {
        self.send_command(Command::empty(CommandType::ProductQuery));
        self.parse_totp_secret();
        debug!("Finished setup");
    }

    /// Sets the source of the current time used for time queries and password verification.
    pub fn set_time_source(&mut self, source: impl TimeSource + 'static) {
        self.time_source = Some(Box::new(source));
    }

    /// Sets the source of the network status.
    pub fn set_network_status(&mut self, network: impl NetworkStatus + 'static) {
        self.network = Some(Box::new(network));
    }

    /// Updates the state of the enable sensor.
    ///
    /// Each time the sensor turns on after initialization, the cloud
    /// connection is reported to the MCU after the configured delays.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = Some(enabled);
    }

    /// Replaces the base32 encoded TOTP secret.
    ///
    /// Whitespace and `=` padding around the secret are removed.
    /// The secret takes effect once [`Engine::parse_totp_secret`] is called.
    pub fn set_totp_secret(&mut self, secret: &str) {
        self.totp_secret = secret.trim().trim_end_matches('=').to_string();
    }

    /// Decodes the TOTP secret, replacing any previously decoded key.
    ///
    /// Returns whether a usable key was decoded.
    pub fn parse_totp_secret(&mut self) -> bool {
        self.totp_key = None;

        match base32::decode(&self.totp_secret) {
            Ok(key) if !key.is_empty() => {
                debug!("Successfully read TOTP secret");
                self.totp_key = Some(key);

                true
            }
            Ok(_) => {
                error!("Failed to decode TOTP secret: no bytes decoded");

                false
            }
            Err(err) => {
                error!("Failed to decode TOTP secret: {err}");

                false
            }
        }
    }

    /// Returns whether a TOTP key is available for password verification.
    #[must_use]
    pub fn has_totp_key(&self) -> bool {
        self.totp_key.is_some()
    }

    /// Registers a listener invoked whenever datapoint `id` changes.
    ///
    /// If the datapoint is already known, the listener is invoked immediately.
    pub fn register_listener(&mut self, id: u8, listener: impl FnMut(&Datapoint) + 'static) {
        self.registry.register_listener(id, listener);
    }

    /// Registers a callback invoked once initialization is done.
    pub fn add_on_initialized(&mut self, callback: impl FnMut() + 'static) {
        self.initialized_callbacks.push(Box::new(callback));
    }

    /// Returns the cached datapoint with the given ID.
    #[must_use]
    pub fn datapoint(&self, id: u8) -> Option<&Datapoint> {
        self.registry.get(id)
    }

    /// Returns an iterator over all known datapoints.
    pub fn datapoints(&self) -> impl Iterator<Item = &Datapoint> {
        self.registry.iter()
    }

    /// Returns the initialization state.
    #[must_use]
    pub fn init_state(&self) -> InitState {
        self.scheduler.init_state()
    }

    /// Returns whether initialization failed after exhausting its retries.
    #[must_use]
    pub fn init_failed(&self) -> bool {
        self.scheduler.init_failed()
    }

    /// Returns the product information reported by the MCU.
    #[must_use]
    pub fn product(&self) -> &str {
        &self.product
    }

    /// Returns the protocol version announced in the product information response.
    #[must_use]
    pub fn protocol_version(&self) -> Option<u8> {
        self.protocol_version
    }

    /// Processes a received byte at time `now`.
    pub fn handle_byte(&mut self, byte: u8, now: u64) {
        self.now = now;

        if let Some(frame) = self.decoder.push(byte, now) {
            self.handle_frame(&frame);
        }
    }

    /// Processes a sequence of received bytes at time `now`.
    pub fn handle_bytes(&mut self, bytes: &[u8], now: u64) {
        for &byte in bytes {
            self.handle_byte(byte, now);
        }
    }

    /// Runs one scheduling pass at time `now`.
    pub fn tick(&mut self, now: u64) {
        self.now = now;
        self.poll_enable_sensor();
        self.decoder.expire(now, self.config.timing.receive_timeout);
        self.scheduler.expire(now);
        self.dispatch();
    }

    /// Takes the bytes that are ready to be written to the port.
    pub fn take_transmit(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.tx)
    }

    /// Sends the current time again after the time source was synchronized.
    ///
    /// Has no effect until the MCU has queried the time at least once.
    pub fn notify_time_synced(&mut self) {
        if let Some(kind) = self.time_sync {
            self.send_time(kind);
        }
    }

    /// Reports the network status to the MCU if it changed since the last report.
    pub fn report_wifi_state(&mut self) {
        let state = self.wifi_state();

        if self.reported_wifi_state == Some(state) {
            return;
        }

        debug!("Sending network status {state}");
        self.reported_wifi_state = Some(state);
        self.send_command(Command::new(CommandType::WifiState, [state as u8]));
    }

    /// Writes a raw datapoint.
    pub fn set_raw(&mut self, id: u8, value: &[u8]) -> datapoint::Result<()> {
        self.write_datapoint(id, value.to_vec().into(), 0, false)
    }

    /// Writes a boolean datapoint.
    pub fn set_boolean(&mut self, id: u8, value: bool) -> datapoint::Result<()> {
        self.write_datapoint(id, value.into(), 0, false)
    }

    /// Writes an integer datapoint.
    pub fn set_integer(&mut self, id: u8, value: u32) -> datapoint::Result<()> {
        self.write_datapoint(id, value.into(), 0, false)
    }

    /// Writes a string datapoint.
    pub fn set_string(&mut self, id: u8, value: &str) -> datapoint::Result<()> {
        self.write_datapoint(id, value.into(), 0, false)
    }

    /// Writes an enum datapoint.
    pub fn set_enum(&mut self, id: u8, value: u8) -> datapoint::Result<()> {
        self.write_datapoint(id, DatapointValue::Enum(value), 0, false)
    }

    /// Writes a bitmask datapoint of `width` bytes (1, 2 or 4).
    pub fn set_bitmask(&mut self, id: u8, value: u32, width: u8) -> datapoint::Result<()> {
        self.write_datapoint(id, DatapointValue::Bitmask(value), width, false)
    }

    /// Writes a raw datapoint, even if the value is unchanged.
    pub fn force_set_raw(&mut self, id: u8, value: &[u8]) -> datapoint::Result<()> {
        self.write_datapoint(id, value.to_vec().into(), 0, true)
    }

    /// Writes a boolean datapoint, even if the value is unchanged.
    pub fn force_set_boolean(&mut self, id: u8, value: bool) -> datapoint::Result<()> {
        self.write_datapoint(id, value.into(), 0, true)
    }

    /// Writes an integer datapoint, even if the value is unchanged.
    pub fn force_set_integer(&mut self, id: u8, value: u32) -> datapoint::Result<()> {
        self.write_datapoint(id, value.into(), 0, true)
    }

    /// Writes a string datapoint, even if the value is unchanged.
    pub fn force_set_string(&mut self, id: u8, value: &str) -> datapoint::Result<()> {
        self.write_datapoint(id, value.into(), 0, true)
    }

    /// Writes an enum datapoint, even if the value is unchanged.
    pub fn force_set_enum(&mut self, id: u8, value: u8) -> datapoint::Result<()> {
        self.write_datapoint(id, DatapointValue::Enum(value), 0, true)
    }

    /// Writes a bitmask datapoint of `width` bytes, even if the value is unchanged.
    pub fn force_set_bitmask(&mut self, id: u8, value: u32, width: u8) -> datapoint::Result<()> {
        self.write_datapoint(id, DatapointValue::Bitmask(value), width, true)
    }

    /// Logs the engine state.
    pub fn dump_config(&mut self) {
        info!("Tuya lock:");

        for dp in self.registry.iter() {
            info!("  Datapoint {}: {} (value: {})", dp.id, dp.kind(), dp.value);
        }

        info!("  Product: '{}'", self.product);
        info!(
            "  Init state: {}{}",
            self.init_state(),
            if self.init_failed() { " (failed)" } else { "" }
        );

        if self.totp_key.is_some() {
            info!("  TOTP: enabled");
        } else {
            info!("  TOTP: disabled");
            // Log the reason again
            self.parse_totp_secret();
        }
    }

    /// Writes a datapoint, unless the write is suppressed or rejected.
    ///
    /// The value is normalized through its wire encoding before it is
    /// compared with and stored in the registry.
    fn write_datapoint(
        &mut self,
        id: u8,
        value: DatapointValue,
        width: u8,
        force: bool,
    ) -> datapoint::Result<()> {
        debug!("Setting datapoint {id} to {value}");

        let kind = value.kind();
        let data = datapoint::encode_value(&value, width)
            .inspect_err(|err| error!("Cannot set datapoint {id}: {err}"))?;

        if data.len() > datapoint::MAX_VALUE_LEN {
            let err = datapoint::Error::TooLong {
                id,
                len: data.len(),
            };

            error!("Cannot set datapoint {id}: {err}");

            return Err(err);
        }

        let value = datapoint::decode_value(id, kind, &data)?;
        let send = self
            .registry
            .check_write(id, &value, force)
            .inspect_err(|err| error!("Cannot set datapoint {id}: {err}"))?;

        if send {
            self.send_command(Command::new(
                CommandType::ModuleSendCommand,
                datapoint::encode_entry(id, kind, &data),
            ));
            self.registry.update_local(id, value, data.len());
        }

        Ok(())
    }

    fn handle_frame(&mut self, frame: &Frame) {
        let command = frame.command;

        self.scheduler.handle_response(command);

        let Some(kind) = CommandType::from_repr(command) else {
            error!("Invalid command ({command:#04x}) received");

            return;
        };

        debug!("{kind} ({command:#04x})");

        match kind {
            CommandType::ProductQuery => self.handle_product(frame),
            CommandType::WifiState => trace!("Network status acknowledged"),
            CommandType::DatapointReport => {
                // The lock waits for the acknowledgment before it proceeds
                self.send_command(Command::new(kind, [ACK_SUCCESS]));
                self.handle_report(&frame.payload);
            }
            CommandType::DatapointRecordReport => self.handle_record_report(&frame.payload),
            CommandType::ModuleSendCommand => {}
            CommandType::WifiTest => self.send_command(Command::new(kind, [0x00, 0x00])),
            CommandType::WifiRssi => {
                let rssi = self.network.as_ref().map_or(0, |net| net.rssi());

                self.send_command(Command::new(kind, rssi.to_be_bytes()));
            }
            CommandType::VerifyDynamicPassword => self.verify_dynamic_password(&frame.payload),
            CommandType::LocalTimeQuery | CommandType::GmtTimeQuery => {
                self.handle_time_query(kind);
            }
            _ => warn!("{kind} is not handled"),
        }
    }

    fn handle_product(&mut self, frame: &Frame) {
        let printable = frame.payload.iter().all(|&b| (0x20..0x7f).contains(&b));

        self.product = if printable {
            String::from_utf8_lossy(&frame.payload).into_owned()
        } else {
            INVALID_PRODUCT.to_string()
        };
        self.protocol_version = Some(frame.version);

        if self.scheduler.complete_init() {
            info!("Initialization done, product: {}", self.product);

            for callback in &mut self.initialized_callbacks {
                callback();
            }
        }
    }

    fn handle_report(&mut self, payload: &[u8]) {
        if let Err(err) = self.registry.handle_report(payload) {
            warn!("Aborting datapoint report: {err}");
        }
    }

    fn handle_record_report(&mut self, payload: &[u8]) {
        let Some((stamp, entries)) = payload.split_at_checked(RECORD_TIME_LEN) else {
            warn!("Record report is too short ({} bytes)", payload.len());

            return;
        };

        debug!(
            "Record time: 20{:02}-{:02}-{:02} {:02}:{:02}:{:02}{}",
            stamp[1],
            stamp[2],
            stamp[3],
            stamp[4],
            stamp[5],
            stamp[6],
            if stamp[0] == 0x00 { " (local)" } else { " (GMT)" }
        );
        self.handle_report(entries);
        self.send_command(Command::new(
            CommandType::DatapointRecordReport,
            [ACK_SUCCESS],
        ));
    }

    fn verify_dynamic_password(&mut self, payload: &[u8]) {
        let digits = self.config.totp_digits;
        let end = DYNAMIC_PASSWORD_OFFSET + digits as usize;
        let Some(input) = payload.get(DYNAMIC_PASSWORD_OFFSET..end) else {
            warn!("Dynamic password request is too short ({} bytes)", payload.len());

            return;
        };

        trace!("Input password was: {}", String::from_utf8_lossy(input));

        let (Some(source), Some(key)) = (&self.time_source, &self.totp_key) else {
            warn!("Dynamic password is not verified, time source or TOTP key missing");

            return;
        };
        let Some(now) = source.now() else {
            warn!("Current time is invalid, cannot generate TOTP password");

            return;
        };
        let matched = otp::verify_totp(key, now.timestamp, self.config.totp_step, digits, input);

        debug!("Password {}", if matched { "matched" } else { "not matched" });
        self.send_command(Command::new(
            CommandType::VerifyDynamicPassword,
            [if matched { ACK_SUCCESS } else { ACK_FAILURE }],
        ));
    }

    fn handle_time_query(&mut self, kind: CommandType) {
        if self.time_source.is_none() {
            warn!("{kind} is not handled because time is not configured");

            return;
        }

        self.send_time(kind);
        // Later clock updates are pushed in the flavour first asked for
        self.time_sync.get_or_insert(kind);
    }

    fn send_time(&mut self, kind: CommandType) {
        let payload = match self.time_source.as_ref().and_then(|source| source.now()) {
            // GMT queries are answered with local time, no timezone is known here
            Some(time) => {
                debug!("Sending time for {kind}");

                time.to_payload()
            }
            None => {
                warn!("Sending missing time for {kind}");

                MISSING_TIME_PAYLOAD
            }
        };

        self.send_command(Command::new(kind, payload));
    }

    fn wifi_state(&self) -> WifiState {
        let state = self
            .network
            .as_ref()
            .map_or(WifiState::NotConnected, |net| net.wifi_state());

        // Cloud status is only understood since protocol version 3
        match (state, self.protocol_version) {
            (WifiState::CloudConnected, Some(version)) if version < 0x03 => WifiState::Connected,
            _ => state,
        }
    }

    fn poll_enable_sensor(&mut self) {
        match self.enabled {
            Some(true) if self.init_state() == InitState::Done && !self.wake_reported => {
                debug!("Module enabled, reporting cloud connection");
                self.wake_reported = true;

                let now = self.now;

                self.wake_reports
                    .extend(self.config.wifi_report_delays.iter().map(|delay| now + delay));
            }
            Some(false) => self.wake_reported = false,
            _ => {}
        }

        let now = self.now;
        let due = self.wake_reports.iter().filter(|&&at| at <= now).count();

        self.wake_reports.retain(|&at| at > now);

        for _ in 0..due {
            self.send_command(Command::new(
                CommandType::WifiState,
                [WifiState::CloudConnected as u8],
            ));
        }
    }

    fn send_command(&mut self, cmd: Command) {
        self.scheduler.enqueue(cmd);
        self.dispatch();
    }

    fn dispatch(&mut self) {
        if let Some(cmd) = self.scheduler.next(self.now, self.decoder.is_empty()) {
            let frame = cmd.encode();

            trace!("Sending frame: {frame:02x?}");
            self.tx.extend_from_slice(&frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datapoint::{DatapointType, Error},
        frame,
        tests::init_logger,
        time::LocalTime,
    };
    use alloc::{format, rc::Rc, vec, vec::Vec};
    use core::cell::{Cell, RefCell};

    const SECRET: &str = "JBSWY3DPEHPK3PXP";
    const NOW: u64 = 1_700_000_000;

    fn feed(engine: &mut Engine, kind: CommandType, version: u8, payload: &[u8], now: u64) {
        engine.handle_bytes(&frame::encode(version, kind as u8, payload), now);
    }

    fn sent(engine: &mut Engine) -> Vec<Frame> {
        let mut dec = FrameDecoder::new();

        engine
            .take_transmit()
            .into_iter()
            .filter_map(|b| dec.push(b, 0))
            .collect()
    }

    fn initialized() -> Engine {
        let mut engine = Engine::new(Config::default());

        engine.setup();
        feed(&mut engine, CommandType::ProductQuery, 0x03, b"{\"p\":\"abc\"}", 5);
        engine.take_transmit();

        engine
    }

    fn clock(timestamp: u64) -> impl Fn() -> Option<LocalTime> {
        move || LocalTime::from_unix_timestamp(timestamp)
    }

    #[test]
    fn setup_queries_product() {
        init_logger();

        let mut engine = Engine::new(Config::default());

        engine.setup();

        assert_eq!(
            engine.take_transmit(),
            [0x55, 0xaa, 0x00, 0x01, 0x00, 0x00, 0x00],
            "product query should be sent"
        );
        assert_eq!(engine.init_state(), InitState::AwaitingEnablePin);
    }

    #[test]
    fn product_response_completes_initialization() {
        init_logger();

        let calls = Rc::new(Cell::new(0));
        let mut engine = Engine::new(Config::default());

        {
            let calls = Rc::clone(&calls);

            engine.add_on_initialized(move || calls.set(calls.get() + 1));
        }

        engine.setup();
        feed(&mut engine, CommandType::ProductQuery, 0x03, b"{\"p\":\"abc\"}", 5);
        feed(&mut engine, CommandType::ProductQuery, 0x03, b"{\"p\":\"abc\"}", 50);

        assert_eq!(engine.init_state(), InitState::Done);
        assert_eq!(engine.product(), "{\"p\":\"abc\"}");
        assert_eq!(engine.protocol_version(), Some(0x03));
        assert_eq!(calls.get(), 1, "callback should fire once");
    }

    #[test]
    fn non_printable_product() {
        let mut engine = Engine::new(Config::default());

        feed(&mut engine, CommandType::ProductQuery, 0x03, &[0x7b, 0x00], 0);

        assert_eq!(engine.product(), INVALID_PRODUCT);
    }

    #[test]
    fn initialization_fails_without_response() {
        init_logger();

        let mut engine = Engine::new(Config::default());

        engine.setup();

        for now in 0..=5 * 301 {
            engine.tick(now);
        }

        let frames = sent(&mut engine);

        assert_eq!(frames.len(), 5, "product query should be sent 5 times");
        assert!(
            frames
                .iter()
                .all(|f| f.command == CommandType::ProductQuery as u8),
            "only product queries should be sent"
        );
        assert_eq!(engine.init_state(), InitState::AwaitingEnablePin);
        assert!(engine.init_failed(), "initialization should fail");
    }

    #[test]
    fn datapoint_report_is_acknowledged_and_applied() {
        init_logger();

        let mut engine = initialized();
        let seen = Rc::new(RefCell::new(Vec::new()));

        {
            let seen = Rc::clone(&seen);

            engine.register_listener(5, move |dp| seen.borrow_mut().push(dp.clone()));
        }

        let report = datapoint::encode_entry(5, DatapointType::Integer, &42u32.to_be_bytes());

        feed(&mut engine, CommandType::DatapointReport, 0x03, &report, 100);
        engine.tick(110);

        assert_eq!(
            sent(&mut engine),
            [Frame {
                version: 0x00,
                command: CommandType::DatapointReport as u8,
                payload: vec![ACK_SUCCESS],
            }],
            "acknowledgment should be sent"
        );

        let expected = Datapoint {
            id: 5,
            value: DatapointValue::Integer(42),
            len: 4,
        };

        assert_eq!(engine.datapoint(5), Some(&expected));
        assert_eq!(*seen.borrow(), [expected], "listener should fire");
    }

    #[test]
    fn record_report_skips_timestamp() {
        init_logger();

        let mut engine = initialized();
        let mut payload = vec![0x01, 24, 5, 17, 8, 30, 0];

        payload.extend(datapoint::encode_entry(3, DatapointType::Boolean, &[0x01]));
        feed(&mut engine, CommandType::DatapointRecordReport, 0x03, &payload, 100);
        feed(&mut engine, CommandType::DatapointRecordReport, 0x03, &[0x01, 0x02], 200);

        let frames = sent(&mut engine);

        assert_eq!(frames.len(), 1, "only the valid report should be acknowledged");
        assert_eq!(frames[0].command, CommandType::DatapointRecordReport as u8);
        assert_eq!(
            engine.datapoint(3).and_then(|dp| dp.value.as_bool()),
            Some(true)
        );
    }

    #[test]
    fn unchanged_writes_are_suppressed() {
        init_logger();

        let mut engine = initialized();
        let report = datapoint::encode_entry(5, DatapointType::Integer, &42u32.to_be_bytes());

        feed(&mut engine, CommandType::DatapointReport, 0x03, &report, 100);
        engine.take_transmit();

        engine.tick(200);
        assert_eq!(engine.set_integer(5, 42), Ok(()));
        assert!(sent(&mut engine).is_empty(), "cached value should not be sent");

        engine.tick(300);
        engine.set_integer(5, 7).unwrap();
        engine.tick(400);
        engine.set_integer(5, 7).unwrap();
        engine.tick(500);

        let frames = sent(&mut engine);

        assert_eq!(frames.len(), 1, "repeated value should be sent once");
        assert_eq!(
            frames[0].payload,
            [0x05, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x07],
            "datapoint command should be correct"
        );

        engine.force_set_integer(5, 7).unwrap();
        engine.tick(600);
        engine.force_set_integer(5, 7).unwrap();
        engine.tick(700);

        assert_eq!(sent(&mut engine).len(), 2, "forced writes should be sent");
    }

    #[test]
    fn mismatched_write_is_rejected() {
        init_logger();

        let mut engine = initialized();

        feed(
            &mut engine,
            CommandType::DatapointReport,
            0x03,
            &datapoint::encode_entry(1, DatapointType::Enum, &[0x00]),
            100,
        );
        engine.tick(200);
        engine.take_transmit();

        assert!(matches!(
            engine.force_set_boolean(1, true),
            Err(Error::TypeMismatch { id: 1, .. })
        ));
        assert_eq!(engine.set_bitmask(9, 1, 3), Err(Error::InvalidWidth(3)));

        engine.tick(300);

        assert!(sent(&mut engine).is_empty(), "nothing should be sent");
    }

    #[test]
    fn writes_to_unknown_datapoints_are_sent() {
        let mut engine = initialized();

        engine.tick(100);
        engine.set_bitmask(9, 0x0102_0304, 2).unwrap();
        engine.tick(200);
        engine.set_string(10, "hi").unwrap();
        engine.tick(300);

        let frames = sent(&mut engine);

        assert_eq!(frames.len(), 2, "both writes should be sent");
        assert_eq!(frames[0].payload, [0x09, 0x05, 0x00, 0x02, 0x03, 0x04]);
        assert_eq!(frames[1].payload, [0x0a, 0x03, 0x00, 0x02, b'h', b'i']);
        assert!(engine.datapoint(9).is_none(), "unknown datapoint should not be cached");
    }

    #[test]
    fn oversized_write_is_rejected() {
        init_logger();

        let mut engine = initialized();

        feed(
            &mut engine,
            CommandType::DatapointReport,
            0x03,
            &datapoint::encode_entry(1, DatapointType::Raw, &[0x01]),
            100,
        );
        engine.tick(200);
        engine.take_transmit();

        assert_eq!(
            engine.set_raw(1, &[0xab; datapoint::MAX_VALUE_LEN + 1]),
            Err(Error::TooLong {
                id: 1,
                len: datapoint::MAX_VALUE_LEN + 1,
            })
        );
        engine.tick(300);

        assert!(engine.take_transmit().is_empty(), "nothing should be sent");
        assert_eq!(
            engine.datapoint(1).map(|dp| dp.len),
            Some(1),
            "cached value should be kept"
        );

        assert_eq!(engine.set_raw(1, &[0xab; datapoint::MAX_VALUE_LEN]), Ok(()));

        let frames = sent(&mut engine);

        assert_eq!(frames.len(), 1, "longest value should be sent");

        let (dp, used) = datapoint::parse_entry(&frames[0].payload).unwrap();

        assert_eq!(used, usize::from(u16::MAX), "frame should be full");
        assert_eq!(dp.len, datapoint::MAX_VALUE_LEN, "entry should be intact");
    }

    #[test]
    fn partial_frame_delays_transmission() {
        let mut engine = initialized();
        let bytes = frame::encode(0x03, CommandType::WifiState as u8, &[]);

        engine.tick(100);
        engine.handle_bytes(&bytes[..3], 100);
        engine.set_enum(4, 1).unwrap();
        engine.tick(150);

        assert!(engine.take_transmit().is_empty(), "receiver should be busy");

        engine.tick(500);

        assert_eq!(sent(&mut engine).len(), 1, "write should be sent after timeout");
    }

    #[test]
    fn dynamic_password_verification() {
        init_logger();

        let mut engine = initialized();

        engine.set_totp_secret(SECRET);
        assert!(engine.parse_totp_secret(), "secret should be decoded");
        engine.set_time_source(clock(NOW));

        let key = base32::decode(SECRET).unwrap();
        let code = otp::format_code(otp::totp(&key, NOW, 300, 8).unwrap(), 8);
        let mut payload = vec![0x00; DYNAMIC_PASSWORD_OFFSET];

        payload.extend_from_slice(code.as_bytes());
        feed(&mut engine, CommandType::VerifyDynamicPassword, 0x03, &payload, 100);

        let other = (code.parse::<u32>().unwrap() + 1) % 100_000_000;
        let mut wrong = vec![0x00; DYNAMIC_PASSWORD_OFFSET];

        wrong.extend_from_slice(format!("{other:08}").as_bytes());
        feed(&mut engine, CommandType::VerifyDynamicPassword, 0x03, &wrong, 200);

        let frames = sent(&mut engine);

        assert_eq!(frames.len(), 2, "both requests should be answered");
        assert_eq!(frames[0].payload, [ACK_SUCCESS], "password should match");
        assert_eq!(frames[1].payload, [ACK_FAILURE], "password should not match");
    }

    #[test]
    fn dynamic_password_needs_time_and_secret() {
        init_logger();

        let mut engine = initialized();
        let payload = *b"\0\0\0\0\0\012345678";

        engine.set_totp_secret(SECRET);
        engine.parse_totp_secret();
        feed(&mut engine, CommandType::VerifyDynamicPassword, 0x03, &payload, 100);

        engine.set_time_source(|| None::<LocalTime>);
        feed(&mut engine, CommandType::VerifyDynamicPassword, 0x03, &payload, 200);

        engine.set_totp_secret("not base32!");
        assert!(!engine.parse_totp_secret(), "secret should be rejected");
        engine.set_time_source(clock(NOW));
        feed(&mut engine, CommandType::VerifyDynamicPassword, 0x03, &payload, 300);

        assert!(engine.take_transmit().is_empty(), "requests should be left unanswered");
    }

    #[test]
    fn time_queries() {
        init_logger();

        let mut engine = initialized();

        feed(&mut engine, CommandType::LocalTimeQuery, 0x03, &[], 100);
        assert!(engine.take_transmit().is_empty(), "query without clock should be ignored");

        let valid = Rc::new(Cell::new(false));

        {
            let valid = Rc::clone(&valid);

            engine.set_time_source(move || {
                valid
                    .get()
                    .then_some(NOW)
                    .and_then(LocalTime::from_unix_timestamp)
            });
        }

        feed(&mut engine, CommandType::GmtTimeQuery, 0x03, &[], 200);
        valid.set(true);
        engine.tick(300);
        engine.notify_time_synced();

        let frames = sent(&mut engine);

        assert_eq!(frames.len(), 2, "time should be sent twice");
        assert_eq!(frames[0].command, CommandType::GmtTimeQuery as u8);
        assert_eq!(frames[0].payload, MISSING_TIME_PAYLOAD, "time should be missing");
        assert_eq!(frames[1].command, CommandType::GmtTimeQuery as u8);
        assert_eq!(frames[1].payload, [0x01, 23, 11, 14, 22, 13, 20, 2]);
    }

    struct FixedNetwork(WifiState, i8);

    impl NetworkStatus for FixedNetwork {
        fn wifi_state(&self) -> WifiState {
            self.0
        }

        fn rssi(&self) -> i8 {
            self.1
        }
    }

    #[test]
    fn network_queries() {
        init_logger();

        let mut engine = initialized();

        engine.set_network_status(FixedNetwork(WifiState::CloudConnected, -60));
        feed(&mut engine, CommandType::WifiRssi, 0x03, &[], 100);
        feed(&mut engine, CommandType::WifiTest, 0x03, &[], 200);
        engine.report_wifi_state();
        engine.tick(300);
        engine.report_wifi_state();
        engine.tick(400);

        let frames = sent(&mut engine);

        assert_eq!(frames.len(), 3, "status should be reported once");
        assert_eq!(frames[0].payload, (-60i8).to_be_bytes());
        assert_eq!(frames[1].payload, [0x00, 0x00]);
        assert_eq!(frames[2].payload, [WifiState::CloudConnected as u8]);
    }

    #[test]
    fn cloud_state_needs_protocol_version_3() {
        let mut engine = Engine::new(Config::default());

        feed(&mut engine, CommandType::ProductQuery, 0x00, b"{}", 0);
        engine.set_network_status(FixedNetwork(WifiState::CloudConnected, 0));
        engine.report_wifi_state();

        assert_eq!(sent(&mut engine)[0].payload, [WifiState::Connected as u8]);
    }

    #[test]
    fn enable_sensor_reports_cloud_connection() {
        init_logger();

        let mut engine = initialized();

        engine.set_enabled(true);
        engine.tick(1000);
        engine.tick(2249);
        assert!(engine.take_transmit().is_empty(), "nothing should be sent yet");

        engine.tick(2250);
        engine.tick(4000);

        let frames = sent(&mut engine);

        assert_eq!(frames.len(), 2, "status should be reported twice");
        assert!(
            frames
                .iter()
                .all(|f| f.payload == [WifiState::CloudConnected as u8]),
            "cloud connection should be reported"
        );

        engine.tick(5000);
        assert!(engine.take_transmit().is_empty(), "report should not repeat");

        engine.set_enabled(false);
        engine.tick(6000);
        engine.set_enabled(true);
        engine.tick(7000);
        engine.tick(10_000);
        engine.tick(10_010);

        assert_eq!(sent(&mut engine).len(), 2, "report should be re-armed");
    }

    #[test]
    fn unknown_commands_are_ignored() {
        init_logger();

        let mut engine = initialized();

        feed(&mut engine, CommandType::WifiReset, 0x03, &[], 100);
        engine.handle_bytes(&frame::encode(0x03, 0x99, &[0x01]), 200);
        engine.tick(300);

        assert!(engine.take_transmit().is_empty(), "nothing should be sent");
    }
}
