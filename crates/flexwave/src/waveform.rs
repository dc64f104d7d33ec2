//! Waveform handles and their callback tables.
//!
//! A [`Waveform`] represents one mode configured on a [`Radio`]: the radio
//! shows it in the mode list under its short name, and when a slice selects
//! that mode the waveform goes active and its data plane comes up. All user
//! interaction happens through callbacks registered here and through the
//! send APIs (commands to the control channel, audio/bytes/meters to the
//! data channel).
//!
//! Callback registration must be complete before [`Radio::start`];
//! registering afterwards is accepted but undefined, because the tables are
//! read without locks held across dispatch.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use flexwave_core::{DataTarget, Error, MeterUnit, Result, WaveformState};

use crate::data::DataPlane;
use crate::meters::{self, Meter};
use crate::radio::{Radio, RadioShared};
use crate::vita::VitaPacket;

/// Maximum length of a waveform's short name.
pub const MAX_SHORT_NAME: usize = 4;

/// Status callback: receives the tokenized status body (subject first).
pub type StatusCallback = Arc<dyn Fn(&Waveform, &[String]) + Send + Sync>;

/// State callback: receives lifecycle and interlock transitions.
pub type StateCallback = Arc<dyn Fn(&Waveform, WaveformState) + Send + Sync>;

/// Command callback: receives the command's arguments and returns a status
/// code, zero for success. Non-zero codes are reported to the radio offset
/// into the waveform error range.
pub type CommandCallback = Arc<dyn Fn(&Waveform, &[String]) -> i32 + Send + Sync>;

/// Data callback: receives a decoded VITA-49 packet.
pub type DataCallback = Arc<dyn Fn(&Waveform, &VitaPacket) + Send + Sync>;

/// Completion / queued-acknowledgement callback for a sent command.
pub type ResponseCallback = Box<dyn FnOnce(&Waveform, u32, &str) + Send>;

/// The six stream ids a waveform learns from the radio.
///
/// Zero means "not learned yet". The control plane fills these from the
/// `waveform create` response; the data loop additionally seeds incoming
/// ids from the first matching packet, so data arriving before the create
/// response correlates is still routed.
#[derive(Debug, Default)]
pub(crate) struct StreamIds {
    pub tx_audio_in: AtomicU32,
    pub tx_audio_out: AtomicU32,
    pub rx_audio_in: AtomicU32,
    pub rx_audio_out: AtomicU32,
    pub byte_in: AtomicU32,
    pub byte_out: AtomicU32,
}

/// Callback tables, one insertion-ordered list per kind. Keyed kinds
/// (status, command) store their subject/verb alongside the callback;
/// every entry whose key matches is invoked, in registration order.
#[derive(Default)]
pub(crate) struct Callbacks {
    pub status: Mutex<Vec<(String, StatusCallback)>>,
    pub state: Mutex<Vec<StateCallback>>,
    pub command: Mutex<Vec<(String, CommandCallback)>>,
    pub rx_data: Mutex<Vec<DataCallback>>,
    pub tx_data: Mutex<Vec<DataCallback>>,
    pub rx_bytes: Mutex<Vec<DataCallback>>,
    pub tx_bytes: Mutex<Vec<DataCallback>>,
    pub unknown: Mutex<Vec<DataCallback>>,
}

/// One configured mode on a radio.
pub struct Waveform {
    name: String,
    short_name: String,
    underlying_mode: String,
    version: String,

    rx_depth: AtomicU32,
    tx_depth: AtomicU32,

    pub(crate) radio: Weak<RadioShared>,
    pub(crate) self_ref: Weak<Waveform>,

    pub(crate) active_slice: Mutex<Option<u8>>,
    pub(crate) streams: StreamIds,
    pub(crate) callbacks: Callbacks,
    pub(crate) meters: Mutex<Vec<Meter>>,
    pub(crate) plane: Mutex<Option<Arc<DataPlane>>>,

    context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Waveform {
    /// Create a waveform on a radio.
    ///
    /// `short_name` is the mode name the radio displays and matches slice
    /// status against; it is limited to [`MAX_SHORT_NAME`] characters.
    /// Filter depths default to 8. The returned handle stays valid for the
    /// life of the radio.
    pub fn build(
        radio: &Radio,
        name: &str,
        short_name: &str,
        underlying_mode: &str,
        version: &str,
    ) -> Result<Arc<Waveform>> {
        if short_name.is_empty() || short_name.len() > MAX_SHORT_NAME {
            return Err(Error::InvalidParameter(format!(
                "short name must be 1-{MAX_SHORT_NAME} characters: {short_name:?}"
            )));
        }

        let shared = radio.shared();
        let waveform = Arc::new_cyclic(|self_ref| Waveform {
            name: name.to_string(),
            short_name: short_name.to_string(),
            underlying_mode: underlying_mode.to_string(),
            version: version.to_string(),
            rx_depth: AtomicU32::new(8),
            tx_depth: AtomicU32::new(8),
            radio: Arc::downgrade(&shared),
            self_ref: self_ref.clone(),
            active_slice: Mutex::new(None),
            streams: StreamIds::default(),
            callbacks: Callbacks::default(),
            meters: Mutex::new(Vec::new()),
            plane: Mutex::new(None),
            context: Mutex::new(None),
        });

        shared.register_waveform(Arc::clone(&waveform));
        Ok(waveform)
    }

    // -- attributes ---------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn underlying_mode(&self) -> &str {
        &self.underlying_mode
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Slice currently running this waveform, if any.
    pub fn active_slice(&self) -> Option<u8> {
        *self.active_slice.lock().unwrap()
    }

    /// Set the RX filter depth requested at radio initialization.
    pub fn set_rx_depth(&self, depth: u32) {
        self.rx_depth.store(depth, Ordering::Relaxed);
    }

    /// Set the TX filter depth requested at radio initialization.
    pub fn set_tx_depth(&self, depth: u32) {
        self.tx_depth.store(depth, Ordering::Relaxed);
    }

    pub fn rx_depth(&self) -> u32 {
        self.rx_depth.load(Ordering::Relaxed)
    }

    pub fn tx_depth(&self) -> u32 {
        self.tx_depth.load(Ordering::Relaxed)
    }

    // -- user context -------------------------------------------------------

    /// Attach an arbitrary value to this waveform, retrievable from any
    /// callback via [`context`](Waveform::context). Not synchronized beyond
    /// the pointer swap; interior thread safety is the caller's business.
    pub fn set_context<T: Any + Send + Sync>(&self, value: T) {
        *self.context.lock().unwrap() = Some(Arc::new(value));
    }

    /// The value stored with [`set_context`](Waveform::set_context), if its
    /// type matches.
    pub fn context<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let guard = self.context.lock().unwrap();
        guard.clone().and_then(|any| any.downcast::<T>().ok())
    }

    // -- callback registration ---------------------------------------------

    /// Register a status callback for a status subject (e.g. `"slice"`).
    /// The callback receives the tokenized status body.
    pub fn on_status(
        &self,
        subject: &str,
        cb: impl Fn(&Waveform, &[String]) + Send + Sync + 'static,
    ) {
        self.callbacks
            .status
            .lock()
            .unwrap()
            .push((subject.to_string(), Arc::new(cb)));
    }

    /// Register a state callback for activation, deactivation, PTT and
    /// unkey transitions.
    pub fn on_state(&self, cb: impl Fn(&Waveform, WaveformState) + Send + Sync + 'static) {
        self.callbacks.state.lock().unwrap().push(Arc::new(cb));
    }

    /// Register a command callback for a radio-originated command verb.
    pub fn on_command(
        &self,
        verb: &str,
        cb: impl Fn(&Waveform, &[String]) -> i32 + Send + Sync + 'static,
    ) {
        self.callbacks
            .command
            .lock()
            .unwrap()
            .push((verb.to_string(), Arc::new(cb)));
    }

    /// Register a callback for received RX audio packets.
    pub fn on_rx_data(&self, cb: impl Fn(&Waveform, &VitaPacket) + Send + Sync + 'static) {
        self.callbacks.rx_data.lock().unwrap().push(Arc::new(cb));
    }

    /// Register a callback for received TX (microphone) audio packets.
    pub fn on_tx_data(&self, cb: impl Fn(&Waveform, &VitaPacket) + Send + Sync + 'static) {
        self.callbacks.tx_data.lock().unwrap().push(Arc::new(cb));
    }

    /// Register a callback for received RX byte-stream packets.
    pub fn on_rx_bytes(&self, cb: impl Fn(&Waveform, &VitaPacket) + Send + Sync + 'static) {
        self.callbacks.rx_bytes.lock().unwrap().push(Arc::new(cb));
    }

    /// Register a callback for received TX byte-stream packets.
    pub fn on_tx_bytes(&self, cb: impl Fn(&Waveform, &VitaPacket) + Send + Sync + 'static) {
        self.callbacks.tx_bytes.lock().unwrap().push(Arc::new(cb));
    }

    /// Register a callback for VITA-49 packets that match no known stream
    /// (1PPS and friends).
    pub fn on_unknown_data(&self, cb: impl Fn(&Waveform, &VitaPacket) + Send + Sync + 'static) {
        self.callbacks.unknown.lock().unwrap().push(Arc::new(cb));
    }

    // -- control-channel sends ---------------------------------------------

    /// Send a command to the radio without caring about the response.
    /// Returns the assigned sequence number.
    pub fn send_command(&self, command: &str) -> Result<u32> {
        self.send_command_inner(command, None, None, None)
    }

    /// Send a command and invoke `cb` with the response code and message
    /// when the final response arrives. The callback runs on a worker
    /// thread, not on the caller's.
    pub fn send_command_with_cb(
        &self,
        command: &str,
        cb: impl FnOnce(&Waveform, u32, &str) + Send + 'static,
    ) -> Result<u32> {
        self.send_command_inner(command, None, Some(Box::new(cb)), None)
    }

    /// Send a command the radio should execute at a wall-clock instant.
    ///
    /// `complete` fires on the final response; `queued` fires when the
    /// radio acknowledges queuing the command (a non-zero queue code is
    /// final and fires `queued` only).
    pub fn send_timed_command(
        &self,
        at: SystemTime,
        command: &str,
        complete: Option<ResponseCallback>,
        queued: Option<ResponseCallback>,
    ) -> Result<u32> {
        self.send_command_inner(command, Some(at), complete, queued)
    }

    fn send_command_inner(
        &self,
        command: &str,
        at: Option<SystemTime>,
        complete: Option<ResponseCallback>,
        queued: Option<ResponseCallback>,
    ) -> Result<u32> {
        let shared = self.radio.upgrade().ok_or(Error::NotConnected)?;
        let waveform = self.self_ref.upgrade().ok_or(Error::NotConnected)?;
        shared.send_command(&waveform, command, at, complete, queued)
    }

    // -- data-channel sends -------------------------------------------------

    /// Send 32-bit float samples to the radio's speaker path or
    /// transmitter. Samples are pairs (L/R or I/Q depending on the
    /// underlying mode), at most [`crate::vita::MAX_AUDIO_SAMPLES`] per
    /// call; oversized payloads produce no wire output.
    pub fn send_audio_packet(&self, samples: &[f32], target: DataTarget) -> Result<()> {
        let plane = self.active_plane()?;
        let stream_id = self.outgoing_audio_stream(target)?;
        plane.send_audio(stream_id, samples)
    }

    /// Send opaque bytes to the radio's byte-stream endpoint for the given
    /// target.
    pub fn send_byte_packet(&self, data: &[u8], target: DataTarget) -> Result<()> {
        let plane = self.active_plane()?;
        let stream_id = self.outgoing_byte_stream(target)?;
        plane.send_bytes(stream_id, data)
    }

    // -- meters -------------------------------------------------------------

    /// Register a meter. Duplicate names are rejected.
    pub fn register_meter(&self, name: &str, min: f32, max: f32, unit: MeterUnit) -> Result<()> {
        meters::register_meter(self, name, min, max, unit)
    }

    /// Register several meters at once.
    pub fn register_meter_list(&self, list: &[(&str, f32, f32, MeterUnit)]) -> Result<()> {
        for &(name, min, max, unit) in list {
            meters::register_meter(self, name, min, max, unit)?;
        }
        Ok(())
    }

    /// Set a meter from a float, encoding it into the unit's fixed-point
    /// representation. Values outside the meter's `[min, max]` range, the
    /// unit's representable range, or that are not finite are rejected and
    /// leave the meter untouched.
    pub fn set_meter_float(&self, name: &str, value: f32) -> Result<()> {
        meters::set_meter_float(self, name, value)
    }

    /// Set a meter's raw fixed-point value, without range checking. A value
    /// of -1 reads back as "unset".
    pub fn set_meter_int(&self, name: &str, value: i16) -> Result<()> {
        meters::set_meter_int(self, name, value)
    }

    /// Send every meter that has a pending value in one coalesced packet,
    /// resetting them to unset.
    pub fn send_meters(&self) -> Result<()> {
        let plane = self.active_plane()?;
        meters::send_meters(self, &plane)
    }

    // -- internals ----------------------------------------------------------

    fn active_plane(&self) -> Result<Arc<DataPlane>> {
        self.plane
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NotConnected)
    }

    /// Outgoing audio stream id for a target, falling back to the learned
    /// incoming id of the same direction when the radio has not reported
    /// an outgoing id.
    fn outgoing_audio_stream(&self, target: DataTarget) -> Result<u32> {
        let (out, fallback) = match target {
            DataTarget::Transmitter => (&self.streams.tx_audio_out, &self.streams.tx_audio_in),
            DataTarget::Speaker => (&self.streams.rx_audio_out, &self.streams.rx_audio_in),
        };
        match out.load(Ordering::Acquire) {
            0 => match fallback.load(Ordering::Acquire) {
                0 => Err(Error::NotConnected),
                id => Ok(id),
            },
            id => Ok(id),
        }
    }

    /// Outgoing byte stream id for a target.
    fn outgoing_byte_stream(&self, target: DataTarget) -> Result<u32> {
        match self.streams.byte_out.load(Ordering::Acquire) {
            0 => {
                // Fall back to the learned incoming byte id whose direction
                // bit matches the target.
                let id = self.streams.byte_in.load(Ordering::Acquire);
                let want_tx = target == DataTarget::Transmitter;
                if id != 0 && (id & 1 == 1) == want_tx {
                    Ok(id)
                } else {
                    Err(Error::NotConnected)
                }
            }
            id => Ok(id),
        }
    }
}

impl std::fmt::Debug for Waveform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waveform")
            .field("name", &self.name)
            .field("short_name", &self.short_name)
            .field("underlying_mode", &self.underlying_mode)
            .field("version", &self.version)
            .field("active_slice", &self.active_slice())
            .finish_non_exhaustive()
    }
}
