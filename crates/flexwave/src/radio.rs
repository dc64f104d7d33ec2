//! The radio handle and its control-plane engine.
//!
//! A [`Radio`] owns the TCP control connection: a reader task that frames
//! and dispatches incoming lines, a writer task that serializes outgoing
//! command frames, the response queue correlating sequence numbers to
//! completion callbacks, and the list of configured waveforms.
//!
//! On connect the engine subscribes to slice, radio and client status,
//! creates every configured waveform on the radio, and registers its
//! meters. Slice status then drives the activation state machine: when a
//! slice selects a waveform's mode the waveform goes active and its data
//! plane comes up; when the slice moves away it goes inactive and the data
//! plane is torn down. Interlock status fans PTT/unkey transitions out to
//! the active waveforms.
//!
//! Status, command, response and state callbacks run on the blocking
//! worker pool in enqueue order; they may run concurrently with one
//! another, so users must not assume mutual exclusion between them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use flexwave_core::{split_args, find_kwarg, find_kwarg_as_int, Error, Result, WaveformState};

use crate::codec::{self, ApiVersion, ControlMessage};
use crate::data::DataPlane;
use crate::meters;
use crate::waveform::{ResponseCallback, StateCallback, Waveform};

/// Default control channel port.
pub const CONTROL_PORT: u16 = 4992;

/// Default data channel port.
pub const DATA_PORT: u16 = 4991;

/// Connection options for a radio.
#[derive(Debug, Clone)]
pub struct RadioOptions {
    /// UDP port the radio's data plane listens on.
    pub data_port: u16,
    /// Timeout for the TCP connect.
    pub connect_timeout: Duration,
}

impl Default for RadioOptions {
    fn default() -> Self {
        RadioOptions {
            data_port: DATA_PORT,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// One outstanding command awaiting its response.
///
/// At most one entry exists per sequence. The entry leaves the queue when
/// the final `R` frame arrives, or when a `Q` frame reports a non-zero
/// code.
pub(crate) struct ResponseEntry {
    waveform: Arc<Waveform>,
    completion: Option<ResponseCallback>,
    queued: Option<ResponseCallback>,
}

/// State shared between the radio handle, its tasks, and its waveforms.
pub(crate) struct RadioShared {
    addr: SocketAddr,
    options: RadioOptions,
    sequence: AtomicU32,
    /// Serializes sequence assignment + frame submission so emitted
    /// sequence numbers are consecutive on the wire.
    send_lock: Mutex<()>,
    responses: Mutex<HashMap<u32, ResponseEntry>>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    version: Mutex<Option<ApiVersion>>,
    session_handle: Mutex<Option<u32>>,
    waveforms: Mutex<Vec<Arc<Waveform>>>,
}

impl RadioShared {
    pub(crate) fn register_waveform(&self, waveform: Arc<Waveform>) {
        self.waveforms.lock().unwrap().push(waveform);
    }

    /// Assign a sequence number, queue the response entry, and submit the
    /// framed command to the writer. The entry is inserted before the
    /// frame leaves so a fast response can always correlate.
    pub(crate) fn send_command(
        &self,
        waveform: &Arc<Waveform>,
        command: &str,
        at: Option<SystemTime>,
        completion: Option<ResponseCallback>,
        queued: Option<ResponseCallback>,
    ) -> Result<u32> {
        let tx = self
            .cmd_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NotConnected)?;

        let _guard = self.send_lock.lock().unwrap();
        let seq = self.sequence.load(Ordering::Relaxed);
        self.sequence
            .store(codec::next_sequence(seq), Ordering::Relaxed);

        if completion.is_some() || queued.is_some() {
            self.responses.lock().unwrap().insert(
                seq,
                ResponseEntry {
                    waveform: Arc::clone(waveform),
                    completion,
                    queued,
                },
            );
        }

        let frame = match at {
            Some(at) => codec::encode_timed_command(seq, at, command),
            None => codec::encode_command(seq, command),
        };
        tracing::debug!(seq, command, "Tx");

        if tx.send(frame).is_err() {
            self.responses.lock().unwrap().remove(&seq);
            return Err(Error::ConnectionLost);
        }
        Ok(seq)
    }
}

/// A handle to one radio.
///
/// Create it, configure waveforms on it, then [`start`](Radio::start) it.
/// The handle clones cheaply; all clones refer to the same radio.
#[derive(Clone)]
pub struct Radio {
    shared: Arc<RadioShared>,
    control_task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<Result<()>>>>>,
    started: Arc<AtomicBool>,
}

impl Radio {
    /// Create a radio handle for the given control address
    /// (`ip:4992` for a stock radio). Nothing is connected yet.
    pub fn new(addr: SocketAddr) -> Radio {
        Radio::new_with_options(addr, RadioOptions::default())
    }

    /// Create a radio handle with explicit options.
    pub fn new_with_options(addr: SocketAddr, options: RadioOptions) -> Radio {
        Radio {
            shared: Arc::new(RadioShared {
                addr,
                options,
                sequence: AtomicU32::new(0),
                send_lock: Mutex::new(()),
                responses: Mutex::new(HashMap::new()),
                cmd_tx: Mutex::new(None),
                version: Mutex::new(None),
                session_handle: Mutex::new(None),
                waveforms: Mutex::new(Vec::new()),
            }),
            control_task: Arc::new(tokio::sync::Mutex::new(None)),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn shared(&self) -> Arc<RadioShared> {
        Arc::clone(&self.shared)
    }

    /// Connect to the radio and start the control engine.
    ///
    /// All waveforms, callbacks, and meters must be configured before this
    /// call; registration afterwards is undefined.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidParameter("radio already started".into()));
        }

        let shared = Arc::clone(&self.shared);
        tracing::debug!(addr = %shared.addr, "connecting to radio");

        let stream = tokio::time::timeout(
            shared.options.connect_timeout,
            TcpStream::connect(shared.addr),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::Transport(format!("connect to {} failed: {e}", shared.addr)))?;
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = tokio::io::split(stream);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *shared.cmd_tx.lock().unwrap() = Some(cmd_tx);
        tokio::spawn(write_loop(write_half, cmd_rx));

        tracing::info!(addr = %shared.addr, "connected to radio");
        radio_init(&shared);

        let loop_shared = Arc::clone(&shared);
        let task = tokio::spawn(control_loop(loop_shared, BufReader::new(read_half)));
        *self.control_task.lock().await = Some(task);

        Ok(())
    }

    /// Wait for the control engine to finish (EOF, error, or
    /// [`destroy`](Radio::destroy)).
    pub async fn wait(&self) -> Result<()> {
        let task = self.control_task.lock().await.take();
        match task {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => Err(Error::Transport(format!("control task failed: {e}"))),
            },
            None => Ok(()),
        }
    }

    /// Tear the radio down: stop the control engine and every waveform's
    /// data plane. After this returns no callback will run.
    pub async fn destroy(&self) {
        if let Some(task) = self.control_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        let shared = Arc::clone(&self.shared);
        let _ = tokio::task::spawn_blocking(move || teardown(&shared)).await;
    }

    /// The API version from the connection handshake, once received.
    pub fn api_version(&self) -> Option<ApiVersion> {
        *self.shared.version.lock().unwrap()
    }

    /// The session handle from the connection handshake, once received.
    pub fn session_handle(&self) -> Option<u32> {
        *self.shared.session_handle.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

/// Drains framed commands onto the TCP stream. Exits when every sender is
/// gone (teardown clears the stored sender).
async fn write_loop(
    mut writer: WriteHalf<TcpStream>,
    mut cmd_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = cmd_rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::error!(error = %e, "control write failed");
            break;
        }
        let _ = writer.flush().await;
    }
    let _ = writer.shutdown().await;
}

// ---------------------------------------------------------------------------
// Radio initialization
// ---------------------------------------------------------------------------

/// Subscribe to status and create every configured waveform and its meters
/// on the radio.
fn radio_init(shared: &Arc<RadioShared>) {
    let waveforms = shared.waveforms.lock().unwrap().clone();
    let mut subscribed = false;

    for waveform in &waveforms {
        if !subscribed {
            for sub in ["sub slice all", "sub radio all", "sub client all"] {
                if let Err(e) = waveform.send_command(sub) {
                    tracing::error!(error = %e, command = sub, "subscription failed");
                }
            }
            subscribed = true;
        }

        let create = format!(
            "waveform create name={} mode={} underlying_mode={} version={}",
            waveform.name(),
            waveform.short_name(),
            waveform.underlying_mode(),
            waveform.version()
        );
        let result = waveform.send_command_with_cb(&create, store_stream_ids);
        if let Err(e) = result {
            tracing::error!(error = %e, waveform = waveform.name(), "waveform create failed");
        }

        for command in [
            format!("waveform set {} tx=1", waveform.name()),
            format!(
                "waveform set {} rx_filter depth={}",
                waveform.name(),
                waveform.rx_depth()
            ),
            format!(
                "waveform set {} tx_filter depth={}",
                waveform.name(),
                waveform.tx_depth()
            ),
        ] {
            if let Err(e) = waveform.send_command(&command) {
                tracing::error!(error = %e, command, "waveform setup failed");
            }
        }

        meters::create_meters(waveform);
    }
}

/// Populate the waveform's stream ids from the `waveform create` response
/// kwargs. Ids the radio does not report stay at zero and are learned
/// lazily from the first matching data packet.
fn store_stream_ids(waveform: &Waveform, code: u32, message: &str) {
    if code != 0 {
        tracing::error!(code, message, "waveform create rejected");
        return;
    }
    let Ok(argv) = split_args(message) else {
        tracing::info!(message, "unparseable waveform create response");
        return;
    };

    let ids = [
        ("tx_audio_in", &waveform.streams.tx_audio_in),
        ("tx_audio_out", &waveform.streams.tx_audio_out),
        ("rx_audio_in", &waveform.streams.rx_audio_in),
        ("rx_audio_out", &waveform.streams.rx_audio_out),
        ("byte_in", &waveform.streams.byte_in),
        ("byte_out", &waveform.streams.byte_out),
    ];
    for (key, slot) in ids {
        if let Some(id) = find_kwarg_as_int(&argv, key) {
            if id <= u32::MAX as u64 {
                slot.store(id as u32, Ordering::Release);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

/// The control-plane event loop: frames lines off the TCP stream and
/// dispatches each one. Exits on EOF or a read error, then tears down
/// every waveform's data plane.
async fn control_loop(
    shared: Arc<RadioShared>,
    mut reader: BufReader<ReadHalf<TcpStream>>,
) -> Result<()> {
    let mut line_buf = String::new();
    let result = loop {
        line_buf.clear();
        match reader.read_line(&mut line_buf).await {
            Ok(0) => {
                tracing::info!("radio closed the control connection");
                break Ok(());
            }
            Ok(_) => {
                let line = line_buf.trim_end_matches(['\r', '\n']);
                if line.is_empty() {
                    continue;
                }
                tracing::trace!(line, "Rx");
                match codec::parse_line(line) {
                    Ok(message) => dispatch_message(&shared, message),
                    Err(e) => tracing::info!(error = %e, line, "unparseable control line"),
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "control read failed");
                break Err(Error::Io(e));
            }
        }
    };

    let teardown_shared = Arc::clone(&shared);
    let _ = tokio::task::spawn_blocking(move || teardown(&teardown_shared)).await;
    result
}

/// Close the command channel, drop outstanding responses, and stop every
/// waveform's data plane.
fn teardown(shared: &Arc<RadioShared>) {
    *shared.cmd_tx.lock().unwrap() = None;
    shared.responses.lock().unwrap().clear();

    let waveforms = shared.waveforms.lock().unwrap().clone();
    for waveform in waveforms {
        *waveform.active_slice.lock().unwrap() = None;
        let plane = waveform.plane.lock().unwrap().take();
        if let Some(plane) = plane {
            plane.stop();
        }
    }
    tracing::debug!("radio torn down");
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

fn dispatch_message(shared: &Arc<RadioShared>, message: ControlMessage) {
    match message {
        ControlMessage::Version(version) => {
            tracing::info!(
                major = version.major,
                minor = version.minor,
                build = version.build,
                sub = version.sub,
                "radio API version"
            );
            *shared.version.lock().unwrap() = Some(version);
        }
        ControlMessage::Handle(handle) => {
            tracing::debug!(handle = format!("{handle:08X}"), "session handle");
            *shared.session_handle.lock().unwrap() = Some(handle);
        }
        ControlMessage::Status { handle: _, body } => process_status(shared, &body),
        ControlMessage::LogMessage(text) => {
            tracing::info!(message = %text, "radio message");
        }
        ControlMessage::Response {
            sequence,
            code,
            message,
        } => on_response(shared, sequence, code, message),
        ControlMessage::Queued {
            sequence,
            code,
            message,
        } => on_queued(shared, sequence, code, message),
        ControlMessage::Command { sequence, body } => process_command(shared, sequence, &body),
    }
}

/// Final response: fire the completion callback and drop the entry.
/// Responses without a matching entry are dropped silently.
fn on_response(shared: &Arc<RadioShared>, sequence: u32, code: u32, message: String) {
    let entry = shared.responses.lock().unwrap().remove(&sequence);
    let Some(entry) = entry else {
        tracing::trace!(sequence, "response for unknown sequence");
        return;
    };
    if let Some(callback) = entry.completion {
        let waveform = entry.waveform;
        tokio::task::spawn_blocking(move || callback(&waveform, code, &message));
    }
}

/// Queued acknowledgement: fire the queued callback. A non-zero code is
/// final and removes the entry; a zero code leaves the entry waiting for
/// its `R` frame.
fn on_queued(shared: &Arc<RadioShared>, sequence: u32, code: u32, message: String) {
    let (waveform, callback) = {
        let mut responses = shared.responses.lock().unwrap();
        if code != 0 {
            let Some(entry) = responses.remove(&sequence) else {
                return;
            };
            (entry.waveform, entry.queued)
        } else {
            let Some(entry) = responses.get_mut(&sequence) else {
                return;
            };
            (Arc::clone(&entry.waveform), entry.queued.take())
        }
    };
    if let Some(callback) = callback {
        tokio::task::spawn_blocking(move || callback(&waveform, code, &message));
    }
}

/// Schedule state callbacks for one waveform on the callback pool.
fn fire_state(waveform: &Arc<Waveform>, state: WaveformState) {
    let callbacks: Vec<StateCallback> = waveform.callbacks.state.lock().unwrap().clone();
    for callback in callbacks {
        let waveform = Arc::clone(waveform);
        tokio::task::spawn_blocking(move || callback(&waveform, state));
    }
}

/// Built-in status handling plus fan-out to registered status callbacks.
fn process_status(shared: &Arc<RadioShared>, body: &str) {
    let argv = match split_args(body) {
        Ok(argv) if !argv.is_empty() => argv,
        _ => return,
    };

    match argv[0].as_str() {
        "slice" if argv.len() >= 2 => {
            if let Some(mode) = find_kwarg(&argv, "mode") {
                match argv[1].parse::<u8>() {
                    Ok(slice) => mode_change(shared, mode, slice),
                    Err(_) => {
                        tracing::info!(token = %argv[1], "bad slice index in status");
                    }
                }
            }
        }
        "interlock" => {
            if let Some(state) = find_kwarg(&argv, "state") {
                interlock_change(shared, state);
            }
        }
        _ => {}
    }

    let waveforms = shared.waveforms.lock().unwrap().clone();
    for waveform in waveforms {
        let matching: Vec<_> = waveform
            .callbacks
            .status
            .lock()
            .unwrap()
            .iter()
            .filter(|(subject, _)| *subject == argv[0])
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in matching {
            let waveform = Arc::clone(&waveform);
            let argv = argv.clone();
            tokio::task::spawn_blocking(move || callback(&waveform, &argv));
        }
    }
}

/// The slice state machine: activate and deactivate waveforms as slices
/// pick up or drop their modes.
fn mode_change(shared: &Arc<RadioShared>, mode: &str, slice: u8) {
    tracing::debug!(mode, slice, "slice mode change");

    let waveforms = shared.waveforms.lock().unwrap().clone();
    for waveform in &waveforms {
        // The slice moved away from this waveform's mode.
        if waveform.active_slice() == Some(slice) && waveform.short_name() != mode {
            *waveform.active_slice.lock().unwrap() = None;
            fire_state(waveform, WaveformState::Inactive);
            let plane = waveform.plane.lock().unwrap().take();
            if let Some(plane) = plane {
                tokio::task::spawn_blocking(move || plane.stop());
            }
        }

        // The slice selected this waveform's mode and no other slice owns
        // the waveform.
        if waveform.active_slice().is_none() && waveform.short_name() == mode {
            *waveform.active_slice.lock().unwrap() = Some(slice);
            fire_state(waveform, WaveformState::Active);
            match DataPlane::start(waveform, shared.addr.ip(), shared.options.data_port) {
                Ok(plane) => *waveform.plane.lock().unwrap() = Some(plane),
                Err(e) => {
                    tracing::error!(error = %e, waveform = waveform.name(), "data plane failed");
                }
            }
        }
    }
}

/// Fan interlock transitions out to every active waveform.
fn interlock_change(shared: &Arc<RadioShared>, state: &str) {
    let state = match state {
        "PTT_REQUESTED" => WaveformState::PttRequested,
        "UNKEY_REQUESTED" => WaveformState::UnkeyRequested,
        _ => return,
    };

    let waveforms = shared.waveforms.lock().unwrap().clone();
    for waveform in &waveforms {
        if waveform.active_slice().is_some() {
            fire_state(waveform, state);
        }
    }
}

/// Dispatch a radio-originated command to the command callbacks of the
/// waveform owning the named slice, and report each callback's status
/// back with a `waveform response`.
fn process_command(shared: &Arc<RadioShared>, sequence: u32, body: &str) {
    let argv = match split_args(body) {
        Ok(argv) => argv,
        Err(e) => {
            tracing::info!(error = %e, body, "unparseable radio command");
            return;
        }
    };
    if argv.len() < 3 || argv[0] != "slice" {
        return;
    }
    let Ok(slice) = argv[1].parse::<u8>() else {
        tracing::info!(token = %argv[1], "bad slice index in radio command");
        return;
    };
    let verb = &argv[2];
    let args: Vec<String> = argv[3..].to_vec();

    let waveforms = shared.waveforms.lock().unwrap().clone();
    for waveform in &waveforms {
        if waveform.active_slice() != Some(slice) {
            continue;
        }
        let matching: Vec<_> = waveform
            .callbacks
            .command
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == verb)
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in matching {
            let waveform = Arc::clone(waveform);
            let args = args.clone();
            tokio::task::spawn_blocking(move || {
                let status = callback(&waveform, &args);
                let reply = if status == 0 {
                    format!("waveform response {sequence}|0")
                } else {
                    format!(
                        "waveform response {sequence}|{:08x}",
                        (status as u32).wrapping_add(0x5000_0000)
                    )
                };
                if let Err(e) = waveform.send_command(&reply) {
                    tracing::warn!(error = %e, "failed to send waveform response");
                }
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
