//! The per-activation UDP data plane.
//!
//! When a slice activates a waveform, the control plane spins up a
//! [`DataPlane`]: a UDP socket bound to an OS-chosen port and connected to
//! the radio's data port, announced to the radio with `waveform set <name>
//! udpport=<port>` and `client udpport <port>`. A dedicated realtime I/O
//! thread then reads one datagram per wakeup, parses it, classifies it
//! into one of the logical streams (TX/RX audio, TX/RX bytes, unknown) and
//! fans it out to the registered callbacks through the data worker, so no
//! user code ever runs on the socket thread.
//!
//! Stream ids are learned as they appear: the first audio packet whose low
//! bit marks it TX seeds the incoming TX audio id, and so on. Packets on a
//! different id for an already-seeded stream are dropped and logged.
//! Emits go straight out on the connected socket from whatever thread
//! calls the send API.

use std::net::{IpAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flexwave_core::{Error, Result};

use crate::rt::{self, RtRole};
use crate::vita::{self, PacketKind, VitaPacket};
use crate::waveform::{DataCallback, Waveform};
use crate::worker::{DataWorker, WorkItem};

/// Poll interval for the cooperative shutdown flag on the socket thread.
const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Receive buffer, sized past the largest legal packet (28 + 1440 bytes).
const RECV_BUFFER: usize = 2048;

/// One activation's worth of UDP data plane.
pub(crate) struct DataPlane {
    socket: UdpSocket,
    local_port: u16,
    running: Arc<AtomicBool>,
    io_thread: Mutex<Option<thread::JoinHandle<()>>>,
    worker: Mutex<DataWorker>,
    data_sequence: AtomicU32,
    meter_sequence: AtomicU32,
    /// Incoming byte-stream ids learned per direction. The waveform's
    /// `byte_in` from the create response seeds the side its low bit
    /// indicates.
    byte_tx_in: AtomicU32,
    byte_rx_in: AtomicU32,
}

impl DataPlane {
    /// Bring up the data plane for an activated waveform: bind, connect to
    /// the radio, announce the local port, and start the realtime read
    /// loop.
    pub(crate) fn start(
        waveform: &Arc<Waveform>,
        radio_ip: IpAddr,
        data_port: u16,
    ) -> Result<Arc<DataPlane>> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .map_err(|e| Error::Transport(format!("failed to bind data socket: {e}")))?;
        socket
            .connect((radio_ip, data_port))
            .map_err(|e| Error::Transport(format!("failed to connect data socket: {e}")))?;
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| Error::Transport(format!("failed to set read timeout: {e}")))?;
        let local_port = socket
            .local_addr()
            .map_err(|e| Error::Transport(format!("failed to read data socket port: {e}")))?
            .port();

        tracing::debug!(
            waveform = waveform.name(),
            port = local_port,
            radio = %radio_ip,
            "data plane starting"
        );

        let plane = Arc::new(DataPlane {
            socket: socket
                .try_clone()
                .map_err(|e| Error::Transport(format!("failed to clone data socket: {e}")))?,
            local_port,
            running: Arc::new(AtomicBool::new(true)),
            io_thread: Mutex::new(None),
            worker: Mutex::new(DataWorker::spawn()?),
            data_sequence: AtomicU32::new(0),
            meter_sequence: AtomicU32::new(0),
            byte_tx_in: AtomicU32::new(0),
            byte_rx_in: AtomicU32::new(0),
        });

        // The create response may already have named the incoming byte
        // stream; its low bit says which direction it serves.
        let byte_in = waveform.streams.byte_in.load(Ordering::Acquire);
        if byte_in != 0 {
            if byte_in & 1 == 1 {
                plane.byte_tx_in.store(byte_in, Ordering::Release);
            } else {
                plane.byte_rx_in.store(byte_in, Ordering::Release);
            }
        }

        // Tell the radio where to aim the stream. Failures are logged, not
        // fatal: the commands can only fail when the control channel is
        // down, and then the activation is already unwinding.
        if let Err(e) = waveform.send_command(&format!(
            "waveform set {} udpport={}",
            waveform.name(),
            local_port
        )) {
            tracing::warn!(error = %e, "failed to announce waveform udp port");
        }
        if let Err(e) = waveform.send_command(&format!("client udpport {local_port}")) {
            tracing::warn!(error = %e, "failed to announce client udp port");
        }

        let io_running = Arc::clone(&plane.running);
        let io_plane = Arc::clone(&plane);
        let io_waveform = Arc::clone(waveform);
        let handle = thread::Builder::new()
            .name("flexwave-data-io".into())
            .spawn(move || {
                rt::set_realtime_priority(RtRole::DataIo);
                let mut buf = [0u8; RECV_BUFFER];

                while io_running.load(Ordering::SeqCst) {
                    match socket.recv(&mut buf) {
                        Ok(n) => io_plane.handle_datagram(&io_waveform, &buf[..n]),
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "data socket read failed");
                        }
                    }
                }
                tracing::debug!("data I/O thread exiting");
            })
            .map_err(|e| Error::Transport(format!("cannot spawn data I/O thread: {e}")))?;
        *plane.io_thread.lock().unwrap() = Some(handle);

        Ok(plane)
    }

    /// Local UDP port the plane is bound to.
    pub(crate) fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Tear the plane down: stop the worker first so no callback outlives
    /// shutdown, then stop and join the socket thread.
    pub(crate) fn stop(&self) {
        self.worker.lock().unwrap().shutdown();
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.io_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        tracing::debug!(port = self.local_port, "data plane stopped");
    }

    // -- receive path -------------------------------------------------------

    fn handle_datagram(&self, waveform: &Arc<Waveform>, datagram: &[u8]) {
        let packet = match vita::parse(datagram) {
            Ok(p) => p,
            Err(e) => {
                tracing::info!(error = %e, bytes = datagram.len(), "dropping bad VITA packet");
                return;
            }
        };

        match packet.kind() {
            PacketKind::Audio => {
                let slot = if packet.is_transmit() {
                    &waveform.streams.tx_audio_in
                } else {
                    &waveform.streams.rx_audio_in
                };
                if !learn_stream(slot, packet.stream_id) {
                    tracing::info!(
                        stream_id = format!("0x{:08X}", packet.stream_id),
                        "dropping audio packet on unexpected stream"
                    );
                    return;
                }
                let list = if packet.is_transmit() {
                    &waveform.callbacks.tx_data
                } else {
                    &waveform.callbacks.rx_data
                };
                self.dispatch(waveform, list, packet);
            }
            PacketKind::ByteData => {
                let slot = if packet.is_transmit() {
                    &self.byte_tx_in
                } else {
                    &self.byte_rx_in
                };
                if !learn_stream(slot, packet.stream_id) {
                    tracing::info!(
                        stream_id = format!("0x{:08X}", packet.stream_id),
                        "dropping byte packet on unexpected stream"
                    );
                    return;
                }
                // Keep the waveform's learned byte id for the emit path.
                let _ = waveform.streams.byte_in.compare_exchange(
                    0,
                    packet.stream_id,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                let list = if packet.is_transmit() {
                    &waveform.callbacks.tx_bytes
                } else {
                    &waveform.callbacks.rx_bytes
                };
                self.dispatch(waveform, list, packet);
            }
            PacketKind::Unknown => {
                self.dispatch(waveform, &waveform.callbacks.unknown, packet);
            }
        }
    }

    /// Enqueue one work item per registered callback, in registration
    /// order. Each item carries its own copy of the packet.
    fn dispatch(
        &self,
        waveform: &Arc<Waveform>,
        list: &Mutex<Vec<DataCallback>>,
        packet: VitaPacket,
    ) {
        let callbacks: Vec<DataCallback> = list.lock().unwrap().clone();
        let worker = self.worker.lock().unwrap();
        for callback in callbacks {
            worker.enqueue(WorkItem {
                waveform: Arc::clone(waveform),
                callback,
                packet: packet.clone(),
            });
        }
    }

    // -- emit path ----------------------------------------------------------

    /// Next 4-bit sequence value for data packets.
    fn next_data_sequence(&self) -> u8 {
        (self.data_sequence.fetch_add(1, Ordering::Relaxed) & 0x0F) as u8
    }

    /// Next 4-bit sequence value for meter packets.
    pub(crate) fn next_meter_sequence(&self) -> u8 {
        (self.meter_sequence.fetch_add(1, Ordering::Relaxed) & 0x0F) as u8
    }

    /// Send float samples on the given stream.
    pub(crate) fn send_audio(&self, stream_id: u32, samples: &[f32]) -> Result<()> {
        let (ts_int, ts_frac) = wall_clock_timestamps();
        let packet =
            VitaPacket::audio(stream_id, self.next_data_sequence(), ts_int, ts_frac, samples)?;
        self.send_packet(&packet)
    }

    /// Send opaque bytes on the given stream.
    pub(crate) fn send_bytes(&self, stream_id: u32, data: &[u8]) -> Result<()> {
        let (ts_int, ts_frac) = wall_clock_timestamps();
        let packet =
            VitaPacket::byte_data(stream_id, self.next_data_sequence(), ts_int, ts_frac, data)?;
        self.send_packet(&packet)
    }

    /// Encode and emit a packet on the connected socket.
    pub(crate) fn send_packet(&self, packet: &VitaPacket) -> Result<()> {
        let wire = vita::encode(packet)?;
        let sent = self
            .socket
            .send(&wire)
            .map_err(|e| Error::Transport(format!("data send failed: {e}")))?;
        if sent != wire.len() {
            return Err(Error::Transport(format!(
                "short data send: {sent} of {} bytes",
                wire.len()
            )));
        }
        Ok(())
    }
}

/// Seed a stream-id slot on first use; afterwards only the seeded id is
/// accepted.
fn learn_stream(slot: &AtomicU32, stream_id: u32) -> bool {
    match slot.compare_exchange(0, stream_id, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            tracing::debug!(
                stream_id = format!("0x{stream_id:08X}"),
                "learned stream id"
            );
            true
        }
        Err(current) => current == stream_id,
    }
}

/// Integer + fractional (picosecond) wall-clock timestamps for outgoing
/// packets.
fn wall_clock_timestamps() -> (u32, u64) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    (now.as_secs() as u32, now.subsec_nanos() as u64 * 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::Radio;
    use flexwave_core::DataTarget;
    use std::sync::mpsc;

    /// Bind a fake radio socket and start a plane pointed at it.
    fn start_plane(waveform: &Arc<Waveform>) -> (UdpSocket, Arc<DataPlane>) {
        let radio_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let radio_port = radio_socket.local_addr().unwrap().port();
        radio_socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let plane = DataPlane::start(waveform, "127.0.0.1".parse().unwrap(), radio_port).unwrap();
        // The fake radio aims its packets at the announced port.
        radio_socket
            .connect(("127.0.0.1", plane.local_port()))
            .unwrap();
        (radio_socket, plane)
    }

    fn test_waveform() -> Arc<Waveform> {
        let radio = Radio::new("127.0.0.1:4992".parse().unwrap());
        Waveform::build(&radio, "DataTest", "DATA", "USB", "1.0").unwrap()
    }

    #[test]
    fn rx_audio_reaches_rx_callbacks() {
        let wf = test_waveform();
        let (tx, rx) = mpsc::channel::<Vec<f32>>();
        wf.on_rx_data(move |_wf, packet| {
            tx.send(packet.float_payload().unwrap().to_vec()).unwrap();
        });

        let (radio_socket, plane) = start_plane(&wf);

        let samples = [0.25f32, -0.25, 0.5, -0.5];
        let packet = VitaPacket::audio(0x4000_0002, 0, 1, 2, &samples).unwrap();
        radio_socket.send(&vita::encode(&packet).unwrap()).unwrap();

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, samples);
        assert_eq!(
            wf.streams.rx_audio_in.load(Ordering::Acquire),
            0x4000_0002,
            "first RX packet seeds the incoming RX id"
        );

        plane.stop();
    }

    #[test]
    fn tx_audio_routes_by_low_bit() {
        let wf = test_waveform();
        let (tx, rx) = mpsc::channel::<&'static str>();
        let tx2 = tx.clone();
        wf.on_rx_data(move |_wf, _p| tx.send("rx").unwrap());
        wf.on_tx_data(move |_wf, _p| tx2.send("tx").unwrap());

        let (radio_socket, plane) = start_plane(&wf);

        let packet = VitaPacket::audio(0x4000_0003, 0, 0, 0, &[0.0; 2]).unwrap();
        radio_socket.send(&vita::encode(&packet).unwrap()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "tx");
        assert_eq!(wf.streams.tx_audio_in.load(Ordering::Acquire), 0x4000_0003);

        plane.stop();
    }

    #[test]
    fn mismatched_stream_id_is_dropped() {
        let wf = test_waveform();
        let (tx, rx) = mpsc::channel::<u32>();
        wf.on_rx_data(move |_wf, packet| tx.send(packet.stream_id).unwrap());

        let (radio_socket, plane) = start_plane(&wf);

        let first = VitaPacket::audio(0x4000_0002, 0, 0, 0, &[0.0; 2]).unwrap();
        radio_socket.send(&vita::encode(&first).unwrap()).unwrap();
        let imposter = VitaPacket::audio(0x4000_0004, 1, 0, 0, &[0.0; 2]).unwrap();
        radio_socket.send(&vita::encode(&imposter).unwrap()).unwrap();
        let second = VitaPacket::audio(0x4000_0002, 2, 0, 0, &[0.0; 2]).unwrap();
        radio_socket.send(&vita::encode(&second).unwrap()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0x4000_0002);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0x4000_0002);
        assert!(
            rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "the imposter stream id must not be dispatched"
        );

        plane.stop();
    }

    #[test]
    fn byte_packets_reach_byte_callbacks() {
        let wf = test_waveform();
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        wf.on_rx_bytes(move |_wf, packet| {
            tx.send(packet.byte_payload().unwrap().to_vec()).unwrap();
        });

        let (radio_socket, plane) = start_plane(&wf);

        let packet = VitaPacket::byte_data(0x2000_0002, 0, 0, 0, b"serial data").unwrap();
        radio_socket.send(&vita::encode(&packet).unwrap()).unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            b"serial data"
        );
        assert_eq!(wf.streams.byte_in.load(Ordering::Acquire), 0x2000_0002);

        plane.stop();
    }

    #[test]
    fn unclassified_packets_reach_unknown_callbacks() {
        let wf = test_waveform();
        let (tx, rx) = mpsc::channel::<u16>();
        wf.on_unknown_data(move |_wf, packet| tx.send(packet.packet_class).unwrap());

        let (radio_socket, plane) = start_plane(&wf);

        let mut packet = VitaPacket::audio(0x4000_0002, 0, 0, 0, &[0.0; 2]).unwrap();
        packet.packet_class = 0x0123; // not a known stream format
        radio_socket.send(&vita::encode(&packet).unwrap()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0x0123);

        plane.stop();
    }

    #[test]
    fn send_audio_emits_on_selected_stream() {
        let wf = test_waveform();
        let (radio_socket, plane) = start_plane(&wf);
        *wf.plane.lock().unwrap() = Some(Arc::clone(&plane));
        wf.streams.rx_audio_out.store(0x4000_0010, Ordering::Release);

        wf.send_audio_packet(&[1.0, -1.0], DataTarget::Speaker).unwrap();

        let mut buf = [0u8; 2048];
        let n = radio_socket.recv(&mut buf).unwrap();
        let packet = vita::parse(&buf[..n]).unwrap();
        assert_eq!(packet.kind(), PacketKind::Audio);
        assert_eq!(packet.stream_id, 0x4000_0010);
        assert_eq!(packet.float_payload().unwrap(), &[1.0, -1.0]);

        plane.stop();
    }

    #[test]
    fn data_sequence_counts_mod_16() {
        let wf = test_waveform();
        let (radio_socket, plane) = start_plane(&wf);
        *wf.plane.lock().unwrap() = Some(Arc::clone(&plane));
        wf.streams.tx_audio_out.store(0x4000_0011, Ordering::Release);

        let mut buf = [0u8; 2048];
        for expected in [0u8, 1, 2] {
            wf.send_audio_packet(&[0.0; 2], DataTarget::Transmitter).unwrap();
            let n = radio_socket.recv(&mut buf).unwrap();
            let packet = vita::parse(&buf[..n]).unwrap();
            assert_eq!(packet.sequence, expected);
        }
        for _ in 3..16 {
            wf.send_audio_packet(&[0.0; 2], DataTarget::Transmitter).unwrap();
            radio_socket.recv(&mut buf).unwrap();
        }
        wf.send_audio_packet(&[0.0; 2], DataTarget::Transmitter).unwrap();
        let n = radio_socket.recv(&mut buf).unwrap();
        assert_eq!(vita::parse(&buf[..n]).unwrap().sequence, 0, "wraps mod 16");

        plane.stop();
    }

    #[test]
    fn oversized_audio_produces_no_wire_output() {
        let wf = test_waveform();
        let (radio_socket, plane) = start_plane(&wf);
        *wf.plane.lock().unwrap() = Some(Arc::clone(&plane));
        wf.streams.tx_audio_out.store(0x4000_0011, Ordering::Release);

        let too_many = vec![0.0f32; vita::MAX_AUDIO_SAMPLES + 1];
        let err = wf
            .send_audio_packet(&too_many, DataTarget::Transmitter)
            .unwrap_err();
        assert!(matches!(err, Error::TooBig { .. }));

        radio_socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut buf = [0u8; 2048];
        assert!(radio_socket.recv(&mut buf).is_err(), "nothing may be sent");

        plane.stop();
    }

    #[test]
    fn stop_joins_both_threads() {
        let wf = test_waveform();
        let (_radio_socket, plane) = start_plane(&wf);
        plane.stop();
        assert!(plane.io_thread.lock().unwrap().is_none());
        // A second stop is harmless.
        plane.stop();
    }
}
