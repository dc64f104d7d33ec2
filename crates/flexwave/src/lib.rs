//! flexwave: a host-side waveform runtime for FlexRadio-style SDRs.
//!
//! A "waveform" is user signal-processing code that plugs into the radio at
//! wire level. The radio exposes two network surfaces: a line-oriented TCP
//! control channel (commands, responses, status) and a UDP data channel
//! carrying VITA-49 packets of baseband audio, byte streams, and meter
//! readouts. This crate connects to both, demultiplexes them into
//! lifecycle, status, command, and data events, dispatches those events to
//! user callbacks under strict scheduling and ordering rules, and lets the
//! waveform inject responses, audio, byte data, and meter values back with
//! correct framing, sequencing, and timestamps.
//!
//! - **Control plane** ([`radio`]) -- TCP connection lifecycle,
//!   sequence-numbered commands with completion callbacks, status fan-out,
//!   radio-originated command dispatch, and the slice activation state
//!   machine.
//! - **Data plane** -- a realtime UDP receive loop that classifies packets
//!   into the waveform's logical streams and runs data callbacks on a
//!   dedicated ordered worker thread.
//! - **Wire codec** ([`vita`]) -- bit-exact VITA-49 parse and emit.
//! - **Control codec** ([`codec`]) -- control-line parse and emit.
//! - **Meters** (via [`Waveform`]) -- named meters with fixed-point
//!   encoding and coalesced emission.
//! - **Discovery** ([`discovery`]) -- find a radio from its broadcast
//!   advertisement.
//!
//! # Example
//!
//! ```no_run
//! use flexwave::{DataTarget, Radio, Waveform};
//!
//! # async fn example() -> flexwave::Result<()> {
//! let addr = flexwave::discovery::discover(std::time::Duration::from_secs(5))
//!     .await?
//!     .expect("no radio on the network");
//!
//! let radio = Radio::new(addr);
//! let waveform = Waveform::build(&radio, "Echo", "ECHO", "DIGU", "1.0.0")?;
//! waveform.on_rx_data(|wf, packet| {
//!     if let Some(samples) = packet.float_payload() {
//!         let _ = wf.send_audio_packet(samples, DataTarget::Speaker);
//!     }
//! });
//!
//! radio.start().await?;
//! radio.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub(crate) mod data;
pub mod discovery;
pub(crate) mod meters;
pub mod radio;
pub(crate) mod rt;
pub mod vita;
pub mod waveform;
pub(crate) mod worker;

pub use flexwave_core::{DataTarget, Error, MeterUnit, Result, WaveformState};

pub use codec::ApiVersion;
pub use radio::{Radio, RadioOptions, CONTROL_PORT, DATA_PORT};
pub use vita::{MeterSlot, PacketKind, VitaPacket, VitaPayload};
pub use waveform::{
    CommandCallback, DataCallback, ResponseCallback, StateCallback, StatusCallback, Waveform,
};
