//! VITA-49 wire codec.
//!
//! The radio streams real-time data over UDP as VITA-49 packets: baseband
//! audio and I/Q samples, opaque byte streams, meter readouts, and the
//! discovery broadcast. This module is a pure codec with no I/O: it parses
//! network-order byte slices into typed [`VitaPacket`]s and encodes packets
//! back into wire form.
//!
//! Two header shapes exist. Data packets carry a 28-byte header with an
//! integer and a fractional timestamp; meter packets use a 16-byte header
//! with no timestamps. The header prefix (type, class and trailer flags,
//! timestamp types, 4-bit sequence, 16-bit length in words) is identical in
//! both shapes.
//!
//! The header is treated as a sequence of 32-bit big-endian words with
//! explicit mask-and-shift field access; nothing here depends on host byte
//! order or struct layout.

use flexwave_core::{Error, Result};

/// Radio vendor OUI carried in the VITA class identifier.
pub const FLEX_OUI: u32 = 0x0000_1C2D;

/// Information class common to every packet the radio emits.
pub const INFORMATION_CLASS: u16 = 0x534C;

/// Packet class of baseband audio / I/Q sample packets.
pub const AUDIO_PACKET_CLASS: u16 = 0x03E3;

/// Packet class of opaque byte-stream packets.
pub const BYTE_PACKET_CLASS: u16 = 0x8002;

/// Packet class of outgoing meter packets (shares the byte-stream class).
pub const METER_PACKET_CLASS: u16 = 0x8002;

/// Packet class of the discovery broadcast.
pub const DISCOVERY_PACKET_CLASS: u16 = 0xFFFF;

/// Stream id of outgoing meter packets.
pub const METER_STREAM_ID: u32 = 0x8800_0000;

/// Stream id of the discovery broadcast.
pub const DISCOVERY_STREAM_ID: u32 = 0x0000_0800;

/// Header size with integer + fractional timestamps (7 words).
pub const HEADER_BYTES_WITH_TS: usize = 28;

/// Header size without timestamps (4 words).
pub const HEADER_BYTES_NO_TS: usize = 16;

/// Maximum payload of a timestamped packet.
pub const MAX_PAYLOAD_WITH_TS: usize = 1440;

/// Maximum payload of a timestamp-less packet.
pub const MAX_PAYLOAD_NO_TS: usize = 1452;

/// Maximum number of 32-bit float samples in one audio packet.
pub const MAX_AUDIO_SAMPLES: usize = MAX_PAYLOAD_WITH_TS / 4;

/// Maximum opaque bytes in one byte-stream packet (payload minus the
/// 4-byte length prefix).
pub const MAX_BYTE_PAYLOAD: usize = MAX_PAYLOAD_WITH_TS - 4;

/// Maximum `{id, value}` slots in one meter packet.
pub const MAX_METER_SLOTS: usize = MAX_PAYLOAD_NO_TS / 4;

// ---------------------------------------------------------------------------
// Header field enums
// ---------------------------------------------------------------------------

/// VITA packet type, bits 31..28 of the header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    IfData = 0,
    IfDataWithStream = 1,
    ExtData = 2,
    ExtDataWithStream = 3,
    Context = 4,
    ExtContext = 5,
    Command = 6,
    ExtCommand = 7,
}

impl PacketType {
    fn from_bits(bits: u32) -> Result<PacketType> {
        Ok(match bits & 0x0F {
            0 => PacketType::IfData,
            1 => PacketType::IfDataWithStream,
            2 => PacketType::ExtData,
            3 => PacketType::ExtDataWithStream,
            4 => PacketType::Context,
            5 => PacketType::ExtContext,
            6 => PacketType::Command,
            7 => PacketType::ExtCommand,
            other => {
                return Err(Error::Protocol(format!("reserved packet type {other}")));
            }
        })
    }
}

/// Integer timestamp type, bits 23..22.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TimestampIntType {
    #[default]
    NotPresent = 0,
    Utc = 1,
    Gps = 2,
    Other = 3,
}

impl TimestampIntType {
    fn from_bits(bits: u32) -> TimestampIntType {
        match bits & 0x3 {
            1 => TimestampIntType::Utc,
            2 => TimestampIntType::Gps,
            3 => TimestampIntType::Other,
            _ => TimestampIntType::NotPresent,
        }
    }
}

/// Fractional timestamp type, bits 21..20.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TimestampFracType {
    #[default]
    NotPresent = 0,
    SampleCount = 1,
    RealTime = 2,
    FreeRunning = 3,
}

impl TimestampFracType {
    fn from_bits(bits: u32) -> TimestampFracType {
        match bits & 0x3 {
            1 => TimestampFracType::SampleCount,
            2 => TimestampFracType::RealTime,
            3 => TimestampFracType::FreeRunning,
            _ => TimestampFracType::NotPresent,
        }
    }
}

// ---------------------------------------------------------------------------
// Packet class sub-fields
// ---------------------------------------------------------------------------

/// Mask-and-shift accessors for the 16-bit packet class code.
///
/// The class code packs the stream's sample format:
///
/// ```text
/// bit  0     : frames per sample (0 = one, 1 = two)
/// bit  1     : audio stream
/// bits 8..4  : sample rate code
/// bit  9     : float samples
/// bits 15..14: bits-per-sample code
/// ```
///
/// Composing the audio format (float, 24 kHz, 32-bit, two frames) yields
/// `0x03E3`; the byte-stream format (integer, 3 kHz, 8-bit, one frame)
/// yields `0x8002`.
pub mod class {
    /// Sample rate code for 3 kHz.
    pub const SAMPLE_RATE_3K: u16 = 0x00;
    /// Sample rate code for 24 kHz.
    pub const SAMPLE_RATE_24K: u16 = 0x1E;
    /// Bits-per-sample code for 32-bit samples.
    pub const BPS_32: u16 = 0b00;
    /// Bits-per-sample code for 8-bit samples.
    pub const BPS_8: u16 = 0b10;
    /// Frames-per-sample code for one frame.
    pub const FPS_1: u16 = 0;
    /// Frames-per-sample code for two frames (stereo / I+Q).
    pub const FPS_2: u16 = 1;

    /// Whether the class describes an audio-bearing stream.
    pub fn is_audio(code: u16) -> bool {
        code & 0x0002 != 0
    }

    /// Whether samples are IEEE 754 floats.
    pub fn is_float(code: u16) -> bool {
        code & 0x0200 != 0
    }

    /// The 5-bit sample rate code.
    pub fn sample_rate(code: u16) -> u16 {
        (code >> 4) & 0x1F
    }

    /// The 2-bit bits-per-sample code.
    pub fn bits_per_sample(code: u16) -> u16 {
        (code >> 14) & 0x3
    }

    /// The frames-per-sample code.
    pub fn frames_per_sample(code: u16) -> u16 {
        code & 0x0001
    }

    /// Compose a class code from its sub-fields.
    pub fn compose(audio: bool, float: bool, sample_rate: u16, bps: u16, fps: u16) -> u16 {
        (fps & 0x1)
            | u16::from(audio) << 1
            | (sample_rate & 0x1F) << 4
            | u16::from(float) << 9
            | (bps & 0x3) << 14
    }
}

// ---------------------------------------------------------------------------
// Packet model
// ---------------------------------------------------------------------------

/// One `{id, value}` meter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterSlot {
    /// Radio-assigned meter id.
    pub id: u16,
    /// Fixed-point meter value (bit pattern of an `i16`).
    pub value: u16,
}

/// Typed payload of a [`VitaPacket`].
#[derive(Debug, Clone, PartialEq)]
pub enum VitaPayload {
    /// 32-bit float samples in host order (audio / I/Q packets).
    FloatSamples(Vec<f32>),
    /// Opaque bytes (byte-stream packets, length prefix stripped).
    Bytes(Vec<u8>),
    /// Meter slots (meter packets).
    MeterSlots(Vec<MeterSlot>),
    /// Raw 32-bit words in host order (everything else).
    Words(Vec<u32>),
}

/// Logical stream a received packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Baseband audio or I/Q samples.
    Audio,
    /// Opaque byte stream.
    ByteData,
    /// Anything else (1PPS, unclassified extension data, ...).
    Unknown,
}

/// A decoded VITA-49 packet with all integer fields in host order.
#[derive(Debug, Clone, PartialEq)]
pub struct VitaPacket {
    pub packet_type: PacketType,
    pub class_present: bool,
    pub trailer_present: bool,
    pub tsi: TimestampIntType,
    pub tsf: TimestampFracType,
    /// 4-bit rolling sequence counter.
    pub sequence: u8,
    pub stream_id: u32,
    pub oui: u32,
    pub information_class: u16,
    pub packet_class: u16,
    /// Seconds portion of the timestamp (zero when `tsi` is not present).
    pub timestamp_int: u32,
    /// Fractional timestamp, a single big-endian 64-bit quantity on the
    /// wire (zero when `tsf` is not present).
    pub timestamp_frac: u64,
    pub payload: VitaPayload,
}

impl VitaPacket {
    /// Build an audio packet for the given stream.
    ///
    /// Fails with [`Error::TooBig`] when more than [`MAX_AUDIO_SAMPLES`]
    /// samples are supplied; nothing is queued in that case.
    pub fn audio(
        stream_id: u32,
        sequence: u8,
        timestamp_int: u32,
        timestamp_frac: u64,
        samples: &[f32],
    ) -> Result<VitaPacket> {
        if samples.len() > MAX_AUDIO_SAMPLES {
            return Err(Error::TooBig {
                limit: MAX_AUDIO_SAMPLES,
                actual: samples.len(),
            });
        }
        Ok(VitaPacket {
            packet_type: PacketType::IfDataWithStream,
            class_present: true,
            trailer_present: false,
            tsi: TimestampIntType::Utc,
            tsf: TimestampFracType::RealTime,
            sequence: sequence & 0x0F,
            stream_id,
            oui: FLEX_OUI,
            information_class: INFORMATION_CLASS,
            packet_class: AUDIO_PACKET_CLASS,
            timestamp_int,
            timestamp_frac,
            payload: VitaPayload::FloatSamples(samples.to_vec()),
        })
    }

    /// Build a byte-stream packet for the given stream.
    pub fn byte_data(
        stream_id: u32,
        sequence: u8,
        timestamp_int: u32,
        timestamp_frac: u64,
        data: &[u8],
    ) -> Result<VitaPacket> {
        if data.len() > MAX_BYTE_PAYLOAD {
            return Err(Error::TooBig {
                limit: MAX_BYTE_PAYLOAD,
                actual: data.len(),
            });
        }
        Ok(VitaPacket {
            packet_type: PacketType::ExtDataWithStream,
            class_present: true,
            trailer_present: false,
            tsi: TimestampIntType::Utc,
            tsf: TimestampFracType::RealTime,
            sequence: sequence & 0x0F,
            stream_id,
            oui: FLEX_OUI,
            information_class: INFORMATION_CLASS,
            packet_class: BYTE_PACKET_CLASS,
            timestamp_int,
            timestamp_frac,
            payload: VitaPayload::Bytes(data.to_vec()),
        })
    }

    /// Build a meter packet (timestamp-less header, meter stream id).
    pub fn meter(sequence: u8, slots: &[MeterSlot]) -> Result<VitaPacket> {
        if slots.len() > MAX_METER_SLOTS {
            return Err(Error::TooBig {
                limit: MAX_METER_SLOTS,
                actual: slots.len(),
            });
        }
        Ok(VitaPacket {
            packet_type: PacketType::ExtDataWithStream,
            class_present: true,
            trailer_present: false,
            tsi: TimestampIntType::NotPresent,
            tsf: TimestampFracType::NotPresent,
            sequence: sequence & 0x0F,
            stream_id: METER_STREAM_ID,
            oui: FLEX_OUI,
            information_class: INFORMATION_CLASS,
            packet_class: METER_PACKET_CLASS,
            timestamp_int: 0,
            timestamp_frac: 0,
            payload: VitaPayload::MeterSlots(slots.to_vec()),
        })
    }

    /// Size in bytes of this packet's header on the wire.
    ///
    /// 28 bytes when an integer timestamp is carried, 16 bytes otherwise.
    pub fn header_bytes(&self) -> usize {
        if self.tsi != TimestampIntType::NotPresent {
            HEADER_BYTES_WITH_TS
        } else {
            HEADER_BYTES_NO_TS
        }
    }

    /// Classify this packet into one of the logical data streams.
    ///
    /// Audio requires the IF-data-with-stream-id type together with the
    /// full audio sample format; byte data requires the extension type with
    /// the byte format. Every other combination is [`PacketKind::Unknown`].
    pub fn kind(&self) -> PacketKind {
        classify(self.packet_type, self.packet_class)
    }

    /// Whether this packet travels on a transmit stream.
    ///
    /// The low-order bit of an audio stream id distinguishes TX (1) from
    /// RX (0).
    pub fn is_transmit(&self) -> bool {
        self.stream_id & 1 == 1
    }

    /// The full 64-bit class identifier (OUI, information class, packet
    /// class).
    pub fn class_id(&self) -> u64 {
        (self.oui as u64) << 32 | (self.information_class as u64) << 16 | self.packet_class as u64
    }

    /// Length of the payload in 32-bit words.
    pub fn payload_words(&self) -> usize {
        self.payload_bytes() / 4
    }

    /// Float samples, when this is an audio packet.
    pub fn float_payload(&self) -> Option<&[f32]> {
        match &self.payload {
            VitaPayload::FloatSamples(s) => Some(s),
            _ => None,
        }
    }

    /// Opaque bytes, when this is a byte-stream packet.
    pub fn byte_payload(&self) -> Option<&[u8]> {
        match &self.payload {
            VitaPayload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Meter slots, when this is a meter packet.
    pub fn meter_payload(&self) -> Option<&[MeterSlot]> {
        match &self.payload {
            VitaPayload::MeterSlots(m) => Some(m),
            _ => None,
        }
    }

    fn payload_bytes(&self) -> usize {
        match &self.payload {
            VitaPayload::FloatSamples(s) => s.len() * 4,
            // Length prefix plus data, padded to a word boundary.
            VitaPayload::Bytes(b) => 4 + b.len().div_ceil(4) * 4,
            VitaPayload::MeterSlots(m) => m.len() * 4,
            VitaPayload::Words(w) => w.len() * 4,
        }
    }
}

/// Shared classification rule for [`VitaPacket::kind`] and the parser's
/// payload-shape decision.
fn classify(packet_type: PacketType, code: u16) -> PacketKind {
    if packet_type == PacketType::IfDataWithStream
        && class::is_audio(code)
        && class::is_float(code)
        && class::sample_rate(code) == class::SAMPLE_RATE_24K
        && class::bits_per_sample(code) == class::BPS_32
        && class::frames_per_sample(code) == class::FPS_2
    {
        PacketKind::Audio
    } else if packet_type == PacketType::ExtDataWithStream
        && class::is_audio(code)
        && !class::is_float(code)
        && class::sample_rate(code) == class::SAMPLE_RATE_3K
        && class::bits_per_sample(code) == class::BPS_8
        && class::frames_per_sample(code) == class::FPS_1
    {
        PacketKind::ByteData
    } else {
        PacketKind::Unknown
    }
}

// ---------------------------------------------------------------------------
// Parse
// ---------------------------------------------------------------------------

fn be_word(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Parse a VITA-49 packet from a raw datagram.
///
/// Validates that the declared length matches the received byte count, that
/// the class OUI is the radio vendor's, and that the information class is
/// the radio's. Integer header fields come back in host order; payload
/// words are swapped only for word-oriented payloads (audio, meters,
/// unknown), while byte-stream data is delivered untouched after its
/// swapped 4-byte length prefix.
pub fn parse(data: &[u8]) -> Result<VitaPacket> {
    if data.len() < HEADER_BYTES_NO_TS {
        return Err(Error::InvalidLength {
            declared: HEADER_BYTES_NO_TS,
            actual: data.len(),
        });
    }

    let word0 = be_word(data, 0);
    let packet_type = PacketType::from_bits(word0 >> 28)?;
    let class_present = word0 >> 27 & 1 == 1;
    let trailer_present = word0 >> 26 & 1 == 1;
    let tsi = TimestampIntType::from_bits(word0 >> 22);
    let tsf = TimestampFracType::from_bits(word0 >> 20);
    let sequence = (word0 >> 16 & 0x0F) as u8;
    let length_words = (word0 & 0xFFFF) as usize;

    let declared = length_words * 4;
    if declared != data.len() {
        return Err(Error::InvalidLength {
            declared,
            actual: data.len(),
        });
    }

    let header_bytes = if tsi != TimestampIntType::NotPresent {
        HEADER_BYTES_WITH_TS
    } else {
        HEADER_BYTES_NO_TS
    };
    if data.len() < header_bytes {
        return Err(Error::InvalidLength {
            declared: header_bytes,
            actual: data.len(),
        });
    }

    let stream_id = be_word(data, 4);

    let class_hi = be_word(data, 8);
    let oui = class_hi & 0x00FF_FFFF;
    if oui != FLEX_OUI {
        return Err(Error::InvalidOui(oui));
    }

    let class_lo = be_word(data, 12);
    let information_class = (class_lo >> 16) as u16;
    let packet_class = (class_lo & 0xFFFF) as u16;
    if information_class != INFORMATION_CLASS {
        return Err(Error::InvalidClass(information_class));
    }

    let (timestamp_int, timestamp_frac) = if tsi != TimestampIntType::NotPresent {
        let ts_int = be_word(data, 16);
        let ts_frac = u64::from_be_bytes([
            data[20], data[21], data[22], data[23], data[24], data[25], data[26], data[27],
        ]);
        (ts_int, ts_frac)
    } else {
        (0, 0)
    };

    let body = &data[header_bytes..];

    // Decide the payload shape before byte-swapping. Meter packets share
    // the byte-stream class code but are timestamp-less and ride the meter
    // stream id.
    let is_meter = packet_type == PacketType::ExtDataWithStream
        && stream_id == METER_STREAM_ID
        && tsi == TimestampIntType::NotPresent;
    let kind = classify(packet_type, packet_class);
    let is_byte = !is_meter && kind == PacketKind::ByteData;
    let is_audio = kind == PacketKind::Audio;

    let payload = if is_meter {
        let mut slots = Vec::with_capacity(body.len() / 4);
        for chunk in body.chunks_exact(4) {
            slots.push(MeterSlot {
                id: u16::from_be_bytes([chunk[0], chunk[1]]),
                value: u16::from_be_bytes([chunk[2], chunk[3]]),
            });
        }
        VitaPayload::MeterSlots(slots)
    } else if is_byte {
        if body.len() < 4 {
            return Err(Error::Protocol(format!(
                "byte packet payload too short for length prefix: {} bytes",
                body.len()
            )));
        }
        let data_len = be_word(body, 0) as usize;
        if data_len > body.len() - 4 {
            return Err(Error::Protocol(format!(
                "byte packet length prefix {} exceeds payload of {} bytes",
                data_len,
                body.len() - 4
            )));
        }
        VitaPayload::Bytes(body[4..4 + data_len].to_vec())
    } else if is_audio {
        let samples = body
            .chunks_exact(4)
            .map(|c| f32::from_bits(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
            .collect();
        VitaPayload::FloatSamples(samples)
    } else {
        let words = body
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        VitaPayload::Words(words)
    };

    Ok(VitaPacket {
        packet_type,
        class_present,
        trailer_present,
        tsi,
        tsf,
        sequence,
        stream_id,
        oui,
        information_class,
        packet_class,
        timestamp_int,
        timestamp_frac,
        payload,
    })
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a packet into wire form.
///
/// The length word is computed from the payload and the header shape; all
/// integer fields are written in network order, the fractional timestamp as
/// one big-endian 64-bit quantity.
pub fn encode(packet: &VitaPacket) -> Result<Vec<u8>> {
    let header_bytes = packet.header_bytes();
    let max_payload = if header_bytes == HEADER_BYTES_WITH_TS {
        MAX_PAYLOAD_WITH_TS
    } else {
        MAX_PAYLOAD_NO_TS
    };
    let payload_bytes = packet.payload_bytes();
    if payload_bytes > max_payload {
        return Err(Error::TooBig {
            limit: max_payload,
            actual: payload_bytes,
        });
    }

    let total = header_bytes + payload_bytes;
    let length_words = (total / 4) as u32;
    let mut out = Vec::with_capacity(total);

    let word0 = (packet.packet_type as u32) << 28
        | u32::from(packet.class_present) << 27
        | u32::from(packet.trailer_present) << 26
        | (packet.tsi as u32) << 22
        | (packet.tsf as u32) << 20
        | (packet.sequence as u32 & 0x0F) << 16
        | (length_words & 0xFFFF);
    out.extend_from_slice(&word0.to_be_bytes());
    out.extend_from_slice(&packet.stream_id.to_be_bytes());
    out.extend_from_slice(&(packet.oui & 0x00FF_FFFF).to_be_bytes());
    let class_lo = (packet.information_class as u32) << 16 | packet.packet_class as u32;
    out.extend_from_slice(&class_lo.to_be_bytes());

    if header_bytes == HEADER_BYTES_WITH_TS {
        out.extend_from_slice(&packet.timestamp_int.to_be_bytes());
        out.extend_from_slice(&packet.timestamp_frac.to_be_bytes());
    }

    match &packet.payload {
        VitaPayload::FloatSamples(samples) => {
            for s in samples {
                out.extend_from_slice(&s.to_bits().to_be_bytes());
            }
        }
        VitaPayload::Bytes(bytes) => {
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(bytes);
            // Pad the data to a word boundary.
            for _ in 0..(4 - bytes.len() % 4) % 4 {
                out.push(0);
            }
        }
        VitaPayload::MeterSlots(slots) => {
            for slot in slots {
                out.extend_from_slice(&slot.id.to_be_bytes());
                out.extend_from_slice(&slot.value.to_be_bytes());
            }
        }
        VitaPayload::Words(words) => {
            for w in words {
                out.extend_from_slice(&w.to_be_bytes());
            }
        }
    }

    debug_assert_eq!(out.len(), total);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_audio_packet(stream_id: u32) -> VitaPacket {
        VitaPacket::audio(
            stream_id,
            5,
            1_700_000_000,
            42_000_000_000,
            &[0.0, 1.0, -1.0, 0.5, -0.25, 0.125],
        )
        .unwrap()
    }

    // -- class code decomposition --

    #[test]
    fn audio_class_composes() {
        let code = class::compose(
            true,
            true,
            class::SAMPLE_RATE_24K,
            class::BPS_32,
            class::FPS_2,
        );
        assert_eq!(code, AUDIO_PACKET_CLASS);
    }

    #[test]
    fn byte_class_composes() {
        let code = class::compose(
            true,
            false,
            class::SAMPLE_RATE_3K,
            class::BPS_8,
            class::FPS_1,
        );
        assert_eq!(code, BYTE_PACKET_CLASS);
    }

    #[test]
    fn class_accessors_round_trip() {
        let code = AUDIO_PACKET_CLASS;
        assert!(class::is_audio(code));
        assert!(class::is_float(code));
        assert_eq!(class::sample_rate(code), class::SAMPLE_RATE_24K);
        assert_eq!(class::bits_per_sample(code), class::BPS_32);
        assert_eq!(class::frames_per_sample(code), class::FPS_2);

        let code = BYTE_PACKET_CLASS;
        assert!(class::is_audio(code));
        assert!(!class::is_float(code));
        assert_eq!(class::sample_rate(code), class::SAMPLE_RATE_3K);
        assert_eq!(class::bits_per_sample(code), class::BPS_8);
        assert_eq!(class::frames_per_sample(code), class::FPS_1);
    }

    // -- header size rule --

    #[test]
    fn header_bytes_follow_integer_timestamp_presence() {
        let audio = sample_audio_packet(2);
        assert_eq!(audio.header_bytes(), HEADER_BYTES_WITH_TS);

        let meter = VitaPacket::meter(0, &[MeterSlot { id: 1, value: 2 }]).unwrap();
        assert_eq!(meter.header_bytes(), HEADER_BYTES_NO_TS);
    }

    // -- round trips --

    #[test]
    fn audio_round_trip() {
        let packet = sample_audio_packet(0x4000_0001);
        let wire = encode(&packet).unwrap();
        assert_eq!(wire.len(), HEADER_BYTES_WITH_TS + 6 * 4);

        let parsed = parse(&wire).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.kind(), PacketKind::Audio);
        assert!(parsed.is_transmit());
    }

    #[test]
    fn byte_round_trip() {
        let packet = VitaPacket::byte_data(0x2000_0002, 3, 100, 200, b"hello radio").unwrap();
        let wire = encode(&packet).unwrap();
        // 11 data bytes + 4-byte prefix pads to 16 payload bytes.
        assert_eq!(wire.len(), HEADER_BYTES_WITH_TS + 16);

        let parsed = parse(&wire).unwrap();
        assert_eq!(parsed.kind(), PacketKind::ByteData);
        assert_eq!(parsed.byte_payload(), Some(&b"hello radio"[..]));
        assert_eq!(parsed, packet);
    }

    #[test]
    fn meter_round_trip() {
        let slots = [
            MeterSlot { id: 42, value: (-1600i16) as u16 },
            MeterSlot { id: 7, value: 1234 },
        ];
        let packet = VitaPacket::meter(9, &slots).unwrap();
        let wire = encode(&packet).unwrap();
        assert_eq!(wire.len(), HEADER_BYTES_NO_TS + 8);

        let parsed = parse(&wire).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.meter_payload().unwrap(), &slots);
    }

    #[test]
    fn unknown_round_trip() {
        let packet = VitaPacket {
            packet_type: PacketType::ExtDataWithStream,
            class_present: true,
            trailer_present: false,
            tsi: TimestampIntType::Utc,
            tsf: TimestampFracType::SampleCount,
            sequence: 15,
            stream_id: 0x0000_0800,
            oui: FLEX_OUI,
            information_class: INFORMATION_CLASS,
            packet_class: 0x1234,
            timestamp_int: 77,
            timestamp_frac: 88,
            payload: VitaPayload::Words(vec![0xDEAD_BEEF, 0x0102_0304]),
        };
        let wire = encode(&packet).unwrap();
        let parsed = parse(&wire).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.kind(), PacketKind::Unknown);
    }

    #[test]
    fn encode_is_stable() {
        // Encoding a parsed packet reproduces the original bytes exactly.
        let packet = sample_audio_packet(0x4000_0000);
        let wire = encode(&packet).unwrap();
        let rewire = encode(&parse(&wire).unwrap()).unwrap();
        assert_eq!(wire, rewire);
    }

    // -- meter slot wire order --

    #[test]
    fn meter_slot_is_id_first_on_the_wire() {
        let packet = VitaPacket::meter(0, &[MeterSlot { id: 0x0102, value: 0x0304 }]).unwrap();
        let wire = encode(&packet).unwrap();
        assert_eq!(&wire[HEADER_BYTES_NO_TS..], &[0x01, 0x02, 0x03, 0x04]);
    }

    // -- wire details --

    #[test]
    fn sequence_field_position() {
        let mut packet = sample_audio_packet(1);
        packet.sequence = 0xB;
        let wire = encode(&packet).unwrap();
        let word0 = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]);
        assert_eq!(word0 >> 16 & 0x0F, 0xB);
    }

    #[test]
    fn length_word_includes_header() {
        let packet = sample_audio_packet(1);
        let wire = encode(&packet).unwrap();
        let word0 = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]);
        assert_eq!((word0 & 0xFFFF) as usize * 4, wire.len());
    }

    #[test]
    fn fractional_timestamp_is_big_endian() {
        let mut packet = sample_audio_packet(1);
        packet.timestamp_frac = 0x0102_0304_0506_0708;
        let wire = encode(&packet).unwrap();
        assert_eq!(&wire[20..28], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    // -- parse failures --

    #[test]
    fn reject_truncated() {
        let err = parse(&[0u8; 12]).unwrap_err();
        assert!(matches!(err, Error::InvalidLength { .. }));
    }

    #[test]
    fn reject_length_mismatch() {
        let packet = sample_audio_packet(1);
        let mut wire = encode(&packet).unwrap();
        wire.push(0); // one trailing byte the header does not declare
        let err = parse(&wire).unwrap_err();
        assert!(matches!(err, Error::InvalidLength { .. }));
    }

    #[test]
    fn reject_wrong_oui() {
        let mut packet = sample_audio_packet(1);
        packet.oui = 0x00AABBCC;
        let wire = encode(&packet).unwrap();
        let err = parse(&wire).unwrap_err();
        assert!(matches!(err, Error::InvalidOui(0x00AABBCC)));
    }

    #[test]
    fn reject_wrong_information_class() {
        let mut packet = sample_audio_packet(1);
        packet.information_class = 0x4141;
        let wire = encode(&packet).unwrap();
        let err = parse(&wire).unwrap_err();
        assert!(matches!(err, Error::InvalidClass(0x4141)));
    }

    #[test]
    fn reject_byte_prefix_overrun() {
        let packet = VitaPacket::byte_data(0x2000_0002, 0, 0, 0, b"abcd").unwrap();
        let mut wire = encode(&packet).unwrap();
        // Corrupt the length prefix to claim more data than is present.
        wire[HEADER_BYTES_WITH_TS..HEADER_BYTES_WITH_TS + 4]
            .copy_from_slice(&100u32.to_be_bytes());
        let err = parse(&wire).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn failed_parse_leaves_input_untouched() {
        let mut packet = sample_audio_packet(1);
        packet.oui = 0x00AABBCC;
        let wire = encode(&packet).unwrap();
        let before = wire.clone();
        let _ = parse(&wire);
        assert_eq!(wire, before);
    }

    // -- limits --

    #[test]
    fn audio_limit_enforced() {
        let samples = vec![0.0f32; MAX_AUDIO_SAMPLES + 1];
        let err = VitaPacket::audio(1, 0, 0, 0, &samples).unwrap_err();
        assert!(matches!(err, Error::TooBig { limit, .. } if limit == MAX_AUDIO_SAMPLES));

        let samples = vec![0.0f32; MAX_AUDIO_SAMPLES];
        assert!(VitaPacket::audio(1, 0, 0, 0, &samples).is_ok());
    }

    #[test]
    fn byte_limit_enforced() {
        let data = vec![0u8; MAX_BYTE_PAYLOAD + 1];
        let err = VitaPacket::byte_data(1, 0, 0, 0, &data).unwrap_err();
        assert!(matches!(err, Error::TooBig { limit, .. } if limit == MAX_BYTE_PAYLOAD));

        let data = vec![0u8; MAX_BYTE_PAYLOAD];
        assert!(VitaPacket::byte_data(1, 0, 0, 0, &data).is_ok());
    }

    #[test]
    fn meter_slot_limit() {
        // 363 slots fill the timestamp-less payload exactly; 364 overflow.
        let slots = vec![MeterSlot { id: 0, value: 0 }; MAX_METER_SLOTS + 1];
        let err = VitaPacket::meter(0, &slots).unwrap_err();
        assert!(matches!(err, Error::TooBig { .. }));

        let slots = vec![MeterSlot { id: 0, value: 0 }; MAX_METER_SLOTS];
        assert!(VitaPacket::meter(0, &slots).is_ok());
    }

    // -- direction rule --

    #[test]
    fn stream_direction_follows_low_bit() {
        for stream_id in [0x4000_0000u32, 0x4000_0001, 0, 1, 0xFFFF_FFFE, 0xFFFF_FFFF] {
            let packet = sample_audio_packet(stream_id);
            assert_eq!(packet.is_transmit(), stream_id & 1 == 1);
        }
    }

    // -- accessors --

    #[test]
    fn class_id_accessor() {
        let packet = sample_audio_packet(1);
        assert_eq!(packet.class_id(), 0x0000_1C2D_534C_03E3);
    }

    #[test]
    fn payload_words_accessor() {
        let packet = sample_audio_packet(1);
        assert_eq!(packet.payload_words(), 6);

        let bytes = VitaPacket::byte_data(2, 0, 0, 0, b"abcde").unwrap();
        // prefix word + 5 bytes padded to 2 words
        assert_eq!(bytes.payload_words(), 3);
    }
}
