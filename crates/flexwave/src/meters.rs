//! Meter registry and fixed-point meter emission.
//!
//! A waveform registers named meters before the radio starts; on
//! connection the control plane creates each one on the radio
//! (`meter create ... fps=20`) and stores the radio-assigned 16-bit id.
//! Values are staged on the host with [`set_meter_float`] /
//! [`set_meter_int`] and shipped in one coalesced VITA-49 packet by
//! [`send_meters`], which resets every emitted slot back to unset.
//!
//! Float values encode as fixed point with a per-unit radix: the stored
//! wire value is `round(v * (1 << radix))` as an `i16`.

use std::sync::Arc;

use flexwave_core::{Error, MeterUnit, Result};

use crate::data::DataPlane;
use crate::vita::{self, MeterSlot, VitaPacket};
use crate::waveform::Waveform;

/// Sentinel for "no value staged".
pub(crate) const METER_VALUE_UNSET: i32 = -1;

/// One registered meter.
#[derive(Debug, Clone)]
pub(crate) struct Meter {
    pub name: String,
    pub min: f32,
    pub max: f32,
    pub unit: MeterUnit,
    /// Radio-assigned id; 0 until the `meter create` response arrives.
    pub id: u16,
    /// Staged value, [`METER_VALUE_UNSET`] when nothing is pending.
    pub value: i32,
}

/// Encode a float into the unit's fixed-point wire representation.
fn float_to_fixed(value: f32, radix: u32) -> i16 {
    (value * (1u32 << radix) as f32).round() as i16
}

/// Register a meter on a waveform. A duplicate name is rejected.
pub(crate) fn register_meter(
    waveform: &Waveform,
    name: &str,
    min: f32,
    max: f32,
    unit: MeterUnit,
) -> Result<()> {
    let mut meters = waveform.meters.lock().unwrap();
    if meters.iter().any(|m| m.name == name) {
        tracing::error!(meter = name, "meter already exists");
        return Err(Error::InvalidParameter(format!(
            "meter already exists: {name}"
        )));
    }
    meters.push(Meter {
        name: name.to_string(),
        min,
        max,
        unit,
        id: 0,
        value: METER_VALUE_UNSET,
    });
    Ok(())
}

/// Stage a float value on a named meter.
///
/// Rejected without touching the meter when the value is not finite, lies
/// outside the meter's `[min, max]`, or cannot be represented in the
/// unit's fixed-point range.
pub(crate) fn set_meter_float(waveform: &Waveform, name: &str, value: f32) -> Result<()> {
    let mut meters = waveform.meters.lock().unwrap();
    let meter = meters
        .iter_mut()
        .find(|m| m.name == name)
        .ok_or_else(|| Error::InvalidParameter(format!("meter not found: {name}")))?;

    if !value.is_finite() {
        return Err(Error::InvalidParameter(format!(
            "meter value is not finite: {value}"
        )));
    }
    if value < meter.min || value > meter.max {
        return Err(Error::InvalidParameter(format!(
            "meter value {value} outside [{}, {}]",
            meter.min, meter.max
        )));
    }
    if value < meter.unit.min_representable() || value > meter.unit.max_representable() {
        return Err(Error::InvalidParameter(format!(
            "meter value {value} outside the {} fixed-point range",
            meter.unit
        )));
    }

    meter.value = float_to_fixed(value, meter.unit.radix()) as i32;
    Ok(())
}

/// Stage a raw fixed-point value on a named meter. No range checking; a
/// value of -1 is indistinguishable from "unset" and will not be emitted.
pub(crate) fn set_meter_int(waveform: &Waveform, name: &str, value: i16) -> Result<()> {
    let mut meters = waveform.meters.lock().unwrap();
    let meter = meters
        .iter_mut()
        .find(|m| m.name == name)
        .ok_or_else(|| Error::InvalidParameter(format!("meter not found: {name}")))?;
    meter.value = value as i32;
    Ok(())
}

/// Drain staged values into wire slots, resetting each emitted meter.
fn collect_slots(meters: &mut [Meter]) -> Result<Vec<MeterSlot>> {
    let mut slots = Vec::new();
    for meter in meters.iter_mut() {
        if meter.value == METER_VALUE_UNSET {
            continue;
        }
        if slots.len() >= vita::MAX_METER_SLOTS {
            return Err(Error::TooBig {
                limit: vita::MAX_METER_SLOTS,
                actual: slots.len() + 1,
            });
        }
        slots.push(MeterSlot {
            id: meter.id,
            value: meter.value as i16 as u16,
        });
        meter.value = METER_VALUE_UNSET;
    }
    Ok(slots)
}

/// Send every staged meter value in one packet on the meter stream.
pub(crate) fn send_meters(waveform: &Waveform, plane: &DataPlane) -> Result<()> {
    let slots = {
        let mut meters = waveform.meters.lock().unwrap();
        collect_slots(&mut meters)?
    };
    let packet = VitaPacket::meter(plane.next_meter_sequence(), &slots)?;
    plane.send_packet(&packet)
}

/// Create every registered meter on the radio, capturing the assigned ids.
///
/// Called by the control plane once the waveform is set up. A response
/// that fails or does not parse as an id unlinks the meter.
pub(crate) fn create_meters(waveform: &Arc<Waveform>) {
    let pending: Vec<Meter> = waveform.meters.lock().unwrap().clone();

    for meter in pending {
        let command = format!(
            "meter create name={} type=WAVEFORM min={:.6} max={:.6} unit={} fps=20",
            meter.name, meter.min, meter.max, meter.unit
        );
        let name = meter.name.clone();
        let result = waveform.send_command_with_cb(&command, move |wf, code, message| {
            store_meter_id(wf, &name, code, message);
        });
        if let Err(e) = result {
            tracing::error!(meter = %meter.name, error = %e, "failed to send meter create");
        }
    }
}

/// Handle a `meter create` response: record the id, or unlink the meter
/// when the radio said no or the id is unusable.
fn store_meter_id(waveform: &Waveform, name: &str, code: u32, message: &str) {
    let parsed = if code != 0 {
        tracing::error!(meter = name, code, message, "error registering meter");
        None
    } else {
        match parse_leading_uint(message) {
            Some(id) if id <= u16::MAX as u64 => Some(id as u16),
            Some(id) => {
                tracing::error!(meter = name, id, "meter id out of range");
                None
            }
            None => {
                tracing::error!(meter = name, message, "cannot find meter id in response");
                None
            }
        }
    };

    let mut meters = waveform.meters.lock().unwrap();
    match parsed {
        Some(id) => {
            if let Some(meter) = meters.iter_mut().find(|m| m.name == name) {
                meter.id = id;
                tracing::debug!(meter = name, id, "meter registered");
            }
        }
        None => {
            meters.retain(|m| m.name != name);
        }
    }
}

/// Parse the leading unsigned decimal integer of a response body, ignoring
/// leading whitespace and trailing text.
fn parse_leading_uint(message: &str) -> Option<u64> {
    let trimmed = message.trim_start();
    let digits: &str = {
        let end = trimmed
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(trimmed.len());
        &trimmed[..end]
    };
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}
