// flexwave test application -- a loopback "JUNK" waveform for exercising
// the SDK against a real radio.
//
// Usage:
//   flexwave-test-app --discover
//   flexwave-test-app --host 192.168.1.100
//   flexwave-test-app --host 192.168.1.100 --port 4992 -v
//
// The waveform registers under the short name JUNK with DIGU underneath.
// When a slice selects JUNK, received RX audio is echoed back to the
// speaker path, a fake SNR meter is streamed, and any `slice <n> set ...`
// command from the radio is logged and acknowledged.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use flexwave::{DataTarget, MeterUnit, Radio, Waveform, WaveformState};

#[derive(Parser, Debug)]
#[command(name = "flexwave-test-app", about = "Loopback test waveform")]
struct Args {
    /// Radio IP address. Mutually exclusive with --discover.
    #[arg(long)]
    host: Option<IpAddr>,

    /// Radio control port.
    #[arg(long, default_value_t = flexwave::CONTROL_PORT)]
    port: u16,

    /// Find the radio via its discovery broadcast.
    #[arg(long)]
    discover: bool,

    /// Discovery timeout in seconds.
    #[arg(long, default_value_t = 10)]
    discover_timeout: u64,

    /// Verbose logging (repeat for more).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Shared state for the echo waveform.
struct JunkContext {
    transmitting: AtomicBool,
    packets_echoed: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("flexwave={default_level}"))),
        )
        .init();

    let addr = resolve_radio(&args).await?;
    tracing::info!(radio = %addr, "using radio");

    let radio = Radio::new(addr);
    let waveform = Waveform::build(&radio, "JunkMode", "JUNK", "DIGU", "1.0.0")?;
    waveform.set_context(JunkContext {
        transmitting: AtomicBool::new(false),
        packets_echoed: AtomicU64::new(0),
    });

    waveform.register_meter_list(&[
        ("junk-snr", -100.0, 100.0, MeterUnit::Db),
        ("junk-foff", 0.0, 100_000.0, MeterUnit::Db),
    ])?;

    waveform.on_state(|wf, state| {
        tracing::info!(?state, slice = ?wf.active_slice(), "waveform state");
        if let Some(ctx) = wf.context::<JunkContext>() {
            match state {
                WaveformState::PttRequested => ctx.transmitting.store(true, Ordering::SeqCst),
                WaveformState::UnkeyRequested | WaveformState::Inactive => {
                    ctx.transmitting.store(false, Ordering::SeqCst)
                }
                WaveformState::Active => {}
            }
        }
    });

    // Echo RX audio straight back to the speaker path, with a fake SNR
    // meter ride-along every 24 packets.
    waveform.on_rx_data(|wf, packet| {
        let Some(ctx) = wf.context::<JunkContext>() else {
            return;
        };
        if ctx.transmitting.load(Ordering::SeqCst) {
            return;
        }
        let Some(samples) = packet.float_payload() else {
            return;
        };
        if let Err(e) = wf.send_audio_packet(samples, DataTarget::Speaker) {
            tracing::warn!(error = %e, "echo failed");
            return;
        }

        let echoed = ctx.packets_echoed.fetch_add(1, Ordering::Relaxed);
        if echoed % 24 == 0 {
            let _ = wf.set_meter_float("junk-snr", 42.0);
            if let Err(e) = wf.send_meters() {
                tracing::warn!(error = %e, "meter send failed");
            }
        }
    });

    waveform.on_tx_data(|wf, packet| {
        // Transmit a silent carrier: null samples of the same length.
        if let Some(samples) = packet.float_payload() {
            let silence = vec![0.0f32; samples.len()];
            if let Err(e) = wf.send_audio_packet(&silence, DataTarget::Transmitter) {
                tracing::warn!(error = %e, "tx failed");
            }
        }
    });

    waveform.on_command("set", |_wf, args| {
        tracing::info!(?args, "radio sent set command");
        0
    });

    waveform.on_status("slice", |_wf, argv| {
        tracing::debug!(status = ?argv, "slice status");
    });

    radio.start().await.context("connecting to the radio")?;
    tracing::info!("radio started; press Ctrl-C to exit");

    tokio::select! {
        result = radio.wait() => {
            result.context("radio loop failed")?;
            tracing::info!("radio disconnected");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            radio.destroy().await;
        }
    }

    Ok(())
}

/// Resolve the radio address from the command line or discovery.
async fn resolve_radio(args: &Args) -> Result<SocketAddr> {
    if let Some(host) = args.host {
        return Ok(SocketAddr::new(host, args.port));
    }
    if !args.discover {
        bail!("either --host or --discover is required");
    }

    tracing::info!("listening for radio discovery broadcasts");
    let found = flexwave::discovery::discover(Duration::from_secs(args.discover_timeout))
        .await
        .context("discovery failed")?;
    found.context("no radio discovered on the network")
}
