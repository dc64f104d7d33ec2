//! Radio discovery via VITA-49 UDP broadcasts.
//!
//! Radios announce themselves by broadcasting a VITA-49 extension packet
//! on UDP port 4992. The payload is ASCII `key=value` tokens carrying,
//! among other things, the radio's control address (`ip=` and `port=`).
//! [`discover`] listens with address reuse (so it can share the port with
//! other listeners on the host), validates the class and stream id, and
//! returns the first radio heard.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use flexwave_core::{find_kwarg, split_args, Error, Result};

use crate::vita::{self, PacketType, VitaPayload};

/// UDP port radios broadcast their advertisements on.
pub const DISCOVERY_PORT: u16 = 4992;

/// Listen for a radio advertisement on the default discovery port.
///
/// Returns the advertised control address of the first radio heard, or
/// `None` when the timeout passes without one.
pub async fn discover(timeout: Duration) -> Result<Option<SocketAddr>> {
    discover_on_port(DISCOVERY_PORT, timeout).await
}

/// Listen for a radio advertisement on a specific port.
///
/// This variant lets tests feed mock advertisements through an
/// unprivileged loopback port.
pub async fn discover_on_port(port: u16, timeout: Duration) -> Result<Option<SocketAddr>> {
    let socket = bind_reuse(port)?;
    socket.set_nonblocking(true).map_err(Error::Io)?;
    let socket = tokio::net::UdpSocket::from_std(socket).map_err(Error::Io)?;

    tracing::debug!(port, "listening for radio discovery broadcasts");

    let mut buf = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            tracing::debug!("discovery timed out");
            return Ok(None);
        }

        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, src))) => match decode_advertisement(&buf[..n]) {
                Ok(addr) => {
                    tracing::debug!(radio = %addr, source = %src, "discovered radio");
                    return Ok(Some(addr));
                }
                Err(e) => {
                    tracing::debug!(error = %e, source = %src, "ignoring datagram");
                }
            },
            Ok(Err(e)) => {
                tracing::trace!(error = %e, "discovery recv error");
            }
            Err(_) => {
                tracing::debug!("discovery timed out");
                return Ok(None);
            }
        }
    }
}

/// Validate and decode one advertisement datagram into the radio's
/// control address.
fn decode_advertisement(datagram: &[u8]) -> Result<SocketAddr> {
    let packet = vita::parse(datagram)?;

    if packet.packet_type != PacketType::ExtDataWithStream {
        return Err(Error::Protocol(format!(
            "discovery packet has wrong type: {:?}",
            packet.packet_type
        )));
    }
    if packet.packet_class != vita::DISCOVERY_PACKET_CLASS {
        return Err(Error::InvalidClass(packet.packet_class));
    }
    if packet.stream_id != vita::DISCOVERY_STREAM_ID {
        return Err(Error::Protocol(format!(
            "discovery packet has wrong stream id: 0x{:08X}",
            packet.stream_id
        )));
    }

    // The payload parsed as generic words in host order; restore the wire
    // bytes to read the ASCII key=value text.
    let VitaPayload::Words(words) = &packet.payload else {
        return Err(Error::Protocol("discovery payload is not text".into()));
    };
    let mut text_bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        text_bytes.extend_from_slice(&word.to_be_bytes());
    }
    let text = std::str::from_utf8(&text_bytes)
        .map_err(|_| Error::Protocol("discovery payload is not UTF-8".into()))?
        .trim_end_matches(['\0', ' ']);

    let argv = split_args(text)?;
    let ip: IpAddr = find_kwarg(&argv, "ip")
        .ok_or_else(|| Error::Protocol("discovery payload has no ip".into()))?
        .parse()
        .map_err(|_| Error::Protocol("discovery payload has a bad ip".into()))?;
    let port: u16 = find_kwarg(&argv, "port")
        .ok_or_else(|| Error::Protocol("discovery payload has no port".into()))?
        .parse()
        .map_err(|_| Error::Protocol("discovery payload has a bad port".into()))?;

    Ok(SocketAddr::new(ip, port))
}

/// Bind a UDP socket with `SO_REUSEADDR`, so discovery can share the port
/// with other listeners on this host.
#[cfg(unix)]
fn bind_reuse(port: u16) -> Result<std::net::UdpSocket> {
    use std::os::fd::FromRawFd;

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, libc::IPPROTO_UDP);
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::Io(err));
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(libc::INADDR_ANY).to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::Transport(format!(
                "cannot bind discovery socket on port {port}: {err}"
            )));
        }

        Ok(std::net::UdpSocket::from_raw_fd(fd))
    }
}

#[cfg(not(unix))]
fn bind_reuse(port: u16) -> Result<std::net::UdpSocket> {
    std::net::UdpSocket::bind(("0.0.0.0", port))
        .map_err(|e| Error::Transport(format!("cannot bind discovery socket on port {port}: {e}")))
}
