//! Test harness for flexwave: a scripted mock radio.
//!
//! [`MockRadio`] stands in for the radio's TCP control channel in tests: it
//! listens on a loopback port, performs the version/handle handshake when a
//! client connects, records every line the client sends, and lets the test
//! inject response, status, and command lines at will. No real radio or
//! network infrastructure is needed.

mod mock_radio;

pub use mock_radio::MockRadio;
