// GelSense HILS - Electrode-Selection Mux
//
// Line protocol of the two 8:1 multiplexers that route the analyzer onto a
// source/sink electrode pair:
//
//   host   -> device : S<d>K<d>\n          d in 0..=7
//   device -> host   : OK:<cmd>\n          selection switched
//                      ERROR:<cmd>\n       source == sink, out of range, malformed
//
// `MuxSelector` is the host side over any byte stream.  `MuxEmulator` is
// the device side; it also implements Read + Write so a selector can talk to
// it directly.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use crate::config::MUX_CHANNEL_COUNT;
use crate::error::{Error, Result};
use crate::events::ChannelPair;

const MAX_REPLY_LEN: usize = 64;

/// The command line for one selection, including the newline.
pub fn encode_select(source: u8, sink: u8) -> String {
    format!("S{source}K{sink}\n")
}

/// Parse a command body (no newline) into `(source, sink)` digits.
fn parse_select(cmd: &str) -> Option<(u8, u8)> {
    let b = cmd.as_bytes();
    if b.len() != 4 || b[0] != b'S' || b[2] != b'K' {
        return None;
    }
    if !b[1].is_ascii_digit() || !b[3].is_ascii_digit() {
        return None;
    }
    Some((b[1] - b'0', b[3] - b'0'))
}

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------
pub struct MuxSelector<P: Read + Write> {
    port: P,
    active: Option<(u8, u8)>,
}

impl<P: Read + Write> MuxSelector<P> {
    pub fn new(port: P) -> Self {
        Self { port, active: None }
    }

    /// Last selection the device acknowledged.
    pub fn active(&self) -> Option<(u8, u8)> {
        self.active
    }

    pub fn select(&mut self, pair: ChannelPair) -> Result<()> {
        self.select_channels(pair.source(), pair.sink())
    }

    /// Send raw channel numbers.  The device is the authority on validity;
    /// a rejection leaves `active` untouched.
    pub fn select_channels(&mut self, source: u8, sink: u8) -> Result<()> {
        let cmd = encode_select(source, sink);
        self.port.write_all(cmd.as_bytes())?;
        self.port.flush()?;

        let reply = self.read_reply()?;
        let body = cmd.trim_end();
        match reply.split_once(':') {
            Some(("OK", echoed)) if echoed == body => {
                self.active = Some((source, sink));
                log::debug!("Mux selected S{source}K{sink}");
                Ok(())
            }
            Some(("ERROR", _)) => {
                log::warn!("Mux rejected {body}");
                Err(Error::Validation(format!("mux rejected {body}")))
            }
            _ => Err(Error::Protocol(format!(
                "unexpected mux reply {reply:?} to {body}"
            ))),
        }
    }

    fn read_reply(&mut self) -> Result<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if self.port.read(&mut byte)? == 0 {
                return Err(Error::TransientIo(format!(
                    "mux reply cut short after {} bytes",
                    line.len()
                )));
            }
            if byte[0] == b'\n' {
                break;
            }
            if line.len() >= MAX_REPLY_LEN {
                return Err(Error::Protocol("mux reply exceeds line limit".into()));
            }
            line.push(byte[0]);
        }
        let text = String::from_utf8(line)
            .map_err(|_| Error::Protocol("mux reply is not UTF-8".into()))?;
        Ok(text.trim_end_matches('\r').to_string())
    }
}

/// Open the mux on a serial port at the configured baud rate.
#[cfg(feature = "hardware")]
pub fn open_serial(path: &str) -> Result<MuxSelector<Box<dyn serialport::SerialPort>>> {
    use std::thread;
    use std::time::Duration;

    use crate::config::{MUX_BAUDRATE, MUX_REPLY_TIMEOUT_MS, MUX_RESET_WAIT_MS};

    let port = serialport::new(path, MUX_BAUDRATE)
        .timeout(Duration::from_millis(MUX_REPLY_TIMEOUT_MS))
        .open()
        .map_err(|e| Error::TransientIo(format!("cannot open {path}: {e}")))?;
    // Opening the port resets the board.
    thread::sleep(Duration::from_millis(MUX_RESET_WAIT_MS));
    log::info!("Mux connected on {path} @ {MUX_BAUDRATE} baud");
    Ok(MuxSelector::new(port))
}

// ---------------------------------------------------------------------------
// Device side
// ---------------------------------------------------------------------------
#[derive(Debug, Default)]
pub struct MuxEmulator {
    active: Option<(u8, u8)>,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    silent: bool,
}

impl MuxEmulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// An emulator that swallows commands and never answers.
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    pub fn active(&self) -> Option<(u8, u8)> {
        self.active
    }

    /// Process one command line and return the reply line.
    pub fn handle_line(&mut self, line: &str) -> String {
        let cmd = line.trim_end_matches(['\n', '\r']);
        match parse_select(cmd) {
            Some((s, k)) if s != k && s < MUX_CHANNEL_COUNT && k < MUX_CHANNEL_COUNT => {
                self.active = Some((s, k));
                format!("OK:{cmd}\n")
            }
            _ => format!("ERROR:{cmd}\n"),
        }
    }
}

impl Write for MuxEmulator {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &b in buf {
            if b == b'\n' {
                let line = String::from_utf8_lossy(&self.rx).into_owned();
                self.rx.clear();
                let reply = self.handle_line(&line);
                if !self.silent {
                    self.tx.extend(reply.bytes());
                }
            } else {
                self.rx.push(b);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for MuxEmulator {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.tx.len());
        for (slot, b) in buf.iter_mut().zip(self.tx.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }
}
