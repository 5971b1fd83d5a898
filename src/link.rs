use crate::modbus;
use anyhow::{anyhow, Context, Result};
use log::debug;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

const HANDSHAKE: &[u8] = b"AT+DTUPN?\r\n";
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);
const STEADY_DEADLINE: Duration = Duration::from_secs(2);
const FLUSH_DEADLINE: Duration = Duration::from_millis(10);
// The inverter needs a beat before it answers; reading straight after the
// request returns a partial frame.
const RESPONSE_DELAY: Duration = Duration::from_millis(120);

/// The one live connection to the inverter's DTU. Owns the stream; all
/// traffic goes through the bridge-wide link lock.
pub struct InverterLink {
    stream: TcpStream,
    peer: SocketAddr,
}

impl InverterLink {
    /// Text handshake with the DTU under generous deadlines, then settle
    /// into the steady-state ones. A DTU that never answers is abandoned so
    /// the listener can re-accept.
    pub fn establish(stream: TcpStream, peer: SocketAddr) -> Result<Self> {
        stream.set_read_timeout(Some(HANDSHAKE_DEADLINE))?;
        stream.set_write_timeout(Some(HANDSHAKE_DEADLINE))?;
        let mut link = Self { stream, peer };
        link.stream.write_all(HANDSHAKE)?;
        let mut reply = [0u8; 256];
        let n = link
            .stream
            .read(&mut reply)
            .context("no handshake reply from DTU")?;
        if n == 0 {
            return Err(anyhow!("DTU closed the connection during handshake"));
        }
        debug!(
            "INV {} handshake reply {:?}",
            peer,
            String::from_utf8_lossy(&reply[..n])
        );
        thread::sleep(Duration::from_millis(500));
        link.stream.set_read_timeout(Some(STEADY_DEADLINE))?;
        link.stream.set_write_timeout(Some(STEADY_DEADLINE))?;
        Ok(link)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Drains unsolicited bytes out of the receive buffer so the next
    /// response pairs with the next request.
    pub fn flush(&mut self) {
        if self.stream.set_read_timeout(Some(FLUSH_DEADLINE)).is_err() {
            return;
        }
        let mut scratch = [0u8; 1024];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        let _ = self.stream.set_read_timeout(Some(STEADY_DEADLINE));
    }

    /// One request/response exchange for `count` holding registers. A
    /// well-formed reply carrying fewer words than requested is an error;
    /// the caller must not update its snapshot partition from it.
    pub fn read_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        self.flush();
        let request = modbus::build_read(start, count);
        debug!("GW >> INV {:02x?}", request);
        self.stream
            .write_all(&request)
            .with_context(|| format!("send read of {} registers at {}", count, start))?;
        thread::sleep(RESPONSE_DELAY);
        let mut raw = [0u8; 1024];
        let n = self
            .stream
            .read(&mut raw)
            .with_context(|| format!("read of {} registers at {} timed out", count, start))?;
        if n == 0 {
            return Err(anyhow!("inverter closed the connection"));
        }
        debug!("GW << INV {:02x?}", &raw[..n]);
        let words = modbus::parse_response(&raw[..n])?;
        if words.len() != count as usize {
            return Err(anyhow!(
                "expected {} registers at {}, got {}",
                count,
                start,
                words.len()
            ));
        }
        Ok(words)
    }

    /// Fire-and-forget single-register write. Any reply frame is dropped by
    /// the next flush; the settings sweep after the quiet window confirms
    /// the value.
    pub fn write_register(&mut self, reg: u16, value: u16) -> Result<()> {
        self.flush();
        let frame = modbus::build_write(reg, value);
        debug!("GW >> INV {:02x?}", frame);
        self.stream
            .write_all(&frame)
            .with_context(|| format!("send write of register {}", reg))?;
        Ok(())
    }
}
