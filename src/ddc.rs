//! DDC/SCDC link transport.
//!
//! All register access goes through [`Ddc`], which wraps a raw [`DdcPort`]
//! and turns transfer failures into offset-specific error kinds. The hot-plug
//! line is sampled before and after every transfer; a low reading on either
//! side turns the result into [`Error::Plugout`] whatever the transfer did.

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

// HDCP 1.4 port registers.
pub const HDCP1_BKSV: u8 = 0x00;
pub const HDCP1_RI_PRIME: u8 = 0x08;
pub const HDCP1_AKSV: u8 = 0x10;
pub const HDCP1_AN: u8 = 0x18;
pub const HDCP1_V_PRIME: u8 = 0x20;
pub const HDCP1_BCAPS: u8 = 0x40;
pub const HDCP1_BSTATUS: u8 = 0x41;
pub const HDCP1_KSV_FIFO: u8 = 0x43;

pub const BCAPS_REPEATER: u8 = 0x40;
pub const BCAPS_KSV_FIFO_READY: u8 = 0x20;

// HDCP 2.2 port registers.
pub const HDCP2_VERSION: u8 = 0x50;
pub const HDCP2_WRITE_MESSAGE: u8 = 0x60;
pub const HDCP2_RX_STATUS: u8 = 0x70;
pub const HDCP2_READ_MESSAGE: u8 = 0x80;

pub const HDCP2_VERSION_CAPABLE: u8 = 0x04;

// SCDC character error detection block.
pub const SCDC_ERR_DET_0_L: u8 = 0x50;
const CED_VALID: u8 = 0x80;

/// Raw access to one HDMI output's DDC bus and hot-plug line.
///
/// Implementations do plain transfers; classification and the unplug checks
/// are done by [`Ddc`].
pub trait DdcPort: Send {
    /// Current hot-plug state.
    fn hpd(&self) -> bool;
    /// Read `buf.len()` bytes from the HDCP port starting at `offset`.
    fn i2c_read(&mut self, offset: u8, buf: &mut [u8]) -> io::Result<()>;
    /// Write to the HDCP port. `data[0]` is the register offset.
    fn i2c_write(&mut self, data: &[u8]) -> io::Result<()>;
    /// Whether the sink exposes SCDC.
    fn scdc_supported(&self) -> bool;
    /// Read `buf.len()` bytes from SCDC starting at `offset`.
    fn scdc_read(&mut self, offset: u8, buf: &mut [u8]) -> io::Result<()>;
    /// Whether the output pipe is currently driving a signal.
    fn output_enabled(&self) -> bool {
        true
    }
}

impl<P: DdcPort + ?Sized> DdcPort for Box<P> {
    fn hpd(&self) -> bool {
        (**self).hpd()
    }
    fn i2c_read(&mut self, offset: u8, buf: &mut [u8]) -> io::Result<()> {
        (**self).i2c_read(offset, buf)
    }
    fn i2c_write(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).i2c_write(data)
    }
    fn scdc_supported(&self) -> bool {
        (**self).scdc_supported()
    }
    fn scdc_read(&mut self, offset: u8, buf: &mut [u8]) -> io::Result<()> {
        (**self).scdc_read(offset, buf)
    }
    fn output_enabled(&self) -> bool {
        (**self).output_enabled()
    }
}

#[must_use]
fn read_error_kind(offset: u8) -> Error {
    match offset {
        HDCP1_BKSV => Error::DdcBksv,
        HDCP1_RI_PRIME => Error::DdcRiPrime,
        HDCP1_BCAPS => Error::DdcBcaps,
        HDCP1_BSTATUS => Error::DdcBstatus,
        HDCP1_KSV_FIFO => Error::DdcKsvFifo,
        o if (HDCP1_V_PRIME..HDCP1_V_PRIME + 20).contains(&o) => Error::DdcVPrime,
        HDCP2_VERSION => Error::DdcHdcp2Version,
        HDCP2_RX_STATUS => Error::DdcRxStatus,
        HDCP2_READ_MESSAGE => Error::DdcReadMessage,
        _ => Error::DdcReadTransfer,
    }
}

#[must_use]
fn write_error_kind(offset: u8) -> Error {
    match offset {
        HDCP1_AN => Error::DdcAn,
        HDCP1_AKSV => Error::DdcAksv,
        HDCP2_WRITE_MESSAGE => Error::DdcWriteMessage,
        _ => Error::DdcWriteTransfer,
    }
}

/// Unplug-aware register access on top of a [`DdcPort`].
#[derive(Debug)]
pub struct Ddc<P> {
    port: P,
}

impl<P: DdcPort> Ddc<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_inner(self) -> P {
        self.port
    }

    #[must_use]
    pub fn hpd(&self) -> bool {
        self.port.hpd()
    }

    #[must_use]
    pub fn output_enabled(&self) -> bool {
        self.port.output_enabled()
    }

    /// Read `buf.len()` bytes at `offset`.
    pub fn read(&mut self, offset: u8, buf: &mut [u8]) -> Result<()> {
        if !self.port.hpd() {
            return Err(Error::Plugout);
        }
        let res = self.port.i2c_read(offset, buf);
        if !self.port.hpd() {
            return Err(Error::Plugout);
        }
        res.map_err(|e| {
            debug!("ddc read at {offset:#04x} failed: {e}");
            read_error_kind(offset)
        })
    }

    /// Read a fixed-size register block.
    pub fn read_array<const N: usize>(&mut self, offset: u8) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read(offset, &mut buf)?;
        Ok(buf)
    }

    /// Write `data` at `offset`.
    pub fn write(&mut self, offset: u8, data: &[u8]) -> Result<()> {
        if !self.port.hpd() {
            return Err(Error::Plugout);
        }
        let mut scratch = Vec::new();
        scratch
            .try_reserve_exact(data.len() + 1)
            .map_err(|_| Error::DdcWriteNoMem)?;
        scratch.push(offset);
        scratch.extend_from_slice(data);

        let res = self.port.i2c_write(&scratch);
        if !self.port.hpd() {
            return Err(Error::Plugout);
        }
        res.map_err(|e| {
            debug!("ddc write at {offset:#04x} failed: {e}");
            write_error_kind(offset)
        })
    }

    /// Read the SCDC character error counters.
    ///
    /// Returns `Ok(())` when all three channels count zero errors and
    /// `Error::Ced(mask)` with one bit per failing channel otherwise.
    pub fn check_ced(&mut self) -> Result<()> {
        if !self.port.scdc_supported() {
            return Err(Error::CedNotSupported);
        }
        if !self.port.hpd() {
            return Err(Error::Plugout);
        }
        let mut d = [0u8; 6];
        self.port
            .scdc_read(SCDC_ERR_DET_0_L, &mut d)
            .map_err(|_| Error::DdcReadTransfer)?;
        decode_ced(&d)
    }

    /// Keep the link under watch for `total`, sampling hot-plug every `tick`.
    pub fn hold(&self, total: Duration, tick: Duration) -> Result<()> {
        let end = Instant::now() + total;
        loop {
            if !self.port.hpd() {
                return Err(Error::Plugout);
            }
            let now = Instant::now();
            if now >= end {
                return Ok(());
            }
            thread::sleep(tick.min(end - now));
        }
    }
}

/// Decode a 6-byte SCDC error detection block.
pub fn decode_ced(d: &[u8; 6]) -> Result<()> {
    if d[1] & d[3] & d[5] & CED_VALID == 0 {
        return Err(Error::CedInvalid);
    }
    let mut mask = 0u8;
    for ch in 0..3 {
        let count = (u16::from(d[2 * ch + 1] & 0x7f) << 8) | u16::from(d[2 * ch]);
        if count != 0 {
            mask |= 1 << ch;
        }
    }
    if mask == 0 {
        Ok(())
    } else {
        Err(Error::Ced(mask))
    }
}
