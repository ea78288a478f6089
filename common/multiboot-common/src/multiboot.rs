//! The multiboot upload driver.
//!
//! Drives the peer from its post-reset handshake state through header
//! exchange, encrypted payload transfer, and the final CRC echo. Every
//! exchange is a blocking write-then-read round trip over an injected
//! [`Link`]; the phases run strictly in order and any failure aborts the
//! upload. The peer decides when to leave the polled phases (the user has
//! to press a button), so those loops have no retry limit.

use crate::cipher::Cipher;
use crate::crc::Crc16;
use crate::gamepak::{GamePak, HEADER_SIZE_16};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Inter-attempt cadence for the polling phases and the mandatory pause
/// between handshake and length info. Derived from the peer's internal
/// timing.
const RETRY_DELAY: Duration = Duration::from_micros(62_500);

/// Full-duplex word transport.
///
/// `xfer` writes the 32-bit word big-endian, then reads four bytes back in
/// big-endian order and returns the high half of the received word. The
/// read must block until the word is complete.
pub trait Link {
    fn xfer(&mut self, w: u32) -> io::Result<u16>;

    fn xfer16(&mut self, w: u16) -> io::Result<u16> {
        self.xfer(w as u32)
    }
}

/// Observer for the payload stream. Observable but not
/// protocol-significant.
pub trait Progress {
    fn begin(&mut self, _total_words: usize) {}
    fn advance(&mut self, _sent_words: usize) {}
    fn finish(&mut self) {}
}

/// No-op observer.
impl Progress for () {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discover,
    Stabilize,
    PrimaryReplica1,
    Headers,
    PrimaryReplica2,
    Palette,
    Handshake,
    LengthInfo,
    MainData,
    PrepareCrc,
    SendCrc,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Discover => write!(f, "discover"),
            Phase::Stabilize => write!(f, "stabilize"),
            Phase::PrimaryReplica1 => write!(f, "primary/replica 1"),
            Phase::Headers => write!(f, "headers"),
            Phase::PrimaryReplica2 => write!(f, "primary/replica 2"),
            Phase::Palette => write!(f, "palette"),
            Phase::Handshake => write!(f, "handshake"),
            Phase::LengthInfo => write!(f, "length info"),
            Phase::MainData => write!(f, "main data"),
            Phase::PrepareCrc => write!(f, "prepare CRC"),
            Phase::SendCrc => write!(f, "send CRC"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MultibootError {
    #[error("serial link failed during {phase}: {source}")]
    Link {
        phase: Phase,
        #[source]
        source: io::Error,
    },
    #[error(
        "unexpected response during {phase}: sent {sent:#06x}, expected {expected:#06x} \
         under mask {mask:#06x}, received {received:#06x}"
    )]
    UnexpectedResponse {
        phase: Phase,
        sent: u16,
        expected: u16,
        mask: u16,
        received: u16,
    },
    #[error("upload cancelled during {phase}")]
    Cancelled { phase: Phase },
}

/// One upload session. All state is built at upload start and discarded
/// when the driver returns; the transport is owned exclusively for the
/// duration.
pub struct Multiboot<'l, L: Link> {
    link: &'l mut L,
    cancel: Option<Arc<AtomicBool>>,
    lcg_seed: u8,
    handshake: u8,
    final_crc: u8,
}

impl<'l, L: Link> Multiboot<'l, L> {
    pub fn new(link: &'l mut L) -> Self {
        Self {
            link,
            cancel: None,
            lcg_seed: 0,
            handshake: 0,
            final_crc: 0,
        }
    }

    /// Cooperative cancellation: the flag is observed between transfers in
    /// every polling loop and once per payload word. A transfer already
    /// blocked on the serial read is not interrupted.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn upload(
        mut self,
        pak: &GamePak,
        progress: &mut dyn Progress,
    ) -> Result<(), MultibootError> {
        self.discover()?;
        self.stabilize()?;

        self.send_demanding(Phase::PrimaryReplica1, 0x6102, 0x7202, 0xFFFF)?;
        tracing::info!("[mb] exchanged primary/replica info");

        self.send_headers(pak.headers())?;
        self.send_demanding(Phase::PrimaryReplica2, 0x6202, 0x7202, 0xFFFF)?;

        self.send_palette()?;
        self.send_handshake()?;

        // the peer switches out of header mode here
        thread::sleep(RETRY_DELAY);

        self.send_length_info(pak.len())?;
        self.send_main_data(pak.data(), progress)?;
        self.prepare_crc()?;
        self.send_crc(pak.crc())
    }

    fn discover(&mut self) -> Result<(), MultibootError> {
        let mut replica_mode_seen = false;
        loop {
            self.check_cancel(Phase::Discover)?;
            thread::sleep(RETRY_DELAY);
            match self.xfer16(Phase::Discover, 0x6200)? {
                0xFFFF => replica_mode_seen = true,
                0x0000 => {
                    if replica_mode_seen {
                        break;
                    }
                    replica_mode_seen = true;
                }
                0x7202 => break,
                _ => {}
            }
        }
        tracing::info!("[mb] discovered");
        Ok(())
    }

    // TODO: compare the low byte against the previous response instead of
    // the fixed 0x02, once that variant has been validated on hardware.
    fn stabilize(&mut self) -> Result<(), MultibootError> {
        let mut streak = 0;
        while streak < 15 {
            self.check_cancel(Phase::Stabilize)?;
            if self.xfer16(Phase::Stabilize, 0x6200)? == 0x7202 {
                streak += 1;
            } else {
                thread::sleep(RETRY_DELAY);
                streak = 0;
            }
        }
        tracing::info!("[mb] connection stabilized");
        Ok(())
    }

    fn send_headers(&mut self, headers: &[u16; HEADER_SIZE_16]) -> Result<(), MultibootError> {
        const CLIENT_BIT: u16 = 0x02;
        for (i, &hw) in headers.iter().enumerate() {
            let frames_remaining = (HEADER_SIZE_16 - i) as u16;
            let expected = (frames_remaining << 8) | CLIENT_BIT;
            self.send_demanding(Phase::Headers, hw, expected, 0xFFFF)?;
        }
        self.send_demanding(Phase::Headers, 0x6200, CLIENT_BIT, 0xFFFF)?;
        tracing::info!("[mb] headers sent");
        Ok(())
    }

    fn send_palette(&mut self) -> Result<(), MultibootError> {
        let r = self.send_until_response(Phase::Palette, 0x63D1, 0x7300, 0xFF00, Duration::ZERO)?;
        self.lcg_seed = r as u8;
        tracing::info!("[mb] palette data sent");
        Ok(())
    }

    fn send_handshake(&mut self) -> Result<(), MultibootError> {
        self.handshake = self
            .lcg_seed
            .wrapping_add(0xFF)
            .wrapping_add(0xFF)
            .wrapping_add(0x11);
        let w = 0x6400 | self.handshake as u16;
        self.send_demanding(Phase::Handshake, w, 0x7300, 0xFF00)?;
        tracing::info!("[mb] handshake sent");
        Ok(())
    }

    fn send_length_info(&mut self, words: usize) -> Result<(), MultibootError> {
        let w = (words as u16).wrapping_sub(0x34);
        let r = self.send_demanding(Phase::LengthInfo, w, 0x7300, 0xFF00)?;
        self.final_crc = r as u8;
        tracing::info!("[mb] length info sent");
        Ok(())
    }

    fn send_main_data(
        &mut self,
        data: &[u32],
        progress: &mut dyn Progress,
    ) -> Result<(), MultibootError> {
        tracing::info!("[mb] sending main data ({} words)", data.len());
        let iv = u32::from_le_bytes([0xD1, self.lcg_seed, 0xFF, 0xFF]);
        let mut cipher = Cipher::new(iv);
        progress.begin(data.len());
        for (i, &word) in data.iter().enumerate() {
            self.check_cancel(Phase::MainData)?;
            // the response is not checked during the data stream
            self.xfer(Phase::MainData, cipher.encrypt(word))?;
            progress.advance(i + 1);
        }
        progress.finish();
        tracing::info!("[mb] main data sent");
        Ok(())
    }

    fn prepare_crc(&mut self) -> Result<(), MultibootError> {
        self.send_until_response(Phase::PrepareCrc, 0x65, 0x75, 0xFF, RETRY_DELAY)?;
        self.send_demanding(Phase::PrepareCrc, 0x66, 0x75, 0xFF)?;
        Ok(())
    }

    fn send_crc(&mut self, mut crc: Crc16) -> Result<(), MultibootError> {
        crc.update(&[self.handshake, self.final_crc, 0xFF, 0xFF]);
        let sum = crc.sum16();
        self.send_demanding(Phase::SendCrc, sum, sum, 0xFFFF)?;
        tracing::info!("[mb] CRC echoed, upload complete");
        Ok(())
    }

    fn send_demanding(
        &mut self,
        phase: Phase,
        w: u16,
        expected: u16,
        mask: u16,
    ) -> Result<u16, MultibootError> {
        let r = self.xfer16(phase, w)?;
        if (r & mask) != (expected & mask) {
            return Err(MultibootError::UnexpectedResponse {
                phase,
                sent: w,
                expected,
                mask,
                received: r,
            });
        }
        Ok(r)
    }

    fn send_until_response(
        &mut self,
        phase: Phase,
        w: u16,
        expected: u16,
        mask: u16,
        delay: Duration,
    ) -> Result<u16, MultibootError> {
        loop {
            self.check_cancel(phase)?;
            let r = self.xfer16(phase, w)?;
            if (r & mask) == (expected & mask) {
                return Ok(r);
            }
            thread::sleep(delay);
        }
    }

    fn xfer16(&mut self, phase: Phase, w: u16) -> Result<u16, MultibootError> {
        self.xfer(phase, w as u32)
    }

    fn xfer(&mut self, phase: Phase, w: u32) -> Result<u16, MultibootError> {
        let r = self
            .link
            .xfer(w)
            .map_err(|source| MultibootError::Link { phase, source })?;
        tracing::trace!("[mb] > {w:#010x} < {r:#06x}");
        Ok(r)
    }

    fn check_cancel(&self, phase: Phase) -> Result<(), MultibootError> {
        if self
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            return Err(MultibootError::Cancelled { phase });
        }
        Ok(())
    }
}
