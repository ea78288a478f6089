//! Wire protocol for uploading a multiboot program image to a handheld
//! console over a synchronous serial link.
//!
//! The peer's reset-mode loader expects an exact choreography of 16-bit and
//! 32-bit words: a polled discovery handshake, a framed header exchange, an
//! encrypted payload stream, and a final CRC echo. This crate holds the two
//! primitives (the custom CRC-16 and the per-word payload cipher), the ROM
//! image container, and the driver that runs the full exchange over an
//! injected word transport.

/// The baud rate the peer expects on the serial link.
pub const BAUD_RATE: u32 = 115_200;

/// Per-word payload encryption.
pub mod cipher;
/// The CRC-16 that seals an upload.
pub mod crc;
/// ROM image container: padding, bounds, header/payload split.
pub mod gamepak;
/// The upload driver and its transport contract.
pub mod multiboot;
