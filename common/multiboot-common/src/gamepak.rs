//! ROM image container. Pads the raw image to a 16-byte boundary, enforces
//! the size bounds, splits it into the fixed header region (sent verbatim)
//! and the payload region (encrypted word-by-word), and seeds the payload
//! CRC while parsing so the checksum covers exactly the bytes that go out
//! as main data.

use crate::crc::Crc16;
use thiserror::Error;

/// Fixed header region in bytes, sent unencrypted during the header phase.
pub const HEADER_SIZE: usize = 0xC0;
/// Header region as 16-bit words.
pub const HEADER_SIZE_16: usize = HEADER_SIZE / 2;

const MIN_SIZE: usize = 0x100 + HEADER_SIZE;
const MAX_SIZE: usize = 0x3FF40 + HEADER_SIZE;

#[derive(Debug, Error)]
pub enum SizeError {
    #[error("ROM image ({0} KiB padded) exceeds the maximum of 256 KiB")]
    TooLarge(usize),
    #[error("ROM image ({0} bytes padded) is smaller than the minimum of 448 bytes")]
    TooSmall(usize),
}

pub struct GamePak {
    headers: [u16; HEADER_SIZE_16],
    data: Vec<u32>,
    crc: Crc16,
}

impl GamePak {
    pub fn new(bytes: &[u8]) -> Result<Self, SizeError> {
        let padded_len = (bytes.len() + 0xF) & !0xF;
        if padded_len > MAX_SIZE {
            return Err(SizeError::TooLarge(padded_len >> 10));
        }
        if padded_len < MIN_SIZE {
            return Err(SizeError::TooSmall(padded_len));
        }
        let mut padded = bytes.to_vec();
        padded.resize(padded_len, 0);

        let mut headers = [0u16; HEADER_SIZE_16];
        for (h, pair) in headers.iter_mut().zip(padded[..HEADER_SIZE].chunks_exact(2)) {
            *h = u16::from_le_bytes([pair[0], pair[1]]);
        }

        let body = &padded[HEADER_SIZE..];
        let mut crc = Crc16::new();
        crc.update(body);
        let data = body
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();

        Ok(Self { headers, data, crc })
    }

    /// The 96 header half-words, in transmission order.
    pub fn headers(&self) -> &[u16; HEADER_SIZE_16] {
        &self.headers
    }

    /// The payload as little-endian 32-bit words.
    pub fn data(&self) -> &[u32] {
        &self.data
    }

    /// Payload length in 32-bit words.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// CRC state already fed with every payload byte.
    pub fn crc(&self) -> Crc16 {
        self.crc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    #[test]
    fn pads_to_sixteen_byte_boundary() {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let len = rng.gen_range(MIN_SIZE..=MAX_SIZE - 16);
            let pak = GamePak::new(&vec![0u8; len]).unwrap();
            let padded = (len + 15) & !15;
            assert_eq!(pak.headers().len(), HEADER_SIZE_16);
            assert_eq!(pak.len(), (padded - HEADER_SIZE) / 4);
        }
    }

    #[test]
    fn splits_header_and_payload_little_endian() {
        let mut image = vec![0u8; MIN_SIZE];
        image[0] = 0x34;
        image[1] = 0x12;
        image[HEADER_SIZE] = 0x78;
        image[HEADER_SIZE + 1] = 0x56;
        image[HEADER_SIZE + 2] = 0x34;
        image[HEADER_SIZE + 3] = 0x12;
        let pak = GamePak::new(&image).unwrap();
        assert_eq!(pak.headers()[0], 0x1234);
        assert_eq!(pak.data()[0], 0x1234_5678);
    }

    #[test]
    fn crc_is_seeded_with_payload_bytes_only() {
        let mut image = vec![0u8; 1000];
        rand::thread_rng().fill_bytes(&mut image);
        let pak = GamePak::new(&image).unwrap();

        let padded_len = (image.len() + 15) & !15;
        let mut padded = image.clone();
        padded.resize(padded_len, 0);
        let mut expected = Crc16::new();
        expected.update(&padded[HEADER_SIZE..]);
        assert_eq!(pak.crc().sum16(), expected.sum16());
    }

    #[test]
    fn rejects_undersized_image() {
        assert!(matches!(
            GamePak::new(&[0u8; MIN_SIZE - 17]),
            Err(SizeError::TooSmall(_))
        ));
        // one byte short of the minimum still pads up to it
        assert!(GamePak::new(&[0u8; MIN_SIZE - 1]).is_ok());
    }

    #[test]
    fn rejects_oversized_image() {
        assert!(matches!(
            GamePak::new(&vec![0u8; MAX_SIZE + 1]),
            Err(SizeError::TooLarge(_))
        ));
        assert!(GamePak::new(&vec![0u8; MAX_SIZE]).is_ok());
    }
}
