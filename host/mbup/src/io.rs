//! Word-at-a-time I/O over the serial link. The multiboot wire format is
//! big-endian in both directions.

use std::io::{self, ErrorKind, Read, Write};

pub trait RW32: Read + Write {
    fn write32_be(&mut self, w: u32) -> io::Result<()> {
        self.write_all(&w.to_be_bytes())
    }

    /// Blocks until a full word has arrived. Read timeouts are not fatal
    /// here: the peer answers in its own time, so the word is reassembled
    /// across as many partial reads as it takes.
    fn read32_be(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "serial link closed mid-word",
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                    continue
                }
                Err(e) => return Err(e),
            }
        }
        Ok(u32::from_be_bytes(buf))
    }
}

impl<T: Read + Write> RW32 for T {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Yields the scripted chunks one at a time, with a timeout between
    /// them, the way a serial port dribbles bytes in.
    struct DribbleStream {
        chunks: Vec<Vec<u8>>,
        starve: bool,
    }

    impl Read for DribbleStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.starve {
                self.starve = false;
                return Err(io::Error::new(ErrorKind::TimedOut, "no data yet"));
            }
            self.starve = true;
            match self.chunks.first() {
                None => Ok(0),
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    let rest = chunk[n..].to_vec();
                    if rest.is_empty() {
                        self.chunks.remove(0);
                    } else {
                        self.chunks[0] = rest;
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for DribbleStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn reassembles_word_across_partial_reads_and_timeouts() {
        let mut stream = DribbleStream {
            chunks: vec![vec![0x12], vec![0x34, 0x56], vec![0x78]],
            starve: true,
        };
        assert_eq!(stream.read32_be().unwrap(), 0x1234_5678);
    }

    #[test]
    fn eof_mid_word_is_an_error() {
        let mut stream = DribbleStream {
            chunks: vec![vec![0x12, 0x34]],
            starve: false,
        };
        let err = stream.read32_be().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn words_go_out_big_endian() {
        let mut out = io::Cursor::new(Vec::new());
        out.write32_be(0x1234_5678).unwrap();
        assert_eq!(out.into_inner(), [0x12, 0x34, 0x56, 0x78]);
    }
}
