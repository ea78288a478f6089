use crate::io::RW32;
use crate::tty::{ClearBuffer, Tty};
use crate::Args;
use eyre::{eyre, Result, WrapErr};
use indicatif::{ProgressBar, ProgressStyle};
use multiboot_common::gamepak::GamePak;
use multiboot_common::multiboot::{Link, Multiboot, Progress};
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

const TTY_TIMEOUT: Duration = Duration::from_millis(100);

pub fn upload(args: &Args, device: &Path) -> Result<()> {
    let rom = std::fs::read(&args.rom_file)
        .wrap_err_with(|| eyre!("failed to read {}", args.rom_file.display()))?;
    let pak = GamePak::new(&rom)?;
    tracing::info!(
        "[mb] image loaded: {} bytes, {} payload words",
        rom.len(),
        pak.len()
    );

    let mut tty = Tty::new(device, args.baud)
        .wrap_err_with(|| eyre!("failed to open {}", device.display()))?;
    tty.set_timeout(TTY_TIMEOUT);
    tracing::debug!("[mb] clearing stale bytes on {}", device.display());
    tty.clear(ClearBuffer::All)?;

    tracing::info!("[mb] waiting for the console (hold START+SELECT while powering on)");
    let mut link = SerialLink { tty: &mut tty };
    let mut progress = BarProgress::default();
    Multiboot::new(&mut link).upload(&pak, &mut progress)?;
    Ok(())
}

/// One protocol exchange per call: write the word big-endian, read the
/// peer's word back, hand up its high half.
struct SerialLink<'t> {
    tty: &'t mut Tty,
}

impl Link for SerialLink<'_> {
    fn xfer(&mut self, w: u32) -> io::Result<u16> {
        self.tty.write32_be(w)?;
        self.tty.flush()?;
        let r = self.tty.read32_be()?;
        Ok((r >> 16) as u16)
    }
}

#[derive(Default)]
struct BarProgress {
    bar: Option<ProgressBar>,
}

impl Progress for BarProgress {
    fn begin(&mut self, total_words: usize) {
        let bar = ProgressBar::new(total_words as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:60.cyan/blue} [{pos}/{len} words]",
        ) {
            bar.set_style(style);
        }
        self.bar = Some(bar);
    }

    fn advance(&mut self, sent_words: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(sent_words as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
