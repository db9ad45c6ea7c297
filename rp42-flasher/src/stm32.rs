//! Flashing the RP42's firmware flash over the calculator's serial console.
//!
//! The target does not speak a framed bootloader protocol. Commands are plain
//! text lines, data blocks are raw bytes, and nothing is ever read back, so
//! every write is followed by a fixed sleep instead of waiting on an
//! acknowledgment. A failed block write is therefore undetectable here; the
//! run has to be restarted from the erase phase.
//!
//! The image is written in two passes around a bootloader quirk: the region
//! from `TAIL_START` to the end of the image goes first, and the low region
//! below `HEAD_END` goes last, after an operator checkpoint, so the code the
//! bootloader still runs from is never invalidated mid-flash.

use std::{
    cmp,
    io::{self, Write},
    thread,
    time::Duration,
};

use futures::channel::mpsc;
use thiserror::Error;
use tracing::info;

use crate::Status;

const BAUD_RATE: u32 = 9600;
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Unit of transfer: the `W` wire command always carries this many bytes.
const BLOCK_SIZE: usize = 256;
const FILL_BYTE: u8 = 0xff;

/// Flash layout boundaries of the two write passes. Target-specific and not
/// derivable from the image; confirmed against the RP42 flash layout only.
const TAIL_START: usize = 299_500;
const HEAD_END: usize = 300_000;

/// Write latency margins tuned against the hardware. The target acknowledges
/// nothing, so these sleeps are the only pacing.
const COMMAND_DELAY: Duration = Duration::from_millis(1);
const DATA_DELAY: Duration = Duration::from_millis(50);

/// The erase wait is a fixed duration, not a measured completion.
const ERASE_STEPS: usize = 20;
const ERASE_STEP_DELAY: Duration = Duration::from_secs(1);

/// Progress is reported once per this many blocks.
const PROGRESS_STRIDE: usize = 20;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
/// Errors for the RP42 serial console
pub enum Error {
    /// Failed to open serial port
    #[error("Failed to open serial port")]
    FailedToOpenPort,
    #[error("IO Error: {0}")]
    IoError(io::Error),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IoError(value)
    }
}

/// One session in the calculator's rewrite console.
///
/// Generic over [`Write`] since the protocol is fire-and-forget; tests drive
/// it with an in-memory writer.
struct Rp42<W: Write> {
    port: W,
}

impl<W: Write> Rp42<W> {
    fn new(port: W) -> Self {
        Rp42 { port }
    }

    fn command(&mut self, cmd: &str) -> Result<()> {
        self.port.write_all(cmd.as_bytes())?;
        self.port.write_all(b"\n")?;
        Ok(())
    }

    fn echo_off(&mut self) -> Result<()> {
        self.command("echo off")
    }

    fn echo_on(&mut self) -> Result<()> {
        self.command("echo on")
    }

    /// Enters firmware-rewrite mode.
    fn enter_rewrite_mode(&mut self) -> Result<()> {
        self.command("frw")
    }

    fn write_enable(&mut self) -> Result<()> {
        self.command("we")
    }

    fn erase_chip(&mut self) -> Result<()> {
        self.command("ec")
    }

    fn exit_rewrite_mode(&mut self) -> Result<()> {
        self.command("exit")?;
        self.echo_on()
    }

    /// Sends one block: `W <offset> 256`, the data, and the pacing sleeps.
    /// Short blocks are filled up to `BLOCK_SIZE` with `FILL_BYTE`.
    fn write_block(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= BLOCK_SIZE);

        self.command(&format!("W {} {}", offset, BLOCK_SIZE))?;
        thread::sleep(COMMAND_DELAY);

        self.port.write_all(data)?;
        if data.len() < BLOCK_SIZE {
            const FILL: [u8; BLOCK_SIZE] = [FILL_BYTE; BLOCK_SIZE];
            self.port.write_all(&FILL[data.len()..])?;
        }
        thread::sleep(DATA_DELAY);
        Ok(())
    }
}

/// One contiguous byte range of the image, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Region {
    start: usize,
    end: usize,
}

impl Region {
    /// Everything from the tail boundary to the end of the image. Empty for
    /// images that do not reach past the boundary.
    fn tail(image_len: usize) -> Self {
        Region {
            start: TAIL_START,
            end: cmp::max(image_len, TAIL_START),
        }
    }

    /// Everything below the head boundary.
    fn head(image_len: usize) -> Self {
        Region {
            start: 0,
            end: cmp::min(image_len, HEAD_END),
        }
    }

    fn len(self) -> usize {
        self.end - self.start
    }

    /// Starting offsets of the blocks covering the region.
    fn block_offsets(self) -> impl Iterator<Item = usize> {
        (self.start..self.end).step_by(BLOCK_SIZE)
    }

    /// Fraction of the region covered once the block at `offset` is sent.
    fn progress(self, offset: usize) -> f32 {
        let sent = cmp::min(offset + BLOCK_SIZE, self.end) - self.start;
        sent as f32 / self.len() as f32
    }
}

fn chan_send(chan: Option<&mut mpsc::Sender<Status>>, msg: Status) {
    if let Some(c) = chan {
        let _ = c.try_send(msg);
    }
}

fn open(port: &str) -> Result<Box<dyn serialport::SerialPort>> {
    serialport::new(port, BAUD_RATE)
        .timeout(READ_TIMEOUT)
        .open()
        .map_err(|_| Error::FailedToOpenPort)
}

/// Phase 1: erase the whole flash chip.
///
/// Sends the erase control sequence, then reports synthetic progress in 5 %
/// steps once per second for 20 seconds. The target does not signal erase
/// completion; the wait is a fixed margin, not a measurement. The session is
/// closed on return, since the operator power-cycles the target afterwards.
pub fn erase(port: &str, mut chan: Option<mpsc::Sender<Status>>) -> Result<()> {
    let mut rp42 = Rp42::new(open(port)?);
    info!("Erasing chip");

    rp42.echo_off()?;
    rp42.enter_rewrite_mode()?;
    rp42.write_enable()?;
    rp42.erase_chip()?;

    for i in 0..ERASE_STEPS {
        chan_send(chan.as_mut(), Status::Erasing(i as f32 / ERASE_STEPS as f32));
        thread::sleep(ERASE_STEP_DELAY);
    }
    chan_send(chan.as_mut(), Status::Erasing(1.0));

    Ok(())
}

/// Phase 3: write the tail region, offsets 299 500 to the end of the image.
///
/// The low region is deliberately skipped here and written by [`write_head`]
/// after the operator checkpoint.
pub fn write_tail(
    firmware: &[u8],
    port: &str,
    chan: Option<mpsc::Sender<Status>>,
) -> Result<()> {
    info!("Writing tail region");
    write_region(firmware, Region::tail(firmware.len()), port, chan)
}

/// Phase 5: write the head region, offsets 0 up to (not including) 300 000.
pub fn write_head(
    firmware: &[u8],
    port: &str,
    chan: Option<mpsc::Sender<Status>>,
) -> Result<()> {
    info!("Writing head region");
    write_region(firmware, Region::head(firmware.len()), port, chan)
}

/// Opens a fresh session (the operator may have moved the target to a
/// different port between phases), streams one region, and leaves rewrite
/// mode before the session closes.
fn write_region(
    firmware: &[u8],
    region: Region,
    port: &str,
    mut chan: Option<mpsc::Sender<Status>>,
) -> Result<()> {
    let mut rp42 = Rp42::new(open(port)?);

    rp42.echo_off()?;
    rp42.enter_rewrite_mode()?;
    stream_blocks(&mut rp42, firmware, region, chan.as_mut())?;
    rp42.exit_rewrite_mode()?;

    Ok(())
}

fn stream_blocks<W: Write>(
    rp42: &mut Rp42<W>,
    firmware: &[u8],
    region: Region,
    mut chan: Option<&mut mpsc::Sender<Status>>,
) -> Result<()> {
    for (i, offset) in region.block_offsets().enumerate() {
        let chunk = &firmware[offset..cmp::min(offset + BLOCK_SIZE, firmware.len())];
        rp42.write_block(offset, chunk)?;

        if (i + 1) % PROGRESS_STRIDE == 0 {
            chan_send(chan.as_deref_mut(), Status::Writing(region.progress(offset)));
        }
    }
    chan_send(chan.as_deref_mut(), Status::Writing(1.0));

    Ok(())
}

/// Serial ports currently visible on the host, for the operator prompt.
///
/// The RP42 shows up as a plain CDC-ACM device with nothing to distinguish
/// it from other serial hardware, so no filtering is attempted; picking the
/// right port is on the operator.
pub fn ports() -> Vec<String> {
    serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|p| p.port_name)
        .collect()
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc;

    use super::*;

    fn session() -> Rp42<Vec<u8>> {
        Rp42::new(Vec::new())
    }

    #[test]
    fn erase_control_sequence() {
        let mut rp42 = session();
        rp42.echo_off().unwrap();
        rp42.enter_rewrite_mode().unwrap();
        rp42.write_enable().unwrap();
        rp42.erase_chip().unwrap();
        assert_eq!(rp42.port, b"echo off\nfrw\nwe\nec\n");
    }

    #[test]
    fn exit_control_sequence() {
        let mut rp42 = session();
        rp42.exit_rewrite_mode().unwrap();
        assert_eq!(rp42.port, b"exit\necho on\n");
    }

    #[test]
    fn write_block_frames_command() {
        let mut rp42 = session();
        rp42.write_block(1024, &[0xab; BLOCK_SIZE]).unwrap();

        let header = b"W 1024 256\n";
        assert_eq!(&rp42.port[..header.len()], header);
        assert_eq!(rp42.port.len(), header.len() + BLOCK_SIZE);
        assert!(rp42.port[header.len()..].iter().all(|b| *b == 0xab));
    }

    #[test]
    fn short_block_padded_with_fill() {
        let mut rp42 = session();
        rp42.write_block(299_756, &[0x42; 100]).unwrap();

        let header = b"W 299756 256\n";
        assert_eq!(&rp42.port[..header.len()], header);
        assert_eq!(rp42.port.len(), header.len() + BLOCK_SIZE);

        let data = &rp42.port[header.len()..];
        assert!(data[..100].iter().all(|b| *b == 0x42));
        assert!(data[100..].iter().all(|b| *b == FILL_BYTE));
    }

    #[test]
    fn tail_region_starts_at_boundary() {
        let offsets: Vec<_> = Region::tail(300_000).block_offsets().collect();
        assert_eq!(offsets, [299_500, 299_756]);
    }

    #[test]
    fn tail_region_empty_for_short_images() {
        assert_eq!(Region::tail(0).block_offsets().count(), 0);
        assert_eq!(Region::tail(299_499).block_offsets().count(), 0);
        assert_eq!(Region::tail(299_500).block_offsets().count(), 0);
    }

    #[test]
    fn tail_region_single_block_past_boundary() {
        let offsets: Vec<_> = Region::tail(299_501).block_offsets().collect();
        assert_eq!(offsets, [299_500]);
    }

    #[test]
    fn head_region_stays_below_boundary() {
        let offsets: Vec<_> = Region::head(600_000).block_offsets().collect();
        assert_eq!(offsets.len(), 1172);
        assert_eq!(offsets[0], 0);
        assert_eq!(*offsets.last().unwrap(), 299_776);
        assert!(offsets.iter().all(|o| *o < HEAD_END));
    }

    #[test]
    fn head_region_clamps_to_image_length() {
        let offsets: Vec<_> = Region::head(100).block_offsets().collect();
        assert_eq!(offsets, [0]);
    }

    #[test]
    fn progress_is_bytes_over_region_size() {
        let head = Region::head(300_000);
        assert_eq!(head.progress(0), 256.0 / 300_000.0);

        let tail = Region::tail(300_000);
        assert_eq!(tail.progress(299_500), 256.0 / 500.0);
    }

    #[test]
    fn progress_reaches_exactly_one_on_final_block() {
        assert_eq!(Region::head(300_000).progress(299_776), 1.0);
        assert_eq!(Region::tail(300_000).progress(299_756), 1.0);
        assert_eq!(Region::head(100).progress(0), 1.0);
    }

    #[test]
    fn streams_whole_region_with_final_padding() {
        let firmware: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        let region = Region { start: 0, end: 600 };

        let mut rp42 = session();
        stream_blocks(&mut rp42, &firmware, region, None).unwrap();

        let mut pos = 0;
        for offset in [0usize, 256, 512] {
            let header = format!("W {offset} 256\n");
            assert_eq!(&rp42.port[pos..pos + header.len()], header.as_bytes());
            pos += header.len();

            let block = &rp42.port[pos..pos + BLOCK_SIZE];
            let data_len = cmp::min(offset + BLOCK_SIZE, firmware.len()) - offset;
            assert_eq!(&block[..data_len], &firmware[offset..offset + data_len]);
            assert!(block[data_len..].iter().all(|b| *b == FILL_BYTE));
            pos += BLOCK_SIZE;
        }
        assert_eq!(pos, rp42.port.len());
    }

    #[test]
    fn progress_reported_every_twenty_blocks() {
        // 40 full blocks: progress at block 20, block 40, and the final 100 %.
        let firmware = vec![0u8; 40 * BLOCK_SIZE];
        let region = Region {
            start: 0,
            end: firmware.len(),
        };

        let (mut tx, mut rx) = mpsc::channel(20);
        let mut rp42 = session();
        stream_blocks(&mut rp42, &firmware, region, Some(&mut tx)).unwrap();
        drop(tx);

        let mut reported = Vec::new();
        while let Ok(Some(status)) = rx.try_next() {
            reported.push(status);
        }
        assert_eq!(
            reported,
            [
                Status::Writing(0.5),
                Status::Writing(1.0),
                Status::Writing(1.0),
            ]
        );
    }
}
