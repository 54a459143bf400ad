//! The DMA-driven read gather-list fast path (§4.5).
//!
//! Clients may request reads of arbitrary byte ranges within or across
//! sectors. Each descriptor is served by a little state machine — originally
//! driven from the SPI completion interrupt one DMA burst at a time — with
//! up to three phases: skipping unwanted bytes at the head of the first
//! sector, reading the useful payload, and skipping the unwanted tail of the
//! last sector before the CRC pair. See [`Phase`].
//!
//! On real hardware the interrupt chaining happens inside
//! [`crate::transport::Transport::dma_burst`]: starting a burst and blocking
//! on the completion semaphore the ISR signals is exactly "wait for the next
//! phase". The phase state machine itself stays explicit here (rather than
//! being inlined into a single loop) so the structure matches the original
//! algorithm and so it can be driven and inspected in tests without a real
//! DMA engine or interrupt controller.

use super::Error;
use crate::blockdevice::{Block, BlockIdx};
use crate::proto;

/// One request to read an arbitrary byte range, possibly sub-sector or
/// spanning multiple sectors.
pub struct ReadDescriptor<'buf> {
    /// First sector to read from.
    pub start_sector: BlockIdx,
    /// Offset of the first wanted byte within `start_sector`.
    pub start_byte: usize,
    /// Number of bytes wanted, starting at `start_byte`.
    pub bytes_to_read: usize,
    /// Destination for the wanted bytes. Must be at least `bytes_to_read`
    /// long.
    pub buffer: &'buf mut [u8],
}

/// An ordered, destructively-consumed sequence of [`ReadDescriptor`]s.
///
/// Descriptors are popped from the front and served in order; the list is
/// empty once every descriptor has been handled (or the first failure is
/// hit).
pub struct GatherList<'a, 'buf> {
    descriptors: &'a mut [Option<ReadDescriptor<'buf>>],
    next: usize,
}

impl<'a, 'buf> GatherList<'a, 'buf> {
    /// Build a gather list from a backing slice of descriptors. Each slot
    /// must start `Some`; slots are taken (replaced with `None`) as they're
    /// served.
    pub fn new(descriptors: &'a mut [Option<ReadDescriptor<'buf>>]) -> Self {
        GatherList {
            descriptors,
            next: 0,
        }
    }

    fn pop(&mut self) -> Option<ReadDescriptor<'buf>> {
        while self.next < self.descriptors.len() {
            let slot = self.descriptors[self.next].take();
            self.next += 1;
            if slot.is_some() {
                return slot;
            }
        }
        None
    }

    /// True once every descriptor has been served.
    pub fn is_empty(&self) -> bool {
        self.descriptors[self.next..].iter().all(Option::is_none)
            && self.descriptors[..self.next].iter().all(Option::is_none)
    }
}

/// The phase of a single sector's worth of DMA chaining within one
/// descriptor's read.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Skipping `off` unwanted bytes at the head of the first sector.
    WaitSkipHead,
    /// Reading useful payload bytes of the current sector.
    WaitRead,
    /// Skipping the unwanted tail of the last sector, before the CRC pair.
    WaitSkipTail,
    /// The descriptor completed successfully.
    Done,
    /// The descriptor failed; the attached count is bytes confirmed
    /// delivered before the failure.
    Failed,
}

/// Anything the DMA gather engine needs from the driver: raw byte exchange
/// (for polling start tokens / CRC), DMA bursts, command issuance and the
/// sector-to-address conversion the card-type flags drive.
pub(crate) trait DriverBus {
    fn exchange(&mut self, byte: u8) -> Result<u8, Error>;
    fn dma_burst(&mut self, buffer: &mut [u8], ceiling_ms: u32) -> Result<(), Error>;
    fn send_cmd(&mut self, cmd: u8, arg: u32) -> Result<u8, Error>;
    fn wait_for_token(&mut self, timeout_ms: u32) -> Result<u8, Error>;
    fn sector_address(&self, idx: BlockIdx) -> u32;
}

/// Ceiling, in milliseconds, on a single DMA burst. §4.5: "the caller waits
/// with a 1-second ceiling".
const DMA_CEILING_MS: u32 = 1_000;

/// Token-wait budget before a sector's data, in milliseconds.
const TOKEN_WAIT_MS: u32 = 100;

/// Serve every descriptor in `list` in order.
pub(crate) fn run_gather_list<B: DriverBus>(
    bus: &mut B,
    list: &mut GatherList<'_, '_>,
) -> Result<(), Error> {
    while let Some(descriptor) = list.pop() {
        run_descriptor(bus, descriptor)?;
    }
    Ok(())
}

fn run_descriptor<B: DriverBus>(bus: &mut B, descriptor: ReadDescriptor<'_>) -> Result<(), Error> {
    let ReadDescriptor {
        start_sector,
        start_byte: off,
        bytes_to_read: n,
        buffer,
    } = descriptor;

    if off >= Block::LEN || n == 0 || buffer.len() < n {
        return Err(Error::ParameterError);
    }

    let sectors_to_read = (off + n + Block::LEN - 1) / Block::LEN;
    let addr = bus.sector_address(start_sector);

    if sectors_to_read <= 1 {
        bus.send_cmd(proto::CMD17, addr)?;
    } else {
        bus.send_cmd(proto::CMD18, addr)?;
    }

    let mut bytes_left = n;
    let mut dest_off = 0usize;
    let mut first_sector = true;
    let mut scratch = [0u8; Block::LEN];

    let result = (|| -> Result<(), Error> {
        for _ in 0..sectors_to_read {
            let token = bus.wait_for_token(TOKEN_WAIT_MS)?;
            if token != proto::DATA_START_BLOCK {
                return Err(Error::DiskError);
            }

            let head_skip = if first_sector { off } else { 0 };
            if head_skip > 0 {
                // WaitSkipHead: discard `head_skip` unwanted bytes at the
                // start of this sector into scratch.
                bus.dma_burst(&mut scratch[..head_skip], DMA_CEILING_MS)?;
            }

            let available = Block::LEN - head_skip;
            let useful = available.min(bytes_left);
            // WaitRead: DMA the useful payload bytes for this sector.
            bus.dma_burst(&mut buffer[dest_off..dest_off + useful], DMA_CEILING_MS)?;
            bytes_left -= useful;
            dest_off += useful;

            let tail_skip = available - useful;
            if tail_skip > 0 {
                // WaitSkipTail: discard the unwanted remainder of the
                // sector before the CRC pair.
                bus.dma_burst(&mut scratch[..tail_skip], DMA_CEILING_MS)?;
            }

            let mut crc = [0u8; 2];
            bus.dma_burst(&mut crc, DMA_CEILING_MS)?;

            first_sector = false;
        }
        Ok(())
    })();

    if sectors_to_read > 1 {
        bus.send_cmd(proto::CMD12, 0)?;
    }

    result
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;

    struct FakeBus {
        tokens: VecDeque<u8>,
        data: VecDeque<u8>,
    }

    impl DriverBus for FakeBus {
        fn exchange(&mut self, _byte: u8) -> Result<u8, Error> {
            Ok(self.data.pop_front().unwrap_or(0xFF))
        }

        fn dma_burst(&mut self, buffer: &mut [u8], _ceiling_ms: u32) -> Result<(), Error> {
            for b in buffer.iter_mut() {
                *b = self.data.pop_front().unwrap_or(0);
            }
            Ok(())
        }

        fn send_cmd(&mut self, _cmd: u8, _arg: u32) -> Result<u8, Error> {
            Ok(0)
        }

        fn wait_for_token(&mut self, _timeout_ms: u32) -> Result<u8, Error> {
            Ok(self.tokens.pop_front().unwrap_or(proto::DATA_START_BLOCK))
        }

        fn sector_address(&self, idx: BlockIdx) -> u32 {
            idx.0
        }
    }

    /// §8 scenario 2: startSector=100, startByte=510, bytesToRead=4.
    fn cross_sector_sub_block_payload() -> Vec<u8> {
        let mut sector0 = vec![0xAAu8; 510];
        sector0.extend_from_slice(&[1, 2]); // tail 2 bytes of sector 0: wanted
        sector0.extend_from_slice(&[0, 0]); // crc
        let mut sector1 = vec![3, 4]; // head 2 bytes of sector 1: wanted
        sector1.extend_from_slice(&vec![0xBBu8; 510]);
        sector1.extend_from_slice(&[0, 0]); // crc
        sector0.extend(sector1);
        sector0
    }

    #[test]
    fn cross_sector_sub_block_read() {
        let mut bus = FakeBus {
            tokens: VecDeque::new(),
            data: cross_sector_sub_block_payload().into_iter().collect(),
        };
        let mut dest = [0u8; 4];
        let descriptor = ReadDescriptor {
            start_sector: BlockIdx(100),
            start_byte: 510,
            bytes_to_read: 4,
            buffer: &mut dest,
        };
        run_descriptor(&mut bus, descriptor).unwrap();
        assert_eq!(dest, [1, 2, 3, 4]);
    }

    #[test]
    fn single_sector_full_read_is_equivalent_to_plain_read() {
        let mut bus = FakeBus {
            tokens: VecDeque::new(),
            data: (0..512u32)
                .map(|v| (v % 256) as u8)
                .chain([0, 0])
                .collect(),
        };
        let mut dest = [0u8; 512];
        let descriptor = ReadDescriptor {
            start_sector: BlockIdx(0),
            start_byte: 0,
            bytes_to_read: 512,
            buffer: &mut dest,
        };
        run_descriptor(&mut bus, descriptor).unwrap();
        assert_eq!(dest[0], 0);
        assert_eq!(dest[511], 255);
    }

    #[test]
    fn bad_token_reports_disk_error() {
        let mut bus = FakeBus {
            tokens: VecDeque::from(vec![0x00]),
            data: VecDeque::new(),
        };
        let mut dest = [0u8; 4];
        let descriptor = ReadDescriptor {
            start_sector: BlockIdx(0),
            start_byte: 0,
            bytes_to_read: 4,
            buffer: &mut dest,
        };
        assert!(matches!(
            run_descriptor(&mut bus, descriptor),
            Err(Error::DiskError)
        ));
    }

    #[test]
    fn gather_list_pops_in_order_and_empties() {
        let mut a = [0u8; 2];
        let mut b = [0u8; 2];
        let mut slots = [
            Some(ReadDescriptor {
                start_sector: BlockIdx(0),
                start_byte: 0,
                bytes_to_read: 2,
                buffer: &mut a,
            }),
            Some(ReadDescriptor {
                start_sector: BlockIdx(1),
                start_byte: 0,
                bytes_to_read: 2,
                buffer: &mut b,
            }),
        ];
        let mut list = GatherList::new(&mut slots);
        assert!(!list.is_empty());
        let first = list.pop().unwrap();
        assert_eq!(first.start_sector, BlockIdx(0));
        let second = list.pop().unwrap();
        assert_eq!(second.start_sector, BlockIdx(1));
        assert!(list.pop().is_none());
        assert!(list.is_empty());
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
