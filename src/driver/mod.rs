//! SD/MMC-over-SPI block device driver.
//!
//! Implements command framing, card-type detection, initialization, block
//! read/write and the DMA gather-list fast path on top of a
//! [`crate::transport::Transport`].
//!
//! This is currently optimised for readability and debugability, not
//! performance.

pub mod dma;

use crate::blockdevice::{Block, BlockCount, BlockDevice, BlockIdx, IoctlRequest};
use crate::proto::{self, Csd, CsdV1, CsdV2};
use crate::transport::{Error as TransportError, Transport, INIT_CLOCK_HZ};
use crate::{debug, trace, warn};
use core::cell::RefCell;

/// A fast SPI clock rate used once the card has been initialized.
///
/// Concrete transports are free to reinterpret this (it's passed straight
/// through to [`Transport::set_clock_freq`]); 16 MHz is a conservative value
/// most SD cards in SPI mode tolerate.
pub const FULL_SPEED_CLOCK_HZ: u32 = 16_000_000;

bitflags::bitflags! {
    /// The type of card that was detected, as an orthogonal flag set.
    ///
    /// Modeled directly on the original driver's `CT_MMC`/`CT_SD1`/`CT_SD2`/
    /// `CT_BLOCK` bits rather than as a plain enum, since "block-addressed"
    /// is an orthogonal property of SDv2 cards, not a fourth alternative.
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    #[derive(Default)]
    pub struct CardType: u8 {
        /// Standard-capacity SD card, version 1.x.
        const SD1 = 0b0001;
        /// SD card, version 2.x (may or may not be block-addressed).
        const SD2 = 0b0010;
        /// MMC version 3.
        const MMC = 0b0100;
        /// Card uses block addressing (sector numbers passed directly,
        /// rather than multiplied up into byte addresses).
        const BLOCK = 0b1000;
    }
}

bitflags::bitflags! {
    /// Disk status flags, mirroring the original driver's `STA_NOINIT` /
    /// `STA_PROTECT`.
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    #[derive(Default)]
    pub struct DiskStatus: u8 {
        /// The driver has not completed a successful `initialize` call.
        const NOT_INITIALIZED = 0b01;
        /// The card's write-protect tab is engaged.
        const WRITE_PROTECTED = 0b10;
    }
}

/// Options controlling card acquisition / initialization.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct AcquireOpts {
    /// Verify (on read) and generate (on write) real CRC16 data-block
    /// checksums. When `false`, a dummy CRC is sent on write and the
    /// received CRC is discarded unchecked on read, matching the original
    /// driver's behavior (it never issues `CRC_ON_OFF`).
    pub use_crc: bool,
    /// How many times the supervisor-level caller should retry a failed
    /// `initialize()` before giving up. Not enforced by the driver itself;
    /// exposed so supervisor code can read a single shared constant.
    pub acquire_retries: u32,
    /// Bound, in response-byte attempts, on waiting for an R1 response
    /// after a command is sent.
    pub command_response_attempts: u32,
    /// Bound, in milliseconds, on waiting for the card to release MISO to
    /// 0xFF (select / busy-release).
    pub busy_wait_ms: u32,
    /// Bound, in milliseconds, on waiting for a data start token.
    pub data_token_wait_ms: u32,
    /// Bound, in "ticks" (ACMD41/CMD1 polling iterations), on the
    /// leave-idle-state polling loop during initialization.
    pub init_poll_iterations: u32,
}

impl Default for AcquireOpts {
    fn default() -> Self {
        AcquireOpts {
            use_crc: true,
            acquire_retries: 5,
            command_response_attempts: 10,
            busy_wait_ms: 100,
            data_token_wait_ms: 100,
            init_poll_iterations: 10_000,
        }
    }
}

/// All the ways this driver can fail.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone)]
pub enum Error {
    /// Bad drive index, zero count, or otherwise malformed parameters.
    ParameterError,
    /// The driver has not completed initialization.
    NotReady,
    /// The card is write protected.
    WriteProtected,
    /// A bus-level fault: timeout, bad token, bad data-response, DMA error.
    DiskError,
}

impl From<TransportError> for Error {
    fn from(_: TransportError) -> Self {
        Error::DiskError
    }
}

/// SD/MMC SPI driver for a single card slot.
pub struct CardDriver<T: Transport> {
    inner: RefCell<Inner<T>>,
}

struct Inner<T: Transport> {
    transport: T,
    card_type: CardType,
    status: DiskStatus,
    options: AcquireOpts,
}

impl<T: Transport> CardDriver<T> {
    /// Build a driver around a transport. The card is not initialized yet;
    /// call [`CardDriver::initialize`] (or perform any I/O, which triggers
    /// it) before trusting [`CardDriver::card_type`].
    pub fn new(transport: T) -> Self {
        Self::with_options(transport, AcquireOpts::default())
    }

    /// Build a driver with non-default [`AcquireOpts`].
    pub fn with_options(transport: T, options: AcquireOpts) -> Self {
        CardDriver {
            inner: RefCell::new(Inner {
                transport,
                card_type: CardType::empty(),
                status: DiskStatus::NOT_INITIALIZED,
                options,
            }),
        }
    }

    /// The card type detected by the last successful [`CardDriver::initialize`].
    pub fn card_type(&self) -> CardType {
        self.inner.borrow().card_type
    }

    /// Current disk status flags.
    pub fn status(&self) -> DiskStatus {
        self.inner.borrow().status
    }

    /// Mark the driver as uninitialized, forcing a fresh `initialize()` on
    /// the next access. Used by the supervisor when it powers the card back
    /// up.
    pub fn deinitialize(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.status.insert(DiskStatus::NOT_INITIALIZED);
        inner.card_type = CardType::empty();
    }

    /// Run the SD/MMC SPI initialization sequence (§4.2).
    pub fn initialize(&self) -> Result<DiskStatus, Error> {
        self.inner.borrow_mut().initialize()
    }

    /// Read `blocks.len()` consecutive sectors starting at `start`.
    pub fn read_sectors(&self, blocks: &mut [Block], start: BlockIdx) -> Result<(), Error> {
        self.inner.borrow_mut().read(blocks, start)
    }

    /// Write `blocks.len()` consecutive sectors starting at `start`.
    pub fn write_sectors(&self, blocks: &[Block], start: BlockIdx) -> Result<(), Error> {
        self.inner.borrow_mut().write(blocks, start)
    }

    /// Read a gather list's worth of arbitrary byte ranges via the DMA fast
    /// path (§4.5).
    pub fn read_list(&self, list: &mut dma::GatherList<'_, '_>) -> Result<(), Error> {
        self.inner.borrow_mut().read_list(list)
    }

    /// Service an ioctl request (§6).
    pub fn ioctl(&self, request: IoctlRequest, buffer: &mut [u8]) -> Result<(), Error> {
        self.inner.borrow_mut().ioctl(request, buffer)
    }
}

impl<T: Transport> BlockDevice for CardDriver<T> {
    type Error = Error;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.read_sectors(blocks, start_block_idx)
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.write_sectors(blocks, start_block_idx)
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        let mut inner = self.inner.borrow_mut();
        inner.check_ready()?;
        inner.num_blocks()
    }
}

impl<T: Transport> Inner<T> {
    fn check_ready(&mut self) -> Result<(), Error> {
        if self.status.contains(DiskStatus::NOT_INITIALIZED) {
            self.initialize()?;
        }
        Ok(())
    }

    /// Deselect, then select: drive CS low and wait for the card to release
    /// MISO to 0xFF within `busy_wait_ms`.
    fn select(&mut self) -> Result<(), Error> {
        self.deselect()?;
        self.transport.select()?;
        if self.wait_ready()? != 0xFF {
            self.deselect()?;
            return Err(Error::DiskError);
        }
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), Error> {
        self.transport.deselect()?;
        self.transport.exchange(0xFF)?;
        Ok(())
    }

    fn wait_ready(&mut self) -> Result<u8, Error> {
        self.transport.exchange(0xFF)?;
        let budget = self.options.busy_wait_ms;
        let mut waited = 0u32;
        let mut res;
        loop {
            res = self.transport.exchange(0xFF)?;
            if res == 0xFF || waited >= budget {
                break;
            }
            self.transport.delay_us(1000);
            waited += 1;
        }
        Ok(res)
    }

    /// Send a command, selecting the card first. Per §4.1: a command is 6
    /// bytes (start + `0x40|cmd`, 4-byte big-endian argument, CRC|1); CRC is
    /// precomputed only for CMD0 and CMD8, all other commands send `0x01`.
    fn send_cmd(&mut self, cmd: u8, arg: u32) -> Result<u8, Error> {
        self.select()?;

        let crc = match cmd {
            proto::CMD0 => 0x95,
            proto::CMD8 => 0x87,
            _ => 0x01,
        };
        let frame = [
            0x40 | cmd,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            crc,
        ];
        self.transport.write_bytes(&frame)?;

        if cmd == proto::CMD12 {
            self.transport.exchange(0xFF)?;
        }

        for _ in 0..self.options.command_response_attempts {
            let res = self.transport.exchange(0xFF)?;
            if (res & 0x80) == proto::ERROR_OK {
                return Ok(res);
            }
        }
        Err(Error::DiskError)
    }

    /// Send APP_CMD (CMD55) then the given command, per §4.1.
    fn send_acmd(&mut self, cmd: u8, arg: u32) -> Result<u8, Error> {
        let r1 = self.send_cmd(proto::CMD55, 0)?;
        if r1 > 1 {
            return Ok(r1);
        }
        self.send_cmd(cmd, arg)
    }

    fn initialize(&mut self) -> Result<DiskStatus, Error> {
        self.status.insert(DiskStatus::NOT_INITIALIZED);
        self.card_type = CardType::empty();
        self.transport.set_clock_freq(INIT_CLOCK_HZ);

        self.transport.deselect().map_err(|_| Error::DiskError)?;
        for _ in 0..10 {
            self.transport.exchange(0xFF)?;
        }

        let result = self.run_init_sequence();
        self.deselect()?;

        match result {
            Ok(card_type) => {
                self.card_type = card_type;
                self.status.remove(DiskStatus::NOT_INITIALIZED);
                self.transport.set_clock_freq(FULL_SPEED_CLOCK_HZ);
                debug!("card initialized, type={:?}", self.card_type);
                Ok(self.status)
            }
            Err(e) => {
                warn!("card init failed");
                Err(e)
            }
        }
    }

    fn run_init_sequence(&mut self) -> Result<CardType, Error> {
        if self.send_cmd(proto::CMD0, 0)? != proto::R1_IDLE_STATE {
            return Err(Error::DiskError);
        }

        let mut ty = CardType::empty();
        if self.send_cmd(proto::CMD8, 0x1AA)? == proto::R1_IDLE_STATE {
            let mut ocr = [0u8; 4];
            self.transport.read_bytes(&mut ocr)?;
            if ocr[2] == 0x01 && ocr[3] == 0xAA {
                let mut iters = self.options.init_poll_iterations;
                loop {
                    if self.send_acmd(proto::ACMD41, 0x4000_0000)? == proto::R1_READY_STATE
                    {
                        break;
                    }
                    if iters == 0 {
                        return Err(Error::DiskError);
                    }
                    iters -= 1;
                    self.transport.delay_us(100);
                }
                if self.send_cmd(proto::CMD58, 0)? == proto::R1_READY_STATE {
                    let mut ocr2 = [0u8; 4];
                    self.transport.read_bytes(&mut ocr2)?;
                    ty = if (ocr2[0] & 0x40) != 0 {
                        CardType::SD2 | CardType::BLOCK
                    } else {
                        CardType::SD2
                    };
                }
            }
        } else {
            let (probe_cmd, detected) = if self.send_acmd(proto::ACMD41, 0)? <= 1 {
                (proto::ACMD41, CardType::SD1)
            } else {
                (proto::CMD1, CardType::MMC)
            };

            let mut iters = self.options.init_poll_iterations;
            loop {
                let r1 = if detected == CardType::MMC {
                    self.send_cmd(probe_cmd, 0)?
                } else {
                    self.send_acmd(probe_cmd, 0)?
                };
                if r1 == proto::R1_READY_STATE {
                    break;
                }
                if iters == 0 {
                    return Err(Error::DiskError);
                }
                iters -= 1;
                self.transport.delay_us(100);
            }

            if self.send_cmd(proto::CMD16, 512)? != proto::R1_READY_STATE {
                return Err(Error::DiskError);
            }
            ty = detected;
        }

        if ty.is_empty() {
            return Err(Error::DiskError);
        }
        Ok(ty)
    }

    fn sector_address(&self, idx: BlockIdx) -> u32 {
        if self.card_type.contains(CardType::BLOCK) {
            idx.0
        } else {
            idx.0 * Block::LEN_U32
        }
    }

    fn read(&mut self, blocks: &mut [Block], start: BlockIdx) -> Result<(), Error> {
        self.check_ready()?;
        if blocks.is_empty() {
            return Err(Error::ParameterError);
        }
        let addr = self.sector_address(start);

        let result = if blocks.len() == 1 {
            (|| {
                self.send_cmd(proto::CMD17, addr)?;
                self.read_data_block(&mut blocks[0].contents)
            })()
        } else {
            (|| {
                self.send_cmd(proto::CMD18, addr)?;
                for block in blocks.iter_mut() {
                    self.read_data_block(&mut block.contents)?;
                }
                self.send_cmd(proto::CMD12, 0)?;
                Ok(())
            })()
        };
        self.deselect()?;
        result
    }

    fn write(&mut self, blocks: &[Block], start: BlockIdx) -> Result<(), Error> {
        self.check_ready()?;
        if self.status.contains(DiskStatus::WRITE_PROTECTED) {
            return Err(Error::WriteProtected);
        }
        if blocks.is_empty() {
            return Err(Error::ParameterError);
        }
        let addr = self.sector_address(start);

        let result = if blocks.len() == 1 {
            (|| {
                self.send_cmd(proto::CMD24, addr)?;
                self.write_data_block(proto::DATA_START_BLOCK, &blocks[0].contents)
            })()
        } else {
            (|| {
                if self.card_type.intersects(CardType::SD1 | CardType::SD2) {
                    self.send_acmd(proto::ACMD23, blocks.len() as u32)?;
                }
                self.send_cmd(proto::CMD25, addr)?;
                for block in blocks {
                    self.write_data_block(proto::WRITE_MULTIPLE_TOKEN, &block.contents)?;
                }
                self.write_stop_tran()
            })()
        };
        self.deselect()?;
        result
    }

    fn read_data_block(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        let token = self.wait_for_token(self.options.data_token_wait_ms)?;
        if token != proto::DATA_START_BLOCK {
            return Err(Error::DiskError);
        }
        self.transport.read_bytes(buffer)?;
        let mut crc_bytes = [0u8; 2];
        self.transport.read_bytes(&mut crc_bytes)?;
        if self.options.use_crc {
            let crc = (u16::from(crc_bytes[0]) << 8) | u16::from(crc_bytes[1]);
            if crc != proto::crc16(buffer) {
                return Err(Error::DiskError);
            }
        }
        Ok(())
    }

    fn write_data_block(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        self.wait_ready()?;
        self.transport.exchange(token)?;
        self.transport.write_bytes(buffer)?;
        if self.options.use_crc {
            let crc = proto::crc16(buffer);
            self.transport.exchange((crc >> 8) as u8)?;
            self.transport.exchange(crc as u8)?;
        } else {
            self.transport.exchange(0xFF)?;
            self.transport.exchange(0xFF)?;
        }
        let status = self.transport.exchange(0xFF)?;
        if (status & proto::DATA_RES_MASK) != proto::DATA_RES_ACCEPTED {
            return Err(Error::DiskError);
        }
        Ok(())
    }

    fn write_stop_tran(&mut self) -> Result<(), Error> {
        self.wait_ready()?;
        self.transport.exchange(proto::STOP_TRAN_TOKEN)?;
        Ok(())
    }

    fn wait_for_token(&mut self, timeout_ms: u32) -> Result<u8, Error> {
        let mut waited = 0u32;
        loop {
            let token = self.transport.exchange(0xFF)?;
            if token != 0xFF {
                return Ok(token);
            }
            if waited >= timeout_ms {
                return Err(Error::DiskError);
            }
            self.transport.delay_us(1000);
            waited += 1;
        }
    }

    fn read_list(&mut self, list: &mut dma::GatherList<'_, '_>) -> Result<(), Error> {
        self.check_ready()?;
        self.transport.lock();
        self.transport.set_dma_enabled(true);
        let result = dma::run_gather_list(self, list);
        self.transport.set_dma_enabled(false);
        self.transport.unlock();
        self.deselect().ok();
        result
    }

    fn read_csd(&mut self) -> Result<Csd, Error> {
        self.send_cmd(proto::CMD9, 0)?;
        let mut data = [0u8; 16];
        self.read_data_block(&mut data)?;
        if (data[0] >> 6) == 1 {
            Ok(Csd::V2(CsdV2 { data }))
        } else {
            Ok(Csd::V1(CsdV1 { data }))
        }
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Error> {
        let result = self.read_csd().map(|csd| match csd {
            Csd::V1(csd) => BlockCount(csd.card_capacity_blocks()),
            Csd::V2(csd) => BlockCount(csd.card_capacity_blocks()),
        });
        self.deselect()?;
        result
    }

    fn ioctl(&mut self, request: IoctlRequest, buffer: &mut [u8]) -> Result<(), Error> {
        self.check_ready()?;
        let result = self.ioctl_inner(request, buffer);
        self.deselect()?;
        result
    }

    fn ioctl_inner(&mut self, request: IoctlRequest, buffer: &mut [u8]) -> Result<(), Error> {
        match request {
            IoctlRequest::Sync => {
                self.select()?;
                Ok(())
            }
            IoctlRequest::GetSectorCount => {
                let count = self.num_blocks()?;
                buffer[0..4].copy_from_slice(&count.0.to_le_bytes());
                Ok(())
            }
            IoctlRequest::GetSectorSize => {
                buffer[0..2].copy_from_slice(&(Block::LEN as u16).to_le_bytes());
                Ok(())
            }
            IoctlRequest::GetBlockSize => {
                let sectors = self.erase_block_size_sectors()?;
                buffer[0..4].copy_from_slice(&sectors.to_le_bytes());
                Ok(())
            }
            IoctlRequest::GetCardType => {
                buffer[0] = self.card_type.bits();
                Ok(())
            }
            IoctlRequest::GetCsd => {
                self.send_cmd(proto::CMD9, 0)?;
                self.read_data_block(buffer)
            }
            IoctlRequest::GetCid => {
                self.send_cmd(proto::CMD10, 0)?;
                self.read_data_block(buffer)
            }
            IoctlRequest::GetOcr => {
                if self.send_cmd(proto::CMD58, 0)? != proto::R1_READY_STATE {
                    return Err(Error::DiskError);
                }
                self.transport.read_bytes(buffer)
            }
            IoctlRequest::GetSdStatus => {
                if self.send_acmd(proto::ACMD13, 0)? != proto::R1_READY_STATE {
                    return Err(Error::DiskError);
                }
                self.transport.exchange(0xFF)?;
                self.read_data_block(buffer)
            }
        }
        .map_err(Error::from)
    }

    /// Get block size in sectors: SDv2 cards via `ACMD13` (SD status), SDv1
    /// and MMCv3 via the CSD's erase-sector fields. The distilled spec only
    /// says "derived from CSD or SD-status"; the original implements both
    /// branches, which this mirrors (see `SPEC_FULL.md` §3).
    fn erase_block_size_sectors(&mut self) -> Result<u32, Error> {
        if self.card_type.contains(CardType::SD2) {
            if self.send_acmd(proto::ACMD13, 0)? != proto::R1_READY_STATE {
                return Err(Error::DiskError);
            }
            self.transport.exchange(0xFF)?;
            let mut sd_status = [0u8; 64];
            self.read_data_block(&mut sd_status)?;
            Ok(16u32 << (sd_status[10] >> 4))
        } else {
            match self.read_csd()? {
                Csd::V1(csd) => Ok(csd.erase_block_size_sectors()),
                Csd::V2(csd) => Ok(csd.erase_block_size_sectors()),
            }
        }
    }
}

impl<T: Transport> dma::DriverBus for Inner<T> {
    fn exchange(&mut self, byte: u8) -> Result<u8, Error> {
        Ok(self.transport.exchange(byte)?)
    }

    fn dma_burst(&mut self, buffer: &mut [u8], ceiling_ms: u32) -> Result<(), Error> {
        Ok(self.transport.dma_burst(buffer, ceiling_ms)?)
    }

    fn send_cmd(&mut self, cmd: u8, arg: u32) -> Result<u8, Error> {
        Inner::send_cmd(self, cmd, arg)
    }

    fn wait_for_token(&mut self, timeout_ms: u32) -> Result<u8, Error> {
        Inner::wait_for_token(self, timeout_ms)
    }

    fn sector_address(&self, idx: BlockIdx) -> u32 {
        Inner::sector_address(self, idx)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct FakeTransport {
        script: std::collections::VecDeque<u8>,
        written: std::vec::Vec<u8>,
    }

    impl Transport for FakeTransport {
        fn exchange(&mut self, out: u8) -> Result<u8, TransportError> {
            self.written.push(out);
            Ok(self.script.pop_front().unwrap_or(0xFF))
        }

        fn dma_burst(&mut self, buffer: &mut [u8], ceiling_ms: u32) -> Result<(), TransportError> {
            let _ = ceiling_ms;
            for b in buffer.iter_mut() {
                *b = self.script.pop_front().unwrap_or(0xFF);
            }
            Ok(())
        }

        fn select(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn deselect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn set_clock_freq(&mut self, _hz: u32) {}
        fn set_dma_enabled(&mut self, _enabled: bool) {}
        fn lock(&mut self) {}
        fn unlock(&mut self) {}
        fn delay_us(&mut self, _us: u32) {}
    }

    #[test]
    fn card_type_flags_compose() {
        let ty = CardType::SD2 | CardType::BLOCK;
        assert!(ty.contains(CardType::SD2));
        assert!(ty.contains(CardType::BLOCK));
        assert!(!ty.contains(CardType::MMC));
    }

    #[test]
    fn sector_address_scales_for_non_block_cards() {
        let transport = FakeTransport {
            script: std::collections::VecDeque::new(),
            written: std::vec::Vec::new(),
        };
        let mut inner = Inner {
            transport,
            card_type: CardType::SD1,
            status: DiskStatus::empty(),
            options: AcquireOpts::default(),
        };
        assert_eq!(inner.sector_address(BlockIdx(3)), 3 * 512);
        inner.card_type = CardType::SD2 | CardType::BLOCK;
        assert_eq!(inner.sector_address(BlockIdx(3)), 3);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
