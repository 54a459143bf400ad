//! SD/MMC SPI-mode command framing constants and register layouts.
//!
//! Based on `SdFat`, under the following terms:
//!
//! > Copyright (c) 2011-2018 Bill Greiman
//! > This file is part of the SdFat library for SD memory cards.
//! >
//! > MIT License
//! >
//! > Permission is hereby granted, free of charge, to any person obtaining a
//! > copy of this software and associated documentation files (the "Software"),
//! > to deal in the Software without restriction, including without limitation
//! > the rights to use, copy, modify, merge, publish, distribute, sublicense,
//! > and/or sell copies of the Software, and to permit persons to whom the
//! > Software is furnished to do so, subject to the following conditions:
//! >
//! > The above copyright notice and this permission notice shall be included
//! > in all copies or substantial portions of the Software.
//! >
//! > THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
//! > OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//! > FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//! > AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//! > LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
//! > FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
//! > DEALINGS IN THE SOFTWARE.

//==============================================================================

/// Card indicates last operation was a success
pub const ERROR_OK: u8 = 0x00;

//==============================================================================
// SD/MMC commands
//==============================================================================

/// GO_IDLE_STATE - reset the card into SPI mode
pub const CMD0: u8 = 0x00;
/// SEND_OP_COND - MMCv3 init polling command
pub const CMD1: u8 = 0x01;
/// SEND_IF_COND - verify SD Memory Card interface operating condition
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data register
pub const CMD9: u8 = 0x09;
/// SEND_CID - read the Card Identification register
pub const CMD10: u8 = 0x0A;
/// STOP_TRANSMISSION - end a multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// SEND_STATUS - read the card status register
pub const CMD13: u8 = 0x0D;
/// SET_BLOCKLEN - fix the block length for non-block-addressed cards
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read multiple data blocks from the card
pub const CMD18: u8 = 0x12;
/// SET_BLOCK_COUNT - hint the block count ahead of CMD25 (MMC)
pub const CMD23: u8 = 0x17;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until STOP_TRAN
pub const CMD25: u8 = 0x19;
/// APP_CMD - escape for an application-specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the Operating Condition Register
pub const CMD58: u8 = 0x3A;
/// CRC_ON_OFF - enable or disable CRC checking
pub const CMD59: u8 = 0x3B;
/// SD_STATUS (ACMD) - read the SD Status register
pub const ACMD13: u8 = 0x0D;
/// SET_WR_BLK_ERASE_COUNT (ACMD) - pre-erase hint ahead of CMD25 (SDC)
pub const ACMD23: u8 = 0x17;
/// SD_SEND_OP_COND (ACMD) - activate the card's init process
pub const ACMD41: u8 = 0x29;

//==============================================================================
// R1 status bits and data tokens
//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;
/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;
/// status bit for illegal command
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;

/// start data token for a read, or for a single-block write
pub const DATA_START_BLOCK: u8 = 0xFE;
/// stop token for a multi-block write
pub const STOP_TRAN_TOKEN: u8 = 0xFD;
/// start data token for a multi-block write
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;
/// mask for the data-response token after a write block
pub const DATA_RES_MASK: u8 = 0x1F;
/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// Card Specific Data, version 1 (standard-capacity cards)
#[derive(Default)]
pub struct CsdV1 {
    /// The 16 raw bytes of the CSD register
    pub data: [u8; 16],
}

/// Card Specific Data, version 2 (high-capacity cards)
#[derive(Default)]
pub struct CsdV2 {
    /// The 16 raw bytes of the CSD register
    pub data: [u8; 16],
}

/// Card Specific Data
pub enum Csd {
    /// A version 1 CSD
    V1(CsdV1),
    /// A version 2 CSD
    V2(CsdV2),
}

impl CsdV1 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV1 {
        CsdV1::default()
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() - 7;
        (self.device_size() + 1) << multiplier
    }

    /// Erase block size, in sectors, per the CSD's erase-sector-size field.
    pub fn erase_block_size_sectors(&self) -> u32 {
        (self.erase_sector_size() as u32) + 1
    }
}

impl CsdV2 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV2 {
        CsdV2::default()
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        (self.device_size() + 1) * 1024
    }

    /// Erase block size, in sectors, per the CSD's erase-sector-size field.
    pub fn erase_block_size_sectors(&self) -> u32 {
        (self.erase_sector_size() as u32) + 1
    }
}

/// Perform the 7-bit CRC used to protect SD/MMC commands.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

/// Perform the X25 CRC calculation used on 512-byte data blocks.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc = ((crc >> 8) & 0xFF) | (crc << 8);
        crc ^= u16::from(byte);
        crc ^= (crc & 0xFF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0xFF) << 5;
    }
    crc
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_crc7() {
        const DATA: [u8; 15] = hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40");
        assert_eq!(crc7(&DATA), 0xA5);
    }

    #[test]
    fn test_crc16() {
        const DATA: [u8; 16] = hex!("00 26 00 32 5F 5A 83 AE FE FB CF FF 92 80 40 DF");
        assert_eq!(crc16(&DATA), 0x9fc5);
    }

    #[test]
    fn test_csdv1_capacity() {
        let csd = CsdV1 {
            data: hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5"),
        };
        assert_eq!(csd.csd_ver(), 0x00);
        assert_eq!(csd.card_capacity_bytes(), 1_015_808_000);
        assert_eq!(csd.card_capacity_blocks(), 1_984_000);
        assert!(csd.erase_single_block_enabled());
    }

    #[test]
    fn test_csdv2_capacity() {
        let csd = CsdV2 {
            data: hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B"),
        };
        assert_eq!(csd.csd_ver(), 0x01);
        assert_eq!(csd.card_capacity_bytes(), 3_947_888_640);
        assert_eq!(csd.card_capacity_blocks(), 7_710_720);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
