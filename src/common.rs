// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Constants and types from the Simplified Specificiation that are used in
//! more than one module.

use crc::{Crc, CRC_16_XMODEM};

/// Voltage supplied or accepted nibble.
///
/// This is used as the voltage supplied value (VHS) for a SendIfCond command
/// and as the voltage accepted value when interpreting the R7 response that
/// is returned.
///
/// This is taken from Table 4-18 (for voltage supplied) or Table 4-41
///(for voltage accepted) in the Simplified Specificiation.
pub const VOLTAGE_2_7_TO_3_6: u8 = 0b0001;

/// The check pattern we use for a SendIfCond command and expect to be echoed
/// back in the R7 response.
///
/// This could be any value but this the one we picked.
pub const IF_COND_CHECK_PATTERN: u8 = 0b0101_0101;

/// The size of a data block in bytes.
///
/// SDHC and SDXC cards fix this value and we set it explicitly (with a
/// SendBlockLen command) on older cards, so every transfer in this crate
/// moves exactly this many bytes.
pub const BLOCK_SIZE: usize = 512;

/// The CRC16 for data blocks (CCITT polynomial 0x1021 with a zero initial
/// value, which the crc crate calls XMODEM).
pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// The card capacity classification from section 3.3.2.
///
/// Note that Ultra Capacity (SDUC) cards are not supported in SPI mode
/// (see section 7.1) so there is no entry for them here.
#[derive(Debug, PartialEq)]
pub enum CardCapacity {
    /// SDSC card
    Standard,

    /// SDHC or SDXC card
    HighOrExtended,
}

/// How the card interprets the 32-bit argument of a data command.
///
/// This is fixed exactly once during initilization and never changes for
/// the lifetime of a card handle. Standard capacity cards take a byte
/// offset on the wire while high capacity cards take a block number
/// (see section 7.2.3 of the Simplified Specification).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    /// The card expects a byte offset (SDSC and all version 1 cards).
    Byte,

    /// The card expects a block number (SDHC and SDXC).
    Block,
}

impl AddressingMode {
    /// Translate a logical block number into the wire argument for a
    /// ReadSingleBlock or WriteBlock command.
    pub fn block_address(self, block: u32) -> u32 {
        match self {
            AddressingMode::Byte => block * BLOCK_SIZE as u32,
            AddressingMode::Block => block,
        }
    }
}

/// The card state fixed by a successful initilization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardState {
    /// The addressing mode for data commands.
    pub addressing: AddressingMode,

    /// The number of 512 byte blocks the card reported in its CSD.
    pub blocks: u32,
}

/// Tunable poll budgets and protocol options.
///
/// Every poll loop in this crate is bounded by a byte count from this
/// struct rather than a wall clock so that the timeout paths can be
/// driven deterministically in tests. The defaults are sized for the
/// worst case latencies the Simplified Specification documents.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Attempts to get a GoIdleState command accepted during initilization.
    pub cmd0_retries: u32,

    /// Attempts of the SdSendOpCond polling loop during initilization.
    ///
    /// The attempts are spaced 50 ms apart so the default covers the
    /// roughly one second initilization window the card is allowed.
    pub acmd41_retries: u32,

    /// Bytes to clock while waiting for the card to release the bus
    /// before a command is sent.
    pub wait_for_card_budget: u32,

    /// Bytes to clock while waiting for the data start token of a read.
    pub read_token_budget: u32,

    /// Bytes to clock while waiting for the card to leave its internal
    /// programming state after a write was accepted.
    pub write_busy_budget: u32,

    /// Verify the CRC16 trailer of data blocks read from the card.
    ///
    /// Cards leave CRC checking disabled in SPI mode by default so this
    /// is off unless a caller explicitly asks for it.
    pub verify_read_crc: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cmd0_retries: 5,
            acmd41_retries: 20,
            wait_for_card_budget: 32_000,
            read_token_budget: 32_000,
            write_busy_budget: 64_000,
            verify_read_crc: false,
        }
    }
}
