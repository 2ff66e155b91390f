// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! An embedded-hal driver for an SDCard over SPI.
//!
//! The driver exposes the card as a block device: a fixed 512 byte block
//! size, a block count read from the card's CSD register, and single
//! block read and write operations for a filesystem layer to build on.
//! The [`embedded_storage`] traits are implemented on top of the block
//! operations for callers that want a byte addressed view.
//!
//! A freshly constructed [`SDCard`] owns the SPI periferal and chip
//! select pin but has not talked to the card yet; [`SDCard::init`] runs
//! the SPI mode initilization sequence and fixes the card's addressing
//! mode and size. Block operations before a successfull `init` fail with
//! [`Error::NotInitialized`].

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(missing_docs, warnings)]

mod cmds;
mod common;
mod csd;
mod initilization;
mod resp;
mod transactions;

#[cfg(test)]
mod testutils;

use embedded_hal::{
    blocking::{
        delay::DelayMs,
        spi::{Transfer, Write},
    },
    digital::v2::OutputPin,
};
use embedded_storage::{ReadStorage, Storage};
use snafu::prelude::*;

use common::CardState;
use transactions::with_cs_low;

pub use common::{AddressingMode, Config, BLOCK_SIZE};
pub use initilization::Error as InitializationError;
pub use resp::ResponseError;
pub use transactions::Error as TransactionError;

/// An SD Card interface built from an SPI periferal and a Chip Select pin.
///
/// We need the Chip Select to be separate so we can write some bytes without
/// Chip Select asserted to put the card into SPI mode.
pub struct SDCard<SPI, CS> {
    spi: SPI,
    cs: CS,
    config: Config,
    state: Option<CardState>,
}

/// The error type for [`SDCard`] operations.
#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    /// A poll budget elapsed without the expected response or token from
    /// the card.
    ///
    /// For a write past its data response token this leaves the
    /// durability of the block unknown: the card may or may not have
    /// committed it.
    #[snafu(display("Timed out waiting for the card."))]
    Timeout,

    /// The card answered a command with an error flag set.
    #[snafu(display("The card reported a protocol error."))]
    Protocol {
        /// The error flag the card raised.
        source: ResponseError,
    },

    /// The card sent a data error token instead of a data block.
    #[snafu(display("The card reported a data error (code {code:#x})."))]
    Data {
        /// The error code nibble from the token.
        code: u8,
    },

    /// The card rejected the data block of a write. Unlike [`Error::Timeout`]
    /// this is a clean failure: the block was not committed.
    #[snafu(display("The card rejected a written block (code {code:#x})."))]
    WriteRejected {
        /// The 5-bit status code from the data response token.
        code: u8,
    },

    /// The CRC16 trailer of a read did not match the data. Only surfaced
    /// when [`Config::verify_read_crc`] is enabled.
    #[snafu(display("CRC mismatch on a read block (card {card:#x}, host {host:#x})."))]
    ReadCrc {
        /// The CRC the card sent.
        card: u16,
        /// The CRC computed over the received data.
        host: u16,
    },

    /// The initilization sequence could not bring the card to its ready
    /// state. The handle stays unusable; a retry may need a power cycle.
    #[snafu(context(false), display("SD Card initilization failed."))]
    InitializationFailed {
        /// Where the sequence failed.
        source: InitializationError,
    },

    /// A block operation was attempted before a successfull
    /// [`SDCard::init`].
    #[snafu(display("The card has not been initialized."))]
    NotInitialized,

    /// [`SDCard::init`] was called on a handle that already reached its
    /// ready state. The card state is fixed for the life of a handle.
    #[snafu(display("The card is already initialized."))]
    AlreadyInitialized,

    /// A byte addressed storage write was not aligned to the 512 byte
    /// block size.
    #[snafu(display("Storage writes must be aligned to the 512 byte block size."))]
    UnalignedWrite,

    /// The SPI periferal or the chip select pin failed.
    #[snafu(display("The SPI bus or chip select failed."))]
    Bus,
}

impl From<transactions::Error> for Error {
    fn from(error: transactions::Error) -> Self {
        use transactions::Error as T;

        match error {
            T::ChipSelect | T::SpiWrite | T::SpiTransfer => Error::Bus,
            T::WaitForCardTimeout
            | T::WaitForResponseTimeout
            | T::DataTokenTimeout
            | T::WriteBusyTimeout => Error::Timeout,
            T::CommandResponse { source } => Error::Protocol { source },
            T::DataError { code } => Error::Data { code },
            T::WriteRejected { code } => Error::WriteRejected { code },
            T::CrcMismatch { card, host } => Error::ReadCrc { card, host },
        }
    }
}

impl<SPI, CS> SDCard<SPI, CS> {
    /// Create a new [`SDCard`] using the given `SPI` interface and chip
    /// select, with the default [`Config`].
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self::with_config(spi, cs, Config::default())
    }

    /// Create a new [`SDCard`] with explicit poll budgets and protocol
    /// options.
    pub fn with_config(spi: SPI, cs: CS, config: Config) -> Self {
        Self {
            spi,
            cs,
            config,
            state: None,
        }
    }

    /// The block size of the card. Always 512: the driver pins the block
    /// length during initilization.
    pub fn block_size(&self) -> u32 {
        BLOCK_SIZE as u32
    }

    /// The number of blocks the card reported in its CSD register.
    pub fn block_count(&self) -> Result<u32, Error> {
        Ok(self.card_state()?.blocks)
    }

    /// The addressing mode fixed during initilization.
    pub fn addressing_mode(&self) -> Result<AddressingMode, Error> {
        Ok(self.card_state()?.addressing)
    }

    /// Release the SPI periferal and chip select pin.
    pub fn free(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    fn card_state(&self) -> Result<&CardState, Error> {
        self.state.as_ref().ok_or(Error::NotInitialized)
    }
}

impl<SPI, CS> SDCard<SPI, CS>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    /// Run the card's power up and initilization sequence.
    ///
    /// This fixes the addressing mode and block count for the life of
    /// the handle. A failed initilization leaves the handle unusable for
    /// block operations but `init` may be retried; a handle that already
    /// initilized successfully cannot be initilized again.
    pub fn init(&mut self, delay: &mut impl DelayMs<u8>) -> Result<(), Error> {
        ensure!(self.state.is_none(), AlreadyInitializedSnafu);

        let state = initilization::initialize(&mut self.spi, &mut self.cs, delay, &self.config)?;
        self.state = Some(state);

        Ok(())
    }

    /// Read the block `block` into `buffer`.
    ///
    /// Chip select stays asserted for the whole command and data
    /// exchange and is released before returning.
    pub fn read_block(&mut self, block: u32, buffer: &mut [u8; BLOCK_SIZE]) -> Result<(), Error> {
        let address = self.card_state()?.addressing.block_address(block);
        let config = self.config;

        with_cs_low(&mut self.cs, &mut self.spi, |spi| {
            let mut frame = [0; 6];
            cmds::read_single_block(address, &mut frame);
            transactions::execute_data_command(spi, &frame, &config)?;
            transactions::read_data(spi, buffer, &config)
        })?;

        Ok(())
    }

    /// Write `data` to the block `block`.
    ///
    /// The call returns once the card has accepted the block and left
    /// its internal programming state. An [`Error::Timeout`] after
    /// acceptance means the durability of the block is unknown.
    pub fn write_block(&mut self, block: u32, data: &[u8; BLOCK_SIZE]) -> Result<(), Error> {
        let address = self.card_state()?.addressing.block_address(block);
        let config = self.config;

        with_cs_low(&mut self.cs, &mut self.spi, |spi| {
            let mut frame = [0; 6];
            cmds::write_block(address, &mut frame);
            transactions::execute_data_command(spi, &frame, &config)?;
            transactions::write_data(spi, data, &config)
        })?;

        Ok(())
    }

    /// Take an exclusive window on the bus for a sequence of block
    /// operations.
    ///
    /// While the returned [`BusLock`] is alive the borrow checker keeps
    /// every other user of this handle (and so of the SPI periferal and
    /// chip select it owns) off the bus, so no other transaction can be
    /// interleaved into the window. Dropping the lock releases the
    /// window.
    pub fn bus_lock(&mut self) -> BusLock<'_, SPI, CS> {
        BusLock { card: self }
    }
}

/// An exclusive window on the bus held by a caller.
///
/// Created with [`SDCard::bus_lock`]. The lock exposes the same block
/// operations as the handle; each still asserts chip select around its
/// whole exchange.
pub struct BusLock<'a, SPI, CS> {
    card: &'a mut SDCard<SPI, CS>,
}

impl<SPI, CS> BusLock<'_, SPI, CS>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    /// Read the block `block` into `buffer`.
    pub fn read_block(&mut self, block: u32, buffer: &mut [u8; BLOCK_SIZE]) -> Result<(), Error> {
        self.card.read_block(block, buffer)
    }

    /// Write `data` to the block `block`.
    pub fn write_block(&mut self, block: u32, data: &[u8; BLOCK_SIZE]) -> Result<(), Error> {
        self.card.write_block(block, data)
    }

    /// The number of blocks the card reported in its CSD register.
    pub fn block_count(&self) -> Result<u32, Error> {
        self.card.block_count()
    }

    /// Release the window.
    pub fn release(self) {}
}

impl<SPI, CS> ReadStorage for SDCard<SPI, CS>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    type Error = Error;

    fn read(&mut self, offset: u32, mut bytes: &mut [u8]) -> Result<(), Self::Error> {
        let mut block = offset / BLOCK_SIZE as u32;
        let mut start = (offset % BLOCK_SIZE as u32) as usize;
        let mut staging = [0; BLOCK_SIZE];

        while !bytes.is_empty() {
            self.read_block(block, &mut staging)?;

            let n = (BLOCK_SIZE - start).min(bytes.len());
            let (head, tail) = core::mem::take(&mut bytes).split_at_mut(n);
            head.copy_from_slice(&staging[start..start + n]);

            bytes = tail;
            start = 0;
            block += 1;
        }

        Ok(())
    }

    fn capacity(&self) -> usize {
        match &self.state {
            Some(state) => {
                let bytes = state.blocks as u64 * BLOCK_SIZE as u64;
                bytes.min(usize::MAX as u64) as usize
            }
            None => 0,
        }
    }
}

impl<SPI, CS> Storage for SDCard<SPI, CS>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        ensure!(
            offset as usize % BLOCK_SIZE == 0 && bytes.len() % BLOCK_SIZE == 0,
            UnalignedWriteSnafu
        );

        let mut block = offset / BLOCK_SIZE as u32;
        let mut staging = [0; BLOCK_SIZE];

        for chunk in bytes.chunks_exact(BLOCK_SIZE) {
            staging.copy_from_slice(chunk);
            self.write_block(block, &staging)?;
            block += 1;
        }

        Ok(())
    }
}
