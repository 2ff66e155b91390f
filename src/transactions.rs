// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Functions and types related to transactions with an SD Card over SPI.
//!
//! The transactions include both those related to initilization and those
//! related to data transfer (after initilization). Everything here assumes
//! the caller has chip select asserted (through [`with_cs_low`]) for the
//! whole command and data exchange: a transaction interrupted part way
//! through leaves the card in an undefined state.

use embedded_hal::{
    blocking::spi::{Transfer, Write},
    digital::v2::OutputPin,
};
use snafu::prelude::*;

use crate::{
    cmds,
    common::{Config, CRC16},
    resp::{DataResponse, R1Response, Response, ResponseError},
};

const MAX_WAIT_FOR_RESPONSE: u32 = 8;

// Start of block token for single block reads and writes (section 7.3.3.2
// of the Simplified Specification).
const DATA_START_TOKEN: u8 = 0xfe;

// A data error token has the high nibble clear and the error code in the
// low nibble (section 7.3.3.3).
const DATA_ERROR_MASK: u8 = 0xf0;

/// The low level transaction errors.
#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    /// Unable to set chip select state for SPI.
    #[snafu(display("Unable to set chip select state for SPI."))]
    ChipSelect,

    /// Unable to write to SPI.
    #[snafu(display("Unable to write to SPI."))]
    SpiWrite,

    /// Unable to transfer to and from SPI.
    #[snafu(display("Unable to transfer to and from SPI."))]
    SpiTransfer,

    /// Timeout waiting for the card to be ready.
    #[snafu(display("Timeout waiting for the card to be ready."))]
    WaitForCardTimeout,

    /// Timeout waiting for the card to respond to a command.
    #[snafu(display("Timeout waiting for the card to respond to a command."))]
    WaitForResponseTimeout,

    /// Timeout waiting for the data start token of a read.
    #[snafu(display("Timeout waiting for the start of a data block."))]
    DataTokenTimeout,

    /// Timeout waiting for a write to leave the card's busy state. The
    /// durability of the written block is unknown.
    #[snafu(display("Timeout waiting for the card to finish programming a block."))]
    WriteBusyTimeout,

    /// The response to a command indicated an error.
    #[snafu(display("The response to a command indicated an error."))]
    CommandResponse {
        /// The error flag the card raised.
        source: ResponseError,
    },

    /// The card sent a data error token instead of a data block.
    #[snafu(display("The card reported a data error (code {code:#x})."))]
    DataError {
        /// The error code nibble from the token.
        code: u8,
    },

    /// The card rejected the data block of a write.
    #[snafu(display("The card rejected a written block (code {code:#x})."))]
    WriteRejected {
        /// The 5-bit status code from the data response token.
        code: u8,
    },

    /// The CRC16 trailer of a read did not match the data.
    #[snafu(display("CRC mismatch on a read block (card {card:#x}, host {host:#x})."))]
    CrcMismatch {
        /// The CRC the card sent.
        card: u16,
        /// The CRC computed over the received data.
        host: u16,
    },
}

/// Run `f` with chip select asserted, deasserting it again on the way out
/// whether or not `f` succeeded.
///
/// After chip select is released an extra fill byte is clocked so the card
/// releases the data line (the original power-on sequence does the same
/// with its trailing clocks).
pub fn with_cs_low<CS, SPI, F, O, E>(cs: &mut CS, spi: &mut SPI, f: F) -> Result<O, E>
where
    CS: OutputPin,
    SPI: Write<u8>,
    F: FnOnce(&mut SPI) -> Result<O, E>,
    E: From<Error>,
{
    cs.set_low().map_err(|_| E::from(Error::ChipSelect))?;

    let result = f(spi);

    match cs.set_high() {
        // ignore a late chip select error to give priority to the error from f(spi)
        Err(_) if result.is_ok() => return Err(E::from(Error::ChipSelect)),
        _ => (),
    }

    let fill = spi.write(&[0xff]);
    if result.is_ok() {
        fill.map_err(|_| E::from(Error::SpiWrite))?;
    }

    result
}

/// Send a 6-byte command frame and read back its response.
///
/// The R1 byte is not checked for error flags here: initilization needs to
/// see the idle and illegal-command flags without failing. Data commands
/// should go through [`execute_data_command`] instead.
pub fn execute_command<SPI, R>(spi: &mut SPI, cmd: &[u8], config: &Config) -> Result<R, Error>
where
    SPI: Write<u8> + Transfer<u8>,
    R: Response,
{
    debug_assert_eq!(cmd.len(), 6);

    wait_for_card(spi, config.wait_for_card_budget)?;

    spi.write(cmd).map_err(|_| SpiWriteSnafu {}.build())?;

    read_response(spi)
}

/// Send an AppCmd escape followed by the given app command frame.
pub fn execute_app_command<SPI, R>(spi: &mut SPI, cmd: &[u8], config: &Config) -> Result<R, Error>
where
    SPI: Write<u8> + Transfer<u8>,
    R: Response,
{
    let mut escape = [0; 6];
    cmds::app_cmd(&mut escape);

    // The R1 flags of the escape itself are uninteresting (the card keeps
    // its idle flag set during initilization); only a missing response is
    // an error.
    let _: R1Response = execute_command(spi, &escape, config)?;

    execute_command(spi, cmd, config)
}

/// Send a command frame that must be answered with a clean, ready R1.
pub fn execute_data_command<SPI>(spi: &mut SPI, cmd: &[u8], config: &Config) -> Result<(), Error>
where
    SPI: Write<u8> + Transfer<u8>,
{
    let r1: R1Response = execute_command(spi, cmd, config)?;
    r1.check_error().context(CommandResponseSnafu)?;

    Ok(())
}

/// Receive a data block of `buffer.len()` bytes plus its CRC16 trailer.
///
/// The CRC16 is always clocked out of the card but only compared against
/// the data when the configuration asks for verification, matching the
/// card's SPI mode default of not checking CRCs itself.
pub fn read_data<SPI>(spi: &mut SPI, buffer: &mut [u8], config: &Config) -> Result<(), Error>
where
    SPI: Transfer<u8>,
{
    wait_for_data_token(spi, config.read_token_budget)?;

    for byte in buffer.iter_mut() {
        *byte = receive(spi)?;
    }

    let card_crc = ((receive(spi)? as u16) << 8) | receive(spi)? as u16;

    if config.verify_read_crc {
        let host_crc = CRC16.checksum(buffer);
        ensure!(
            card_crc == host_crc,
            CrcMismatchSnafu {
                card: card_crc,
                host: host_crc
            }
        );
    }

    Ok(())
}

/// Send a data block with its start token and CRC16 trailer, then wait out
/// the card's programming state.
///
/// The card answers the block with a data response token and then holds
/// the data line low until its internal write finishes. A timeout while
/// waiting for that busy state to clear means the durability of the block
/// is unknown.
pub fn write_data<SPI>(spi: &mut SPI, buffer: &[u8], config: &Config) -> Result<(), Error>
where
    SPI: Write<u8> + Transfer<u8>,
{
    let crc = CRC16.checksum(buffer);

    spi.write(&[DATA_START_TOKEN])
        .map_err(|_| SpiWriteSnafu {}.build())?;
    spi.write(buffer).map_err(|_| SpiWriteSnafu {}.build())?;
    spi.write(&crc.to_be_bytes())
        .map_err(|_| SpiWriteSnafu {}.build())?;

    let response = data_response(spi)?;
    ensure!(
        response.accepted(),
        WriteRejectedSnafu {
            code: response.code()
        }
    );

    for _ in 0..config.write_busy_budget {
        if receive(spi)? != 0x00 {
            return Ok(());
        }
    }

    WriteBusyTimeoutSnafu {}.fail()
}

/// Poll for the data start token, distinguishing busy fill bytes from an
/// explicit data error token.
pub fn wait_for_data_token<SPI: Transfer<u8>>(spi: &mut SPI, budget: u32) -> Result<(), Error> {
    for _ in 0..budget {
        let byte = receive(spi)?;

        if byte == DATA_START_TOKEN {
            return Ok(());
        }

        if byte != 0xff && byte & DATA_ERROR_MASK == 0 {
            return DataSnafu { code: byte & 0x0f }.fail();
        }
    }

    DataTokenTimeoutSnafu {}.fail()
}

/// Poll until the card releases the data line (0xff fill) so a new command
/// can be sent.
pub fn wait_for_card<SPI: Transfer<u8>>(spi: &mut SPI, budget: u32) -> Result<(), Error> {
    for _ in 0..budget {
        if receive(spi)? == 0xff {
            return Ok(());
        }
    }

    WaitForCardTimeoutSnafu {}.fail()
}

fn read_response<SPI, R>(spi: &mut SPI) -> Result<R, Error>
where
    SPI: Transfer<u8>,
    R: Response,
{
    for _ in 0..MAX_WAIT_FOR_RESPONSE {
        let recv = receive(spi)?;
        if recv & 0x80 == 0 {
            let r1 = R1Response::new(recv);
            let mut extra = R::ExtraBytes::default();

            // A truncating R1 means the card will not send the rest of
            // the response (section 7.3.2 of the Simplified Specification).
            if !r1.response_truncated() {
                for byte in extra.as_mut() {
                    *byte = receive(spi)?;
                }
            }

            return Ok(R::create(r1, &extra));
        }
    }

    WaitForResponseTimeoutSnafu {}.fail()
}

fn data_response<SPI: Transfer<u8>>(spi: &mut SPI) -> Result<DataResponse, Error> {
    for _ in 0..MAX_WAIT_FOR_RESPONSE {
        let recv = receive(spi)?;
        if recv != 0xff {
            return Ok(DataResponse::new(recv));
        }
    }

    WaitForResponseTimeoutSnafu {}.fail()
}

fn receive<SPI: Transfer<u8>>(spi: &mut SPI) -> Result<u8, Error> {
    let mut buffer = [0xff];
    let response = spi
        .transfer(&mut buffer)
        .map_err(|_| SpiTransferSnafu {}.build())?;

    Ok(response[0])
}
