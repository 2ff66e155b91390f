// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Functions and types related to initilization of an SD Card over SPI
//!
//! The sequence follows section 7.2.1 of the Simplified Specification:
//! power-up framing with chip select high, GoIdleState to enter SPI mode,
//! SendIfCond to sort version 1 cards from version 2 cards, the
//! SdSendOpCond polling loop until the card leaves its idle state, and a
//! ReadOCR to fix the addressing mode of version 2 cards. We then read the
//! CSD to size the card and pin the block length at 512 bytes.

use embedded_hal::{
    blocking::{
        delay::DelayMs,
        spi::{Transfer, Write},
    },
    digital::v2::OutputPin,
};
use snafu::prelude::*;

use crate::{
    cmds::{self, HostCapacitySupport},
    common::{
        AddressingMode, CardCapacity, CardState, Config, BLOCK_SIZE, IF_COND_CHECK_PATTERN,
    },
    csd::Csd,
    resp::{R1Response, R3Response, R7Response, Response, ResponseError},
    transactions::{
        self, execute_app_command, execute_command, execute_data_command, with_cs_low,
    },
};

// Delay between SdSendOpCond polls. The specification gives the card about
// one second to finish initilizing.
const ACMD41_POLL_INTERVAL_MS: u8 = 50;

/// The ways initilization can leave a card unusable.
#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    /// Unable to set chip select state for SPI initilization.
    #[snafu(display("Unable to set chip select state for SPI initilization."))]
    ChipSelect,

    /// Unable to write to SPI for initilization.
    #[snafu(display("Unable to write to SPI for initilization."))]
    SpiWrite,

    /// A low level transaction failed during initilization.
    #[snafu(context(false))]
    Transaction {
        /// The underlying transaction error.
        source: transactions::Error,
    },

    /// The card did not enter the idle state within the retry budget.
    #[snafu(display("The card did not enter the idle state."))]
    NoIdleState,

    /// The card echoed an unexpected voltage or check pattern.
    #[snafu(display("The card failed the interface condition check."))]
    InterfaceCondition {
        /// The mismatch the R7 response reported.
        source: ResponseError,
    },

    /// An initilization command was answered with an error flag.
    #[snafu(display("The card rejected an initilization command."))]
    Response {
        /// The error flag the card raised.
        source: ResponseError,
    },

    /// The card did not leave the idle state within the initilization
    /// time budget.
    #[snafu(display("Timeout waiting for the card to finish initilizing."))]
    AppInitTimeout,

    /// The card reported a CSD structure this crate does not support.
    #[snafu(display("The card reported an unsupported CSD structure."))]
    UnsupportedCsd,
}

// The card generations that matter for the init flow. Version 1 cards
// reject SendIfCond and are always byte addressed; version 2 cards report
// their addressing mode in the OCR.
#[derive(Debug, Clone, Copy, PartialEq)]
enum CardVersion {
    V1,
    V2,
}

/// Power up sequence from section 6.4.1 of the Simplified Specification.
pub fn power_up_card(
    spi: &mut impl Write<u8>,
    cs: &mut impl OutputPin,
    delay: &mut impl DelayMs<u8>,
) -> Result<(), Error> {
    // 1. delay 1 ms then 74 clocks with CS high (6.4.1.1)

    delay.delay_ms(1);
    cs.set_high().map_err(|_| ChipSelectSnafu {}.build())?;

    // Note that 74 bits rounded up is 10 bytes
    spi.write(&[0xff; 10])
        .map_err(|_| SpiWriteSnafu {}.build())?;

    Ok(())
}

/// Drive the card from power up to its ready state and fix its
/// [`CardState`].
///
/// On an error the card is in an unknown state: a caller may retry the
/// whole sequence but the card may need a power cycle to truly reset.
pub fn initialize<SPI, CS, D>(
    spi: &mut SPI,
    cs: &mut CS,
    delay: &mut D,
    config: &Config,
) -> Result<CardState, Error>
where
    SPI: Write<u8> + Transfer<u8>,
    CS: OutputPin,
    D: DelayMs<u8>,
{
    power_up_card(spi, cs, delay)?;

    with_cs_low(cs, spi, |spi| initilization_flow(spi, delay, config))
}

fn initilization_flow<SPI, D>(
    spi: &mut SPI,
    delay: &mut D,
    config: &Config,
) -> Result<CardState, Error>
where
    SPI: Write<u8> + Transfer<u8>,
    D: DelayMs<u8>,
{
    let mut frame = [0; 6];

    // 2. GoIdleState until the card answers with the idle flag alone. A
    // card that has not locked on to the command framing yet may not
    // answer at all, so a response timeout here counts against the retry
    // budget instead of failing the sequence.
    let mut idle = false;
    for _ in 0..config.cmd0_retries {
        cmds::go_idle_state(&mut frame);
        match execute_command::<_, R1Response>(spi, &frame, config) {
            Ok(r1) if r1.is_idle_only() => {
                idle = true;
                break;
            }
            Ok(_) | Err(transactions::Error::WaitForResponseTimeout) => (),
            Err(e) => return Err(e.into()),
        }
    }
    ensure!(idle, NoIdleStateSnafu);

    // 3. SendIfCond sorts the card generations: version 1 cards reject it
    // as an illegal command, version 2 cards echo the voltage range and
    // check pattern.
    cmds::send_if_cond(IF_COND_CHECK_PATTERN, &mut frame);
    let r7: R7Response = execute_command(spi, &frame, config)?;
    let version = if r7.r1().is_illegal_command() {
        CardVersion::V1
    } else {
        r7.check(IF_COND_CHECK_PATTERN)
            .context(InterfaceConditionSnafu)?;
        CardVersion::V2
    };

    // 4. SdSendOpCond until the idle flag clears. The host capacity bit
    // is only meaningfull to version 2 cards.
    let hcs = match version {
        CardVersion::V1 => HostCapacitySupport::ScOnly,
        CardVersion::V2 => HostCapacitySupport::HcOrXcSupported,
    };
    let mut ready = false;
    for _ in 0..config.acmd41_retries {
        cmds::sd_send_op_cond(hcs, &mut frame);
        let r1: R1Response = execute_app_command(spi, &frame, config)?;
        if r1.is_ready() {
            ready = true;
            break;
        }

        delay.delay_ms(ACMD41_POLL_INTERVAL_MS);
    }
    ensure!(ready, AppInitTimeoutSnafu);

    // 5. For version 2 cards the capacity status bit of the OCR decides
    // the addressing mode; version 1 cards are always byte addressed.
    let addressing = match version {
        CardVersion::V1 => AddressingMode::Byte,
        CardVersion::V2 => {
            cmds::read_ocr(&mut frame);
            let r3: R3Response = execute_command(spi, &frame, config)?;
            r3.r1().check_error().context(ResponseSnafu)?;

            match r3.card_capacity() {
                CardCapacity::Standard => AddressingMode::Byte,
                CardCapacity::HighOrExtended => AddressingMode::Block,
            }
        }
    };

    // 6. Size the card from its CSD.
    cmds::send_csd(&mut frame);
    execute_data_command(spi, &frame, config)?;
    let mut csd_data = [0; 16];
    transactions::read_data(spi, &mut csd_data, config)?;
    let blocks = Csd::parse(&csd_data)
        .context(UnsupportedCsdSnafu)?
        .block_count();

    // 7. Pin the block length for byte addressed cards (high capacity
    // cards fix it at 512 already, for them this is a no-op).
    cmds::send_block_len(BLOCK_SIZE as u32, &mut frame);
    execute_data_command(spi, &frame, config)?;

    Ok(CardState { addressing, blocks })
}
