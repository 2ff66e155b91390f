// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Utilities to support tests.
//!
//! [`FakeCard`] is a byte level simulation of an SD Card in SPI mode. It
//! implements the blocking SPI traits so the driver can be run against it
//! unmodified, and it exposes dials to force the protocol down its
//! failure paths (a card stuck in idle, data error tokens, rejected
//! writes, a card that never leaves its busy state).

use std::collections::{BTreeMap, VecDeque};

use embedded_hal::{
    blocking::spi::{Transfer, Write},
    digital::v2::OutputPin,
};

use crate::common::{self, BLOCK_SIZE};

#[derive(Debug)]
pub struct StubSpi;
#[derive(Debug)]
pub struct StubPin;
#[derive(Debug)]
pub struct StubError;

impl OutputPin for StubPin {
    type Error = StubError;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Write<u8> for StubSpi {
    type Error = StubError;

    fn write(&mut self, _words: &[u8]) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Transfer<u8> for StubSpi {
    type Error = StubError;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        Ok(words)
    }
}

/// The card generations the fake can act as.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FakeVariant {
    /// A version 1 card: rejects SendIfCond, byte addressed.
    V1,
    /// A version 2 standard capacity card: OCR capacity bit clear.
    V2Standard,
    /// A version 2 high capacity card: OCR capacity bit set.
    V2HighCapacity,
}

/// A simulated SD Card behind the blocking SPI traits.
///
/// The fake consumes command frames and data blocks through [`Write`] and
/// produces response and data bytes through [`Transfer`], exactly as the
/// driver clocks them. Bytes the fake has nothing to say for come back as
/// 0xff fill, like a released bus line.
#[derive(Debug)]
pub struct FakeCard {
    variant: FakeVariant,
    csd: [u8; 16],
    blocks: BTreeMap<u32, [u8; BLOCK_SIZE]>,

    /// CMD0 attempts to ignore before answering, as a card that has not
    /// locked on to the SPI framing yet.
    pub cmd0_silent_attempts: u32,

    /// SdSendOpCond polls to answer with the idle flag before reporting
    /// ready. `u32::MAX` keeps the card in idle forever.
    pub acmd41_attempts_until_ready: u32,

    /// Answer every read with this data error token code instead of a
    /// data block.
    pub fail_reads_with: Option<u8>,

    /// Never send a data token after a read command, only fill bytes.
    pub read_silence: bool,

    /// Answer every written block with this 5-bit data response code
    /// instead of accepting it.
    pub reject_writes_with: Option<u8>,

    /// Accept writes but never leave the busy state afterwards.
    pub endless_busy: bool,

    /// Corrupt the CRC16 trailer of data blocks sent to the host.
    pub corrupt_read_crc: bool,

    /// The command index and raw wire argument of the last data command
    /// (ReadSingleBlock or WriteBlock) the fake consumed.
    pub last_data_cmd: Option<(u8, u32)>,

    state: State,
    response: VecDeque<u8>,
    acmd41_polls: u32,
    acmd_next: bool,
    idle: bool,
    busy_forever: bool,
}

#[derive(Debug)]
enum State {
    AwaitCommand,
    Command { buf: [u8; 6], len: usize },
    AwaitWriteToken { arg: u32 },
    WriteData { arg: u32, buf: Vec<u8> },
}

impl FakeCard {
    /// A version 1 card with a 256 MB class CSD.
    pub fn v1() -> Self {
        Self::new(FakeVariant::V1, csd_v1(4095, 7, 9))
    }

    /// A version 2 standard capacity card with a 1 GB class (version 1
    /// structure) CSD.
    pub fn v2_standard() -> Self {
        Self::new(FakeVariant::V2Standard, csd_v1(4095, 7, 9))
    }

    /// A version 2 high capacity card with a 2 GB class CSD.
    pub fn v2_high_capacity() -> Self {
        Self::new(FakeVariant::V2HighCapacity, csd_v2(4095))
    }

    fn new(variant: FakeVariant, csd: [u8; 16]) -> Self {
        FakeCard {
            variant,
            csd,
            blocks: BTreeMap::new(),
            cmd0_silent_attempts: 0,
            acmd41_attempts_until_ready: 0,
            fail_reads_with: None,
            read_silence: false,
            reject_writes_with: None,
            endless_busy: false,
            corrupt_read_crc: false,
            last_data_cmd: None,
            state: State::AwaitCommand,
            response: VecDeque::new(),
            acmd41_polls: 0,
            acmd_next: false,
            idle: false,
            busy_forever: false,
        }
    }

    /// Pre-populate a block of the card's storage.
    pub fn seed_block(&mut self, block: u32, data: [u8; BLOCK_SIZE]) {
        self.blocks.insert(block, data);
    }

    /// The stored content of a block, if a write ever reached it.
    pub fn block(&self, block: u32) -> Option<&[u8; BLOCK_SIZE]> {
        self.blocks.get(&block)
    }

    fn input_byte(&mut self, byte: u8) {
        match &mut self.state {
            State::AwaitCommand => {
                if byte & 0xc0 == 0x40 {
                    let mut buf = [0; 6];
                    buf[0] = byte;
                    self.state = State::Command { buf, len: 1 };
                }
                // everything else is bus fill
            }
            State::Command { buf, len } => {
                buf[*len] = byte;
                *len += 1;
                if *len == 6 {
                    let frame = *buf;
                    self.state = State::AwaitCommand;
                    self.handle_command(frame);
                }
            }
            State::AwaitWriteToken { arg } => {
                if byte == 0xfe {
                    let arg = *arg;
                    self.state = State::WriteData {
                        arg,
                        buf: Vec::with_capacity(BLOCK_SIZE + 2),
                    };
                }
            }
            State::WriteData { arg, buf } => {
                buf.push(byte);
                if buf.len() == BLOCK_SIZE + 2 {
                    let arg = *arg;
                    let mut data = [0; BLOCK_SIZE];
                    data.copy_from_slice(&buf[..BLOCK_SIZE]);
                    self.state = State::AwaitCommand;
                    self.finish_write(arg, data);
                }
            }
        }
    }

    fn handle_command(&mut self, frame: [u8; 6]) {
        let index = frame[0] & 0x3f;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let acmd = self.acmd_next;
        self.acmd_next = false;

        // one fill byte of command response delay
        self.response.push_back(0xff);

        match (index, acmd) {
            (0, _) => {
                if self.cmd0_silent_attempts > 0 {
                    self.cmd0_silent_attempts -= 1;
                    self.response.pop_back();
                } else {
                    self.idle = true;
                    self.response.push_back(0x01);
                }
            }
            (8, _) => match self.variant {
                FakeVariant::V1 => {
                    // idle + illegal command, no payload follows
                    self.response.push_back(0x05);
                }
                _ => {
                    self.response.push_back(0x01);
                    self.response.push_back(0x00);
                    self.response.push_back(0x00);
                    self.response.push_back((arg >> 8) as u8 & 0x0f);
                    self.response.push_back(arg as u8);
                }
            },
            (55, _) => {
                self.acmd_next = true;
                self.response.push_back(self.r1());
            }
            (41, true) => {
                if self.acmd41_polls >= self.acmd41_attempts_until_ready {
                    self.idle = false;
                    self.response.push_back(0x00);
                } else {
                    self.acmd41_polls = self.acmd41_polls.saturating_add(1);
                    self.response.push_back(0x01);
                }
            }
            (58, _) => {
                let ocr0 = match self.variant {
                    FakeVariant::V2HighCapacity => 0xc0,
                    _ => 0x80,
                };
                self.response.push_back(self.r1());
                self.response.push_back(ocr0);
                self.response.push_back(0xff);
                self.response.push_back(0x80);
                self.response.push_back(0x00);
            }
            (9, _) => {
                self.response.push_back(self.r1());
                let csd = self.csd;
                self.push_data_block(&csd);
            }
            (16, _) => {
                self.response.push_back(self.r1());
            }
            (17, _) => {
                self.last_data_cmd = Some((17, arg));
                self.response.push_back(self.r1());

                if self.read_silence {
                    return;
                }
                if let Some(code) = self.fail_reads_with {
                    self.response.push_back(code & 0x0f);
                    return;
                }

                let block = self
                    .blocks
                    .get(&self.block_number(arg))
                    .copied()
                    .unwrap_or([0; BLOCK_SIZE]);
                self.push_data_block(&block);
            }
            (24, _) => {
                self.last_data_cmd = Some((24, arg));
                self.response.push_back(self.r1());
                self.state = State::AwaitWriteToken { arg };
            }
            _ => {
                // illegal command, idle flag preserved
                self.response.push_back(0x04 | self.r1());
            }
        }
    }

    fn finish_write(&mut self, arg: u32, data: [u8; BLOCK_SIZE]) {
        if let Some(code) = self.reject_writes_with {
            self.response.push_back(0xe0 | (code & 0x1f));
            return;
        }

        let block = self.block_number(arg);
        self.blocks.insert(block, data);
        self.response.push_back(0xe5);

        if self.endless_busy {
            self.busy_forever = true;
        } else {
            // one busy byte before the programming finishes
            self.response.push_back(0x00);
        }
    }

    fn push_data_block(&mut self, data: &[u8]) {
        self.response.push_back(0xfe);
        self.response.extend(data.iter().copied());

        let mut crc = common::CRC16.checksum(data);
        if self.corrupt_read_crc {
            crc = !crc;
        }
        self.response.push_back((crc >> 8) as u8);
        self.response.push_back(crc as u8);
    }

    fn block_number(&self, arg: u32) -> u32 {
        match self.variant {
            FakeVariant::V1 | FakeVariant::V2Standard => arg / BLOCK_SIZE as u32,
            FakeVariant::V2HighCapacity => arg,
        }
    }

    fn r1(&self) -> u8 {
        if self.idle {
            0x01
        } else {
            0x00
        }
    }

    fn output_byte(&mut self) -> u8 {
        if let Some(byte) = self.response.pop_front() {
            return byte;
        }

        if self.busy_forever {
            0x00
        } else {
            0xff
        }
    }
}

impl Write<u8> for FakeCard {
    type Error = StubError;

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        for byte in words {
            self.input_byte(*byte);
        }

        Ok(())
    }
}

impl Transfer<u8> for FakeCard {
    type Error = StubError;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        for word in words.iter_mut() {
            *word = self.output_byte();
        }

        Ok(words)
    }
}

fn csd_v1(c_size: u32, c_size_mult: u32, read_bl_len: u32) -> [u8; 16] {
    let mut raw: u128 = 0;
    raw |= (read_bl_len as u128) << 80;
    raw |= (c_size as u128) << 62;
    raw |= (c_size_mult as u128) << 47;
    raw.to_be_bytes()
}

fn csd_v2(c_size: u32) -> [u8; 16] {
    let mut raw: u128 = 1 << 126;
    raw |= (c_size as u128) << 48;
    raw.to_be_bytes()
}
