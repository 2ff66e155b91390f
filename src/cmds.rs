// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! SD Card commands and app commands
//!
//! Every command is encoded as a 6 byte frame: the start and transmission
//! bits with the command index, the 32-bit argument big-endian, and a CRC7
//! over the first 5 bytes with the end bit in bit 0. Section 7.2.2 of the
//! Simplifed Specification lets the card ignore the CRC for most commands
//! in SPI mode, but we always compute a valid one so the frames stay
//! correct even against cards that do check.

use crc::{Crc, CRC_7_MMC};

use crate::common::VOLTAGE_2_7_TO_3_6;

/// Encode a GoIdleState command
pub fn go_idle_state(buffer: &mut [u8]) {
    Cmd::GoIdleState.encode(0, buffer)
}

/// Encode a SendIfCond command assuming  2.7-3.6 V as the voltage supplied.
pub fn send_if_cond(check_pattern: u8, buffer: &mut [u8]) {
    Cmd::SendIfCond.encode(((VOLTAGE_2_7_TO_3_6 as u32) << 8) | (check_pattern as u32), buffer)
}

/// Encode an AppCmd command. The next command should be an application command.
pub fn app_cmd(buffer: &mut [u8]) {
    Cmd::AppCmd.encode(0, buffer);
}

/// Encode an SdSendOpCond app command.
pub fn sd_send_op_cond(hcs: HostCapacitySupport, buffer: &mut [u8]) {
    AppCmd::SdSendOpCond.encode(hcs.to_arg(), buffer);
}

/// Encode a ReadOCR command.
pub fn read_ocr(buffer: &mut [u8]) {
    Cmd::ReadOCR.encode(0, buffer);
}

/// Encode a SendCSD command.
pub fn send_csd(buffer: &mut [u8]) {
    Cmd::SendCSD.encode(0, buffer);
}

/// Encode a SendBlockLen command.
pub fn send_block_len(length: u32, buffer: &mut [u8]) {
    Cmd::SendBlockLen.encode(length, buffer);
}

/// Encode a ReadSingleBlock command for the given wire address.
///
/// The address is the raw wire argument: callers translate block numbers
/// through the card's addressing mode first.
pub fn read_single_block(address: u32, buffer: &mut [u8]) {
    Cmd::ReadSingleBlock.encode(address, buffer);
}

/// Encode a WriteBlock command for the given wire address.
pub fn write_block(address: u32, buffer: &mut [u8]) {
    Cmd::WriteBlock.encode(address, buffer);
}

/// Host support for differend SD Card capacities.
#[derive(Clone, Copy)]
pub enum HostCapacitySupport {
    /// SDSC only host.
    ScOnly,

    /// SDHC or SDXC supported by host.
    HcOrXcSupported,
}

// This enum has all of the allowed commands for an SD Card in SPI mode,
// including ones that this package does not use. This is taken from Table 7-3
// of the Simplifed Specification.
#[allow(dead_code)]
#[repr(u8)]
#[derive(Clone, Copy)]
enum Cmd {
    GoIdleState = 0,
    SendOpCond = 1,
    SwitchFunc = 6,
    SendIfCond = 8,
    SendCSD = 9,
    SendCID = 10,
    StopTransmisson = 12,
    SendStatus = 13,
    SendBlockLen = 16,
    ReadSingleBlock = 17,
    ReadMultipleBlock = 18,
    WriteBlock = 24,
    WriteMultipleBlock = 25,
    ProgramCSD = 27,
    SetWriteProt = 28,
    ClrWriteProt = 29,
    SendWriteProt = 30,
    EraseWrBlkStartAddr = 32,
    EraseWrBlkEndAddr = 33,
    Erase = 38,
    LockUnlock = 42,
    AppCmd = 55,
    GenCmd = 56,
    ReadOCR = 58,
    CRCOnOff = 59,
}

// This enum has all of the allowed application specific commends for an SD Card
// in SPI mode including ones that this package does not use. This is taken from
// Table 7-4 of the Simplifed Specification.
#[allow(dead_code)]
#[repr(u8)]
#[derive(Clone, Copy)]
enum AppCmd {
    SdStatus = 13,
    SendNumWrBlocks = 22,
    SetWrBlkEraseCount = 23,
    SdSendOpCond = 41,
    SetClrCardDetect = 42,
    SendSCR = 51,
}

impl Encode for Cmd {
    fn start_byte(self) -> u8 {
        self as u8 | CMD_START
    }
}

impl Encode for AppCmd {
    fn start_byte(self) -> u8 {
        self as u8 | CMD_START
    }
}

trait Encode: Sized + Copy {
    fn start_byte(self) -> u8;

    fn encode(self, arg: u32, buffer: &mut [u8]) {
        assert!(buffer.len() >= 6, "Buffer to small to encode command.");

        buffer[0] = self.start_byte();
        buffer[1] = (arg >> 24) as u8;
        buffer[2] = (arg >> 16) as u8;
        buffer[3] = (arg >> 8) as u8;
        buffer[4] = arg as u8;
        buffer[5] = (CRC7.checksum(&buffer[..5]) << 1) | CMD_END;
    }
}

impl HostCapacitySupport {
    fn to_arg(self) -> u32 {
        const HCR_BIT: u32 = 0b0100_0000_0000_0000_0000_0000_0000_0000;
        match self {
            HostCapacitySupport::ScOnly => 0,
            HostCapacitySupport::HcOrXcSupported => HCR_BIT,
        }
    }
}

// The CRC7 from section 4.5 of the Simplifed Specification (polynomial
// 0x09, zero initial value).
const CRC7: Crc<u8> = Crc::<u8>::new(&CRC_7_MMC);

// This is a start bit (0) followed by the transmittions from host bit (see
// Table 7-1 in the Simplifed Specification).
const CMD_START: u8 = 0b01000000;

// This is the end bit (1) for a command (see Table 7-1).
const CMD_END: u8 = 0b00000001;
