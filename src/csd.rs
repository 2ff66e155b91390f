// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Decoding of the Card Specific Data (CSD) register.
//!
//! The CSD is a 16 byte register read with a SendCSD command. We treat it
//! as a big-endian 128 bit value and extract the handfull of fields needed
//! to size the card. Bit positions are from section 5.3 of the Simplified
//! Specification: version 1.0 of the structure (standard capacity cards)
//! in section 5.3.2 and version 2.0 (high and extended capacity cards) in
//! section 5.3.3.

/// A decoded CSD register.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Csd {
    /// CSD structure version 1.0.
    V1(CsdV1),

    /// CSD structure version 2.0.
    V2(CsdV2),
}

/// A version 1.0 CSD register.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CsdV1(u128);

/// A version 2.0 CSD register.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CsdV2(u128);

impl Csd {
    /// Decode the 16 raw register bytes.
    ///
    /// Returns `None` for CSD structure versions this crate does not
    /// support (version 3.0 is SDUC only, which does not exist in SPI
    /// mode).
    pub fn parse(data: &[u8; 16]) -> Option<Csd> {
        let raw = u128::from_be_bytes(*data);

        match (raw >> 126) & 0b11 {
            0 => Some(Csd::V1(CsdV1(raw))),
            1 => Some(Csd::V2(CsdV2(raw))),
            _ => None,
        }
    }

    /// The card size in 512 byte blocks.
    pub fn block_count(&self) -> u32 {
        match self {
            Csd::V1(csd) => csd.block_count(),
            Csd::V2(csd) => csd.block_count(),
        }
    }
}

impl CsdV1 {
    fn read_bl_len(&self) -> u32 {
        ((self.0 >> 80) & 0xf) as u32
    }

    fn c_size(&self) -> u32 {
        ((self.0 >> 62) & 0xfff) as u32
    }

    fn c_size_mult(&self) -> u32 {
        ((self.0 >> 47) & 0x7) as u32
    }

    /// Capacity is (C_SIZE + 1) * 2^(C_SIZE_MULT + 2) * 2^READ_BL_LEN
    /// bytes, converted here to 512 byte blocks.
    fn block_count(&self) -> u32 {
        let bytes = ((self.c_size() as u64) + 1)
            << (self.c_size_mult() + 2 + self.read_bl_len());

        (bytes >> 9) as u32
    }
}

impl CsdV2 {
    fn c_size(&self) -> u32 {
        ((self.0 >> 48) & 0x3f_ffff) as u32
    }

    /// Capacity is (C_SIZE + 1) * 512 KiB, which is (C_SIZE + 1) * 1024
    /// blocks.
    fn block_count(&self) -> u32 {
        let blocks = ((self.c_size() as u64) + 1) * 1024;

        blocks.min(u32::MAX as u64) as u32
    }
}
