// src/utils/binary.rs

//! Bitpacked stream used by every control and backend packet body.
//!
//! Values are packed LSB-first into a little-endian byte stream. Ranged
//! integers occupy exactly the bits the range requires, so both sides must
//! agree on the range. Byte blobs and strings are byte-aligned.

use crate::address::Address;
use crate::utils::error::{BinaryError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Number of bits needed to represent values in `[0, max_relative]`.
pub fn bits_required(max_relative: u64) -> u32 {
    if max_relative == 0 {
        0
    } else {
        64 - max_relative.leading_zeros()
    }
}

#[derive(Debug, Default)]
pub struct BitWriter {
    data: Vec<u8>,
    scratch: u64,
    scratch_bits: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self { data: Vec::with_capacity(bytes), scratch: 0, scratch_bits: 0 }
    }

    /// Total bits written so far, including bits still in scratch.
    pub fn bits_written(&self) -> usize {
        self.data.len() * 8 + self.scratch_bits as usize
    }

    pub fn write_bits(&mut self, value: u32, bits: u32) {
        debug_assert!(bits <= 32);
        let masked = if bits == 32 { value as u64 } else { (value as u64) & ((1u64 << bits) - 1) };
        self.scratch |= masked << self.scratch_bits;
        self.scratch_bits += bits;
        while self.scratch_bits >= 8 {
            self.data.push((self.scratch & 0xFF) as u8);
            self.scratch >>= 8;
            self.scratch_bits -= 8;
        }
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_bits(value as u32, 1);
    }

    /// Range-packed integer. Panics in debug builds if `value` is outside
    /// `[min, max]`; callers validate user-supplied values first.
    pub fn write_int(&mut self, value: u64, min: u64, max: u64) {
        debug_assert!(min <= max);
        debug_assert!(value >= min && value <= max);
        let bits = bits_required(max - min);
        let relative = value - min;
        if bits > 32 {
            self.write_bits((relative & 0xFFFF_FFFF) as u32, 32);
            self.write_bits((relative >> 32) as u32, bits - 32);
        } else {
            self.write_bits(relative as u32, bits);
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_bits(value as u32, 8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bits(value as u32, 16);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bits(value, 32);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bits((value & 0xFFFF_FFFF) as u32, 32);
        self.write_bits((value >> 32) as u32, 32);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_u64(value.to_bits());
    }

    /// Pad with zero bits to the next byte boundary.
    pub fn write_align(&mut self) {
        let remainder = self.scratch_bits % 8;
        if remainder != 0 {
            self.write_bits(0, 8 - remainder);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_align();
        debug_assert_eq!(self.scratch_bits, 0);
        self.data.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, value: &str, max_length: usize) {
        let bytes = value.as_bytes();
        debug_assert!(bytes.len() <= max_length);
        self.write_int(bytes.len() as u64, 0, max_length as u64);
        self.write_bytes(bytes);
    }

    pub fn write_address(&mut self, address: &Address) {
        match address {
            Address::None => {
                self.write_u8(0);
            }
            Address::Ipv4 { ip, port } => {
                self.write_u8(4);
                for byte in ip {
                    self.write_u8(*byte);
                }
                self.write_u16(*port);
            }
            Address::Ipv6 { ip, port } => {
                self.write_u8(6);
                for word in ip {
                    self.write_u16(*word);
                }
                self.write_u16(*port);
            }
        }
    }

    /// Flush scratch and take the byte stream.
    pub fn finish(mut self) -> Vec<u8> {
        self.write_align();
        self.data
    }
}

#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_index: usize,
    scratch: u64,
    scratch_bits: u32,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, byte_index: 0, scratch: 0, scratch_bits: 0 }
    }

    pub fn bits_remaining(&self) -> usize {
        (self.data.len() - self.byte_index) * 8 + self.scratch_bits as usize
    }

    pub fn read_bits(&mut self, bits: u32) -> Result<u32> {
        debug_assert!(bits <= 32);
        if (self.bits_remaining() as u64) < bits as u64 {
            return Err(BinaryError::ReadOverflow {
                needed: bits as usize,
                available: self.bits_remaining(),
            });
        }
        while self.scratch_bits < bits {
            self.scratch |= (self.data[self.byte_index] as u64) << self.scratch_bits;
            self.byte_index += 1;
            self.scratch_bits += 8;
        }
        let value = if bits == 32 {
            (self.scratch & 0xFFFF_FFFF) as u32
        } else {
            (self.scratch & ((1u64 << bits) - 1)) as u32
        };
        self.scratch >>= bits;
        self.scratch_bits -= bits;
        Ok(value)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? != 0)
    }

    pub fn read_int(&mut self, min: u64, max: u64) -> Result<u64> {
        debug_assert!(min <= max);
        let bits = bits_required(max - min);
        let relative = if bits > 32 {
            let low = self.read_bits(32)? as u64;
            let high = self.read_bits(bits - 32)? as u64;
            low | (high << 32)
        } else {
            self.read_bits(bits)? as u64
        };
        let value = min.checked_add(relative).ok_or(BinaryError::ValueOutOfRange {
            value: relative,
            min,
            max,
        })?;
        if value > max {
            return Err(BinaryError::ValueOutOfRange { value, min, max });
        }
        Ok(value)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read_bits(16)? as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_bits(32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let low = self.read_bits(32)? as u64;
        let high = self.read_bits(32)? as u64;
        Ok(low | (high << 32))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_align(&mut self) -> Result<()> {
        let remainder = self.scratch_bits % 8;
        if remainder != 0 {
            let padding = self.read_bits(8 - remainder)?;
            if padding != 0 {
                return Err(BinaryError::ValueOutOfRange { value: padding as u64, min: 0, max: 0 });
            }
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        self.read_align()?;
        debug_assert_eq!(self.scratch_bits, 0);
        if self.data.len() - self.byte_index < length {
            return Err(BinaryError::ReadOverflow {
                needed: length * 8,
                available: self.bits_remaining(),
            });
        }
        let slice = &self.data[self.byte_index..self.byte_index + length];
        self.byte_index += length;
        Ok(slice)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_string(&mut self, max_length: usize) -> Result<String> {
        let length = self.read_int(0, max_length as u64)? as usize;
        let bytes = self.read_bytes(length)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BinaryError::InvalidString)
    }

    pub fn read_address(&mut self) -> Result<Address> {
        let tag = self.read_u8()?;
        match tag {
            0 => Ok(Address::None),
            4 => {
                let mut ip = [0u8; 4];
                for byte in ip.iter_mut() {
                    *byte = self.read_u8()?;
                }
                let port = self.read_u16()?;
                Ok(Address::Ipv4 { ip, port })
            }
            6 => {
                let mut ip = [0u16; 8];
                for word in ip.iter_mut() {
                    *word = self.read_u16()?;
                }
                let port = self.read_u16()?;
                Ok(Address::Ipv6 { ip, port })
            }
            other => Err(BinaryError::BadAddressType(other)),
        }
    }
}

/// Little-endian u64 into a fixed slice, used by the crypto envelopes where
/// values bypass the bit stream.
pub fn write_u64_le(out: &mut [u8], value: u64) {
    LittleEndian::write_u64(out, value);
}

pub fn read_u64_le(data: &[u8]) -> u64 {
    LittleEndian::read_u64(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_round_trip() {
        let mut writer = BitWriter::new();
        writer.write_bits(0b101, 3);
        writer.write_bits(0xFFFF_FFFF, 32);
        writer.write_bool(true);
        writer.write_bool(false);
        let data = writer.finish();

        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(3).unwrap(), 0b101);
        assert_eq!(reader.read_bits(32).unwrap(), 0xFFFF_FFFF);
        assert!(reader.read_bool().unwrap());
        assert!(!reader.read_bool().unwrap());
    }

    #[test]
    fn test_ranged_int_round_trip() {
        let mut writer = BitWriter::new();
        writer.write_int(7, 0, 10);
        writer.write_int(1000, 500, 2000);
        writer.write_int(u64::MAX, 0, u64::MAX);
        let data = writer.finish();

        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_int(0, 10).unwrap(), 7);
        assert_eq!(reader.read_int(500, 2000).unwrap(), 1000);
        assert_eq!(reader.read_int(0, u64::MAX).unwrap(), u64::MAX);
    }

    #[test]
    fn test_int_out_of_range_rejected() {
        let mut writer = BitWriter::new();
        writer.write_bits(15, 4);
        let data = writer.finish();
        let mut reader = BitReader::new(&data);
        assert!(matches!(
            reader.read_int(0, 10),
            Err(BinaryError::ValueOutOfRange { value: 15, .. })
        ));
    }

    #[test]
    fn test_read_overflow() {
        let data = [0u8; 2];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(16).unwrap(), 0);
        assert!(matches!(reader.read_bits(1), Err(BinaryError::ReadOverflow { .. })));
    }

    #[test]
    fn test_string_and_bytes_round_trip() {
        let mut writer = BitWriter::new();
        writer.write_bool(true); // knock the stream off byte alignment
        writer.write_string("local", 64);
        writer.write_bytes(&[1, 2, 3, 4]);
        let data = writer.finish();

        let mut reader = BitReader::new(&data);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_string(64).unwrap(), "local");
        assert_eq!(reader.read_bytes(4).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_address_round_trip() {
        let addresses = [
            Address::None,
            "1.2.3.4:5678".parse().unwrap(),
            "[2001:db8::1]:40000".parse().unwrap(),
        ];
        let mut writer = BitWriter::new();
        for address in &addresses {
            writer.write_address(address);
        }
        let data = writer.finish();
        let mut reader = BitReader::new(&data);
        for address in &addresses {
            assert_eq!(reader.read_address().unwrap(), *address);
        }
    }

    #[test]
    fn test_u64_round_trip() {
        let mut writer = BitWriter::new();
        writer.write_u64(0xDEAD_BEEF_CAFE_F00D);
        let data = writer.finish();
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_u64().unwrap(), 0xDEAD_BEEF_CAFE_F00D);
    }
}
