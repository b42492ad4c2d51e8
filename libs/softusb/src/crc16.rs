//! Bit-serial CRC16 as used by USB data packets.
//!
//! The register shifts right and is XORed with the bit-reversed generator, so bytes go in LSB
//! first exactly as they appear on the wire.

/// x^16 + x^15 + x^2 + 1, bit-reversed
pub const CRC16_POLY: u16 = 0xA001;
pub const CRC16_SEED: u16 = 0xFFFF;
/// Register value after running a packet payload and its transmitted CRC through the engine.
pub const CRC16_RESIDUAL: u16 = 0xB001;

pub fn crc16_update(state: u16, bit: bool) -> u16 {
    if (state & 1 == 1) ^ bit { (state >> 1) ^ CRC16_POLY } else { state >> 1 }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Crc16(u16);

impl Default for Crc16 {
    fn default() -> Self { Crc16(CRC16_SEED) }
}

impl Crc16 {
    pub fn new() -> Self { Self::default() }

    pub fn reset(&mut self) { self.0 = CRC16_SEED; }

    pub fn update_bit(&mut self, bit: bool) { self.0 = crc16_update(self.0, bit); }

    pub fn update_byte(&mut self, byte: u8) {
        for i in 0..8 {
            self.update_bit(byte & (1 << i) != 0);
        }
    }

    pub fn register(&self) -> u16 { self.0 }

    /// The value appended to a packet: the inverted register, sent LSB first.
    pub fn finish(&self) -> u16 { !self.0 }

    pub fn is_residual(&self) -> bool { self.0 == CRC16_RESIDUAL }
}

pub fn crc16_generate(payload: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    payload.iter().for_each(|&b| crc.update_byte(b));
    crc.finish()
}

pub fn crc16_check(payload: &[u8], crc: u16) -> bool {
    let mut engine = Crc16::new();
    payload.iter().for_each(|&b| engine.update_byte(b));
    crc.to_le_bytes().iter().for_each(|&b| engine.update_byte(b));
    engine.is_residual()
}
