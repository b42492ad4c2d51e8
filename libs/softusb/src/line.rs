//! Line codec for the D+/D- pair.
//!
//! A phase accumulator advanced once per reference tick recovers the bit clock. Accumulator
//! overflow is the sample edge used by the receive path; crossing the half-way point is the
//! drive edge used by the transmit path. While the line is an input, every observed transition
//! snaps the phase back to the half-bit offset so the next sample lands in the middle of the
//! sender's bit cell.

/// Phase value that puts the next sample edge half a bit-time away.
pub const PHASE_HALF: u32 = 0x8000_0000;

/// Number of consecutive ones after which a stuff bit is inserted.
pub const STUFF_RUN: u8 = 6;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Speed {
    /// 1.5 Mbit/s, pull-up on D-
    Low,
    /// 12 Mbit/s, pull-up on D+
    Full,
}

impl Default for Speed {
    #[cfg(feature = "full-speed")]
    fn default() -> Self { Speed::Full }

    #[cfg(not(feature = "full-speed"))]
    fn default() -> Self { Speed::Low }
}

impl Speed {
    pub fn bit_rate(&self) -> u32 {
        match self {
            Speed::Low => 1_500_000,
            Speed::Full => 12_000_000,
        }
    }

    /// Single-ended zero longer than 2.5us is a bus reset, rounded up to whole bit-times.
    pub fn reset_bits(&self) -> u32 {
        let tenths_of_us = self.bit_rate() as u64 * 25;
        ((tenths_of_us + 9_999_999) / 10_000_000) as u32
    }

    pub fn decode(&self, pair: DiffPair) -> LineState {
        match (pair.dp, pair.dm) {
            (false, false) => LineState::Se0,
            (true, true) => LineState::Se1,
            (dp, _) => {
                let j = match self {
                    Speed::Low => !dp,
                    Speed::Full => dp,
                };
                if j { LineState::J } else { LineState::K }
            }
        }
    }

    pub fn encode(&self, state: LineState) -> DiffPair {
        match state {
            LineState::Se0 => DiffPair { dp: false, dm: false },
            LineState::Se1 => DiffPair { dp: true, dm: true },
            LineState::J => match self {
                Speed::Low => DiffPair { dp: false, dm: true },
                Speed::Full => DiffPair { dp: true, dm: false },
            },
            LineState::K => match self {
                Speed::Low => DiffPair { dp: true, dm: false },
                Speed::Full => DiffPair { dp: false, dm: true },
            },
        }
    }
}

/// Raw levels of the two wires.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DiffPair {
    pub dp: bool,
    pub dm: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineState {
    J,
    K,
    Se0,
    Se1,
}

impl LineState {
    pub fn toggled(self) -> LineState {
        match self {
            LineState::J => LineState::K,
            LineState::K => LineState::J,
            other => other,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClockEdge {
    None,
    Sample,
    Drive,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RxBit {
    pub value: bool,
    /// the bit was inserted by the sender and carries no data
    pub stuff: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TxBit {
    pub level: LineState,
    /// false when a stuff bit went out instead of the requested data bit
    pub consumed: bool,
}

pub struct LineCodec {
    increment: u32,
    phase: u32,
    prev_sample: LineState,
    last_bit: LineState,
    rx_ones: u8,
    tx_level: LineState,
    tx_ones: u8,
    direction: Direction,
}

impl LineCodec {
    /// `ref_clock_hz` must be at least twice `bit_rate`; callers validate a 4x margin.
    pub fn new(bit_rate: u32, ref_clock_hz: u32) -> Self {
        let increment = (((bit_rate as u64) << 32) / ref_clock_hz as u64) as u32;
        LineCodec {
            increment,
            phase: 0,
            prev_sample: LineState::J,
            last_bit: LineState::J,
            rx_ones: 0,
            tx_level: LineState::J,
            tx_ones: 0,
            direction: Direction::Input,
        }
    }

    pub fn increment(&self) -> u32 { self.increment }

    pub fn direction(&self) -> Direction { self.direction }

    /// Advance one reference tick with the level currently on the bus.
    pub fn clock(&mut self, level: LineState) -> ClockEdge {
        if level != self.prev_sample {
            self.prev_sample = level;
            if self.direction == Direction::Input {
                self.phase = PHASE_HALF;
                return ClockEdge::None;
            }
        }
        let (next, wrapped) = self.phase.overflowing_add(self.increment);
        let crossed_half = self.phase < PHASE_HALF && next >= PHASE_HALF;
        self.phase = next;
        if wrapped {
            ClockEdge::Sample
        } else if crossed_half {
            ClockEdge::Drive
        } else {
            ClockEdge::None
        }
    }

    /// Re-arm NRZI and destuffing state at the start of a received packet.
    pub fn start_packet(&mut self) {
        self.last_bit = LineState::J;
        self.rx_ones = 0;
    }

    /// NRZI-decode one bit cell: no transition is a one.
    pub fn sample_bit(&mut self, level: LineState) -> RxBit {
        let value = level == self.last_bit;
        self.last_bit = level;
        if self.rx_ones == STUFF_RUN {
            self.rx_ones = 0;
            if value {
                log::warn!("bit stuffing violation");
            }
            return RxBit { value, stuff: true };
        }
        if value {
            self.rx_ones += 1;
        } else {
            self.rx_ones = 0;
        }
        RxBit { value, stuff: false }
    }

    /// Take the line with an idle J and fresh stuffing state.
    pub fn start_transmit(&mut self) {
        self.direction = Direction::Output;
        self.tx_level = LineState::J;
        self.tx_ones = 0;
    }

    /// NRZI-encode one data bit. After six ones a forced transition goes out first and the
    /// data bit must be offered again.
    pub fn emit_bit(&mut self, value: bool) -> TxBit {
        if self.tx_ones == STUFF_RUN {
            self.tx_ones = 0;
            self.tx_level = self.tx_level.toggled();
            return TxBit { level: self.tx_level, consumed: false };
        }
        if value {
            self.tx_ones += 1;
        } else {
            self.tx_ones = 0;
            self.tx_level = self.tx_level.toggled();
        }
        TxBit { level: self.tx_level, consumed: true }
    }

    pub fn stuff_pending(&self) -> bool { self.tx_ones == STUFF_RUN }

    /// Drive a raw level (EOP single-ended zero, idle J).
    pub fn drive(&mut self, level: LineState) { self.tx_level = level; }

    pub fn tx_level(&self) -> LineState { self.tx_level }

    /// Tri-state the drivers and go back to receiving.
    pub fn release(&mut self) {
        self.direction = Direction::Input;
        self.tx_ones = 0;
    }

    pub fn reset(&mut self) {
        self.phase = 0;
        self.rx_ones = 0;
        self.last_bit = LineState::J;
        self.release();
    }
}

pub fn bit_stuff(bits: &[bool]) -> Vec<bool> {
    let mut out = Vec::with_capacity(bits.len() + bits.len() / 6 + 1);
    let mut ones = 0;
    for &bit in bits {
        out.push(bit);
        if bit {
            ones += 1;
            if ones == STUFF_RUN {
                out.push(false);
                ones = 0;
            }
        } else {
            ones = 0;
        }
    }
    out
}

pub fn bit_destuff(bits: &[bool]) -> Vec<bool> {
    let mut out = Vec::with_capacity(bits.len());
    let mut ones = 0;
    let mut skip = false;
    for &bit in bits {
        if skip {
            skip = false;
            ones = 0;
            continue;
        }
        out.push(bit);
        if bit {
            ones += 1;
            if ones == STUFF_RUN {
                skip = true;
            }
        } else {
            ones = 0;
        }
    }
    out
}

pub fn nrzi_encode(bits: &[bool], idle: LineState) -> Vec<LineState> {
    let mut level = idle;
    bits.iter()
        .map(|&bit| {
            if !bit {
                level = level.toggled();
            }
            level
        })
        .collect()
}

pub fn nrzi_decode(levels: &[LineState], idle: LineState) -> Vec<bool> {
    let mut prev = idle;
    levels
        .iter()
        .map(|&level| {
            let bit = level == prev;
            prev = level;
            bit
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use rand_chacha::rand_core::{RngCore, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn random_bits(rng: &mut ChaCha8Rng, len: usize, ones_bias: u32) -> Vec<bool> {
        (0..len).map(|_| rng.next_u32() % 8 < ones_bias).collect()
    }

    #[test]
    fn test_j_k_conventions() {
        let ls = Speed::Low;
        let fs = Speed::Full;
        assert_eq!(ls.decode(DiffPair { dp: false, dm: true }), LineState::J);
        assert_eq!(fs.decode(DiffPair { dp: false, dm: true }), LineState::K);
        assert_eq!(fs.decode(DiffPair { dp: false, dm: false }), LineState::Se0);
        for state in [LineState::J, LineState::K, LineState::Se0, LineState::Se1] {
            assert_eq!(ls.decode(ls.encode(state)), state);
            assert_eq!(fs.decode(fs.encode(state)), state);
        }
        assert_eq!(ls.reset_bits(), 4);
        assert_eq!(fs.reset_bits(), 30);
    }

    #[test]
    fn test_nrzi_roundtrip() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for _ in 0..256 {
            let bits = random_bits(&mut rng, 96, 4);
            let levels = nrzi_encode(&bits, LineState::J);
            assert_eq!(nrzi_decode(&levels, LineState::J), bits);
        }
    }

    #[test]
    fn test_stuffing_roundtrip() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..256 {
            // bias towards ones so that long runs show up
            let bits = random_bits(&mut rng, 120, 7);
            let stuffed = bit_stuff(&bits);
            assert_eq!(bit_destuff(&stuffed), bits, "failed on {:?}", bits);
            // no run of seven ones survives stuffing
            let mut run = 0;
            for &b in &stuffed {
                run = if b { run + 1 } else { 0 };
                assert!(run <= 6);
            }
        }
        assert_eq!(bit_stuff(&[true; 6]), vec![true, true, true, true, true, true, false]);
    }

    #[test]
    fn test_codec_matches_reference_encoder() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        for _ in 0..64 {
            let bits = random_bits(&mut rng, 80, 6);
            let mut codec = LineCodec::new(1_500_000, 48_000_000);
            codec.start_transmit();
            let mut levels = Vec::new();
            let mut i = 0;
            while i < bits.len() {
                let tx = codec.emit_bit(bits[i]);
                levels.push(tx.level);
                if tx.consumed {
                    i += 1;
                }
            }
            if codec.stuff_pending() {
                levels.push(codec.emit_bit(false).level);
            }
            assert_eq!(levels, nrzi_encode(&bit_stuff(&bits), LineState::J));

            // and the receive side undoes it
            codec.start_packet();
            let decoded: Vec<bool> =
                levels.iter().map(|&l| codec.sample_bit(l)).filter(|b| !b.stuff).map(|b| b.value).collect();
            assert_eq!(decoded, bits);
        }
    }

    #[test]
    fn test_clock_recovery_realigns() {
        // 32 reference ticks per bit at low speed
        let mut codec = LineCodec::new(1_500_000, 48_000_000);
        assert_eq!(codec.increment(), 1 << 27);
        // an edge snaps the phase; the first sample lands 16 ticks later, mid-bit
        assert_eq!(codec.clock(LineState::K), ClockEdge::None);
        let mut ticks = 0;
        loop {
            ticks += 1;
            if codec.clock(LineState::K) == ClockEdge::Sample {
                break;
            }
        }
        assert_eq!(ticks, 16);
        // a full bit later the next sample follows, with a drive edge in between
        let mut edges = Vec::new();
        for _ in 0..32 {
            let e = codec.clock(LineState::K);
            if e != ClockEdge::None {
                edges.push(e);
            }
        }
        assert_eq!(edges, vec![ClockEdge::Drive, ClockEdge::Sample]);
    }
}
