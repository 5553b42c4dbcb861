//! LFSR-16 pseudo-random sequence generator.
//!
//! Polynomial `x^16 + x^14 + x^13 + x^11 + 1`, period 65535. The
//! transmitter runs the register as a generator to pattern payloads; the
//! receiver runs [`Lfsr16::follow_u8`] against the incoming bytes to
//! detect corruption and dropped data, resynchronizing itself after 16
//! bits whenever it loses the sequence.

use crate::Error;
use log::warn;

const LFSR16_SEED: u16 = 0xace1;
const RESYNC_BITS: u8 = 16;

pub struct Lfsr16 {
    state: u16,
    /// Bits still to absorb before the follower is synchronized.
    resync_remaining: u8,
    error_count: u32,
}

impl Lfsr16 {
    pub fn new() -> Self {
        Lfsr16::with_seed(LFSR16_SEED)
    }

    /// A zero seed would lock the register; it is replaced by 1.
    pub fn with_seed(seed: u16) -> Self {
        let state = if seed == 0 {
            warn!("lfsr16 seed 0 is invalid, using 1");
            1
        } else {
            seed
        };
        Lfsr16 {
            state,
            resync_remaining: 0,
            error_count: 0,
        }
    }

    fn guard_zero(&mut self) {
        if self.state == 0 {
            warn!("lfsr16 state reached 0, using 1");
            self.state = 1;
        }
    }

    /// Advance one bit; returns the bit shifted in (0 or 1).
    pub fn next_bit(&mut self) -> u8 {
        self.guard_zero();
        let bit = (self.state ^ (self.state >> 2) ^ (self.state >> 3) ^ (self.state >> 5)) & 1;
        self.state = (self.state >> 1) | (bit << 15);
        bit as u8
    }

    /// Advance 8 bits; returns the new high byte of the register.
    pub fn next_u8(&mut self) -> u8 {
        for _ in 0..8 {
            self.next_bit();
        }
        (self.state >> 8) as u8
    }

    pub fn next_u16(&mut self) -> u16 {
        let lo = self.next_u8() as u16;
        let hi = self.next_u8() as u16;
        (hi << 8) | lo
    }

    pub fn next_u32(&mut self) -> u32 {
        let lo = self.next_u16() as u32;
        let hi = self.next_u16() as u32;
        (hi << 16) | lo
    }

    /// Track the peer's sequence one received byte at a time.
    ///
    /// While resynchronizing, the byte is absorbed into the register and
    /// `Ok` is returned. Once synchronized, the expected next byte is
    /// generated; a mismatch restarts resynchronization, bumps
    /// `error_count`, and reports [`Error::Synchronization`].
    pub fn follow_u8(&mut self, byte: u8) -> Result<(), Error> {
        self.guard_zero();
        if self.resync_remaining > 0 {
            // Each emitted byte is 8 fresh register bits; two of them
            // reconstruct the full state.
            self.state = ((byte as u16) << 8) | (self.state >> 8);
            self.resync_remaining -= 8;
            return Ok(());
        }
        let expected = self.next_u8();
        if expected == byte {
            Ok(())
        } else {
            self.error_count = self.error_count.wrapping_add(1);
            self.resync_remaining = RESYNC_BITS;
            Err(Error::Synchronization)
        }
    }

    pub fn state(&self) -> u16 {
        self.state
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }
}

impl Default for Lfsr16 {
    fn default() -> Self {
        Lfsr16::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_first_step() {
        let mut lfsr = Lfsr16::new();
        let bit = lfsr.next_bit();
        assert_eq!(bit, 0);
        assert_eq!(lfsr.state(), 0x5670);
    }

    #[test]
    fn full_period() {
        let mut lfsr = Lfsr16::new();
        let mut count: u32 = 0;
        loop {
            lfsr.next_bit();
            count += 1;
            if lfsr.state() == LFSR16_SEED {
                break;
            }
        }
        assert_eq!(count, 65535);
    }

    #[test]
    fn zero_seed_is_corrected() {
        let mut lfsr = Lfsr16::with_seed(0);
        assert_eq!(lfsr.state(), 1);
        lfsr.next_bit();
        assert_ne!(lfsr.state(), 0);
    }

    #[test]
    fn follower_tracks_generator() {
        let mut gen = Lfsr16::new();
        let mut follower = Lfsr16::new();
        for _ in 0..64 {
            let byte = gen.next_u8();
            assert!(follower.follow_u8(byte).is_ok());
        }
        assert_eq!(follower.error_count(), 0);
    }

    #[test]
    fn follower_resynchronizes_after_error() {
        let mut gen = Lfsr16::new();
        let mut follower = Lfsr16::new();
        for _ in 0..4 {
            follower.follow_u8(gen.next_u8()).unwrap();
        }
        // Corrupt one byte.
        let corrupt = gen.next_u8() ^ 0x40;
        assert!(follower.follow_u8(corrupt).is_err());
        assert_eq!(follower.error_count(), 1);
        // Two clean bytes re-seed the follower, then it tracks again.
        follower.follow_u8(gen.next_u8()).unwrap();
        follower.follow_u8(gen.next_u8()).unwrap();
        for _ in 0..16 {
            assert!(follower.follow_u8(gen.next_u8()).is_ok());
        }
        assert_eq!(follower.error_count(), 1);
    }

    #[test]
    fn follower_joins_mid_stream() {
        let mut gen = Lfsr16::new();
        for _ in 0..10 {
            gen.next_u8();
        }
        let mut follower = Lfsr16::with_seed(1);
        // Walk until the follower notices it is lost, then let two clean
        // bytes re-seed it.
        while follower.follow_u8(gen.next_u8()).is_ok() {}
        follower.follow_u8(gen.next_u8()).unwrap();
        follower.follow_u8(gen.next_u8()).unwrap();
        for _ in 0..16 {
            assert!(follower.follow_u8(gen.next_u8()).is_ok());
        }
    }
}
