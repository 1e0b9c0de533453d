//! Block-number arithmetic.
//!
//! Block numbers are 16 bits on the wire and wrap from 65535 back to 0, so
//! sequencing is done modulo 65536 rather than with plain comparisons.

const MODULUS: u32 = 1 << 16;

/// The block that follows `block`.
pub fn next(block: u16) -> u16 {
    ((u32::from(block) + 1) % MODULUS) as u16
}

/// The block that precedes `block`.
pub fn previous(block: u16) -> u16 {
    ((u32::from(block) + MODULUS - 1) % MODULUS) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_wraps_to_zero() {
        assert_eq!(next(0), 1);
        assert_eq!(next(65534), 65535);
        assert_eq!(next(65535), 0);
    }

    #[test]
    fn previous_wraps_to_max() {
        assert_eq!(previous(1), 0);
        assert_eq!(previous(0), 65535);
        assert_eq!(previous(next(65535)), 65535);
    }
}
