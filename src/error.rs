use core::fmt::Debug;

/// Session-level error type.
///
/// Bus faults are never fatal: every variant means "this transaction yielded
/// nothing usable", and the caller decides whether to retry.
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E: Debug> {
    /// Reset saw no presence pulse; the device is absent or the bus is down.
    NoPresence,
    /// Computed checksum differs from the stored one (computed, stored).
    CrcMismatch(u8, u8),
    /// ROM code belongs to another device family (expected, found).
    FamilyMismatch(u8, u8),
    /// GPIO fault reported by the underlying line.
    Gpio(E),
}

impl<E: Debug> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Error::Gpio(e)
    }
}
