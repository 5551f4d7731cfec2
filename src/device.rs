use crate::{Bus, BusLine, Error, RomCode, SearchMode, SearchState};
use core::fmt::Debug;
use embedded_hal::delay::DelayNs;

/// A typed handle to one enumerated device.
pub trait Device: Sized {
    /// Family code shared by all devices of this type.
    const FAMILY_CODE: u8;

    fn rom(&self) -> &RomCode;

    /// Wraps a ROM code without checking its family.
    ///
    /// # Safety
    ///
    /// This is marked as unsafe because it does not check whether the given
    /// code belongs to this device family. It assumes so.
    unsafe fn from_rom_unchecked(rom: RomCode) -> Self;

    /// Wraps a ROM code, rejecting foreign families.
    fn from_rom<E: Debug>(rom: RomCode) -> Result<Self, Error<E>> {
        if rom.family_code() != Self::FAMILY_CODE {
            Err(Error::FamilyMismatch(Self::FAMILY_CODE, rom.family_code()))
        } else {
            Ok(unsafe { Self::from_rom_unchecked(rom) })
        }
    }

    /// Finds the first device of this family on the bus.
    ///
    /// Runs a family-targeted search and skips codes that fail the checksum
    /// gate, so a glitched walk never surfaces as a device.
    fn search_first<L: BusLine, D: DelayNs>(
        bus: &mut Bus<L, D>,
    ) -> Result<Option<Self>, L::Error> {
        let mut state = SearchState::for_family(Self::FAMILY_CODE);
        while let Some(rom) = bus.search(&mut state, SearchMode::Normal)? {
            if rom.is_valid() {
                return Ok(Some(unsafe { Self::from_rom_unchecked(rom) }));
            }
        }
        Ok(None)
    }
}
