use crate::{Bus, BusLine, Command, OpCode, RomCode};
use embedded_hal::delay::DelayNs;

/// Which command opens a search pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SearchMode {
    /// Every device participates (Search ROM, `0xF0`).
    Normal,
    /// Only devices with a pending alarm condition participate (`0xEC`).
    Alarm,
}

impl SearchMode {
    fn command(self) -> Command {
        match self {
            SearchMode::Normal => Command::SearchRom,
            SearchMode::Alarm => Command::SearchRomAlarmed,
        }
    }
}

/// Restartable cursor into the binary tree of ROM codes on one bus.
///
/// Each [`Bus::search`] call advances the cursor by one device; the
/// discrepancy bookkeeping persists between calls so successive passes walk
/// previously-unvisited branches. One instance per bus; driving two buses
/// takes two states.
#[derive(Clone, Default)]
pub struct SearchState {
    rom: [u8; 8],
    last_discrepancy: u8,
    last_family_discrepancy: u8,
    last_device: bool,
    family: Option<u8>,
}

impl SearchState {
    /// Start of a full enumeration.
    pub fn new() -> SearchState {
        SearchState::default()
    }

    /// Starts enumeration inside one family's subtree.
    ///
    /// Seeding the working ROM with the family code and pointing the
    /// discrepancy cursor past the last bit makes the next pass descend
    /// straight to the family's lowest ROM code.
    pub fn for_family(family: u8) -> SearchState {
        let mut rom = [0u8; 8];
        rom[0] = family;
        SearchState {
            rom,
            last_discrepancy: RomCode::BITS,
            last_family_discrepancy: 0,
            last_device: false,
            family: Some(family),
        }
    }

    /// Rewinds to the start of a full enumeration.
    pub fn reset(&mut self) {
        *self = SearchState::new();
    }

    /// Rewinds and biases the next pass toward `family`, as [`Self::for_family`].
    pub fn target(&mut self, family: u8) {
        *self = SearchState::for_family(family);
    }

    /// Position of the last 0-direction discrepancy inside the family-code
    /// byte (1-8), or 0 when the current branch has none.
    pub fn last_family_discrepancy(&self) -> u8 {
        self.last_family_discrepancy
    }

    /// Whether enumeration has already visited every device.
    pub fn is_exhausted(&self) -> bool {
        self.last_device
    }

    /// Iterator adapter over the remaining devices.
    pub fn iter<'a, L: BusLine, D: DelayNs>(
        &'a mut self,
        bus: &'a mut Bus<L, D>,
        mode: SearchMode,
    ) -> SearchIter<'a, L, D> {
        SearchIter {
            state: self,
            bus,
            mode,
        }
    }
}

/// Yields each discovered ROM code until the bus is exhausted.
pub struct SearchIter<'a, L: BusLine, D: DelayNs> {
    state: &'a mut SearchState,
    bus: &'a mut Bus<L, D>,
    mode: SearchMode,
}

impl<L: BusLine, D: DelayNs> Iterator for SearchIter<'_, L, D> {
    type Item = Result<RomCode, L::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.bus.search(self.state, self.mode).transpose()
    }
}

impl<L: BusLine, D: DelayNs> Bus<L, D> {
    /// Advances `state` to the next device on the bus.
    ///
    /// Walks all 64 ROM bit positions, reading each bit and its complement
    /// and writing the chosen direction back so non-matching devices drop
    /// out. Discrepancies resolve 0-before-1, replaying the previous pass
    /// below its last branch point, which makes repeated enumeration
    /// deterministic and ordered.
    ///
    /// Returns `Ok(None)` when enumeration is complete, or when nothing
    /// answered this pass; an empty or faulted bus rewinds `state` so the
    /// next call starts over. Discovered codes are not checksum-verified
    /// here; gate them with [`RomCode::is_valid`] before use.
    pub fn search(
        &mut self,
        state: &mut SearchState,
        mode: SearchMode,
    ) -> Result<Option<RomCode>, L::Error> {
        if state.last_device {
            return Ok(None);
        }

        if !self.reset()? {
            state.reset();
            return Ok(None);
        }

        self.write_byte(mode.command().op_code(), false)?;

        let mut position = 1u8; // 1..=64
        let mut last_zero = 0u8;
        let mut byte = 0usize;
        let mut mask = 0x01u8;

        loop {
            let bit = self.read_bit()?;
            let complement = self.read_bit()?;

            // both high: the remaining devices dropped out mid-walk
            if bit && complement {
                break;
            }

            let direction = if bit != complement {
                // all remaining devices agree here
                bit
            } else {
                // population splits at this position
                let chosen = if position < state.last_discrepancy {
                    // replay the previous pass below its branch point
                    state.rom[byte] & mask != 0
                } else {
                    // flip to the 1-branch at it, open new ground with 0 past it
                    position == state.last_discrepancy
                };
                if !chosen {
                    last_zero = position;
                    if last_zero < 9 {
                        state.last_family_discrepancy = last_zero;
                    }
                }
                chosen
            };

            if direction {
                state.rom[byte] |= mask;
            } else {
                state.rom[byte] &= !mask;
            }
            self.write_bit(direction)?;

            position += 1;
            mask <<= 1;
            if mask == 0 {
                byte += 1;
                mask = 0x01;
                if byte == RomCode::BYTES as usize {
                    break;
                }
            }
        }

        if position <= RomCode::BITS || state.rom[0] == 0 {
            // incomplete walk, or an all-zero read from a dead bus
            state.reset();
            return Ok(None);
        }

        state.last_discrepancy = last_zero;
        if last_zero == 0 {
            state.last_device = true;
        }

        if let Some(family) = state.family {
            if state.rom[0] != family {
                // walked out of the target subtree: that family is exhausted
                state.last_device = true;
                return Ok(None);
            }
        }

        Ok(Some(RomCode::from(state.rom)))
    }
}
