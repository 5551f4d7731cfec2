use crate::{BusLine, Command, Error, OpCode, RomCode};
use embedded_hal::delay::DelayNs;

// Reset and presence-detect timing (µs).
const RESET_LOW_US: u32 = 480;
const PRESENCE_SETTLE_US: u32 = 70;
const RESET_TAIL_US: u32 = 410;
const IDLE_POLL_RETRIES: u32 = 125;
const IDLE_POLL_STEP_US: u32 = 2;

// Write slots: a short low pulse encodes 1, holding low for most of the
// slot encodes 0. Slot length stays fixed either way.
const WRITE_1_LOW_US: u32 = 10;
const WRITE_1_HIGH_US: u32 = 55;
const WRITE_0_LOW_US: u32 = 65;
const WRITE_0_HIGH_US: u32 = 5;

// Read slots: short initiation pulse, devices assert within ~15 µs of the
// falling edge, sample mid-slot and wait the remainder out.
const READ_INIT_US: u32 = 3;
const READ_SETTLE_US: u32 = 10;
const READ_TAIL_US: u32 = 53;

/// Master for one 1-Wire bus, owning the GPIO line and the delay source.
///
/// All transport is blocking and timing-critical; each bit occupies its full
/// slot before the call returns. Every device on the line is reached through
/// the one instance owning that line, which is what serializes access.
pub struct Bus<L, D> {
    line: L,
    delay: D,
}

impl<L: BusLine, D: DelayNs> Bus<L, D> {
    pub fn new(line: L, delay: D) -> Self {
        Bus { line, delay }
    }

    /// Releases the collaborators, consuming the bus.
    pub fn free(self) -> (L, D) {
        (self.line, self.delay)
    }

    /// Generates a reset pulse and listens for a presence pulse.
    ///
    /// Waits a bounded number of polls for the line to reach idle-high first;
    /// a line stuck low (short, or a device wedged mid-transaction) reports
    /// `Ok(false)` rather than blocking forever. `Ok(true)` means at least
    /// one device answered.
    pub fn reset(&mut self) -> Result<bool, L::Error> {
        self.line.release()?;
        let mut retries = IDLE_POLL_RETRIES;
        while self.line.is_low()? {
            if retries == 0 {
                return Ok(false);
            }
            retries -= 1;
            self.delay.delay_us(IDLE_POLL_STEP_US);
        }

        self.line.drive_low()?;
        self.delay.delay_us(RESET_LOW_US);
        self.line.release()?;

        self.delay.delay_us(PRESENCE_SETTLE_US);
        let presence = self.line.is_low()?;
        self.delay.delay_us(RESET_TAIL_US);
        Ok(presence)
    }

    /// Emits one write slot.
    pub fn write_bit(&mut self, bit: bool) -> Result<(), L::Error> {
        self.line.drive_low()?;
        self.delay
            .delay_us(if bit { WRITE_1_LOW_US } else { WRITE_0_LOW_US });
        self.line.drive_high()?;
        self.delay
            .delay_us(if bit { WRITE_1_HIGH_US } else { WRITE_0_HIGH_US });
        Ok(())
    }

    /// Runs one read slot and samples the device response.
    pub fn read_bit(&mut self) -> Result<bool, L::Error> {
        self.line.drive_low()?;
        self.delay.delay_us(READ_INIT_US);
        self.line.release()?;
        self.delay.delay_us(READ_SETTLE_US);
        let bit = self.line.is_high()?;
        self.delay.delay_us(READ_TAIL_US);
        Ok(bit)
    }

    /// Writes one byte, LSB first.
    ///
    /// With `hold_power` the line stays driven high afterwards to feed
    /// parasitic devices; the default releases it, so a shorted bus cannot
    /// sink current through the pin.
    pub fn write_byte(&mut self, byte: u8, hold_power: bool) -> Result<(), L::Error> {
        let mut byte = byte;
        for _ in 0..8 {
            self.write_bit(byte & 0x01 == 0x01)?;
            byte >>= 1;
        }
        if !hold_power {
            self.line.release()?;
        }
        Ok(())
    }

    /// Writes a run of bytes; power-hold applies only after the final one.
    pub fn write_bytes(&mut self, bytes: &[u8], hold_power: bool) -> Result<(), L::Error> {
        for (i, byte) in bytes.iter().enumerate() {
            let last = i == bytes.len() - 1;
            self.write_byte(*byte, hold_power && last)?;
        }
        Ok(())
    }

    /// Reads one byte, LSB first.
    pub fn read_byte(&mut self) -> Result<u8, L::Error> {
        let mut byte = 0_u8;
        for _ in 0..8 {
            byte >>= 1;
            if self.read_bit()? {
                byte |= 0x80;
            }
        }
        Ok(byte)
    }

    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<(), L::Error> {
        for d in dst {
            *d = self.read_byte()?;
        }
        Ok(())
    }

    /// Addresses one device (Match ROM).
    pub fn select(&mut self, rom: &RomCode) -> Result<(), L::Error> {
        self.write_byte(Command::MatchRom.op_code(), false)?;
        self.write_bytes(rom.as_ref(), false)
    }

    /// Broadcasts to every device (Skip ROM). Transactions that read back
    /// are only sound with a single device on the line.
    pub fn skip(&mut self) -> Result<(), L::Error> {
        self.write_byte(Command::SkipRom.op_code(), false)
    }

    /// Releases the line if a previous write left it powered.
    pub fn depower(&mut self) -> Result<(), L::Error> {
        self.line.release()
    }

    /// Blocks for `ms` on the bus's own delay source.
    pub fn wait_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    /// Reset, write `write`, read back into `read`; no addressing phase.
    pub fn reset_write_read(
        &mut self,
        write: &[u8],
        read: &mut [u8],
    ) -> Result<(), Error<L::Error>> {
        if !self.reset()? {
            return Err(Error::NoPresence);
        }
        self.write_bytes(write, false)?;
        self.read_bytes(read)?;
        Ok(())
    }

    /// Reset, address `rom`, write `write`.
    pub fn reset_select_write(
        &mut self,
        rom: &RomCode,
        write: &[u8],
    ) -> Result<(), Error<L::Error>> {
        if !self.reset()? {
            return Err(Error::NoPresence);
        }
        self.select(rom)?;
        self.write_bytes(write, false)?;
        Ok(())
    }

    /// Reset, address `rom`, write `write`, read back into `read`.
    pub fn reset_select_write_read(
        &mut self,
        rom: &RomCode,
        write: &[u8],
        read: &mut [u8],
    ) -> Result<(), Error<L::Error>> {
        if !self.reset()? {
            return Err(Error::NoPresence);
        }
        self.select(rom)?;
        self.write_bytes(write, false)?;
        self.read_bytes(read)?;
        Ok(())
    }

    /// Reset, broadcast, write `write`.
    pub fn reset_skip_write(&mut self, write: &[u8]) -> Result<(), Error<L::Error>> {
        if !self.reset()? {
            return Err(Error::NoPresence);
        }
        self.skip()?;
        self.write_bytes(write, false)?;
        Ok(())
    }

    /// Reset, broadcast, write `write`, read back into `read`.
    pub fn reset_skip_write_read(
        &mut self,
        write: &[u8],
        read: &mut [u8],
    ) -> Result<(), Error<L::Error>> {
        if !self.reset()? {
            return Err(Error::NoPresence);
        }
        self.skip()?;
        self.write_bytes(write, false)?;
        self.read_bytes(read)?;
        Ok(())
    }
}
