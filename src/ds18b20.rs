//! DS18B20 digital thermometer sessions: convert, read back, decode.

use byteorder::{ByteOrder, LittleEndian};
use core::fmt::Debug;
use embedded_hal::delay::DelayNs;

use crate::{Bus, BusLine, Device, Error, OpCode, RomCode};

/// Function commands of the DS18B20 family.
#[derive(Clone, Copy, Debug)]
#[repr(u8)]
pub enum Command {
    Convert = 0x44,
    WriteScratchpad = 0x4E,
    ReadScratchpad = 0xBE,
    CopyScratchpad = 0x48,
    RecallE2 = 0xB8,
    ReadPowerSupply = 0xB4,
}

impl OpCode for Command {
    fn op_code(&self) -> u8 {
        *self as _
    }
}

/// Fixed conversion wait covering the worst case (12-bit) with margin.
pub const CONVERSION_WAIT_MS: u32 = 1000;

const SCRATCHPAD_BYTES: usize = 9;

/// ADC resolution, from bits 5-6 of the configuration register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Resolution {
    Bits9,
    Bits10,
    Bits11,
    Bits12,
}

impl Resolution {
    fn from_config(config: u8) -> Resolution {
        match config & 0x60 {
            0x00 => Resolution::Bits9,
            0x20 => Resolution::Bits10,
            0x40 => Resolution::Bits11,
            _ => Resolution::Bits12,
        }
    }

    fn config_bits(self) -> u8 {
        match self {
            Resolution::Bits9 => 0x1F,
            Resolution::Bits10 => 0x3F,
            Resolution::Bits11 => 0x5F,
            Resolution::Bits12 => 0x7F,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Resolution::Bits9 => 9,
            Resolution::Bits10 => 10,
            Resolution::Bits11 => 11,
            Resolution::Bits12 => 12,
        }
    }

    /// Conversion time at this resolution; a read issued earlier returns the
    /// previous conversion's value.
    pub fn time_ms(self) -> u16 {
        match self {
            Resolution::Bits9 => 94,
            Resolution::Bits10 => 188,
            Resolution::Bits11 => 375,
            Resolution::Bits12 => 750,
        }
    }

    // low raw bits are undefined below 12-bit resolution
    fn defined_mask(self) -> i16 {
        match self {
            Resolution::Bits9 => !0x07,
            Resolution::Bits10 => !0x03,
            Resolution::Bits11 => !0x01,
            Resolution::Bits12 => !0x00,
        }
    }
}

/// Checksum-verified image of the 9-byte device scratchpad.
#[derive(Clone, Copy, Debug)]
pub struct Scratchpad {
    raw: [u8; SCRATCHPAD_BYTES],
}

impl Scratchpad {
    /// Validates the trailing CRC and wraps the bytes.
    pub fn from_raw<E: Debug>(raw: [u8; SCRATCHPAD_BYTES]) -> Result<Self, Error<E>> {
        let computed = crate::crc8(&raw[..8]);
        if computed != raw[8] {
            return Err(Error::CrcMismatch(computed, raw[8]));
        }
        Ok(Scratchpad { raw })
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::from_config(self.raw[4])
    }

    /// Signed raw temperature with the resolution-dependent undefined low
    /// bits cleared. The device LSB is 1/16 °C.
    pub fn raw_temperature(&self) -> i16 {
        LittleEndian::read_i16(&self.raw[0..2]) & self.resolution().defined_mask()
    }

    /// Upper alarm threshold (T_H register), whole degrees.
    pub fn alarm_high(&self) -> i8 {
        self.raw[2] as i8
    }

    /// Lower alarm threshold (T_L register), whole degrees.
    pub fn alarm_low(&self) -> i8 {
        self.raw[3] as i8
    }

    /// Temperature in degrees Celsius.
    pub fn temperature(&self) -> f32 {
        self.raw_temperature() as f32 / 16.0
    }
}

/// One DS18B20 on the bus, addressed by its ROM code.
#[derive(Clone, Copy, Debug)]
pub struct Ds18b20 {
    rom: RomCode,
}

impl From<Ds18b20> for RomCode {
    fn from(device: Ds18b20) -> Self {
        device.rom
    }
}

impl Device for Ds18b20 {
    const FAMILY_CODE: u8 = 0x28;

    fn rom(&self) -> &RomCode {
        &self.rom
    }

    unsafe fn from_rom_unchecked(rom: RomCode) -> Self {
        Ds18b20 { rom }
    }
}

impl Ds18b20 {
    /// Begins a temperature conversion (Convert T).
    pub fn start_conversion<L: BusLine, D: DelayNs>(
        &self,
        bus: &mut Bus<L, D>,
    ) -> Result<(), Error<L::Error>> {
        bus.reset_select_write(&self.rom, &[Command::Convert.op_code()])
    }

    /// Reads and verifies the scratchpad.
    ///
    /// All nine bytes are consumed even though a temperature needs only the
    /// first two, keeping the device's read pointer in step with the
    /// protocol for whatever transaction follows.
    pub fn read_scratchpad<L: BusLine, D: DelayNs>(
        &self,
        bus: &mut Bus<L, D>,
    ) -> Result<Scratchpad, Error<L::Error>> {
        let mut raw = [0u8; SCRATCHPAD_BYTES];
        bus.reset_select_write_read(&self.rom, &[Command::ReadScratchpad.op_code()], &mut raw)?;
        Scratchpad::from_raw(raw)
    }

    /// One full acquisition: convert, wait out the worst case, read the
    /// scratchpad in a fresh transaction and decode degrees Celsius.
    pub fn read_temperature<L: BusLine, D: DelayNs>(
        &self,
        bus: &mut Bus<L, D>,
    ) -> Result<f32, Error<L::Error>> {
        self.start_conversion(bus)?;
        bus.wait_ms(CONVERSION_WAIT_MS);
        Ok(self.read_scratchpad(bus)?.temperature())
    }

    /// Sets the alarm thresholds and resolution (Write Scratchpad).
    pub fn configure<L: BusLine, D: DelayNs>(
        &self,
        bus: &mut Bus<L, D>,
        alarm_high: i8,
        alarm_low: i8,
        resolution: Resolution,
    ) -> Result<(), Error<L::Error>> {
        bus.reset_select_write(
            &self.rom,
            &[
                Command::WriteScratchpad.op_code(),
                alarm_high as u8,
                alarm_low as u8,
                resolution.config_bits(),
            ],
        )
    }
}

/// Starts a conversion on every device at once (Skip ROM + Convert T).
pub fn start_conversion_all<L: BusLine, D: DelayNs>(
    bus: &mut Bus<L, D>,
) -> Result<(), Error<L::Error>> {
    bus.reset_skip_write(&[Command::Convert.op_code()])
}

/// Reads the scratchpad without addressing; single device only.
pub fn read_scratchpad_single<L: BusLine, D: DelayNs>(
    bus: &mut Bus<L, D>,
) -> Result<Scratchpad, Error<L::Error>> {
    let mut raw = [0u8; SCRATCHPAD_BYTES];
    bus.reset_skip_write_read(&[Command::ReadScratchpad.op_code()], &mut raw)?;
    Scratchpad::from_raw(raw)
}

/// One full acquisition via Skip ROM; single device only.
pub fn read_temperature_single<L: BusLine, D: DelayNs>(
    bus: &mut Bus<L, D>,
) -> Result<f32, Error<L::Error>> {
    start_conversion_all(bus)?;
    bus.wait_ms(CONVERSION_WAIT_MS);
    Ok(read_scratchpad_single(bus)?.temperature())
}

/// Splits a raw reading into whole degrees and ten-thousandths of a degree.
///
/// Original value = whole + fraction / 10000; avoids floating point on
/// targets without an FPU.
pub fn degrees_parts(raw: i16) -> (i16, i16) {
    (raw / 16, (raw % 16) * 625)
}

#[cfg(test)]
mod tests {
    use super::{
        degrees_parts, read_scratchpad_single, read_temperature_single, start_conversion_all,
        Ds18b20, Resolution, Scratchpad,
    };
    use crate::sim::{self, SimDevice};
    use crate::{crc8, Device, Error, RomCode};
    use core::convert::Infallible;

    fn rom(serial: [u8; 6]) -> [u8; 8] {
        let mut rom = [0u8; 8];
        rom[0] = 0x28;
        rom[1..7].copy_from_slice(&serial);
        rom[7] = crc8(&rom[..7]);
        rom
    }

    fn scratchpad(raw: i16, config: u8) -> [u8; 9] {
        let temp = (raw as u16).to_le_bytes();
        let mut sp = [temp[0], temp[1], 0x4B, 0x46, config, 0xFF, 0x0C, 0x10, 0x00];
        sp[8] = crc8(&sp[..8]);
        sp
    }

    #[test]
    fn decodes_positive_reading_at_full_resolution() {
        let sp = Scratchpad::from_raw::<Infallible>(scratchpad(0x0191, 0x7F)).unwrap();
        assert_eq!(sp.resolution(), Resolution::Bits12);
        assert_eq!(sp.raw_temperature(), 0x0191);
        assert_eq!(sp.temperature(), 25.0625);
    }

    #[test]
    fn decodes_negative_reading() {
        let sp = Scratchpad::from_raw::<Infallible>(scratchpad(-1, 0x7F)).unwrap();
        assert_eq!(sp.temperature(), -0.0625);
    }

    #[test]
    fn masks_undefined_bits_below_full_resolution() {
        // 9-bit: the low 3 raw bits are undefined and must read as zero
        let sp = Scratchpad::from_raw::<Infallible>(scratchpad(0x000B, 0x1F)).unwrap();
        assert_eq!(sp.resolution(), Resolution::Bits9);
        assert_eq!(sp.raw_temperature(), 0x0008);
        assert_eq!(sp.temperature(), 0.5);

        let sp = Scratchpad::from_raw::<Infallible>(scratchpad(0x000B, 0x3F)).unwrap();
        assert_eq!(sp.raw_temperature(), 0x0008);
        let sp = Scratchpad::from_raw::<Infallible>(scratchpad(0x000B, 0x5F)).unwrap();
        assert_eq!(sp.raw_temperature(), 0x000A);
    }

    #[test]
    fn rejects_corrupted_scratchpad() {
        let mut raw = scratchpad(0x0191, 0x7F);
        raw[1] ^= 0x40;
        assert!(matches!(
            Scratchpad::from_raw::<Infallible>(raw),
            Err(Error::CrcMismatch(_, _))
        ));
    }

    #[test]
    fn alarm_thresholds_are_signed() {
        let mut raw = scratchpad(0, 0x7F);
        raw[2] = 30;
        raw[3] = -10i8 as u8;
        raw[8] = crc8(&raw[..8]);
        let sp = Scratchpad::from_raw::<Infallible>(raw).unwrap();
        assert_eq!(sp.alarm_high(), 30);
        assert_eq!(sp.alarm_low(), -10);
    }

    #[test]
    fn parts_split_matches_datasheet_table() {
        assert_eq!(degrees_parts(0x07D0), (125, 0));
        assert_eq!(degrees_parts(0x0550), (85, 0));
        assert_eq!(degrees_parts(0x0191), (25, 625)); // 25.0625
        assert_eq!(degrees_parts(0x00A2), (10, 1250)); // 10.125
        assert_eq!(degrees_parts(0x0008), (0, 5000)); // 0.5
        assert_eq!(degrees_parts(0x0000), (0, 0));
        assert_eq!(degrees_parts(-0x0008), (0, -5000)); // -0.5
        assert_eq!(degrees_parts(-0x00A2), (-10, -1250)); // -10.125
        assert_eq!(degrees_parts(-0x0191), (-25, -625)); // -25.0625
        assert_eq!(degrees_parts(-0x0370), (-55, 0));
    }

    #[test]
    fn full_acquisition_over_the_simulated_bus() {
        let code = rom([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let (mut bus, wire) = sim::bus(vec![
            SimDevice::new(code).with_scratchpad(scratchpad(0x0191, 0x7F))
        ]);

        let sensor = Ds18b20::search_first(&mut bus).unwrap().unwrap();
        assert_eq!(**sensor.rom(), code);

        let before = wire.elapsed_us();
        let celsius = sensor.read_temperature(&mut bus).unwrap();
        assert_eq!(celsius, 25.0625);
        // the conversion wait dominates the transaction
        assert!(wire.elapsed_us() - before >= 1_000_000);
    }

    #[test]
    fn acquisition_discards_corrupted_scratchpad() {
        let code = rom([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let mut bad = scratchpad(0x0191, 0x7F);
        bad[8] ^= 0xFF;
        let (mut bus, _) = sim::bus(vec![SimDevice::new(code).with_scratchpad(bad)]);

        let sensor = Ds18b20::from_rom::<Infallible>(RomCode::from(code)).unwrap();
        assert!(matches!(
            sensor.read_temperature(&mut bus),
            Err(Error::CrcMismatch(_, _))
        ));
    }

    #[test]
    fn skip_rom_acquisition_on_a_single_drop_bus() {
        let code = rom([0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let (mut bus, _) = sim::bus(vec![
            SimDevice::new(code).with_scratchpad(scratchpad(-1, 0x7F))
        ]);

        assert_eq!(read_temperature_single(&mut bus).unwrap(), -0.0625);

        let sp = read_scratchpad_single(&mut bus).unwrap();
        assert_eq!(sp.raw_temperature(), -1);
    }

    #[test]
    fn sessions_fail_fast_without_presence() {
        let (mut bus, _) = sim::bus(vec![]);
        let sensor = Ds18b20::from_rom::<Infallible>(RomCode::from(rom([0; 6]))).unwrap();
        assert!(matches!(
            sensor.start_conversion(&mut bus),
            Err(Error::NoPresence)
        ));
        assert!(matches!(
            start_conversion_all(&mut bus),
            Err(Error::NoPresence)
        ));
    }

    #[test]
    fn configure_rewrites_thresholds_and_resolution() {
        let code = rom([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let (mut bus, wire) = sim::bus(vec![SimDevice::new(code)]);

        let sensor = Ds18b20::from_rom::<Infallible>(RomCode::from(code)).unwrap();
        sensor.configure(&mut bus, 30, -10, Resolution::Bits9).unwrap();

        let written = wire.scratchpad(0);
        assert_eq!(written[2], 30);
        assert_eq!(written[3], -10i8 as u8);
        assert_eq!(written[4], 0x1F);

        let sp = sensor.read_scratchpad(&mut bus).unwrap();
        assert_eq!(sp.resolution(), Resolution::Bits9);
        assert_eq!(sp.alarm_high(), 30);
        assert_eq!(sp.alarm_low(), -10);
    }

    #[test]
    fn family_gate_rejects_foreign_devices() {
        let mut foreign = [0u8; 8];
        foreign[0] = 0x10;
        foreign[7] = crc8(&foreign[..7]);
        assert!(matches!(
            Ds18b20::from_rom::<Infallible>(RomCode::from(foreign)),
            Err(Error::FamilyMismatch(0x28, 0x10))
        ));
    }

    #[test]
    fn resolution_table() {
        assert_eq!(Resolution::Bits9.bits(), 9);
        assert_eq!(Resolution::Bits12.bits(), 12);
        assert_eq!(Resolution::Bits9.time_ms(), 94);
        assert_eq!(Resolution::Bits10.time_ms(), 188);
        assert_eq!(Resolution::Bits11.time_ms(), 375);
        assert_eq!(Resolution::Bits12.time_ms(), 750);
    }
}
