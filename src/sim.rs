//! Virtual-time simulation of an open-drain 1-Wire bus for hosted tests.
//!
//! [`SimLine`] and [`SimDelay`] share one wire cell: delays advance a
//! microsecond clock instead of sleeping, and device models react to the
//! master's edges the way real slaves react to slot waveforms. A low pulse
//! is classified by its length when the master releases it (reset pulse,
//! write-1/read slot, or write-0 slot), which is exactly the information a
//! real device's edge detector has.

use std::cell::RefCell;
use std::rc::Rc;

use embedded_hal::delay::DelayNs;

use crate::{crc8, Bus, BusLine};
use core::convert::Infallible;

// Pulse classification thresholds and response windows (µs).
const RESET_THRESHOLD_US: u64 = 400;
const WRITE_ONE_MAX_US: u64 = 15;
const SLOT_PULL_US: u64 = 30;
const PRESENCE_DELAY_US: u64 = 20;
const PRESENCE_HOLD_US: u64 = 90;

#[derive(Clone, Copy, PartialEq)]
enum MasterDrive {
    Low,
    High,
    Released,
}

#[derive(Clone, Copy)]
enum DeviceState {
    /// Out of the current transaction until the next reset pulse.
    Dropped,
    /// Collecting a ROM-level command byte.
    RomCommand,
    /// Search walk: triples of (transmit bit, transmit complement, receive
    /// direction) per ROM bit position.
    Search { position: u8, phase: u8 },
    /// Match ROM: comparing 64 incoming address bits.
    MatchRom { position: u8 },
    /// Read ROM: transmitting the 64 address bits.
    ReadRom { position: u8 },
    /// Collecting a function command byte after selection.
    FnCommand,
    /// Transmitting the 9-byte scratchpad.
    ReadScratchpad { position: u8 },
    /// Receiving the three Write Scratchpad payload bytes.
    WriteScratchpad { count: u8 },
}

pub struct SimDevice {
    rom: [u8; 8],
    scratchpad: [u8; 9],
    alarmed: bool,
    state: DeviceState,
    rx: u8,
    rx_bits: u8,
    pull_from: u64,
    pull_until: u64,
}

impl SimDevice {
    pub fn new(rom: [u8; 8]) -> SimDevice {
        // power-on reset value: +85 °C, 12-bit
        let mut scratchpad = [0x50, 0x05, 0x4B, 0x46, 0x7F, 0xFF, 0x0C, 0x10, 0x00];
        scratchpad[8] = crc8(&scratchpad[..8]);
        SimDevice {
            rom,
            scratchpad,
            alarmed: false,
            state: DeviceState::Dropped,
            rx: 0,
            rx_bits: 0,
            pull_from: 0,
            pull_until: 0,
        }
    }

    pub fn with_scratchpad(mut self, bytes: [u8; 9]) -> SimDevice {
        self.scratchpad = bytes;
        self
    }

    pub fn alarmed(mut self) -> SimDevice {
        self.alarmed = true;
        self
    }

    fn rom_bit(&self, position: u8) -> bool {
        self.rom[(position / 8) as usize] & (1 << (position % 8)) != 0
    }

    fn scratchpad_bit(&self, position: u8) -> bool {
        self.scratchpad[(position / 8) as usize] & (1 << (position % 8)) != 0
    }

    fn pulling(&self, now: u64) -> bool {
        self.pull_from <= now && now < self.pull_until
    }

    fn on_reset(&mut self, released_at: u64) {
        self.state = DeviceState::RomCommand;
        self.rx = 0;
        self.rx_bits = 0;
        self.pull_from = released_at + PRESENCE_DELAY_US;
        self.pull_until = released_at + PRESENCE_HOLD_US;
    }

    /// Accumulates one received bit, LSB first; true when a byte is complete.
    fn collect(&mut self, bit: bool) -> bool {
        if bit {
            self.rx |= 1 << self.rx_bits;
        }
        self.rx_bits += 1;
        self.rx_bits == 8
    }

    fn rx_take(&mut self) -> u8 {
        let byte = self.rx;
        self.rx = 0;
        self.rx_bits = 0;
        byte
    }

    /// Sending a 0 means holding the line down over the sample point.
    fn transmit(&mut self, bit: bool, fell_at: u64) {
        if !bit {
            self.pull_from = fell_at;
            self.pull_until = fell_at + SLOT_PULL_US;
        }
    }

    /// Advances the protocol state machine by one time slot.
    fn on_slot(&mut self, fell_at: u64, master_bit: bool) {
        match self.state {
            DeviceState::Dropped => {}
            DeviceState::RomCommand => {
                if self.collect(master_bit) {
                    self.state = match self.rx_take() {
                        0xF0 => DeviceState::Search { position: 0, phase: 0 },
                        0xEC if self.alarmed => DeviceState::Search { position: 0, phase: 0 },
                        0x55 => DeviceState::MatchRom { position: 0 },
                        0xCC => DeviceState::FnCommand,
                        0x33 => DeviceState::ReadRom { position: 0 },
                        _ => DeviceState::Dropped,
                    };
                }
            }
            DeviceState::Search { position, phase } => match phase {
                0 => {
                    let bit = self.rom_bit(position);
                    self.transmit(bit, fell_at);
                    self.state = DeviceState::Search { position, phase: 1 };
                }
                1 => {
                    let bit = self.rom_bit(position);
                    self.transmit(!bit, fell_at);
                    self.state = DeviceState::Search { position, phase: 2 };
                }
                _ => {
                    if master_bit != self.rom_bit(position) {
                        self.state = DeviceState::Dropped;
                    } else if position == 63 {
                        // sole survivor of the walk is selected
                        self.state = DeviceState::FnCommand;
                    } else {
                        self.state = DeviceState::Search {
                            position: position + 1,
                            phase: 0,
                        };
                    }
                }
            },
            DeviceState::MatchRom { position } => {
                if master_bit != self.rom_bit(position) {
                    self.state = DeviceState::Dropped;
                } else if position == 63 {
                    self.state = DeviceState::FnCommand;
                } else {
                    self.state = DeviceState::MatchRom {
                        position: position + 1,
                    };
                }
            }
            DeviceState::ReadRom { position } => {
                let bit = self.rom_bit(position);
                self.transmit(bit, fell_at);
                if position == 63 {
                    self.state = DeviceState::FnCommand;
                } else {
                    self.state = DeviceState::ReadRom {
                        position: position + 1,
                    };
                }
            }
            DeviceState::FnCommand => {
                if self.collect(master_bit) {
                    self.state = match self.rx_take() {
                        0xBE => DeviceState::ReadScratchpad { position: 0 },
                        0x4E => DeviceState::WriteScratchpad { count: 0 },
                        // Convert T runs internally; the scratchpad already
                        // holds this simulated device's reading
                        _ => DeviceState::Dropped,
                    };
                }
            }
            DeviceState::ReadScratchpad { position } => {
                let bit = self.scratchpad_bit(position);
                self.transmit(bit, fell_at);
                if position == 71 {
                    self.state = DeviceState::Dropped;
                } else {
                    self.state = DeviceState::ReadScratchpad {
                        position: position + 1,
                    };
                }
            }
            DeviceState::WriteScratchpad { count } => {
                if self.collect(master_bit) {
                    self.scratchpad[2 + count as usize] = self.rx_take();
                    if count == 2 {
                        // the device maintains its own scratchpad checksum
                        self.scratchpad[8] = crc8(&self.scratchpad[..8]);
                        self.state = DeviceState::Dropped;
                    } else {
                        self.state = DeviceState::WriteScratchpad { count: count + 1 };
                    }
                }
            }
        }
    }
}

struct SimWire {
    now: u64,
    drive: MasterDrive,
    fell_at: u64,
    stuck_low: bool,
    devices: Vec<SimDevice>,
}

impl SimWire {
    fn set_drive(&mut self, drive: MasterDrive) {
        if self.drive == drive {
            return;
        }
        let was_low = self.drive == MasterDrive::Low;
        self.drive = drive;
        if drive == MasterDrive::Low {
            self.fell_at = self.now;
        } else if was_low {
            self.pulse_end();
        }
    }

    /// Classifies the low pulse that just ended and feeds it to the devices.
    fn pulse_end(&mut self) {
        let held = self.now - self.fell_at;
        if held >= RESET_THRESHOLD_US {
            let released_at = self.now;
            for device in &mut self.devices {
                device.on_reset(released_at);
            }
        } else {
            let master_bit = held <= WRITE_ONE_MAX_US;
            let fell_at = self.fell_at;
            for device in &mut self.devices {
                device.on_slot(fell_at, master_bit);
            }
        }
    }

    fn level(&self) -> bool {
        if self.stuck_low {
            return false;
        }
        match self.drive {
            MasterDrive::Low => false,
            MasterDrive::High => true,
            MasterDrive::Released => {
                let now = self.now;
                !self.devices.iter().any(|device| device.pulling(now))
            }
        }
    }
}

pub struct SimLine(Rc<RefCell<SimWire>>);

impl BusLine for SimLine {
    type Error = Infallible;

    fn drive_low(&mut self) -> Result<(), Infallible> {
        self.0.borrow_mut().set_drive(MasterDrive::Low);
        Ok(())
    }

    fn drive_high(&mut self) -> Result<(), Infallible> {
        self.0.borrow_mut().set_drive(MasterDrive::High);
        Ok(())
    }

    fn release(&mut self) -> Result<(), Infallible> {
        self.0.borrow_mut().set_drive(MasterDrive::Released);
        Ok(())
    }

    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.0.borrow().level())
    }
}

pub struct SimDelay(Rc<RefCell<SimWire>>);

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        // round up so sub-microsecond waits still advance the clock
        self.0.borrow_mut().now += (ns as u64 + 999) / 1000;
    }

    fn delay_us(&mut self, us: u32) {
        self.0.borrow_mut().now += us as u64;
    }

    fn delay_ms(&mut self, ms: u32) {
        self.0.borrow_mut().now += ms as u64 * 1000;
    }
}

/// Observer handle for assertions after the master has run.
pub struct SimHandle(Rc<RefCell<SimWire>>);

impl SimHandle {
    pub fn scratchpad(&self, device: usize) -> [u8; 9] {
        self.0.borrow().devices[device].scratchpad
    }

    pub fn elapsed_us(&self) -> u64 {
        self.0.borrow().now
    }
}

/// Builds a bus master wired to the given simulated devices.
pub fn bus(devices: Vec<SimDevice>) -> (Bus<SimLine, SimDelay>, SimHandle) {
    let wire = Rc::new(RefCell::new(SimWire {
        now: 0,
        drive: MasterDrive::Released,
        fell_at: 0,
        stuck_low: false,
        devices,
    }));
    (
        Bus::new(SimLine(wire.clone()), SimDelay(wire.clone())),
        SimHandle(wire),
    )
}

/// A bus whose line is shorted to ground.
pub fn stuck_low_bus() -> (Bus<SimLine, SimDelay>, SimHandle) {
    let wire = Rc::new(RefCell::new(SimWire {
        now: 0,
        drive: MasterDrive::Released,
        fell_at: 0,
        stuck_low: true,
        devices: Vec::new(),
    }));
    (
        Bus::new(SimLine(wire.clone()), SimDelay(wire.clone())),
        SimHandle(wire),
    )
}
