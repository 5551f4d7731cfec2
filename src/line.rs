use core::fmt::Debug;
use embedded_hal::digital::{ErrorType, InputPin, OutputPin};

/// Capability contract for the physical bus line.
///
/// The master needs three pin states: actively driven low, actively driven
/// high (slot recovery between low pulses), and released to a floating input
/// so that the pull-up or a device controls the level. Hosts whose pins are
/// configured open-drain satisfy `drive_high` and `release` with the same
/// operation.
pub trait BusLine {
    type Error: Debug;

    /// Pulls the line to ground.
    fn drive_low(&mut self) -> Result<(), Self::Error>;

    /// Actively drives the line high.
    fn drive_high(&mut self) -> Result<(), Self::Error>;

    /// Stops driving; the pull-up raises the line unless a device holds it low.
    fn release(&mut self) -> Result<(), Self::Error>;

    /// Samples the line level.
    fn is_high(&mut self) -> Result<bool, Self::Error>;

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.is_high()?)
    }
}

/// Single line on one open-drain pin; `set_high` releases to the pull-up.
impl<IO> BusLine for (IO,)
where
    IO: ErrorType + OutputPin + InputPin,
{
    type Error = IO::Error;

    fn drive_low(&mut self) -> Result<(), Self::Error> {
        self.0.set_low()
    }

    fn drive_high(&mut self) -> Result<(), Self::Error> {
        self.0.set_high()
    }

    fn release(&mut self) -> Result<(), Self::Error> {
        self.0.set_high()
    }

    fn is_high(&mut self) -> Result<bool, Self::Error> {
        self.0.is_high()
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.0.is_low()
    }
}

/// Split line: separate sense input and open-drain drive output.
impl<E, I, O> BusLine for (I, O)
where
    E: Debug,
    I: ErrorType<Error = E> + InputPin,
    O: ErrorType<Error = E> + OutputPin,
{
    type Error = E;

    fn drive_low(&mut self) -> Result<(), Self::Error> {
        self.1.set_low()
    }

    fn drive_high(&mut self) -> Result<(), Self::Error> {
        self.1.set_high()
    }

    fn release(&mut self) -> Result<(), Self::Error> {
        self.1.set_high()
    }

    fn is_high(&mut self) -> Result<bool, Self::Error> {
        self.0.is_high()
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.0.is_low()
    }
}
