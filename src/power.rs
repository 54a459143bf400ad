//! Power and pin control primitives (§4.8).
//!
//! Powering down disables the SPI peripheral, tristates the SPI pins and
//! drops the SD VDD rail; powering up reverses that and waits briefly for
//! the rail to settle. All pin/register writes are local to an
//! implementation of [`PowerControl`] — the rest of the core speaks only
//! through `power_up`/`power_down`.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

/// How long to wait, in microseconds, for VDD to settle after power-up.
pub const POWER_UP_SETTLE_US: u32 = 1_000;

/// The high-power / low-power primitives the supervisor drives on its state
/// transitions.
///
/// Implementations own whatever SPI-enable and VDD-gate pins the target
/// board wires up; the supervisor never touches them directly.
pub trait PowerControl {
    /// Error type for pin/peripheral faults.
    type Error: core::fmt::Debug;

    /// Disable the SPI peripheral, tristate its pins, and drop the card's
    /// VDD rail to its low level.
    fn power_down(&mut self) -> Result<(), Self::Error>;

    /// Raise VDD, wait for the supply to settle, then re-enable the SPI
    /// peripheral and drive its pins.
    fn power_up(&mut self) -> Result<(), Self::Error>;
}

/// A [`PowerControl`] built from a VDD-gate [`OutputPin`] and a delay
/// source. Does not attempt to manage SPI peripheral enable/tristate bits
/// directly, since those are bus-implementation specific; boards that need
/// to gate the SPI peripheral itself should wrap this with their own
/// [`PowerControl`] impl.
pub struct GpioPowerControl<VDD, DELAY> {
    vdd: VDD,
    delay: DELAY,
}

impl<VDD, DELAY> GpioPowerControl<VDD, DELAY>
where
    VDD: OutputPin,
    DELAY: DelayNs,
{
    /// Build a power control from the VDD-gate pin and a delay source. VDD
    /// starts low (card unpowered).
    pub fn new(mut vdd: VDD, delay: DELAY) -> Result<Self, VDD::Error> {
        vdd.set_low()?;
        Ok(Self { vdd, delay })
    }
}

impl<VDD, DELAY> PowerControl for GpioPowerControl<VDD, DELAY>
where
    VDD: OutputPin,
    DELAY: DelayNs,
{
    type Error = VDD::Error;

    fn power_down(&mut self) -> Result<(), Self::Error> {
        self.vdd.set_low()
    }

    fn power_up(&mut self) -> Result<(), Self::Error> {
        self.vdd.set_high()?;
        self.delay.delay_us(POWER_UP_SETTLE_US);
        Ok(())
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
