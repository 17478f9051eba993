//! The boundary between the Iono Pi driver and the Raspberry Pi hardware.
//!
//! Everything timing-sensitive in the driver sits behind the [`Hardware`] trait so that
//! it can be driven by [`RppalHardware`] on a real board or by a mock in tests.

use std::{
    collections::{HashMap, hash_map::Entry},
    hint,
    sync::{Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info};
use rppal::{
    gpio::{Gpio, InputPin, IoPin, Mode as PinMode, OutputPin, Trigger},
    spi::{Bus, Mode, SlaveSelect, Spi},
};

use crate::{AnalogInput, Level, Result, maxdetect::MaxDetectFrame};

/// Direction of a transition seen on a monitored line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    /// Low to high.
    Rising,
    /// High to low.
    Falling,
}

impl Edge {
    /// The level the line is at immediately after this edge.
    pub fn level(self) -> Level {
        match self {
            Edge::Rising => Level::High,
            Edge::Falling => Level::Low,
        }
    }
}

/// A transition on a monitored line, delivered to an [`EdgeHandler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdgeEvent {
    /// Direction of the transition.
    pub edge: Edge,
    /// When it happened, on the clock reported by [`Hardware::now()`].
    pub timestamp: Duration,
}

/// Handler invoked for every edge on a watched line.
///
/// Handlers run on whatever thread the hardware delivers interrupts on and must not
/// call back into the [`Hardware`] that invoked them.
pub type EdgeHandler = Box<dyn FnMut(EdgeEvent) + Send>;

/// Line-level access to the board.
///
/// GPIO numbers are BCM numbers.
pub trait Hardware: Send + Sync {
    /// Read the instantaneous level of an input line.
    fn read(&self, gpio: u8) -> Result<Level>;

    /// Drive an output line.
    fn write(&self, gpio: u8, level: Level) -> Result<()>;

    /// Watch a line for transitions on both edges, replacing any existing handler.
    fn watch(&self, gpio: u8, handler: EdgeHandler) -> Result<()>;

    /// Stop watching a line. Permitted on a line that isn't being watched.
    fn unwatch(&self, gpio: u8) -> Result<()>;

    /// Perform a single-ended 12-bit conversion on one of the analog inputs.
    fn analog_read(&self, input: AnalogInput) -> Result<u16>;

    /// Run one MaxDetect exchange on a line: send the start pulse and clock in the
    /// sensor's 40 bits.
    ///
    /// Returns `None` if the sensor didn't answer or the exchange took too long. The
    /// checksum is not checked here.
    fn max_detect_read(&self, gpio: u8) -> Result<Option<MaxDetectFrame>>;

    /// Monotonic time on the same clock as [`EdgeEvent::timestamp`].
    fn now(&self) -> Duration;
}

//--------------------------------------------------------------------------------------
/// [`Hardware`] implemented on the Raspberry Pi's GPIO and SPI through `rppal`.
///
/// Input pins are acquired lazily and kept for the lifetime of the instance. Output
/// pins are kept too, and are not reset when dropped so that relays hold their state
/// after the program exits.
///
/// Edge timestamps are the kernel's, taken on `CLOCK_MONOTONIC` when the interrupt
/// fired, and [`Hardware::now()`] reads the same clock.
pub struct RppalHardware {
    gpio: Gpio,
    inputs: Mutex<HashMap<u8, InputPin>>,
    outputs: Mutex<HashMap<u8, OutputPin>>,
    spi: Mutex<Spi>,
}

impl RppalHardware {
    /// SPI clock used to talk to the MCP3204.
    pub const ADC_SPI_CLOCK: u32 = 50_000;

    /// Open the GPIO peripheral and the ADC's SPI bus (SPI0, CE0).
    pub fn new() -> Result<Self> {
        let gpio = Gpio::new()?;
        let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, Self::ADC_SPI_CLOCK, Mode::Mode0)?;
        info!("Opened Raspberry Pi GPIO and SPI0 for Iono Pi");
        Ok(RppalHardware {
            gpio,
            inputs: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            spi: Mutex::new(spi),
        })
    }

    fn inputs(&self) -> MutexGuard<'_, HashMap<u8, InputPin>> {
        self.inputs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Hardware for RppalHardware {
    fn read(&self, gpio: u8) -> Result<Level> {
        let mut inputs = self.inputs();
        if let Some(pin) = inputs.get(&gpio) {
            return Ok(pin.read());
        }
        let pin = self.gpio.get(gpio)?.into_input();
        let level = pin.read();
        inputs.insert(gpio, pin);
        Ok(level)
    }

    fn write(&self, gpio: u8, level: Level) -> Result<()> {
        let mut outputs = self.outputs.lock().unwrap_or_else(|e| e.into_inner());
        let pin = match outputs.entry(gpio) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut pin = self.gpio.get(gpio)?.into_output();
                pin.set_reset_on_drop(false);
                entry.insert(pin)
            }
        };
        pin.write(level);
        Ok(())
    }

    fn watch(&self, gpio: u8, mut handler: EdgeHandler) -> Result<()> {
        let mut inputs = self.inputs();
        let pin = match inputs.entry(gpio) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(self.gpio.get(gpio)?.into_input())
            }
        };
        pin.set_async_interrupt(Trigger::Both, None, move |event| {
            let edge = match event.trigger {
                Trigger::RisingEdge => Edge::Rising,
                Trigger::FallingEdge => Edge::Falling,
                _ => return,
            };
            handler(EdgeEvent {
                edge,
                timestamp: event.timestamp,
            });
        })?;
        debug!("Watching GPIO {gpio} on both edges");
        Ok(())
    }

    fn unwatch(&self, gpio: u8) -> Result<()> {
        if let Some(pin) = self.inputs().get_mut(&gpio) {
            pin.clear_async_interrupt()?;
            debug!("Stopped watching GPIO {gpio}");
        }
        Ok(())
    }

    fn analog_read(&self, input: AnalogInput) -> Result<u16> {
        // See the MCP3204 datasheet (DS21298) page 18:
        //
        //   1st byte: 0 0 0 0 0 1 SGL/DIFF D2 = 0 0 0 0 0 1 1 0
        //   2nd byte: D1 D0 X X X X X X
        //   3rd byte: X X X X X X X X
        let request = [0b0000_0110, input.channel_bits(), 0x00];
        let mut response = [0u8; 3];
        self.spi
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .transfer(&mut response, &request)?;
        Ok((u16::from(response[1] & 0x0F) << 8) | u16::from(response[2]))
    }

    fn max_detect_read(&self, gpio: u8) -> Result<Option<MaxDetectFrame>> {
        // Held for the whole exchange so nothing else can claim the pin meanwhile.
        let mut inputs = self.inputs();
        if inputs.remove(&gpio).is_some() {
            debug!("Released GPIO {gpio} input for MaxDetect read");
        }
        let mut pin = self.gpio.get(gpio)?.into_io(PinMode::Output);
        Ok(max_detect_exchange(&mut pin))
    }

    fn now(&self) -> Duration {
        monotonic_now()
    }
}

/// Time since boot on `CLOCK_MONOTONIC`, the clock the kernel stamps GPIO events with.
fn monotonic_now() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec and CLOCK_MONOTONIC is always
    // available on Linux.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

//--------------------------------------------------------------------------------------
// MaxDetect bit-banging. Times are from the RHT03 datasheet: the host holds the line
// low to wake the sensor, which answers with 80us low / 80us high and then sends each
// bit as 50us low followed by 26us high for a 0 or 70us high for a 1.

const START_LOW: Duration = Duration::from_millis(10);
const START_HIGH: Duration = Duration::from_micros(40);
const EDGE_TIMEOUT: Duration = Duration::from_millis(1);
const SAMPLE_DELAY: Duration = Duration::from_micros(30);
const EXCHANGE_LIMIT: Duration = Duration::from_millis(16);

fn max_detect_exchange(pin: &mut IoPin) -> Option<MaxDetectFrame> {
    pin.set_low();
    thread::sleep(START_LOW);
    pin.set_high();
    spin(START_HIGH);
    pin.set_mode(PinMode::Input);

    let started = Instant::now();
    wait_low_high(pin)?;
    let mut frame = MaxDetectFrame::default();
    for byte in &mut frame {
        for _ in 0..8 {
            wait_low_high(pin)?;
            spin(SAMPLE_DELAY);
            *byte = (*byte << 1) | u8::from(pin.read() == Level::High);
        }
    }

    let took = started.elapsed();
    if took > EXCHANGE_LIMIT {
        debug!("MaxDetect exchange took {took:?}");
        return None;
    }
    Some(frame)
}

/// Wait for the line to be pulled low and then released.
fn wait_low_high(pin: &IoPin) -> Option<()> {
    wait_for(pin, Level::Low)?;
    wait_for(pin, Level::High)
}

fn wait_for(pin: &IoPin, level: Level) -> Option<()> {
    let deadline = Instant::now() + EDGE_TIMEOUT;
    while pin.read() != level {
        if Instant::now() > deadline {
            return None;
        }
        hint::spin_loop();
    }
    Some(())
}

/// Busy-wait: `thread::sleep` can't be trusted at microsecond scale.
fn spin(duration: Duration) {
    let until = Instant::now() + duration;
    while Instant::now() < until {
        hint::spin_loop();
    }
}
