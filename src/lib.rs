#![deny(missing_docs)]
#![doc = include_str!("../README.md")]
//!
//! ## Extended example
//!
//! This example is available in `${CARGO_MANIFEST_DIR}/demos/wiegand-read.rs`.
//!
//! ``` rust no_run
#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/demos/wiegand-read.rs"))]
//! ```

use std::{
    io,
    path::PathBuf,
    result,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use log::{debug, info, warn};
use thiserror::Error;

pub mod debounce;
pub mod hardware;
pub mod maxdetect;
#[cfg(any(test, feature = "mockgpio"))]
pub mod mock;
pub mod onewire;
mod pins;
pub mod wiegand;

pub use debounce::{DebounceController, DigitalCallback, EdgeMode};
pub use hardware::{Edge, EdgeEvent, EdgeHandler, Hardware, RppalHardware};
#[cfg(any(test, feature = "mockgpio"))]
use mock::MockHardware;
pub use maxdetect::MaxDetectFrame;
pub use onewire::OneWireBus;
pub use pins::{AnalogInput, Input, Output, WiegandInterface};
pub use wiegand::{Credential, Frame, Wiegand, WiegandTiming};

/// Re-export of the `rppal` level type used throughout this crate's APIs.
pub use rppal::gpio::Level;

//--------------------------------------------------------------------------------------

/// Errors that operation of the Iono Pi can raise.
#[derive(Error, Debug)]
pub enum IonoPiError {
    /// Errors accessing the Raspberry Pi's GPIO.
    #[error("GPIO error")]
    GpioError {
        /// Underlying error source.
        #[from]
        source: rppal::gpio::Error,
    },

    /// Errors talking to the ADC over SPI.
    #[error("SPI error")]
    SpiError {
        /// Underlying error source.
        #[from]
        source: rppal::spi::Error,
    },

    /// Attempt to access a digital input or TTL line that doesn't exist.
    #[error("Input number out of range")]
    InputBoundsError(u8),

    /// Attempt to access a relay or open collector that doesn't exist.
    #[error("Output number out of range")]
    OutputBoundsError(u8),

    /// Attempt to access an analog input outside 1-4.
    #[error("Analog input number out of range")]
    AnalogInputBoundsError(u8),

    /// Attempt to access a Wiegand interface other than 1 or 2.
    #[error("Wiegand interface number out of range")]
    WiegandInterfaceBoundsError(u8),

    /// A line name that doesn't match any line on the board.
    #[error("Unknown line name '{0}'")]
    UnknownLineName(String),

    /// An edge mode name other than `rising`, `falling` or `both`.
    #[error("Unknown edge mode '{0}'")]
    UnknownEdgeMode(String),

    /// Wiegand timing limits that can't be satisfied.
    #[error("Invalid Wiegand timing {0:?}")]
    InvalidWiegandTiming(WiegandTiming),

    /// A TTL line can be used as a digital input or for Wiegand but not both.
    #[error("{line} is in use by Wiegand interface {interface}")]
    LineInUse {
        /// The contended line.
        line: Input,
        /// The Wiegand interface the line belongs to.
        interface: WiegandInterface,
    },

    /// A TTL line that has been set up for digital input can't be used for anything
    /// else.
    #[error("{0} is configured as a digital input")]
    LineConfigured(Input),

    /// A MaxDetect sensor can only be read on a TTL line.
    #[error("{0} is not a TTL line")]
    NotTtlLine(Input),

    /// Every attempt to read a MaxDetect sensor failed.
    #[error("No valid MaxDetect reading on {0}")]
    MaxDetectReadError(Input),

    /// A monitor is already running on the Wiegand interface.
    #[error("Wiegand interface {0} is already being monitored")]
    WiegandBusy(WiegandInterface),

    /// The debounce confirmation worker thread couldn't be started.
    #[error("Failed to start debounce worker")]
    WorkerSpawn {
        /// Underlying error source.
        source: io::Error,
    },

    /// Errors accessing the 1-Wire bus in sysfs.
    #[error("1-Wire I/O error on {path:?}")]
    OneWireIo {
        /// File or directory being accessed.
        path: PathBuf,
        /// Underlying error source.
        source: io::Error,
    },

    /// A 1-Wire sensor returned a reading that failed its CRC or couldn't be parsed.
    #[error("Bad reading from 1-Wire device {0}")]
    OneWireReadError(String),
}

/// Convenient alias for [`Result<_>`] types can have [`IonoPiError`]s.
pub type Result<T> = result::Result<T, IonoPiError>;

//--------------------------------------------------------------------------------------
/// Represents an Iono Pi board.
///
/// This is the key entrypoint into the driver. It owns the connection to the Raspberry
/// Pi hardware together with the debouncer for the digital inputs, the decoder for the
/// two Wiegand interfaces and the 1-Wire bus.
///
/// Every method takes `&self`, so an `IonoPi` can be shared between threads: typically
/// one thread blocks in [`IonoPi::wiegand_monitor()`] while another calls
/// [`IonoPi::wiegand_stop()`].
///
/// The TTL lines are shared between digital input use and the Wiegand interfaces. A
/// line can only be used one way at a time; asking for the other returns
/// [`IonoPiError::LineInUse`].
///
/// ```no_run
/// use rppal_ionopi::{Input, IonoPi, Level, Output};
/// use std::time::Duration;
///
/// let iono = IonoPi::new().expect("Failed to open Iono Pi");
///
/// // Close relay O1 and report DI1 changes once they've been stable for 20ms.
/// iono.digital_write(Output::O1, Level::High).expect("Bad write");
/// iono.set_digital_debounce(Input::Di1, Duration::from_millis(20))
///     .expect("Bad debounce");
/// iono.digital_interrupt(
///     Input::Di1,
///     Default::default(),
///     Some(Box::new(|input, level| println!("{input} is {level}"))),
/// )
/// .expect("Bad interrupt");
/// ```
pub struct IonoPi {
    hardware: Arc<dyn Hardware>,
    debounce: DebounceController,
    wiegand: Wiegand,
    one_wire: OneWireBus,
    /// Held while deciding which use a TTL line is put to and putting it to that use.
    ownership: Mutex<()>,
    #[cfg(any(test, feature = "mockgpio"))]
    mock: Option<Arc<MockHardware>>,
}

impl IonoPi {
    /// Open the Iono Pi on the Raspberry Pi's GPIO and SPI0.
    ///
    /// In testing environments or with the `mockgpio` feature enabled, a mock is used
    /// instead.
    #[cfg(not(any(test, feature = "mockgpio")))]
    pub fn new() -> Result<Self> {
        Self::with_hardware(Arc::new(RppalHardware::new()?))
    }

    /// Open an Iono Pi backed by a fresh [`mock::MockHardware`].
    #[cfg(any(test, feature = "mockgpio"))]
    pub fn new() -> Result<Self> {
        let mock = Arc::new(MockHardware::new());
        let mut iono = Self::with_hardware(mock.clone())?;
        iono.mock = Some(mock);
        Ok(iono)
    }

    /// Create an Iono Pi driver on top of any [`Hardware`].
    pub fn with_hardware(hardware: Arc<dyn Hardware>) -> Result<Self> {
        let debounce = DebounceController::new(hardware.clone())?;
        let wiegand = Wiegand::new(hardware.clone());
        info!("Iono Pi driver ready");
        Ok(IonoPi {
            hardware,
            debounce,
            wiegand,
            one_wire: OneWireBus::new(),
            ownership: Mutex::new(()),
            #[cfg(any(test, feature = "mockgpio"))]
            mock: None,
        })
    }

    /// Read 1-Wire devices from a different bus.
    pub fn with_one_wire_bus(self, one_wire: OneWireBus) -> Self {
        IonoPi { one_wire, ..self }
    }

    /// Set a relay, open collector or the LED.
    pub fn digital_write(&self, output: Output, level: Level) -> Result<()> {
        self.hardware.write(output.gpio(), level)?;
        debug!("{output} set {level}");
        Ok(())
    }

    /// Read an input.
    ///
    /// Returns the debounced level if a debounce window is set on the input, otherwise
    /// the instantaneous level on the line.
    pub fn digital_read(&self, input: Input) -> Result<Level> {
        self.debounce.read(input)
    }

    /// Set the debounce window for an input; a zero window turns debouncing off.
    pub fn set_digital_debounce(&self, input: Input, window: Duration) -> Result<()> {
        let _ownership = self.ownership();
        self.check_line_free(input)?;
        self.debounce.set_debounce(input, window)
    }

    /// Register (or with `None`, clear) a callback for debounced changes on an input.
    ///
    /// Callbacks run on the debounce worker thread and must not block for long: every
    /// input's callbacks share the one thread.
    pub fn digital_interrupt(
        &self,
        input: Input,
        edge_mode: EdgeMode,
        callback: Option<DigitalCallback>,
    ) -> Result<()> {
        let _ownership = self.ownership();
        self.check_line_free(input)?;
        self.debounce.on_change(input, edge_mode, callback)
    }

    fn ownership(&self) -> MutexGuard<'_, ()> {
        self.ownership.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_line_free(&self, input: Input) -> Result<()> {
        match input.wiegand_interface() {
            Some(interface) if self.wiegand.is_registered(interface) => {
                Err(IonoPiError::LineInUse {
                    line: input,
                    interface,
                })
            }
            _ => Ok(()),
        }
    }

    /// Raw 12-bit reading from an analog input.
    pub fn analog_read(&self, input: AnalogInput) -> Result<u16> {
        self.hardware.analog_read(input)
    }

    /// Voltage on an analog input, scaled for the input's range.
    pub fn voltage_read(&self, input: AnalogInput) -> Result<f32> {
        let raw = self.analog_read(input)?;
        Ok(f32::from(raw) * input.volts_per_lsb())
    }

    /// Set the Wiegand pulse timing in microseconds, keeping the silence floor and
    /// minimum frame length.
    pub fn set_wiegand_pulse(
        &self,
        max_width_micros: u32,
        min_interval_micros: u32,
        max_interval_micros: u32,
    ) -> Result<()> {
        let current = self.wiegand.timing();
        let timing =
            WiegandTiming::from_micros(max_width_micros, min_interval_micros, max_interval_micros)?
                .with_silence_floor(current.silence_floor)
                .with_min_bits(current.min_bits)?;
        self.wiegand.set_timing(timing);
        Ok(())
    }

    /// Replace all of the Wiegand timing limits.
    pub fn set_wiegand_timing(&self, timing: WiegandTiming) {
        self.wiegand.set_timing(timing);
    }

    /// The Wiegand timing limits in force.
    pub fn wiegand_timing(&self) -> WiegandTiming {
        self.wiegand.timing()
    }

    /// Monitor a Wiegand interface until `callback` returns `false` or
    /// [`IonoPi::wiegand_stop()`] is called. See [`Wiegand::monitor()`].
    pub fn wiegand_monitor<F>(&self, interface: WiegandInterface, callback: F) -> Result<()>
    where
        F: FnMut(WiegandInterface, Frame) -> bool,
    {
        {
            let _ownership = self.ownership();
            for line in [interface.data0(), interface.data1()] {
                if self.debounce.is_configured(line) {
                    return Err(IonoPiError::LineInUse { line, interface });
                }
            }
            self.wiegand.register(interface)?;
        }
        self.wiegand.monitor(interface, callback)
    }

    /// Stop monitoring a Wiegand interface. Returns `true` if a monitor was running.
    pub fn wiegand_stop(&self, interface: WiegandInterface) -> bool {
        self.wiegand.stop(interface)
    }

    /// Whether a monitor loop is running on a Wiegand interface.
    pub fn wiegand_is_running(&self, interface: WiegandInterface) -> bool {
        self.wiegand.is_running(interface)
    }

    /// IDs of the devices on the 1-Wire bus.
    pub fn one_wire_devices(&self) -> Result<Vec<String>> {
        self.one_wire.devices()
    }

    /// Temperature in °C from a 1-Wire sensor, trying up to `attempts` times.
    pub fn one_wire_temperature(&self, id: &str, attempts: u32) -> Result<f32> {
        self.one_wire.read_temperature(id, attempts)
    }

    /// Read an RHT03 (or other MaxDetect) sensor on a TTL line, trying up to `attempts`
    /// times.
    ///
    /// Returns `(temperature °C, relative humidity %)`. The line must not be in use for
    /// Wiegand or set up as a digital input.
    pub fn max_detect_read(&self, line: Input, attempts: u32) -> Result<(f32, f32)> {
        if line.wiegand_interface().is_none() {
            return Err(IonoPiError::NotTtlLine(line));
        }
        let _ownership = self.ownership();
        self.check_line_free(line)?;
        if self.debounce.is_configured(line) {
            return Err(IonoPiError::LineConfigured(line));
        }

        for attempt in 1..=attempts.max(1) {
            match self.hardware.max_detect_read(line.gpio())? {
                Some(frame) => match maxdetect::decode(&frame) {
                    Some(reading) => return Ok(reading),
                    None => warn!("MaxDetect read on {line} attempt {attempt}: bad reading"),
                },
                None => warn!("MaxDetect read on {line} attempt {attempt}: no response"),
            }
        }
        Err(IonoPiError::MaxDetectReadError(line))
    }

    /// In testing environments provide access to the mock hardware so that tests can
    /// drive the inputs and inspect the outputs without a real Iono Pi.
    ///
    /// Returns `None` if the driver was created with [`IonoPi::with_hardware()`].
    ///
    /// ```
    /// use rppal_ionopi::{IonoPi, Level, Output};
    ///
    /// let iono = IonoPi::new().expect("Failed to construct!");
    /// iono.digital_write(Output::Led, Level::High).expect("Bad write");
    ///
    /// let mock = iono.mock_hardware().expect("No mock");
    /// assert_eq!(mock.writes(Output::Led.gpio()), vec![Level::High]);
    /// ```
    #[cfg(any(test, feature = "mockgpio"))]
    pub fn mock_hardware(&self) -> Option<&Arc<MockHardware>> {
        self.mock.as_ref()
    }
}
