//! Iono Pi line identifiers and their mapping onto Raspberry Pi GPIO pins.
//!
//! All GPIO numbers are BCM numbers, as used by `rppal`.

use std::{fmt, str::FromStr};

use crate::{IonoPiError, Result};

//--------------------------------------------------------------------------------------
/// A monitored input line.
///
/// `DI1`-`DI6` are the opto-isolated digital inputs. `TTL1`-`TTL4` are the TTL-level
/// lines on the expansion header which double as the data lines of the two Wiegand
/// interfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Input {
    /// Digital input 1.
    Di1,
    /// Digital input 2.
    Di2,
    /// Digital input 3.
    Di3,
    /// Digital input 4.
    Di4,
    /// Digital input 5.
    Di5,
    /// Digital input 6.
    Di6,
    /// TTL line 1 (Wiegand interface 1, data-0).
    Ttl1,
    /// TTL line 2 (Wiegand interface 1, data-1).
    Ttl2,
    /// TTL line 3 (Wiegand interface 2, data-0).
    Ttl3,
    /// TTL line 4 (Wiegand interface 2, data-1).
    Ttl4,
}

impl Input {
    /// Number of input lines on the board.
    pub const COUNT: usize = 10;

    /// Every input line, in board order.
    pub const ALL: [Input; Self::COUNT] = [
        Input::Di1,
        Input::Di2,
        Input::Di3,
        Input::Di4,
        Input::Di5,
        Input::Di6,
        Input::Ttl1,
        Input::Ttl2,
        Input::Ttl3,
        Input::Ttl4,
    ];

    /// The BCM GPIO number the line is wired to.
    pub fn gpio(self) -> u8 {
        match self {
            Input::Di1 => 16,
            Input::Di2 => 19,
            Input::Di3 => 13,
            Input::Di4 => 12,
            Input::Di5 => 6,
            Input::Di6 => 5,
            Input::Ttl1 => 4,
            Input::Ttl2 => 26,
            Input::Ttl3 => 20,
            Input::Ttl4 => 21,
        }
    }

    /// Position of the line in [`Input::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// The Wiegand interface this line belongs to, if it is a TTL line.
    pub fn wiegand_interface(self) -> Option<WiegandInterface> {
        match self {
            Input::Ttl1 | Input::Ttl2 => Some(WiegandInterface::W1),
            Input::Ttl3 | Input::Ttl4 => Some(WiegandInterface::W2),
            _ => None,
        }
    }

    /// Digital input `DI<n>` for `n` in 1..=6.
    pub fn digital(n: u8) -> Result<Self> {
        match n {
            1..=6 => Ok(Input::ALL[usize::from(n) - 1]),
            _ => Err(IonoPiError::InputBoundsError(n)),
        }
    }

    /// TTL line `TTL<n>` for `n` in 1..=4.
    pub fn ttl(n: u8) -> Result<Self> {
        match n {
            1..=4 => Ok(Input::ALL[usize::from(n) + 5]),
            _ => Err(IonoPiError::InputBoundsError(n)),
        }
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self.index();
        if index < 6 {
            write!(f, "DI{}", index + 1)
        } else {
            write!(f, "TTL{}", index - 5)
        }
    }
}

impl FromStr for Input {
    type Err = IonoPiError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        let parsed = if let Some(n) = lower.strip_prefix("di") {
            n.parse().ok().map(Input::digital)
        } else if let Some(n) = lower.strip_prefix("ttl") {
            n.parse().ok().map(Input::ttl)
        } else {
            None
        };
        parsed.unwrap_or_else(|| Err(IonoPiError::UnknownLineName(s.to_string())))
    }
}

//--------------------------------------------------------------------------------------
/// An output line: the four relays, the three open collectors and the green LED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Output {
    /// Relay output 1.
    O1,
    /// Relay output 2.
    O2,
    /// Relay output 3.
    O3,
    /// Relay output 4.
    O4,
    /// Open collector output 1.
    Oc1,
    /// Open collector output 2.
    Oc2,
    /// Open collector output 3.
    Oc3,
    /// The green LED.
    Led,
}

impl Output {
    /// The BCM GPIO number the output is driven from.
    pub fn gpio(self) -> u8 {
        match self {
            Output::O1 => 17,
            Output::O2 => 27,
            Output::O3 => 22,
            Output::O4 => 23,
            Output::Oc1 => 18,
            Output::Oc2 => 25,
            Output::Oc3 => 24,
            Output::Led => 7,
        }
    }

    /// Relay output `O<n>` for `n` in 1..=4.
    pub fn relay(n: u8) -> Result<Self> {
        match n {
            1 => Ok(Output::O1),
            2 => Ok(Output::O2),
            3 => Ok(Output::O3),
            4 => Ok(Output::O4),
            _ => Err(IonoPiError::OutputBoundsError(n)),
        }
    }

    /// Open collector output `OC<n>` for `n` in 1..=3.
    pub fn open_collector(n: u8) -> Result<Self> {
        match n {
            1 => Ok(Output::Oc1),
            2 => Ok(Output::Oc2),
            3 => Ok(Output::Oc3),
            _ => Err(IonoPiError::OutputBoundsError(n)),
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Output::O1 => "O1",
            Output::O2 => "O2",
            Output::O3 => "O3",
            Output::O4 => "O4",
            Output::Oc1 => "OC1",
            Output::Oc2 => "OC2",
            Output::Oc3 => "OC3",
            Output::Led => "LED",
        };
        f.write_str(name)
    }
}

impl FromStr for Output {
    type Err = IonoPiError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        let parsed = if lower == "led" {
            Some(Ok(Output::Led))
        } else if let Some(n) = lower.strip_prefix("oc") {
            n.parse().ok().map(Output::open_collector)
        } else if let Some(n) = lower.strip_prefix('o') {
            n.parse().ok().map(Output::relay)
        } else {
            None
        };
        parsed.unwrap_or_else(|| Err(IonoPiError::UnknownLineName(s.to_string())))
    }
}

//--------------------------------------------------------------------------------------
/// One of the four analog inputs, read through the on-board MCP3204 ADC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AnalogInput {
    /// Analog input 1 (0-30V).
    Ai1,
    /// Analog input 2 (0-30V).
    Ai2,
    /// Analog input 3 (0-3V).
    Ai3,
    /// Analog input 4 (0-3V).
    Ai4,
}

impl AnalogInput {
    /// Largest value the 12-bit converter can return.
    pub const MAX_RAW: u16 = 0x0FFF;

    /// The MCP3204 channel select bits, positioned for the second byte of the
    /// conversion request (`D1 D0 X X X X X X`).
    pub fn channel_bits(self) -> u8 {
        match self {
            AnalogInput::Ai1 => 0b0100_0000,
            AnalogInput::Ai2 => 0b0000_0000,
            AnalogInput::Ai3 => 0b1000_0000,
            AnalogInput::Ai4 => 0b1100_0000,
        }
    }

    /// Volts represented by one LSB of the converter for this input's divider.
    pub fn volts_per_lsb(self) -> f32 {
        match self {
            AnalogInput::Ai1 | AnalogInput::Ai2 => 0.007_319,
            AnalogInput::Ai3 | AnalogInput::Ai4 => 0.000_725,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for AnalogInput {
    type Error = IonoPiError;

    fn try_from(n: u8) -> Result<Self> {
        match n {
            1 => Ok(AnalogInput::Ai1),
            2 => Ok(AnalogInput::Ai2),
            3 => Ok(AnalogInput::Ai3),
            4 => Ok(AnalogInput::Ai4),
            _ => Err(IonoPiError::AnalogInputBoundsError(n)),
        }
    }
}

impl fmt::Display for AnalogInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AI{}", self.index() + 1)
    }
}

impl FromStr for AnalogInput {
    type Err = IonoPiError;

    fn from_str(s: &str) -> Result<Self> {
        s.to_ascii_lowercase()
            .strip_prefix("ai")
            .and_then(|n| n.parse::<u8>().ok())
            .map(AnalogInput::try_from)
            .unwrap_or_else(|| Err(IonoPiError::UnknownLineName(s.to_string())))
    }
}

//--------------------------------------------------------------------------------------
/// One of the two Wiegand interfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WiegandInterface {
    /// Interface 1: `TTL1` carries data-0, `TTL2` carries data-1.
    W1,
    /// Interface 2: `TTL3` carries data-0, `TTL4` carries data-1.
    W2,
}

impl WiegandInterface {
    /// The line pulsed for a `0` bit.
    pub fn data0(self) -> Input {
        match self {
            WiegandInterface::W1 => Input::Ttl1,
            WiegandInterface::W2 => Input::Ttl3,
        }
    }

    /// The line pulsed for a `1` bit.
    pub fn data1(self) -> Input {
        match self {
            WiegandInterface::W1 => Input::Ttl2,
            WiegandInterface::W2 => Input::Ttl4,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for WiegandInterface {
    type Error = IonoPiError;

    fn try_from(n: u8) -> Result<Self> {
        match n {
            1 => Ok(WiegandInterface::W1),
            2 => Ok(WiegandInterface::W2),
            _ => Err(IonoPiError::WiegandInterfaceBoundsError(n)),
        }
    }
}

impl fmt::Display for WiegandInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index() + 1)
    }
}
