//! Wiegand frame decoding on the TTL lines.
//!
//! A Wiegand reader sends a credential as a burst of narrow low-going pulses, one per
//! bit, on one of two lines: data-0 for a `0`, data-1 for a `1`. The burst ends with a
//! period of silence.
//!
//! Pulse timing is validated from edge timestamps: the falling edge marks the start of
//! a pulse and the rising edge its release. A pulse that is too wide, or that starts
//! too soon or too late after the previous bit, throws away the whole frame being
//! built. Frames are finalised by a polling loop once the line has been silent for
//! long enough.

use std::{
    fmt, mem,
    sync::{
        Arc, Mutex, MutexGuard, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    Input, IonoPiError, Result, WiegandInterface,
    hardware::{Edge, EdgeEvent, Hardware},
};

//--------------------------------------------------------------------------------------
/// Pulse timing limits applied to both Wiegand interfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WiegandTiming {
    /// Longest a data line may be held low for a single bit.
    pub pulse_width_max: Duration,
    /// Shortest time from the start of one bit to the start of the next.
    pub pulse_interval_min: Duration,
    /// Longest time from the start of one bit to the start of the next.
    pub pulse_interval_max: Duration,
    /// Lower bound on the silence that ends a frame.
    pub silence_floor: Duration,
    /// Frames with fewer bits than this are treated as noise and dropped.
    pub min_bits: u8,
}

impl WiegandTiming {
    /// Largest frame that can be accumulated.
    pub const MAX_BITS: u8 = 64;

    /// Default lower bound on the end-of-frame silence.
    pub const DEFAULT_SILENCE_FLOOR: Duration = Duration::from_millis(200);

    /// Default minimum frame length.
    pub const DEFAULT_MIN_BITS: u8 = 4;

    /// Create timing limits with the default silence floor and minimum frame length.
    pub fn new(
        pulse_width_max: Duration,
        pulse_interval_min: Duration,
        pulse_interval_max: Duration,
    ) -> Result<Self> {
        WiegandTiming {
            pulse_width_max,
            pulse_interval_min,
            pulse_interval_max,
            silence_floor: Self::DEFAULT_SILENCE_FLOOR,
            min_bits: Self::DEFAULT_MIN_BITS,
        }
        .validated()
    }

    /// Create timing limits from microsecond values, as configured on the command line.
    pub fn from_micros(
        max_width_micros: u32,
        min_interval_micros: u32,
        max_interval_micros: u32,
    ) -> Result<Self> {
        Self::new(
            Duration::from_micros(max_width_micros.into()),
            Duration::from_micros(min_interval_micros.into()),
            Duration::from_micros(max_interval_micros.into()),
        )
    }

    /// Replace the lower bound on the end-of-frame silence.
    pub fn with_silence_floor(self, silence_floor: Duration) -> Self {
        WiegandTiming {
            silence_floor,
            ..self
        }
    }

    /// Replace the minimum frame length (1 to [`WiegandTiming::MAX_BITS`]).
    pub fn with_min_bits(self, min_bits: u8) -> Result<Self> {
        WiegandTiming { min_bits, ..self }.validated()
    }

    fn validated(self) -> Result<Self> {
        if self.pulse_width_max.is_zero()
            || self.pulse_interval_min > self.pulse_interval_max
            || self.min_bits == 0
            || self.min_bits > Self::MAX_BITS
        {
            return Err(IonoPiError::InvalidWiegandTiming(self));
        }
        Ok(self)
    }

    /// Silence after the last bit that marks the end of a frame: three times the
    /// longest pulse interval, but never less than the silence floor.
    pub fn silence_timeout(&self) -> Duration {
        (self.pulse_interval_max * 3).max(self.silence_floor)
    }

    /// How often the monitor loop checks for a completed frame.
    pub fn poll_period(&self) -> Duration {
        (self.silence_timeout() / 4).max(Duration::from_millis(1))
    }
}

impl Default for WiegandTiming {
    fn default() -> Self {
        WiegandTiming {
            pulse_width_max: Duration::from_micros(150),
            pulse_interval_min: Duration::from_micros(500),
            pulse_interval_max: Duration::from_micros(2_700),
            silence_floor: Self::DEFAULT_SILENCE_FLOOR,
            min_bits: Self::DEFAULT_MIN_BITS,
        }
    }
}

//--------------------------------------------------------------------------------------
/// A complete Wiegand frame.
///
/// Bits are held most-significant first: the first bit received is bit
/// `bit_count - 1` of `data`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Number of bits received (1-64).
    pub bit_count: u8,
    /// The bits, right-aligned.
    pub data: u64,
}

/// Facility code and card number carried by a standard card format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Credential {
    /// Site / facility code.
    pub facility: u32,
    /// Card number within the facility.
    pub card: u32,
}

impl Frame {
    /// Decode a 26-bit H10301 frame: even parity, 8-bit facility, 16-bit card, odd
    /// parity.
    ///
    /// Returns `None` for any other length or if either parity bit is wrong.
    pub fn decode_h10301(&self) -> Option<Credential> {
        if self.bit_count != 26 {
            return None;
        }
        let payload = Self::check_parity(self.data, 24)?;
        Some(Credential {
            facility: (payload >> 16) & 0xFF,
            card: payload & 0xFFFF,
        })
    }

    /// Decode a 34-bit frame: even parity, 16-bit facility, 16-bit card, odd parity.
    pub fn decode_34(&self) -> Option<Credential> {
        if self.bit_count != 34 {
            return None;
        }
        let payload = Self::check_parity(self.data, 32)?;
        Some(Credential {
            facility: payload >> 16,
            card: payload & 0xFFFF,
        })
    }

    /// Strip the leading even and trailing odd parity bits from a frame of
    /// `payload_bits + 2` bits. The leading bit covers the upper half of the payload,
    /// the trailing bit the lower half.
    fn check_parity(data: u64, payload_bits: u32) -> Option<u32> {
        let half = payload_bits / 2;
        let leading = ((data >> (payload_bits + 1)) & 1) as u32;
        let trailing = (data & 1) as u32;
        let payload = ((data >> 1) & ((1u64 << payload_bits) - 1)) as u32;

        let upper = payload >> half;
        let lower = payload & ((1u32 << half) - 1);
        let even_ok = upper.count_ones() % 2 == leading;
        let odd_ok = lower.count_ones() % 2 != trailing;
        if !even_ok || !odd_ok {
            debug!("Wiegand {}-bit parity failed", payload_bits + 2);
            return None;
        }
        Some(payload)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.bit_count, self.data)
    }
}

//--------------------------------------------------------------------------------------
/// What happened to an edge fed into a [`FrameAccumulator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PulseOutcome {
    /// The falling edge of a pulse was recorded.
    Started,
    /// The pulse released in time and its bit was added to the frame.
    Accepted,
    /// The edge was ignored: the frame is full or there was no pulse to release.
    Ignored,
    /// The pulse was held low too long; the frame was discarded.
    TooWide,
    /// The pulse started too soon or too late after the previous bit; the frame was
    /// discarded.
    OutOfCadence,
}

/// Builds a frame from the pulses on one interface's two data lines.
#[derive(Clone, Debug, Default)]
pub struct FrameAccumulator {
    data: u64,
    bit_count: u8,
    last_accepted: Option<Duration>,
    pulse_start: [Option<Duration>; 2],
}

impl FrameAccumulator {
    /// An empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bits in the frame being built.
    pub fn bit_count(&self) -> u8 {
        self.bit_count
    }

    /// The bits of the frame being built.
    pub fn data(&self) -> u64 {
        self.data
    }

    /// Whether the frame has reached [`WiegandTiming::MAX_BITS`].
    pub fn is_saturated(&self) -> bool {
        self.bit_count >= WiegandTiming::MAX_BITS
    }

    /// Forget the frame and any pulse in progress.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn discard_frame(&mut self) {
        self.data = 0;
        self.bit_count = 0;
        self.last_accepted = None;
    }

    /// Feed an edge seen on the data line for `bit`.
    pub fn on_edge(
        &mut self,
        bit: bool,
        edge: Edge,
        timestamp: Duration,
        timing: &WiegandTiming,
    ) -> PulseOutcome {
        let line = usize::from(bit);
        match edge {
            Edge::Falling => {
                if self.is_saturated() {
                    return PulseOutcome::Ignored;
                }
                self.pulse_start[line] = Some(timestamp);
                PulseOutcome::Started
            }
            Edge::Rising => {
                let Some(start) = self.pulse_start[line].take() else {
                    return PulseOutcome::Ignored;
                };
                if self.is_saturated() {
                    return PulseOutcome::Ignored;
                }
                if timestamp.saturating_sub(start) > timing.pulse_width_max {
                    self.discard_frame();
                    return PulseOutcome::TooWide;
                }
                if let Some(last) = self.last_accepted {
                    let interval = start.saturating_sub(last);
                    if interval < timing.pulse_interval_min || interval > timing.pulse_interval_max
                    {
                        self.discard_frame();
                        return PulseOutcome::OutOfCadence;
                    }
                }
                self.data = (self.data << 1) | u64::from(bit);
                self.bit_count += 1;
                self.last_accepted = Some(start);
                PulseOutcome::Accepted
            }
        }
    }

    /// Discard the frame if a data line has been stuck low.
    ///
    /// A line still low a whole maximum pulse interval after it fell can't be carrying
    /// a valid pulse. Returns `true` if the frame was discarded.
    pub fn expire(&mut self, now: Duration, timing: &WiegandTiming) -> bool {
        let stuck_since = now.saturating_sub(timing.pulse_interval_max);
        let mut stuck = false;
        for start in self.pulse_start.iter_mut() {
            if start.is_some_and(|s| s < stuck_since) {
                *start = None;
                stuck = true;
            }
        }
        if stuck {
            self.discard_frame();
        }
        stuck
    }

    /// Finalise the frame once the lines have been silent for the timing's silence
    /// timeout.
    ///
    /// The accumulator is emptied whenever the timeout has passed, but only a frame of
    /// at least `min_bits` bits is returned.
    pub fn take_frame(&mut self, now: Duration, timing: &WiegandTiming) -> Option<Frame> {
        let last = self.last_accepted?;
        if now.saturating_sub(last) <= timing.silence_timeout() {
            return None;
        }
        let frame = Frame {
            bit_count: mem::take(&mut self.bit_count),
            data: mem::take(&mut self.data),
        };
        self.last_accepted = None;
        if frame.bit_count < timing.min_bits {
            debug!("Dropped {}-bit Wiegand frame as noise", frame.bit_count);
            return None;
        }
        Some(frame)
    }
}

//--------------------------------------------------------------------------------------

struct Port {
    interface: WiegandInterface,
    frame: Mutex<FrameAccumulator>,
    running: AtomicBool,
    registered: AtomicBool,
    active: AtomicBool,
}

impl Port {
    fn new(interface: WiegandInterface) -> Self {
        Port {
            interface,
            frame: Mutex::new(FrameAccumulator::new()),
            running: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            active: AtomicBool::new(false),
        }
    }

    fn frame(&self) -> MutexGuard<'_, FrameAccumulator> {
        self.frame.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_edge(&self, bit: bool, event: EdgeEvent, timing: &WiegandTiming) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let outcome = self
            .frame()
            .on_edge(bit, event.edge, event.timestamp, timing);
        match outcome {
            PulseOutcome::TooWide => {
                debug!("Wiegand {}: pulse too wide, frame discarded", self.interface)
            }
            PulseOutcome::OutOfCadence => {
                debug!("Wiegand {}: pulse out of cadence, frame discarded", self.interface)
            }
            _ => (),
        }
    }
}

/// Marks a port idle when a monitor loop exits, however it exits.
struct ActiveGuard<'a>(&'a Port);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
        self.0.active.store(false, Ordering::Release);
    }
}

/// Decoder for the board's two Wiegand interfaces.
///
/// Each interface is driven by its own blocking [`Wiegand::monitor()`] call; to read
/// both interfaces at once run two monitors on separate threads.
pub struct Wiegand {
    hardware: Arc<dyn Hardware>,
    timing: Arc<RwLock<WiegandTiming>>,
    ports: [Arc<Port>; 2],
}

impl Wiegand {
    /// Create a decoder. No lines are watched until an interface is first monitored.
    pub fn new(hardware: Arc<dyn Hardware>) -> Self {
        Wiegand {
            hardware,
            timing: Arc::new(RwLock::new(WiegandTiming::default())),
            ports: [
                Arc::new(Port::new(WiegandInterface::W1)),
                Arc::new(Port::new(WiegandInterface::W2)),
            ],
        }
    }

    /// The timing limits in force.
    pub fn timing(&self) -> WiegandTiming {
        *self.timing.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the timing limits for both interfaces. Takes effect from the next edge.
    pub fn set_timing(&self, timing: WiegandTiming) {
        *self.timing.write().unwrap_or_else(|e| e.into_inner()) = timing;
        debug!("Wiegand timing set to {timing:?}");
    }

    fn port(&self, interface: WiegandInterface) -> &Arc<Port> {
        &self.ports[interface.index()]
    }

    /// Whether the interface's data lines are being watched.
    pub fn is_registered(&self, interface: WiegandInterface) -> bool {
        self.port(interface).registered.load(Ordering::Acquire)
    }

    /// Whether a monitor loop is running on the interface.
    pub fn is_running(&self, interface: WiegandInterface) -> bool {
        self.port(interface).running.load(Ordering::Acquire)
    }

    /// Number of bits in the frame currently being received on the interface.
    pub fn pending_bits(&self, interface: WiegandInterface) -> u8 {
        self.port(interface).frame().bit_count()
    }

    /// Monitor an interface, calling `callback` with every complete frame.
    ///
    /// Blocks until `callback` returns `false` or [`Wiegand::stop()`] is called for the
    /// interface. The first call for an interface starts watching its data lines; they
    /// stay watched afterwards so later calls reuse them.
    ///
    /// Only one monitor may run on an interface at a time: a second concurrent call
    /// returns [`IonoPiError::WiegandBusy`].
    pub fn monitor<F>(&self, interface: WiegandInterface, mut callback: F) -> Result<()>
    where
        F: FnMut(WiegandInterface, Frame) -> bool,
    {
        let port = self.port(interface);
        if port.active.swap(true, Ordering::AcqRel) {
            return Err(IonoPiError::WiegandBusy(interface));
        }
        let _active = ActiveGuard(port);

        self.register(interface)?;
        port.frame().reset();
        port.running.store(true, Ordering::Release);
        info!("Monitoring Wiegand interface {interface}");

        while port.running.load(Ordering::Acquire) {
            let timing = self.timing();
            let now = self.hardware.now();
            let frame = {
                let mut accumulator = port.frame();
                if accumulator.expire(now, &timing) {
                    debug!("Wiegand {interface}: data line stuck low, frame discarded");
                }
                accumulator.take_frame(now, &timing)
            };

            if let Some(frame) = frame {
                debug!("Wiegand {interface}: read {frame}");
                if !callback(interface, frame) {
                    port.running.store(false, Ordering::Release);
                    break;
                }
            }
            thread::sleep(timing.poll_period());
        }

        info!("Stopped monitoring Wiegand interface {interface}");
        Ok(())
    }

    /// Ask the monitor loop on an interface to exit at its next poll.
    ///
    /// Returns `true` if a monitor was running.
    pub fn stop(&self, interface: WiegandInterface) -> bool {
        self.port(interface).running.swap(false, Ordering::AcqRel)
    }

    /// Start watching an interface's data lines if they aren't already.
    pub(crate) fn register(&self, interface: WiegandInterface) -> Result<()> {
        let port = self.port(interface);
        if port.registered.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = self
            .watch(port, interface.data0(), false)
            .and_then(|()| self.watch(port, interface.data1(), true));
        if let Err(e) = result {
            port.registered.store(false, Ordering::Release);
            for line in [interface.data0(), interface.data1()] {
                let _ = self.hardware.unwatch(line.gpio());
            }
            return Err(e);
        }
        info!(
            "Watching {} and {} for Wiegand interface {interface}",
            interface.data0(),
            interface.data1()
        );
        Ok(())
    }

    fn watch(&self, port: &Arc<Port>, line: Input, bit: bool) -> Result<()> {
        let port = port.clone();
        let timing = self.timing.clone();
        self.hardware.watch(
            line.gpio(),
            Box::new(move |event| {
                let timing = *timing.read().unwrap_or_else(|e| e.into_inner());
                port.on_edge(bit, event, &timing);
            }),
        )
    }
}

impl Drop for Wiegand {
    fn drop(&mut self) {
        for port in &self.ports {
            port.running.store(false, Ordering::Release);
            if port.registered.load(Ordering::Acquire) {
                for line in [port.interface.data0(), port.interface.data1()] {
                    if let Err(e) = self.hardware.unwatch(line.gpio()) {
                        warn!("Failed to stop watching {line}: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Level, mock::MockHardware};
    use std::time::Instant;

    fn us(micros: u64) -> Duration {
        Duration::from_micros(micros)
    }

    /// 150us width, 500-2700us interval, and no silence floor so the timeout is
    /// 3 x 2700us = 8100us.
    fn timing() -> WiegandTiming {
        WiegandTiming::from_micros(150, 500, 2_700)
            .expect("Bad timing")
            .with_silence_floor(Duration::ZERO)
    }

    /// Feed a pulse starting at `start_us` and released `width_us` later.
    fn pulse(
        accumulator: &mut FrameAccumulator,
        bit: bool,
        start_us: u64,
        width_us: u64,
        timing: &WiegandTiming,
    ) -> PulseOutcome {
        assert_eq!(
            accumulator.on_edge(bit, Edge::Falling, us(start_us), timing),
            PulseOutcome::Started
        );
        accumulator.on_edge(bit, Edge::Rising, us(start_us + width_us), timing)
    }

    fn four_bit_frame(timing: &WiegandTiming) -> FrameAccumulator {
        let mut accumulator = FrameAccumulator::new();
        for (start, bit) in [(0, true), (1_000, false), (2_500, true), (4_000, true)] {
            assert_eq!(
                pulse(&mut accumulator, bit, start, 100, timing),
                PulseOutcome::Accepted
            );
        }
        accumulator
    }

    #[test]
    fn timing_defaults() {
        let timing = WiegandTiming::default();
        assert_eq!(timing.silence_timeout(), Duration::from_millis(200));
        assert_eq!(timing.poll_period(), Duration::from_millis(50));

        let slow = WiegandTiming::from_micros(150, 500, 100_000).expect("Bad timing");
        assert_eq!(slow.silence_timeout(), Duration::from_millis(300));
    }

    #[test]
    fn timing_validation() {
        assert!(matches!(
            WiegandTiming::from_micros(150, 3_000, 2_000),
            Err(IonoPiError::InvalidWiegandTiming(_))
        ));
        assert!(matches!(
            WiegandTiming::from_micros(0, 500, 2_000),
            Err(IonoPiError::InvalidWiegandTiming(_))
        ));
        assert!(WiegandTiming::default().with_min_bits(0).is_err());
        assert!(WiegandTiming::default().with_min_bits(65).is_err());
        assert!(WiegandTiming::default().with_min_bits(64).is_ok());
    }

    #[test]
    fn four_pulses_make_one_frame() {
        let timing = timing();
        let mut accumulator = four_bit_frame(&timing);

        // Still inside the 8100us silence timeout.
        assert_eq!(accumulator.take_frame(us(4_000 + 5_000), &timing), None);
        assert_eq!(accumulator.bit_count(), 4);

        assert_eq!(
            accumulator.take_frame(us(4_000 + 9_000), &timing),
            Some(Frame {
                bit_count: 4,
                data: 0b1011
            })
        );
        assert_eq!(accumulator.bit_count(), 0);
        assert_eq!(accumulator.take_frame(us(40_000), &timing), None);
    }

    #[test]
    fn silence_floor_delays_frame() {
        let timing = timing().with_silence_floor(WiegandTiming::DEFAULT_SILENCE_FLOOR);
        let mut accumulator = four_bit_frame(&timing);

        assert_eq!(accumulator.take_frame(us(4_000 + 9_000), &timing), None);
        assert_eq!(
            accumulator
                .take_frame(us(4_000 + 200_001), &timing)
                .map(|f| f.data),
            Some(0b1011)
        );
    }

    #[test]
    fn late_pulse_discards_frame() {
        let timing = timing();
        let mut accumulator = four_bit_frame(&timing);

        assert_eq!(
            pulse(&mut accumulator, true, 7_000, 100, &timing),
            PulseOutcome::OutOfCadence
        );
        assert_eq!(accumulator.bit_count(), 0);
        assert_eq!(accumulator.take_frame(us(7_000 + 20_000), &timing), None);
    }

    #[test]
    fn early_pulse_discards_frame() {
        let timing = timing();
        let mut accumulator = FrameAccumulator::new();
        pulse(&mut accumulator, true, 0, 100, &timing);
        pulse(&mut accumulator, true, 1_000, 100, &timing);
        assert_eq!(
            pulse(&mut accumulator, false, 1_300, 100, &timing),
            PulseOutcome::OutOfCadence
        );
        assert_eq!(accumulator.bit_count(), 0);
    }

    #[test]
    fn wide_pulse_discards_frame_and_next_pulse_starts_afresh() {
        let timing = timing();
        let mut accumulator = FrameAccumulator::new();
        pulse(&mut accumulator, true, 0, 100, &timing);
        pulse(&mut accumulator, false, 1_000, 100, &timing);
        assert_eq!(
            pulse(&mut accumulator, true, 2_000, 200, &timing),
            PulseOutcome::TooWide
        );
        assert_eq!(accumulator.bit_count(), 0);

        assert_eq!(
            pulse(&mut accumulator, false, 50_000, 100, &timing),
            PulseOutcome::Accepted
        );
        assert_eq!(accumulator.bit_count(), 1);
        assert_eq!(accumulator.data(), 0);
    }

    #[test]
    fn short_frame_is_dropped() {
        let timing = timing();
        let mut accumulator = FrameAccumulator::new();
        pulse(&mut accumulator, true, 0, 100, &timing);
        pulse(&mut accumulator, true, 1_000, 100, &timing);
        pulse(&mut accumulator, true, 2_000, 100, &timing);

        assert_eq!(accumulator.take_frame(us(20_000), &timing), None);
        assert_eq!(accumulator.bit_count(), 0);
    }

    #[test]
    fn min_bits_is_configurable() {
        let timing = timing().with_min_bits(2).expect("Bad min bits");
        let mut accumulator = FrameAccumulator::new();
        pulse(&mut accumulator, true, 0, 100, &timing);
        pulse(&mut accumulator, false, 1_000, 100, &timing);

        assert_eq!(
            accumulator.take_frame(us(20_000), &timing),
            Some(Frame {
                bit_count: 2,
                data: 0b10
            })
        );
    }

    #[test]
    fn frame_saturates_at_64_bits() {
        let timing = timing();
        let mut accumulator = FrameAccumulator::new();
        for i in 0..64u64 {
            assert_eq!(
                pulse(&mut accumulator, i % 2 == 0, i * 1_000, 100, &timing),
                PulseOutcome::Accepted
            );
        }
        assert!(accumulator.is_saturated());
        assert_eq!(
            accumulator.on_edge(true, Edge::Falling, us(64_000), &timing),
            PulseOutcome::Ignored
        );
        assert_eq!(
            accumulator.on_edge(true, Edge::Rising, us(64_100), &timing),
            PulseOutcome::Ignored
        );

        let frame = accumulator
            .take_frame(us(63_000 + 10_000), &timing)
            .expect("No frame");
        assert_eq!(frame.bit_count, 64);
        assert_eq!(frame.data, 0xAAAA_AAAA_AAAA_AAAA);
    }

    #[test]
    fn stuck_line_discards_frame() {
        let timing = timing();
        let mut accumulator = FrameAccumulator::new();
        pulse(&mut accumulator, true, 0, 100, &timing);
        pulse(&mut accumulator, true, 1_000, 100, &timing);
        accumulator.on_edge(false, Edge::Falling, us(2_000), &timing);

        assert!(!accumulator.expire(us(3_000), &timing));
        assert!(accumulator.expire(us(5_000), &timing));
        assert_eq!(accumulator.bit_count(), 0);
        assert_eq!(
            accumulator.on_edge(false, Edge::Rising, us(5_100), &timing),
            PulseOutcome::Ignored
        );
    }

    fn h10301(facility: u32, card: u32) -> Frame {
        let payload = (facility << 16) | card;
        let even = (payload >> 12).count_ones() % 2;
        let odd = if (payload & 0xFFF).count_ones() % 2 == 0 { 1u32 } else { 0u32 };
        Frame {
            bit_count: 26,
            data: (u64::from(even) << 25) | (u64::from(payload) << 1) | u64::from(odd),
        }
    }

    #[test]
    fn decode_h10301_card() {
        let frame = h10301(100, 12345);
        assert_eq!(
            frame.decode_h10301(),
            Some(Credential {
                facility: 100,
                card: 12345
            })
        );
        assert_eq!(frame.decode_34(), None);
    }

    #[test]
    fn decode_h10301_bad_parity() {
        let mut frame = h10301(100, 12345);
        frame.data ^= 1;
        assert_eq!(frame.decode_h10301(), None);
    }

    #[test]
    fn decode_34_bit_card() {
        let payload: u32 = (0x1234 << 16) | 0xBEEF;
        let even = (payload >> 16).count_ones() % 2;
        let odd = if (payload & 0xFFFF).count_ones() % 2 == 0 { 1u32 } else { 0u32 };
        let frame = Frame {
            bit_count: 34,
            data: (u64::from(even) << 33) | (u64::from(payload) << 1) | u64::from(odd),
        };
        assert_eq!(
            frame.decode_34(),
            Some(Credential {
                facility: 0x1234,
                card: 0xBEEF
            })
        );
    }

    #[test]
    fn frame_display() {
        let frame = Frame {
            bit_count: 26,
            data: 1234,
        };
        assert_eq!(frame.to_string(), "26 1234");
    }

    /// Loose timing for driving the mock in real time.
    fn mock_timing() -> WiegandTiming {
        WiegandTiming::new(
            Duration::from_millis(50),
            Duration::ZERO,
            Duration::from_millis(50),
        )
        .expect("Bad timing")
        .with_silence_floor(Duration::ZERO)
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "Timed out waiting");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn send_bits(mock: &MockHardware, interface: WiegandInterface, bits: &[bool]) {
        for &bit in bits {
            let line = if bit {
                interface.data1()
            } else {
                interface.data0()
            };
            mock.set_level(line.gpio(), Level::Low);
            mock.set_level(line.gpio(), Level::High);
        }
    }

    fn idle_lines(mock: &MockHardware) {
        for input in [Input::Ttl1, Input::Ttl2, Input::Ttl3, Input::Ttl4] {
            mock.set_level(input.gpio(), Level::High);
        }
    }

    #[test]
    fn monitor_delivers_frame_and_exits_on_false() {
        let mock = Arc::new(MockHardware::new());
        idle_lines(&mock);
        let wiegand = Wiegand::new(mock.clone());
        wiegand.set_timing(mock_timing());

        let mut frames = Vec::new();
        thread::scope(|s| {
            let monitor = s.spawn(|| {
                wiegand.monitor(WiegandInterface::W1, |interface, frame| {
                    frames.push((interface, frame));
                    false
                })
            });

            wait_until(|| wiegand.is_running(WiegandInterface::W1));
            assert!(mock.is_watched(Input::Ttl1.gpio()));
            assert!(mock.is_watched(Input::Ttl2.gpio()));
            send_bits(&mock, WiegandInterface::W1, &[true, false, true, true, false]);

            monitor
                .join()
                .expect("Monitor panicked")
                .expect("Monitor failed");
        });

        assert_eq!(
            frames,
            vec![(
                WiegandInterface::W1,
                Frame {
                    bit_count: 5,
                    data: 0b10110
                }
            )]
        );
        assert!(!wiegand.is_running(WiegandInterface::W1));
    }

    #[test]
    fn stop_ends_monitor() {
        let mock = Arc::new(MockHardware::new());
        idle_lines(&mock);
        let wiegand = Wiegand::new(mock.clone());
        wiegand.set_timing(mock_timing());

        thread::scope(|s| {
            let monitor = s.spawn(|| wiegand.monitor(WiegandInterface::W2, |_, _| true));
            wait_until(|| wiegand.is_running(WiegandInterface::W2));

            assert!(matches!(
                wiegand.monitor(WiegandInterface::W2, |_, _| true),
                Err(IonoPiError::WiegandBusy(WiegandInterface::W2))
            ));

            assert!(wiegand.stop(WiegandInterface::W2));
            monitor
                .join()
                .expect("Monitor panicked")
                .expect("Monitor failed");
        });

        assert!(!wiegand.stop(WiegandInterface::W2));
        assert!(wiegand.is_registered(WiegandInterface::W2));
        assert!(!wiegand.is_registered(WiegandInterface::W1));
    }

    #[test]
    fn panicking_callback_leaves_interface_idle() {
        let mock = Arc::new(MockHardware::new());
        idle_lines(&mock);
        let wiegand = Wiegand::new(mock.clone());
        wiegand.set_timing(mock_timing());

        thread::scope(|s| {
            let monitor = s.spawn(|| {
                wiegand.monitor(WiegandInterface::W1, |_, _| panic!("Callback failed"))
            });
            wait_until(|| wiegand.is_running(WiegandInterface::W1));
            send_bits(&mock, WiegandInterface::W1, &[true, false, true, true]);
            assert!(monitor.join().is_err(), "Callback did not panic");
        });

        assert!(!wiegand.is_running(WiegandInterface::W1));
        assert!(!wiegand.stop(WiegandInterface::W1));
        send_bits(&mock, WiegandInterface::W1, &[true, true, true, true]);
        assert_eq!(wiegand.pending_bits(WiegandInterface::W1), 0);

        thread::scope(|s| {
            let monitor = s.spawn(|| wiegand.monitor(WiegandInterface::W1, |_, _| true));
            wait_until(|| wiegand.is_running(WiegandInterface::W1));
            wiegand.stop(WiegandInterface::W1);
            monitor
                .join()
                .expect("Monitor panicked")
                .expect("Monitor failed");
        });
    }

    #[test]
    fn pulses_ignored_when_not_running() {
        let mock = Arc::new(MockHardware::new());
        idle_lines(&mock);
        let wiegand = Wiegand::new(mock.clone());
        wiegand.set_timing(mock_timing());

        thread::scope(|s| {
            let monitor = s.spawn(|| wiegand.monitor(WiegandInterface::W1, |_, _| true));
            wait_until(|| wiegand.is_running(WiegandInterface::W1));
            wiegand.stop(WiegandInterface::W1);
            monitor
                .join()
                .expect("Monitor panicked")
                .expect("Monitor failed");
        });

        send_bits(&mock, WiegandInterface::W1, &[true, true, true, true]);
        assert_eq!(wiegand.pending_bits(WiegandInterface::W1), 0);
    }

    #[test]
    fn dropping_decoder_unwatches_lines() {
        let mock = Arc::new(MockHardware::new());
        let wiegand = Wiegand::new(mock.clone());
        wiegand.register(WiegandInterface::W1).expect("Bad register");
        wiegand.register(WiegandInterface::W1).expect("Bad register");
        assert!(mock.is_watched(Input::Ttl2.gpio()));

        drop(wiegand);
        assert!(!mock.is_watched(Input::Ttl1.gpio()));
        assert!(!mock.is_watched(Input::Ttl2.gpio()));
    }
}
