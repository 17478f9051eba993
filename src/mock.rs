//! In-memory stand-in for the Raspberry Pi hardware.
//!
//! Used by the unit tests and, with the `mockgpio` feature, by programs that want to
//! exercise the driver without an Iono Pi attached.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use log::debug;

use crate::{
    AnalogInput, Level, Result,
    hardware::{Edge, EdgeEvent, EdgeHandler, Hardware},
    maxdetect::MaxDetectFrame,
};

#[derive(Default)]
struct MockState {
    levels: HashMap<u8, Level>,
    handlers: HashMap<u8, Arc<Mutex<EdgeHandler>>>,
    writes: HashMap<u8, Vec<Level>>,
    analog: [u16; 4],
    max_detect: HashMap<u8, VecDeque<Option<MaxDetectFrame>>>,
}

/// Mock [`Hardware`].
///
/// Lines start low. Changing the level of a watched line with
/// [`MockHardware::set_level()`] or [`MockHardware::set_level_at()`] calls its handler
/// synchronously on the caller's thread.
pub struct MockHardware {
    state: Mutex<MockState>,
    epoch: Instant,
}

impl Default for MockHardware {
    fn default() -> Self {
        MockHardware {
            state: Mutex::new(MockState::default()),
            epoch: Instant::now(),
        }
    }
}

impl MockHardware {
    /// Create a mock with every line low and every ADC channel reading zero.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the level of a line, timestamping any resulting edge with the current time.
    pub fn set_level(&self, gpio: u8, level: Level) {
        self.set_level_at(gpio, level, self.now());
    }

    /// Set the level of a line, reporting any resulting edge with the given timestamp.
    ///
    /// Setting a line to the level it already has is not an edge and is ignored.
    pub fn set_level_at(&self, gpio: u8, level: Level, timestamp: Duration) {
        let handler = {
            let mut state = self.state();
            let previous = state.levels.insert(gpio, level).unwrap_or(Level::Low);
            if previous == level {
                return;
            }
            state.handlers.get(&gpio).cloned()
        };

        // The state lock is released so that the handler may run freely.
        if let Some(handler) = handler {
            let edge = match level {
                Level::High => Edge::Rising,
                Level::Low => Edge::Falling,
            };
            let mut handler = handler.lock().unwrap_or_else(|e| e.into_inner());
            (*handler)(EdgeEvent { edge, timestamp });
        }
    }

    /// The current level of a line.
    pub fn level(&self, gpio: u8) -> Level {
        self.state()
            .levels
            .get(&gpio)
            .copied()
            .unwrap_or(Level::Low)
    }

    /// Every level written to an output line, oldest first.
    pub fn writes(&self, gpio: u8) -> Vec<Level> {
        self.state().writes.get(&gpio).cloned().unwrap_or_default()
    }

    /// Whether an edge handler is registered on a line.
    pub fn is_watched(&self, gpio: u8) -> bool {
        self.state().handlers.contains_key(&gpio)
    }

    /// Set the raw value the ADC returns for an analog input.
    pub fn set_analog(&self, input: AnalogInput, raw: u16) {
        self.state().analog[input.index()] = raw & AnalogInput::MAX_RAW;
    }

    /// Queue the outcome of the next MaxDetect exchange on a line; `None` is a sensor
    /// that doesn't answer. Lines with nothing queued don't answer either.
    pub fn push_max_detect(&self, gpio: u8, response: Option<MaxDetectFrame>) {
        self.state()
            .max_detect
            .entry(gpio)
            .or_default()
            .push_back(response);
    }

    /// Number of MaxDetect responses queued on a line and not yet read.
    pub fn max_detect_queued(&self, gpio: u8) -> usize {
        self.state().max_detect.get(&gpio).map_or(0, VecDeque::len)
    }
}

impl Hardware for MockHardware {
    fn read(&self, gpio: u8) -> Result<Level> {
        Ok(self.level(gpio))
    }

    fn write(&self, gpio: u8, level: Level) -> Result<()> {
        let mut state = self.state();
        state.levels.insert(gpio, level);
        state.writes.entry(gpio).or_default().push(level);
        Ok(())
    }

    fn watch(&self, gpio: u8, handler: EdgeHandler) -> Result<()> {
        debug!("Mock watching GPIO {gpio}");
        self.state()
            .handlers
            .insert(gpio, Arc::new(Mutex::new(handler)));
        Ok(())
    }

    fn unwatch(&self, gpio: u8) -> Result<()> {
        self.state().handlers.remove(&gpio);
        Ok(())
    }

    fn analog_read(&self, input: AnalogInput) -> Result<u16> {
        Ok(self.state().analog[input.index()])
    }

    fn max_detect_read(&self, gpio: u8) -> Result<Option<MaxDetectFrame>> {
        Ok(self
            .state()
            .max_detect
            .get_mut(&gpio)
            .and_then(VecDeque::pop_front)
            .flatten())
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mock_fires_handler_on_change_only() {
        let mock = MockHardware::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        mock.watch(
            4,
            Box::new(move |event: EdgeEvent| sink.lock().unwrap().push(event.edge)),
        )
        .expect("Bad watch");

        mock.set_level(4, Level::High);
        mock.set_level(4, Level::High);
        mock.set_level(4, Level::Low);
        mock.set_level(5, Level::High);

        assert_eq!(*seen.lock().unwrap(), vec![Edge::Rising, Edge::Falling]);
        assert_eq!(mock.read(5).expect("Bad read"), Level::High);
    }

    #[test]
    fn mock_unwatch_silences_line() {
        let mock = MockHardware::new();
        let seen = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        mock.watch(4, Box::new(move |_: EdgeEvent| *sink.lock().unwrap() += 1))
            .expect("Bad watch");
        mock.unwatch(4).expect("Bad unwatch");
        mock.set_level(4, Level::High);
        assert_eq!(*seen.lock().unwrap(), 0);
        assert!(!mock.is_watched(4));
    }

    #[test]
    fn mock_records_writes_and_analog() {
        let mock = MockHardware::new();
        mock.write(17, Level::High).expect("Bad write");
        mock.write(17, Level::Low).expect("Bad write");
        assert_eq!(mock.writes(17), vec![Level::High, Level::Low]);

        mock.set_analog(AnalogInput::Ai2, 0x1234);
        assert_eq!(mock.analog_read(AnalogInput::Ai2).expect("Bad read"), 0x0234);
    }

    #[test]
    fn mock_max_detect_responses_in_order() {
        let mock = MockHardware::new();
        mock.push_max_detect(4, None);
        mock.push_max_detect(4, Some([1, 2, 3, 4, 10]));
        assert_eq!(mock.max_detect_queued(4), 2);

        assert_eq!(mock.max_detect_read(4).expect("Bad read"), None);
        assert_eq!(mock.max_detect_read(4).expect("Bad read"), Some([1, 2, 3, 4, 10]));
        assert_eq!(mock.max_detect_read(4).expect("Bad read"), None);
        assert_eq!(mock.max_detect_read(26).expect("Bad read"), None);
    }
}
