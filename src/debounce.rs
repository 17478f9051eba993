//! Software debouncing of the board's input lines.
//!
//! Edge interrupts only record what they saw and move the channel's deadline: every
//! decision about whether a level change is real, and every call into user code,
//! happens on a single confirmation worker thread.
//!
//! Each debounced channel has at most one confirmation queued at a time. An edge that
//! arrives while one is queued just pushes the channel's deadline back; when the queued
//! confirmation falls due early it is re-queued at the new deadline. Only a level that
//! is held for the whole debounce window is ever reported. Reconfiguring a channel bumps
//! its generation so anything queued under the old setting does nothing.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    fmt,
    str::FromStr,
    sync::{Arc, Condvar, Mutex, MutexGuard, Weak},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::{
    Input, IonoPiError, Level, Result,
    hardware::{EdgeEvent, Hardware},
};

/// Which debounced transitions are reported to the callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EdgeMode {
    /// Report changes to [`Level::High`] only.
    Rising,
    /// Report changes to [`Level::Low`] only.
    Falling,
    /// Report every change.
    #[default]
    Both,
}

impl EdgeMode {
    /// Whether a change to `level` is reported in this mode.
    pub fn accepts(self, level: Level) -> bool {
        match self {
            EdgeMode::Rising => level == Level::High,
            EdgeMode::Falling => level == Level::Low,
            EdgeMode::Both => true,
        }
    }
}

impl fmt::Display for EdgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EdgeMode::Rising => "rising",
            EdgeMode::Falling => "falling",
            EdgeMode::Both => "both",
        };
        f.write_str(name)
    }
}

impl FromStr for EdgeMode {
    type Err = IonoPiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rising" => Ok(EdgeMode::Rising),
            "falling" => Ok(EdgeMode::Falling),
            "both" => Ok(EdgeMode::Both),
            _ => Err(IonoPiError::UnknownEdgeMode(s.to_string())),
        }
    }
}

/// Function called with an input and its new level when a change is reported.
pub type DigitalCallback = Box<dyn Fn(Input, Level) + Send + Sync>;

//--------------------------------------------------------------------------------------

struct ChannelState {
    sample: Level,
    debounced: Level,
    window: Duration,
    edge_mode: EdgeMode,
    generation: u64,
    /// When the current sample will have been held for the whole window.
    due: Option<Instant>,
    /// A confirmation for this generation is in the queue.
    scheduled: bool,
    watched: bool,
    callback: Option<Arc<dyn Fn(Input, Level) + Send + Sync>>,
}

impl ChannelState {
    fn new(level: Level) -> Self {
        ChannelState {
            sample: level,
            debounced: level,
            window: Duration::ZERO,
            edge_mode: EdgeMode::default(),
            generation: 0,
            due: None,
            scheduled: false,
            watched: false,
            callback: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resolution {
    /// Report the channel's sample if it has been held until its deadline.
    Confirm,
    /// Debouncing is off: report the level as-is.
    Passthrough(Level),
}

#[derive(Debug)]
struct Confirmation {
    due: Instant,
    seq: u64,
    input: Input,
    generation: u64,
    resolution: Resolution,
}

impl PartialEq for Confirmation {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Confirmation {}

impl PartialOrd for Confirmation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Confirmation {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Default)]
struct Queue {
    pending: BinaryHeap<Reverse<Confirmation>>,
    next_seq: u64,
    shutdown: bool,
}

/// What the worker does with a confirmation once it falls due.
enum Outcome {
    Nothing,
    Requeue(Instant),
    Report(Level, Option<Arc<dyn Fn(Input, Level) + Send + Sync>>),
}

struct Shared {
    hardware: Arc<dyn Hardware>,
    channels: [Mutex<Option<ChannelState>>; Input::COUNT],
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

impl Shared {
    fn channel(&self, input: Input) -> MutexGuard<'_, Option<ChannelState>> {
        self.channels[input.index()]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Edge interrupt handler: sample, move the deadline, and queue if nothing is.
    fn on_edge(&self, input: Input, event: EdgeEvent) {
        let level = event.edge.level();
        let now = Instant::now();
        let (due, generation, resolution) = {
            let mut slot = self.channel(input);
            let Some(channel) = slot.as_mut() else {
                return;
            };
            channel.sample = level;
            if channel.window.is_zero() {
                if !channel.edge_mode.accepts(level) {
                    return;
                }
                (now, channel.generation, Resolution::Passthrough(level))
            } else {
                let Some(due) = now.checked_add(channel.window) else {
                    debug!("{input} debounce window never elapses: {level} not confirmed");
                    channel.due = None;
                    return;
                };
                channel.due = Some(due);
                if channel.scheduled {
                    return;
                }
                channel.scheduled = true;
                (due, channel.generation, Resolution::Confirm)
            }
        };

        if !self.enqueue(input, due, generation, resolution) {
            warn!("Debounce worker stopped: dropping {level} edge on {input}");
        }
    }

    /// Queue a confirmation. Returns `false` once the worker has been shut down.
    fn enqueue(
        &self,
        input: Input,
        due: Instant,
        generation: u64,
        resolution: Resolution,
    ) -> bool {
        let mut queue = self.queue();
        if queue.shutdown {
            return false;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.pending.push(Reverse(Confirmation {
            due,
            seq,
            input,
            generation,
            resolution,
        }));
        self.wakeup.notify_one();
        true
    }

    /// Block until the earliest confirmation falls due, or the worker is shut down.
    fn next_due(&self) -> Option<Confirmation> {
        let mut queue = self.queue();
        loop {
            if queue.shutdown {
                return None;
            }
            let now = Instant::now();
            match queue.pending.peek().map(|Reverse(c)| c.due) {
                Some(due) if due <= now => return queue.pending.pop().map(|Reverse(c)| c),
                Some(due) => {
                    queue = self
                        .wakeup
                        .wait_timeout(queue, due - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
                None => {
                    queue = self.wakeup.wait(queue).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    fn settle(&self, confirmation: &Confirmation) -> Outcome {
        let input = confirmation.input;
        let mut slot = self.channel(input);
        let Some(channel) = slot.as_mut() else {
            return Outcome::Nothing;
        };
        if channel.generation != confirmation.generation {
            debug!("Confirmation on {input} from an earlier setting ignored");
            return Outcome::Nothing;
        }
        let level = match confirmation.resolution {
            Resolution::Passthrough(level) => {
                channel.debounced = level;
                level
            }
            Resolution::Confirm => match channel.due {
                None => {
                    channel.scheduled = false;
                    return Outcome::Nothing;
                }
                Some(due) if due > confirmation.due => return Outcome::Requeue(due),
                Some(_) => {
                    channel.due = None;
                    channel.scheduled = false;
                    let level = channel.sample;
                    if channel.debounced == level {
                        debug!("{input} settled back at {level}");
                        return Outcome::Nothing;
                    }
                    channel.debounced = level;
                    debug!("{input} debounced to {level}");
                    if !channel.edge_mode.accepts(level) {
                        return Outcome::Nothing;
                    }
                    level
                }
            },
        };
        Outcome::Report(level, channel.callback.clone())
    }

    fn resolve(&self, confirmation: Confirmation) {
        let input = confirmation.input;
        match self.settle(&confirmation) {
            Outcome::Nothing | Outcome::Report(_, None) => (),
            Outcome::Requeue(due) => {
                self.enqueue(input, due, confirmation.generation, Resolution::Confirm);
            }
            // Called without any lock held so the callback is free to use the controller.
            Outcome::Report(level, Some(callback)) => callback(input, level),
        }
    }

    fn run(&self) {
        while let Some(confirmation) = self.next_due() {
            self.resolve(confirmation);
        }
        debug!("Debounce worker stopped");
    }
}

//--------------------------------------------------------------------------------------
/// Debounces the board's inputs and reports level changes to registered callbacks.
///
/// Each [`Input`] gets a channel the first time it is configured, through either
/// [`DebounceController::set_debounce()`] or [`DebounceController::on_change()`]. From
/// then on the line is watched on both edges. With a zero window every edge matching
/// the channel's [`EdgeMode`] is reported; with a non-zero window a level is reported
/// only once it has been held for the whole window.
///
/// Callbacks are invoked on the controller's worker thread, in order per input.
pub struct DebounceController {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DebounceController {
    /// Create a controller and start its confirmation worker.
    pub fn new(hardware: Arc<dyn Hardware>) -> Result<Self> {
        let shared = Arc::new(Shared {
            hardware,
            channels: std::array::from_fn(|_| Mutex::new(None)),
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("ionopi-debounce".to_string())
            .spawn(move || worker_shared.run())
            .map_err(|source| IonoPiError::WorkerSpawn { source })?;
        Ok(DebounceController {
            shared,
            worker: Some(worker),
        })
    }

    /// Set the debounce window for an input.
    ///
    /// A zero window turns debouncing off so every matching edge is reported as it
    /// arrives. Otherwise the present level of the line becomes the debounced baseline.
    /// Either way, any confirmation still pending from the previous setting is
    /// abandoned.
    pub fn set_debounce(&self, input: Input, window: Duration) -> Result<()> {
        let level = self.shared.hardware.read(input.gpio())?;
        {
            let mut slot = self.shared.channel(input);
            let channel = slot.get_or_insert_with(|| ChannelState::new(level));
            channel.window = window;
            channel.generation = channel.generation.wrapping_add(1);
            channel.due = None;
            channel.scheduled = false;
            channel.sample = level;
            channel.debounced = level;
        }
        debug!("{input} debounce window set to {window:?}");
        self.arm(input)
    }

    /// Register (or replace) the callback and edge policy for an input.
    ///
    /// Passing `None` for the callback disables delivery but the input carries on being
    /// sampled and debounced.
    pub fn on_change(
        &self,
        input: Input,
        edge_mode: EdgeMode,
        callback: Option<DigitalCallback>,
    ) -> Result<()> {
        let level = self.shared.hardware.read(input.gpio())?;
        {
            let mut slot = self.shared.channel(input);
            let channel = slot.get_or_insert_with(|| ChannelState::new(level));
            channel.edge_mode = edge_mode;
            channel.callback = callback.map(Arc::from);
        }
        debug!("{input} reporting {edge_mode} changes");
        self.arm(input)
    }

    /// The debounced level if a debounce window is set, otherwise the level on the line.
    pub fn read(&self, input: Input) -> Result<Level> {
        if let Some(channel) = self.shared.channel(input).as_ref() {
            if !channel.window.is_zero() {
                return Ok(channel.debounced);
            }
        }
        self.shared.hardware.read(input.gpio())
    }

    /// The debounce window configured for an input, if it has a channel.
    pub fn window(&self, input: Input) -> Option<Duration> {
        self.shared.channel(input).as_ref().map(|c| c.window)
    }

    /// Whether a confirmation is outstanding for an input.
    pub fn is_pending(&self, input: Input) -> bool {
        self.shared
            .channel(input)
            .as_ref()
            .is_some_and(|c| c.due.is_some())
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.shared.queue().pending.len()
    }

    /// Whether an input has been configured and is being watched.
    pub fn is_configured(&self, input: Input) -> bool {
        self.shared.channel(input).is_some()
    }

    /// Start watching the line if it isn't already.
    fn arm(&self, input: Input) -> Result<()> {
        {
            let mut slot = self.shared.channel(input);
            match slot.as_mut() {
                Some(channel) if !channel.watched => channel.watched = true,
                _ => return Ok(()),
            }
        }

        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let watched = self.shared.hardware.watch(
            input.gpio(),
            Box::new(move |event| {
                if let Some(shared) = shared.upgrade() {
                    shared.on_edge(input, event);
                }
            }),
        );
        if let Err(e) = watched {
            if let Some(channel) = self.shared.channel(input).as_mut() {
                channel.watched = false;
            }
            return Err(e);
        }
        info!("Watching {input} for digital changes");
        Ok(())
    }
}

impl Drop for DebounceController {
    fn drop(&mut self) {
        self.shared.queue().shutdown = true;
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Debounce worker panicked");
            }
        }
        for input in Input::ALL {
            let watched = self
                .shared
                .channel(input)
                .as_ref()
                .is_some_and(|c| c.watched);
            if watched {
                if let Err(e) = self.shared.hardware.unwatch(input.gpio()) {
                    warn!("Failed to stop watching {input}: {e}");
                }
            }
        }
    }
}
