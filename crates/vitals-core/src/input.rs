//! Button input pipeline.
//!
//! Raw edge interrupts are captured into a bounded queue from interrupt
//! context and debounced by a task-context polling loop. Two independent
//! stages filter the stream:
//!
//! 1. a per-button hardware debounce window (default 50 ms) applied here
//!    before an edge becomes a [`ButtonEvent`];
//! 2. a coarser cooldown (default 200 ms) applied by the consumer of
//!    events — see [`Cooldown`] — that rejects any event arriving too soon
//!    after the previous accepted one, regardless of which button.
//!
//! Stage 1 alone would still let two different buttons fire within a few
//! milliseconds of each other; stage 2 alone would let one noisy pin flood
//! the queue. Both are required.
//!
//! If the edge queue is full the newest edge is dropped and counted —
//! inputs are not safety-critical, so drop-on-full is acceptable, but it is
//! explicit, never silent corruption.

use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant};
use log::{debug, warn};

use crate::config::CoreConfig;

/// Depth of the raw edge queue, matching the original GPIO event queue.
pub const EDGE_QUEUE_DEPTH: usize = 10;

/// Depth of the debounced event queue feeding the state machine.
pub const EVENT_QUEUE_DEPTH: usize = 10;

/// Physical buttons on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Select,
    Back,
    Up,
    Down,
}

impl Button {
    pub const COUNT: usize = 4;
    pub const ALL: [Button; Self::COUNT] =
        [Button::Select, Button::Back, Button::Up, Button::Down];

    const fn index(self) -> usize {
        match self {
            Button::Select => 0,
            Button::Back => 1,
            Button::Up => 2,
            Button::Down => 3,
        }
    }
}

/// A debounced button press, stamped with the time the edge was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    pub button: Button,
    pub at: Instant,
}

/// Bounded FIFO queue of raw edges, filled from interrupt context.
pub type EdgeChannel = Channel<CriticalSectionRawMutex, Button, EDGE_QUEUE_DEPTH>;

/// Bounded FIFO queue of debounced events; delivery order is acceptance
/// order, never reordered.
pub type EventChannel = Channel<CriticalSectionRawMutex, ButtonEvent, EVENT_QUEUE_DEPTH>;

/// Interrupt-context half of the pipeline.
///
/// `on_edge` is O(1) and never blocks; no panic or error crosses the
/// interrupt boundary.
pub struct EdgeSender<'a> {
    edges: &'a EdgeChannel,
    dropped: AtomicU32,
}

impl<'a> EdgeSender<'a> {
    pub const fn new(edges: &'a EdgeChannel) -> Self {
        Self {
            edges,
            dropped: AtomicU32::new(0),
        }
    }

    /// Record a raw edge for `button`. Callable from interrupt context.
    pub fn on_edge(&self, button: Button) {
        if self.edges.try_send(button).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of edges dropped because the queue was full.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Stage-1 debounce: one window per physical button.
pub struct Debouncer {
    window: Duration,
    last_accepted: [Option<Instant>; Button::COUNT],
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: [None; Button::COUNT],
        }
    }

    /// Accept or reject a raw edge observed at `at`.
    ///
    /// An edge within the window of the previously *accepted* edge for the
    /// same button is rejected. Different buttons debounce independently.
    pub fn accept(&mut self, button: Button, at: Instant) -> Option<ButtonEvent> {
        let slot = &mut self.last_accepted[button.index()];
        if let Some(prev) = *slot {
            match at.checked_duration_since(prev) {
                Some(elapsed) if elapsed >= self.window => {}
                // Within the window, or a timestamp that went backwards.
                _ => return None,
            }
        }
        *slot = Some(at);
        Some(ButtonEvent { button, at })
    }
}

/// Stage-2 cooldown, applied by the consumer of [`ButtonEvent`]s.
///
/// Rejects any event arriving before the cooldown from the previous
/// *accepted* event has elapsed, regardless of which button.
pub struct Cooldown {
    window: Duration,
    last_accepted: Option<Instant>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: None,
        }
    }

    /// Returns true and arms the cooldown if the event at `at` is accepted.
    pub fn try_accept(&mut self, at: Instant) -> bool {
        if let Some(prev) = self.last_accepted {
            match at.checked_duration_since(prev) {
                Some(elapsed) if elapsed >= self.window => {}
                _ => return false,
            }
        }
        self.last_accepted = Some(at);
        true
    }
}

/// Polling task: pulls raw edges, applies stage-1 debounce, and forwards
/// accepted events to the single registered consumer.
pub async fn run_input_pipeline(
    edges: &EdgeChannel,
    events: &EventChannel,
    cfg: CoreConfig,
) -> ! {
    let mut debouncer = Debouncer::new(cfg.debounce_window());
    loop {
        let button = edges.receive().await;
        let now = Instant::now();
        match debouncer.accept(button, now) {
            Some(event) => {
                if events.try_send(event).is_err() {
                    warn!("button event queue full, dropping {:?}", event.button);
                }
            }
            None => debug!("debounced {button:?} edge"),
        }
    }
}
