//! Uplink connectivity state machine and link monitor task.
//!
//! The radio itself lives behind [`LinkDriver`]; this module owns the
//! bookkeeping around it. Connect attempts are retried a bounded number of
//! times, and after the retry budget is exhausted the link parks in
//! [`ConnectivityState::Failed`] until an explicit start command resets it.
//! Every other task observes the link through the shared
//! [`ConnectivityHandle`] and never touches the radio directly.

use core::cell::Cell;
use core::future::Future;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_futures::select::{Either, select};
use log::{debug, info, warn};
use thiserror_no_std::Error;

use crate::config::CoreConfig;

/// Depth of the command and link-event queues.
pub const LINK_QUEUE_DEPTH: usize = 4;

/// Externally observable uplink state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Radio off or never started.
    Down,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected; telemetry may flow.
    Up,
    /// Retry budget exhausted after this many consecutive losses. Stays
    /// here until an explicit start.
    Failed(u8),
}

/// Requests from the rest of the system to the link monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityCommand {
    Start,
    Stop,
}

/// Notifications from the radio driver's event path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Established,
    Lost,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("radio rejected the command")]
    Radio,
}

/// The radio seam. `connect` starting successfully does not mean the link
/// is up; that arrives later as [`LinkEvent::Established`].
pub trait LinkDriver {
    fn connect(&mut self) -> impl Future<Output = Result<(), LinkError>>;
    fn disconnect(&mut self) -> impl Future<Output = Result<(), LinkError>>;
}

pub type CommandChannel = Channel<CriticalSectionRawMutex, ConnectivityCommand, LINK_QUEUE_DEPTH>;
pub type LinkEventChannel = Channel<CriticalSectionRawMutex, LinkEvent, LINK_QUEUE_DEPTH>;

/// Shared read-side view of the link state.
pub struct ConnectivityHandle {
    state: BlockingMutex<CriticalSectionRawMutex, Cell<ConnectivityState>>,
}

impl ConnectivityHandle {
    pub const fn new() -> Self {
        Self {
            state: BlockingMutex::new(Cell::new(ConnectivityState::Down)),
        }
    }

    pub fn publish(&self, state: ConnectivityState) {
        self.state.lock(|cell| cell.set(state));
    }

    pub fn get(&self) -> ConnectivityState {
        self.state.lock(|cell| cell.get())
    }
}

impl Default for ConnectivityHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Pure state machine behind the link monitor.
///
/// Methods returning `bool` tell the caller whether a fresh connect
/// attempt should begin.
pub struct LinkStateMachine {
    state: ConnectivityState,
    retries: u8,
    max_retries: u8,
}

impl LinkStateMachine {
    pub fn new(max_retries: u8) -> Self {
        Self {
            state: ConnectivityState::Down,
            retries: 0,
            max_retries,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// Begin (or restart) connecting. A start always clears the retry
    /// budget, including out of `Failed`.
    pub fn start(&mut self) -> bool {
        match self.state {
            ConnectivityState::Down | ConnectivityState::Failed(_) => {
                self.retries = 0;
                self.state = ConnectivityState::Connecting;
                true
            }
            ConnectivityState::Connecting | ConnectivityState::Up => false,
        }
    }

    pub fn stop(&mut self) {
        self.retries = 0;
        self.state = ConnectivityState::Down;
    }

    pub fn link_established(&mut self) {
        match self.state {
            ConnectivityState::Connecting | ConnectivityState::Up => {
                self.retries = 0;
                self.state = ConnectivityState::Up;
            }
            // A stale event from a torn-down attempt.
            ConnectivityState::Down | ConnectivityState::Failed(_) => {
                debug!("ignoring established event in {:?}", self.state);
            }
        }
    }

    /// A connect attempt failed or an established link dropped. Consumes
    /// one retry; once the budget is spent the machine parks in `Failed`.
    pub fn link_lost(&mut self) -> bool {
        match self.state {
            ConnectivityState::Connecting | ConnectivityState::Up => {
                self.retries = self.retries.saturating_add(1);
                if self.retries >= self.max_retries {
                    self.state = ConnectivityState::Failed(self.retries);
                    false
                } else {
                    self.state = ConnectivityState::Connecting;
                    true
                }
            }
            ConnectivityState::Down | ConnectivityState::Failed(_) => false,
        }
    }
}

/// Kick the radio and burn retries until an attempt starts cleanly or the
/// budget runs out.
async fn begin_attempt<D: LinkDriver>(driver: &mut D, machine: &mut LinkStateMachine) {
    loop {
        match driver.connect().await {
            Ok(()) => break,
            Err(e) => {
                warn!("connect attempt failed to start: {e}");
                if !machine.link_lost() {
                    break;
                }
            }
        }
    }
}

/// Link monitor task: serializes commands and radio events into the state
/// machine and publishes every resulting state.
pub async fn run_link_monitor<D: LinkDriver>(
    commands: &CommandChannel,
    events: &LinkEventChannel,
    handle: &ConnectivityHandle,
    driver: &mut D,
    cfg: CoreConfig,
) -> ! {
    let mut machine = LinkStateMachine::new(cfg.max_link_retries);
    let mut last = machine.state();
    loop {
        match select(commands.receive(), events.receive()).await {
            Either::First(ConnectivityCommand::Start) => {
                if machine.start() {
                    begin_attempt(driver, &mut machine).await;
                }
            }
            Either::First(ConnectivityCommand::Stop) => {
                machine.stop();
                if let Err(e) = driver.disconnect().await {
                    warn!("disconnect failed: {e}");
                }
            }
            Either::Second(LinkEvent::Established) => machine.link_established(),
            Either::Second(LinkEvent::Lost) => {
                if machine.link_lost() {
                    begin_attempt(driver, &mut machine).await;
                }
            }
        }
        let state = machine.state();
        if state != last {
            info!("uplink {last:?} -> {state:?}");
            last = state;
        }
        handle.publish(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};
    use embassy_futures::block_on;
    use embassy_time::{Duration, Timer};

    fn machine() -> LinkStateMachine {
        LinkStateMachine::new(5)
    }

    #[test]
    fn fifth_consecutive_loss_parks_in_failed() {
        let mut m = machine();
        assert!(m.start());
        for _ in 0..4 {
            assert!(m.link_lost(), "losses within budget retry");
            assert_eq!(m.state(), ConnectivityState::Connecting);
        }
        assert!(!m.link_lost(), "budget exhausted, no further retry");
        assert_eq!(m.state(), ConnectivityState::Failed(5));
    }

    #[test]
    fn established_link_clears_the_retry_budget() {
        let mut m = machine();
        m.start();
        m.link_lost();
        m.link_lost();
        m.link_established();
        assert_eq!(m.state(), ConnectivityState::Up);

        // A full budget of fresh losses is needed again.
        for _ in 0..4 {
            assert!(m.link_lost());
        }
        assert!(!m.link_lost());
        assert_eq!(m.state(), ConnectivityState::Failed(5));
    }

    #[test]
    fn losses_while_failed_or_down_are_ignored() {
        let mut m = machine();
        assert!(!m.link_lost());
        assert_eq!(m.state(), ConnectivityState::Down);

        m.start();
        for _ in 0..5 {
            m.link_lost();
        }
        assert_eq!(m.state(), ConnectivityState::Failed(5));
        assert!(!m.link_lost());
        assert_eq!(m.state(), ConnectivityState::Failed(5), "loss count frozen");
    }

    #[test]
    fn start_out_of_failed_gets_a_fresh_budget() {
        let mut m = machine();
        m.start();
        for _ in 0..5 {
            m.link_lost();
        }
        assert!(m.start());
        assert_eq!(m.state(), ConnectivityState::Connecting);
        assert!(m.link_lost(), "retry budget was reset");
    }

    #[test]
    fn stop_returns_to_down_from_anywhere() {
        let mut m = machine();
        m.start();
        m.link_established();
        m.stop();
        assert_eq!(m.state(), ConnectivityState::Down);

        assert!(!m.link_lost(), "events while down are inert");
        m.link_established();
        assert_eq!(m.state(), ConnectivityState::Down);
    }

    #[test]
    fn redundant_start_is_ignored() {
        let mut m = machine();
        assert!(m.start());
        assert!(!m.start(), "already connecting");
        m.link_established();
        assert!(!m.start(), "already up");
    }

    struct CountingDriver<'a> {
        connects: &'a AtomicU32,
        disconnects: &'a AtomicU32,
    }

    impl LinkDriver for CountingDriver<'_> {
        async fn connect(&mut self) -> Result<(), LinkError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), LinkError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn monitor_publishes_the_full_lifecycle() {
        let commands = CommandChannel::new();
        let events = LinkEventChannel::new();
        let handle = ConnectivityHandle::new();
        let connects = AtomicU32::new(0);
        let disconnects = AtomicU32::new(0);
        let mut driver = CountingDriver {
            connects: &connects,
            disconnects: &disconnects,
        };

        let script = async {
            let settle = || Timer::after(Duration::from_millis(5));

            commands.try_send(ConnectivityCommand::Start).unwrap();
            settle().await;
            assert_eq!(handle.get(), ConnectivityState::Connecting);
            assert_eq!(connects.load(Ordering::SeqCst), 1);

            events.try_send(LinkEvent::Established).unwrap();
            settle().await;
            assert_eq!(handle.get(), ConnectivityState::Up);

            events.try_send(LinkEvent::Lost).unwrap();
            settle().await;
            assert_eq!(handle.get(), ConnectivityState::Connecting);
            assert_eq!(connects.load(Ordering::SeqCst), 2);

            commands.try_send(ConnectivityCommand::Stop).unwrap();
            settle().await;
            assert_eq!(handle.get(), ConnectivityState::Down);
            assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        };

        // The monitor never returns; the script side finishing ends the
        // test.
        block_on(async {
            match select(
                run_link_monitor(&commands, &events, &handle, &mut driver, CoreConfig::default()),
                script,
            )
            .await
            {
                Either::First(never) => match never {},
                Either::Second(()) => {}
            }
        });
    }
}
