//! Telemetry queue, single-flight send gate, and uplink dispatch.
//!
//! Producers enqueue [`TelemetryMessage`]s without blocking; a full queue
//! drops the newest message and counts the drop. The dispatch task pops
//! messages only while the uplink is up, serializes actual sends through
//! the [`SendGate`], and enforces a pause between consecutive sends so the
//! radio stack is never flooded.

use core::future::Future;
use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_time::{Duration, Timer, with_timeout};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::config::CoreConfig;
use crate::connectivity::{ConnectivityHandle, ConnectivityState};

/// Depth of the outbound telemetry queue.
pub const TELEMETRY_QUEUE_DEPTH: usize = 10;

/// One outbound reading, encoded with postcard on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TelemetryMessage {
    Temperature { celsius: f32 },
    Vitals { heart_rate: u16, spo2: u8 },
    Location { latitude: f64, longitude: f64 },
}

impl TelemetryMessage {
    /// Upper bound on the postcard encoding of any variant.
    pub const MAX_ENCODED_LEN: usize = 24;

    /// Uplink topic this message publishes to.
    pub fn topic(&self) -> &'static str {
        match self {
            TelemetryMessage::Temperature { .. } => "vitals/temperature",
            TelemetryMessage::Vitals { .. } => "vitals/health",
            TelemetryMessage::Location { .. } => "vitals/location",
        }
    }

    pub fn encode<'a>(&self, buf: &'a mut [u8]) -> Result<&'a mut [u8], postcard::Error> {
        postcard::to_slice(self, buf)
    }
}

/// Bounded multi-producer telemetry queue with an explicit drop counter.
pub struct TelemetryQueue {
    channel: Channel<CriticalSectionRawMutex, TelemetryMessage, TELEMETRY_QUEUE_DEPTH>,
    dropped: AtomicU32,
}

impl TelemetryQueue {
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
            dropped: AtomicU32::new(0),
        }
    }

    /// Enqueue without blocking. Returns false if the queue was full, in
    /// which case the message is dropped and counted.
    pub fn try_enqueue(&self, message: TelemetryMessage) -> bool {
        if self.channel.try_send(message).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("telemetry queue full, dropping {message:?}");
            return false;
        }
        true
    }

    /// Wait for the next queued message.
    pub async fn next(&self) -> TelemetryMessage {
        self.channel.receive().await
    }

    pub fn try_next(&self) -> Option<TelemetryMessage> {
        self.channel.try_receive().ok()
    }

    /// Messages dropped because the queue was full.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for TelemetryQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-flight gate over the physical uplink.
///
/// At most one send is in flight at any time; everything else about the
/// dispatcher can run concurrently with a send.
pub struct SendGate {
    inner: Mutex<CriticalSectionRawMutex, ()>,
}

impl SendGate {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    /// Acquire the gate, waiting at most `timeout`. `None` means the gate
    /// stayed busy for the whole bound.
    pub async fn acquire(&self, timeout: Duration) -> Option<SendPermit<'_>> {
        match with_timeout(timeout, self.inner.lock()).await {
            Ok(guard) => Some(SendPermit { _guard: guard }),
            Err(_) => None,
        }
    }
}

impl Default for SendGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Permission to perform exactly one send; dropping it reopens the gate.
pub struct SendPermit<'a> {
    _guard: MutexGuard<'a, CriticalSectionRawMutex, ()>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The uplink refused or failed to deliver the payload.
    #[error("uplink rejected the payload")]
    Rejected,
    /// The message did not fit its encoding buffer.
    #[error("payload could not be encoded")]
    Encode,
}

/// The physical uplink seam: one topic, one encoded payload per call.
pub trait TransportSender {
    fn name(&self) -> &'static str;

    fn send(
        &mut self,
        topic: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), SendError>>;
}

/// What one pass of the dispatcher did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The link was not up; nothing was popped.
    Deferred,
    /// The link dropped after the message was popped; it was discarded.
    LinkLost,
    /// A message went out, carrying its encoded size.
    Sent(usize),
    /// The gate stayed busy past its bound; the message was discarded.
    GateTimeout,
    /// Encoding or the uplink itself failed; the message was discarded.
    SendFailed,
}

/// Pop and send at most one message.
///
/// Messages are popped only while the link is up, so nothing queued is
/// lost to a downed link, and the link is re-checked at every suspension
/// point between popping and the actual send. Once popped, a message that
/// cannot be sent is discarded rather than re-queued; the next sample
/// supersedes it anyway.
pub async fn dispatch_next<S: TransportSender>(
    queue: &TelemetryQueue,
    gate: &SendGate,
    link: &ConnectivityHandle,
    sender: &mut S,
    cfg: &CoreConfig,
) -> DispatchOutcome {
    if link.get() != ConnectivityState::Up {
        return DispatchOutcome::Deferred;
    }
    let message = queue.next().await;

    // The wait on an empty queue can outlive the link; the transport is
    // only ever invoked while the link reports up.
    if link.get() != ConnectivityState::Up {
        warn!("link dropped while waiting for work, discarding {message:?}");
        return DispatchOutcome::LinkLost;
    }

    let Some(permit) = gate.acquire(cfg.send_gate_timeout()).await else {
        warn!("send gate busy past its bound, discarding {message:?}");
        return DispatchOutcome::GateTimeout;
    };

    if link.get() != ConnectivityState::Up {
        warn!("link dropped while acquiring the gate, discarding {message:?}");
        return DispatchOutcome::LinkLost;
    }

    let mut buf = [0u8; TelemetryMessage::MAX_ENCODED_LEN];
    let payload = match message.encode(&mut buf) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("failed to encode {message:?}: {e:?}");
            return DispatchOutcome::SendFailed;
        }
    };
    let len = payload.len();

    let outcome = match sender.send(message.topic(), payload).await {
        Ok(()) => {
            debug!("sent {len} bytes to {} via {}", message.topic(), sender.name());
            DispatchOutcome::Sent(len)
        }
        Err(e) => {
            warn!("{} send failed: {e}", sender.name());
            DispatchOutcome::SendFailed
        }
    };
    drop(permit);

    // Back-to-back sends are throttled even when the queue is deep.
    Timer::after(cfg.inter_send_delay()).await;
    outcome
}

/// Dispatch task loop. While the link is down it polls the link state
/// instead of popping messages.
pub async fn run_dispatch<S: TransportSender>(
    queue: &TelemetryQueue,
    gate: &SendGate,
    link: &ConnectivityHandle,
    sender: &mut S,
    cfg: CoreConfig,
) -> ! {
    loop {
        if dispatch_next(queue, gate, link, sender, &cfg).await == DispatchOutcome::Deferred {
            Timer::after(cfg.link_poll()).await;
        }
    }
}
