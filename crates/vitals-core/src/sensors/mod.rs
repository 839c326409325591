//! Sensor sources and last-known-good sample slots.
//!
//! Each source owns exactly one [`SampleSlot`]: a single-writer,
//! multi-reader cell holding the most recent successfully validated
//! reading. The writer replaces the whole value inside a short critical
//! section and readers receive a copy, never a live reference, so a reader
//! can never observe a half-written sample.
//!
//! On a failed poll the stored reading is retained and only the freshness
//! flag drops; the UI renders that as an explicit sensor-error sentinel
//! while still being able to show the last good value.

mod mlx90614;

pub use mlx90614::{MLX90614_ADDR, Mlx90614};

use core::cell::Cell;
use core::future::Future;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Timer};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::bus::{BusArbiter, BusError, BusGuard, BusTransport};
use crate::config::CoreConfig;
use crate::state::{HotSourcesHandle, SourceMask};
use crate::telemetry::{TelemetryMessage, TelemetryQueue};

/// Object temperature in degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub celsius: f32,
}

/// Heart rate and blood oxygen saturation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VitalsReading {
    pub heart_rate: u16,
    pub spo2: u8,
}

/// A position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationReading {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Clone, Copy)]
struct SlotValue<T: Copy> {
    reading: Option<T>,
    fresh: bool,
}

/// Copy of a slot's contents handed to readers.
///
/// `reading` is the last-known-good value (None until the first successful
/// poll); `fresh` is false while the most recent poll failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot<T: Copy> {
    pub reading: Option<T>,
    pub fresh: bool,
}

/// Single-writer, multi-reader slot for one sensor's last sample.
///
/// Created once (typically in a static) and split into exactly one
/// [`SlotWriter`] and any number of [`SlotReader`]s.
pub struct SampleSlot<T: Copy> {
    inner: BlockingMutex<CriticalSectionRawMutex, Cell<SlotValue<T>>>,
}

impl<T: Copy> SampleSlot<T> {
    pub const fn new() -> Self {
        Self {
            inner: BlockingMutex::new(Cell::new(SlotValue {
                reading: None,
                fresh: false,
            })),
        }
    }

    /// Split into the writer half and a cloneable reader half.
    ///
    /// Takes `&mut self` so the single-writer rule is enforced by the
    /// borrow: the slot cannot be split twice while a writer is live.
    pub fn split(&mut self) -> (SlotWriter<'_, T>, SlotReader<'_, T>) {
        (SlotWriter { slot: self }, SlotReader { slot: self })
    }
}

impl<T: Copy> Default for SampleSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive writer half of a [`SampleSlot`].
pub struct SlotWriter<'a, T: Copy> {
    slot: &'a SampleSlot<T>,
}

impl<T: Copy> SlotWriter<'_, T> {
    /// Replace the stored reading with a validated one.
    pub fn publish(&mut self, reading: T) {
        self.slot.inner.lock(|cell| {
            cell.set(SlotValue {
                reading: Some(reading),
                fresh: true,
            })
        });
    }

    /// Record a failed poll: the last-known-good reading is retained,
    /// only the freshness drops.
    pub fn publish_failure(&mut self) {
        self.slot.inner.lock(|cell| {
            let mut value = cell.get();
            value.fresh = false;
            cell.set(value);
        });
    }
}

/// Read-only half of a [`SampleSlot`].
#[derive(Clone, Copy)]
pub struct SlotReader<'a, T: Copy> {
    slot: &'a SampleSlot<T>,
}

impl<T: Copy> SlotReader<'_, T> {
    pub fn snapshot(&self) -> Snapshot<T> {
        self.slot.inner.lock(|cell| {
            let value = cell.get();
            Snapshot {
                reading: value.reading,
                fresh: value.fresh,
            }
        })
    }
}

/// A sensor driver that performs one complete read under a held bus guard.
///
/// The entire transaction sequence of a read must happen under the single
/// guard passed in; a probe must never stash bus access for later.
pub trait Probe<B: BusTransport> {
    type Reading: Copy;

    fn read(
        &mut self,
        bus: &mut BusGuard<'_, B>,
    ) -> impl Future<Output = Result<Self::Reading, BusError>>;
}

struct Source<'a, P, T: Copy> {
    probe: P,
    slot: SlotWriter<'a, T>,
}

impl<'a, P, T: Copy> Source<'a, P, T> {
    fn new(probe: P, slot: SlotWriter<'a, T>) -> Self {
        Self { probe, slot }
    }
}

/// Owns the three sensor sources and polls whichever ones the state
/// machine marked hot, each under its own bounded bus acquisition.
///
/// Bus timeouts and protocol errors are recovered locally as "sample
/// invalid this cycle"; they never propagate further.
pub struct SensorHub<'a, B, TP, VP, LP>
where
    B: BusTransport,
    TP: Probe<B, Reading = TemperatureReading>,
    VP: Probe<B, Reading = VitalsReading>,
    LP: Probe<B, Reading = LocationReading>,
{
    arbiter: &'a BusArbiter<B>,
    telemetry: &'a TelemetryQueue,
    acquire_timeout: Duration,
    temperature: Source<'a, TP, TemperatureReading>,
    vitals: Source<'a, VP, VitalsReading>,
    location: Source<'a, LP, LocationReading>,
    last_vitals_sent: Option<VitalsReading>,
}

impl<'a, B, TP, VP, LP> SensorHub<'a, B, TP, VP, LP>
where
    B: BusTransport,
    TP: Probe<B, Reading = TemperatureReading>,
    VP: Probe<B, Reading = VitalsReading>,
    LP: Probe<B, Reading = LocationReading>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        arbiter: &'a BusArbiter<B>,
        telemetry: &'a TelemetryQueue,
        cfg: &CoreConfig,
        temperature: (TP, SlotWriter<'a, TemperatureReading>),
        vitals: (VP, SlotWriter<'a, VitalsReading>),
        location: (LP, SlotWriter<'a, LocationReading>),
    ) -> Self {
        Self {
            arbiter,
            telemetry,
            acquire_timeout: cfg.bus_acquire_timeout(),
            temperature: Source::new(temperature.0, temperature.1),
            vitals: Source::new(vitals.0, vitals.1),
            location: Source::new(location.0, location.1),
            last_vitals_sent: None,
        }
    }

    /// Poll every source marked hot, once.
    ///
    /// Every valid temperature and location sample goes to telemetry;
    /// vitals are deduplicated on unchanged values.
    pub async fn poll_hot(&mut self, hot: SourceMask) {
        if hot.temperature {
            if let Some(reading) = poll_source(
                self.arbiter,
                self.acquire_timeout,
                "temperature",
                &mut self.temperature,
            )
            .await
            {
                self.telemetry.try_enqueue(TelemetryMessage::Temperature {
                    celsius: reading.celsius,
                });
            }
        }

        if hot.vitals {
            if let Some(reading) = poll_source(
                self.arbiter,
                self.acquire_timeout,
                "vitals",
                &mut self.vitals,
            )
            .await
                && self.last_vitals_sent != Some(reading)
                && self.telemetry.try_enqueue(TelemetryMessage::Vitals {
                    heart_rate: reading.heart_rate,
                    spo2: reading.spo2,
                })
            {
                self.last_vitals_sent = Some(reading);
            }
        }

        if hot.location {
            if let Some(reading) = poll_source(
                self.arbiter,
                self.acquire_timeout,
                "location",
                &mut self.location,
            )
            .await
            {
                self.telemetry.try_enqueue(TelemetryMessage::Location {
                    latitude: reading.latitude,
                    longitude: reading.longitude,
                });
            }
        }
    }
}

/// One bounded acquisition plus one probe read; any failure is recorded
/// in the slot and swallowed here.
async fn poll_source<'a, B, P>(
    arbiter: &BusArbiter<B>,
    acquire_timeout: Duration,
    owner: &'static str,
    source: &mut Source<'a, P, P::Reading>,
) -> Option<P::Reading>
where
    B: BusTransport,
    P: Probe<B>,
{
    match arbiter.acquire(acquire_timeout, owner).await {
        Ok(mut guard) => match source.probe.read(&mut guard).await {
            Ok(reading) => {
                source.slot.publish(reading);
                Some(reading)
            }
            Err(e) => {
                warn!("{owner} read failed: {e}");
                source.slot.publish_failure();
                None
            }
        },
        Err(e) => {
            warn!("{owner} could not acquire bus: {e}");
            source.slot.publish_failure();
            None
        }
    }
}

/// Periodic sampling task. The hot-source decision is re-read from the
/// shared handle once per loop.
pub async fn run_sampling<B, TP, VP, LP>(
    hub: &mut SensorHub<'_, B, TP, VP, LP>,
    hot: &HotSourcesHandle,
    cfg: CoreConfig,
) -> !
where
    B: BusTransport,
    TP: Probe<B, Reading = TemperatureReading>,
    VP: Probe<B, Reading = VitalsReading>,
    LP: Probe<B, Reading = LocationReading>,
{
    loop {
        hub.poll_hot(hot.get()).await;
        Timer::after(cfg.sensor_tick()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::mlx90614::tests::{frame, temp_to_raw};
    use embassy_futures::block_on;

    struct ConstVitals(VitalsReading);

    impl<B: BusTransport> Probe<B> for ConstVitals {
        type Reading = VitalsReading;

        async fn read(
            &mut self,
            _bus: &mut BusGuard<'_, B>,
        ) -> Result<VitalsReading, BusError> {
            Ok(self.0)
        }
    }

    struct ConstLocation(LocationReading);

    impl<B: BusTransport> Probe<B> for ConstLocation {
        type Reading = LocationReading;

        async fn read(
            &mut self,
            _bus: &mut BusGuard<'_, B>,
        ) -> Result<LocationReading, BusError> {
            Ok(self.0)
        }
    }

    /// Replays a scripted sequence of 3-byte reply frames.
    struct ScriptedBus {
        frames: std::vec::Vec<[u8; 3]>,
        next: usize,
    }

    impl ScriptedBus {
        fn new(frames: std::vec::Vec<[u8; 3]>) -> Self {
            Self { frames, next: 0 }
        }
    }

    impl BusTransport for ScriptedBus {
        async fn write_then_read(
            &mut self,
            _address: u8,
            _write: &[u8],
            read: &mut [u8],
        ) -> Result<(), BusError> {
            let frame = self.frames[self.next % self.frames.len()];
            self.next += 1;
            read.copy_from_slice(&frame[..read.len()]);
            Ok(())
        }
    }

    const VITALS: VitalsReading = VitalsReading {
        heart_rate: 72,
        spo2: 98,
    };
    const LOCATION: LocationReading = LocationReading {
        latitude: 21.028,
        longitude: 105.804,
    };

    fn hub_with_bus<'a>(
        arbiter: &'a BusArbiter<ScriptedBus>,
        telemetry: &'a TelemetryQueue,
        temp: SlotWriter<'a, TemperatureReading>,
        vit: SlotWriter<'a, VitalsReading>,
        loc: SlotWriter<'a, LocationReading>,
    ) -> SensorHub<'a, ScriptedBus, Mlx90614, ConstVitals, ConstLocation> {
        SensorHub::new(
            arbiter,
            telemetry,
            &CoreConfig::default(),
            (Mlx90614::new(), temp),
            (ConstVitals(VITALS), vit),
            (ConstLocation(LOCATION), loc),
        )
    }

    #[test]
    fn slot_retains_last_good_reading_across_failures() {
        let mut slot = SampleSlot::new();
        let (mut writer, reader) = slot.split();

        assert_eq!(
            reader.snapshot(),
            Snapshot {
                reading: None,
                fresh: false
            }
        );

        writer.publish(TemperatureReading { celsius: 36.5 });
        let snap = reader.snapshot();
        assert!(snap.fresh);
        assert_eq!(snap.reading, Some(TemperatureReading { celsius: 36.5 }));

        writer.publish_failure();
        let snap = reader.snapshot();
        assert!(!snap.fresh);
        assert_eq!(snap.reading, Some(TemperatureReading { celsius: 36.5 }));
    }

    #[test]
    fn checksum_failure_keeps_last_known_good() {
        let good = frame(temp_to_raw(36.5));
        let mut bad = good;
        bad[2] ^= 0xFF; // corrupt the PEC byte

        let arbiter = BusArbiter::new(
            ScriptedBus::new(std::vec![good, bad]),
            Duration::from_millis(50),
        );
        let telemetry = TelemetryQueue::new();
        let mut temp_slot = SampleSlot::new();
        let mut vit_slot = SampleSlot::new();
        let mut loc_slot = SampleSlot::new();
        let (tw, tr) = temp_slot.split();
        let (vw, _) = vit_slot.split();
        let (lw, _) = loc_slot.split();
        let mut hub = hub_with_bus(&arbiter, &telemetry, tw, vw, lw);

        let mask = SourceMask {
            temperature: true,
            ..SourceMask::IDLE
        };

        block_on(hub.poll_hot(mask));
        let first = tr.snapshot();
        assert!(first.fresh);
        let good_reading = first.reading.expect("first poll valid");

        // Second poll replies with a corrupted checksum: invalid this
        // cycle, last-known-good untouched.
        block_on(hub.poll_hot(mask));
        let second = tr.snapshot();
        assert!(!second.fresh);
        assert_eq!(second.reading, Some(good_reading));
    }

    #[test]
    fn unchanged_vitals_are_not_re_enqueued() {
        let arbiter = BusArbiter::new(
            ScriptedBus::new(std::vec![frame(temp_to_raw(36.5))]),
            Duration::from_millis(50),
        );
        let telemetry = TelemetryQueue::new();
        let mut temp_slot = SampleSlot::new();
        let mut vit_slot = SampleSlot::new();
        let mut loc_slot = SampleSlot::new();
        let (tw, _) = temp_slot.split();
        let (vw, vr) = vit_slot.split();
        let (lw, _) = loc_slot.split();
        let mut hub = hub_with_bus(&arbiter, &telemetry, tw, vw, lw);

        let mask = SourceMask {
            vitals: true,
            ..SourceMask::IDLE
        };
        block_on(hub.poll_hot(mask));
        block_on(hub.poll_hot(mask));
        block_on(hub.poll_hot(mask));

        // The slot always reflects the latest poll...
        assert_eq!(vr.snapshot().reading, Some(VITALS));
        // ...but identical readings produce exactly one telemetry message.
        assert!(telemetry.try_next().is_some());
        assert!(telemetry.try_next().is_none());
    }

    #[test]
    fn repeated_temperature_readings_each_produce_telemetry() {
        // The same valid frame replays forever: the reading never changes.
        let arbiter = BusArbiter::new(
            ScriptedBus::new(std::vec![frame(temp_to_raw(36.5))]),
            Duration::from_millis(50),
        );
        let telemetry = TelemetryQueue::new();
        let mut temp_slot = SampleSlot::new();
        let mut vit_slot = SampleSlot::new();
        let mut loc_slot = SampleSlot::new();
        let (tw, _) = temp_slot.split();
        let (vw, _) = vit_slot.split();
        let (lw, _) = loc_slot.split();
        let mut hub = hub_with_bus(&arbiter, &telemetry, tw, vw, lw);

        let mask = SourceMask {
            temperature: true,
            ..SourceMask::IDLE
        };
        block_on(hub.poll_hot(mask));
        block_on(hub.poll_hot(mask));
        block_on(hub.poll_hot(mask));

        // Unlike vitals, temperature samples are never deduplicated.
        for _ in 0..3 {
            assert!(matches!(
                telemetry.try_next(),
                Some(TelemetryMessage::Temperature { .. })
            ));
        }
        assert!(telemetry.try_next().is_none());
    }

    #[test]
    fn idle_sources_are_not_polled() {
        let arbiter = BusArbiter::new(ScriptedBus::new(std::vec![]), Duration::from_millis(50));
        let telemetry = TelemetryQueue::new();
        let mut temp_slot = SampleSlot::new();
        let mut vit_slot = SampleSlot::new();
        let mut loc_slot = SampleSlot::new();
        let (tw, tr) = temp_slot.split();
        let (vw, _) = vit_slot.split();
        let (lw, lr) = loc_slot.split();
        let mut hub = hub_with_bus(&arbiter, &telemetry, tw, vw, lw);

        // An all-idle mask touches neither the bus nor the slots; an empty
        // script would panic if the temperature probe ran.
        block_on(hub.poll_hot(SourceMask::IDLE));
        assert_eq!(tr.snapshot().reading, None);
        assert_eq!(lr.snapshot().reading, None);
        assert!(telemetry.try_next().is_none());
    }
}
