//! Desktop simulator for the vitals-rs wearable coordination core.
//!
//! Runs the real task loops from `vitals-core` against synthetic hardware:
//! a scripted button sequence walks the UI through the menus, a fake bus
//! answers sensor reads (with the occasional corrupted checksum), and the
//! uplink prints telemetry to the log instead of publishing it.
//!
//! Frames and telemetry go to stderr via `env_logger`; run with
//! `RUST_LOG=info` (or `debug` to see debounce and queue decisions).

use crc::{CRC_8_SMBUS, Crc};
use embassy_futures::block_on;
use embassy_futures::join::{join, join3};
use embassy_time::{Duration, Timer};
use log::info;

use vitals_core::bus::{BusArbiter, BusError, BusGuard, BusTransport};
use vitals_core::config::CoreConfig;
use vitals_core::connectivity::{
    CommandChannel, ConnectivityCommand, ConnectivityHandle, LinkDriver, LinkError, LinkEvent,
    LinkEventChannel, run_link_monitor,
};
use vitals_core::input::{
    Button, EdgeChannel, EdgeSender, EventChannel, run_input_pipeline,
};
use vitals_core::sensors::{
    LocationReading, MLX90614_ADDR, Mlx90614, Probe, SampleSlot, SensorHub, VitalsReading,
    run_sampling,
};
use vitals_core::state::{AppState, AppStateMachine, HotSourcesHandle};
use vitals_core::telemetry::{SendError, SendGate, TelemetryQueue, TransportSender, run_dispatch};
use vitals_core::ui::{RenderSurface, ViewModel, ViewSources, run_ui};

/// Simulated pulse oximeter address.
const PULSE_OX_ADDR: u8 = 0x57;

/// Simulated GPS receiver address.
const GPS_ADDR: u8 = 0x10;

const PEC: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Synthetic sensor bus. Readings drift sinusoidally so the UI visibly
/// changes, and every ninth thermometer reply arrives with a corrupted
/// checksum to exercise the last-known-good path.
struct SimBus {
    tick: u64,
}

impl BusTransport for SimBus {
    async fn write_then_read(
        &mut self,
        address: u8,
        write: &[u8],
        read: &mut [u8],
    ) -> Result<(), BusError> {
        self.tick += 1;
        let t = self.tick as f64;
        match address {
            MLX90614_ADDR => {
                let celsius = 36.6 + 0.4 * (t / 9.0).sin();
                let raw = ((celsius + 273.15) / 0.02) as u16;
                let [lsb, msb] = raw.to_le_bytes();
                let mut pec = PEC.checksum(&[
                    MLX90614_ADDR << 1,
                    write[0],
                    (MLX90614_ADDR << 1) | 1,
                    lsb,
                    msb,
                ]);
                if self.tick % 9 == 0 {
                    pec ^= 0x55;
                }
                read.copy_from_slice(&[lsb, msb, pec]);
                Ok(())
            }
            PULSE_OX_ADDR => {
                let heart_rate = (70.0 + 6.0 * (t / 5.0).sin()) as u16;
                read[..2].copy_from_slice(&heart_rate.to_le_bytes());
                read[2] = 97 + (self.tick % 2) as u8;
                Ok(())
            }
            GPS_ADDR => {
                let latitude = 21.0285 + 0.0001 * (t / 11.0).sin();
                let longitude = 105.8542 + 0.0001 * (t / 13.0).cos();
                read[..8].copy_from_slice(&latitude.to_le_bytes());
                read[8..16].copy_from_slice(&longitude.to_le_bytes());
                Ok(())
            }
            _ => Err(BusError::Nack),
        }
    }
}

struct PulseOximeter;

impl<B: BusTransport> Probe<B> for PulseOximeter {
    type Reading = VitalsReading;

    async fn read(&mut self, bus: &mut BusGuard<'_, B>) -> Result<VitalsReading, BusError> {
        let mut buf = [0u8; 3];
        bus.write_then_read(PULSE_OX_ADDR, &[0x00], &mut buf).await?;
        Ok(VitalsReading {
            heart_rate: u16::from_le_bytes([buf[0], buf[1]]),
            spo2: buf[2],
        })
    }
}

struct GpsReceiver;

impl<B: BusTransport> Probe<B> for GpsReceiver {
    type Reading = LocationReading;

    async fn read(&mut self, bus: &mut BusGuard<'_, B>) -> Result<LocationReading, BusError> {
        let mut buf = [0u8; 16];
        bus.write_then_read(GPS_ADDR, &[0x00], &mut buf).await?;
        let mut lat = [0u8; 8];
        let mut lon = [0u8; 8];
        lat.copy_from_slice(&buf[..8]);
        lon.copy_from_slice(&buf[8..]);
        Ok(LocationReading {
            latitude: f64::from_le_bytes(lat),
            longitude: f64::from_le_bytes(lon),
        })
    }
}

/// Uplink that prints instead of publishing.
struct ConsoleSender;

impl TransportSender for ConsoleSender {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), SendError> {
        info!("uplink {topic}: {payload:02x?}");
        Ok(())
    }
}

/// Radio whose link events come from the scenario script, not from here.
struct SimRadio;

impl LinkDriver for SimRadio {
    async fn connect(&mut self) -> Result<(), LinkError> {
        info!("radio: connect requested");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        info!("radio: disconnect requested");
        Ok(())
    }
}

/// Logs each frame that differs from the previous one.
struct ConsoleSurface {
    last: Option<ViewModel>,
}

impl RenderSurface for ConsoleSurface {
    fn render(&mut self, view: &ViewModel) {
        if self.last.as_ref() == Some(view) {
            return;
        }

        if !view.display_on {
            info!("(display blank)");
            self.last = Some(view.clone());
            return;
        }

        info!("---- {} ----", view.title);
        for (i, label) in view.menu.iter().enumerate() {
            let marker = if i == view.selected_index { ">" } else { " " };
            info!("{marker} {label}");
        }
        if let Some(pct) = view.scan_progress_pct {
            info!("scanning {pct:3}%");
        }
        match view.state {
            AppState::TemperatureResult => {
                if let Some(r) = view.temperature.reading {
                    info!("body temperature {:.2} C", r.celsius);
                }
            }
            AppState::HeartRate | AppState::Dashboard => {
                if let Some(r) = view.vitals.reading {
                    let staleness = if view.vitals.fresh { "" } else { " (stale)" };
                    info!("{} bpm, SpO2 {}%{staleness}", r.heart_rate, r.spo2);
                }
            }
            AppState::Location => {
                if let Some(r) = view.location.reading {
                    info!("at {:.4}, {:.4}", r.latitude, r.longitude);
                }
            }
            _ => {}
        }
        if let Some(notice) = view.link_notice() {
            info!("uplink: {notice}");
        }

        self.last = Some(view.clone());
    }
}

fn main() {
    env_logger::init();
    info!("starting vitals-rs simulator");

    // Shortened scan so the scripted run finishes quickly.
    let cfg = CoreConfig {
        scan_duration_ms: 2_000,
        ..CoreConfig::default()
    };

    let edges = EdgeChannel::new();
    let events = EventChannel::new();
    let commands = CommandChannel::new();
    let link_events = LinkEventChannel::new();
    let telemetry = TelemetryQueue::new();
    let gate = SendGate::new();
    let link = ConnectivityHandle::new();
    let hot = HotSourcesHandle::new();

    let mut temp_slot = SampleSlot::new();
    let mut vitals_slot = SampleSlot::new();
    let mut location_slot = SampleSlot::new();
    let (temp_w, temp_r) = temp_slot.split();
    let (vitals_w, vitals_r) = vitals_slot.split();
    let (location_w, location_r) = location_slot.split();

    let arbiter = BusArbiter::new(SimBus { tick: 0 }, cfg.bus_transaction_timeout());
    let mut hub = SensorHub::new(
        &arbiter,
        &telemetry,
        &cfg,
        (Mlx90614::new(), temp_w),
        (PulseOximeter, vitals_w),
        (GpsReceiver, location_w),
    );

    let mut machine = AppStateMachine::new(&cfg);
    let sources = ViewSources::new(temp_r, vitals_r, location_r, &link, &cfg);
    let mut surface = ConsoleSurface { last: None };
    let mut sender = ConsoleSender;
    let mut radio = SimRadio;
    let edge_sender = EdgeSender::new(&edges);

    let scenario = async {
        let press = |button: Button| edge_sender.on_edge(button);
        let pause = |ms: u64| Timer::after(Duration::from_millis(ms));

        pause(100).await;
        commands.send(ConnectivityCommand::Start).await;
        pause(200).await;
        link_events.send(LinkEvent::Established).await;
        pause(300).await;

        // Home -> Menu, walk down to Body Temperature, start a scan.
        press(Button::Select);
        pause(300).await;
        press(Button::Down);
        pause(300).await;
        press(Button::Down);
        pause(300).await;
        press(Button::Select);
        pause(300).await;
        press(Button::Select);

        // Let the shortened scan run to completion.
        pause(2_500).await;

        // Back out and open the heart rate screen.
        press(Button::Back);
        pause(300).await;
        press(Button::Down);
        pause(300).await;
        press(Button::Select);
        pause(1_500).await;

        // Drop the link mid-stream and let it recover.
        link_events.send(LinkEvent::Lost).await;
        pause(300).await;
        link_events.send(LinkEvent::Established).await;
        pause(500).await;

        press(Button::Back);
        pause(300).await;
        press(Button::Back);
        pause(300).await;
        commands.send(ConnectivityCommand::Stop).await;
        pause(200).await;

        info!(
            "scenario complete: {} edges dropped, {} telemetry messages dropped",
            edge_sender.dropped(),
            telemetry.dropped()
        );
        std::process::exit(0);
    };

    block_on(join(
        join3(
            run_input_pipeline(&edges, &events, cfg),
            run_sampling(&mut hub, &hot, cfg),
            run_dispatch(&telemetry, &gate, &link, &mut sender, cfg),
        ),
        join3(
            run_link_monitor(&commands, &link_events, &link, &mut radio, cfg),
            run_ui(&events, &mut machine, &hot, &sources, &mut surface, cfg),
            scenario,
        ),
    ));
}
