//! View model assembly and the UI task loop.
//!
//! The render surface is deliberately dumb: once per refresh (or
//! immediately after a button event) the UI task assembles a complete
//! [`ViewModel`] from the state machine, the sensor slots, and the link
//! handle, and hands it over. Rendering is fire-and-forget; a slow or
//! broken display can never stall input handling or sampling.

use embassy_futures::select::{Either, select};
use embassy_time::{Duration, Instant, Timer};
use heapless::Vec;

use crate::config::CoreConfig;
use crate::connectivity::{ConnectivityHandle, ConnectivityState};
use crate::input::EventChannel;
use crate::sensors::{
    LocationReading, SlotReader, Snapshot, TemperatureReading, VitalsReading,
};
use crate::state::{AppState, AppStateMachine, HotSourcesHandle, MAX_MENU_ENTRIES};

/// Everything a render surface needs for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewModel {
    pub state: AppState,
    /// False once the inactivity window has elapsed; the surface should
    /// show nothing until the next press wakes it.
    pub display_on: bool,
    pub title: &'static str,
    /// Labels of the current menu, empty off-menu.
    pub menu: Vec<&'static str, MAX_MENU_ENTRIES>,
    pub selected_index: usize,
    /// Scan completion percentage, present only while scanning.
    pub scan_progress_pct: Option<u8>,
    pub temperature: Snapshot<TemperatureReading>,
    pub vitals: Snapshot<VitalsReading>,
    pub location: Snapshot<LocationReading>,
    pub link: ConnectivityState,
}

impl ViewModel {
    /// Status line for the uplink, if one should be shown.
    pub fn link_notice(&self) -> Option<&'static str> {
        match self.link {
            ConnectivityState::Connecting => Some("connecting..."),
            ConnectivityState::Failed(_) => Some("failed to connect"),
            ConnectivityState::Down | ConnectivityState::Up => None,
        }
    }
}

/// Where frames go. Implementations must not block for long; there is no
/// backpressure from the display to the rest of the system.
pub trait RenderSurface {
    fn render(&mut self, view: &ViewModel);
}

/// Read-side handles the UI task snapshots each frame from.
pub struct ViewSources<'a> {
    temperature: SlotReader<'a, TemperatureReading>,
    vitals: SlotReader<'a, VitalsReading>,
    location: SlotReader<'a, LocationReading>,
    link: &'a ConnectivityHandle,
    scan_duration: Duration,
}

impl<'a> ViewSources<'a> {
    pub fn new(
        temperature: SlotReader<'a, TemperatureReading>,
        vitals: SlotReader<'a, VitalsReading>,
        location: SlotReader<'a, LocationReading>,
        link: &'a ConnectivityHandle,
        cfg: &CoreConfig,
    ) -> Self {
        Self {
            temperature,
            vitals,
            location,
            link,
            scan_duration: cfg.scan_duration(),
        }
    }

    /// Assemble one complete frame.
    pub fn view(&self, machine: &AppStateMachine, now: Instant) -> ViewModel {
        let mut menu = Vec::new();
        if let Some(entries) = machine.current_menu() {
            for entry in entries {
                // MAX_MENU_ENTRIES bounds every menu in the build.
                let _ = menu.push(entry.label);
            }
        }

        let scan_progress_pct = (machine.state() == AppState::TemperatureScanning)
            .then(|| self.scan_progress(machine, now))
            .flatten();

        ViewModel {
            state: machine.state(),
            display_on: machine.display_on(),
            title: machine.state().label(),
            menu,
            selected_index: machine.selected_index(),
            scan_progress_pct,
            temperature: self.temperature.snapshot(),
            vitals: self.vitals.snapshot(),
            location: self.location.snapshot(),
            link: self.link.get(),
        }
    }

    fn scan_progress(&self, machine: &AppStateMachine, now: Instant) -> Option<u8> {
        let start = machine.scan_started_at()?;
        let elapsed = now.checked_duration_since(start)?;
        let total = self.scan_duration.as_millis().max(1);
        let pct = (elapsed.as_millis().min(total) * 100) / total;
        Some(pct as u8)
    }
}

/// UI task loop: drains button events, advances time-driven transitions,
/// publishes the hot-source decision, and renders a frame.
pub async fn run_ui<R: RenderSurface>(
    events: &EventChannel,
    machine: &mut AppStateMachine,
    hot: &HotSourcesHandle,
    sources: &ViewSources<'_>,
    surface: &mut R,
    cfg: CoreConfig,
) -> ! {
    loop {
        match select(events.receive(), Timer::after(cfg.ui_refresh())).await {
            Either::First(event) => {
                machine.handle_button(event);
            }
            Either::Second(()) => {}
        }
        let now = Instant::now();
        machine.tick(now);
        hot.publish(machine.hot_sources());
        surface.render(&sources.view(machine, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{Button, ButtonEvent};
    use crate::sensors::SampleSlot;

    struct Fixture {
        temperature: SampleSlot<TemperatureReading>,
        vitals: SampleSlot<VitalsReading>,
        location: SampleSlot<LocationReading>,
        link: ConnectivityHandle,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                temperature: SampleSlot::new(),
                vitals: SampleSlot::new(),
                location: SampleSlot::new(),
                link: ConnectivityHandle::new(),
            }
        }
    }

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    #[test]
    fn menu_frame_lists_entries_and_selection() {
        let mut fx = Fixture::new();
        let (_, tr) = fx.temperature.split();
        let (_, vr) = fx.vitals.split();
        let (_, lr) = fx.location.split();
        let cfg = CoreConfig::default();
        let sources = ViewSources::new(tr, vr, lr, &fx.link, &cfg);

        let mut machine = AppStateMachine::new(&cfg);
        machine.handle_button(ButtonEvent {
            button: Button::Select,
            at: at(0),
        });
        machine.handle_button(ButtonEvent {
            button: Button::Down,
            at: at(300),
        });

        let view = sources.view(&machine, at(400));
        assert_eq!(view.state, AppState::Menu);
        assert!(view.display_on);
        assert_eq!(view.title, "Menu");
        assert_eq!(view.menu.len(), 5);
        assert_eq!(view.menu[0], "Dashboard");
        assert_eq!(view.selected_index, 1);
        assert_eq!(view.scan_progress_pct, None);
    }

    #[test]
    fn off_menu_frames_have_no_entries() {
        let mut fx = Fixture::new();
        let (_, tr) = fx.temperature.split();
        let (_, vr) = fx.vitals.split();
        let (_, lr) = fx.location.split();
        let cfg = CoreConfig::default();
        let sources = ViewSources::new(tr, vr, lr, &fx.link, &cfg);

        let machine = AppStateMachine::new(&cfg);
        let view = sources.view(&machine, at(0));
        assert_eq!(view.state, AppState::Home);
        assert!(view.menu.is_empty());
    }

    #[test]
    fn scan_frame_reports_progress() {
        let mut fx = Fixture::new();
        let (_, tr) = fx.temperature.split();
        let (_, vr) = fx.vitals.split();
        let (_, lr) = fx.location.split();
        let cfg = CoreConfig::default();
        let sources = ViewSources::new(tr, vr, lr, &fx.link, &cfg);

        let mut machine = AppStateMachine::new(&cfg);
        // Home -> Menu -> down to Body Temperature -> open -> start scan.
        for (button, ms) in [
            (Button::Select, 0),
            (Button::Down, 300),
            (Button::Down, 600),
            (Button::Select, 900),
            (Button::Select, 1_200),
        ] {
            machine.handle_button(ButtonEvent {
                button,
                at: at(ms),
            });
        }
        assert_eq!(machine.state(), AppState::TemperatureScanning);

        // Half of the 10 s scan has elapsed.
        let view = sources.view(&machine, at(6_200));
        assert_eq!(view.scan_progress_pct, Some(50));

        // Past the end the percentage clamps; completion itself is the
        // state machine's tick, not the view's.
        let view = sources.view(&machine, at(20_000));
        assert_eq!(view.scan_progress_pct, Some(100));
    }

    #[test]
    fn frame_carries_stale_reading_with_fresh_flag_down() {
        let mut fx = Fixture::new();
        let (mut tw, tr) = fx.temperature.split();
        let (_, vr) = fx.vitals.split();
        let (_, lr) = fx.location.split();
        let cfg = CoreConfig::default();

        tw.publish(TemperatureReading { celsius: 36.5 });
        tw.publish_failure();

        let sources = ViewSources::new(tr, vr, lr, &fx.link, &cfg);
        let machine = AppStateMachine::new(&cfg);
        let view = sources.view(&machine, at(0));
        assert!(!view.temperature.fresh);
        assert_eq!(
            view.temperature.reading,
            Some(TemperatureReading { celsius: 36.5 })
        );
    }

    #[test]
    fn blanked_display_is_reflected_in_the_frame() {
        let mut fx = Fixture::new();
        let (_, tr) = fx.temperature.split();
        let (_, vr) = fx.vitals.split();
        let (_, lr) = fx.location.split();
        let cfg = CoreConfig::default();
        let sources = ViewSources::new(tr, vr, lr, &fx.link, &cfg);

        let mut machine = AppStateMachine::new(&cfg);
        machine.tick(at(0));
        machine.tick(at(30_000));
        assert!(!sources.view(&machine, at(30_000)).display_on);

        machine.handle_button(ButtonEvent {
            button: Button::Up,
            at: at(35_000),
        });
        assert!(sources.view(&machine, at(35_000)).display_on);
    }

    #[test]
    fn link_notice_follows_connectivity() {
        let mut fx = Fixture::new();
        let (_, tr) = fx.temperature.split();
        let (_, vr) = fx.vitals.split();
        let (_, lr) = fx.location.split();
        let cfg = CoreConfig::default();
        let sources = ViewSources::new(tr, vr, lr, &fx.link, &cfg);
        let machine = AppStateMachine::new(&cfg);

        assert_eq!(sources.view(&machine, at(0)).link_notice(), None);

        fx.link.publish(ConnectivityState::Connecting);
        assert_eq!(
            sources.view(&machine, at(0)).link_notice(),
            Some("connecting...")
        );

        fx.link.publish(ConnectivityState::Failed(5));
        assert_eq!(
            sources.view(&machine, at(0)).link_notice(),
            Some("failed to connect")
        );

        fx.link.publish(ConnectivityState::Up);
        assert_eq!(sources.view(&machine, at(0)).link_notice(), None);
    }
}
