//! Application state machine.
//!
//! Owns the current UI mode, the menu selection, the temperature scan
//! bookkeeping, and the display-blanking inactivity clock. Transitions are
//! computed by a total function over
//! `(state, button)` and applied together with a typed side effect, rather
//! than scattered through a `switch` with fallthrough risk.
//!
//! The machine is also the sole authority for which sensor sources are
//! "hot" (actively polled each tick): sources not needed by the current
//! screen are idle, which keeps bus contention and power draw down.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Instant};
use log::{debug, info, warn};

use crate::config::CoreConfig;
use crate::input::{Button, ButtonEvent, Cooldown};

/// Maximum number of entries a menu can hold.
pub const MAX_MENU_ENTRIES: usize = 8;

/// UI modes of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Home,
    Menu,
    Settings,
    Notifications,
    TemperatureIdle,
    TemperatureScanning,
    TemperatureResult,
    HeartRate,
    Location,
    Dashboard,
    WifiSettings,
    BluetoothSettings,
}

impl AppState {
    pub const ALL: [AppState; 12] = [
        AppState::Home,
        AppState::Menu,
        AppState::Settings,
        AppState::Notifications,
        AppState::TemperatureIdle,
        AppState::TemperatureScanning,
        AppState::TemperatureResult,
        AppState::HeartRate,
        AppState::Location,
        AppState::Dashboard,
        AppState::WifiSettings,
        AppState::BluetoothSettings,
    ];

    /// Screen title shown by the render surface.
    pub const fn label(self) -> &'static str {
        match self {
            AppState::Home => "Home",
            AppState::Menu => "Menu",
            AppState::Settings => "Settings",
            AppState::Notifications => "Notifications",
            AppState::TemperatureIdle => "Body Temperature",
            AppState::TemperatureScanning => "Scanning...",
            AppState::TemperatureResult => "Scan Result",
            AppState::HeartRate => "Heart Rate + SpO2",
            AppState::Location => "Foot Tracking",
            AppState::Dashboard => "Dashboard",
            AppState::WifiSettings => "Wi-Fi",
            AppState::BluetoothSettings => "Bluetooth",
        }
    }
}

/// One selectable menu entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MenuEntry {
    pub label: &'static str,
    pub target: AppState,
}

/// The main menu, entered from Home with Select.
pub const MAIN_MENU: [MenuEntry; 5] = [
    MenuEntry {
        label: "Dashboard",
        target: AppState::Dashboard,
    },
    MenuEntry {
        label: "Foot Tracking",
        target: AppState::Location,
    },
    MenuEntry {
        label: "Body Temperature",
        target: AppState::TemperatureIdle,
    },
    MenuEntry {
        label: "Heart Rate + SpO2",
        target: AppState::HeartRate,
    },
    MenuEntry {
        label: "Settings",
        target: AppState::Settings,
    },
];

/// The settings sub-menu.
pub const SETTINGS_MENU: [MenuEntry; 2] = [
    MenuEntry {
        label: "Wi-Fi",
        target: AppState::WifiSettings,
    },
    MenuEntry {
        label: "Bluetooth",
        target: AppState::BluetoothSettings,
    },
];

/// Which sensor sources the sampling task should poll this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceMask {
    pub temperature: bool,
    pub vitals: bool,
    pub location: bool,
}

impl SourceMask {
    pub const IDLE: SourceMask = SourceMask {
        temperature: false,
        vitals: false,
        location: false,
    };
}

/// Shared cell the UI task publishes the hot-source decision through and
/// the sampling task reads once per loop. Single writer (the UI task),
/// many readers.
pub struct HotSourcesHandle {
    mask: BlockingMutex<CriticalSectionRawMutex, Cell<SourceMask>>,
}

impl HotSourcesHandle {
    pub const fn new() -> Self {
        Self {
            mask: BlockingMutex::new(Cell::new(SourceMask::IDLE)),
        }
    }

    pub fn publish(&self, mask: SourceMask) {
        self.mask.lock(|cell| cell.set(mask));
    }

    pub fn get(&self) -> SourceMask {
        self.mask.lock(|cell| cell.get())
    }
}

impl Default for HotSourcesHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed side effect of a transition, applied atomically with the state
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    None,
    /// Reset the menu selection to the first entry.
    ResetMenu,
    /// Move the menu selection up, clamped to the first entry.
    MoveUp,
    /// Move the menu selection down, clamped to the last entry.
    MoveDown,
    /// Clear scan bookkeeping ahead of entering a temperature screen.
    ResetScan,
    /// Record the scan start and clear the scan-done flag.
    BeginScan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transition {
    next: AppState,
    effect: Effect,
}

impl Transition {
    const fn stay(state: AppState) -> Self {
        Self {
            next: state,
            effect: Effect::None,
        }
    }

    const fn to(next: AppState) -> Self {
        Self {
            next,
            effect: Effect::None,
        }
    }

    const fn with(next: AppState, effect: Effect) -> Self {
        Self { next, effect }
    }
}

/// The application state machine.
pub struct AppStateMachine {
    state: AppState,
    selected_index: usize,
    scan_started_at: Option<Instant>,
    scan_done: bool,
    scan_duration: Duration,
    cooldown: Cooldown,
    display_on: bool,
    last_interaction: Option<Instant>,
    display_timeout: Duration,
}

impl AppStateMachine {
    pub fn new(cfg: &CoreConfig) -> Self {
        Self {
            state: AppState::Home,
            selected_index: 0,
            scan_started_at: None,
            scan_done: false,
            scan_duration: cfg.scan_duration(),
            cooldown: Cooldown::new(cfg.cooldown_window()),
            display_on: true,
            last_interaction: None,
            display_timeout: cfg.display_timeout(),
        }
    }

    pub fn state(&self) -> AppState {
        self.state
    }

    pub fn selected_index(&self) -> usize {
        self.selected_index
    }

    pub fn scan_done(&self) -> bool {
        self.scan_done
    }

    pub fn scan_started_at(&self) -> Option<Instant> {
        self.scan_started_at
    }

    pub fn display_on(&self) -> bool {
        self.display_on
    }

    /// The menu shown in the current state, if any.
    pub fn current_menu(&self) -> Option<&'static [MenuEntry]> {
        match self.state {
            AppState::Menu => Some(&MAIN_MENU),
            AppState::Settings => Some(&SETTINGS_MENU),
            _ => None,
        }
    }

    /// Feed a debounced button event through the stage-2 cooldown and the
    /// transition table. Returns true if the event was acted upon.
    ///
    /// Any press refreshes the interaction clock and wakes a blanked
    /// display; the waking press is still delivered to the transition
    /// table.
    pub fn handle_button(&mut self, event: ButtonEvent) -> bool {
        self.last_interaction = Some(event.at);
        if !self.display_on {
            self.display_on = true;
            info!("display woken by {:?}", event.button);
        }

        if !self.cooldown.try_accept(event.at) {
            debug!("{:?} ignored by UI cooldown", event.button);
            return false;
        }

        let from = self.state;
        let transition = self.transition(event.button);
        self.apply(transition, event.at);
        info!("{:?} in {:?} -> {:?}", event.button, from, self.state);
        true
    }

    /// Advance time-driven behavior. Returns true if anything observable
    /// changed.
    ///
    /// While scanning, completes the scan once the configured duration has
    /// elapsed since the recorded start. Independently, blanks the display
    /// after the inactivity window; with no interaction yet, the window
    /// runs from the first tick.
    pub fn tick(&mut self, now: Instant) -> bool {
        let mut changed = false;

        let since = *self.last_interaction.get_or_insert(now);
        if self.display_on
            && now
                .checked_duration_since(since)
                .is_some_and(|d| d >= self.display_timeout)
        {
            self.display_on = false;
            info!("display blanked after inactivity");
            changed = true;
        }

        if self.state == AppState::TemperatureScanning && !self.scan_done {
            let elapsed = self
                .scan_started_at
                .and_then(|start| now.checked_duration_since(start));
            if elapsed.is_some_and(|d| d >= self.scan_duration) {
                self.scan_done = true;
                self.state = AppState::TemperatureResult;
                info!("temperature scan complete");
                changed = true;
            }
        }
        changed
    }

    /// Which sensor sources the current state needs polled.
    pub fn hot_sources(&self) -> SourceMask {
        match self.state {
            AppState::TemperatureScanning => SourceMask {
                temperature: true,
                ..SourceMask::IDLE
            },
            AppState::HeartRate => SourceMask {
                vitals: true,
                ..SourceMask::IDLE
            },
            AppState::Location => SourceMask {
                location: true,
                ..SourceMask::IDLE
            },
            AppState::Dashboard => SourceMask {
                vitals: true,
                location: true,
                ..SourceMask::IDLE
            },
            _ => SourceMask::IDLE,
        }
    }

    /// Total transition function: every `(state, button)` pair yields a
    /// defined next state.
    fn transition(&self, button: Button) -> Transition {
        use AppState::*;
        use Button::*;

        let state = self.state;
        match (state, button) {
            (Home, Select) => Transition::with(Menu, Effect::ResetMenu),
            (Home, Down) => Transition::to(Notifications),
            (Home, _) => Transition::stay(Home),

            (Menu, Up) => Transition::with(Menu, Effect::MoveUp),
            (Menu, Down) => Transition::with(Menu, Effect::MoveDown),
            (Menu, Select) => self.select_menu_entry(&MAIN_MENU),
            (Menu, Back) => Transition::to(Home),

            (Settings, Up) => Transition::with(Settings, Effect::MoveUp),
            (Settings, Down) => Transition::with(Settings, Effect::MoveDown),
            (Settings, Select) => self.select_menu_entry(&SETTINGS_MENU),
            (Settings, Back) => Transition::to(Menu),

            (Notifications, Back) => Transition::to(Home),
            (Notifications, _) => Transition::stay(Notifications),

            (TemperatureIdle, Select) => {
                Transition::with(TemperatureScanning, Effect::BeginScan)
            }
            (TemperatureIdle, Back) => Transition::to(Menu),
            (TemperatureIdle, _) => Transition::stay(TemperatureIdle),

            (TemperatureScanning, Back) => Transition::with(Menu, Effect::ResetScan),
            (TemperatureScanning, _) => Transition::stay(TemperatureScanning),

            (TemperatureResult, Select) => {
                Transition::with(TemperatureScanning, Effect::BeginScan)
            }
            (TemperatureResult, Back) => Transition::to(Menu),
            (TemperatureResult, _) => Transition::stay(TemperatureResult),

            (HeartRate, Back) => Transition::to(Menu),
            (HeartRate, _) => Transition::stay(HeartRate),

            (Location, Back) => Transition::to(Menu),
            (Location, _) => Transition::stay(Location),

            (Dashboard, Back) => Transition::to(Menu),
            (Dashboard, _) => Transition::stay(Dashboard),

            (WifiSettings, Back) => Transition::to(Settings),
            (WifiSettings, _) => Transition::stay(WifiSettings),

            (BluetoothSettings, Back) => Transition::to(Settings),
            (BluetoothSettings, _) => Transition::stay(BluetoothSettings),
        }
    }

    /// Resolve the selected entry of `menu` into a transition.
    ///
    /// A selection pointing outside the menu should not occur under the
    /// transition table; it forces the state back to Home rather than
    /// leaving the machine somewhere with no render target.
    fn select_menu_entry(&self, menu: &'static [MenuEntry]) -> Transition {
        let Some(entry) = menu.get(self.selected_index) else {
            warn!(
                "menu selection {} out of range ({} entries), returning home",
                self.selected_index,
                menu.len()
            );
            return Transition::with(AppState::Home, Effect::ResetMenu);
        };

        let effect = match entry.target {
            // Re-entry into a temperature screen always starts from a
            // clean scan state.
            AppState::TemperatureIdle
            | AppState::TemperatureScanning
            | AppState::TemperatureResult => Effect::ResetScan,
            // Sub-menus open on their first entry.
            AppState::Menu | AppState::Settings => Effect::ResetMenu,
            _ => Effect::None,
        };
        Transition::with(entry.target, effect)
    }

    fn apply(&mut self, transition: Transition, at: Instant) {
        match transition.effect {
            Effect::None => {}
            Effect::ResetMenu => self.selected_index = 0,
            Effect::MoveUp => self.selected_index = self.selected_index.saturating_sub(1),
            Effect::MoveDown => {
                let max = self
                    .current_menu()
                    .map(|m| m.len().saturating_sub(1))
                    .unwrap_or(0);
                self.selected_index = (self.selected_index + 1).min(max);
            }
            Effect::ResetScan => {
                self.scan_started_at = None;
                self.scan_done = false;
            }
            Effect::BeginScan => {
                self.scan_started_at = Some(at);
                self.scan_done = false;
            }
        }
        self.state = transition.next;
    }

    #[cfg(test)]
    fn force_state(&mut self, state: AppState) {
        self.state = state;
    }
}
