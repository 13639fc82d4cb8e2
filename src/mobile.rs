/// Mobile sheet behaviour: option resolution, "likely mobile" detection and
/// the layout decisions that depend on it.
use std::cell::Cell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gesture::{GestureConfig, Point};
use crate::message::Mode;
use crate::observer::{Subject, Subscription};

pub const DEFAULT_MOBILE_BREAKPOINT: u32 = 900;
pub const DEFAULT_HOLD_MS: u64 = 350;
pub const DEFAULT_SWIPE_UP_PX: f64 = 56.0;
pub const DEFAULT_QUICK_ACTIONS_COUNT: usize = 4;

/// Extra bottom padding under the list while the keyboard is up.
const LIST_KEYBOARD_PADDING_PX: u32 = 8;
const DISMISS_SWIPE_DOWN_PX: f64 = 56.0;
const DISMISS_MAX_DRIFT_PX: f64 = 42.0;

// ── Options (as written in config) ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MobileLayout {
    /// Results first; the keyboard only opens when the input is focused
    #[default]
    KeyboardLast,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GestureOptions {
    pub enabled: Option<bool>,
    pub hold_ms: Option<u64>,
    pub swipe_up_px: Option<f64>,
}

/// `gesture = false` disables the gesture outright; a table tunes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GestureSetting {
    Toggle(bool),
    Options(GestureOptions),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MobileOptions {
    pub enabled: Option<bool>,
    /// Viewport width (px) at or below which the palette becomes a sheet
    pub breakpoint: Option<u32>,
    pub layout: Option<MobileLayout>,
    pub gesture: Option<GestureSetting>,
    /// Show quick actions while the query is empty
    pub show_quick_actions: Option<bool>,
    pub quick_actions_count: Option<usize>,
}

// ── Resolved options ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedGesture {
    pub enabled: bool,
    pub hold_ms: u64,
    pub swipe_up_px: f64,
}

impl ResolvedGesture {
    pub fn to_gesture_config(&self) -> GestureConfig {
        GestureConfig {
            enabled: self.enabled,
            hold: Duration::from_millis(self.hold_ms),
            swipe_up_px: self.swipe_up_px,
            ..GestureConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMobileConfig {
    pub enabled: bool,
    pub breakpoint: u32,
    pub layout: MobileLayout,
    pub gesture: ResolvedGesture,
    pub show_quick_actions: bool,
    pub quick_actions_count: usize,
}

impl Default for ResolvedMobileConfig {
    fn default() -> Self {
        MobileOptions::default().resolve()
    }
}

impl MobileOptions {
    pub fn resolve(&self) -> ResolvedMobileConfig {
        let gesture = match &self.gesture {
            Some(GestureSetting::Toggle(false)) => ResolvedGesture {
                enabled: false,
                hold_ms: DEFAULT_HOLD_MS,
                swipe_up_px: DEFAULT_SWIPE_UP_PX,
            },
            Some(GestureSetting::Toggle(true)) | None => ResolvedGesture {
                enabled: true,
                hold_ms: DEFAULT_HOLD_MS,
                swipe_up_px: DEFAULT_SWIPE_UP_PX,
            },
            Some(GestureSetting::Options(opts)) => ResolvedGesture {
                enabled: opts.enabled.unwrap_or(true),
                hold_ms: opts.hold_ms.unwrap_or(DEFAULT_HOLD_MS),
                swipe_up_px: opts.swipe_up_px.unwrap_or(DEFAULT_SWIPE_UP_PX),
            },
        };

        ResolvedMobileConfig {
            enabled: self.enabled.unwrap_or(true),
            breakpoint: self.breakpoint.unwrap_or(DEFAULT_MOBILE_BREAKPOINT),
            layout: self.layout.unwrap_or_default(),
            gesture,
            show_quick_actions: self.show_quick_actions.unwrap_or(true),
            quick_actions_count: self.quick_actions_count.unwrap_or(DEFAULT_QUICK_ACTIONS_COUNT),
        }
    }
}

impl ResolvedMobileConfig {
    /// The palette renders as a bottom sheet.
    pub fn is_sheet(&self, likely_mobile: bool) -> bool {
        self.enabled && likely_mobile
    }

    /// The open gesture only listens while the sheet is closed and the host
    /// can actually react to an open request.
    pub fn gesture_enabled(&self, is_sheet: bool, open: bool, has_open_handler: bool) -> bool {
        is_sheet && !open && has_open_handler && self.gesture.enabled
    }
}

// ── Detection ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSignal {
    Width,
    Pointer,
    OrientationChange,
}

/// Platform media queries used to guess whether we are on a touch device.
pub trait MediaQueries {
    fn viewport_width(&self) -> f64;
    fn coarse_pointer(&self) -> bool;
    fn signal(&self, signal: MediaSignal) -> Option<Rc<Subject>>;
}

pub fn is_likely_mobile(width: f64, breakpoint: u32, coarse_pointer: bool) -> bool {
    width <= f64::from(breakpoint) || coarse_pointer
}

#[derive(Default)]
pub struct MobileDetector {
    is_mobile: Rc<Cell<bool>>,
    subscriptions: Vec<Subscription>,
}

impl MobileDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_mobile(&self) -> bool {
        self.is_mobile.get()
    }

    /// (Re)subscribe with `breakpoint`, or stop and report false when disabled.
    pub fn configure(&mut self, enabled: bool, breakpoint: u32, media: &Rc<dyn MediaQueries>) {
        self.subscriptions.clear();
        if !enabled {
            self.is_mobile.set(false);
            return;
        }

        let weak: Weak<dyn MediaQueries> = Rc::downgrade(media);
        let cell = Rc::clone(&self.is_mobile);
        let update: Rc<dyn Fn()> = Rc::new(move || {
            let next = weak
                .upgrade()
                .map(|m| is_likely_mobile(m.viewport_width(), breakpoint, m.coarse_pointer()))
                .unwrap_or(false);
            cell.set(next);
        });

        update();
        for signal in [MediaSignal::Width, MediaSignal::Pointer, MediaSignal::OrientationChange] {
            if let Some(subject) = media.signal(signal) {
                self.subscriptions.push(subject.subscribe(Rc::clone(&update)));
            }
        }
    }
}

// ── Layout ────────────────────────────────────────────────────────────────────

/// Mobile facts the list and input need to lay themselves out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MobileUi {
    pub is_mobile: bool,
    pub layout: MobileLayout,
    pub keyboard_inset: u32,
    pub show_quick_actions: bool,
    pub quick_actions_count: usize,
}

impl Default for MobileUi {
    fn default() -> Self {
        Self {
            is_mobile: false,
            layout: MobileLayout::KeyboardLast,
            keyboard_inset: 0,
            show_quick_actions: false,
            quick_actions_count: DEFAULT_QUICK_ACTIONS_COUNT,
        }
    }
}

impl MobileUi {
    pub fn new(config: &ResolvedMobileConfig, is_sheet: bool, keyboard_inset: u32) -> Self {
        Self {
            is_mobile: is_sheet,
            layout: config.layout,
            keyboard_inset,
            show_quick_actions: config.show_quick_actions,
            quick_actions_count: config.quick_actions_count,
        }
    }

    fn keyboard_last(&self) -> bool {
        self.is_mobile && self.layout == MobileLayout::KeyboardLast
    }

    /// Whether the result list (or chat transcript) is expanded.
    pub fn show_list(&self, mode: Mode, input: &str) -> bool {
        mode == Mode::Chat || !input.is_empty() || self.keyboard_last()
    }

    /// Whether the "tap to type" button sits next to the unfocused input.
    pub fn show_keyboard_button(&self, mode: Mode, input_focused: bool) -> bool {
        self.keyboard_last() && !input_focused && mode == Mode::Command
    }

    /// Quick actions replace the first commands while nothing is typed.
    pub fn quick_actions_visible(&self, mode: Mode, input: &str) -> bool {
        self.keyboard_last() && self.show_quick_actions && mode == Mode::Command && input.is_empty()
    }

    pub fn list_bottom_padding(&self) -> Option<u32> {
        (self.keyboard_inset > 0).then(|| self.keyboard_inset + LIST_KEYBOARD_PADDING_PX)
    }

    pub fn input_bottom_margin(&self) -> Option<u32> {
        (self.is_mobile && self.keyboard_inset > 0).then_some(self.keyboard_inset)
    }
}

// ── Sheet drag handle ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetDismiss {
    /// Hide the keyboard first; the sheet stays open
    BlurInput,
    Close,
}

/// Swipe-down-to-dismiss on the sheet's drag handle.
#[derive(Debug, Default)]
pub struct SheetDragHandle {
    start: Option<Point>,
}

impl SheetDragHandle {
    pub fn touch_start(&mut self, touches: usize, point: Point) {
        if touches == 1 {
            self.start = Some(point);
        }
    }

    pub fn touch_end(&mut self, point: Point, input_focused: bool) -> Option<SheetDismiss> {
        let start = self.start.take()?;
        let dx = point.x - start.x;
        let dy = point.y - start.y;
        if dy > DISMISS_SWIPE_DOWN_PX && dx.abs() < DISMISS_MAX_DRIFT_PX {
            Some(if input_focused { SheetDismiss::BlurInput } else { SheetDismiss::Close })
        } else {
            None
        }
    }
}
