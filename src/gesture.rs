/// Long-press-then-swipe-up detection for touch surfaces.
///
/// The detector is a pure state machine fed with touch events by the host.
/// Timers are deadlines: the host asks for `next_deadline()` and calls
/// `poll(now)` when it passes. A qualifying gesture looks like:
///
///   touch-start in the activation zone
///     → hold still for `hold` (arming; the hint becomes visible)
///     → drag upward by `swipe_up_px` without drifting sideways
///     → trigger (returned from `touch_move`)
///
/// Anything else (lifting the finger, a second finger, drifting before the
/// hold completes) clears the state without side effects.
use std::time::{Duration, Instant};

// ── Geometry ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

/// Bottom-right region where a long press is recognised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivationZone {
    /// Fraction of the viewport width, measured leftward from the right edge
    pub width_fraction: f64,
    /// Fraction of the viewport height, measured upward from the bottom edge
    pub height_fraction: f64,
    pub bottom_exclusion_px: f64,
    pub right_exclusion_px: f64,
}

impl Default for ActivationZone {
    fn default() -> Self {
        Self {
            width_fraction: 0.4,
            height_fraction: 0.4,
            bottom_exclusion_px: 8.0,
            right_exclusion_px: 0.0,
        }
    }
}

impl ActivationZone {
    pub fn contains(&self, viewport: Viewport, point: Point) -> bool {
        let zone_width = viewport.width * self.width_fraction;
        let x_end = viewport.width - self.right_exclusion_px;
        let x_start = (x_end - zone_width).max(0.0);

        let y_start = viewport.height * (1.0 - self.height_fraction);
        let y_end = viewport.height - self.bottom_exclusion_px;

        point.x >= x_start && point.x <= x_end && point.y >= y_start && point.y <= y_end
    }
}

// ── Touch targets ─────────────────────────────────────────────────────────────

/// What kind of element a touch landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TouchTarget {
    /// Plain content; eligible for the gesture
    #[default]
    Surface,
    TextInput,
    TextArea,
    Select,
    Button,
    Link,
    ContentEditable,
    /// Element explicitly marked as ignoring the gesture
    OptedOut,
}

impl TouchTarget {
    pub fn is_excluded(self) -> bool {
        !matches!(self, TouchTarget::Surface)
    }
}

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct GestureConfig {
    pub enabled: bool,
    /// Time the finger must rest before the gesture arms
    pub hold: Duration,
    /// Upward travel after arming that fires the trigger
    pub swipe_up_px: f64,
    /// Drift allowed before arming
    pub movement_tolerance_px: f64,
    /// Lateral drift allowed after arming
    pub horizontal_cancel_px: f64,
    pub zone: ActivationZone,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hold: Duration::from_millis(350),
            swipe_up_px: 56.0,
            movement_tolerance_px: 10.0,
            horizontal_cancel_px: 24.0,
            zone: ActivationZone::default(),
        }
    }
}

const ARM_PULSE_MS: u32 = 6;
const TRIGGER_PULSE_MS: u32 = 14;
/// How long after an in-zone touch native context menus stay suppressed, on top of `hold`.
const CONTEXT_MENU_GRACE: Duration = Duration::from_millis(1200);

// ── Host seam ─────────────────────────────────────────────────────────────────

/// Platform services the detector needs. Haptics and callout suppression are
/// optional; the defaults do nothing.
pub trait GestureHost {
    fn viewport(&self) -> Viewport;

    fn vibrate(&mut self, _ms: u32) {}

    /// Disable the platform's long-press callout / text selection globally.
    fn suppress_callout(&mut self) {}

    /// Undo `suppress_callout`, restoring whatever was set before.
    fn restore_callout(&mut self) {}
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct TouchEvent {
    /// Number of fingers currently on the surface
    pub touches: usize,
    /// Position of the first touch
    pub point: Point,
    pub target: TouchTarget,
    pub cancelable: bool,
    pub at: Instant,
}

impl TouchEvent {
    pub fn single(point: Point, at: Instant) -> Self {
        Self {
            touches: 1,
            point,
            target: TouchTarget::Surface,
            cancelable: true,
            at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TouchResponse {
    /// The host should cancel the platform default for this event
    pub prevent_default: bool,
    /// The gesture completed; the host should open the palette
    pub triggered: bool,
}

// ── Detector ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Tracking {
    start: Point,
    armed: bool,
    arm_at: Instant,
}

pub struct GestureDetector<H: GestureHost> {
    config: GestureConfig,
    host: H,
    open: bool,
    state: Option<Tracking>,
    show_hint: bool,
    last_touch_in_zone: Option<Instant>,
    callout_applied: bool,
}

impl<H: GestureHost> GestureDetector<H> {
    pub fn new(config: GestureConfig, host: H) -> Self {
        Self {
            config,
            host,
            open: false,
            state: None,
            show_hint: false,
            last_touch_in_zone: None,
            callout_applied: false,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn config(&self) -> &GestureConfig {
        &self.config
    }

    /// True while armed and not yet triggered.
    pub fn show_hint(&self) -> bool {
        self.show_hint
    }

    pub fn is_tracking(&self) -> bool {
        self.state.is_some()
    }

    /// Detection runs only while enabled and the palette is closed.
    pub fn is_active(&self) -> bool {
        self.config.enabled && !self.open
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
        if !self.is_active() {
            self.clear_state();
        }
    }

    pub fn set_open(&mut self, open: bool) {
        self.open = open;
        if !self.is_active() {
            self.clear_state();
        }
    }

    pub fn set_config(&mut self, config: GestureConfig) {
        self.clear_state();
        self.config = config;
    }

    /// When the host should call `poll` next, if a hold is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.state {
            Some(s) if !s.armed => Some(s.arm_at),
            _ => None,
        }
    }

    /// Fire the arming timer if its deadline has passed. Returns true when
    /// the gesture armed during this call.
    pub fn poll(&mut self, now: Instant) -> bool {
        let Some(current) = self.state.as_mut() else { return false };
        if current.armed || now < current.arm_at {
            return false;
        }
        current.armed = true;
        self.show_hint = true;
        self.host.vibrate(ARM_PULSE_MS);
        tracing::debug!("gesture armed");
        true
    }

    pub fn touch_start(&mut self, ev: &TouchEvent) -> TouchResponse {
        if !self.is_active() {
            return TouchResponse::default();
        }
        // A second finger cancels; tracking never nests.
        if ev.touches != 1 || self.state.is_some() {
            self.clear_state();
            if ev.touches != 1 {
                return TouchResponse::default();
            }
        }
        if ev.target.is_excluded() {
            return TouchResponse::default();
        }
        if !self.config.zone.contains(self.host.viewport(), ev.point) {
            return TouchResponse::default();
        }

        self.last_touch_in_zone = Some(ev.at);
        // Some platforms show the callout before any context-menu event fires.
        self.apply_callout_suppression();
        self.state = Some(Tracking {
            start: ev.point,
            armed: false,
            arm_at: ev.at + self.config.hold,
        });

        TouchResponse {
            prevent_default: ev.cancelable,
            triggered: false,
        }
    }

    pub fn touch_move(&mut self, ev: &TouchEvent) -> TouchResponse {
        if !self.is_active() {
            return TouchResponse::default();
        }
        if ev.touches != 1 {
            self.clear_state();
            return TouchResponse::default();
        }

        self.poll(ev.at);

        let Some(current) = self.state.as_ref() else {
            return TouchResponse::default();
        };
        let prevent_default = ev.cancelable;
        let dx = ev.point.x - current.start.x;
        let dy = ev.point.y - current.start.y;

        if !current.armed {
            if dx.hypot(dy) > self.config.movement_tolerance_px {
                self.clear_state();
            }
            return TouchResponse { prevent_default, triggered: false };
        }

        if dx.abs() > self.config.horizontal_cancel_px {
            self.clear_state();
            return TouchResponse { prevent_default, triggered: false };
        }

        if dy <= -self.config.swipe_up_px {
            self.clear_state();
            self.host.vibrate(TRIGGER_PULSE_MS);
            tracing::debug!("gesture triggered");
            return TouchResponse { prevent_default, triggered: true };
        }

        TouchResponse { prevent_default, triggered: false }
    }

    pub fn touch_end(&mut self) {
        self.clear_state();
    }

    pub fn touch_cancel(&mut self) {
        self.clear_state();
    }

    /// Whether a native context menu at `point` should be suppressed.
    pub fn context_menu(&self, point: Point, target: TouchTarget, now: Instant) -> bool {
        if !self.is_active() {
            return false;
        }
        let tracking = self.state.is_some();
        let recently_touched = self
            .last_touch_in_zone
            .map(|t| now.saturating_duration_since(t) < self.config.hold + CONTEXT_MENU_GRACE)
            .unwrap_or(false);
        let in_zone = self.config.zone.contains(self.host.viewport(), point);

        if tracking || (recently_touched && in_zone) {
            return tracking || !target.is_excluded();
        }
        false
    }

    fn apply_callout_suppression(&mut self) {
        if !self.callout_applied {
            self.host.suppress_callout();
            self.callout_applied = true;
        }
    }

    fn clear_state(&mut self) {
        self.state = None;
        self.show_hint = false;
        if self.callout_applied {
            self.host.restore_callout();
            self.callout_applied = false;
        }
    }
}

impl<H: GestureHost> Drop for GestureDetector<H> {
    fn drop(&mut self) {
        self.clear_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Log {
        vibrations: Vec<u32>,
        suppressed: bool,
        suppress_calls: usize,
        restore_calls: usize,
    }

    struct TestHost {
        log: Rc<RefCell<Log>>,
    }

    impl GestureHost for TestHost {
        fn viewport(&self) -> Viewport {
            Viewport { width: 400.0, height: 800.0 }
        }
        fn vibrate(&mut self, ms: u32) {
            self.log.borrow_mut().vibrations.push(ms);
        }
        fn suppress_callout(&mut self) {
            let mut log = self.log.borrow_mut();
            log.suppressed = true;
            log.suppress_calls += 1;
        }
        fn restore_callout(&mut self) {
            let mut log = self.log.borrow_mut();
            log.suppressed = false;
            log.restore_calls += 1;
        }
    }

    fn detector() -> (GestureDetector<TestHost>, Rc<RefCell<Log>>) {
        let log = Rc::new(RefCell::new(Log::default()));
        let host = TestHost { log: Rc::clone(&log) };
        (GestureDetector::new(GestureConfig::default(), host), log)
    }

    // Zone for 400x800 is x ∈ [240, 400], y ∈ [480, 792].
    const CENTER: Point = Point { x: 320.0, y: 636.0 };

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn at(point: Point, t: Instant) -> TouchEvent {
        TouchEvent::single(point, t)
    }

    #[test]
    fn test_zone_geometry() {
        let zone = ActivationZone::default();
        let vp = Viewport { width: 400.0, height: 800.0 };
        assert!(zone.contains(vp, Point::new(240.0, 480.0)));
        assert!(zone.contains(vp, Point::new(400.0, 792.0)));
        assert!(!zone.contains(vp, Point::new(239.0, 600.0)));
        assert!(!zone.contains(vp, Point::new(300.0, 795.0)));
        assert!(!zone.contains(vp, Point::new(300.0, 100.0)));
    }

    #[test]
    fn test_long_press_then_swipe_triggers_once() {
        let (mut d, log) = detector();
        let t0 = Instant::now();
        let start = d.touch_start(&at(CENTER, t0));
        assert!(start.prevent_default);
        assert!(!d.show_hint());

        assert!(d.poll(t0 + ms(400)));
        assert!(d.show_hint());

        let up = Point::new(CENTER.x, CENTER.y - 60.0);
        let r = d.touch_move(&at(up, t0 + ms(450)));
        assert!(r.triggered);
        assert!(!d.show_hint());
        assert!(!d.is_tracking());

        // Further movement from the same touch is ignored.
        let higher = Point::new(CENTER.x, CENTER.y - 200.0);
        assert!(!d.touch_move(&at(higher, t0 + ms(500))).triggered);
        d.touch_end();
        assert_eq!(log.borrow().vibrations, vec![6, 14]);
    }

    #[test]
    fn test_overdue_hold_arms_on_move() {
        let (mut d, _log) = detector();
        let t0 = Instant::now();
        d.touch_start(&at(CENTER, t0));
        // No explicit poll: the move arrives after the deadline.
        let up = Point::new(CENTER.x + 5.0, CENTER.y - 56.0);
        assert!(d.touch_move(&at(up, t0 + ms(400))).triggered);
    }

    #[test]
    fn test_short_hold_never_arms() {
        let (mut d, _log) = detector();
        let t0 = Instant::now();
        d.touch_start(&at(CENTER, t0));
        assert!(!d.poll(t0 + ms(200)));
        let up = Point::new(CENTER.x, CENTER.y - 60.0);
        let r = d.touch_move(&at(up, t0 + ms(300)));
        assert!(!r.triggered);
        assert!(!d.show_hint());
        // Drifted past the tolerance before arming, so tracking is gone.
        assert!(!d.is_tracking());
        assert!(!d.poll(t0 + ms(1000)));
    }

    #[test]
    fn test_small_jitter_before_arming_is_tolerated() {
        let (mut d, _log) = detector();
        let t0 = Instant::now();
        d.touch_start(&at(CENTER, t0));
        d.touch_move(&at(Point::new(CENTER.x + 3.0, CENTER.y + 4.0), t0 + ms(100)));
        assert!(d.is_tracking());
        assert!(d.poll(t0 + ms(350)));
    }

    #[test]
    fn test_horizontal_drift_after_arming_cancels() {
        let (mut d, _log) = detector();
        let t0 = Instant::now();
        d.touch_start(&at(CENTER, t0));
        d.poll(t0 + ms(360));
        let drift = Point::new(CENTER.x - 30.0, CENTER.y - 20.0);
        assert!(!d.touch_move(&at(drift, t0 + ms(400))).triggered);
        assert!(!d.is_tracking());
        assert!(!d.show_hint());
    }

    #[test]
    fn test_second_touch_cancels_and_recancel_is_noop() {
        let (mut d, log) = detector();
        let t0 = Instant::now();
        d.touch_start(&at(CENTER, t0));
        d.poll(t0 + ms(400));
        assert!(d.show_hint());

        let two = TouchEvent { touches: 2, ..at(CENTER, t0 + ms(410)) };
        d.touch_start(&two);
        assert!(!d.is_tracking());
        assert!(!d.show_hint());
        assert_eq!(log.borrow().restore_calls, 1);

        d.touch_move(&two);
        d.touch_cancel();
        assert!(!d.is_tracking());
        assert_eq!(log.borrow().restore_calls, 1);
    }

    #[test]
    fn test_excluded_targets_and_outside_zone_are_ignored() {
        let (mut d, log) = detector();
        let t0 = Instant::now();
        let on_button = TouchEvent { target: TouchTarget::Button, ..at(CENTER, t0) };
        assert_eq!(d.touch_start(&on_button), TouchResponse::default());
        assert!(!d.is_tracking());

        let opted_out = TouchEvent { target: TouchTarget::OptedOut, ..at(CENTER, t0) };
        d.touch_start(&opted_out);
        assert!(!d.is_tracking());

        d.touch_start(&at(Point::new(50.0, 100.0), t0));
        assert!(!d.is_tracking());
        assert_eq!(log.borrow().suppress_calls, 0);
    }

    #[test]
    fn test_callout_suppressed_while_tracking_and_restored() {
        let (mut d, log) = detector();
        let t0 = Instant::now();
        d.touch_start(&at(CENTER, t0));
        assert!(log.borrow().suppressed);
        d.touch_end();
        assert!(!log.borrow().suppressed);

        d.touch_start(&at(CENTER, t0 + ms(10)));
        assert!(log.borrow().suppressed);
        drop(d);
        assert!(!log.borrow().suppressed);
    }

    #[test]
    fn test_opening_palette_clears_and_disables() {
        let (mut d, log) = detector();
        let t0 = Instant::now();
        d.touch_start(&at(CENTER, t0));
        d.poll(t0 + ms(400));
        d.set_open(true);
        assert!(!d.is_tracking());
        assert!(!d.show_hint());
        assert!(!log.borrow().suppressed);

        d.touch_start(&at(CENTER, t0 + ms(500)));
        assert!(!d.is_tracking());

        d.set_open(false);
        d.touch_start(&at(CENTER, t0 + ms(600)));
        assert!(d.is_tracking());
        d.set_enabled(false);
        assert!(!d.is_tracking());
    }

    #[test]
    fn test_context_menu_suppression_window() {
        let (mut d, _log) = detector();
        let t0 = Instant::now();
        d.touch_start(&at(CENTER, t0));
        // Tracking: always suppressed, even off-zone or on excluded targets.
        assert!(d.context_menu(Point::new(10.0, 10.0), TouchTarget::Link, t0 + ms(50)));
        d.touch_end();

        // Recent in-zone touch: suppressed inside the zone only.
        assert!(d.context_menu(CENTER, TouchTarget::Surface, t0 + ms(1000)));
        assert!(!d.context_menu(Point::new(10.0, 10.0), TouchTarget::Surface, t0 + ms(1000)));
        assert!(!d.context_menu(CENTER, TouchTarget::TextInput, t0 + ms(1000)));

        // Window is hold + 1200ms.
        assert!(!d.context_menu(CENTER, TouchTarget::Surface, t0 + ms(1600)));
    }

    #[test]
    fn test_next_deadline_tracks_pending_hold() {
        let (mut d, _log) = detector();
        assert_eq!(d.next_deadline(), None);
        let t0 = Instant::now();
        d.touch_start(&at(CENTER, t0));
        assert_eq!(d.next_deadline(), Some(t0 + ms(350)));
        d.poll(t0 + ms(350));
        assert_eq!(d.next_deadline(), None);
    }
}
