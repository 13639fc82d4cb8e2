/// On-screen keyboard inset tracking.
///
/// The inset is how many pixels of the bottom of the layout viewport are
/// hidden behind a software keyboard: `layout - visual.height - visual.offset_top`,
/// rounded and clamped at zero. The tracker recomputes it whenever the
/// platform reports a resize, scroll or orientation change, and only notifies
/// when the value actually changes.
use std::cell::Cell;
use std::rc::{Rc, Weak};

use crate::observer::{Subject, Subscription};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisualMetrics {
    pub height: f64,
    pub offset_top: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportSignal {
    Resize,
    Scroll,
    OrientationChange,
}

/// Platform view of the layout and visual viewports.
pub trait VisualViewport {
    fn layout_height(&self) -> f64;

    /// `None` when the platform has no visual viewport concept.
    fn visual(&self) -> Option<VisualMetrics>;

    /// Subject notified for `signal`, if the platform delivers it.
    fn signal(&self, signal: ViewportSignal) -> Option<Rc<Subject>>;
}

pub fn compute_inset(layout_height: f64, visual: VisualMetrics) -> u32 {
    let raw = (layout_height - visual.height - visual.offset_top).round();
    if raw.is_finite() && raw > 0.0 { raw as u32 } else { 0 }
}

// ── Tracker ───────────────────────────────────────────────────────────────────

type ChangeFn = Rc<dyn Fn(u32)>;

#[derive(Default)]
pub struct InsetTracker {
    inset: Rc<Cell<u32>>,
    on_change: Option<ChangeFn>,
    subscriptions: Vec<Subscription>,
    enabled: bool,
}

impl InsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the new inset whenever it changes.
    pub fn on_change(mut self, f: impl Fn(u32) + 'static) -> Self {
        self.on_change = Some(Rc::new(f));
        self
    }

    pub fn inset(&self) -> u32 {
        self.inset.get()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool, viewport: &Rc<dyn VisualViewport>) {
        if enabled == self.enabled {
            return;
        }
        if enabled {
            self.enable(viewport);
        } else {
            self.disable();
        }
    }

    pub fn enable(&mut self, viewport: &Rc<dyn VisualViewport>) {
        self.disable();
        self.enabled = true;

        if viewport.visual().is_none() {
            return;
        }

        let weak: Weak<dyn VisualViewport> = Rc::downgrade(viewport);
        let cell = Rc::clone(&self.inset);
        let on_change = self.on_change.clone();
        let update: Rc<dyn Fn()> = Rc::new(move || {
            let next = weak
                .upgrade()
                .and_then(|vp| vp.visual().map(|v| compute_inset(vp.layout_height(), v)))
                .unwrap_or(0);
            publish(&cell, on_change.as_ref(), next);
        });

        update();
        for signal in [
            ViewportSignal::Resize,
            ViewportSignal::Scroll,
            ViewportSignal::OrientationChange,
        ] {
            if let Some(subject) = viewport.signal(signal) {
                self.subscriptions.push(subject.subscribe(Rc::clone(&update)));
            }
        }
    }

    /// Unsubscribe from every signal and report zero.
    pub fn disable(&mut self) {
        self.subscriptions.clear();
        self.enabled = false;
        publish(&self.inset, self.on_change.as_ref(), 0);
    }
}

fn publish(cell: &Cell<u32>, on_change: Option<&ChangeFn>, next: u32) {
    if cell.get() == next {
        return;
    }
    cell.set(next);
    if let Some(cb) = on_change {
        cb(next);
    }
}
