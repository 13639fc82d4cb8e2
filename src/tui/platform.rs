/// Terminal stand-ins for the platform signals the palette core listens to.
///
/// A terminal has no pixels, so cells are scaled to a nominal 8×16 px grid
/// before they reach the gesture detector, the media queries or the inset
/// tracker. Soft keyboards on terminal emulators (Termux and friends) shrink
/// the terminal instead of overlaying it: the tallest height seen at the
/// current width plays the layout viewport, the current height the visual one.
use std::cell::Cell;
use std::io::Write;
use std::rc::Rc;

use cmdk::gesture::{GestureHost, Point, Viewport};
use cmdk::mobile::{MediaQueries, MediaSignal};
use cmdk::observer::Subject;
use cmdk::viewport::{ViewportSignal, VisualMetrics, VisualViewport};

pub const CELL_W_PX: f64 = 8.0;
pub const CELL_H_PX: f64 = 16.0;

pub struct TerminalScreen {
    cols: Cell<u16>,
    rows: Cell<u16>,
    tallest: Cell<u16>,
    coarse_pointer: bool,
    resized: Rc<Subject>,
    rotated: Rc<Subject>,
}

impl TerminalScreen {
    pub fn new(cols: u16, rows: u16, coarse_pointer: bool) -> Rc<Self> {
        Rc::new(Self {
            cols: Cell::new(cols),
            rows: Cell::new(rows),
            tallest: Cell::new(rows),
            coarse_pointer,
            resized: Subject::new(),
            rotated: Subject::new(),
        })
    }

    /// Record a terminal resize and notify listeners. A width change counts
    /// as a rotation and forgets the remembered full height.
    pub fn resize(&self, cols: u16, rows: u16) {
        let rotated = cols != self.cols.get();
        self.cols.set(cols);
        self.rows.set(rows);
        if rotated {
            self.tallest.set(rows);
            self.rotated.notify();
        } else if rows > self.tallest.get() {
            self.tallest.set(rows);
        }
        self.resized.notify();
    }

    pub fn size(&self) -> (u16, u16) {
        (self.cols.get(), self.rows.get())
    }

    /// Centre of a cell, in px.
    pub fn point(column: u16, row: u16) -> Point {
        Point::new(
            (f64::from(column) + 0.5) * CELL_W_PX,
            (f64::from(row) + 0.5) * CELL_H_PX,
        )
    }

    /// Rows covered by `px`, rounded up.
    pub fn rows_for(px: u32) -> u16 {
        (f64::from(px) / CELL_H_PX).ceil().min(f64::from(u16::MAX)) as u16
    }

    fn viewport(&self) -> Viewport {
        Viewport {
            width: f64::from(self.cols.get()) * CELL_W_PX,
            height: f64::from(self.rows.get()) * CELL_H_PX,
        }
    }
}

impl VisualViewport for TerminalScreen {
    fn layout_height(&self) -> f64 {
        f64::from(self.tallest.get()) * CELL_H_PX
    }

    fn visual(&self) -> Option<VisualMetrics> {
        Some(VisualMetrics {
            height: f64::from(self.rows.get()) * CELL_H_PX,
            offset_top: 0.0,
        })
    }

    fn signal(&self, signal: ViewportSignal) -> Option<Rc<Subject>> {
        match signal {
            ViewportSignal::Resize => Some(Rc::clone(&self.resized)),
            ViewportSignal::OrientationChange => Some(Rc::clone(&self.rotated)),
            ViewportSignal::Scroll => None,
        }
    }
}

impl MediaQueries for TerminalScreen {
    fn viewport_width(&self) -> f64 {
        f64::from(self.cols.get()) * CELL_W_PX
    }

    fn coarse_pointer(&self) -> bool {
        self.coarse_pointer
    }

    fn signal(&self, signal: MediaSignal) -> Option<Rc<Subject>> {
        match signal {
            MediaSignal::Width => Some(Rc::clone(&self.resized)),
            MediaSignal::OrientationChange => Some(Rc::clone(&self.rotated)),
            // Fixed for the life of the process
            MediaSignal::Pointer => None,
        }
    }
}

// ── Gesture host ──────────────────────────────────────────────────────────────

/// What the gesture detector talks to. Haptics become the terminal bell,
/// which Termux turns into a vibration. There is no callout to suppress:
/// mouse capture already keeps the terminal from starting a selection.
pub struct TerminalSurface {
    screen: Rc<TerminalScreen>,
}

impl TerminalSurface {
    pub fn new(screen: Rc<TerminalScreen>) -> Self {
        Self { screen }
    }
}

impl GestureHost for TerminalSurface {
    fn viewport(&self) -> Viewport {
        self.screen.viewport()
    }

    fn vibrate(&mut self, ms: u32) {
        tracing::trace!(ms, "haptic pulse");
        let mut out = std::io::stdout();
        let _ = out.write_all(b"\x07");
        let _ = out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdk::viewport::InsetTracker;

    #[test]
    fn test_shrinking_terminal_reports_inset() {
        let screen = TerminalScreen::new(60, 40, false);
        let viewport: Rc<dyn VisualViewport> = screen.clone();
        let mut tracker = InsetTracker::new();
        tracker.enable(&viewport);
        assert_eq!(tracker.inset(), 0);

        screen.resize(60, 25);
        assert_eq!(tracker.inset(), 15 * 16);
        assert_eq!(TerminalScreen::rows_for(tracker.inset()), 15);

        screen.resize(60, 40);
        assert_eq!(tracker.inset(), 0);
    }

    #[test]
    fn test_width_change_resets_full_height() {
        let screen = TerminalScreen::new(60, 40, false);
        let viewport: Rc<dyn VisualViewport> = screen.clone();
        let mut tracker = InsetTracker::new();
        tracker.enable(&viewport);

        screen.resize(120, 20);
        assert_eq!(tracker.inset(), 0);
    }

    #[test]
    fn test_narrow_terminal_is_mobile() {
        use cmdk::mobile::MobileDetector;

        let screen = TerminalScreen::new(200, 50, false);
        let media: Rc<dyn MediaQueries> = screen.clone();
        let mut detector = MobileDetector::new();
        detector.configure(true, 900, &media);
        assert!(!detector.is_mobile());

        screen.resize(80, 50);
        assert!(detector.is_mobile());
    }

    #[test]
    fn test_cell_points_are_centred() {
        let p = TerminalScreen::point(0, 1);
        assert_eq!(p, Point::new(4.0, 24.0));
    }
}
