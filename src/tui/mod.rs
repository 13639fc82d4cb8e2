/// Terminal host: a crossterm event loop driving the palette core.
///
/// Keys map onto `PaletteKey`s plus list navigation and editing. Mouse
/// presses and drags stand in for touches, so the hold-and-swipe open gesture
/// and the sheet's swipe-down dismiss work on touch terminals.
mod platform;
mod render;

use std::convert::Infallible;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossterm::{
    event::{
        DisableMouseCapture, EnableMouseCapture, Event, EventStream, KeyCode, KeyEvent,
        KeyEventKind, KeyModifiers, MouseButton, MouseEvent, MouseEventKind,
    },
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use futures_util::StreamExt;
use ratatui::{Terminal, backend::CrosstermBackend, layout::Rect};
use tokio::sync::mpsc;

use cmdk::commands::{
    self, CommandAction, CommandDefinition, CommandListView, CommandSource, ListInput, ListItem,
    SkimFuzzy,
};
use cmdk::config::ResolvedConfig;
use cmdk::controller::{Controller, KeyOutcome, PaletteKey, SendOutcome};
use cmdk::gesture::{GestureDetector, TouchEvent};
use cmdk::history::ConversationHistory;
use cmdk::message::{ApprovalDecision, Mode};
use cmdk::mobile::{
    MediaQueries, MobileDetector, MobileUi, ResolvedMobileConfig, SheetDismiss, SheetDragHandle,
};
use cmdk::storage::{FileStorage, KeyValueStorage};
use cmdk::telemetry::{ErrorReporter, JsonlReporter, TracingReporter};
use cmdk::transport::{ChatBackend, ChatEvent};
use cmdk::viewport::{InsetTracker, VisualViewport};

use platform::{TerminalScreen, TerminalSurface};
use render::PaletteLayout;

const TICK: Duration = Duration::from_millis(50);

// ── App state ─────────────────────────────────────────────────────────────────

pub struct App {
    controller: Controller,
    source: CommandSource<Infallible>,
    actions: Vec<CommandAction>,
    actions_heading: String,
    ask_ai_label: String,
    placeholder: String,
    matcher: SkimFuzzy,

    mobile: ResolvedMobileConfig,
    screen: Rc<TerminalScreen>,
    detector: MobileDetector,
    inset: InsetTracker,
    gesture: GestureDetector<TerminalSurface>,
    drag: SheetDragHandle,

    /// Index into the selectable list items
    selected: usize,
    input_focused: bool,
    was_open: bool,
    spinner_tick: u32,
    /// One-line status shown at the bottom of the screen
    notice: Option<String>,
}

/// An owned copy of the highlighted list item, so acting on it can borrow
/// the controller mutably.
enum Selection {
    Command(CommandDefinition),
    Conversation(String),
    Action(CommandAction),
    AskAi { regular_match_count: usize },
}

impl App {
    fn new(
        config: &ResolvedConfig,
        touch: bool,
        cols: u16,
        rows: u16,
    ) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(FileStorage::default());
        let history = Arc::new(ConversationHistory::new(
            storage,
            config.history_storage_key.clone(),
            config.max_conversations,
        ));
        let backend = config.chat_endpoint.clone().map(|url| ChatBackend::Endpoint {
            url,
            api_key: config.api_key.clone(),
        });
        let reporter: Arc<dyn ErrorReporter> = if config.error_log {
            Arc::new(JsonlReporter::default())
        } else {
            Arc::new(TracingReporter)
        };
        let (controller, chat_rx) = Controller::from_backend(backend, history);
        let controller = controller.with_reporter(reporter);

        let screen = TerminalScreen::new(cols, rows, touch);
        let media: Rc<dyn MediaQueries> = screen.clone();
        let mut detector = MobileDetector::new();
        detector.configure(config.mobile.enabled, config.mobile.breakpoint, &media);
        let gesture = GestureDetector::new(
            config.mobile.gesture.to_gesture_config(),
            TerminalSurface::new(Rc::clone(&screen)),
        );

        let mut app = Self {
            controller,
            source: CommandSource::resolve(Some(config.command_definitions()), None),
            actions: config.command_actions(),
            actions_heading: config.actions_heading.clone(),
            ask_ai_label: config.ask_ai_label.clone(),
            placeholder: config.placeholder.clone(),
            matcher: SkimFuzzy::default(),
            mobile: config.mobile.clone(),
            screen,
            detector,
            inset: InsetTracker::new(),
            gesture,
            drag: SheetDragHandle::default(),
            selected: 0,
            input_focused: true,
            was_open: false,
            spinner_tick: 0,
            notice: None,
        };
        app.sync_mobile();
        (app, chat_rx)
    }

    fn is_sheet(&self) -> bool {
        self.mobile.is_sheet(self.detector.is_mobile())
    }

    fn mobile_ui(&self) -> MobileUi {
        MobileUi::new(&self.mobile, self.is_sheet(), self.inset.inset())
    }

    fn area(&self) -> Rect {
        let (cols, rows) = self.screen.size();
        Rect::new(0, 0, cols, rows)
    }

    fn layout(&self, area: Rect) -> PaletteLayout {
        let ui = self.mobile_ui();
        let lift = ui.input_bottom_margin().map(TerminalScreen::rows_for).unwrap_or(0);
        PaletteLayout::new(area, ui.is_mobile, lift)
    }

    fn list_view(&self) -> CommandListView<'_> {
        let input = ListInput {
            commands: self.source.commands(),
            actions: &self.actions,
            actions_heading: &self.actions_heading,
            recent: self.controller.recent_conversations(),
            query: self.controller.input(),
            mode: self.controller.mode(),
            mobile: self.mobile_ui(),
            chat_enabled: self.controller.is_enabled(),
            ask_ai_label: &self.ask_ai_label,
        };
        commands::project(&input, &self.matcher)
    }

    /// Bring the gesture detector and inset tracker in line with the
    /// current open state and layout.
    fn sync_mobile(&mut self) {
        let open = self.controller.is_open();
        let sheet = self.is_sheet();
        self.gesture.set_open(open);
        self.gesture.set_enabled(self.mobile.gesture_enabled(sheet, open, true));
        let viewport: Rc<dyn VisualViewport> = self.screen.clone();
        self.inset.set_enabled(sheet && open, &viewport);

        if open != self.was_open {
            self.was_open = open;
            self.selected = 0;
            // Keyboard-last sheets open with the keyboard down
            self.input_focused = !sheet;
        }
        if !sheet {
            self.input_focused = true;
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.screen.resize(cols, rows);
        self.sync_mobile();
    }

    /// Advance timers. Returns true when the frame needs redrawing.
    fn tick(&mut self, now: Instant) -> bool {
        let armed = self.gesture.poll(now);
        let loading = self.controller.is_open() && self.controller.status().is_loading();
        if loading {
            self.spinner_tick = self.spinner_tick.wrapping_add(1);
        }
        armed || loading
    }

    // ── Keys ─────────────────────────────────────────────────────────────────

    /// Returns false when the app should quit.
    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return true;
        }
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        self.notice = None;

        match key.code {
            KeyCode::Char('c') if ctrl => return false,
            KeyCode::Char('k') if ctrl => {
                self.controller.handle_key(PaletteKey::Toggle);
            }
            KeyCode::Char('q') | KeyCode::Esc if !self.controller.is_open() => return false,
            _ if !self.controller.is_open() => {}
            KeyCode::Esc => {
                self.controller.handle_key(PaletteKey::Escape);
            }
            KeyCode::Enter => self.enter(key.modifiers),
            KeyCode::Up => self.move_selection(-1),
            KeyCode::Down | KeyCode::Tab => self.move_selection(1),
            KeyCode::Char('n') if ctrl => {
                self.controller.start_new_chat();
                if !self.controller.switch_to_chat() {
                    self.notice = Some("chat is disabled for this profile".to_string());
                }
            }
            KeyCode::Char('y') if ctrl => self.decide_pending(true),
            KeyCode::Char('r') if ctrl => self.decide_pending(false),
            KeyCode::Backspace => self.edit_input(|text| {
                text.pop();
            }),
            KeyCode::Char(c) if !ctrl => {
                self.input_focused = true;
                self.edit_input(|text| text.push(c));
            }
            _ => {}
        }
        self.sync_mobile();
        true
    }

    fn enter(&mut self, modifiers: KeyModifiers) {
        let modifier =
            modifiers.intersects(KeyModifiers::CONTROL | KeyModifiers::ALT | KeyModifiers::SUPER);
        let shift = modifiers.contains(KeyModifiers::SHIFT);
        match self.controller.handle_key(PaletteKey::Enter { modifier, shift }) {
            KeyOutcome::Sent(outcome) => self.report_send(outcome),
            KeyOutcome::Unhandled => match self.controller.mode() {
                Mode::Command => self.activate_selected(),
                Mode::Chat if shift => self.edit_input(|text| text.push('\n')),
                Mode::Chat => {}
            },
            KeyOutcome::Opened | KeyOutcome::Closed | KeyOutcome::ModeChanged(_) => {}
        }
    }

    fn edit_input(&mut self, f: impl FnOnce(&mut String)) {
        let mut text = self.controller.input().to_string();
        f(&mut text);
        self.controller.set_input(text);
        self.selected = 0;
    }

    fn move_selection(&mut self, delta: isize) {
        if self.controller.mode() != Mode::Command {
            return;
        }
        let count = self.list_view().selectable().len();
        if count == 0 {
            self.selected = 0;
            return;
        }
        self.selected = (self.selected as isize + delta).rem_euclid(count as isize) as usize;
    }

    fn current_selection(&self) -> Option<Selection> {
        let view = self.list_view();
        let item = view.selectable().get(self.selected).copied()?;
        let selection = match item {
            ListItem::Command(cmd) => Selection::Command(cmd.clone()),
            ListItem::Conversation(summary) => Selection::Conversation(summary.id.clone()),
            ListItem::Action(action) => Selection::Action(action.clone()),
            ListItem::AskAi { .. } => Selection::AskAi {
                regular_match_count: view.regular_match_count,
            },
            ListItem::Empty => return None,
        };
        Some(selection)
    }

    fn activate_selected(&mut self) {
        let Some(selection) = self.current_selection() else { return };
        match selection {
            Selection::Command(cmd) => {
                if self.controller.select_command(&cmd) {
                    self.controller.set_open(false);
                } else {
                    self.notice = Some(format!("\"{}\" failed", cmd.display_label()));
                }
            }
            Selection::Conversation(id) => {
                if !self.controller.load_conversation(&id) {
                    self.controller.refresh_recent();
                    self.notice = Some("that conversation is no longer stored".to_string());
                }
            }
            Selection::Action(action) => {
                let outcome = self.controller.select_action(&action);
                self.report_send(outcome);
            }
            Selection::AskAi { regular_match_count } => {
                self.controller.select_ask_ai(regular_match_count, &self.matcher);
            }
        }
        self.selected = 0;
    }

    fn report_send(&mut self, outcome: SendOutcome) {
        self.notice = match outcome {
            SendOutcome::Busy => Some("still answering the last message".to_string()),
            SendOutcome::Disabled => Some("chat is disabled for this profile".to_string()),
            SendOutcome::Dispatched(_) | SendOutcome::Empty | SendOutcome::WrongMode => None,
        };
    }

    /// Approve or reject the newest tool call still waiting for a decision.
    fn decide_pending(&mut self, approved: bool) {
        let pending = self
            .controller
            .messages()
            .iter()
            .rev()
            .flat_map(|m| m.tool_calls.iter())
            .find(|c| c.needs_decision())
            .map(|c| c.id.clone());
        let Some(id) = pending else { return };
        let outcome = self
            .controller
            .add_tool_approval_response(ApprovalDecision { id: &id, approved });
        tracing::debug!(tool_call = %id, ?outcome, "approval from keyboard");
    }

    // ── Mouse as touch ───────────────────────────────────────────────────────

    fn handle_mouse(&mut self, ev: MouseEvent) {
        let now = Instant::now();
        let point = TerminalScreen::point(ev.column, ev.row);
        let open = self.controller.is_open();

        match ev.kind {
            MouseEventKind::Down(MouseButton::Left) if open => {
                let layout = self.layout(self.area());
                if layout.on_handle(ev.column, ev.row) {
                    self.drag.touch_start(1, point);
                } else if layout.on_input(ev.column, ev.row) {
                    self.input_focused = true;
                } else if !layout.on_palette(ev.column, ev.row) {
                    // Click on the backdrop
                    self.controller.set_open(false);
                }
            }
            MouseEventKind::Down(MouseButton::Left) => {
                self.gesture.touch_start(&TouchEvent::single(point, now));
            }
            MouseEventKind::Drag(MouseButton::Left) if !open => {
                let response = self.gesture.touch_move(&TouchEvent::single(point, now));
                if response.triggered {
                    self.controller.set_open(true);
                }
            }
            MouseEventKind::Up(MouseButton::Left) if open => {
                match self.drag.touch_end(point, self.input_focused) {
                    Some(SheetDismiss::BlurInput) => self.input_focused = false,
                    Some(SheetDismiss::Close) => self.controller.set_open(false),
                    None => {}
                }
            }
            MouseEventKind::Up(MouseButton::Left) => self.gesture.touch_end(),
            _ => {}
        }
        self.sync_mobile();
    }
}

// ── Terminal setup / teardown ─────────────────────────────────────────────────

fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) {
    let _ = disable_raw_mode();
    let _ = execute!(terminal.backend_mut(), DisableMouseCapture, LeaveAlternateScreen);
    let _ = terminal.show_cursor();
}

// ── Main TUI run loop ─────────────────────────────────────────────────────────

pub async fn run(config: ResolvedConfig, touch: bool) -> Result<()> {
    let mut terminal = setup_terminal()?;

    // Panic hook: restore the terminal before printing the panic. Panics in
    // host callbacks are caught by `guard` and the palette keeps running, so
    // those are only logged and the screen is left alone.
    let orig_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if cmdk::telemetry::in_guard() {
            tracing::error!("contained panic: {info}");
            return;
        }
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), DisableMouseCapture, LeaveAlternateScreen);
        orig_hook(info);
    }));

    let result = event_loop(&mut terminal, &config, touch).await;

    restore_terminal(&mut terminal);
    result
}

async fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    config: &ResolvedConfig,
    touch: bool,
) -> Result<()> {
    let (cols, rows) = crossterm::terminal::size()?;
    let (mut app, mut chat_rx) = App::new(config, touch, cols, rows);

    let mut crossterm_events = EventStream::new();
    let mut ticker = tokio::time::interval(TICK);

    terminal.draw(|f| render::draw(f, &app))?;

    loop {
        tokio::select! {
            // ── Gesture timer / spinner ───────────────────────────────────────
            _ = ticker.tick() => {
                if app.tick(Instant::now()) {
                    terminal.draw(|f| render::draw(f, &app))?;
                }
            }

            // ── Streamed chat events ──────────────────────────────────────────
            Some(ev) = chat_rx.recv() => {
                app.controller.apply_chat_event(ev);
                terminal.draw(|f| render::draw(f, &app))?;
            }

            // ── Keyboard / mouse / resize ─────────────────────────────────────
            Some(Ok(ev)) = crossterm_events.next() => {
                match ev {
                    Event::Key(key) => {
                        if !app.handle_key(key) { break; }
                    }
                    Event::Mouse(mouse) => app.handle_mouse(mouse),
                    Event::Resize(cols, rows) => app.resize(cols, rows),
                    _ => {}
                }
                terminal.draw(|f| render::draw(f, &app))?;
            }
        }
    }

    // Closing archives whatever session is still on screen
    app.controller.set_open(false);
    Ok(())
}
