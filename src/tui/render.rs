/// Ratatui draw entry-point for the terminal host.
/// The palette is a centred popup on wide terminals and a bottom sheet,
/// keyboard-last, on narrow or touch ones.
use ratatui::{
    Frame,
    layout::{Alignment, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
};
use unicode_width::UnicodeWidthStr;

use cmdk::commands::{EMPTY_LABEL, ListItem};
use cmdk::history::format_relative_time;
use cmdk::message::{Approval, ChatStatus, Message, Mode, Role};

use super::App;

pub const SPINNER_GLYPHS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

const ACCENT: Color = Color::Cyan;
const DIM: Color = Color::Rgb(70, 70, 90);
const BG: Color = Color::Rgb(8, 8, 14);

// ── Layout ────────────────────────────────────────────────────────────────────

/// Where each part of the palette sits. Shared by drawing and mouse hit-tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaletteLayout {
    pub outer: Rect,
    /// Drag handle row (sheet only)
    pub handle: Option<Rect>,
    pub body: Rect,
    pub input: Rect,
}

impl PaletteLayout {
    /// `inset_rows` lifts the sheet above an on-screen keyboard.
    pub fn new(area: Rect, sheet: bool, inset_rows: u16) -> Self {
        if sheet {
            let available = area.height.saturating_sub(inset_rows).max(3);
            let height = (available * 7 / 10).max(8).min(available);
            let outer = Rect {
                x: area.x,
                y: area.y + available - height,
                width: area.width,
                height,
            };
            let inner = Block::default().borders(Borders::ALL).inner(outer);
            let handle = Rect { height: 1.min(inner.height), ..inner };
            let input = Rect {
                y: inner.y + inner.height.saturating_sub(1),
                height: 1.min(inner.height),
                ..inner
            };
            let body = Rect {
                y: inner.y + 1,
                height: inner.height.saturating_sub(2),
                ..inner
            };
            Self { outer, handle: Some(handle), body, input }
        } else {
            let width = 72u16.min(area.width.saturating_sub(4));
            let height = 18u16.min(area.height.saturating_sub(4));
            let x = area.x + (area.width.saturating_sub(width)) / 2;
            let y = area.y + (area.height.saturating_sub(height)) / 2;
            let outer = Rect { x, y, width, height };
            let inner = Block::default().borders(Borders::ALL).inner(outer);
            // Search bar at top, list below a blank row
            let input = Rect { height: 1.min(inner.height), ..inner };
            let body = Rect {
                y: inner.y + 2,
                height: inner.height.saturating_sub(2),
                ..inner
            };
            Self { outer, handle: None, body, input }
        }
    }
}

fn contains(area: Rect, column: u16, row: u16) -> bool {
    column >= area.x && column < area.x + area.width && row >= area.y && row < area.y + area.height
}

impl PaletteLayout {
    pub fn on_handle(&self, column: u16, row: u16) -> bool {
        self.handle.is_some_and(|h| contains(h, column, row))
    }

    pub fn on_input(&self, column: u16, row: u16) -> bool {
        contains(self.input, column, row)
    }

    pub fn on_palette(&self, column: u16, row: u16) -> bool {
        contains(self.outer, column, row)
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

pub fn draw(f: &mut Frame, app: &App) {
    let area = f.area();
    f.render_widget(Block::default().style(Style::default().bg(Color::Black)), area);

    draw_backdrop(f, app, area);

    if app.controller.is_open() {
        draw_palette(f, app, app.layout(area));
    } else if app.gesture.show_hint() {
        draw_gesture_hint(f, area);
    }
}

fn draw_backdrop(f: &mut Frame, app: &App, area: Rect) {
    let mut lines = vec![
        Line::from(Span::styled("cmdk", Style::default().fg(ACCENT).add_modifier(Modifier::BOLD))),
        Line::from(""),
        Line::from(vec![
            Span::styled("Ctrl+K  ", Style::default().fg(ACCENT)),
            Span::styled("open the palette", Style::default().fg(Color::DarkGray)),
        ]),
    ];
    if app.gesture.is_active() {
        lines.push(Line::from(Span::styled(
            "or hold the lower right corner and swipe up",
            Style::default().fg(Color::DarkGray),
        )));
    }
    lines.push(Line::from(vec![
        Span::styled("Ctrl+C  ", Style::default().fg(ACCENT)),
        Span::styled("quit", Style::default().fg(Color::DarkGray)),
    ]));
    if !app.controller.is_enabled() {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            "chat disabled: set chat_endpoint or --endpoint",
            Style::default().fg(DIM),
        )));
    }

    let top = area.y + area.height.saturating_sub(lines.len() as u16) / 3;
    let text_area = Rect { y: top, height: area.height.saturating_sub(top - area.y), ..area };
    f.render_widget(Paragraph::new(lines).alignment(Alignment::Center), text_area);

    if let Some(notice) = &app.notice {
        let row = Rect { y: area.y + area.height.saturating_sub(1), height: 1.min(area.height), ..area };
        f.render_widget(
            Paragraph::new(Span::styled(format!(" {notice}"), Style::default().fg(Color::Yellow))),
            row,
        );
    }
}

fn draw_gesture_hint(f: &mut Frame, area: Rect) {
    let label = " ↑ swipe up ";
    let width = label.width() as u16;
    if area.width < width + 2 || area.height < 3 {
        return;
    }
    let hint = Rect {
        x: area.x + area.width - width - 1,
        y: area.y + area.height - 2,
        width,
        height: 1,
    };
    f.render_widget(
        Paragraph::new(Span::styled(
            label,
            Style::default().fg(Color::Black).bg(ACCENT).add_modifier(Modifier::BOLD),
        )),
        hint,
    );
}

// ── Palette ───────────────────────────────────────────────────────────────────

fn draw_palette(f: &mut Frame, app: &App, layout: PaletteLayout) {
    f.render_widget(Clear, layout.outer);

    let mode = app.controller.mode();
    let title = match mode {
        Mode::Command => " Command Palette ",
        Mode::Chat => " Ask AI ",
    };
    let block = Block::default()
        .title(Span::styled(
            title,
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(ACCENT))
        .style(Style::default().bg(BG));
    f.render_widget(block, layout.outer);

    if let Some(handle) = layout.handle {
        f.render_widget(
            Paragraph::new(Span::styled("━━━━━━", Style::default().fg(DIM))).alignment(Alignment::Center),
            handle,
        );
    }

    // A failing host callback leaves only the input until the palette reopens.
    if !app.controller.is_faulted() {
        match mode {
            Mode::Command if app.mobile_ui().show_list(mode, app.controller.input()) => {
                draw_command_list(f, app, layout.body)
            }
            Mode::Command => {}
            Mode::Chat => draw_transcript(f, app, layout.body),
        }
    }

    draw_input(f, app, layout.input);
}

fn draw_command_list(f: &mut Frame, app: &App, area: Rect) {
    if area.height == 0 {
        return;
    }
    let view = app.list_view();
    let now = app.controller.history().now();
    let width = area.width as usize;

    let mut lines: Vec<Line> = Vec::new();
    let mut selected_line = 0usize;
    let mut selectable_idx = 0usize;

    for section in &view.sections {
        if let Some(heading) = section.heading {
            if !lines.is_empty() {
                lines.push(Line::from(""));
            }
            lines.push(Line::from(Span::styled(
                format!("  {heading}"),
                Style::default().fg(DIM).add_modifier(Modifier::BOLD),
            )));
        }
        for item in &section.items {
            let selected = item.is_selectable() && selectable_idx == app.selected;
            if selected {
                selected_line = lines.len();
            }
            if item.is_selectable() {
                selectable_idx += 1;
            }
            lines.push(item_line(item, selected, app.controller.input(), now, width));
        }
    }

    // Keep the selection on screen
    let height = area.height as usize;
    let scroll = selected_line.saturating_sub(height.saturating_sub(1));
    let visible: Vec<Line> = lines.into_iter().skip(scroll).take(height).collect();
    f.render_widget(Paragraph::new(visible), area);
}

fn item_line<'a>(item: &ListItem<'a>, selected: bool, query: &str, now: i64, width: usize) -> Line<'a> {
    let (text_style, meta_style) = if selected {
        (
            Style::default().fg(Color::Black).bg(ACCENT).add_modifier(Modifier::BOLD),
            Style::default().fg(Color::Black).bg(ACCENT),
        )
    } else {
        (Style::default().fg(Color::White), Style::default().fg(Color::DarkGray))
    };

    let (icon, text, meta) = match item {
        ListItem::Command(cmd) => {
            let icon = cmd.icon.clone().unwrap_or_else(|| "›".to_string());
            let meta = cmd.shortcut.clone().unwrap_or_default();
            if cmd.disabled {
                return Line::from(Span::styled(
                    format!("  {icon} {}", cmd.display_label()),
                    Style::default().fg(DIM),
                ));
            }
            (icon, cmd.display_label().to_string(), meta)
        }
        ListItem::Conversation(summary) => (
            "◷".to_string(),
            summary.title.clone(),
            format_relative_time(summary.updated_at, now),
        ),
        ListItem::Action(action) => ("✦".to_string(), action.display_label().to_string(), String::new()),
        ListItem::AskAi { label } => {
            let query = query.trim();
            let text = if query.is_empty() {
                label.to_string()
            } else {
                format!("{label}: \"{query}\"")
            };
            ("✦".to_string(), text, "Ctrl+Enter".to_string())
        }
        ListItem::Empty => {
            return Line::from(Span::styled(format!("  {EMPTY_LABEL}"), Style::default().fg(DIM)));
        }
    };

    let left = format!("  {icon} {text}");
    let pad = width
        .saturating_sub(left.width())
        .saturating_sub(meta.width() + 2);
    Line::from(vec![
        Span::styled(left, text_style),
        Span::styled(" ".repeat(pad), text_style),
        Span::styled(format!("{meta}  "), meta_style),
    ])
}

// ── Chat transcript ───────────────────────────────────────────────────────────

fn draw_transcript(f: &mut Frame, app: &App, area: Rect) {
    if area.height == 0 {
        return;
    }
    let width = (area.width as usize).saturating_sub(4).max(8);
    let mut lines: Vec<Line> = Vec::new();

    if app.controller.messages().is_empty() {
        lines.push(Line::from(Span::styled(
            "  Ask anything. Esc goes back to commands.",
            Style::default().fg(DIM),
        )));
    }
    for message in app.controller.messages() {
        message_lines(message, width, &mut lines);
    }

    match app.controller.status() {
        ChatStatus::Submitted | ChatStatus::Streaming => {
            let glyph = SPINNER_GLYPHS[(app.spinner_tick as usize) % SPINNER_GLYPHS.len()];
            lines.push(Line::from(Span::styled(
                format!("  {glyph} thinking…"),
                Style::default().fg(ACCENT),
            )));
        }
        ChatStatus::Error | ChatStatus::Idle => {}
    }

    // Tail: newest at the bottom
    let height = area.height as usize;
    let skip = lines.len().saturating_sub(height);
    let visible: Vec<Line> = lines.into_iter().skip(skip).collect();
    f.render_widget(Paragraph::new(visible), area);
}

fn message_lines(message: &Message, width: usize, out: &mut Vec<Line<'static>>) {
    let (marker, color) = match message.role {
        Role::User => ("❯", ACCENT),
        Role::Assistant => ("✦", Color::White),
        Role::Tool => ("⚙", Color::DarkGray),
    };

    let mut first = true;
    for paragraph in message.content.split('\n') {
        for line in wrap_text(paragraph, width) {
            let prefix = if first { format!("  {marker} ") } else { "    ".to_string() };
            first = false;
            out.push(Line::from(vec![
                Span::styled(prefix, Style::default().fg(color).add_modifier(Modifier::BOLD)),
                Span::styled(line, Style::default().fg(color)),
            ]));
        }
    }

    for call in &message.tool_calls {
        let (state, style) = match call.approval {
            Approval::NotRequired => ("", Style::default().fg(Color::DarkGray)),
            Approval::Pending => (
                "  needs approval · Ctrl+Y approve · Ctrl+R reject",
                Style::default().fg(Color::Yellow),
            ),
            Approval::Approved => ("  approved", Style::default().fg(Color::Green)),
            Approval::Rejected => ("  rejected", Style::default().fg(Color::Red)),
        };
        out.push(Line::from(vec![
            Span::styled(format!("    ⚙ {}", call.name), Style::default().fg(Color::White)),
            Span::styled(state, style),
        ]));
    }

    if let Some(error) = &message.error {
        for line in wrap_text(&format!("error: {error}"), width) {
            out.push(Line::from(Span::styled(format!("    {line}"), Style::default().fg(Color::Red))));
        }
    }
    out.push(Line::from(""));
}

/// Greedy word wrap by display width. Words wider than `max_width` get a line
/// of their own.
pub fn wrap_text(text: &str, max_width: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_width = 0usize;

    for word in text.split_whitespace() {
        let word_width = word.width();
        if current_width == 0 {
            current.push_str(word);
            current_width = word_width;
        } else if current_width + 1 + word_width <= max_width {
            current.push(' ');
            current.push_str(word);
            current_width += 1 + word_width;
        } else {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
            current_width = word_width;
        }
    }
    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

// ── Input ─────────────────────────────────────────────────────────────────────

fn draw_input(f: &mut Frame, app: &App, area: Rect) {
    if area.height == 0 {
        return;
    }
    let mode = app.controller.mode();
    let prompt_char = match mode {
        Mode::Command => "❯",
        Mode::Chat => "✦",
    };
    let prompt_span = Span::styled(
        format!(" {prompt_char} "),
        Style::default().fg(ACCENT).add_modifier(Modifier::BOLD),
    );

    // Multi-line chat drafts show their last line
    let input = app.controller.input();
    let shown = input.rsplit('\n').next().unwrap_or_default();

    let content_span = if input.is_empty() {
        let placeholder = match mode {
            Mode::Command => app.placeholder.as_str(),
            Mode::Chat if app.controller.status().is_loading() => "answering…",
            Mode::Chat => "Ask anything · Enter to send · Shift+Enter newline",
        };
        Span::styled(placeholder.to_string(), Style::default().fg(DIM))
    } else {
        Span::styled(shown.to_string(), Style::default().fg(Color::White))
    };

    let mut spans = vec![prompt_span, content_span];
    let keyboard_button = app.mobile_ui().show_keyboard_button(mode, app.input_focused);
    if keyboard_button {
        let used: usize = spans.iter().map(|s| s.content.width()).sum();
        let pad = (area.width as usize).saturating_sub(used + 4);
        spans.push(Span::raw(" ".repeat(pad)));
        spans.push(Span::styled(" ⌨ ", Style::default().fg(Color::Black).bg(ACCENT)));
    }

    f.render_widget(Paragraph::new(Line::from(spans)).wrap(Wrap { trim: false }), area);

    if app.input_focused {
        // prompt is " ❯ ", 3 cols wide
        let prompt_width: u16 = 3;
        let cursor_x = area.x + prompt_width + shown.width() as u16;
        if cursor_x < area.x + area.width {
            f.set_cursor_position((cursor_x, area.y));
        }
    }
}
