use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant, SystemTime};
use std::{
    fmt,
    sync::{Arc, Mutex},
    thread,
};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};

use crate::app::{ProgressEvent, ProgressSink};
use crate::error::OpenNeuroError;

const EVENTS_MAX: usize = 6;
const LOGS_MAX: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Operational,
    Logs,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolve,
    Prepare,
    Fetch,
    Store,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Resolve => "Resolve",
            Phase::Prepare => "Prepare",
            Phase::Fetch => "Fetch",
            Phase::Store => "Store",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug)]
struct AppState {
    status: String,
    phase: Phase,
    latency_ms: Option<u128>,
    requests: u64,
    skipped: u64,
    position: Option<(usize, usize)>,
    events: VecDeque<String>,
    logs: VecDeque<String>,
    view: View,
    started: Instant,
    active: bool,
}

/// Full-screen progress view shown while a download runs.
pub struct Tui {
    dataset: String,
    target: String,
    state: Arc<Mutex<AppState>>,
    log_scroll: u16,
}

struct TuiProgress {
    state: Arc<Mutex<AppState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            let message = event.message.trim().to_string();
            if let Some((phase, payload)) = parse_phase(&message) {
                state.phase = phase;
                state.status = payload.to_string();
                if let Some(position) = parse_position(payload) {
                    state.position = Some(position);
                }
            } else if let Some(latency) = event
                .elapsed
                .map(|elapsed| elapsed.as_millis())
                .or_else(|| parse_latency(&message))
            {
                state.latency_ms = Some(latency);
            } else if message.starts_with("file.skip") {
                state.skipped = state.skipped.saturating_add(1);
                if let Some(position) = parse_position(&message) {
                    state.position = Some(position);
                }
            } else {
                state.status = message.clone();
            }

            if message == "api.request" {
                state.requests = state.requests.saturating_add(1);
            }

            push_event(&mut state.events, message.clone());
            push_log(&mut state.logs, format!("[{}] {message}", timestamp()));
        }
    }
}

impl Tui {
    pub fn new(dataset: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            target: target.into(),
            state: Arc::new(Mutex::new(AppState {
                status: "ready".to_string(),
                phase: Phase::Resolve,
                latency_ms: None,
                requests: 0,
                skipped: 0,
                position: None,
                events: VecDeque::new(),
                logs: VecDeque::new(),
                view: View::Operational,
                started: Instant::now(),
                active: false,
            })),
            log_scroll: 0,
        }
    }

    /// Runs `f` on a worker thread while drawing its progress events.
    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, OpenNeuroError> + Send + 'static,
        R: Send + 'static,
    {
        self.set_active(true);

        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        loop {
            if let Ok(state) = self.state.lock() {
                let elapsed = state.started.elapsed();
                terminal
                    .draw(|frame| draw_ui(frame, self, &state, tick, elapsed))
                    .into_diagnostic()?;
            }

            if let Ok(result) = rx.try_recv() {
                self.set_active(false);
                restore_terminal()?;
                handle.join().ok();
                return result.map_err(miette::Report::new);
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if self.handle_key(key) {
                        break;
                    }
                }
            }

            tick = tick.wrapping_add(1);
        }

        self.set_active(false);
        restore_terminal()?;
        Err(miette::Report::msg("aborted"))
    }

    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return false;
        }
        match key.code {
            KeyCode::F(1) | KeyCode::Char('?') => self.set_view(View::Help),
            KeyCode::F(3) => self.set_view(View::Operational),
            KeyCode::F(4) => self.set_view(View::Logs),
            KeyCode::PageUp => self.scroll_logs(-5),
            KeyCode::PageDown => self.scroll_logs(5),
            KeyCode::Char('q') | KeyCode::Esc => return true,
            _ => {}
        }
        false
    }

    fn set_view(&self, view: View) {
        if let Ok(mut state) = self.state.lock() {
            state.view = view;
        }
    }

    fn set_active(&self, active: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.active = active;
        }
    }

    fn scroll_logs(&mut self, delta: i16) {
        let next = self.log_scroll as i16 + delta;
        self.log_scroll = next.max(0) as u16;
    }
}

fn restore_terminal() -> miette::Result<()> {
    disable_raw_mode().into_diagnostic()?;
    let mut stdout = io::stdout();
    stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
    Ok(())
}

fn draw_ui(frame: &mut ratatui::Frame, tui: &Tui, state: &AppState, tick: usize, elapsed: Duration) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(1),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(tui, state, tick), chunks[0]);
    match state.view {
        View::Operational => frame.render_widget(draw_status_panel(state, elapsed), chunks[1]),
        View::Logs => frame.render_widget(draw_logs_view(state, tui.log_scroll), chunks[1]),
        View::Help => frame.render_widget(draw_help(), chunks[1]),
    }
    let footer = Paragraph::new(Line::from(Span::styled(
        "F1 Help  F3 Progress  F4 Logs  q/Esc abort",
        Style::default().fg(Color::Gray),
    )));
    frame.render_widget(footer, chunks[2]);
}

fn draw_header(tui: &Tui, state: &AppState, tick: usize) -> Paragraph<'static> {
    let hb = if tick % 2 == 0 && state.active {
        "*"
    } else {
        " "
    };
    let header_line = Line::from(vec![
        Span::styled(
            "OPENNEURO",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw("   Dataset: "),
        Span::styled(tui.dataset.clone(), Style::default().fg(Color::Cyan)),
        Span::raw("   "),
        Span::styled(hb, Style::default().fg(Color::Green)),
    ]);
    let target_line = Line::from(Span::styled(
        format!("Target: {}", tui.target),
        Style::default().fg(Color::Gray),
    ));
    Paragraph::new(vec![header_line, target_line])
        .alignment(Alignment::Left)
        .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_status_panel(state: &AppState, elapsed: Duration) -> Paragraph<'static> {
    let percent = state
        .position
        .map(|(done, total)| if total == 0 { 100 } else { (done * 100 / total) as u8 })
        .unwrap_or(0);
    let phase_color = if state.active {
        Color::Cyan
    } else {
        Color::Green
    };
    let files = state
        .position
        .map(|(done, total)| format!("{done}/{total}"))
        .unwrap_or_else(|| "--".to_string());
    let latency = state
        .latency_ms
        .map(|v| format!("{v} ms"))
        .unwrap_or_else(|| "--".to_string());
    let mut lines = vec![
        Line::from(Span::styled(
            "STATUS / PROGRESS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(vec![
            Span::styled("Phase: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!("{:<7} ", state.phase.label()),
                Style::default().fg(phase_color),
            ),
            Span::raw(progress_bar(percent)),
            Span::raw(format!(" {:>3}%", percent)),
        ]),
        Line::from(vec![
            Span::styled("Files: ", Style::default().fg(Color::Gray)),
            Span::raw(files),
            Span::styled("   Already complete: ", Style::default().fg(Color::Gray)),
            Span::raw(state.skipped.to_string()),
        ]),
        Line::from(vec![
            Span::styled("API requests: ", Style::default().fg(Color::Gray)),
            Span::raw(state.requests.to_string()),
            Span::styled("   Latency: ", Style::default().fg(Color::Gray)),
            Span::raw(latency),
            Span::styled("   Elapsed: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{}s", elapsed.as_secs())),
        ]),
        Line::from(vec![
            Span::styled("Current: ", Style::default().fg(Color::Gray)),
            Span::raw(state.status.clone()),
        ]),
        Line::from(Span::styled(
            "Recent events:",
            Style::default().fg(Color::Gray),
        )),
    ];

    for event in state.events.iter().rev().take(EVENTS_MAX) {
        lines.push(Line::from(format!("- {}", event)));
    }

    Paragraph::new(lines).wrap(Wrap { trim: true })
}

fn draw_logs_view(state: &AppState, scroll: u16) -> Paragraph<'static> {
    let lines: Vec<Line<'static>> = state
        .logs
        .iter()
        .map(|line| Line::from(line.clone()))
        .collect();
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Logs"))
        .scroll((scroll, 0))
        .wrap(Wrap { trim: false })
}

fn draw_help() -> Paragraph<'static> {
    let block = Block::default().borders(Borders::ALL).title("Help");
    let lines = vec![
        Line::from("F1 Help  F3 Progress  F4 Logs  PgUp/PgDn scroll logs"),
        Line::from("q or Esc aborts; rerun the same command to resume"),
        Line::from("Example: openneuro download --dataset ds000246 --include sub-0001/anat"),
    ];
    Paragraph::new(lines).block(block).wrap(Wrap { trim: true })
}

fn progress_bar(percent: u8) -> String {
    let total = 20;
    let filled = (percent as usize * total) / 100;
    let mut out = String::from("[");
    for i in 0..total {
        out.push(if i < filled { '#' } else { '.' });
    }
    out.push(']');
    out
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    if let Some(rest) = message.strip_prefix("phase=Resolve;") {
        return Some((Phase::Resolve, rest.trim()));
    }
    if let Some(rest) = message.strip_prefix("phase=Prepare;") {
        return Some((Phase::Prepare, rest.trim()));
    }
    if let Some(rest) = message.strip_prefix("phase=Fetch;") {
        return Some((Phase::Fetch, rest.trim()));
    }
    if let Some(rest) = message.strip_prefix("phase=Store;") {
        return Some((Phase::Store, rest.trim()));
    }
    None
}

fn parse_latency(message: &str) -> Option<u128> {
    message
        .split("latency_ms=")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse::<u128>().ok())
}

/// Reads `[done/total]` out of a progress message.
fn parse_position(message: &str) -> Option<(usize, usize)> {
    let start = message.find('[')?;
    let end = message[start..].find(']')? + start;
    let (done, total) = message[start + 1..end].split_once('/')?;
    Some((done.parse().ok()?, total.parse().ok()?))
}

fn push_event(buffer: &mut VecDeque<String>, item: String) {
    buffer.push_back(item);
    while buffer.len() > EVENTS_MAX {
        buffer.pop_front();
    }
}

fn push_log(buffer: &mut VecDeque<String>, item: String) {
    buffer.push_back(item);
    while buffer.len() > LOGS_MAX {
        buffer.pop_front();
    }
}

fn timestamp() -> String {
    let now = SystemTime::now();
    let secs = now
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs();
    let mins = (secs / 60) % 60;
    let hours = (secs / 3600) % 24;
    let seconds = secs % 60;
    format!("{hours:02}:{mins:02}:{seconds:02}")
}

pub fn bytes_to_human(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let value = bytes as f64;
    if value >= GB {
        format!("{:.1} GB", value / GB)
    } else if value >= MB {
        format!("{:.1} MB", value / MB)
    } else if value >= KB {
        format!("{:.1} KB", value / KB)
    } else {
        format!("{bytes} B")
    }
}
