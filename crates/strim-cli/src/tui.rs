use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Gauge, Paragraph};
use ratatui::{Frame, Terminal};
use tokio::sync::broadcast;

use strim::{Server, ServerEvent, ServerStats, ViewerPhase};

const MAX_LOG_LINES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warn,
    Error,
}

pub struct TuiState {
    log: VecDeque<(Level, String)>,
    scroll: usize,
}

impl TuiState {
    pub fn new() -> Self {
        Self {
            log: VecDeque::new(),
            scroll: 0,
        }
    }

    pub fn log_info(&mut self, message: impl Into<String>) {
        self.push(Level::Info, message.into());
    }

    pub fn log_warn(&mut self, message: impl Into<String>) {
        self.push(Level::Warn, message.into());
    }

    pub fn log_error(&mut self, message: impl Into<String>) {
        self.push(Level::Error, message.into());
    }

    fn push(&mut self, level: Level, message: String) {
        if self.log.len() == MAX_LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back((level, message));
    }

    pub fn record(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Listening { addr, title } => {
                self.log_info(format!("Hosting {:?} on {}", title, addr));
            }
            ServerEvent::ViewerConnected { viewer_id, addr } => {
                self.log_info(format!("Viewer {} connected from {}", viewer_id, addr));
            }
            ServerEvent::ViewerReady { viewer_id } => {
                self.log_info(format!("Viewer {} is ready", viewer_id));
            }
            ServerEvent::ViewerDisconnected { viewer_id, reason } => {
                self.log_info(format!("Viewer {} {}", viewer_id, reason.as_str()));
            }
            ServerEvent::AllReady => self.log_info("All viewers ready, resuming"),
            ServerEvent::MediaChanged { title } => {
                self.log_info(format!("Now playing {:?}", title));
            }
            ServerEvent::Error { message } => self.log_error(message),
        }
    }

    pub fn scroll_up(&mut self) {
        self.scroll = (self.scroll + 5).min(self.log.len().saturating_sub(1));
    }

    pub fn scroll_down(&mut self) {
        self.scroll = self.scroll.saturating_sub(5);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll = 0;
    }
}

/// Runs the host dashboard until the user quits or the server stops.
pub fn run(server: &Server, mut events: broadcast::Receiver<ServerEvent>) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut state = TuiState::new();

    let result = dashboard_loop(&mut terminal, server, &mut events, &mut state);

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;
    result
}

fn dashboard_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    server: &Server,
    events: &mut broadcast::Receiver<ServerEvent>,
    state: &mut TuiState,
) -> io::Result<()> {
    while server.is_running() {
        loop {
            match events.try_recv() {
                Ok(event) => state.record(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    state.log_warn(format!("Missed {} server events", skipped));
                }
                Err(_) => break,
            }
        }

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    let ctrl_c = key.modifiers.contains(KeyModifiers::CONTROL)
                        && key.code == KeyCode::Char('c');
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                        _ if ctrl_c => return Ok(()),
                        KeyCode::PageUp => state.scroll_up(),
                        KeyCode::PageDown => state.scroll_down(),
                        KeyCode::End => state.scroll_to_bottom(),
                        _ => {}
                    }
                }
            }
        }

        let stats = server.stats();
        let uptime = server.uptime().as_secs();
        let addr = server.local_addr();
        terminal.draw(|frame| render(frame, state, &stats, uptime, addr))?;
    }
    Ok(())
}

fn render(frame: &mut Frame, state: &TuiState, stats: &ServerStats, uptime: u64, addr: SocketAddr) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length(stats.viewers.len().clamp(1, 8) as u16 + 2),
            Constraint::Min(5),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, chunks[0], stats, uptime, addr);
    render_sync(frame, chunks[1], stats);
    render_viewers(frame, chunks[2], stats);
    render_log(frame, chunks[3], state);
    render_help(frame, chunks[4]);
}

fn render_header(frame: &mut Frame, area: Rect, stats: &ServerStats, uptime: u64, addr: SocketAddr) {
    let title = format!(" strim - Uptime: {} ", format_duration(uptime));

    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let text = format!(
        "{}  |  {}  |  Viewers: {}  |  Packets relayed: {}",
        stats.title,
        addr,
        stats.alive_count,
        stats.packets_broadcast
    );

    let paragraph = Paragraph::new(text)
        .block(block)
        .style(Style::default().fg(Color::White));

    frame.render_widget(paragraph, area);
}

fn render_sync(frame: &mut Frame, area: Rect, stats: &ServerStats) {
    let block = Block::default()
        .title(if stats.paused { " Paused " } else { " Playing " })
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let ready = stats.alive_count.saturating_sub(stats.pending_ready);
    let (ratio, label) = if stats.alive_count == 0 {
        (0.0, "No viewers".to_string())
    } else {
        (
            ready as f64 / stats.alive_count as f64,
            format!("{}/{} viewers ready", ready, stats.alive_count),
        )
    };

    let gauge = Gauge::default()
        .block(block)
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(ratio)
        .label(label);

    frame.render_widget(gauge, area);
}

fn render_viewers(frame: &mut Frame, area: Rect, stats: &ServerStats) {
    let block = Block::default()
        .title(" Viewers ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let lines: Vec<Line> = if stats.viewers.is_empty() {
        vec![Line::from(Span::styled(
            "Waiting for viewers...",
            Style::default().fg(Color::DarkGray),
        ))]
    } else {
        stats
            .viewers
            .iter()
            .map(|viewer| {
                let phase_color = match viewer.phase {
                    ViewerPhase::Ready => Color::Green,
                    ViewerPhase::Initialized => Color::Yellow,
                    ViewerPhase::Connecting => Color::Gray,
                };
                Line::from(vec![
                    Span::styled(format!("#{:<3} ", viewer.viewer_id), Style::default().fg(Color::Gray)),
                    Span::styled(format!("{:<22}", viewer.addr), Style::default().fg(Color::White)),
                    Span::styled(format!("{:<10}", viewer.phase.as_str()), Style::default().fg(phase_color)),
                    Span::styled(
                        format_duration(viewer.connected_secs),
                        Style::default().fg(Color::Gray),
                    ),
                ])
            })
            .collect()
    };

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_log(frame: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default()
        .title(" Events ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Magenta));

    let visible = area.height.saturating_sub(2) as usize;
    let end = state.log.len().saturating_sub(state.scroll);
    let start = end.saturating_sub(visible);

    let lines: Vec<Line> = state
        .log
        .range(start..end)
        .map(|(level, message)| {
            let color = match level {
                Level::Info => Color::White,
                Level::Warn => Color::Yellow,
                Level::Error => Color::Red,
            };
            Line::from(Span::styled(message.as_str(), Style::default().fg(color)))
        })
        .collect();

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_help(frame: &mut Frame, area: Rect) {
    let block = Block::default()
        .title(" Controls ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let text = Paragraph::new("Press 'q' or ESC to stop hosting  |  PgUp/PgDn/End to scroll events")
        .block(block)
        .style(
            Style::default()
                .fg(Color::DarkGray)
                .add_modifier(Modifier::ITALIC),
        );

    frame.render_widget(text, area);
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, mins, secs)
}
