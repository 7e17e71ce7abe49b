use std::io::{self, Stdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyEvent, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph},
    Frame, Terminal,
};
use tokio::sync::mpsc;

use super::{handle_key, selected_index, Focus, UiState};
use crate::board::Row;
use crate::events::BoardEvent;
use crate::session::BoardSession;
use crate::style::Rgb;

const KEY_POLL: Duration = Duration::from_millis(100);
const REMOUNT_DELAY: Duration = Duration::from_secs(2);

fn rgb(color: Rgb) -> Color {
    Color::Rgb(color.0, color.1, color.2)
}

fn card(row: &Row<'_>) -> ListItem<'static> {
    let mut base = Style::default().fg(Color::Black);
    if let Some(background) = row.style.background {
        base = base.bg(rgb(background));
    }
    let marker = Span::styled("▌", Style::default().fg(rgb(row.style.border)));
    let mut header = vec![
        marker.clone(),
        Span::styled(
            format!("Task#{}", row.ordinal),
            base.add_modifier(Modifier::BOLD),
        ),
        Span::styled(format!("  Status: {}", row.status), base),
    ];
    if row.pending {
        header.push(Span::styled("  …", base.fg(Color::DarkGray)));
    }
    if let Some((_, err)) = row.failure {
        header.push(Span::styled(
            format!("  ! {err}"),
            base.fg(Color::Red).add_modifier(Modifier::BOLD),
        ));
    }
    ListItem::new(vec![
        Line::from(header),
        Line::from(vec![marker, Span::styled(row.task.to_string(), base)]),
        Line::from(""),
    ])
}

pub fn draw(f: &mut Frame<'_>, session: &BoardSession, ui: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(3),
            Constraint::Length(3),
        ])
        .split(f.area());

    draw_header(f, session, chunks[0]);
    draw_input(f, session, ui, chunks[1]);
    draw_list(f, session, ui, chunks[2]);
    draw_footer(f, session, ui, chunks[3]);
}

fn draw_header(f: &mut Frame<'_>, session: &BoardSession, area: Rect) {
    let sync = if session.is_mounted() { "live" } else { "reconnecting" };
    let header = Paragraph::new(Line::from(vec![
        Span::styled("Task Board", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(format!("  {} ({sync})", session.collection())),
    ]))
    .alignment(Alignment::Center)
    .block(Block::default().borders(Borders::ALL));
    f.render_widget(header, area);
}

fn focus_style(active: bool) -> Style {
    if active {
        Style::default().fg(Color::Cyan)
    } else {
        Style::default()
    }
}

fn draw_input(f: &mut Frame<'_>, session: &BoardSession, ui: &UiState, area: Rect) {
    let board = session.board();
    let title = if board.can_submit() {
        "You can add a new task here (Enter: Add Task)"
    } else {
        "You can add a new task here"
    };
    let input = Paragraph::new(board.input()).block(
        Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(focus_style(ui.focus == Focus::Input)),
    );
    f.render_widget(input, area);
    if ui.focus == Focus::Input {
        let width = board.input().chars().count() as u16;
        let x = (area.x + 1 + width).min(area.x + area.width.saturating_sub(2));
        f.set_cursor_position((x, area.y + 1));
    }
}

fn draw_list(f: &mut Frame<'_>, session: &BoardSession, ui: &UiState, area: Rect) {
    let board = session.board();
    let items: Vec<ListItem> = board.rows().iter().map(card).collect();
    let mut state = ListState::default();
    if ui.focus == Focus::List {
        state.select(selected_index(board.tasks(), ui.selected.as_deref()));
    }
    let list = List::new(items)
        .block(
            Block::default()
                .title(format!("Tasks ({})", board.tasks().len()))
                .borders(Borders::ALL)
                .border_style(focus_style(ui.focus == Focus::List)),
        )
        .highlight_symbol("> ")
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    f.render_stateful_widget(list, area, &mut state);
}

fn draw_footer(f: &mut Frame<'_>, session: &BoardSession, ui: &UiState, area: Rect) {
    let line = match &ui.notice {
        Some(notice) => Line::from(Span::styled(
            notice.text.clone(),
            if notice.error {
                Style::default().fg(Color::Red)
            } else {
                Style::default().fg(Color::Green)
            },
        )),
        None => {
            let help = match ui.focus {
                Focus::Input => "type a task | Enter add | Tab list | Esc quit",
                Focus::List => {
                    "j/k move | d done | l late | x delete | r retry | c clear | Tab input | q quit"
                }
            };
            let pending = session.board().pending_count();
            if pending > 0 {
                Line::from(format!("{help} | {pending} pending"))
            } else {
                Line::from(help)
            }
        }
    };
    f.render_widget(
        Paragraph::new(line).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

/// Reads keys on a plain thread; crossterm's blocking reads must stay off the runtime.
fn spawn_key_reader(tx: mpsc::UnboundedSender<KeyEvent>, stop: Arc<AtomicBool>) {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            match event::poll(KEY_POLL) {
                Ok(true) => match event::read() {
                    Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                        if tx.send(key).is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        log::error!("ui: key read failed: {err}");
                        return;
                    }
                },
                Ok(false) => {}
                Err(err) => {
                    log::error!("ui: key poll failed: {err}");
                    return;
                }
            }
        }
    });
}

enum Input {
    Key(KeyEvent),
    KeysClosed,
    Board(Option<BoardEvent>),
    Remount,
}

pub async fn run(mut session: BoardSession) -> anyhow::Result<()> {
    session.mount().await?;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let stop = Arc::new(AtomicBool::new(false));
    let (tx, mut keys) = mpsc::unbounded_channel();
    spawn_key_reader(tx, Arc::clone(&stop));

    let result = event_loop(&mut terminal, &mut session, &mut keys).await;

    stop.store(true, Ordering::Relaxed);
    session.unmount();
    restore_terminal(&mut terminal)?;
    result
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()
}

async fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    session: &mut BoardSession,
    keys: &mut mpsc::UnboundedReceiver<KeyEvent>,
) -> anyhow::Result<()> {
    let mut ui = UiState::default();
    loop {
        terminal.draw(|f| draw(f, &*session, &ui))?;
        if ui.quit {
            return Ok(());
        }
        let mounted = session.is_mounted();
        let input = tokio::select! {
            key = keys.recv() => key.map_or(Input::KeysClosed, Input::Key),
            event = session.next_event(), if mounted => Input::Board(event),
            _ = tokio::time::sleep(REMOUNT_DELAY), if !mounted => Input::Remount,
        };
        match input {
            Input::Key(key) => handle_key(session, &mut ui, key),
            Input::KeysClosed => return Ok(()),
            Input::Board(Some(event)) => ui.on_event(session, event),
            Input::Board(None) => ui.error("subscription closed, reconnecting..."),
            Input::Remount => match session.mount().await {
                Ok(()) => ui.info("reconnected"),
                Err(err) => ui.error(format!("reconnect failed: {err}")),
            },
        }
    }
}
