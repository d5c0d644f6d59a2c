use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Paragraph};
use secrecy::SecretString;

use crate::model::config::{AppConfig, LastLocation, expand_home};
use crate::model::mode::{Mode, PromptKind};
use crate::model::plugin_list::PluginList;
use crate::msg::{Msg, StoreEvent};
use crate::store::remote::RemoteTarget;
use crate::store::{ConnectionStatus, EntryState, InstallSource, NamingConvention};
use crate::worker::{StoreRequest, StoreWorker};

const MAX_NOTIFICATIONS: usize = 8;
const WATCH_DEBOUNCE: Duration = Duration::from_millis(250);

const HELP: &[(&str, &str)] = &[
    ("j / k", "move selection"),
    ("e / d", "enable / disable selected"),
    ("x", "uninstall selected (asks y/n)"),
    ("i", "install from path or URL"),
    ("s", "save a copy of selected"),
    ("l", "open local directory"),
    ("c / D", "connect / disconnect remote"),
    ("r", "refresh"),
    ("/", "filter"),
    (":", "command palette"),
    ("Esc", "cancel transfer, clear filter"),
    ("q", "quit"),
    (":local <dir>", ""),
    (":remote user@host[:port][/path]", ""),
    (":install <path|url>", ""),
    (":uninstall|enable|disable <name>", ""),
    (":export <name> <dir>", ""),
    (":suffix <value>", ""),
    (":resume on|off", ""),
    (":connect  :disconnect  :refresh  :quit", ""),
];

/// A parsed command palette line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Help,
    Local(PathBuf),
    Remote(RemoteTarget),
    Connect,
    Disconnect,
    Install(InstallSource),
    Uninstall(String),
    Enable(String),
    Disable(String),
    Export { name: String, dest_dir: PathBuf },
    Suffix(String),
    Resume(bool),
    Refresh,
    Quit,
}

pub struct App {
    pub mode: Mode,
    pub list: PluginList,
    pub config: AppConfig,
    pub naming: NamingConvention,
    pub should_quit: bool,
    pub notifications: VecDeque<String>,
    worker: StoreWorker,
    location: String,
    status: Option<ConnectionStatus>,
    /// Requests sent to the worker that have not reported `Idle` yet.
    in_flight: usize,
    input: String,
    help_visible: bool,
    refresh_due: Option<Instant>,
}

impl App {
    pub fn new(config: AppConfig, naming: NamingConvention, worker: StoreWorker) -> Self {
        Self {
            mode: Mode::Normal,
            list: PluginList::default(),
            config,
            naming,
            should_quit: false,
            notifications: VecDeque::new(),
            worker,
            location: String::new(),
            status: None,
            in_flight: 0,
            input: String::new(),
            help_visible: false,
            refresh_due: None,
        }
    }

    /// Reopens the last location. A local directory is opened directly; a
    /// remote one is pre-filled and the password prompt is shown.
    pub fn resume(&mut self) -> Result<()> {
        if !self.config.general.resume_last_location {
            return Ok(());
        }

        match self.config.general.last_location {
            Some(LastLocation::Local) => {
                if let Some(dir) = self.config.local_dir() {
                    self.request(StoreRequest::UseLocal(dir))?;
                }
            }
            Some(LastLocation::Remote) => {
                if self.config.remote_target().is_some() {
                    self.begin_connect();
                }
            }
            None => {}
        }

        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight > 0
    }

    // ── MVU: Update ──────────────────────────────────────────────

    pub fn update(&mut self, msg: Msg) -> Result<()> {
        match msg {
            Msg::Key(key) => self.handle_key(key)?,
            Msg::Store(event) => self.handle_store_event(event),
            Msg::DirectoryChanged => {
                self.refresh_due = Some(Instant::now() + WATCH_DEBOUNCE);
            }
            Msg::Tick => self.handle_tick()?,
            Msg::Quit => self.should_quit = true,
            Msg::Resize(..) => {}
        }
        Ok(())
    }

    fn handle_store_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::Location { label, status } => {
                self.location = label;
                self.status = status;
            }
            StoreEvent::Listing(entries) => self.list.replace(entries),
            StoreEvent::Done(message) => self.push_notification(message),
            StoreEvent::Failed(err) => self.push_notification(format!("error: {err}")),
            StoreEvent::Idle => self.in_flight = self.in_flight.saturating_sub(1),
        }
    }

    fn handle_tick(&mut self) -> Result<()> {
        if let Some(due) = self.refresh_due
            && Instant::now() >= due
        {
            self.refresh_due = None;
            self.request(StoreRequest::Refresh)?;
        }
        Ok(())
    }

    fn push_notification(&mut self, message: String) {
        self.notifications.push_back(message);
        while self.notifications.len() > MAX_NOTIFICATIONS {
            self.notifications.pop_front();
        }
    }

    fn request(&mut self, request: StoreRequest) -> Result<()> {
        self.worker.send(request)?;
        self.in_flight += 1;
        Ok(())
    }

    fn save_config(&mut self) {
        if let Err(err) = self.config.save() {
            tracing::warn!("saving config: {err:#}");
            self.push_notification(format!("could not save config: {err}"));
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<()> {
        if self.help_visible {
            self.help_visible = false;
            return Ok(());
        }

        match self.mode.clone() {
            Mode::Normal => self.handle_key_normal(key),
            Mode::Command => self.handle_key_command(key),
            Mode::Filter => {
                self.handle_key_filter(key);
                Ok(())
            }
            Mode::Prompt(kind) => self.handle_key_prompt(kind, key),
            Mode::ConfirmUninstall(name) => self.handle_key_confirm(name, key),
        }
    }

    fn handle_key_normal(&mut self, key: KeyEvent) -> Result<()> {
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            if key.code == KeyCode::Char('c') {
                self.should_quit = true;
            }
            return Ok(());
        }

        match key.code {
            KeyCode::Char('q') => self.should_quit = true,
            KeyCode::Char('j') | KeyCode::Down => self.list.move_selection(1),
            KeyCode::Char('k') | KeyCode::Up => self.list.move_selection(-1),
            KeyCode::Char('g') | KeyCode::Home => self.list.selected = 0,
            KeyCode::Char('G') | KeyCode::End => {
                self.list.selected = self.list.len().saturating_sub(1);
            }
            KeyCode::PageDown => self.list.move_selection(10),
            KeyCode::PageUp => self.list.move_selection(-10),
            KeyCode::Char('e') => {
                if let Some(name) = self.selected_name() {
                    self.request(StoreRequest::Enable(name))?;
                }
            }
            KeyCode::Char('d') => {
                if let Some(name) = self.selected_name() {
                    self.request(StoreRequest::Disable(name))?;
                }
            }
            KeyCode::Char('x') | KeyCode::Delete => {
                if let Some(name) = self.selected_name() {
                    self.mode = Mode::ConfirmUninstall(name);
                }
            }
            KeyCode::Char('s') => {
                if self.selected_name().is_some() {
                    let cwd = std::env::current_dir()
                        .map(|dir| dir.display().to_string())
                        .unwrap_or_default();
                    self.open_prompt(PromptKind::ExportDir, cwd);
                }
            }
            KeyCode::Char('i') => self.open_prompt(PromptKind::Install, String::new()),
            KeyCode::Char('l') => {
                let current = self.config.local.directory.clone().unwrap_or_default();
                self.open_prompt(PromptKind::LocalDir, current);
            }
            KeyCode::Char('c') => self.begin_connect(),
            KeyCode::Char('D') => self.request(StoreRequest::Disconnect)?,
            KeyCode::Char('r') => self.request(StoreRequest::Refresh)?,
            KeyCode::Char('/') => {
                self.input = self.list.filter.clone();
                self.mode = Mode::Filter;
            }
            KeyCode::Char(':') => {
                self.input.clear();
                self.mode = Mode::Command;
            }
            KeyCode::Char('?') => self.help_visible = true,
            KeyCode::Esc => {
                if self.is_busy() {
                    self.worker.cancel();
                    self.push_notification("cancelling...".to_string());
                } else if !self.list.filter.is_empty() {
                    self.list.clear_filter();
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_key_command(&mut self, key: KeyEvent) -> Result<()> {
        match key.code {
            KeyCode::Esc => {
                self.mode = Mode::Normal;
                self.input.clear();
            }
            KeyCode::Enter => {
                let line = std::mem::take(&mut self.input);
                self.mode = Mode::Normal;

                if !line.trim().is_empty() {
                    match parse_command(&line) {
                        Ok(command) => self.run_command(command)?,
                        Err(usage) => self.push_notification(usage),
                    }
                }
            }
            _ => edit_input(&mut self.input, key),
        }
        Ok(())
    }

    fn handle_key_filter(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Esc => {
                self.input.clear();
                self.list.clear_filter();
                self.mode = Mode::Normal;
            }
            KeyCode::Enter => {
                self.input.clear();
                self.mode = Mode::Normal;
            }
            KeyCode::Down => self.list.move_selection(1),
            KeyCode::Up => self.list.move_selection(-1),
            _ => {
                edit_input(&mut self.input, key);
                if self.input != self.list.filter {
                    self.list.set_filter(self.input.clone());
                }
            }
        }
    }

    fn handle_key_prompt(&mut self, kind: PromptKind, key: KeyEvent) -> Result<()> {
        match key.code {
            KeyCode::Esc => {
                self.input.clear();
                self.mode = Mode::Normal;
            }
            KeyCode::Enter => {
                let value = std::mem::take(&mut self.input);
                self.mode = Mode::Normal;
                self.submit_prompt(kind, value)?;
            }
            _ => edit_input(&mut self.input, key),
        }
        Ok(())
    }

    fn handle_key_confirm(&mut self, name: String, key: KeyEvent) -> Result<()> {
        self.mode = Mode::Normal;
        if matches!(key.code, KeyCode::Char('y') | KeyCode::Char('Y')) {
            self.request(StoreRequest::Uninstall(name))?;
        }
        Ok(())
    }

    fn open_prompt(&mut self, kind: PromptKind, initial: String) {
        self.input = initial;
        self.mode = Mode::Prompt(kind);
    }

    fn submit_prompt(&mut self, kind: PromptKind, value: String) -> Result<()> {
        match kind {
            PromptKind::Secret => self.connect(SecretString::from(value)),
            _ if value.trim().is_empty() => Ok(()),
            PromptKind::Install => self.install(InstallSource::parse(&value)),
            PromptKind::LocalDir => self.use_local(expand_home(value.trim())),
            PromptKind::ExportDir => match self.selected_name() {
                Some(name) => self.request(StoreRequest::Export {
                    name,
                    dest_dir: expand_home(value.trim()),
                }),
                None => Ok(()),
            },
        }
    }

    fn run_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Help => self.help_visible = true,
            Command::Local(dir) => self.use_local(dir)?,
            Command::Remote(target) => {
                self.config.remember_remote(&target);
                self.save_config();
                self.begin_connect();
            }
            Command::Connect => self.begin_connect(),
            Command::Disconnect => self.request(StoreRequest::Disconnect)?,
            Command::Install(source) => self.install(source)?,
            Command::Uninstall(name) => self.request(StoreRequest::Uninstall(name))?,
            Command::Enable(name) => self.request(StoreRequest::Enable(name))?,
            Command::Disable(name) => self.request(StoreRequest::Disable(name))?,
            Command::Export { name, dest_dir } => {
                self.request(StoreRequest::Export { name, dest_dir })?
            }
            Command::Suffix(raw) => match NamingConvention::new(&raw) {
                Ok(naming) => {
                    self.config.set_naming(&naming);
                    self.save_config();
                    self.naming = naming.clone();
                    self.request(StoreRequest::SetNaming(naming))?;
                }
                Err(err) => self.push_notification(format!("invalid suffix: {err}")),
            },
            Command::Resume(enabled) => {
                self.config.general.resume_last_location = enabled;
                self.save_config();
                let state = if enabled { "on" } else { "off" };
                self.push_notification(format!("resume last location: {state}"));
            }
            Command::Refresh => self.request(StoreRequest::Refresh)?,
            Command::Quit => self.should_quit = true,
        }
        Ok(())
    }

    fn install(&mut self, source: InstallSource) -> Result<()> {
        let source = match source {
            InstallSource::Path(path) => {
                InstallSource::Path(expand_home(&path.to_string_lossy()))
            }
            url => url,
        };
        self.request(StoreRequest::Install(source))
    }

    fn use_local(&mut self, dir: PathBuf) -> Result<()> {
        self.config.remember_local(&dir);
        self.save_config();
        self.list.clear_filter();
        self.request(StoreRequest::UseLocal(dir))
    }

    fn begin_connect(&mut self) {
        match self.config.remote_target() {
            Some(_) => self.open_prompt(PromptKind::Secret, String::new()),
            None => self.push_notification(
                "no remote configured, use :remote user@host[:port][/path]".to_string(),
            ),
        }
    }

    fn connect(&mut self, secret: SecretString) -> Result<()> {
        let Some(endpoint) = self.config.endpoint(secret) else {
            return Ok(());
        };

        self.list.clear_filter();
        self.push_notification(format!("connecting to {endpoint}..."));
        self.request(StoreRequest::Connect {
            endpoint,
            options: self.config.connect_options(),
        })
    }

    fn selected_name(&self) -> Option<String> {
        self.list.selected_entry().map(|entry| entry.name.clone())
    }

    // ── MVU: View ────────────────────────────────────────────────

    pub fn view(&self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1), // location bar
                Constraint::Min(1),    // listing
                Constraint::Length(1), // status bar
            ])
            .split(frame.area());

        self.render_location_bar(frame, chunks[0]);
        self.render_listing(frame, chunks[1]);
        self.render_status_bar(frame, chunks[2]);

        match &self.mode {
            Mode::Command => self.render_command_overlay(frame),
            Mode::Prompt(kind) => self.render_prompt_overlay(frame, *kind),
            _ => {}
        }

        if self.help_visible {
            render_help_overlay(frame);
        }
    }

    fn render_location_bar(&self, frame: &mut Frame, area: Rect) {
        let (location, location_style) = if self.location.is_empty() {
            (
                " no location (l: local directory, :remote user@host) ".to_string(),
                Style::default().fg(Color::DarkGray),
            )
        } else {
            (
                format!(" {} ", self.location),
                Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
            )
        };

        let mut spans = vec![
            Span::styled(
                " plugshelf ",
                Style::default()
                    .fg(Color::Black)
                    .bg(Color::Magenta)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(location, location_style),
        ];

        if let Some(status) = &self.status {
            let color = match status {
                ConnectionStatus::Connected => Color::Green,
                ConnectionStatus::Connecting => Color::Yellow,
                ConnectionStatus::Disconnected => Color::DarkGray,
                ConnectionStatus::Failed(_) => Color::Red,
            };
            spans.push(Span::styled(format!("[{status}] "), Style::default().fg(color)));
        }

        let (enabled, disabled) = self.list.counts();
        spans.push(Span::styled(
            format!("{enabled} enabled, {disabled} disabled, suffix {}", self.naming),
            Style::default().fg(Color::Gray),
        ));

        frame.render_widget(
            Paragraph::new(Line::from(spans)).style(Style::default().bg(Color::Rgb(15, 15, 24))),
            area,
        );
    }

    fn render_listing(&self, frame: &mut Frame, area: Rect) {
        let height = area.height as usize;
        let top = (self.list.selected + 1).saturating_sub(height);

        let lines: Vec<Line> = if self.list.is_empty() {
            let hint = if self.list.filter.is_empty() {
                "No plugins"
            } else {
                "No matches"
            };
            vec![Line::from(Span::styled(
                hint,
                Style::default().fg(Color::DarkGray),
            ))]
        } else {
            self.list
                .rows()
                .enumerate()
                .skip(top)
                .take(height)
                .map(|(idx, entry)| {
                    let (marker, color) = match entry.state {
                        EntryState::Enabled => ("● ", Color::Green),
                        EntryState::Disabled => ("○ ", Color::Yellow),
                        EntryState::Unrecognized => ("  ", Color::DarkGray),
                    };
                    let content = format!("{marker}{:<48} {}", entry.name, entry.state.label());

                    if idx == self.list.selected {
                        Line::from(Span::styled(
                            content,
                            Style::default().fg(Color::Black).bg(Color::Cyan),
                        ))
                    } else {
                        Line::from(Span::styled(content, Style::default().fg(color)))
                    }
                })
                .collect()
        };

        frame.render_widget(
            Paragraph::new(lines).style(Style::default().bg(Color::Rgb(12, 12, 18))),
            area,
        );
    }

    fn render_status_bar(&self, frame: &mut Frame, area: Rect) {
        let mode_style = match self.mode {
            Mode::Normal => Style::default()
                .fg(Color::Black)
                .bg(Color::Magenta)
                .add_modifier(Modifier::BOLD),
            Mode::ConfirmUninstall(_) => Style::default()
                .fg(Color::Black)
                .bg(Color::Red)
                .add_modifier(Modifier::BOLD),
            _ => Style::default()
                .fg(Color::Black)
                .bg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        };

        let mode_span = Span::styled(format!(" {} ", self.mode.label()), mode_style);

        let mut info = match &self.mode {
            Mode::Filter => format!(" /{}", self.input),
            Mode::ConfirmUninstall(name) => format!(" uninstall {name}? (y/n)"),
            _ => {
                let mut text = String::new();
                if !self.list.filter.is_empty() {
                    text.push_str(&format!(" [/{}]", self.list.filter));
                }
                if let Some(last) = self.notifications.back() {
                    text.push_str(&format!(" {last}"));
                }
                text
            }
        };

        if self.is_busy() {
            info.push_str("  | working, Esc cancels");
        }

        let bar = Line::from(vec![
            mode_span,
            Span::styled(
                format!("{info} "),
                Style::default().fg(Color::Gray).bg(Color::DarkGray),
            ),
        ]);
        let status = Paragraph::new(bar).style(Style::default().bg(Color::DarkGray));
        frame.render_widget(status, area);
    }

    fn render_command_overlay(&self, frame: &mut Frame) {
        let area = centered_rect(70, 20, frame.area());
        frame.render_widget(Clear, area);

        let prompt = Paragraph::new(format!(":{}", self.input)).block(
            Block::default()
                .title(" Command ")
                .borders(Borders::ALL)
                .style(Style::default().bg(Color::Rgb(15, 15, 24))),
        );
        frame.render_widget(prompt, area);

        let cursor_x = area.x + 2 + self.input.chars().count() as u16;
        let cursor_y = area.y + 1;
        frame.set_cursor_position((cursor_x, cursor_y));
    }

    fn render_prompt_overlay(&self, frame: &mut Frame, kind: PromptKind) {
        let area = centered_rect(70, 20, frame.area());
        frame.render_widget(Clear, area);

        let shown = if kind.is_masked() {
            "*".repeat(self.input.chars().count())
        } else {
            self.input.clone()
        };

        let title = match kind {
            PromptKind::Secret if self.config.uses_private_key() => " Key passphrase ".to_string(),
            PromptKind::Secret => match self.config.remote_target() {
                Some(target) => format!(" Password for {}@{} ", target.username, target.host),
                None => kind.title().to_string(),
            },
            _ => kind.title().to_string(),
        };

        let prompt = Paragraph::new(shown.clone()).block(
            Block::default()
                .title(title)
                .borders(Borders::ALL)
                .style(Style::default().bg(Color::Rgb(15, 15, 24))),
        );
        frame.render_widget(prompt, area);

        let cursor_x = area.x + 1 + shown.chars().count() as u16;
        let cursor_y = area.y + 1;
        frame.set_cursor_position((cursor_x, cursor_y));
    }
}

fn render_help_overlay(frame: &mut Frame) {
    let area = centered_rect(70, 80, frame.area());
    frame.render_widget(Clear, area);

    let lines: Vec<Line> = HELP
        .iter()
        .map(|(keys, what)| {
            Line::from(vec![
                Span::styled(format!(" {keys:<14}"), Style::default().fg(Color::Cyan)),
                Span::styled(*what, Style::default().fg(Color::Gray)),
            ])
        })
        .collect();

    let help = Paragraph::new(lines).block(
        Block::default()
            .title(" Help (any key closes) ")
            .borders(Borders::ALL)
            .style(Style::default().bg(Color::Rgb(15, 15, 24))),
    );
    frame.render_widget(help, area);
}

/// Applies a text-editing key to a single-line input.
fn edit_input(input: &mut String, key: KeyEvent) {
    match key.code {
        KeyCode::Backspace => {
            input.pop();
        }
        KeyCode::Char(ch) if key.modifiers.is_empty() || key.modifiers == KeyModifiers::SHIFT => {
            input.push(ch);
        }
        _ => {}
    }
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let required = |usage: &str| -> Result<String, String> {
        if rest.is_empty() {
            Err(format!("usage: {usage}"))
        } else {
            Ok(rest.to_string())
        }
    };

    match verb {
        "help" | "h" | "?" => Ok(Command::Help),
        "local" => Ok(Command::Local(expand_home(&required("local <dir>")?))),
        "remote" => {
            let raw = required("remote user@host[:port][/path]")?;
            RemoteTarget::parse(&raw)
                .map(Command::Remote)
                .ok_or_else(|| format!("not a remote target: {raw}"))
        }
        "connect" => Ok(Command::Connect),
        "disconnect" => Ok(Command::Disconnect),
        "install" => Ok(Command::Install(InstallSource::parse(&required(
            "install <path|url>",
        )?))),
        "uninstall" => Ok(Command::Uninstall(required("uninstall <name>")?)),
        "enable" => Ok(Command::Enable(required("enable <name>")?)),
        "disable" => Ok(Command::Disable(required("disable <name>")?)),
        "export" => {
            let usage = "usage: export <name> <dir>";
            let (name, dir) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| usage.to_string())?;
            let dir = dir.trim();
            if dir.is_empty() {
                return Err(usage.to_string());
            }
            Ok(Command::Export {
                name: name.to_string(),
                dest_dir: expand_home(dir),
            })
        }
        "suffix" => Ok(Command::Suffix(required("suffix <value>")?)),
        "resume" => match rest {
            "on" => Ok(Command::Resume(true)),
            "off" => Ok(Command::Resume(false)),
            _ => Err("usage: resume on|off".to_string()),
        },
        "refresh" => Ok(Command::Refresh),
        "quit" | "q" => Ok(Command::Quit),
        other => Err(format!("unknown command: {other} (try :help)")),
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
