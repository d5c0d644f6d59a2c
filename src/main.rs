mod app;
mod model;
mod msg;
mod store;
mod worker;

use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use crossterm::event::{self, Event};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use tracing_subscriber::EnvFilter;

use app::App;
use model::config::AppConfig;
use msg::Msg;
use store::NamingConvention;
use worker::{StoreWorker, ssh_connectors};

fn main() -> Result<()> {
    let config = AppConfig::load()?;

    // Initialize logging to file (never stdout)
    let log_dir = directories::ProjectDirs::from("", "", "plugshelf")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("plugshelf"));
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "plugshelf.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_new(&config.general.log_filter)
        .unwrap_or_else(|_| EnvFilter::new("plugshelf=info"));
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(filter)
        .init();

    tracing::info!("plugshelf starting");

    let naming = config.naming().unwrap_or_else(|err| {
        tracing::warn!(
            "invalid disabled_suffix {:?} in config: {err}, using the default",
            config.naming.disabled_suffix
        );
        NamingConvention::default()
    });

    // Terminal setup
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal, config, naming);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(e) = result {
        tracing::error!("plugshelf error: {e:?}");
        eprintln!("plugshelf error: {e:?}");
    }

    tracing::info!("plugshelf stopped");
    Ok(())
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    config: AppConfig,
    naming: NamingConvention,
) -> Result<()> {
    let (tx, rx) = mpsc::channel::<Msg>();

    let worker = StoreWorker::spawn(
        tx.clone(),
        naming.clone(),
        config.timeouts(),
        ssh_connectors(),
    )?;
    let mut app = App::new(config, naming, worker);
    app.resume()?;

    // Input thread: reads terminal events and forwards them as Msg
    let tx_input = tx.clone();
    thread::spawn(move || {
        loop {
            match event::read() {
                Ok(event) => {
                    let msg = match event {
                        Event::Key(k) => Msg::Key(k),
                        Event::Resize(w, h) => Msg::Resize(w, h),
                        _ => continue,
                    };
                    if tx_input.send(msg).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!("terminal input failed: {err}");
                    let _ = tx_input.send(Msg::Quit);
                    break;
                }
            }
        }
    });

    // Tick thread: drives the directory-watch debounce
    let tx_tick = tx.clone();
    thread::spawn(move || {
        loop {
            thread::sleep(Duration::from_millis(50));
            if tx_tick.send(Msg::Tick).is_err() {
                break;
            }
        }
    });

    drop(tx);

    terminal.draw(|f| app.view(f))?;

    // ── Main event loop ──
    loop {
        // Batch-drain all pending messages
        let first = rx.recv()?;
        app.update(first)?;

        while let Ok(msg) = rx.try_recv() {
            app.update(msg)?;
        }

        if app.should_quit {
            break;
        }

        terminal.draw(|f| app.view(f))?;
    }

    // Dropping the app stops the worker, which closes any remote session.
    drop(app);
    Ok(())
}
