mod app;
mod cancellations;
mod cli;
mod config;
mod dashboard;
mod exec;
mod input;
mod k8s;
mod logs;
mod model;
mod pods;
mod stats;
mod task;
mod ui;

use anyhow::{Context, Result};
use app::{App, AppCommand, Visible};
use clap::Parser;
use cli::CliArgs;
use config::DashboardSettings;
use crossterm::event::{
    Event, EventStream, KeyEventKind, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags,
    PushKeyboardEnhancementFlags,
};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
    supports_keyboard_enhancement,
};
use dashboard::{Dashboard, DashboardEvent};
use futures::StreamExt;
use k8s::KubeGateway;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::Rect;
use std::fs::OpenOptions;
use std::io::{self, Stdout};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;
const EVENT_QUEUE: usize = 1_024;
const EVENT_BATCH: usize = 256;
const REDRAW_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter, args.log_file.as_deref())?;

    let settings = DashboardSettings::load(args.config.as_deref())?;
    if let Some(source) = &settings.source {
        info!(source = %source, "loaded dashboard settings");
    }

    let gateway = KubeGateway::new(args.context.clone()).await?;
    let namespace = args
        .namespace
        .clone()
        .unwrap_or_else(|| gateway.default_namespace().to_string());

    let mut app = App::new(gateway.cluster().to_string(), gateway.context().to_string());
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let mut dashboard = Dashboard::new(Arc::new(gateway), settings, events_tx);

    run(&mut app, &mut dashboard, events_rx, namespace).await
}

fn init_tracing(level_filter: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact();

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::sink).try_init();
        }
    }

    Ok(())
}

async fn run(
    app: &mut App,
    dashboard: &mut Dashboard,
    events: mpsc::Receiver<DashboardEvent>,
    namespace: String,
) -> Result<()> {
    let (mut terminal, keyboard_enhanced) = init_terminal()?;
    let run_result = run_loop(&mut terminal, app, dashboard, events, namespace).await;
    dashboard.shutdown();
    let restore_result = restore_terminal(&mut terminal, keyboard_enhanced);

    match (run_result, restore_result) {
        (Err(run_error), Err(restore_error)) => Err(anyhow::anyhow!(
            "{run_error:#}\nterminal restore error: {restore_error:#}"
        )),
        (Err(error), _) => Err(error),
        (_, Err(error)) => Err(error),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn init_terminal() -> Result<(TuiTerminal, bool)> {
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    let keyboard_enhanced = matches!(supports_keyboard_enhancement(), Ok(true));
    if keyboard_enhanced {
        execute!(
            stdout,
            EnterAlternateScreen,
            PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES)
        )
        .context("failed to enter alternate screen with keyboard enhancement")?;
    } else {
        execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;
    }
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("failed to create terminal backend")?;
    terminal.clear().context("failed to clear terminal")?;
    Ok((terminal, keyboard_enhanced))
}

fn restore_terminal(terminal: &mut TuiTerminal, keyboard_enhanced: bool) -> Result<()> {
    if keyboard_enhanced {
        execute!(terminal.backend_mut(), PopKeyboardEnhancementFlags)
            .context("failed to pop keyboard enhancement flags")?;
    }
    disable_raw_mode().context("failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("failed to leave alternate screen")?;
    terminal.show_cursor().context("failed to show cursor")?;
    Ok(())
}

async fn run_loop(
    terminal: &mut TuiTerminal,
    app: &mut App,
    dashboard: &mut Dashboard,
    mut events: mpsc::Receiver<DashboardEvent>,
    namespace: String,
) -> Result<()> {
    dashboard.switch_namespace(namespace);

    let mut reader = EventStream::new();
    let mut ticker = interval(REDRAW_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        sync_shell_size(terminal, dashboard)?;
        app.shell_closed(dashboard.sessions().sessions().len());
        terminal
            .draw(|frame| ui::render(frame, app, dashboard))
            .context("failed to render terminal frame")?;

        if !app.running() {
            break;
        }

        tokio::select! {
            maybe_event = reader.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        if let Some(action) = input::map_key(app.mode(), key) {
                            debug!("action={action:?}");
                            let sessions = dashboard.sessions().ids();
                            let visible = Visible {
                                pods: dashboard.pods(),
                                sessions: &sessions,
                                focused_session: dashboard.sessions().focused(),
                            };
                            let command = app.apply_action(action, visible);
                            execute_app_command(app, dashboard, command);
                        }
                    }
                    Some(Ok(Event::Paste(text))) if app.mode() == app::InputMode::Shell => {
                        if let Some(session) = dashboard.sessions().focused() {
                            dashboard.send_to_shell(session, text.into_bytes());
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        app.set_status(format!("terminal event error: {error}"));
                    }
                    None => {
                        app.set_status("terminal event stream closed");
                        break;
                    }
                }
            }
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else {
                    break;
                };
                dashboard.handle(event);
                for _ in 0..EVENT_BATCH {
                    match events.try_recv() {
                        Ok(event) => dashboard.handle(event),
                        Err(_) => break,
                    }
                }
            }
            _ = ticker.tick() => {}
        }
    }

    Ok(())
}

fn execute_app_command(app: &mut App, dashboard: &mut Dashboard, command: AppCommand) {
    match command {
        AppCommand::None => {}
        AppCommand::SelectPod(uid) => dashboard.select_pod(&uid),
        AppCommand::OpenShell(uid) => {
            if dashboard.open_shell(&uid).is_none() {
                app.set_status("pod has no container to open a shell in");
                app.shell_closed(0);
            }
        }
        AppCommand::CloseShell(session) => {
            dashboard.close_shell(session);
            app.shell_closed(dashboard.sessions().sessions().len());
        }
        AppCommand::FocusShell(session) => dashboard.focus_shell(Some(session)),
        AppCommand::SendToShell { session, bytes } => dashboard.send_to_shell(session, bytes),
        AppCommand::SwitchNamespace(namespace) => dashboard.switch_namespace(namespace),
        AppCommand::ClearStatus => {
            dashboard.take_status();
        }
    }
}

fn sync_shell_size(terminal: &TuiTerminal, dashboard: &mut Dashboard) -> Result<()> {
    if dashboard.sessions().is_empty() {
        return Ok(());
    }
    let size = terminal.size().context("failed to read terminal size")?;
    let screen = Rect::new(0, 0, size.width, size.height);
    if let Some(shells) = ui::areas(screen, true).shells {
        let (cols, rows) = ui::shell_size(shells);
        dashboard.resize_shells(cols, rows);
    }
    Ok(())
}
