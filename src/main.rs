mod app;
mod cli;
mod config;
mod dispatch;
mod input;
mod model;
mod poller;
mod server;
mod ui;

use anyhow::{Context, Result};
use app::{App, AppCommand};
use clap::Parser;
use cli::CliArgs;
use crossterm::event::{Event, EventStream, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use dispatch::{DispatchError, Dispatcher};
use futures::StreamExt;
use model::Snapshot;
use poller::Poller;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use server::{DriverTransport, MongoShell};
use std::io::{self, Stdout};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;
use tracing_subscriber::EnvFilter;

type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter)?;

    let config = config::load_config(args.config.as_ref())?;
    let targets = config::resolve_targets(&args, config);
    anyhow::ensure!(!targets.is_empty(), "no servers to poll");

    let refresh = Duration::from_millis(args.refresh_ms.max(250));
    // Per-command deadline stays inside the refresh interval so a slow server
    // cannot hold a cycle past the next tick.
    let deadline = refresh.mul_f32(0.75);
    let transport = MongoShell::new(args.shell_bin.clone());
    let registry = Arc::new(server::Registry::new(targets, transport, deadline));

    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(Snapshot::empty()));
    let poller = Poller::new(registry.clone(), refresh, args.auto_kill, snapshot_tx);
    let poller_handle = tokio::spawn(poller.run());

    let dispatcher = Dispatcher::new(registry, snapshot_rx.clone());
    let mut app = App::new();

    let mut terminal = init_terminal()?;
    let run_result = run_loop(&mut terminal, &mut app, &dispatcher, snapshot_rx).await;
    poller_handle.abort();
    let restore_result = restore_terminal(&mut terminal);

    match (run_result, restore_result) {
        (Err(run_error), Err(restore_error)) => Err(anyhow::anyhow!(
            "{run_error:#}\nterminal restore error: {restore_error:#}"
        )),
        (Err(error), _) => Err(error),
        (_, Err(error)) => Err(error),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::sink)
        .try_init();

    Ok(())
}

fn init_terminal() -> Result<TuiTerminal> {
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("failed to create terminal backend")?;
    terminal.clear().context("failed to clear terminal")?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut TuiTerminal) -> Result<()> {
    disable_raw_mode().context("failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("failed to leave alternate screen")?;
    terminal.show_cursor().context("failed to show cursor")?;
    Ok(())
}

async fn run_loop<T>(
    terminal: &mut TuiTerminal,
    app: &mut App,
    dispatcher: &Dispatcher<T>,
    mut snapshot_rx: watch::Receiver<Arc<Snapshot>>,
) -> Result<()>
where
    T: DriverTransport + Clone + Send + Sync + 'static,
{
    let mut reader = EventStream::new();
    app.set_status("connecting…");

    loop {
        terminal
            .draw(|frame| ui::render(frame, app))
            .context("failed to render terminal frame")?;

        if !app.running {
            break;
        }

        tokio::select! {
            maybe_event = reader.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        if let Some(action) = input::map_key(app.mode, key) {
                            debug!("action={action:?}");
                            let command = app.apply_action(action);
                            execute_app_command(app, dispatcher, command).await;
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
            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    app.set_status("poller stopped");
                    break;
                }
                let snapshot = snapshot_rx.borrow_and_update().clone();
                app.set_snapshot(snapshot);
            }
        }
    }

    Ok(())
}

async fn execute_app_command<T>(app: &mut App, dispatcher: &Dispatcher<T>, command: AppCommand)
where
    T: DriverTransport + Clone + Send + Sync + 'static,
{
    match command {
        AppCommand::None => {}
        AppCommand::ExplainSelected(selection) => match dispatcher.explain(&selection).await {
            Ok(plan) => {
                let rendered = serde_json::to_string_pretty(&plan)
                    .unwrap_or_else(|_| plan.to_string());
                app.show_explain(&selection.key, rendered);
                app.set_status(format!("explained {}", selection.key));
            }
            Err(error) => app.set_status(dispatch_error_message("explain", &error)),
        },
        AppCommand::KillSelected(selection) => match dispatcher.kill(&selection).await {
            Ok(server::KillOutcome::Killed) => {
                app.set_status(format!("killed {}", selection.key));
            }
            Ok(server::KillOutcome::AlreadyGone) => {
                app.set_status(format!("{} had already finished", selection.key));
            }
            Err(error) => app.set_status(dispatch_error_message("kill", &error)),
        },
        AppCommand::BatchKill { age_secs } => {
            let report = dispatcher.kill_older_than(age_secs, None).await;
            if report.failed.is_empty() {
                app.set_status(format!(
                    "killed {} operation(s) older than {age_secs}s",
                    report.attempted
                ));
            } else {
                let failed: Vec<String> = report
                    .failed
                    .iter()
                    .map(|key| key.to_string())
                    .collect();
                app.set_status(format!(
                    "killed {}/{} operation(s); failed: {}",
                    report.attempted - report.failed.len(),
                    report.attempted,
                    failed.join(", ")
                ));
            }
        }
    }
}

fn dispatch_error_message(verb: &str, error: &DispatchError) -> String {
    match error {
        DispatchError::StaleSelection => {
            "selection is stale; the operation is gone from the latest snapshot".to_string()
        }
        _ => format!("{verb} failed: {error}"),
    }
}
