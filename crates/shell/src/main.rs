//! Console stand-in for the mobile presentation layer: prints the sensor
//! panel and logs, reads commands from stdin.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use aquamon_shell::display::EMPTY_HISTORY_PLACEHOLDER;
use aquamon_shell::history::HistoryObserver;
use aquamon_shell::{HistoryRecord, MonitorClient, MonitorConfig, SwitchState};

const HELP: &str = "\
commands:
  开 | 关 | on | off         switch the aerator
  toggle                     flip the aerator
  threshold <max> <min>      send the dissolved-oxygen alarm band
  pause | resume             control the probe
  history                    show sensor history
  log                        show activity log
  status                     show connection and latest readings
  quit";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Empty,
    Switch(String),
    Toggle,
    Threshold { max: String, min: String },
    Control(String),
    History,
    Log,
    Status,
    Help,
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Command {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Command::Empty;
    };
    match head {
        "开" | "关" => Command::Switch(head.to_string()),
        w if w.eq_ignore_ascii_case("on") || w.eq_ignore_ascii_case("off") => {
            Command::Switch(w.to_string())
        }
        "toggle" => Command::Toggle,
        "threshold" | "阈值" => Command::Threshold {
            max: words.next().unwrap_or_default().to_string(),
            min: words.next().unwrap_or_default().to_string(),
        },
        "pause" | "resume" => Command::Control(head.to_string()),
        "history" => Command::History,
        "log" => Command::Log,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    }
}

fn print_records(title: &str, records: &[HistoryRecord]) {
    println!("── {title} ──");
    if records.is_empty() {
        println!("{EMPTY_HISTORY_PLACEHOLDER}");
    }
    for r in records {
        println!("{}", r.text);
    }
}

fn print_panel(client: &MonitorClient) {
    let panel = client.panel();
    println!(
        "{} | {} | {}",
        panel.dissolved_oxygen_label(),
        panel.ph_label(),
        panel.temperature_label()
    );
}

/// Returns `false` when the shell should exit.
async fn execute(
    client: &MonitorClient,
    command: Command,
    switch: &mut SwitchState,
    history_dirty: &AtomicBool,
) -> bool {
    match command {
        Command::Empty => {}
        Command::Switch(state) => {
            if client.publish_switch(&state).await.is_ok() {
                if let Ok(s) = state.parse() {
                    *switch = s;
                }
            }
            print_latest_notice(client);
        }
        Command::Toggle => {
            let next = switch.toggled();
            if client.publish_switch(next.label()).await.is_ok() {
                *switch = next;
            }
            print_latest_notice(client);
        }
        Command::Threshold { max, min } => {
            let _ = client.publish_threshold(&max, &min).await;
            print_latest_notice(client);
        }
        Command::Control(cmd) => {
            let _ = client.publish_control(&cmd).await;
            print_latest_notice(client);
        }
        Command::History => {
            history_dirty.store(false, Ordering::Relaxed);
            print_records("历史数据", &client.history().snapshot());
        }
        Command::Log => print_records("接收日志", &client.activity().snapshot()),
        Command::Status => {
            println!("服务器连接状态: {}", client.state().label());
            println!("开关: {switch}");
            print_panel(client);
            if history_dirty.load(Ordering::Relaxed) {
                println!("历史数据有更新，输入 history 查看");
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => return false,
        Command::Unknown(word) => println!("unknown command {word:?}, try `help`"),
    }
    true
}

fn print_latest_notice(client: &MonitorClient) {
    if let Some(record) = client.activity().snapshot().first() {
        println!("{}", record.text);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = MonitorConfig::load()?;
    let (client, mut ui) = MonitorClient::new(config);
    let client = Arc::new(client);

    // ── UI callbacks (run on this task via the presentation loop) ───
    let weak = Arc::downgrade(&client);
    client.on_parsed_data(move |_reading| {
        if let Some(client) = weak.upgrade() {
            print_panel(&client);
        }
    });
    client.on_status_change(|state| println!("服务器连接状态: {}", state.label()));

    let history_dirty = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&history_dirty);
    let observer: HistoryObserver = Arc::new(move |_records: &[HistoryRecord]| {
        flag.store(true, Ordering::Relaxed);
    });
    client.history().register_observer(&observer);

    // ── Connect ─────────────────────────────────────────────────────
    let state = client.start().await;
    info!(state = state.label(), "initial connection outcome");
    println!("{HELP}");

    let mut switch = SwitchState::Off;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            ran = ui.run_next() => {
                if !ran {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let command = parse_command(&line);
                if !execute(&client, command, &mut switch, &history_dirty).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    client.history().unregister_observer(&observer);
    client.disconnect().await;
    ui.run_pending();
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
