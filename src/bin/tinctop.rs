//! tinctop: live per-node traffic statistics from a running tincd.
//!
//! Connects to the daemon's control socket, polls DUMP_TRAFFIC once per
//! refresh and renders the observer model in a table. Key bindings:
//! `n`/`i`/`I`/`o`/`O`/`t`/`T` select the sort column, `c` toggles
//! cumulative totals against per-second rates, `s` prompts for a new
//! refresh delay, `q` or Escape quits.

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Paragraph, Row, Table};
use std::io::{BufRead, BufReader, Write as _};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tincd::protocol::{ControlRequest, Request, CONTROL_COOKIE};
use tincd::top::{SortMode, TrafficModel};
use tincd::Names;

/// Smallest accepted refresh delay, seconds.
const MIN_DELAY: f64 = 0.1;

#[derive(Parser, Debug)]
#[command(name = "tinctop", version)]
#[command(about = "Show real-time statistics from a running tincd")]
struct Cli {
    /// Connect to net NETNAME.
    #[arg(short = 'n', long = "net", value_name = "NETNAME")]
    net: Option<String>,

    /// Control socket path (overrides the derived location).
    #[arg(long = "socket", value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Refresh delay in seconds.
    #[arg(short = 'd', long = "delay", default_value_t = 1.0)]
    delay: f64,
}

struct Control {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Control {
    fn connect(path: &PathBuf) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .with_context(|| format!("cannot connect to control socket {}", path.display()))?;
        let writer = stream.try_clone().context("clone control stream")?;
        let mut control = Self {
            reader: BufReader::new(stream),
            writer,
        };

        let greeting = control.read_line()?;
        let expected = Request::Control.as_code().to_string();
        if greeting.split_ascii_whitespace().next() != Some(expected.as_str()) {
            bail!("unexpected greeting from daemon: {greeting}");
        }
        control.send_line(&format!(
            "{} {CONTROL_COOKIE}",
            Request::Control.as_code()
        ))?;
        Ok(control)
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).context("read from daemon")?;
        if n == 0 {
            bail!("daemon closed the control connection");
        }
        Ok(line.trim_end().to_string())
    }

    fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .context("write to daemon")
    }

    /// Poll one traffic dump into the model.
    fn update(&mut self, model: &mut TrafficModel) -> Result<()> {
        self.send_line(&format!(
            "{} {}",
            Request::Control.as_code(),
            ControlRequest::DumpTraffic.as_code()
        ))?;
        model.begin_update(Instant::now());
        loop {
            let line = self.read_line()?;
            if !model.apply_line(&line)? {
                return Ok(());
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket = cli
        .socket
        .clone()
        .unwrap_or_else(|| Names::for_net(cli.net.as_deref()).control_socket);
    let mut control = Control::connect(&socket)?;

    let mut model = TrafficModel::new();
    let mut delay = Duration::from_secs_f64(cli.delay.max(MIN_DELAY));
    let netname = cli.net.clone().unwrap_or_default();

    std::io::stdout().execute(EnterAlternateScreen)?;
    enable_raw_mode()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(std::io::stdout()))?;

    let result = run(
        &mut terminal,
        &mut control,
        &mut model,
        &mut delay,
        &netname,
    );

    disable_raw_mode()?;
    std::io::stdout().execute(LeaveAlternateScreen)?;
    result
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    control: &mut Control,
    model: &mut TrafficModel,
    delay: &mut Duration,
    netname: &str,
) -> Result<()> {
    loop {
        control.update(model)?;
        terminal.draw(|frame| draw(frame, model, netname))?;

        if !event::poll(*delay)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
            KeyCode::Char('c') => model.cumulative = !model.cumulative,
            KeyCode::Char('s') => {
                if let Some(new_delay) = prompt_delay(terminal, delay.as_secs_f64())? {
                    *delay = Duration::from_secs_f64(new_delay.max(MIN_DELAY));
                }
            }
            KeyCode::Char(c) => {
                if let Some(mode) = SortMode::for_key(c) {
                    model.sortmode = mode;
                }
            }
            _ => {}
        }
    }
}

fn draw(frame: &mut Frame, model: &TrafficModel, netname: &str) {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints(vec![Constraint::Length(1), Constraint::Min(0)])
        .split(frame.area());

    let title = format!(
        "Tinc {:<16}  Nodes: {:4}  Sort: {:<9}  {}",
        netname,
        model.len(),
        model.sortmode.label(),
        if model.cumulative { "Cumulative" } else { "Current" }
    );
    frame.render_widget(Paragraph::new(title), layout[0]);

    let rows: Vec<Row> = model
        .sorted()
        .into_iter()
        .map(|node| {
            let cells = if model.cumulative {
                vec![
                    node.name.clone(),
                    node.in_packets.to_string(),
                    node.in_bytes.to_string(),
                    node.out_packets.to_string(),
                    node.out_bytes.to_string(),
                ]
            } else {
                vec![
                    node.name.clone(),
                    format!("{:.0}", node.in_packets_rate),
                    format!("{:.0}", node.in_bytes_rate),
                    format!("{:.0}", node.out_packets_rate),
                    format!("{:.0}", node.out_bytes_rate),
                ]
            };
            let style = if !node.known {
                Style::default().add_modifier(Modifier::DIM)
            } else if node.active() {
                Style::default().add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            Row::new(cells).style(style)
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(18),
            Constraint::Length(10),
            Constraint::Length(12),
            Constraint::Length(10),
            Constraint::Length(12),
        ],
    )
    .header(
        Row::new(vec!["Node", "IN pkts", "IN bytes", "OUT pkts", "OUT bytes"])
            .style(Style::default().add_modifier(Modifier::REVERSED)),
    )
    .block(Block::default().borders(Borders::NONE));

    frame.render_widget(table, layout[1]);
}

/// Ask for a new refresh delay on a one-line prompt. Returns `None`
/// when cancelled.
fn prompt_delay(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    current: f64,
) -> Result<Option<f64>> {
    let mut input = String::new();
    loop {
        let prompt = format!("Change delay from {current:.1}s to: {input}");
        terminal.draw(|frame| {
            frame.render_widget(Paragraph::new(prompt.clone()), frame.area());
        })?;

        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => {
                return Ok(input.parse::<f64>().ok());
            }
            KeyCode::Esc => return Ok(None),
            KeyCode::Backspace => {
                input.pop();
            }
            KeyCode::Char(c) if c.is_ascii_digit() || c == '.' => input.push(c),
            _ => {}
        }
    }
}
