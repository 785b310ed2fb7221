//! ---
//! ems_section: "12-terminal-dashboard"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Terminal dashboard rendering the monitor's JSON API."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::io;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bmsmon_core::TelemetryExport;
use bmsmon_net::DashboardSnapshot;
use chrono::{DateTime, Local};
use clap::Parser;
use crossterm::cursor::{Hide, Show};
use crossterm::event::{self, Event, KeyCode, KeyEvent};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph};
use ratatui::{Frame, Terminal};

/// Cell spread above which a healthy pack is shown as a warning.
const WARNING_DELTA_MV: f64 = 30.0;

#[derive(Parser, Debug)]
#[command(author, version, about = "Watch bmsmon batteries in a terminal UI")]
struct Cli {
    /// Base URL of the bmsmond dashboard
    #[arg(long, env = "BMSMON_URL", default_value = "http://127.0.0.1:5000")]
    url: String,
    /// Refresh interval in milliseconds
    #[arg(long, default_value_t = 2000)]
    refresh: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OverallStatus {
    Healthy,
    Warning,
    Alarm,
    Offline,
}

impl OverallStatus {
    fn of(battery: &TelemetryExport) -> Self {
        if !battery.online {
            OverallStatus::Offline
        } else if battery.alarm_count > 0 {
            OverallStatus::Alarm
        } else if battery.cell_delta > WARNING_DELTA_MV {
            OverallStatus::Warning
        } else {
            OverallStatus::Healthy
        }
    }

    fn label(self) -> &'static str {
        match self {
            OverallStatus::Healthy => "HEALTHY",
            OverallStatus::Warning => "WARNING",
            OverallStatus::Alarm => "ALARM",
            OverallStatus::Offline => "OFFLINE",
        }
    }

    fn color(self) -> Color {
        match self {
            OverallStatus::Healthy => Color::Green,
            OverallStatus::Warning => Color::Yellow,
            OverallStatus::Alarm => Color::Red,
            OverallStatus::Offline => Color::DarkGray,
        }
    }
}

fn progress_bar(value: f64, max: f64, width: usize) -> String {
    let ratio = if max > 0.0 { (value / max).clamp(0.0, 1.0) } else { 0.0 };
    let filled = (ratio * width as f64) as usize;
    format!("[{}{}]", "█".repeat(filled), "░".repeat(width - filled))
}

/// Four cells per row, `C01:3.315  C02:3.318 ...`.
fn cell_rows(cells: &[f64]) -> Vec<String> {
    cells
        .chunks(4)
        .enumerate()
        .map(|(row, chunk)| {
            chunk
                .iter()
                .enumerate()
                .map(|(col, volts)| format!("C{:02}:{volts:.3}", row * 4 + col + 1))
                .collect::<Vec<_>>()
                .join("  ")
        })
        .collect()
}

struct App {
    client: reqwest::blocking::Client,
    endpoint: String,
    snapshot: DashboardSnapshot,
    error: Option<String>,
    fetched_at: Option<DateTime<Local>>,
    selected: usize,
}

impl App {
    fn new(base: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/data", base.trim_end_matches('/')),
            snapshot: DashboardSnapshot::default(),
            error: None,
            fetched_at: None,
            selected: 0,
        })
    }

    fn refresh(&mut self) {
        let fetched = self
            .client
            .get(&self.endpoint)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.json::<DashboardSnapshot>());
        match fetched {
            Ok(snapshot) => {
                self.snapshot = snapshot;
                self.error = None;
                self.fetched_at = Some(Local::now());
                self.clamp_selection();
            }
            Err(err) => self.error = Some(format!("{}: {err}", self.endpoint)),
        }
    }

    fn clamp_selection(&mut self) {
        let count = self.snapshot.batteries.len();
        self.selected = self.selected.min(count.saturating_sub(1));
    }

    fn select_next(&mut self) {
        if self.selected + 1 < self.snapshot.batteries.len() {
            self.selected += 1;
        }
    }

    fn select_previous(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    fn current(&self) -> Option<&TelemetryExport> {
        self.snapshot.batteries.get(self.selected)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut app = App::new(&cli.url)?;
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, EnterAlternateScreen, Hide)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let result = run_app(&mut terminal, &mut app, cli.refresh);
    cleanup_terminal(&mut terminal)?;
    if let Err(err) = result {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
    Ok(())
}

fn cleanup_terminal(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    crossterm::execute!(terminal.backend_mut(), LeaveAlternateScreen, Show)?;
    terminal.show_cursor()?;
    Ok(())
}

fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    refresh_ms: u64,
) -> Result<()> {
    let refresh = Duration::from_millis(refresh_ms.max(250));
    app.refresh();
    let mut last_fetch = Instant::now();
    loop {
        terminal.draw(|frame| draw_ui(frame, app))?;
        let wait = refresh.saturating_sub(last_fetch.elapsed());
        if event::poll(wait)? {
            if let Event::Key(key) = event::read()? {
                if handle_input(app, key) {
                    break;
                }
            }
        }
        if last_fetch.elapsed() >= refresh {
            app.refresh();
            last_fetch = Instant::now();
        }
    }
    Ok(())
}

fn handle_input(app: &mut App, key: KeyEvent) -> bool {
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => return true,
        KeyCode::Char('r') | KeyCode::Char('R') => app.refresh(),
        KeyCode::Char('j') | KeyCode::Down => app.select_next(),
        KeyCode::Char('k') | KeyCode::Up => app.select_previous(),
        _ => {}
    }
    false
}

fn draw_ui(frame: &mut Frame, app: &App) {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(frame.size());

    frame.render_widget(header(app), layout[0]);

    let main = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(30), Constraint::Percentage(70)])
        .split(layout[1]);

    let mut state = ListState::default();
    let items: Vec<ListItem> = if app.snapshot.batteries.is_empty() {
        vec![ListItem::new(Line::from("(no batteries)"))]
    } else {
        state.select(Some(app.selected));
        app.snapshot
            .batteries
            .iter()
            .map(|battery| {
                let status = OverallStatus::of(battery);
                ListItem::new(Line::from(vec![
                    Span::styled(
                        format!("{:<8}", status.label()),
                        Style::default().fg(status.color()),
                    ),
                    Span::raw(battery.name.clone()),
                ]))
            })
            .collect()
    };
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title("Batteries"))
        .highlight_style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("▶ ");
    frame.render_stateful_widget(list, main[0], &mut state);

    let (title, lines) = match app.current() {
        Some(battery) => (battery.name.clone(), detail_lines(battery)),
        None => ("No battery selected".to_owned(), Vec::new()),
    };
    let detail = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title(Span::styled(title, Style::default().fg(Color::Cyan))),
    );
    frame.render_widget(detail, main[1]);

    let help = Paragraph::new("↑/↓ or j/k select battery  r refresh  q quit")
        .style(Style::default().fg(Color::Gray));
    frame.render_widget(help, layout[2]);
}

fn header(app: &App) -> Paragraph<'static> {
    let summary = &app.snapshot.summary;
    let (mqtt, mqtt_color) = if app.snapshot.mqtt_connected {
        ("connected", Color::Green)
    } else {
        ("disconnected", Color::Red)
    };
    let updated = app
        .fetched_at
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "--".to_owned());
    let status = match &app.error {
        Some(err) => Line::from(Span::styled(err.clone(), Style::default().fg(Color::Red))),
        None => Line::from(vec![
            Span::raw(format!(
                "Online {}/{}  Energy {:.2} kWh  Power {:+.0} W  Avg SOC {:.1}%  MQTT ",
                summary.online,
                summary.total,
                summary.total_kwh,
                summary.total_power,
                summary.average_soc
            )),
            Span::styled(mqtt, Style::default().fg(mqtt_color)),
            Span::raw(format!("  Updated {updated}")),
        ]),
    };
    Paragraph::new(status).block(Block::default().borders(Borders::ALL).title("bmsmon"))
}

fn section(title: &str) -> Line<'static> {
    Line::from(Span::styled(
        title.to_owned(),
        Style::default().add_modifier(Modifier::BOLD),
    ))
}

fn detail_lines(battery: &TelemetryExport) -> Vec<Line<'static>> {
    let status = OverallStatus::of(battery);
    let mut lines = vec![Line::from(vec![
        Span::raw(format!("{}  ", battery.timestamp)),
        Span::styled(
            status.label(),
            Style::default()
                .fg(status.color())
                .add_modifier(Modifier::BOLD),
        ),
    ])];
    if !battery.online {
        lines.push(Line::from(""));
        lines.push(Line::from("Battery offline / no connection"));
        return lines;
    }

    if !battery.alarms.is_empty() {
        lines.push(section("ALARMS"));
        lines.extend(battery.alarms.iter().map(|alarm| {
            Line::from(Span::styled(
                format!("  • {alarm}"),
                Style::default().fg(Color::Red),
            ))
        }));
    }

    lines.push(section("BATTERY STATE"));
    lines.push(Line::from(format!(
        "  SOC: {:5.1}%  {}",
        battery.soc,
        progress_bar(battery.soc, 100.0, 20)
    )));
    lines.push(Line::from(format!(
        "  SOH: {:5.1}%  {}",
        battery.soh,
        progress_bar(battery.soh, 100.0, 20)
    )));
    lines.push(Line::from(format!(
        "  Cycles: {:<6}  Status: {}",
        battery.cycle_count, battery.status
    )));

    lines.push(section("ELECTRICAL"));
    lines.push(Line::from(format!("  Voltage:     {:>7.2} V", battery.voltage)));
    lines.push(Line::from(format!("  Current:     {:>+7.2} A", battery.current)));
    lines.push(Line::from(format!("  Power:       {:>+7.1} W", battery.power)));
    lines.push(Line::from(format!(
        "  Temperature: {:>7.1} °C",
        battery.temperature
    )));

    lines.push(section("CAPACITY"));
    lines.push(Line::from(format!(
        "  Remaining:   {:>7.1} Ah / {:>6.2} kWh",
        battery.remaining_ah, battery.remaining_kwh
    )));
    lines.push(Line::from(format!(
        "  Design:      {:>7.0} Ah",
        battery.design_capacity
    )));

    lines.push(section("CELL VOLTAGES"));
    lines.extend(
        cell_rows(&battery.cell_voltages)
            .into_iter()
            .map(|row| Line::from(format!("  {row}"))),
    );
    lines.push(Line::from(format!(
        "  Min: {:.3}V  Max: {:.3}V  Delta: {:>5.1}mV",
        battery.cell_min, battery.cell_max, battery.cell_delta
    )));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn battery(online: bool, alarms: &[&str], delta: f64) -> TelemetryExport {
        TelemetryExport {
            name: "Rack A".into(),
            id: "rack_a".into(),
            timestamp: "2024-01-01T00:00:00Z".into(),
            online,
            soc: 76.0,
            soh: 99.0,
            cycle_count: 42,
            status: 0,
            voltage: 53.12,
            current: -8.4,
            power: -446.2,
            temperature: 23.6,
            design_capacity: 280.0,
            full_capacity: 277.2,
            remaining_ah: 212.8,
            remaining_kwh: 11.31,
            max_voltage: 57.6,
            max_current: 200.0,
            cell_count: 6,
            cell_voltages: vec![3.315, 3.318, 3.321, 3.324, 3.315, 3.318],
            cell_min: 3.315,
            cell_max: 3.324,
            cell_delta: delta,
            alarms: alarms.iter().map(|a| a.to_string()).collect(),
            alarm_count: alarms.len(),
        }
    }

    #[test]
    fn overall_status_precedence() {
        assert_eq!(OverallStatus::of(&battery(true, &[], 9.0)), OverallStatus::Healthy);
        assert_eq!(OverallStatus::of(&battery(true, &[], 30.0)), OverallStatus::Healthy);
        assert_eq!(OverallStatus::of(&battery(true, &[], 30.5)), OverallStatus::Warning);
        assert_eq!(
            OverallStatus::of(&battery(true, &["Critical Low SOC"], 45.0)),
            OverallStatus::Alarm
        );
        assert_eq!(OverallStatus::of(&battery(false, &[], 0.0)), OverallStatus::Offline);
    }

    #[test]
    fn cells_are_laid_out_four_per_row() {
        let rows = cell_rows(&battery(true, &[], 9.0).cell_voltages);
        assert_eq!(
            rows,
            vec![
                "C01:3.315  C02:3.318  C03:3.321  C04:3.324".to_string(),
                "C05:3.315  C06:3.318".to_string(),
            ]
        );
    }

    #[test]
    fn progress_bar_clamps() {
        assert_eq!(progress_bar(50.0, 100.0, 4), "[██░░]");
        assert_eq!(progress_bar(150.0, 100.0, 4), "[████]");
        assert_eq!(progress_bar(10.0, 0.0, 2), "[░░]");
    }

    #[test]
    fn offline_detail_is_short() {
        let lines = detail_lines(&battery(false, &[], 0.0));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn selection_stays_in_bounds() {
        let mut app = App::new("http://127.0.0.1:9/").unwrap();
        assert_eq!(app.endpoint, "http://127.0.0.1:9/api/data");
        app.snapshot.batteries = vec![battery(true, &[], 1.0), battery(true, &[], 1.0)];
        app.select_previous();
        assert_eq!(app.selected, 0);
        app.select_next();
        app.select_next();
        assert_eq!(app.selected, 1);
        app.snapshot.batteries.truncate(1);
        app.clamp_selection();
        assert_eq!(app.selected, 0);
    }
}
