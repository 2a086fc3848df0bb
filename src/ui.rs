use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols::Marker;
use ratatui::text::{Line, Span};
use ratatui::widgets::{
    Axis, Block, Borders, Cell, Chart, Clear, Dataset, GraphType, Paragraph, Row, Table,
    TableState, Tabs, Wrap,
};

use crate::app::{App, InputMode};
use crate::dashboard::Dashboard;
use crate::exec::{ExecSession, SessionStatus};
use crate::model::PanelState;
use crate::stats::{Graph, Series, SeriesStyle};

const BG: Color = Color::Rgb(9, 15, 25);
const PANEL: Color = Color::Rgb(16, 27, 44);
const ACCENT: Color = Color::Rgb(52, 211, 153);
const SECONDARY: Color = Color::Rgb(96, 165, 250);
const MUTED: Color = Color::Rgb(140, 156, 178);
const WARN: Color = Color::Rgb(251, 191, 36);
const ERROR: Color = Color::Rgb(248, 113, 113);
const PL_A: Color = Color::Rgb(17, 94, 89);
const PL_B: Color = Color::Rgb(30, 64, 175);
const PL_C: Color = Color::Rgb(55, 48, 163);
const PL_D: Color = Color::Rgb(82, 24, 124);

pub struct Areas {
    pub header: Rect,
    pub pods: Rect,
    pub graphs: Rect,
    pub logs: Rect,
    pub shells: Option<Rect>,
    pub footer: Rect,
}

pub fn areas(area: Rect, with_shells: bool) -> Areas {
    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(6),
            Constraint::Length(1),
        ])
        .split(area);

    let (dashboard, shells) = if with_shells {
        let split = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(root[1]);
        (split[0], Some(split[1]))
    } else {
        (root[1], None)
    };

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(35), Constraint::Percentage(65)])
        .split(dashboard);
    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(columns[1]);

    Areas {
        header: root[0],
        pods: columns[0],
        graphs: right[0],
        logs: right[1],
        shells,
        footer: root[2],
    }
}

pub fn shell_size(shells: Rect) -> (u16, u16) {
    let cols = shells.width.saturating_sub(2);
    let rows = shells.height.saturating_sub(3);
    (cols.max(1), rows.max(1))
}

pub fn render(frame: &mut Frame, app: &mut App, dashboard: &Dashboard) {
    let areas = areas(frame.area(), !dashboard.sessions().is_empty());
    app.set_page_size(areas.pods.height.saturating_sub(3) as usize);

    render_header(frame, areas.header, app, dashboard);
    render_pods(frame, areas.pods, app, dashboard);
    render_graphs(frame, areas.graphs, dashboard);
    render_logs(frame, areas.logs, dashboard);
    if let Some(shells) = areas.shells {
        render_shells(frame, shells, app, dashboard);
    }
    render_footer(frame, areas.footer, app, dashboard);

    if app.show_help() {
        render_help_modal(frame, app);
    }
}

fn render_header(frame: &mut Frame, area: Rect, app: &App, dashboard: &Dashboard) {
    let mut spans = Vec::new();
    push_powerline_segment(&mut spans, " podscope ", Color::Black, ACCENT, PL_A);
    push_powerline_segment(
        &mut spans,
        format!(" {} ", compact_text(&display_cluster_endpoint(app.cluster()), 32)),
        Color::White,
        PL_A,
        PL_B,
    );
    push_powerline_segment(
        &mut spans,
        format!(" {} ", compact_text(app.context(), 24)),
        Color::White,
        PL_B,
        PL_C,
    );
    push_powerline_segment(
        &mut spans,
        format!(" ns:{} ", dashboard.namespace()),
        Color::White,
        PL_C,
        PL_D,
    );
    push_powerline_segment(
        &mut spans,
        format!(" {} ", dashboard.sync_state().label()),
        Color::White,
        PL_D,
        BG,
    );
    if let Some((label, frame_symbol)) = dashboard.activity() {
        spans.push(Span::styled(
            format!(" {frame_symbol} {label}"),
            Style::default().fg(WARN).bg(BG),
        ));
    }

    frame.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(BG).fg(Color::White)),
        area,
    );
}

fn render_pods(frame: &mut Frame, area: Rect, app: &App, dashboard: &Dashboard) {
    let now = dashboard.ages_at();
    let pods = dashboard.pods();
    let selection = dashboard.selection();

    let header = Row::new(["", "NAME", "STATUS", "AGE"].into_iter().map(|title| {
        Cell::from(title).style(Style::default().add_modifier(Modifier::BOLD))
    }))
    .height(1)
    .style(Style::default().fg(ACCENT));

    let rows = pods.iter().map(|pod| {
        let viewing = if selection.is_pod(&pod.uid) { "●" } else { " " };
        let status = pod.status_label();
        Row::new(vec![
            Cell::from(viewing).style(Style::default().fg(ACCENT)),
            Cell::from(pod.name.clone()).style(Style::default().fg(Color::White)),
            Cell::from(status.clone()).style(Style::default().fg(status_color(&status))),
            Cell::from(pod.age(now)).style(Style::default().fg(MUTED)),
        ])
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(1),
            Constraint::Percentage(55),
            Constraint::Percentage(25),
            Constraint::Percentage(20),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .title(format!("Pods ({})", pods.len()))
            .borders(Borders::ALL)
            .border_style(if app.mode() == InputMode::Shell {
                Style::default().fg(MUTED)
            } else {
                Style::default().fg(ACCENT)
            })
            .style(Style::default().bg(PANEL)),
    )
    .column_spacing(1)
    .row_highlight_style(
        Style::default()
            .bg(Color::Rgb(24, 36, 58))
            .add_modifier(Modifier::BOLD),
    )
    .highlight_symbol("> ");

    let mut state = TableState::default();
    state.select(app.selected_index(pods.len()));
    frame.render_stateful_widget(table, area, &mut state);
}

#[derive(Clone, Copy)]
enum Unit {
    Bytes,
    Millicores,
}

fn render_graphs(frame: &mut Frame, area: Rect, dashboard: &Dashboard) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Ratio(1, 3),
            Constraint::Ratio(1, 3),
            Constraint::Ratio(1, 3),
        ])
        .split(area);

    let graphs = dashboard.graphs();
    let spinner = dashboard.activity().map(|(_, symbol)| symbol).unwrap_or("…");
    render_graph(frame, columns[0], "Memory", &graphs.memory, Unit::Bytes, spinner);
    render_graph(frame, columns[1], "CPU", &graphs.cpu, Unit::Millicores, spinner);
    render_graph(frame, columns[2], "Network", &graphs.network, Unit::Bytes, spinner);
}

fn render_graph(
    frame: &mut Frame,
    area: Rect,
    title: &str,
    graph: &Graph,
    unit: Unit,
    spinner: &str,
) {
    let block = Block::default()
        .title(title.to_string())
        .borders(Borders::ALL)
        .border_style(Style::default().fg(MUTED))
        .style(Style::default().bg(PANEL));

    let series = match graph {
        Graph::Loading => {
            let text = Paragraph::new(format!("{spinner} loading"))
                .alignment(Alignment::Center)
                .style(Style::default().fg(WARN))
                .block(block);
            frame.render_widget(text, area);
            return;
        }
        Graph::Notice(notice) => {
            let color = if notice == "DELETED" || notice == "unauthorized" {
                ERROR
            } else {
                MUTED
            };
            let text = Paragraph::new(notice.clone())
                .alignment(Alignment::Center)
                .style(Style::default().fg(color))
                .block(block);
            frame.render_widget(text, area);
            return;
        }
        Graph::Series(series) => series,
    };

    let points = series
        .iter()
        .map(|series| {
            series
                .points
                .iter()
                .enumerate()
                .map(|(index, (_, value))| (index as f64, *value))
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    let x_max = points
        .iter()
        .map(|points| points.len())
        .max()
        .unwrap_or(0)
        .saturating_sub(1)
        .max(1) as f64;
    let y_max = points
        .iter()
        .flatten()
        .map(|(_, value)| *value)
        .fold(0.0_f64, f64::max);
    let y_max = if y_max > 0.0 { y_max * 1.1 } else { 1.0 };

    let datasets = series
        .iter()
        .zip(points.iter())
        .map(|(series, points)| {
            Dataset::default()
                .name(series.name)
                .marker(Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(series_color(series)))
                .data(points)
        })
        .collect::<Vec<_>>();

    let (first, last) = x_labels(series);
    let chart = Chart::new(datasets)
        .block(block)
        .x_axis(
            Axis::default()
                .bounds([0.0, x_max])
                .labels(vec![Span::raw(first), Span::raw(last)])
                .style(Style::default().fg(MUTED)),
        )
        .y_axis(
            Axis::default()
                .bounds([0.0, y_max])
                .labels(vec![
                    Span::raw(format_value(0.0, unit)),
                    Span::raw(format_value(y_max, unit)),
                ])
                .style(Style::default().fg(MUTED)),
        );
    frame.render_widget(chart, area);
}

fn x_labels(series: &[Series]) -> (String, String) {
    let points = series
        .iter()
        .map(|series| &series.points)
        .max_by_key(|points| points.len());
    let first = points
        .and_then(|points| points.first())
        .map(|(label, _)| label.clone())
        .unwrap_or_default();
    let last = points
        .and_then(|points| points.last())
        .map(|(label, _)| label.clone())
        .unwrap_or_default();
    (first, last)
}

fn series_color(series: &Series) -> Color {
    match series.style {
        SeriesStyle::Primary => ACCENT,
        SeriesStyle::Secondary => SECONDARY,
        SeriesStyle::Limit => ERROR,
    }
}

fn format_value(value: f64, unit: Unit) -> String {
    match unit {
        Unit::Bytes => format_bytes_compact(value.max(0.0) as u64),
        Unit::Millicores => format_cpu_millicores(value.max(0.0) as u64),
    }
}

fn render_logs(frame: &mut Frame, area: Rect, dashboard: &Dashboard) {
    let selection = dashboard.selection();
    let target = match (dashboard.selected_pod(), selection.container.as_deref()) {
        (Some(pod), Some(container)) => format!("{}/{}", pod.name, container),
        _ => "no pod selected".to_string(),
    };

    let mut title = vec![Span::raw(format!("Logs {target} "))];
    if let Some(state) = dashboard.panel_state() {
        title.push(Span::styled(
            format!("[{state}]"),
            Style::default()
                .fg(panel_color(state))
                .add_modifier(Modifier::BOLD),
        ));
    }
    let logs = dashboard.logs();
    if logs.suppressed() > 0 {
        title.push(Span::styled(
            format!(" {} replayed", logs.suppressed()),
            Style::default().fg(MUTED),
        ));
    }

    let height = area.height.saturating_sub(2) as usize;
    let skip = logs.lines().len().saturating_sub(height);
    let lines = logs
        .lines()
        .skip(skip)
        .map(|line| {
            Line::from(vec![
                Span::styled(short_timestamp(&line.timestamp), Style::default().fg(MUTED)),
                Span::raw(" "),
                Span::styled(line.content.clone(), Style::default().fg(Color::White)),
            ])
        })
        .collect::<Vec<_>>();

    let paragraph = Paragraph::new(lines).block(
        Block::default()
            .title(Line::from(title))
            .borders(Borders::ALL)
            .border_style(Style::default().fg(MUTED))
            .style(Style::default().bg(PANEL)),
    );
    frame.render_widget(paragraph, area);
}

fn short_timestamp(timestamp: &str) -> String {
    timestamp
        .split_once('T')
        .map(|(_, time)| time.chars().take(8).collect())
        .unwrap_or_else(|| compact_text(timestamp, 8))
}

fn render_shells(frame: &mut Frame, area: Rect, app: &App, dashboard: &Dashboard) {
    let sessions = dashboard.sessions();
    let focused = sessions.focused();
    let titles = sessions
        .sessions()
        .iter()
        .map(|session| {
            Line::from(vec![
                Span::raw(format!("{} ", session.key)),
                Span::styled(
                    session.status.label(),
                    Style::default().fg(session_color(session.status)),
                ),
            ])
        })
        .collect::<Vec<_>>();
    let selected = focused
        .and_then(|id| sessions.sessions().iter().position(|session| session.id == id))
        .unwrap_or(0);

    let shell_focused = app.mode() == InputMode::Shell;
    let block = Block::default()
        .title(if shell_focused {
            "Shell (Ctrl+] to leave)"
        } else {
            "Shell (Tab to type)"
        })
        .borders(Borders::ALL)
        .border_style(if shell_focused {
            Style::default().fg(ACCENT)
        } else {
            Style::default().fg(MUTED)
        })
        .style(Style::default().bg(PANEL));
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(1)])
        .split(inner);
    let tabs = Tabs::new(titles)
        .select(selected)
        .style(Style::default().fg(MUTED))
        .highlight_style(Style::default().fg(Color::Black).bg(ACCENT));
    frame.render_widget(tabs, rows[0]);

    if let Some(session) = focused.and_then(|id| sessions.get(id)) {
        render_screen(frame, rows[1], session, shell_focused && session.is_attached());
    }
}

fn render_screen(frame: &mut Frame, area: Rect, session: &ExecSession, show_cursor: bool) {
    let screen = session.screen();
    let (_, cols) = screen.size();
    let (cursor_row, cursor_col) = screen.cursor_position();

    let lines = screen
        .rows(0, cols)
        .take(area.height as usize)
        .enumerate()
        .map(|(row, text)| {
            if !show_cursor || row != cursor_row as usize {
                return Line::from(text);
            }
            let chars = text.chars().collect::<Vec<_>>();
            let column = cursor_col as usize;
            let before = chars.iter().take(column).collect::<String>();
            let under = chars.get(column).copied().unwrap_or(' ').to_string();
            let after = chars.iter().skip(column + 1).collect::<String>();
            Line::from(vec![
                Span::raw(before),
                Span::styled(under, Style::default().add_modifier(Modifier::REVERSED)),
                Span::raw(after),
            ])
        })
        .collect::<Vec<_>>();

    frame.render_widget(
        Paragraph::new(lines).style(Style::default().fg(Color::White)),
        area,
    );
}

fn render_footer(frame: &mut Frame, area: Rect, app: &App, dashboard: &Dashboard) {
    let (mode, bg) = match app.mode() {
        InputMode::Normal => (" NORMAL ", ACCENT),
        InputMode::Namespace => (" NAMESPACE ", WARN),
        InputMode::Shell => (" SHELL ", SECONDARY),
    };
    let mut spans = Vec::new();
    push_powerline_segment(&mut spans, mode, Color::Black, bg, BG);

    if app.mode() == InputMode::Namespace {
        spans.push(Span::styled(
            format!(" namespace: {}█", app.namespace_input()),
            Style::default().fg(Color::White).bg(BG),
        ));
    } else if let Some(error) = dashboard.status() {
        spans.push(Span::styled(
            format!(" {}", first_line(error)),
            Style::default().fg(ERROR).bg(BG),
        ));
    } else {
        spans.push(Span::styled(
            format!(" {}", app.status()),
            Style::default().fg(MUTED).bg(BG),
        ));
        spans.push(Span::styled(
            "  enter view  s shell  n namespace  ? help  q quit",
            Style::default().fg(MUTED).bg(BG),
        ));
    }

    frame.render_widget(Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)), area);
}

fn render_help_modal(frame: &mut Frame, app: &App) {
    let area = centered_rect(64, 60, frame.area());
    frame.render_widget(Clear, area);

    let mode = match app.mode() {
        InputMode::Normal => "normal",
        InputMode::Namespace => "namespace",
        InputMode::Shell => "shell",
    };
    let lines = [
        format!("podscope help  mode:{mode}"),
        String::new(),
        "j/k, arrows   move the cursor".to_string(),
        "gg/G          first / last pod".to_string(),
        "Enter         view pod logs and stats (again: next container)".to_string(),
        "s             open a shell in the pod under the cursor".to_string(),
        "Tab / i       type into the focused shell, Ctrl+] to leave".to_string(),
        "[ / ]         previous / next shell tab".to_string(),
        "x             close the focused shell".to_string(),
        "n or :        switch namespace".to_string(),
        "Esc           clear the status line".to_string(),
        "q             quit".to_string(),
    ]
    .into_iter()
    .map(Line::from)
    .collect::<Vec<_>>();

    let modal = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(
            Block::default()
                .title("Help")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(ACCENT))
                .style(Style::default().bg(PANEL)),
        )
        .style(Style::default().fg(Color::White));
    frame.render_widget(modal, area);
}

fn status_color(status: &str) -> Color {
    match status {
        "Running" | "Succeeded" => ACCENT,
        "Pending" | "Terminating" => WARN,
        "Failed" | "Unknown" => ERROR,
        _ => MUTED,
    }
}

fn panel_color(state: &PanelState) -> Color {
    match state {
        PanelState::Running => ACCENT,
        PanelState::Terminating => WARN,
        PanelState::Deleted => ERROR,
        PanelState::Phase(_) => MUTED,
    }
}

fn session_color(status: SessionStatus) -> Color {
    match status {
        SessionStatus::Connecting => MUTED,
        SessionStatus::Running => ACCENT,
        SessionStatus::Terminating => WARN,
        SessionStatus::Deleted => ERROR,
    }
}

fn push_powerline_segment(
    spans: &mut Vec<Span<'static>>,
    content: impl Into<String>,
    fg: Color,
    bg: Color,
    next_bg: Color,
) {
    spans.push(Span::styled(
        content.into(),
        Style::default().fg(fg).bg(bg).add_modifier(Modifier::BOLD),
    ));
    spans.push(Span::styled("", Style::default().fg(bg).bg(next_bg)));
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}

fn compact_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }

    if max_chars <= 1 {
        return "…".to_string();
    }

    let mut out = value
        .chars()
        .take(max_chars.saturating_sub(1))
        .collect::<String>();
    out.push('…');
    out
}

fn display_cluster_endpoint(cluster: &str) -> String {
    let trimmed = cluster.trim().trim_end_matches('/');
    trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed)
        .to_string()
}

fn format_cpu_millicores(value: u64) -> String {
    if value >= 1_000 {
        let whole = value / 1_000;
        let decimal = (value % 1_000) / 100;
        if decimal == 0 {
            return format!("{whole}");
        }
        return format!("{whole}.{decimal}");
    }
    format!("{value}m")
}

fn format_bytes_compact(bytes: u64) -> String {
    const UNITS: [(&str, u64); 5] = [
        ("Pi", 1_125_899_906_842_624),
        ("Ti", 1_099_511_627_776),
        ("Gi", 1_073_741_824),
        ("Mi", 1_048_576),
        ("Ki", 1_024),
    ];

    if bytes == 0 {
        return "0B".to_string();
    }

    for (suffix, unit) in UNITS {
        if bytes >= unit {
            let whole = bytes / unit;
            let decimal = ((bytes % unit) * 10) / unit;
            if decimal == 0 {
                return format!("{whole}{suffix}");
            }
            return format!("{whole}.{decimal}{suffix}");
        }
    }

    format!("{bytes}B")
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
