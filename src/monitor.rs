use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::thread::JoinHandle;

use cli_table::{Cell, CellStruct, Style, Table, format::Justify, print_stdout};
use crossbeam_channel::{Receiver, Sender, unbounded};
use owo_colors::OwoColorize;

/// State of one unit of work as rendered in the status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Downloading,
    Zipping,
    Uploading,
    Extracting,
    Transferring,
    Resumed,
    Skipped,
    Completed,
    Backpressure,
    Error,
}

impl WorkState {
    fn as_str(self) -> &'static str {
        match self {
            WorkState::Downloading => "DOWNLOADING",
            WorkState::Zipping => "ZIPPING",
            WorkState::Uploading => "UPLOADING",
            WorkState::Extracting => "EXTRACTING",
            WorkState::Transferring => "TRANSFERRING",
            WorkState::Resumed => "RESUMED",
            WorkState::Skipped => "SKIPPED",
            WorkState::Completed => "COMPLETED",
            WorkState::Backpressure => "BACKPRESSURE",
            WorkState::Error => "ERROR",
        }
    }

    fn is_terminal_state(self) -> bool {
        matches!(self, WorkState::Completed | WorkState::Skipped | WorkState::Error)
    }
}

/// `(label, state, info)` triple; a `None` label is the sentinel that ends
/// the monitor thread.
pub struct StatusEvent {
    pub label: Option<String>,
    pub state: WorkState,
    pub info: String,
}

#[derive(Clone)]
pub struct StatusSender {
    tx: Sender<StatusEvent>,
}

impl StatusSender {
    pub fn update(&self, label: impl Into<String>, state: WorkState, info: impl Into<String>) {
        let _ = self.tx.send(StatusEvent { label: Some(label.into()), state, info: info.into() });
    }

    fn finish(&self) {
        let _ = self.tx.send(StatusEvent {
            label: None,
            state: WorkState::Completed,
            info: String::new(),
        });
    }
}

/// Single auxiliary task that consumes status triples from the queue and
/// renders one line per unit of work. Colors only when attached to a TTY.
pub struct StatusMonitor {
    tx: StatusSender,
    handle: Option<JoinHandle<Vec<(String, WorkState)>>>,
}

impl StatusMonitor {
    pub fn spawn() -> Self {
        let (tx, rx) = unbounded::<StatusEvent>();
        let color = std::io::stdout().is_terminal();
        if color {
            let _ = crate::util::try_enable_ansi_on_windows();
        }
        let handle = std::thread::spawn(move || run_monitor(rx, color));
        Self { tx: StatusSender { tx }, handle: Some(handle) }
    }

    pub fn sender(&self) -> StatusSender {
        self.tx.clone()
    }

    /// Send the sentinel, join the thread and print the final summary table
    /// of every unit that reached a terminal state.
    pub fn finish(mut self) {
        self.tx.finish();
        if let Some(h) = self.handle.take()
            && let Ok(final_states) = h.join()
        {
            print_summary_table(&final_states);
        }
    }
}

fn run_monitor(rx: Receiver<StatusEvent>, color: bool) -> Vec<(String, WorkState)> {
    // label -> last terminal state; BTreeMap keeps summary rows ordered
    let mut finished: BTreeMap<String, WorkState> = BTreeMap::new();
    while let Ok(ev) = rx.recv() {
        let Some(label) = ev.label else {
            break;
        };
        render_line(&label, ev.state, &ev.info, color);
        if ev.state.is_terminal_state() {
            finished.insert(label, ev.state);
        }
    }
    finished.into_iter().collect()
}

fn render_line(label: &str, state: WorkState, info: &str, color: bool) {
    if !color {
        println!("[{:<14}] {:<13} {}", label, state.as_str(), info);
        return;
    }
    let s = state.as_str();
    let painted = match state {
        WorkState::Error => s.red().to_string(),
        WorkState::Completed | WorkState::Skipped => s.green().to_string(),
        WorkState::Resumed => s.cyan().to_string(),
        WorkState::Backpressure => s.yellow().to_string(),
        _ => s.blue().to_string(),
    };
    println!("[{:<14}] {:<13} {}", label, painted, info);
}

fn print_summary_table(rows: &[(String, WorkState)]) {
    if rows.is_empty() {
        return;
    }
    let title = vec!["Unit".cell().bold(true), "Result".cell().bold(true)];
    let mut table: Vec<Vec<CellStruct>> = Vec::new();
    for (label, state) in rows {
        table.push(vec![
            label.as_str().cell(),
            state.as_str().cell().justify(Justify::Right),
        ]);
    }
    if let Err(e) = print_stdout(table.table().title(title)) {
        eprintln!("⚠️ 无法渲染汇总表格: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_ends_monitor_and_reports_terminal_states() {
        let (tx, rx) = unbounded::<StatusEvent>();
        let sender = StatusSender { tx };
        let h = std::thread::spawn(move || run_monitor(rx, false));
        sender.update("Part1", WorkState::Downloading, "3 files");
        sender.update("Part1", WorkState::Completed, "done");
        sender.update("Part2", WorkState::Error, "boom");
        sender.finish();
        let finished = h.join().expect("join");
        assert_eq!(finished.len(), 2);
        assert!(finished.contains(&("Part1".to_string(), WorkState::Completed)));
        assert!(finished.contains(&("Part2".to_string(), WorkState::Error)));
    }

    #[test]
    fn non_terminal_states_do_not_enter_summary() {
        let (tx, rx) = unbounded::<StatusEvent>();
        let sender = StatusSender { tx };
        let h = std::thread::spawn(move || run_monitor(rx, false));
        sender.update("Part1", WorkState::Zipping, "");
        sender.finish();
        assert!(h.join().expect("join").is_empty());
    }
}
