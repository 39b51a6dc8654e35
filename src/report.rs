use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::File;
use std::path::Path;

use crate::types::{BatchStarted, PingOutcome, PortOutcome, ProbeEvent, ProbeOutcome, Target};

/// One table row; `outcome` stays `None` until the target reports.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub target: Target,
    pub outcome: Option<ProbeOutcome>,
}

/// Results of the most recent batch, in the batch's target order.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ResultBoard {
    pub batch_id: Option<u64>,
    pub port: Option<u16>,
    pub complete: bool,
    pub rows: Vec<ResultRow>,
}

impl ResultBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the board with placeholder rows for a new batch.
    pub fn reset(&mut self, started: &BatchStarted) {
        self.batch_id = Some(started.batch_id);
        self.port = started.params.port;
        self.complete = false;
        self.rows = started
            .targets
            .iter()
            .map(|t| ResultRow {
                target: t.clone(),
                outcome: None,
            })
            .collect();
    }

    /// Fold one event into the board. Events for another batch, and outcomes for
    /// targets the batch never requested, are dropped.
    pub fn apply(&mut self, event: ProbeEvent) {
        match event {
            ProbeEvent::BatchStarted(started) => self.reset(&started),
            ProbeEvent::Outcome { batch_id, outcome } => {
                if self.batch_id != Some(batch_id) {
                    return;
                }
                if let Some(row) = self.rows.iter_mut().find(|r| &r.target == outcome.target()) {
                    row.outcome = Some(outcome);
                }
            }
            ProbeEvent::BatchComplete(summary) => {
                if self.batch_id == Some(summary.batch_id) {
                    self.complete = true;
                }
            }
        }
    }

    pub fn reported(&self) -> usize {
        self.rows.iter().filter(|r| r.outcome.is_some()).count()
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &ProbeOutcome> {
        self.rows.iter().filter_map(|r| r.outcome.as_ref())
    }
}

/// Display cells for one row: ping avg, loss, port status.
fn row_cells(row: &ResultRow) -> (String, String, String) {
    match &row.outcome {
        None => ("--".into(), "--".into(), "--".into()),
        Some(ProbeOutcome::TaskError { message, .. }) => {
            ("--".into(), "--".into(), format!("error: {message}"))
        }
        Some(ProbeOutcome::Probed { ping, port, .. }) => {
            let (avg, loss) = match ping {
                PingOutcome::Measured { avg_latency_ms, .. } => (
                    format!("{avg_latency_ms:.1}"),
                    ping.loss_display()
                        .map(|l| format!("{l:.0}"))
                        .unwrap_or_else(|| "--".into()),
                ),
                PingOutcome::Failed { reason } => ("--".into(), format!("failed: {reason}")),
            };
            let port = match port {
                PortOutcome::Open { response_time_ms } => format!("open ({response_time_ms:.1} ms)"),
                PortOutcome::Closed { reason } => format!("closed: {reason}"),
                PortOutcome::TimedOut => "timed out".into(),
                PortOutcome::Skipped => "skipped".into(),
            };
            (avg, loss, port)
        }
    }
}

pub fn format_results_table(board: &ResultBoard) -> String {
    let headers = ["target", "ping_avg_ms", "loss_pct", "port", "port_status"];
    let port = board
        .port
        .map(|p| p.to_string())
        .unwrap_or_else(|| "--".into());
    let rows: Vec<[String; 5]> = board
        .rows
        .iter()
        .map(|r| {
            let (avg, loss, status) = row_cells(r);
            [r.target.to_string(), avg, loss, port.clone(), status]
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.len().min(60));
        }
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Reported: {} / {}{}",
        board.reported(),
        board.rows.len(),
        if board.complete { "" } else { " (incomplete)" }
    );
    let _ = writeln!(
        out,
        "{:<w0$}  {:>w1$}  {:>w2$}  {:>w3$}  {:<w4$}",
        headers[0],
        headers[1],
        headers[2],
        headers[3],
        headers[4],
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
        w3 = widths[3],
        w4 = widths[4]
    );
    let _ = writeln!(
        out,
        "{:-<w0$}  {:-<w1$}  {:-<w2$}  {:-<w3$}  {:-<w4$}",
        "",
        "",
        "",
        "",
        "",
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
        w3 = widths[3],
        w4 = widths[4]
    );
    for row in rows {
        let mut status = row[4].clone();
        if status.len() > 60 {
            let mut cut = 60;
            while !status.is_char_boundary(cut) {
                cut -= 1;
            }
            status.truncate(cut);
        }
        let _ = writeln!(
            out,
            "{:<w0$}  {:>w1$}  {:>w2$}  {:>w3$}  {:<w4$}",
            row[0],
            row[1],
            row[2],
            row[3],
            status,
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
            w3 = widths[3],
            w4 = widths[4]
        );
    }
    out
}

pub fn print_results_table(board: &ResultBoard) {
    print!("\n{}", format_results_table(board));
}

/// One line per outcome, for streaming output while a batch runs.
pub fn format_outcome_line(outcome: &ProbeOutcome) -> String {
    let row = ResultRow {
        target: outcome.target().clone(),
        outcome: Some(outcome.clone()),
    };
    let (avg, loss, status) = row_cells(&row);
    format!("{}  ping_avg_ms={avg} loss_pct={loss} port={status}", row.target)
}

pub fn write_results_json(path: &Path, board: &ResultBoard) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create output file: {}", path.display()))?;
    serde_json::to_writer_pretty(file, board)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchSummary, ProbeParameters};

    fn started(batch_id: u64, targets: &[&str]) -> BatchStarted {
        BatchStarted {
            batch_id,
            total: targets.len(),
            targets: targets.iter().map(|t| Target::from(*t)).collect(),
            params: ProbeParameters::default(),
        }
    }

    fn probed(target: &str) -> ProbeOutcome {
        ProbeOutcome::Probed {
            target: target.into(),
            ping: PingOutcome::Measured {
                avg_latency_ms: 45.0,
                packet_loss_pct: 25.0,
            },
            port: PortOutcome::Closed {
                reason: "connection refused".into(),
            },
            completed_at: "1970-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn placeholders_until_reported() {
        let mut b = ResultBoard::new();
        b.apply(ProbeEvent::BatchStarted(started(1, &["a", "b"])));
        assert_eq!(b.rows.len(), 2);
        assert_eq!(b.reported(), 0);

        b.apply(ProbeEvent::Outcome {
            batch_id: 1,
            outcome: probed("b"),
        });
        assert_eq!(b.reported(), 1);
        assert!(b.rows[0].outcome.is_none());
        assert!(!b.complete);

        b.apply(ProbeEvent::BatchComplete(BatchSummary {
            batch_id: 1,
            total: 2,
        }));
        assert!(b.complete);
    }

    #[test]
    fn foreign_batches_and_targets_ignored() {
        let mut b = ResultBoard::new();
        b.apply(ProbeEvent::BatchStarted(started(2, &["a"])));
        b.apply(ProbeEvent::Outcome {
            batch_id: 1,
            outcome: probed("a"),
        });
        b.apply(ProbeEvent::Outcome {
            batch_id: 2,
            outcome: probed("zzz"),
        });
        b.apply(ProbeEvent::BatchComplete(BatchSummary {
            batch_id: 1,
            total: 1,
        }));
        assert_eq!(b.reported(), 0);
        assert!(!b.complete);
    }

    #[test]
    fn table_rounds_loss_and_shows_port() {
        let mut b = ResultBoard::new();
        b.apply(ProbeEvent::BatchStarted(started(1, &["10.0.0.2", "10.0.0.9"])));
        b.apply(ProbeEvent::Outcome {
            batch_id: 1,
            outcome: probed("10.0.0.2"),
        });
        let table = format_results_table(&b);
        assert!(table.contains("Reported: 1 / 2 (incomplete)"));
        let line = table.lines().find(|l| l.starts_with("10.0.0.2")).unwrap();
        assert!(line.contains("45.0"));
        assert!(line.contains("25"));
        assert!(line.contains("23"));
        assert!(line.contains("closed: connection refused"));
        let pending = table.lines().find(|l| l.starts_with("10.0.0.9")).unwrap();
        assert!(pending.contains("--"));
    }

    #[test]
    fn outcome_line_for_task_error() {
        let line = format_outcome_line(&ProbeOutcome::TaskError {
            target: "x".into(),
            message: "probe panicked".into(),
            completed_at: String::new(),
        });
        assert!(line.starts_with("x "));
        assert!(line.contains("error: probe panicked"));
    }

    #[test]
    fn json_export_round_trips() {
        let mut b = ResultBoard::new();
        b.apply(ProbeEvent::BatchStarted(started(3, &["a"])));
        b.apply(ProbeEvent::Outcome {
            batch_id: 3,
            outcome: probed("a"),
        });
        let path = std::env::temp_dir().join(format!("pingport-results-{}.json", std::process::id()));
        write_results_json(&path, &b).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        let back: ResultBoard = serde_json::from_str(&text).unwrap();
        assert_eq!(back, b);
    }
}
