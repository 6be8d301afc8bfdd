use crate::runner::RunEvent;
use crate::summary::RunSummary;

use super::ReporterKind;

/// Prints run events as they arrive and the summary at the end.
pub struct Reporter {
    kind: ReporterKind,
}

impl Reporter {
    pub fn new(kind: ReporterKind) -> Self {
        Self { kind }
    }

    pub fn on_event(&mut self, event: &RunEvent) {
        match self.kind {
            ReporterKind::Cli => {
                if let Some(line) = cli_line(event) {
                    println!("{line}");
                }
            }
            ReporterKind::Events => match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(err) => eprintln!("failed to serialize {} event: {err}", event.name()),
            },
            ReporterKind::Json => {}
        }
    }

    pub fn finish(&self, summary: &RunSummary) {
        match self.kind {
            ReporterKind::Cli => println!("{}", summary_table(summary)),
            ReporterKind::Json => match serde_json::to_string_pretty(summary) {
                Ok(raw) => println!("{raw}"),
                Err(err) => eprintln!("failed to serialize run summary: {err}"),
            },
            ReporterKind::Events => {}
        }
    }
}

fn cli_line(event: &RunEvent) -> Option<String> {
    Some(match event {
        RunEvent::BeforeIteration { cursor } if cursor.cycles > 1 => {
            format!("\nIteration {}/{}", cursor.iteration + 1, cursor.cycles)
        }
        RunEvent::BeforeItem { item, .. } => format!("\n→ {}", item.path),
        RunEvent::Request {
            error: Some(error),
            request,
            ..
        } => match request {
            Some(request) => format!("  {} {} [errored]\n  ! {error}", request.method, request.url),
            None => format!("  ! {error}"),
        },
        RunEvent::Request {
            request: Some(request),
            response: Some(response),
            ..
        } => format!(
            "  {} {} [{} {}, {}B, {}ms]",
            request.method, request.url, response.status, response.status_text, response.size, response.time
        ),
        RunEvent::Item { skipped: true, .. } => "  (request skipped)".to_string(),
        RunEvent::Assertion { assertion, .. } => match (&assertion.passed, &assertion.message) {
            (true, _) => format!("  ✓ {}", assertion.name),
            (false, Some(message)) => format!("  ✗ {} ({message})", assertion.name),
            (false, None) => format!("  ✗ {}", assertion.name),
        },
        RunEvent::Exception { error, .. } => format!("  ! {error}"),
        RunEvent::Console { level, message, .. } => format!("  [{level:?}] {message}"),
        RunEvent::Pause { .. } => "  (paused)".to_string(),
        RunEvent::Resume { .. } => "  (resumed)".to_string(),
        RunEvent::Abort { .. } => "\nRun aborted".to_string(),
        _ => return None,
    })
}

fn summary_table(summary: &RunSummary) -> String {
    let stats = &summary.stats;
    let rows = [
        ("iterations", stats.iterations),
        ("requests", stats.requests),
        ("prerequest scripts", stats.prerequest_scripts),
        ("test scripts", stats.test_scripts),
        ("assertions", stats.assertions),
    ];

    let mut out = String::from("\n┌────────────────────┬──────────┬──────────┐\n");
    out.push_str("│                    │ executed │   failed │\n");
    out.push_str("├────────────────────┼──────────┼──────────┤\n");
    for (label, count) in rows {
        out.push_str(&format!("│ {label:>18} │ {:>8} │ {:>8} │\n", count.total, count.failed));
    }
    out.push_str("└────────────────────┴──────────┴──────────┘\n");

    let timings = &summary.timings;
    out.push_str(&format!(
        "total run duration: {}ms\ntotal data received: {}B\naverage response time: {:.0}ms [min: {:.0}ms, max: {:.0}ms, s.d.: {:.0}ms]\n",
        summary.duration_ms, summary.transfer_bytes, timings.average, timings.min, timings.max, timings.stddev
    ));
    if stats.skipped_items > 0 {
        out.push_str(&format!("skipped requests: {}\n", stats.skipped_items));
    }

    if !summary.failures.is_empty() {
        out.push_str("\n  #  failure\n");
        for (index, failure) in summary.failures.iter().enumerate() {
            let item = failure.item_name.as_deref().unwrap_or("run");
            out.push_str(&format!(
                "{:>3}. [{:?}] iteration {} · {item}\n     {}\n",
                index + 1,
                failure.source,
                failure.iteration + 1,
                failure.message
            ));
        }
    }
    if let Some(error) = &summary.error {
        out.push_str(&format!("\nrun error: {error}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::Cursor;
    use crate::summary::{FailureSource, RunFailure, RunStatus};

    #[test]
    fn summary_table_lists_failures() {
        let mut summary = RunSummary::new("r", "Demo");
        summary.stats.requests.record(true);
        summary.record_failure(RunFailure {
            iteration: 0,
            item_id: None,
            item_name: Some("List".into()),
            source: FailureSource::Request,
            message: "Connection failed".into(),
        });
        summary.finish(RunStatus::Completed);

        let table = summary_table(&summary);
        assert!(table.contains("│           requests │        1 │        1 │"));
        assert!(table.contains("iteration 1 · List"));
        assert!(table.contains("Connection failed"));
    }

    #[test]
    fn quiet_events_print_nothing() {
        let event = RunEvent::Start {
            cursor: Cursor::new("r", 1, 1),
        };
        assert!(cli_line(&event).is_none());
    }
}
