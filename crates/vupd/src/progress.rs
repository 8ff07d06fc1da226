//! Terminal progress bars driven by the scheduler's event stream.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};
use vup_upload::{EventKind, UploadEvent};

const STEPS: u64 = 1000;

fn make_progress_bar(multi: &MultiProgress, name: &str) -> ProgressBar {
    let pb = multi.add(ProgressBar::new(STEPS));
    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {percent:>3}% {msg}")
        .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(name.to_string());
    pb.set_message("queued");
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Render one bar per tracked file until every one of them reached a
/// terminal event.
pub async fn watch(mut events: broadcast::Receiver<UploadEvent>, names: HashMap<String, String>) {
    let multi = MultiProgress::new();
    let mut bars: HashMap<String, ProgressBar> = names
        .iter()
        .map(|(id, name)| (id.clone(), make_progress_bar(&multi, name)))
        .collect();
    let mut open: HashSet<String> = names.into_keys().collect();

    while !open.is_empty() {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        let Some(pb) = bars.get(&event.file_id) else {
            continue;
        };
        match &event.kind {
            EventKind::Queued => pb.set_message("queued"),
            EventKind::Started => pb.set_message("encrypting"),
            EventKind::Progress { fraction } => {
                pb.set_position((fraction.clamp(0.0, 1.0) * STEPS as f64) as u64);
                if *fraction >= 0.5 {
                    pb.set_message("uploading");
                }
            }
            EventKind::Retrying { attempt, delay } => pb.set_message(format!(
                "retry #{attempt} in {}",
                humanize(*delay)
            )),
            kind if kind.is_terminal() => {
                let msg = match kind {
                    EventKind::Completed => "done".to_string(),
                    EventKind::Waiting => "waiting for storage".to_string(),
                    EventKind::Paused => "paused".to_string(),
                    EventKind::Cancelled => "cancelled".to_string(),
                    EventKind::Failed { category } => format!("failed: {category}"),
                    _ => String::new(),
                };
                if matches!(kind, EventKind::Completed) {
                    pb.set_position(STEPS);
                    pb.finish_with_message(msg);
                } else {
                    pb.abandon_with_message(msg);
                }
                open.remove(&event.file_id);
            }
            _ => {}
        }
    }

    for pb in bars.drain().map(|(_, pb)| pb) {
        if !pb.is_finished() {
            pb.abandon();
        }
    }
}

fn humanize(delay: Duration) -> String {
    if delay.as_secs() >= 1 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{}ms", delay.as_millis())
    }
}
