//! taskflow watch command
//!
//! Keeps the index live until Ctrl-C. Without `--events` each engine event is
//! printed as it happens: JSONL with `--json`, one line per event otherwise.

use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::error::Result;
use crate::events::{EventSink, IndexEvent};

use super::Session;

pub async fn run(session: &mut Session) -> Result<()> {
    session.engine.start_watching()?;
    if !session.output.quiet && !session.output.json {
        eprintln!(
            "watching {} ({} task(s)); press Ctrl-C to stop",
            session.engine.root().display(),
            session.engine.query_api().summary().total_tasks
        );
    }

    if session.forwarding_events() || session.output.quiet {
        tokio::signal::ctrl_c().await?;
        return Ok(());
    }

    let mut receiver = session.engine.subscribe();
    let mut sink = session.output.json.then(EventSink::stdout);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                return Ok(());
            }
            event = receiver.recv() => match event {
                Ok(event) => match sink.as_mut() {
                    Some(sink) => sink.emit(&event)?,
                    None => println!("{}", describe(&event)),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn describe(event: &IndexEvent) -> String {
    let kind = serde_json::to_value(event.event)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default();
    match &event.data {
        Some(data) => format!("{} #{} {kind} {data}", event.timestamp.format("%H:%M:%S"), event.generation),
        None => format!("{} #{} {kind}", event.timestamp.format("%H:%M:%S"), event.generation),
    }
}
