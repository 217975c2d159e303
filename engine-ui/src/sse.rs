//! Server-Sent Events streams and the run store watcher.

use std::collections::HashSet;
use std::convert::Infallible;
use std::path::Path;
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use engine::core::event::Event;
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::routes::{ApiError, blocking};
use crate::state::{AppState, ChangeEvent};

const RUN_FILE: &str = "run.json";
const EVENTS_FILE: &str = "events.jsonl";

#[derive(Serialize)]
struct SsePayload<'a> {
    #[serde(rename = "type")]
    event_type: &'static str,
    run_id: &'a str,
}

impl<'a> From<&'a ChangeEvent> for SsePayload<'a> {
    fn from(event: &'a ChangeEvent) -> Self {
        let event_type = match event {
            ChangeEvent::RunCreated { .. } => "run_created",
            ChangeEvent::RunUpdated { .. } => "run_updated",
        };
        SsePayload {
            event_type,
            run_id: event.run_id(),
        }
    }
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new().interval(Duration::from_secs(15)).text("ping")
}

/// GET /events - store-wide change feed.
pub async fn changes_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut rx = state.change_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(SseEvent::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(change) => {
                    if let Ok(json) = serde_json::to_string(&SsePayload::from(&change)) {
                        yield Ok(SseEvent::default().event("change").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some changes dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(keep_alive())
}

/// Where live events for a run come from after the replay.
enum Feed {
    /// The run executes in this process.
    Bus(broadcast::Receiver<Event>),
    /// The run executes elsewhere; follow its file through the watcher.
    Store(broadcast::Receiver<ChangeEvent>),
}

fn is_terminal(event: &Event) -> bool {
    event
        .payload
        .lifecycle_state()
        .is_some_and(|state| state.is_terminal())
}

fn to_sse(event: &Event) -> Option<SseEvent> {
    match serde_json::to_string(event) {
        Ok(json) => Some(
            SseEvent::default()
                .event(event.payload.kind())
                .id(event.seq.to_string())
                .data(json),
        ),
        Err(err) => {
            warn!(run_id = %event.run_id, seq = event.seq, %err, "failed to serialize event");
            None
        }
    }
}

/// Events of `run_id` after `last_seq`, read from the durable chain.
async fn catch_up(state: &AppState, run_id: &str, last_seq: Option<u64>) -> Vec<Event> {
    let log = state.engine.log().clone();
    let id = run_id.to_string();
    match blocking(move || log.get_chain(&id)).await {
        Ok(chain) => chain
            .into_iter()
            .filter(|event| last_seq.is_none_or(|seq| event.seq > seq))
            .collect(),
        Err(err) => {
            warn!(run_id, ?err, "failed to re-read event chain");
            Vec::new()
        }
    }
}

/// The run's durable chain followed by its live events, in sequence order
/// and without duplicates. Ends after the terminal event.
pub async fn follow_run(
    state: AppState,
    run_id: String,
) -> Result<impl Stream<Item = Event>, ApiError> {
    // Subscribe before reading the chain so nothing committed in between is lost.
    let feed = match state.engine.bus().subscribe(&run_id) {
        Some(rx) => Feed::Bus(rx),
        None => Feed::Store(state.change_tx.subscribe()),
    };
    let log = state.engine.log().clone();
    let id = run_id.clone();
    let chain = blocking(move || log.get_chain(&id)).await?;
    debug!(run_id = %run_id, replayed = chain.len(), "following run");

    Ok(async_stream::stream! {
        let mut last_seq: Option<u64> = None;
        let mut ended = false;
        for event in chain {
            last_seq = Some(event.seq);
            ended = is_terminal(&event);
            yield event;
        }

        let mut feed = feed;
        while !ended {
            let fresh: Vec<Event> = match &mut feed {
                Feed::Bus(rx) => match rx.recv().await {
                    Ok(event) => vec![event],
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(run_id = %run_id, skipped = n, "live feed lagged, reading log");
                        catch_up(&state, &run_id, last_seq).await
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        ended = true;
                        catch_up(&state, &run_id, last_seq).await
                    }
                },
                Feed::Store(rx) => match rx.recv().await {
                    Ok(change) if change.run_id() == run_id => {
                        catch_up(&state, &run_id, last_seq).await
                    }
                    Ok(_) => Vec::new(),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        catch_up(&state, &run_id, last_seq).await
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        ended = true;
                        Vec::new()
                    }
                },
            };

            for event in fresh {
                if last_seq.is_some_and(|seq| event.seq <= seq) {
                    continue;
                }
                last_seq = Some(event.seq);
                let terminal = is_terminal(&event);
                yield event;
                if terminal {
                    ended = true;
                    break;
                }
            }
        }
    })
}

/// GET /events/{run_id} - replay the run's chain, then follow it live.
///
/// Each event is sent with its payload type as the SSE event name and its
/// sequence number as the SSE id. A final `end` event closes the stream.
pub async fn run_events_handler(
    State(state): State<AppState>,
    UrlPath(run_id): UrlPath<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let events = follow_run(state, run_id).await?;
    let end = SseEvent::default().event("end").data("{}");
    let stream = events
        .filter_map(|event| future::ready(to_sse(&event)))
        .chain(stream::once(future::ready(end)))
        .map(Ok);
    Ok(Sse::new(stream).keep_alive(keep_alive()))
}

/// Start the run store watcher in a background task.
pub fn start_file_watcher(state: AppState) {
    tokio::spawn(async move {
        if let Err(e) = run_file_watcher(state).await {
            warn!(error = %e, "file watcher failed");
        }
    });
}

async fn run_file_watcher(state: AppState) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(100)),
    )?;

    let runs_dir = state.runs_dir();
    std::fs::create_dir_all(&runs_dir)?;
    watcher.watch(&runs_dir, RecursiveMode::Recursive)?;
    info!(path = %runs_dir.display(), "watching run store");

    // Flush at a fixed interval so a run appending continuously still
    // produces regular updates.
    let mut pending_events: Vec<NotifyEvent> = Vec::new();
    let mut flush_tick = tokio::time::interval(Duration::from_millis(100));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                pending_events.push(event);
            }
            _ = flush_tick.tick() => {
                if pending_events.is_empty() {
                    continue;
                }
                process_events(&state, &pending_events);
                pending_events.clear();
            }
        }
    }
}

/// Collapse a batch of file events into one change per run and kind.
fn process_events(state: &AppState, events: &[NotifyEvent]) {
    let runs_dir = state.runs_dir();
    let mut created: Vec<String> = Vec::new();
    let mut updated: Vec<String> = Vec::new();
    let mut seen: HashSet<(bool, String)> = HashSet::new();

    for event in events {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }
        for path in &event.paths {
            let Some((run_id, file)) = parse_run_path(&runs_dir, path) else {
                continue;
            };
            let is_run_file = match file.as_str() {
                RUN_FILE => true,
                EVENTS_FILE => false,
                _ => continue,
            };
            if !seen.insert((is_run_file, run_id.clone())) {
                continue;
            }
            if is_run_file {
                created.push(run_id);
            } else {
                updated.push(run_id);
            }
        }
    }

    created.sort();
    updated.sort();
    for run_id in created {
        debug!(run_id = %run_id, "broadcasting run created");
        let _ = state.change_tx.send(ChangeEvent::RunCreated { run_id });
    }
    for run_id in updated {
        debug!(run_id = %run_id, "broadcasting run updated");
        let _ = state.change_tx.send(ChangeEvent::RunUpdated { run_id });
    }
}

/// Split `<runs_dir>/<run-id>/<file>` into its run id and file name.
fn parse_run_path(runs_dir: &Path, path: &Path) -> Option<(String, String)> {
    let rel = path.strip_prefix(runs_dir).ok()?;
    let mut components = rel.components();
    let run_id = components.next()?.as_os_str().to_str()?.to_string();
    let file = components.next()?.as_os_str().to_str()?.to_string();
    if components.next().is_some() {
        return None;
    }
    Some((run_id, file))
}
