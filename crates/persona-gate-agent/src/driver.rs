//! Turn orchestration — one conversational turn from user message to
//! terminal event.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error};

use persona_gate_runner::{AgentDefinition, AgentRunner, RunOutcome, RunnerEvent};

use crate::chunk::chunk_words;
use crate::dedup::ContentDeduper;
use crate::{StreamEvent, TurnPacing};

/// Drive exactly one conversational turn.
///
/// Returns a finite, single-consumer event stream: zero or more `Content`
/// fragments, then exactly one terminal `Done` or `Error`, and nothing
/// after that. The turn runs on its own task, so it reaches its terminal
/// event even if the consumer stops reading.
pub fn run_turn(
    runner: Arc<dyn AgentRunner>,
    definition: AgentDefinition,
    user_message: String,
    prior_history: Vec<Value>,
    pacing: TurnPacing,
) -> UnboundedReceiverStream<StreamEvent> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        if let Err(e) = drive(runner, definition, user_message, prior_history, pacing, &tx).await
        {
            error!(error = %e, "Turn failed");
            let _ = tx.send(StreamEvent::Error {
                message: e.to_string(),
            });
        }
    });

    UnboundedReceiverStream::new(rx)
}

/// The turn body. Sends `Done` on success; any `Err` return is converted
/// to the terminal `Error` by the caller, so no code path can emit both.
async fn drive(
    runner: Arc<dyn AgentRunner>,
    definition: AgentDefinition,
    user_message: String,
    prior_history: Vec<Value>,
    pacing: TurnPacing,
    tx: &mpsc::UnboundedSender<StreamEvent>,
) -> anyhow::Result<()> {
    let user_item = json!({ "role": "user", "content": user_message });
    let mut input_history = prior_history;
    input_history.push(user_item);

    match runner.run(&definition, &input_history).await? {
        RunOutcome::Events(events) => {
            let mut events = std::pin::pin!(events);
            let mut deduper = ContentDeduper::new();
            let mut new_items: Vec<Value> = Vec::new();

            while let Some(event) = events.next().await {
                match event? {
                    RunnerEvent::Delta { content } => {
                        let fragment = deduper.push(&content);
                        if fragment.is_empty() {
                            continue;
                        }
                        // Send failures mean the consumer went away; the
                        // turn still runs to its terminal event.
                        let _ = tx.send(StreamEvent::Content { text: fragment });
                        if !pacing.delta_delay.is_zero() {
                            tokio::time::sleep(pacing.delta_delay).await;
                        }
                    }
                    RunnerEvent::Completed { new_items: items } => {
                        new_items = items;
                        break;
                    }
                }
            }

            let full_text = deduper.into_text();
            debug!(chars = full_text.len(), "Turn complete (streaming)");
            let updated_history = reconcile_history(input_history, new_items, &full_text);
            let _ = tx.send(StreamEvent::Done {
                full_text,
                updated_history,
            });
        }

        RunOutcome::Final(run) => {
            for group in chunk_words(&run.output, pacing.words_per_chunk) {
                let _ = tx.send(StreamEvent::Content { text: group });
                if !pacing.chunk_delay.is_zero() {
                    tokio::time::sleep(pacing.chunk_delay).await;
                }
            }

            debug!(chars = run.output.len(), "Turn complete (buffered)");
            let updated_history = reconcile_history(input_history, run.new_items, &run.output);
            let _ = tx.send(StreamEvent::Done {
                full_text: run.output,
                updated_history,
            });
        }
    }

    Ok(())
}

/// Determine the authoritative post-turn history: the runner's structured
/// items when it supplied any, otherwise a synthesized assistant item on
/// top of the input history (which already ends with this turn's user
/// item).
fn reconcile_history(
    mut input_history: Vec<Value>,
    new_items: Vec<Value>,
    full_text: &str,
) -> Vec<Value> {
    if new_items.is_empty() {
        input_history.push(json!({ "role": "assistant", "content": full_text }));
    } else {
        input_history.extend(new_items);
    }
    input_history
}
