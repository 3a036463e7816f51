//! Store-then-publish event path
//!
//! Every producer - the ingest endpoint, the cron runner, the insight
//! scheduler - records events through here, so the append is the single
//! linearization point and subscribers see a session-summary update on the
//! global topic for every event.

use crate::state::AppState;
use agentflow_core::bus::{session_topic, BusMessage, GLOBAL_TOPIC};
use agentflow_core::{Event, Result};

/// Append an event and fan it out: the event itself on its session room,
/// the refreshed session summary on the global topic.
pub async fn record_event(state: &AppState, event: &Event) -> Result<()> {
    state.db.append(event)?;
    publish_event(state, event).await
}

/// Fan an already-appended event out to subscribers. Split from
/// [`record_event`] so the ingest handler can merge request metadata into
/// the session row between append and publish.
pub async fn publish_event(state: &AppState, event: &Event) -> Result<()> {
    state
        .bus
        .publish(
            &session_topic(&event.session_id),
            BusMessage::new("event", serde_json::to_value(event)?),
        )
        .await;

    if let Some(summary) = state.db.get_session(&event.session_id)? {
        state
            .bus
            .publish(
                GLOBAL_TOPIC,
                BusMessage::new("session:update", serde_json::to_value(summary)?),
            )
            .await;
    }

    Ok(())
}
