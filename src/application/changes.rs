//! Publishes row insert events for entities this service creates.
//!
//! Deployments with an external change-capture relay leave this off; the relay then produces the
//! same events from the database log.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::ingest::{CHANGE_EVENT_KEY, ChangeEvent, EventSink, LogError};

const SOURCE: &str = "application::changes";

#[derive(Clone)]
pub struct ChangeFeed {
    sink: Arc<dyn EventSink>,
    stream: String,
}

impl ChangeFeed {
    pub fn new(sink: Arc<dyn EventSink>, stream: impl Into<String>) -> Self {
        Self {
            sink,
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Append `event` to the change stream and return its entry id.
    ///
    /// Callers that get an error must warm the cache themselves: no other path ranks a newly
    /// created entity.
    pub async fn publish(&self, event: &ChangeEvent) -> Result<String, LogError> {
        let payload = event
            .encode()
            .map_err(|err| LogError::Encode(err.to_string()))?;
        match self
            .sink
            .publish(&self.stream, CHANGE_EVENT_KEY, &payload)
            .await
        {
            Ok(id) => {
                debug!(
                    target = SOURCE,
                    stream = %self.stream,
                    table = %event.table,
                    id = %id,
                    "Published change event"
                );
                Ok(id)
            }
            Err(err) => {
                warn!(
                    target = SOURCE,
                    stream = %self.stream,
                    table = %event.table,
                    error = %err,
                    "Failed to publish change event"
                );
                Err(err)
            }
        }
    }
}
