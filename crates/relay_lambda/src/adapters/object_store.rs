use async_trait::async_trait;
use relay_core::contract::Event;
use relay_core::routing::{Destination, EventSink};
use relay_core::storage_keys::archive_object_key;
use relay_core::RelayError;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn write_object(&self, key: &str, body: &[u8]) -> Result<(), String>;
}

/// Archives each routed event as a JSON object under a partitioned key.
pub struct ArchiveSink<S> {
    store: S,
    prefix: String,
}

impl<S: ObjectStore> ArchiveSink<S> {
    pub fn new(store: S, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn destination(&self) -> String {
        Destination::Archive {
            prefix: self.prefix.clone(),
        }
        .to_string()
    }
}

#[async_trait]
impl<S: ObjectStore> EventSink for ArchiveSink<S> {
    async fn deliver(&self, event: &Event) -> Result<String, RelayError> {
        let key = archive_object_key(&self.prefix, event);
        let body = event.to_body()?;
        self.store
            .write_object(&key, body.as_bytes())
            .await
            .map_err(|error| RelayError::delivery(self.destination(), format!("failed to archive event: {error}")))?;
        Ok(key)
    }
}
