//! Session records and the registry that allocates them.

use crate::error::{CallError, Result, StoreError};
use crate::peer::types::SessionDescription;
use crate::store::{DocumentStore, StoreLayout};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

pub type SessionId = String;

/// Wire shape of a session document: `{offer?, answer?}`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

impl SessionRecord {
    pub fn from_value(path: &str, value: Value) -> std::result::Result<Self, StoreError> {
        serde_json::from_value(value).map_err(|source| StoreError::Malformed {
            path: path.to_string(),
            source,
        })
    }

    pub fn status(&self) -> SessionStatus {
        match (&self.offer, &self.answer) {
            (None, _) => SessionStatus::New,
            (Some(_), None) => SessionStatus::Offered,
            (Some(_), Some(_)) => SessionStatus::Answered,
        }
    }
}

/// Progress of a session as visible in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    New,
    Offered,
    Answered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub status: SessionStatus,
}

impl Session {
    fn from_record(id: SessionId, record: SessionRecord) -> Self {
        let status = record.status();
        Self {
            id,
            offer: record.offer,
            answer: record.answer,
            status,
        }
    }
}

/// Allocates and locates session records.
#[derive(Clone)]
pub struct CallRegistry {
    store: Arc<dyn DocumentStore>,
    layout: StoreLayout,
}

impl CallRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, layout: StoreLayout) -> Self {
        Self { store, layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Writes an empty record; the store picks the id.
    pub async fn create_session(&self) -> Result<SessionId> {
        let id = self
            .store
            .append(&self.layout.sessions, Value::Object(Map::new()))
            .await
            .map_err(CallError::StoreUnavailable)?;
        info!("created session {}", id);
        Ok(id)
    }

    pub async fn open_session(&self, id: &str) -> Result<Session> {
        let path = self.layout.session_path(id);
        let value = self
            .store
            .get(&path)
            .await
            .map_err(CallError::StoreUnavailable)?
            .ok_or_else(|| CallError::SessionNotFound(id.to_string()))?;
        let record = SessionRecord::from_value(&path, value).map_err(CallError::Store)?;
        Ok(Session::from_record(id.to_string(), record))
    }

    pub async fn publish_offer(&self, id: &str, offer: &SessionDescription) -> Result<()> {
        self.publish_field(id, "offer", offer).await
    }

    pub async fn publish_answer(&self, id: &str, answer: &SessionDescription) -> Result<()> {
        self.publish_field(id, "answer", answer).await
    }

    // update, not put: the other party's field must survive
    async fn publish_field(&self, id: &str, field: &str, desc: &SessionDescription) -> Result<()> {
        let mut fields = Map::new();
        fields.insert(
            field.to_string(),
            serde_json::to_value(desc).map_err(|e| CallError::Store(e.into()))?,
        );
        match self
            .store
            .update(&self.layout.session_path(id), fields)
            .await
        {
            Ok(()) => {
                info!("published {} for session {}", field, id);
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Err(CallError::SessionNotFound(id.to_string())),
            Err(e) => Err(CallError::StoreUnavailable(e)),
        }
    }
}
