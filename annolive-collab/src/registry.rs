//! Room registry: maps document keys to running room actors.
//!
//! The registry is the only structure shared between connections. It is
//! touched when a connection joins and when an empty room retires; all other
//! traffic goes straight to the room's queue.
//!
//! Retirement race: a room that has become empty removes itself only while
//! holding the registry write lock and only if its queue is empty, then
//! closes the queue. A joiner that grabbed the handle just before that
//! either fails to send or never gets a reply, and retries against a fresh
//! room.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::auth::Identity;
use crate::broadcast::Frame;
use crate::error::CollabError;
use crate::protocol::{ConnectionId, DocumentKey};
use crate::room::{self, EngineInput, JoinAccepted, RoomCommand, RoomConfig, RoomHandle, RoomState, RoomStats};
use crate::store::AnnotationStore;
use crate::suggestion::SuggestionFeedback;

const JOIN_ATTEMPTS: usize = 5;

pub struct RoomRegistry {
    rooms: RwLock<HashMap<DocumentKey, RoomHandle>>,
    config: RoomConfig,
    store: Arc<dyn AnnotationStore>,
    feedback: Option<mpsc::UnboundedSender<SuggestionFeedback>>,
}

impl RoomRegistry {
    pub fn new(
        config: RoomConfig,
        store: Arc<dyn AnnotationStore>,
        feedback: Option<mpsc::UnboundedSender<SuggestionFeedback>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            config,
            store,
            feedback,
        })
    }

    /// Existing room for `key`, if one is running.
    pub async fn get(&self, key: &DocumentKey) -> Option<RoomHandle> {
        self.rooms.read().await.get(key).cloned()
    }

    pub async fn get_or_create(self: &Arc<Self>, key: &DocumentKey) -> RoomHandle {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(key) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(key) {
            return room.clone();
        }
        let state = RoomState::new(key.clone(), self.config.clone(), Arc::clone(&self.store), self.feedback.clone());
        let handle = room::spawn(state, Arc::clone(self));
        rooms.insert(key.clone(), handle.clone());
        log::debug!("Created room {key} ({} active)", rooms.len());
        handle
    }

    /// Join `key`, retrying when the room retires underneath us.
    pub async fn join(
        self: &Arc<Self>,
        key: &DocumentKey,
        conn: ConnectionId,
        identity: Identity,
        unicast: mpsc::Sender<Frame>,
    ) -> Result<(RoomHandle, JoinAccepted), CollabError> {
        for attempt in 1..=JOIN_ATTEMPTS {
            let handle = self.get_or_create(key).await;
            let (reply, rx) = oneshot::channel();
            let cmd = RoomCommand::Join {
                conn,
                identity: identity.clone(),
                unicast: unicast.clone(),
                reply,
            };
            if handle.send(cmd).await.is_err() {
                log::debug!("Room {key} closed before join (attempt {attempt})");
                continue;
            }
            match rx.await {
                Ok(result) => return result.map(|accepted| (handle, accepted)),
                Err(_) => log::debug!("Room {key} retired during join (attempt {attempt})"),
            }
        }
        Err(CollabError::UpstreamStoreUnavailable(format!(
            "room {key} kept retiring during join"
        )))
    }

    /// Hand engine input to a running room. `Ok(false)` when nobody is connected.
    pub async fn push(&self, key: &DocumentKey, input: EngineInput) -> Result<bool, CollabError> {
        let Some(handle) = self.get(key).await else {
            return Ok(false);
        };
        let (reply, rx) = oneshot::channel();
        if handle.send(RoomCommand::Engine { input, reply }).await.is_err() {
            return Ok(false);
        }
        match rx.await {
            Ok(result) => result.map(|()| true),
            Err(_) => Ok(false),
        }
    }

    /// Remove the room if it is still the registered one and nothing is queued.
    pub(crate) async fn retire(
        &self,
        key: &DocumentKey,
        id: uuid::Uuid,
        rx: &mut mpsc::Receiver<RoomCommand>,
    ) -> bool {
        let mut rooms = self.rooms.write().await;
        if !rx.is_empty() {
            return false;
        }
        if rooms.get(key).is_some_and(|h| h.id == id) {
            rooms.remove(key);
        }
        rx.close();
        log::debug!("Retired room {key} ({} active)", rooms.len());
        true
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Ask every live room for its stats.
    pub async fn room_stats(&self) -> Vec<RoomStats> {
        let handles: Vec<RoomHandle> = self.rooms.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let (reply, rx) = oneshot::channel();
            if handle.send(RoomCommand::Stats { reply }).await.is_ok() {
                if let Ok(stats) = rx.await {
                    out.push(stats);
                }
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}
