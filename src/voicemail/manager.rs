//! Owns the set of live mailbox pollers. Mailbox mutations reconcile
//! the map with dispose-then-replace semantics so no poller ever runs
//! with a half-applied configuration.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Mailbox, NewMailbox};
use crate::state::AppState;
use crate::stores::mailboxes as mailbox_store;

use super::SyncedMailbox;

const TRIGGER_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SyncManager {
    state: AppState,
    boxes: Mutex<HashMap<Uuid, SyncedMailbox>>,
}

impl SyncManager {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            boxes: Mutex::new(HashMap::new()),
        }
    }

    /// Loads all configured mailboxes and spawns one poller each. A
    /// mailbox that fails to start is logged and skipped.
    pub async fn start(&self) -> AppResult<()> {
        let mailboxes = self.load_mailboxes().await?;

        let mut boxes = self.boxes.lock().await;
        for mailbox in mailboxes {
            match SyncedMailbox::spawn(self.state.clone(), &mailbox) {
                Ok(poller) => {
                    boxes.insert(mailbox.id, poller);
                }
                Err(err) => {
                    error!(mailbox = %mailbox.id, error = %err, "failed to create mailbox poller");
                }
            }
        }

        Ok(())
    }

    pub async fn create_mailbox(&self, new: NewMailbox) -> AppResult<Mailbox> {
        let state = self.state.clone();
        let mailbox = tokio::task::spawn_blocking(move || -> AppResult<Mailbox> {
            let mut conn = state.db()?;
            Ok(mailbox_store::create_mailbox(&mut conn, new)?)
        })
        .await
        .map_err(AppError::internal)??;

        let poller = SyncedMailbox::spawn(self.state.clone(), &mailbox)
            .map_err(|err| AppError::internal(format!("failed to create mailbox poller: {err}")))?;

        let mut boxes = self.boxes.lock().await;
        boxes.insert(mailbox.id, poller);

        Ok(mailbox)
    }

    /// Swaps the poller after a configuration change. The displaced
    /// poller is fully drained before its replacement starts.
    pub async fn update_poller(&self, mailbox: &Mailbox) -> AppResult<()> {
        let mut boxes = self.boxes.lock().await;

        let old = boxes.remove(&mailbox.id).ok_or_else(AppError::not_found)?;
        old.dispose().await;

        let poller = SyncedMailbox::spawn(self.state.clone(), mailbox)
            .map_err(|err| AppError::internal(format!("failed to create mailbox poller: {err}")))?;
        boxes.insert(mailbox.id, poller);

        Ok(())
    }

    pub async fn delete_mailbox(&self, id: Uuid) -> AppResult<()> {
        let mut boxes = self.boxes.lock().await;

        let old = boxes.remove(&id).ok_or_else(AppError::not_found)?;
        old.dispose().await;
        drop(boxes);

        let state = self.state.clone();
        tokio::task::spawn_blocking(move || -> AppResult<()> {
            let mut conn = state.db()?;
            mailbox_store::delete_mailbox(&mut conn, id)?;
            Ok(())
        })
        .await
        .map_err(AppError::internal)?
    }

    /// Requests an immediate fetch of the mailbox and waits for it, up
    /// to thirty seconds.
    pub async fn trigger_sync(&self, id: Uuid) -> AppResult<()> {
        let trigger = {
            let boxes = self.boxes.lock().await;
            let poller = boxes.get(&id).ok_or_else(AppError::not_found)?;
            poller.trigger_handle()
        };

        tokio::time::timeout(TRIGGER_SYNC_TIMEOUT, trigger.run())
            .await
            .map_err(|_| AppError::internal("mailbox sync timed out"))?
            .map_err(AppError::internal)
    }

    /// Stops every poller; used on shutdown.
    pub async fn dispose_all(&self) {
        let mut boxes = self.boxes.lock().await;
        for (_, poller) in boxes.drain() {
            poller.dispose().await;
        }
    }

    async fn load_mailboxes(&self) -> AppResult<Vec<Mailbox>> {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || -> AppResult<Vec<Mailbox>> {
            let mut conn = state.db()?;
            Ok(mailbox_store::list_mailboxes(&mut conn)?)
        })
        .await
        .map_err(|err| AppError::internal(anyhow!("mailbox task panicked: {err}")))?
    }
}
