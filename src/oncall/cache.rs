//! Per-inbound-number cache of the on-call response.
//!
//! A control loop refreshes the snapshot on a periodic tick, on explicit
//! triggers after overwrite mutations, on roster-change events, and when
//! the soonest shift boundary of the cached response is reached. A
//! change of the primary transfer target publishes a retained
//! `OnCallChangeEvent`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{GetOnCallResponse, OnCallChangeEvent};
use crate::events;
use crate::oncall::resolver::resolve_on_call_target;
use crate::state::AppState;

const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
pub struct OnCallCache {
    inbound_number: String,
    trigger: mpsc::Sender<()>,
    snapshot: Arc<RwLock<Option<GetOnCallResponse>>>,
}

impl OnCallCache {
    /// Starts the cache loop for one inbound number. The loop performs
    /// an initial refresh immediately and exits when `cancel` fires.
    pub fn spawn(state: AppState, inbound_number: String, cancel: CancellationToken) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let snapshot = Arc::new(RwLock::new(None));

        let cache = Self {
            inbound_number: inbound_number.clone(),
            trigger: trigger_tx,
            snapshot: snapshot.clone(),
        };

        tokio::spawn(run(state, inbound_number, snapshot, trigger_rx, cache.trigger.clone(), cancel));

        cache
    }

    pub fn inbound_number(&self) -> &str {
        &self.inbound_number
    }

    /// Requests a refresh. Never blocks; a refresh that is already
    /// pending absorbs the trigger.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Returns a clone of the cached response, or `None` before the
    /// first successful refresh.
    pub async fn current(&self) -> Option<GetOnCallResponse> {
        self.snapshot.read().await.clone()
    }
}

async fn run(
    state: AppState,
    inbound_number: String,
    snapshot: Arc<RwLock<Option<GetOnCallResponse>>>,
    mut trigger_rx: mpsc::Receiver<()>,
    trigger_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    let mut roster_events = state.events.subscribe(events::ROSTER_CHANGED);

    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately; the loop below already
    // refreshes before waiting
    ticker.tick().await;

    loop {
        match resolve_on_call_target(&state, Utc::now(), false, &inbound_number).await {
            Ok(response) => {
                let changed = {
                    let mut guard = snapshot.write().await;
                    let changed = match guard.as_ref() {
                        None => true,
                        Some(current) => {
                            current.primary_transfer_target != response.primary_transfer_target
                        }
                    };
                    *guard = Some(response.clone());
                    changed
                };

                if changed {
                    schedule_boundary_trigger(&response, trigger_tx.clone(), cancel.clone());

                    info!(
                        inbound_number,
                        on_call = %response.primary_transfer_target,
                        "cache update complete, new on-call target found"
                    );

                    state.events.publish(
                        events::ON_CALL_CHANGE,
                        &OnCallChangeEvent {
                            on_call: response.on_call.clone(),
                            roster_date: response.roster_date.clone(),
                            is_overwrite: response.is_overwrite,
                            primary_transfer_target: response.primary_transfer_target.clone(),
                            inbound_number: inbound_number.clone(),
                        },
                        true,
                    );
                } else {
                    info!(
                        inbound_number,
                        on_call = %response.primary_transfer_target,
                        "cache update complete, on-call target unchanged"
                    );
                }
            }
            Err(err) => {
                warn!(inbound_number, error = %err, "cache: failed to resolve on-call target");
            }
        }

        tokio::select! {
            _ = ticker.tick() => {
                info!(inbound_number, "cache timeout, triggering update");
            }
            Some(_) = trigger_rx.recv() => {
                info!(inbound_number, "manual cache update triggered");
            }
            Some(_) = roster_events.recv() => {
                info!(inbound_number, "roster event received, triggering update");
            }
            _ = cancel.cancelled() => return,
        }
    }
}

/// Arms a one-shot sleeper that re-triggers the cache when the soonest
/// `until` boundary of the current response passes.
fn schedule_boundary_trigger(
    response: &GetOnCallResponse,
    trigger: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    let Some(boundary) = response.on_call.iter().filter_map(|entry| entry.until).min() else {
        return;
    };

    let delay = match (boundary - Utc::now()).to_std() {
        Ok(delay) => delay,
        // boundary already passed
        Err(_) => return,
    };

    tokio::spawn(async move {
        info!(expected_change_time = %boundary, "waiting for on-call to change");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                info!("triggering update since on-call is about to change");
                let _ = trigger.try_send(());
            }
            _ = cancel.cancelled() => {}
        }
    });
}

/// All live caches, keyed by inbound number.
#[derive(Clone, Default)]
pub struct CacheRegistry {
    inner: Arc<Mutex<HashMap<String, OnCallCache>>>,
}

impl CacheRegistry {
    pub fn insert(&self, cache: OnCallCache) {
        let mut inner = self.inner.lock().expect("cache registry poisoned");
        inner.insert(cache.inbound_number().to_string(), cache);
    }

    pub fn get(&self, inbound_number: &str) -> Option<OnCallCache> {
        let inner = self.inner.lock().expect("cache registry poisoned");
        inner.get(inbound_number).cloned()
    }

    /// Triggers a refresh of every cache, e.g. after overwrite
    /// mutations.
    pub fn trigger_all(&self) {
        let inner = self.inner.lock().expect("cache registry poisoned");
        for cache in inner.values() {
            cache.trigger();
        }
    }
}
