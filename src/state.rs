use std::sync::{Arc, Mutex};

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    clients::{CustomerClient, IdentityClient, RosterClient},
    config::AppConfig,
    db::PgPool,
    error::{AppError, AppResult},
    events::EventBus,
    oncall::cache::CacheRegistry,
    voicemail::MailGateway,
};

pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub idm: Arc<dyn IdentityClient>,
    pub roster: Arc<dyn RosterClient>,
    pub customer: Arc<dyn CustomerClient>,
    pub mail: Arc<dyn MailGateway>,
    pub events: EventBus,
    pub caches: CacheRegistry,
    pub error_gate: Arc<ErrorNotifyGate>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        idm: Arc<dyn IdentityClient>,
        roster: Arc<dyn RosterClient>,
        customer: Arc<dyn CustomerClient>,
        mail: Arc<dyn MailGateway>,
        events: EventBus,
    ) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            idm,
            roster,
            customer,
            mail,
            events,
            caches: CacheRegistry::default(),
            error_gate: Arc::new(ErrorNotifyGate::default()),
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}

/// Single-shot latch for the admin error notification: only the first
/// failure after a successful resolve produces a notice. `reset` arms the
/// latch again.
#[derive(Default)]
pub struct ErrorNotifyGate {
    fired: Mutex<bool>,
}

impl ErrorNotifyGate {
    /// Returns true when the caller won the latch and should emit the
    /// notification.
    pub fn acquire(&self) -> bool {
        let mut fired = self.fired.lock().expect("error gate poisoned");
        if *fired {
            false
        } else {
            *fired = true;
            true
        }
    }

    pub fn reset(&self) {
        let mut fired = self.fired.lock().expect("error gate poisoned");
        *fired = false;
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorNotifyGate;

    #[test]
    fn gate_fires_once_until_reset() {
        let gate = ErrorNotifyGate::default();
        assert!(gate.acquire());
        assert!(!gate.acquire());
        gate.reset();
        assert!(gate.acquire());
    }
}
