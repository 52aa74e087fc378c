use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use chrono::{DateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::Mutex;
use tower::util::ServiceExt;

use pbxlink::api::{
    Customer, Profile, SendNotificationRequest, SendNotificationResponse, WorkingStaff,
};
use pbxlink::clients::{CustomerClient, IdentityClient, RosterClient};
use pbxlink::config::{AppConfig, CdrMode};
use pbxlink::db::{self, PgPool};
use pbxlink::events::EventBus;
use pbxlink::routes::{self, AppContext};
use pbxlink::state::AppState;
use pbxlink::voicemail::{
    ImapConfig, MailGateway, MailMessage, SyncManager, SyncMarker,
};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

#[derive(Default)]
pub struct FakeIdentityClient {
    profiles: std::sync::Mutex<Vec<Profile>>,
    admins: std::sync::Mutex<Vec<Profile>>,
    notifications: std::sync::Mutex<Vec<SendNotificationRequest>>,
}

impl FakeIdentityClient {
    pub fn set_profiles(&self, profiles: Vec<Profile>) {
        *self.profiles.lock().unwrap() = profiles;
    }

    pub fn set_admins(&self, admins: Vec<Profile>) {
        *self.admins.lock().unwrap() = admins;
    }

    pub fn sent_notifications(&self) -> Vec<SendNotificationRequest> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdentityClient for FakeIdentityClient {
    async fn get_user(&self, user_id: &str) -> Result<Profile> {
        self.profiles
            .lock()
            .unwrap()
            .iter()
            .find(|profile| profile.user.id == user_id)
            .cloned()
            .ok_or_else(|| anyhow!("user {user_id} not found"))
    }

    async fn list_users(&self) -> Result<Vec<Profile>> {
        Ok(self.profiles.lock().unwrap().clone())
    }

    async fn list_users_by_role(&self, _role: &str) -> Result<Vec<Profile>> {
        Ok(self.admins.lock().unwrap().clone())
    }

    async fn send_notification(
        &self,
        request: &SendNotificationRequest,
    ) -> Result<SendNotificationResponse> {
        self.notifications.lock().unwrap().push(request.clone());
        Ok(SendNotificationResponse::default())
    }
}

#[derive(Default)]
pub struct FakeRosterClient {
    response: std::sync::Mutex<Option<WorkingStaff>>,
}

impl FakeRosterClient {
    pub fn set_response(&self, staff: Option<WorkingStaff>) {
        *self.response.lock().unwrap() = staff;
    }
}

#[async_trait]
impl RosterClient for FakeRosterClient {
    async fn working_staff_at(
        &self,
        _at: DateTime<Utc>,
        _roster_type_name: &str,
        _shift_tags: &[String],
    ) -> Result<WorkingStaff> {
        match self.response.lock().unwrap().clone() {
            Some(staff) => Ok(staff),
            None => bail!("roster service unavailable"),
        }
    }
}

#[derive(Default)]
pub struct FakeCustomerClient {
    by_phone: std::sync::Mutex<HashMap<String, Customer>>,
    by_id: std::sync::Mutex<HashMap<String, Customer>>,
}

impl FakeCustomerClient {
    #[allow(dead_code)]
    pub fn add_customer(&self, customer: Customer) {
        for number in &customer.phone_numbers {
            self.by_phone
                .lock()
                .unwrap()
                .insert(number.clone(), customer.clone());
        }
        self.by_id
            .lock()
            .unwrap()
            .insert(customer.id.clone(), customer);
    }
}

#[async_trait]
impl CustomerClient for FakeCustomerClient {
    async fn search_by_phone(&self, numbers: &[String]) -> Result<Vec<Customer>> {
        let by_phone = self.by_phone.lock().unwrap();
        Ok(numbers
            .iter()
            .filter_map(|number| by_phone.get(number).cloned())
            .collect())
    }

    async fn search_by_ids(&self, ids: &[String]) -> Result<Vec<Customer>> {
        let by_id = self.by_id.lock().unwrap();
        Ok(ids.iter().filter_map(|id| by_id.get(id).cloned()).collect())
    }
}

/// Hands out the queued messages exactly once, advancing the marker so
/// subsequent polls come back empty.
#[derive(Default)]
pub struct FakeMailGateway {
    queued: std::sync::Mutex<Vec<MailMessage>>,
}

impl FakeMailGateway {
    #[allow(dead_code)]
    pub fn queue_message(&self, message: MailMessage) {
        self.queued.lock().unwrap().push(message);
    }
}

#[async_trait]
impl MailGateway for FakeMailGateway {
    async fn fetch_new(
        &self,
        _config: &ImapConfig,
        marker: &SyncMarker,
    ) -> Result<(Vec<MailMessage>, SyncMarker)> {
        let queued = self.queued.lock().unwrap();

        let fresh: Vec<MailMessage> = queued
            .iter()
            .filter(|message| message.uid > marker.last_uid)
            .cloned()
            .collect();

        let last_uid = fresh
            .iter()
            .map(|message| message.uid)
            .max()
            .unwrap_or(marker.last_uid);

        Ok((
            fresh,
            SyncMarker {
                uid_validity: 1,
                last_uid,
            },
        ))
    }
}

pub struct TestApp {
    pub state: AppState,
    pub manager: Arc<SyncManager>,
    pub idm: Arc<FakeIdentityClient>,
    pub roster: Arc<FakeRosterClient>,
    pub customer: Arc<FakeCustomerClient>,
    pub mail: Arc<FakeMailGateway>,
    router: Router,
    _storage_dir: tempfile::TempDir,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        Self::new_with(|_| {}).await
    }

    pub async fn new_with(customize: impl FnOnce(&mut AppConfig)) -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let storage_dir = tempfile::tempdir().context("failed to create storage dir")?;

        let mut config = AppConfig {
            database_url: database_url.clone(),
            idm_url: "http://idm.invalid".to_string(),
            rosterd_url: "http://rosterd.invalid".to_string(),
            customerd_url: "http://customerd.invalid".to_string(),
            events_service_url: None,
            country: phonenumber::country::AT,
            listen: ":0".to_string(),
            allowed_origins: vec!["*".to_string()],
            roster_type_name: "oncall".to_string(),
            phone_extension_keys: vec!["phoneExtension".to_string()],
            failover_transfer_target: None,
            default_inbound_number: String::new(),
            storage_path: storage_dir.path().to_path_buf(),
            notification_sender_id: "service-account".to_string(),
            cdr_mode: CdrMode::Off,
            cdr_addr: None,
        };
        customize(&mut config);

        let pool = db::init_pool_with_size(&config.database_url, db::DEFAULT_MAX_POOL_SIZE)?;
        prepare_database(&pool).await?;

        let idm = Arc::new(FakeIdentityClient::default());
        let roster = Arc::new(FakeRosterClient::default());
        let customer = Arc::new(FakeCustomerClient::default());
        let mail = Arc::new(FakeMailGateway::default());

        let state = AppState::new(
            pool,
            config,
            idm.clone(),
            roster.clone(),
            customer.clone(),
            mail.clone(),
            EventBus::new(None),
        );

        let manager = Arc::new(SyncManager::new(state.clone()));

        let router = routes::create_router(AppContext {
            state: state.clone(),
            manager: manager.clone(),
        });

        Ok(Self {
            state,
            manager,
            idm,
            roster,
            customer,
            mail,
            router,
            _storage_dir: storage_dir,
        })
    }

    pub async fn cleanup(&self) -> Result<()> {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get cleanup connection: {err}"))?;
            truncate_all(&mut conn)?;
            Ok(())
        })
        .await
        .context("cleanup task panicked")?
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        remote_user: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(user) = remote_user {
            builder = builder.header("x-remote-user-id", user);
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn get(&self, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE notifications_sent, voicemails, sync_states, mailboxes, phone_extensions, inbound_numbers, overwrites, call_logs RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
