use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::api::{Profile, SendNotificationRequest, SendNotificationResponse};

const USER_SERVICE: &str = "tkd.idm.v1.UserService";
const NOTIFY_SERVICE: &str = "tkd.idm.v1.NotifyService";

/// The role whose members receive operational error notices.
pub const SUPERUSER_ROLE: &str = "idm_superuser";

#[async_trait]
pub trait IdentityClient: Send + Sync + 'static {
    async fn get_user(&self, user_id: &str) -> Result<Profile>;

    async fn list_users(&self) -> Result<Vec<Profile>>;

    async fn list_users_by_role(&self, role: &str) -> Result<Vec<Profile>>;

    async fn send_notification(
        &self,
        request: &SendNotificationRequest,
    ) -> Result<SendNotificationResponse>;
}

pub struct HttpIdentityClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpIdentityClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Deserialize)]
struct GetUserResponse {
    #[serde(default)]
    profile: Profile,
}

#[derive(Deserialize)]
struct ListUsersResponse {
    #[serde(default)]
    users: Vec<Profile>,
}

#[async_trait]
impl IdentityClient for HttpIdentityClient {
    async fn get_user(&self, user_id: &str) -> Result<Profile> {
        let response: GetUserResponse = super::post_json(
            &self.http,
            &self.base_url,
            &format!("{USER_SERVICE}/GetUser"),
            &json!({ "id": user_id }),
        )
        .await?;

        Ok(response.profile)
    }

    async fn list_users(&self) -> Result<Vec<Profile>> {
        let response: ListUsersResponse = super::post_json(
            &self.http,
            &self.base_url,
            &format!("{USER_SERVICE}/ListUsers"),
            &json!({}),
        )
        .await?;

        Ok(response.users)
    }

    async fn list_users_by_role(&self, role: &str) -> Result<Vec<Profile>> {
        let response: ListUsersResponse = super::post_json(
            &self.http,
            &self.base_url,
            &format!("{USER_SERVICE}/ListUsers"),
            &json!({ "filterByRoles": [role] }),
        )
        .await?;

        Ok(response.users)
    }

    async fn send_notification(
        &self,
        request: &SendNotificationRequest,
    ) -> Result<SendNotificationResponse> {
        super::post_json(
            &self.http,
            &self.base_url,
            &format!("{NOTIFY_SERVICE}/SendNotification"),
            request,
        )
        .await
    }
}
