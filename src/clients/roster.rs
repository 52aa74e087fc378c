use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::api::WorkingStaff;

const ROSTER_SERVICE: &str = "tkd.roster.v1.RosterService";

#[async_trait]
pub trait RosterClient: Send + Sync + 'static {
    /// Returns the staff working at `at`, scoped by roster type and
    /// shift tags.
    async fn working_staff_at(
        &self,
        at: DateTime<Utc>,
        roster_type_name: &str,
        shift_tags: &[String],
    ) -> Result<WorkingStaff>;
}

pub struct HttpRosterClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRosterClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RosterClient for HttpRosterClient {
    async fn working_staff_at(
        &self,
        at: DateTime<Utc>,
        roster_type_name: &str,
        shift_tags: &[String],
    ) -> Result<WorkingStaff> {
        super::post_json(
            &self.http,
            &self.base_url,
            &format!("{ROSTER_SERVICE}/GetWorkingStaff2"),
            &json!({
                "time": at.to_rfc3339(),
                "rosterTypeName": roster_type_name,
                "shiftTags": shift_tags,
            }),
        )
        .await
    }
}
