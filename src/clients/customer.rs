use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::Customer;

const CUSTOMER_SERVICE: &str = "tkd.customer.v1.CustomerService";

#[async_trait]
pub trait CustomerClient: Send + Sync + 'static {
    async fn search_by_phone(&self, numbers: &[String]) -> Result<Vec<Customer>>;

    async fn search_by_ids(&self, ids: &[String]) -> Result<Vec<Customer>>;
}

pub struct HttpCustomerClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCustomerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn search(&self, queries: Vec<Value>) -> Result<Vec<Customer>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let response: Option<SearchCustomerResponse> = super::post_json_opt(
            &self.http,
            &self.base_url,
            &format!("{CUSTOMER_SERVICE}/SearchCustomer"),
            &json!({ "queries": queries }),
        )
        .await?;

        Ok(response
            .map(|r| r.results.into_iter().map(|r| r.customer).collect())
            .unwrap_or_default())
    }
}

#[derive(Deserialize)]
struct SearchCustomerResponse {
    #[serde(default)]
    results: Vec<CustomerResult>,
}

#[derive(Deserialize)]
struct CustomerResult {
    #[serde(default)]
    customer: Customer,
}

#[async_trait]
impl CustomerClient for HttpCustomerClient {
    async fn search_by_phone(&self, numbers: &[String]) -> Result<Vec<Customer>> {
        self.search(
            numbers
                .iter()
                .map(|n| json!({ "phoneNumber": n }))
                .collect(),
        )
        .await
    }

    async fn search_by_ids(&self, ids: &[String]) -> Result<Vec<Customer>> {
        self.search(ids.iter().map(|id| json!({ "id": id })).collect())
            .await
    }
}
