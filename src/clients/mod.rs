use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod customer;
pub mod idm;
pub mod roster;

pub use customer::{CustomerClient, HttpCustomerClient};
pub use idm::{HttpIdentityClient, IdentityClient};
pub use roster::{HttpRosterClient, RosterClient};

/// Issues a connect-style unary request (`POST <base>/<service>/<method>`
/// with a JSON body) and decodes the JSON response.
pub(crate) async fn post_json<T: DeserializeOwned>(
    http: &reqwest::Client,
    base_url: &str,
    path: &str,
    body: &impl Serialize,
) -> Result<T> {
    let url = format!("{}/{}", base_url.trim_end_matches('/'), path);

    let response = http
        .post(&url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("request to {path} failed"))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("request to {path} failed with status {status}: {body}");
    }

    response
        .json()
        .await
        .with_context(|| format!("failed to decode response of {path}"))
}

/// Like [`post_json`] but maps a 404 ("not found") response to `None`
/// instead of an error.
pub(crate) async fn post_json_opt<T: DeserializeOwned>(
    http: &reqwest::Client,
    base_url: &str,
    path: &str,
    body: &impl Serialize,
) -> Result<Option<T>> {
    let url = format!("{}/{}", base_url.trim_end_matches('/'), path);

    let response = http
        .post(&url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("request to {path} failed"))?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("request to {path} failed with status {status}: {body}");
    }

    Ok(Some(response.json().await.with_context(|| {
        format!("failed to decode response of {path}")
    })?))
}
