mod common;

use anyhow::Result;
use axum::http::StatusCode;
use chrono::{Duration, TimeZone, Utc};
use common::{acquire_db_lock, body_to_vec, TestApp};
use serde::Deserialize;
use serde_json::json;

use pbxlink::api::{
    GetOnCallResponse, PhoneNumber, PlannedShift, Profile, UserInfo, WorkingStaff,
};
use pbxlink::events;
use pbxlink::models::InboundNumber;
use pbxlink::oncall::OnCallCache;
use pbxlink::stores::overwrites;

fn profile(id: &str, extension: Option<&str>, primary: Option<&str>) -> Profile {
    Profile {
        user: UserInfo {
            id: id.to_string(),
            username: format!("user-{id}"),
            display_name: String::new(),
            primary_phone_number: primary.map(|number| PhoneNumber {
                number: number.to_string(),
            }),
            extra: extension.map(|ext| json!({ "phoneExtension": ext })),
        },
    }
}

#[derive(Deserialize)]
struct OverwriteEnvelope {
    overwrite: OverwriteInfo,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OverwriteInfo {
    id: String,
}

#[tokio::test]
async fn overlapping_overwrites_resolve_to_latest_created() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.idm
        .set_profiles(vec![profile("userA", Some("+43 1 2345"), None)]);

    let day = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();

    let first = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/CreateOverwrite",
            &json!({
                "from": day + Duration::hours(10),
                "to": day + Duration::hours(12),
                "userId": "userA",
            }),
            Some("admin"),
        )
        .await?;
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/CreateOverwrite",
            &json!({
                "from": day + Duration::hours(11),
                "to": day + Duration::minutes(11 * 60 + 30),
                "custom": { "displayName": "Doc", "transferTarget": "+43 100" },
            }),
            Some("admin"),
        )
        .await?;
    assert_eq!(second.status(), StatusCode::OK);

    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/GetOnCall",
            &json!({ "date": (day + Duration::minutes(11 * 60 + 15)).to_rfc3339() }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_to_vec(response.into_body()).await?;
    let parsed: GetOnCallResponse = serde_json::from_slice(&body)?;

    assert!(parsed.is_overwrite);
    assert_eq!(parsed.primary_transfer_target, "+43100");
    assert_eq!(parsed.on_call.len(), 1);
    assert_eq!(
        parsed.on_call[0].until,
        Some(day + Duration::minutes(11 * 60 + 30))
    );

    // outside the narrower overwrite the older one wins again
    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/GetOnCall",
            &json!({ "date": (day + Duration::minutes(10 * 60 + 30)).to_rfc3339() }),
            None,
        )
        .await?;
    let body = body_to_vec(response.into_body()).await?;
    let parsed: GetOnCallResponse = serde_json::from_slice(&body)?;
    assert_eq!(parsed.primary_transfer_target, "+4312345");

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn rejects_overwrites_without_a_dialable_target() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let now = Utc::now();

    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/CreateOverwrite",
            &json!({
                "from": now,
                "to": now + Duration::hours(1),
                "custom": { "displayName": "Doc", "transferTarget": "not-a-number" },
            }),
            Some("admin"),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // a missing remote user is an internal error
    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/CreateOverwrite",
            &json!({
                "from": now,
                "to": now + Duration::hours(1),
                "custom": { "displayName": "Doc", "transferTarget": "+43100" },
            }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn failover_is_returned_when_the_resolver_fails() -> Result<()> {
    let _lock = acquire_db_lock().await;

    // roster fails by default (no response configured) and no overwrite
    // exists; configure a failover target
    let app = TestApp::new_with(|config| {
        config.failover_transfer_target = Some("+43555".to_string());
    })
    .await?;

    app.idm.set_admins(vec![profile("admin1", None, None)]);

    let response = app
        .post_json("/tkd.pbx3cx.v1.CallService/GetOnCall", &json!({}), Some("pbx"))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_to_vec(response.into_body()).await?;
    let parsed: GetOnCallResponse = serde_json::from_slice(&body)?;

    assert_eq!(parsed.primary_transfer_target, "+43555");
    assert!(parsed.on_call.is_empty());
    assert!(!parsed.is_overwrite);

    // the admin notice is rate-limited to a single emission per failure
    // streak
    let _ = app
        .post_json("/tkd.pbx3cx.v1.CallService/GetOnCall", &json!({}), Some("pbx"))
        .await?;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(app.idm.sent_notifications().len(), 1);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn roster_staff_build_the_on_call_list() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let shift_end = Utc::now() + Duration::hours(4);

    app.idm.set_profiles(vec![
        profile("u1", Some("21"), None),
        profile("u2", None, Some("+43 664 7654321")),
        profile("u3", None, None),
    ]);
    app.roster.set_response(Some(WorkingStaff {
        user_ids: vec!["u1".into(), "u2".into(), "u3".into()],
        roster_id: vec![],
        current_shifts: vec![PlannedShift {
            assigned_user_ids: vec!["u1".into(), "u2".into()],
            from: None,
            to: Some(shift_end),
        }],
        roster_date: Some("2026-03-02".into()),
    }));

    let response = app
        .post_json("/tkd.pbx3cx.v1.CallService/GetOnCall", &json!({}), None)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_to_vec(response.into_body()).await?;
    let parsed: GetOnCallResponse = serde_json::from_slice(&body)?;

    // u3 has no transfer target and is dropped
    assert_eq!(parsed.on_call.len(), 2);
    assert_eq!(parsed.primary_transfer_target, "21");
    assert_eq!(parsed.on_call[0].until, Some(shift_end));
    assert_eq!(parsed.on_call[1].transfer_target, "+43 664 7654321");
    assert_eq!(parsed.roster_date.as_deref(), Some("2026-03-02"));

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn deleting_the_active_overwrite_restores_the_roster_path() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.idm.set_profiles(vec![profile("u1", Some("21"), None)]);
    app.roster.set_response(Some(WorkingStaff {
        user_ids: vec!["u1".into()],
        ..Default::default()
    }));

    let day = Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap();
    let at = day + Duration::hours(9);

    let created = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/CreateOverwrite",
            &json!({
                "from": day + Duration::hours(8),
                "to": day + Duration::hours(18),
                "custom": { "displayName": "Doc", "transferTarget": "+43100" },
            }),
            Some("admin"),
        )
        .await?;
    assert_eq!(created.status(), StatusCode::OK);
    let body = body_to_vec(created.into_body()).await?;
    let envelope: OverwriteEnvelope = serde_json::from_slice(&body)?;
    assert!(!envelope.overwrite.id.is_empty());

    let deleted = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/DeleteOverwrite",
            &json!({ "activeAt": at }),
            Some("admin"),
        )
        .await?;
    assert_eq!(deleted.status(), StatusCode::OK);

    // soft-delete is monotonic: deleting again reports not-found
    let again = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/DeleteOverwrite",
            &json!({ "overwriteId": envelope.overwrite.id }),
            Some("admin"),
        )
        .await?;
    assert_eq!(again.status(), StatusCode::NOT_FOUND);

    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/GetOnCall",
            &json!({ "date": at.to_rfc3339() }),
            None,
        )
        .await?;
    let body = body_to_vec(response.into_body()).await?;
    let parsed: GetOnCallResponse = serde_json::from_slice(&body)?;

    assert!(!parsed.is_overwrite);
    assert_eq!(parsed.primary_transfer_target, "21");

    // the journal still knows the deleted entry by id
    let stored = app
        .with_conn(move |conn| {
            let id = envelope.overwrite.id.parse()?;
            Ok(overwrites::get(conn, id)?)
        })
        .await?;
    assert!(stored.deleted);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn cache_refreshes_on_roster_events_and_publishes_changes() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.idm.set_profiles(vec![
        profile("u1", Some("21"), None),
        profile("u2", Some("22"), None),
    ]);
    app.roster.set_response(Some(WorkingStaff {
        user_ids: vec!["u1".into()],
        ..Default::default()
    }));

    app.with_conn(|conn| {
        overwrites::create_inbound_number(
            conn,
            &InboundNumber {
                number: "+431999".into(),
                display_name: "Front desk".into(),
                roster_type_name: None,
                roster_shift_tags: vec![],
                result_limit: 0,
            },
        )?;
        Ok(())
    })
    .await?;

    let mut changes = app.state.events.subscribe(events::ON_CALL_CHANGE);

    let cancel = tokio_util::sync::CancellationToken::new();
    let cache = OnCallCache::spawn(app.state.clone(), "+431999".into(), cancel.clone());
    app.state.caches.insert(cache.clone());

    // initial refresh populates the snapshot and publishes one change
    let event = tokio::time::timeout(std::time::Duration::from_secs(5), changes.recv())
        .await?
        .expect("missing initial on-call change event");
    assert_eq!(event.payload["inboundNumber"], "+431999");
    assert_eq!(event.payload["primaryTransferTarget"], "21");
    assert!(event.retained);

    let cached = cache.current().await.expect("cache not populated");
    assert_eq!(cached.primary_transfer_target, "21");

    // a roster change event with a different primary triggers a refresh
    // and a second change event
    app.roster.set_response(Some(WorkingStaff {
        user_ids: vec!["u2".into()],
        ..Default::default()
    }));
    app.state.events.publish(events::ROSTER_CHANGED, &json!({}), false);

    let event = tokio::time::timeout(std::time::Duration::from_secs(5), changes.recv())
        .await?
        .expect("missing on-call change event after roster event");
    assert_eq!(event.payload["primaryTransferTarget"], "22");

    cancel.cancel();
    app.cleanup().await?;
    Ok(())
}
