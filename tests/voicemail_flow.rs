mod common;

use anyhow::Result;
use axum::http::StatusCode;
use chrono::Utc;
use common::{acquire_db_lock, body_to_vec, TestApp};
use serde::Deserialize;
use serde_json::json;

use pbxlink::api::{Customer, MailboxWire, VoiceMailWire};
use pbxlink::stores::mailboxes as mailbox_store;
use pbxlink::voicemail::{MailAttachment, MailMessage};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailboxList {
    mailboxes: Vec<MailboxWire>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoiceMailList {
    voicemails: Vec<VoiceMailWire>,
    #[serde(default)]
    customers: Vec<Customer>,
}

fn mailbox_payload(name: &str) -> serde_json::Value {
    json!({
        "mailbox": {
            "displayName": name,
            "config": {
                "host": "imap.example.com:993",
                "folder": "INBOX",
                "user": "voicemail",
                "password": "hunter2",
                "tls": true,
            },
            "pollIntervalSeconds": 300,
            "extractCallerRegexp": r"Caller:\s*(\+?[\d ]+)",
            "extractTargetRegexp": r"Called:\s*(\+?[\d ]+)",
            "notificationSettings": [
                {
                    "name": "morning",
                    "subjectTemplate": "{{ count }} new voicemails",
                    "messageTemplate": "{{ name }} has {{ count }} unseen voicemails",
                    "roleIds": ["support"],
                    "types": ["NOTIFICATION_TYPE_MAIL"],
                    "sendTimes": [{ "hour": 9, "minute": 0, "second": 0 }],
                }
            ],
        }
    })
}

async fn create_mailbox(app: &TestApp, name: &str) -> Result<String> {
    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.VoiceMailService/CreateMailbox",
            &mailbox_payload(name),
            Some("admin"),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let listed = app
        .post_json(
            "/tkd.pbx3cx.v1.VoiceMailService/ListMailboxes",
            &json!({}),
            Some("admin"),
        )
        .await?;
    let body = body_to_vec(listed.into_body()).await?;
    let list: MailboxList = serde_json::from_slice(&body)?;

    let mailbox = list
        .mailboxes
        .iter()
        .find(|mailbox| mailbox.display_name == name)
        .expect("mailbox missing from list");

    Ok(mailbox.id.clone())
}

#[tokio::test]
async fn mailbox_listing_strips_imap_passwords() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    create_mailbox(&app, "Front Desk").await?;

    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.VoiceMailService/ListMailboxes",
            &json!({}),
            Some("admin"),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_to_vec(response.into_body()).await?;
    let list: MailboxList = serde_json::from_slice(&body)?;

    assert_eq!(list.mailboxes.len(), 1);
    assert!(list.mailboxes[0].config.password.is_empty());
    assert_eq!(list.mailboxes[0].notification_settings.len(), 1);
    assert_eq!(list.mailboxes[0].notification_settings[0].name, "morning");

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn duplicate_notification_setting_names_are_rejected() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let mut payload = mailbox_payload("Broken");
    let settings = payload["mailbox"]["notificationSettings"]
        .as_array_mut()
        .unwrap();
    let duplicate = settings[0].clone();
    settings.push(duplicate);

    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.VoiceMailService/CreateMailbox",
            &payload,
            Some("admin"),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn triggered_sync_files_voicemails_from_the_gateway() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let mailbox_id = create_mailbox(&app, "Front Desk").await?;

    app.mail.queue_message(MailMessage {
        uid: 1,
        subject: "New voicemail".into(),
        internal_date: Utc::now(),
        text_parts: vec!["Caller: +43 664 1234567\nCalled: +43 1 999\n".into()],
        html_parts: vec![],
        attachments: vec![MailAttachment {
            file_name: "recording.wav".into(),
            content_type: "application/octet-stream".into(),
            body: b"RIFF....voicemail-bytes".to_vec(),
        }],
    });

    app.manager
        .trigger_sync(mailbox_id.parse().unwrap())
        .await
        .map_err(|err| anyhow::anyhow!("{err}"))?;

    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.VoiceMailService/ListVoiceMails",
            &json!({ "mailbox": mailbox_id, "filter": { "unseen": true } }),
            Some("admin"),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_to_vec(response.into_body()).await?;
    let list: VoiceMailList = serde_json::from_slice(&body)?;

    assert_eq!(list.voicemails.len(), 1);
    let voicemail = &list.voicemails[0];
    assert_eq!(voicemail.subject, "New voicemail");
    assert_eq!(voicemail.number.as_deref(), Some("+43 664 1234567"));
    assert_eq!(voicemail.inbound_number, "+43 1 999");
    assert!(voicemail.seen_time.is_none());
    assert!(voicemail.file_name.ends_with(".wav"));
    assert!(std::path::Path::new(&voicemail.file_name).exists());

    // a second sync must not duplicate the record
    app.manager
        .trigger_sync(mailbox_id.parse().unwrap())
        .await
        .map_err(|err| anyhow::anyhow!("{err}"))?;

    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.VoiceMailService/ListVoiceMails",
            &json!({ "mailbox": mailbox_id }),
            Some("admin"),
        )
        .await?;
    let body = body_to_vec(response.into_body()).await?;
    let list: VoiceMailList = serde_json::from_slice(&body)?;
    assert_eq!(list.voicemails.len(), 1);

    // streaming the recording infers the content type from the path
    let recording = app
        .get(&format!("/voicemails/?id={}", list.voicemails[0].id))
        .await?;
    assert_eq!(recording.status(), StatusCode::OK);
    let content_type = recording
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.contains("audio"), "got {content_type}");
    let bytes = body_to_vec(recording.into_body()).await?;
    assert_eq!(bytes, b"RIFF....voicemail-bytes");

    let missing = app.get("/voicemails/?id=").await?;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let unknown = app
        .get(&format!("/voicemails/?id={}", uuid::Uuid::new_v4()))
        .await?;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn marking_voicemails_seen_is_idempotent() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let mailbox_id = create_mailbox(&app, "Front Desk").await?;
    let mailbox_uuid: uuid::Uuid = mailbox_id.parse().unwrap();

    let voicemail_id = app
        .with_conn(move |conn| {
            let record = mailbox_store::create_voicemail(
                conn,
                pbxlink::models::NewVoiceMail {
                    id: uuid::Uuid::new_v4(),
                    mailbox_id: mailbox_uuid,
                    receive_time: Utc::now(),
                    subject: "hello".into(),
                    message: "body".into(),
                    caller: Some("+43 664 1234567".into()),
                    customer_id: None,
                    file_name: "/tmp/missing.wav".into(),
                    inbound_number: None,
                },
            )?;
            Ok(record.id)
        })
        .await?;

    let mark = |seen: bool| {
        json!({
            "mailbox": mailbox_id,
            "voicemailIds": [voicemail_id.to_string()],
            "seen": seen,
        })
    };

    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.VoiceMailService/MarkVoiceMails",
            &mark(true),
            Some("admin"),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let first_seen = app
        .with_conn(move |conn| Ok(mailbox_store::get_voicemail(conn, voicemail_id)?.seen_time))
        .await?
        .expect("voicemail not marked seen");

    // marking again must not move the seen time
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.VoiceMailService/MarkVoiceMails",
            &mark(true),
            Some("admin"),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let second_seen = app
        .with_conn(move |conn| Ok(mailbox_store::get_voicemail(conn, voicemail_id)?.seen_time))
        .await?
        .expect("voicemail lost its seen time");
    assert_eq!(first_seen, second_seen);

    // and unseen clears it again
    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.VoiceMailService/MarkVoiceMails",
            &mark(false),
            Some("admin"),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let cleared = app
        .with_conn(move |conn| Ok(mailbox_store::get_voicemail(conn, voicemail_id)?.seen_time))
        .await?;
    assert!(cleared.is_none());

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn notification_candidates_respect_the_sent_journal() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let mailbox_id = create_mailbox(&app, "Front Desk").await?;
    let mailbox_uuid: uuid::Uuid = mailbox_id.parse().unwrap();

    let (first, second) = app
        .with_conn(move |conn| {
            let mut insert = |subject: &str| {
                mailbox_store::create_voicemail(
                    conn,
                    pbxlink::models::NewVoiceMail {
                        id: uuid::Uuid::new_v4(),
                        mailbox_id: mailbox_uuid,
                        receive_time: Utc::now(),
                        subject: subject.into(),
                        message: String::new(),
                        caller: Some("+43 664 1234567".into()),
                        customer_id: None,
                        file_name: "/tmp/missing.wav".into(),
                        inbound_number: None,
                    },
                )
            };

            let first = insert("one")?;
            let second = insert("two")?;
            Ok((first.id, second.id))
        })
        .await?;

    let candidates = app
        .with_conn(move |conn| {
            Ok(mailbox_store::find_notification_candidates(
                conn,
                mailbox_uuid,
                "morning",
            )?)
        })
        .await?;
    assert_eq!(candidates.len(), 2);

    // journal both; the unique key also swallows replays
    app.with_conn(move |conn| {
        mailbox_store::mark_notification_sent(conn, mailbox_uuid, "morning", &[first, second])?;
        mailbox_store::mark_notification_sent(conn, mailbox_uuid, "morning", &[first, second])?;
        Ok(())
    })
    .await?;

    let candidates = app
        .with_conn(move |conn| {
            Ok(mailbox_store::find_notification_candidates(
                conn,
                mailbox_uuid,
                "morning",
            )?)
        })
        .await?;
    assert!(candidates.is_empty());

    // a different setting name has its own journal
    let candidates = app
        .with_conn(move |conn| {
            Ok(mailbox_store::find_notification_candidates(
                conn,
                mailbox_uuid,
                "evening",
            )?)
        })
        .await?;
    assert_eq!(candidates.len(), 2);

    // seen voicemails stop being candidates entirely
    app.with_conn(move |conn| {
        mailbox_store::mark_voicemails(conn, true, Some(mailbox_uuid), &[first, second])?;
        Ok(())
    })
    .await?;

    let candidates = app
        .with_conn(move |conn| {
            Ok(mailbox_store::find_notification_candidates(
                conn,
                mailbox_uuid,
                "evening",
            )?)
        })
        .await?;
    assert!(candidates.is_empty());

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn search_matches_subject_and_caller() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let mailbox_id = create_mailbox(&app, "Front Desk").await?;
    let mailbox_uuid: uuid::Uuid = mailbox_id.parse().unwrap();

    app.with_conn(move |conn| {
        mailbox_store::create_voicemail(
            conn,
            pbxlink::models::NewVoiceMail {
                id: uuid::Uuid::new_v4(),
                mailbox_id: mailbox_uuid,
                receive_time: Utc::now(),
                subject: "Callback request".into(),
                message: "please call back".into(),
                caller: Some("+43 664 1234567".into()),
                customer_id: None,
                file_name: "/tmp/one.wav".into(),
                inbound_number: None,
            },
        )?;
        mailbox_store::create_voicemail(
            conn,
            pbxlink::models::NewVoiceMail {
                id: uuid::Uuid::new_v4(),
                mailbox_id: mailbox_uuid,
                receive_time: Utc::now(),
                subject: "Other".into(),
                message: "unrelated".into(),
                caller: Some("+43 1 555".into()),
                customer_id: None,
                file_name: "/tmp/two.wav".into(),
                inbound_number: None,
            },
        )?;
        Ok(())
    })
    .await?;

    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.VoiceMailService/SearchVoiceMails",
            &json!({ "mailbox": mailbox_id, "query": "callback" }),
            Some("admin"),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_to_vec(response.into_body()).await?;
    let list: VoiceMailList = serde_json::from_slice(&body)?;
    assert_eq!(list.voicemails.len(), 1);
    assert_eq!(list.voicemails[0].subject, "Callback request");

    app.cleanup().await?;
    Ok(())
}
