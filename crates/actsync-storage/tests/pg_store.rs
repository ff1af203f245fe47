//! Integration tests for `PgActivityStore` against a real Postgres.
//!
//! Requirements:
//!   - DATABASE_URL env var (Postgres); the tests skip when it is absent.
//!
//! Every test owns a distinct endpoint id and clears its rows first, so the
//! tests can share one database.

use std::collections::HashSet;

use actsync_core::{ActivityContent, Endpoint, EndpointKind, StoredActivity};
use actsync_storage::{ActivityStore, CacheInvalidation, EndpointSource, PgActivityStore, StoreError};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

async fn connect(endpoint_id: i64) -> Option<(PgActivityStore, PgPool)> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("Skipping: DATABASE_URL not available");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .expect("connect to DATABASE_URL");
    let store = PgActivityStore::new(pool.clone());
    store.migrate().await.expect("migrate");
    sqlx::query("DELETE FROM activities WHERE api_endpoint_id = $1")
        .bind(endpoint_id)
        .execute(&pool)
        .await
        .expect("clear activities");
    sqlx::query("DELETE FROM api_endpoints WHERE id = $1")
        .bind(endpoint_id)
        .execute(&pool)
        .await
        .expect("clear endpoint");
    Some((store, pool))
}

fn endpoint(id: i64) -> Endpoint {
    Endpoint {
        id,
        url: format!("https://ep{id}.example.org/api"),
        token: Some("secret".into()),
        description: format!("Endpoint {id}"),
        area: Some("Lazio".into()),
        kind: Some(EndpointKind::Zone),
    }
}

fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).single().expect("ts")
}

fn row(id: i64, endpoint_id: i64, name: &str, at: DateTime<Utc>) -> StoredActivity {
    StoredActivity {
        id,
        content: ActivityContent {
            level_id: Some(4),
            name: name.to_string(),
            kind: "announcement".into(),
            description: Some("<p>Serata</p>".into()),
            start_date: Some(ts(20)),
            end_date: None,
            rt_type: Some("club".into()),
            rt_visibility: Some("public".into()),
            location: Some("Roma".into()),
            cover_picture: None,
            canceled: false,
            latitude: Some(41.9027835),
            longitude: Some(12.4963655),
            api_endpoint_id: endpoint_id,
        },
        created_at: at,
        updated_at: at,
        deleted_at: None,
    }
}

#[tokio::test]
async fn upsert_updates_content_but_never_created_at() {
    const EP: i64 = 900_001;
    let Some((store, _pool)) = connect(EP).await else {
        return;
    };
    store.register_endpoints(&[endpoint(EP)]).await.expect("register");
    let id = EP * 1000 + 1;

    store.upsert_activities(&[row(id, EP, "Assemblea", ts(1))]).await.expect("insert");
    let mut changed = row(id, EP, "Assemblea straordinaria", ts(5));
    changed.content.location = None;
    changed.content.latitude = None;
    changed.content.longitude = None;
    assert_eq!(store.upsert_activities(&[changed]).await.expect("update"), 1);

    let stored = store.find_active(id).await.expect("find").expect("row");
    assert_eq!(stored.content.name, "Assemblea straordinaria");
    assert_eq!(stored.content.latitude, None);
    assert_eq!(stored.created_at, ts(1));
    assert_eq!(stored.updated_at, ts(5));
}

#[tokio::test]
async fn retire_then_restore_round_trip() {
    const EP: i64 = 900_002;
    let Some((store, _pool)) = connect(EP).await else {
        return;
    };
    store.register_endpoints(&[endpoint(EP)]).await.expect("register");
    let ids = [EP * 1000 + 1, EP * 1000 + 2, EP * 1000 + 3];
    let rows: Vec<_> = ids.iter().map(|id| row(*id, EP, "Cena", ts(1))).collect();
    store.upsert_activities(&rows).await.expect("insert");

    assert_eq!(store.soft_delete(&ids[..2], ts(2)).await.expect("retire"), 2);
    assert_eq!(store.soft_delete(&ids[1..2], ts(3)).await.expect("retire again"), 0);
    assert_eq!(
        store.active_ids_for_endpoint(EP).await.expect("active ids"),
        HashSet::from([ids[2]])
    );
    assert!(store.find_active(ids[0]).await.expect("find").is_none());

    let all = store.find_many_including_retired(&ids).await.expect("find many");
    assert_eq!(all.len(), 3);
    assert_eq!(all[&ids[1]].deleted_at, Some(ts(2)));

    let mut restored = row(ids[0], EP, "Cena", ts(4));
    restored.created_at = ts(4);
    store.upsert_activities(&[restored]).await.expect("restore");

    let back = store.find_active(ids[0]).await.expect("find").expect("restored row");
    assert_eq!(back.deleted_at, None);
    assert_eq!(back.created_at, ts(1));
}

#[tokio::test]
async fn upsert_for_unregistered_endpoint_writes_nothing() {
    const EP: i64 = 900_003;
    const LATE: i64 = 900_013;
    let Some((store, pool)) = connect(EP).await else {
        return;
    };
    sqlx::query("DELETE FROM activities WHERE api_endpoint_id = $1")
        .bind(LATE)
        .execute(&pool)
        .await
        .expect("clear activities");
    sqlx::query("DELETE FROM api_endpoints WHERE id = $1")
        .bind(LATE)
        .execute(&pool)
        .await
        .expect("clear endpoint");
    store.register_endpoints(&[endpoint(EP)]).await.expect("register");

    let batch = [row(EP * 1000 + 1, EP, "A", ts(1)), row(LATE * 1000 + 1, LATE, "B", ts(1))];
    let err = store.upsert_activities(&batch).await.expect_err("missing endpoint");
    assert!(matches!(err, StoreError::Database(_)));
    assert!(store.find_including_retired(EP * 1000 + 1).await.expect("find").is_none());

    store.register_endpoints(&[endpoint(LATE)]).await.expect("register late");
    assert_eq!(store.upsert_activities(&batch).await.expect("upsert"), 2);
}

#[tokio::test]
async fn endpoints_round_trip_and_only_changes_count() {
    const EP: i64 = 900_004;
    let Some((store, _pool)) = connect(EP).await else {
        return;
    };

    assert_eq!(store.register_endpoints(&[endpoint(EP)]).await.expect("register"), 1);
    assert_eq!(store.register_endpoints(&[endpoint(EP)]).await.expect("again"), 0);
    let mut moved = endpoint(EP);
    moved.url = "https://moved.example.org/api".into();
    moved.kind = Some(EndpointKind::Table);
    assert_eq!(store.register_endpoints(&[moved.clone()]).await.expect("moved"), 1);

    let loaded = store.load_endpoints().await.expect("load");
    let found = loaded.iter().find(|e| e.id == EP).expect("registered endpoint");
    assert_eq!(found, &moved);
}

#[tokio::test]
async fn large_batches_are_written_in_one_call() {
    const EP: i64 = 900_005;
    let Some((store, _pool)) = connect(EP).await else {
        return;
    };
    store.register_endpoints(&[endpoint(EP)]).await.expect("register");
    let rows: Vec<_> = (0..2500).map(|n| row(EP * 10_000 + n, EP, "Bulk", ts(1))).collect();

    assert_eq!(store.upsert_activities(&rows).await.expect("upsert"), 2500);
    assert_eq!(store.active_ids_for_endpoint(EP).await.expect("ids").len(), 2500);
}

#[tokio::test]
async fn invalidate_removes_only_the_given_key() {
    const EP: i64 = 900_006;
    let Some((store, pool)) = connect(EP).await else {
        return;
    };
    for key in ["actsync_test_ics", "actsync_test_other"] {
        sqlx::query(
            "INSERT INTO cache_entries (key, value) VALUES ($1, 'cached') \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .execute(&pool)
        .await
        .expect("seed cache");
    }

    store.invalidate("actsync_test_ics").await.expect("invalidate");

    let keys: Vec<String> = sqlx::query_scalar(
        "SELECT key FROM cache_entries WHERE key LIKE 'actsync_test_%' ORDER BY key",
    )
    .fetch_all(&pool)
    .await
    .expect("keys");
    assert_eq!(keys, vec!["actsync_test_other".to_string()]);
}
