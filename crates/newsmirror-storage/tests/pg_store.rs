#![cfg(feature = "postgres-tests")]
//! SQL-level checks against a real Postgres named by `DATABASE_URL`:
//! `cargo test -p newsmirror-storage --features postgres-tests`.

use chrono::{DateTime, TimeZone, Utc};
use newsmirror_core::{
    FieldAssignment, Filter, ListQuery, NewRecord, OrderBy, OrganizationalUnit, RecordPatch,
    SyncTarget, Topic, TopicCodes,
};
use newsmirror_storage::{PgStore, RecordStore};
use sqlx::PgPool;

fn day(month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, month, day, 9, 0, 0).single().unwrap()
}

fn record(unique_id: &str, published_day: u32, topic: &str) -> NewRecord {
    NewRecord {
        unique_id: unique_id.into(),
        org_unit_key: "mec".into(),
        topics: TopicCodes {
            l1: Some(topic.into()),
            ..TopicCodes::default()
        },
        title: format!("Notícia {unique_id}"),
        url: Some(format!("https://www.gov.br/mec/{unique_id}")),
        image_url: None,
        video_url: None,
        category: Some("Notícias".into()),
        tags: vec!["educacao".into()],
        body: Some("Corpo".into()),
        editorial_lead: None,
        subtitle: None,
        summary: None,
        published_at: day(3, published_day),
        source_updated_at: None,
        extracted_at: None,
    }
}

async fn seeded(pool: &PgPool) -> PgStore {
    let topic = |code: &str, label: &str| Topic {
        id: 0,
        code: code.into(),
        label: label.into(),
        level: 1,
        parent_code: None,
    };
    let store = PgStore::from_pool(pool.clone());
    store
        .seed_reference(
            &[OrganizationalUnit {
                id: 0,
                key: "mec".into(),
                name: "Ministério da Educação".into(),
                unit_type: Some("ministerio".into()),
                parent_key: None,
            }],
            &[topic("01", "Educação"), topic("02", "Saúde")],
        )
        .await
        .unwrap();
    store
}

async fn set_updated_at(pool: &PgPool, unique_id: &str, at: DateTime<Utc>) {
    sqlx::query("UPDATE record SET updated_at = $1 WHERE unique_id = $2")
        .bind(at)
        .bind(unique_id)
        .execute(pool)
        .await
        .unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn insert_skips_or_overwrites_existing_rows(pool: PgPool) {
    let store = seeded(&pool).await;
    let mut batch = vec![record("a", 1, "01"), record("b", 2, "01"), record("c", 3, "02")];

    let first = store.insert(&batch, false).await.unwrap();
    assert_eq!((first.written, first.skipped), (3, 0));
    let before = store.get_by_unique_id("b").await.unwrap().unwrap();

    batch[1].summary = Some("Resumo".into());
    let again = store.insert(&batch, false).await.unwrap();
    assert_eq!((again.written, again.skipped), (0, 3));
    let untouched = store.get_by_unique_id("b").await.unwrap().unwrap();
    assert_eq!(untouched.summary, None);
    assert_eq!(untouched.updated_at, before.updated_at);

    let overwrite = store.insert(&batch, true).await.unwrap();
    assert_eq!((overwrite.written, overwrite.skipped), (3, 0));
    let after = store.get_by_unique_id("b").await.unwrap().unwrap();
    assert_eq!(after.summary.as_deref(), Some("Resumo"));
    assert_eq!(after.created_at, before.created_at);
    assert!(after.updated_at >= before.updated_at);
    assert_eq!(store.count(&[]).await.unwrap(), 3);
}

#[sqlx::test(migrations = "./migrations")]
async fn pending_rows_page_by_published_at_then_unique_id(pool: PgPool) {
    let store = seeded(&pool).await;
    let batch = vec![
        record("d", 4, "01"),
        record("b", 2, "01"),
        record("a", 2, "01"),
        record("c", 3, "01"),
    ];
    store.insert(&batch, false).await.unwrap();

    let first = store.pending_sync(SyncTarget::SearchIndex, None, 2).await.unwrap();
    let ids: Vec<&str> = first.iter().map(|r| r.unique_id.as_str()).collect();
    assert_eq!(ids, ["a", "b"]);

    let cursor = first[1].pending_cursor();
    let rest = store
        .pending_sync(SyncTarget::SearchIndex, Some(&cursor), 10)
        .await
        .unwrap();
    let ids: Vec<&str> = rest.iter().map(|r| r.unique_id.as_str()).collect();
    assert_eq!(ids, ["c", "d"]);

    let versions: Vec<_> = first.iter().map(|r| r.synced_version()).collect();
    assert_eq!(
        store.mark_synced(SyncTarget::SearchIndex, &versions).await.unwrap(),
        2
    );
    assert_eq!(store.count_pending(SyncTarget::SearchIndex).await.unwrap(), 2);
    assert_eq!(store.count_pending(SyncTarget::Mirror).await.unwrap(), 4);
    let fresh = store.pending_sync(SyncTarget::SearchIndex, None, 10).await.unwrap();
    assert_eq!(fresh.len(), 2);
    assert_eq!(fresh[0].unique_id, "c");
}

#[sqlx::test(migrations = "./migrations")]
async fn filters_resolve_topic_codes_and_units(pool: PgPool) {
    let store = seeded(&pool).await;
    let batch = vec![record("a", 1, "01"), record("b", 2, "02"), record("c", 3, "01")];
    store.insert(&batch, false).await.unwrap();

    let educacao = ListQuery::new(10).filter(Filter::TopicL1("01".into()));
    let ids: Vec<String> = store
        .list(&educacao)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.unique_id)
        .collect();
    assert_eq!(ids, ["c", "a"]);

    let oldest_first = ListQuery {
        order_by: OrderBy::PublishedAtAsc,
        ..ListQuery::new(1)
    };
    assert_eq!(store.list(&oldest_first).await.unwrap()[0].unique_id, "a");

    assert_eq!(store.count(&[Filter::TopicL1("02".into())]).await.unwrap(), 1);
    assert_eq!(store.count(&[Filter::TopicL1("99".into())]).await.unwrap(), 0);
    assert_eq!(
        store
            .count(&[Filter::OrgUnitKey("mec".into()), Filter::TopicL1("01".into())])
            .await
            .unwrap(),
        2
    );
    assert_eq!(store.count(&[Filter::OrgUnitKey("mds".into())]).await.unwrap(), 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn mark_synced_skips_rewritten_rows_and_keeps_the_highest_watermark(pool: PgPool) {
    let store = seeded(&pool).await;
    store
        .insert(&[record("a", 1, "01"), record("b", 2, "01")], false)
        .await
        .unwrap();
    let (t1, t2) = (day(1, 10), day(2, 10));
    set_updated_at(&pool, "a", t1).await;
    set_updated_at(&pool, "b", t2).await;
    let read = store.pending_sync(SyncTarget::SearchIndex, None, 10).await.unwrap();
    let versions: Vec<_> = read.iter().map(|r| r.synced_version()).collect();

    let patch = RecordPatch::new(vec![FieldAssignment::Summary(Some("novo".into()))]).unwrap();
    assert!(store.update("a", &patch).await.unwrap());

    assert_eq!(store.mark_synced(SyncTarget::SearchIndex, &versions).await.unwrap(), 1);
    let cursor = store.sync_cursor(SyncTarget::SearchIndex).await.unwrap().unwrap();
    assert_eq!(cursor.watermark, t2);
    assert_eq!(cursor.last_unique_id.as_deref(), Some("b"));
    assert_eq!(cursor.records_confirmed, 1);
    let pending = store.pending_sync(SyncTarget::SearchIndex, None, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].unique_id, "a");

    // An older version stamped later must not pull the watermark back.
    set_updated_at(&pool, "b", t1).await;
    let b = store.get_by_unique_id("b").await.unwrap().unwrap();
    assert_eq!(
        store
            .mark_synced(SyncTarget::SearchIndex, &[b.synced_version()])
            .await
            .unwrap(),
        1
    );
    let cursor = store.sync_cursor(SyncTarget::SearchIndex).await.unwrap().unwrap();
    assert_eq!(cursor.watermark, t2);
    assert_eq!(cursor.records_confirmed, 2);

    // Nothing stamped leaves the cursor alone.
    assert_eq!(store.mark_synced(SyncTarget::SearchIndex, &versions).await.unwrap(), 0);
    let cursor = store.sync_cursor(SyncTarget::SearchIndex).await.unwrap().unwrap();
    assert_eq!(cursor.records_confirmed, 2);
    assert!(store.sync_cursor(SyncTarget::Mirror).await.unwrap().is_none());
}

#[sqlx::test(migrations = "./migrations")]
async fn resync_rewrites_stale_unit_names_and_requeues_rows(pool: PgPool) {
    let store = seeded(&pool).await;
    store.insert(&[record("a", 1, "01")], false).await.unwrap();
    let read = store.pending_sync(SyncTarget::Mirror, None, 10).await.unwrap();
    let versions: Vec<_> = read.iter().map(|r| r.synced_version()).collect();
    store.mark_synced(SyncTarget::Mirror, &versions).await.unwrap();
    assert_eq!(store.count_pending(SyncTarget::Mirror).await.unwrap(), 0);

    sqlx::query("UPDATE organizational_unit SET name = 'MEC' WHERE key = 'mec'")
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(store.resync_denormalized().await.unwrap(), 1);
    assert_eq!(store.resync_denormalized().await.unwrap(), 0);

    let row = store.get_by_unique_id("a").await.unwrap().unwrap();
    assert_eq!(row.org_unit.name, "MEC");
    assert_eq!(store.count_pending(SyncTarget::Mirror).await.unwrap(), 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn copy_records_keeps_source_timestamps_and_sync_stamps(pool: PgPool) {
    let store = seeded(&pool).await;
    store.insert(&[record("a", 1, "01")], false).await.unwrap();
    let local = store.get_by_unique_id("a").await.unwrap().unwrap();
    store
        .mark_synced(SyncTarget::SearchIndex, &[local.synced_version()])
        .await
        .unwrap();

    let mut source = local.clone();
    source.summary = Some("copiado".into());
    source.created_at = day(1, 1);
    source.updated_at = day(1, 2);
    let mut missing = source.clone();
    missing.unique_id = "z".into();
    assert_eq!(store.copy_records(&[source, missing]).await.unwrap(), 2);

    let copied = store.get_by_unique_id("a").await.unwrap().unwrap();
    assert_eq!(copied.summary.as_deref(), Some("copiado"));
    assert_eq!(copied.created_at, day(1, 1));
    assert_eq!(copied.updated_at, day(1, 2));
    assert_eq!(copied.last_synced_to_index, Some(local.updated_at));

    let fresh = store.get_by_unique_id("z").await.unwrap().unwrap();
    assert_eq!(fresh.updated_at, day(1, 2));
    assert_eq!(fresh.last_synced_to_index, None);
}
