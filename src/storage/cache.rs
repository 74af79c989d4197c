use anyhow::Result;
use sqlx::QueryBuilder;
use std::collections::HashSet;

use super::schema::Database;
use super::types::{CacheFilter, CacheRecord, CategoryCount, FeedItem, UpsertOutcome};

/// Maximum number of rows to return from any single browse query (OOM protection)
const MAX_LIST_LIMIT: i64 = 2000;

/// Default page size for browse queries
const DEFAULT_LIST_LIMIT: i64 = 100;

const RECORD_COLUMNS: &str = "external_id, title, description, category, quality_score, thumb_url, \
     game_url, width, height, orientation, published_at, modified_at, first_seen_at, \
     last_sync_at, is_imported, import_count, last_imported_at";

impl Database {
    // ========================================================================
    // Page Persistence
    // ========================================================================

    /// Persist one fetched page, returning how many rows were created and
    /// how many existing rows were refreshed.
    ///
    /// Two statements inside one transaction, regardless of page size:
    ///
    /// 1. `INSERT OR IGNORE ... RETURNING external_id` creates the rows that
    ///    are new and reports exactly which ones they were.
    /// 2. A single `UPDATE ... FROM` over a bound `VALUES` list refreshes every
    ///    feed attribute and `last_sync_at` for the rows that already existed.
    ///
    /// Import bookkeeping (`is_imported`, `import_count`, `last_imported_at`)
    /// and `first_seen_at` are never touched here.
    ///
    /// Items are expected to carry distinct `external_id`s; the feed parser
    /// drops in-page duplicates before they reach this point.
    pub async fn upsert_page(&self, items: &[FeedItem], now: i64) -> Result<UpsertOutcome> {
        if items.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let mut tx = self.pool.begin().await?;

        // Phase 1: insert new rows only
        let mut insert_builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "INSERT OR IGNORE INTO cached_games (external_id, title, description, category, \
             quality_score, thumb_url, game_url, width, height, orientation, published_at, \
             modified_at, first_seen_at, last_sync_at) ",
        );
        insert_builder.push_values(items, |mut b, item| {
            b.push_bind(&item.external_id)
                .push_bind(&item.title)
                .push_bind(&item.description)
                .push_bind(&item.category)
                .push_bind(item.quality_score)
                .push_bind(&item.thumb_url)
                .push_bind(&item.game_url)
                .push_bind(item.width)
                .push_bind(item.height)
                .push_bind(&item.orientation)
                .push_bind(item.published_at)
                .push_bind(item.modified_at)
                .push_bind(now)
                .push_bind(now);
        });
        insert_builder.push(" RETURNING external_id");

        let inserted: Vec<(String,)> = insert_builder
            .build_query_as()
            .fetch_all(&mut *tx)
            .await?;
        let inserted: HashSet<String> = inserted.into_iter().map(|(id,)| id).collect();

        // Phase 2: refresh the rows that were already present
        let existing: Vec<&FeedItem> = items
            .iter()
            .filter(|item| !inserted.contains(&item.external_id))
            .collect();

        if !existing.is_empty() {
            let mut update_builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "WITH incoming(external_id, title, description, category, quality_score, \
                 thumb_url, game_url, width, height, orientation, published_at, modified_at) AS (",
            );
            update_builder.push_values(existing.iter(), |mut b, item| {
                b.push_bind(&item.external_id)
                    .push_bind(&item.title)
                    .push_bind(&item.description)
                    .push_bind(&item.category)
                    .push_bind(item.quality_score)
                    .push_bind(&item.thumb_url)
                    .push_bind(&item.game_url)
                    .push_bind(item.width)
                    .push_bind(item.height)
                    .push_bind(&item.orientation)
                    .push_bind(item.published_at)
                    .push_bind(item.modified_at);
            });
            update_builder.push(
                ") UPDATE cached_games SET \
                 title = incoming.title, \
                 description = incoming.description, \
                 category = incoming.category, \
                 quality_score = incoming.quality_score, \
                 thumb_url = incoming.thumb_url, \
                 game_url = incoming.game_url, \
                 width = incoming.width, \
                 height = incoming.height, \
                 orientation = incoming.orientation, \
                 published_at = incoming.published_at, \
                 modified_at = incoming.modified_at, \
                 last_sync_at = ",
            );
            update_builder.push_bind(now);
            update_builder
                .push(" FROM incoming WHERE cached_games.external_id = incoming.external_id");

            update_builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        Ok(UpsertOutcome {
            inserted: inserted.len(),
            updated: existing.len(),
        })
    }

    // ========================================================================
    // Import Bookkeeping
    // ========================================================================

    /// Mark cache rows as promoted into the primary catalog.
    ///
    /// `import_count` only increases on the first transition to imported;
    /// re-marking an already imported row just refreshes `last_imported_at`.
    /// Returns the number of rows touched.
    pub async fn mark_imported(&self, external_ids: &[String], now: i64) -> Result<u64> {
        if external_ids.is_empty() {
            return Ok(0);
        }

        // SET expressions read the pre-update row, so the CASE sees the old flag
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "UPDATE cached_games SET \
             import_count = import_count + CASE WHEN is_imported = 0 THEN 1 ELSE 0 END, \
             is_imported = 1, \
             last_imported_at = ",
        );
        builder.push_bind(now);
        builder.push(" WHERE external_id IN (");
        let mut separated = builder.separated(", ");
        for id in external_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Cache Queries
    // ========================================================================

    /// Number of rows currently mirrored.
    pub async fn count_cached(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cached_games")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Look up one mirrored item by its feed id.
    pub async fn get_cached(&self, external_id: &str) -> Result<Option<CacheRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM cached_games WHERE external_id = ?");
        let row = sqlx::query_as::<_, CacheRecord>(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Browse the cache with operator filters, newest published first.
    ///
    /// Limit defaults to 100 and is capped at 2000.
    pub async fn list_cached(&self, filter: &CacheFilter) -> Result<Vec<CacheRecord>> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        let offset = filter.offset.unwrap_or(0).max(0);

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {RECORD_COLUMNS} FROM cached_games WHERE 1 = 1"));

        if let Some(category) = &filter.category {
            builder.push(" AND category = ");
            builder.push_bind(category);
        }
        if let Some(imported) = filter.imported {
            builder.push(" AND is_imported = ");
            builder.push_bind(imported);
        }
        if let Some(orientation) = &filter.orientation {
            builder.push(" AND orientation = ");
            builder.push_bind(orientation);
        }
        if let Some(search) = filter.search.as_deref().map(str::trim) {
            if !search.is_empty() {
                builder.push(" AND title LIKE ");
                builder.push_bind(format!("%{}%", escape_like(search)));
                builder.push(" ESCAPE '\\'");
            }
        }

        builder.push(" ORDER BY published_at IS NULL, published_at DESC, external_id LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let rows: Vec<CacheRecord> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    /// Distinct categories in the cache with their row counts, largest first.
    pub async fn cache_categories(&self) -> Result<Vec<CategoryCount>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT category, COUNT(*) AS n
            FROM cached_games
            WHERE category IS NOT NULL AND category != ''
            GROUP BY category
            ORDER BY n DESC, category
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(category, count)| CategoryCount { category, count })
            .collect())
    }
}

/// Escape LIKE wildcards so operator input matches literally.
fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::escape_like;
    use crate::storage::{CacheFilter, Database, FeedItem};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn test_item(id: &str, title: &str) -> FeedItem {
        FeedItem {
            external_id: id.to_string(),
            title: title.to_string(),
            description: Some("A game".to_string()),
            category: Some("Puzzle".to_string()),
            quality_score: Some(0.8),
            thumb_url: Some(format!("https://img.example.com/{id}.jpg")),
            game_url: Some(format!("https://play.example.com/{id}/")),
            width: Some(800),
            height: Some(600),
            orientation: Some("landscape".to_string()),
            published_at: Some(1_700_000_000),
            modified_at: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_page_inserts_new_rows() {
        let db = test_db().await;
        let outcome = db
            .upsert_page(&[test_item("a", "Alpha"), test_item("b", "Beta")], 100)
            .await
            .unwrap();

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.updated, 0);
        assert_eq!(db.count_cached().await.unwrap(), 2);

        let row = db.get_cached("a").await.unwrap().unwrap();
        assert_eq!(row.title, "Alpha");
        assert_eq!(row.first_seen_at, 100);
        assert_eq!(row.last_sync_at, 100);
        assert!(!row.is_imported);
        assert_eq!(row.import_count, 0);
    }

    #[tokio::test]
    async fn test_upsert_page_updates_existing_rows() {
        let db = test_db().await;
        db.upsert_page(&[test_item("a", "Alpha")], 100).await.unwrap();

        let mut changed = test_item("a", "Alpha Remastered");
        changed.quality_score = Some(0.95);
        changed.category = None;
        let outcome = db
            .upsert_page(&[changed, test_item("b", "Beta")], 200)
            .await
            .unwrap();

        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.updated, 1);

        let row = db.get_cached("a").await.unwrap().unwrap();
        assert_eq!(row.title, "Alpha Remastered");
        assert_eq!(row.quality_score, Some(0.95));
        assert_eq!(row.category, None);
        assert_eq!(row.first_seen_at, 100);
        assert_eq!(row.last_sync_at, 200);
    }

    #[tokio::test]
    async fn test_upsert_same_page_twice_reports_no_new_rows() {
        let db = test_db().await;
        let page = vec![test_item("a", "Alpha"), test_item("b", "Beta")];
        db.upsert_page(&page, 100).await.unwrap();

        let outcome = db.upsert_page(&page, 101).await.unwrap();
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.updated, 2);
        assert_eq!(db.count_cached().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_upsert_treats_sql_metacharacters_as_data() {
        let db = test_db().await;
        let item = test_item("x'); DROP TABLE cached_games; --", "O'Brien's \"Quest\"");
        db.upsert_page(&[item.clone()], 1).await.unwrap();
        db.upsert_page(&[item.clone()], 2).await.unwrap();

        let row = db.get_cached(&item.external_id).await.unwrap().unwrap();
        assert_eq!(row.title, "O'Brien's \"Quest\"");
        assert_eq!(db.count_cached().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_preserves_import_state() {
        let db = test_db().await;
        db.upsert_page(&[test_item("a", "Alpha")], 100).await.unwrap();
        db.mark_imported(&["a".to_string()], 150).await.unwrap();

        db.upsert_page(&[test_item("a", "Alpha")], 200).await.unwrap();

        let row = db.get_cached("a").await.unwrap().unwrap();
        assert!(row.is_imported);
        assert_eq!(row.import_count, 1);
        assert_eq!(row.last_imported_at, Some(150));
    }

    #[tokio::test]
    async fn test_upsert_empty_page() {
        let db = test_db().await;
        let outcome = db.upsert_page(&[], 1).await.unwrap();
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.updated, 0);
    }

    #[tokio::test]
    async fn test_mark_imported_counts_first_transition_only() {
        let db = test_db().await;
        db.upsert_page(&[test_item("a", "Alpha")], 100).await.unwrap();

        let ids = vec!["a".to_string(), "missing".to_string()];
        assert_eq!(db.mark_imported(&ids, 110).await.unwrap(), 1);
        assert_eq!(db.mark_imported(&ids, 120).await.unwrap(), 1);

        let row = db.get_cached("a").await.unwrap().unwrap();
        assert!(row.is_imported);
        assert_eq!(row.import_count, 1);
        assert_eq!(row.last_imported_at, Some(120));
    }

    #[tokio::test]
    async fn test_mark_imported_empty_is_noop() {
        let db = test_db().await;
        assert_eq!(db.mark_imported(&[], 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_cached_filters() {
        let db = test_db().await;
        let mut racer = test_item("r", "Turbo Racer");
        racer.category = Some("Racing".to_string());
        racer.published_at = Some(1_800_000_000);
        let mut portrait = test_item("p", "Tiny Tower");
        portrait.orientation = Some("portrait".to_string());
        db.upsert_page(&[test_item("a", "Alpha"), racer, portrait], 1)
            .await
            .unwrap();
        db.mark_imported(&["a".to_string()], 2).await.unwrap();

        let all = db.list_cached(&CacheFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].external_id, "r"); // newest published first

        let racing = db
            .list_cached(&CacheFilter {
                category: Some("Racing".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(racing.len(), 1);

        let not_imported = db
            .list_cached(&CacheFilter {
                imported: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(not_imported.len(), 2);

        let search = db
            .list_cached(&CacheFilter {
                search: Some("tower".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(search.len(), 1);
        assert_eq!(search[0].external_id, "p");

        let portrait_only = db
            .list_cached(&CacheFilter {
                orientation: Some("portrait".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(portrait_only.len(), 1);

        let paged = db
            .list_cached(&CacheFilter {
                limit: Some(1),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
    }

    #[tokio::test]
    async fn test_list_cached_search_wildcards_are_literal() {
        let db = test_db().await;
        db.upsert_page(&[test_item("a", "100% Fun"), test_item("b", "1000 Fun")], 1)
            .await
            .unwrap();

        let rows = db
            .list_cached(&CacheFilter {
                search: Some("100%".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].external_id, "a");
    }

    #[tokio::test]
    async fn test_cache_categories() {
        let db = test_db().await;
        let mut racer = test_item("r", "Racer");
        racer.category = Some("Racing".to_string());
        db.upsert_page(&[test_item("a", "A"), test_item("b", "B"), racer], 1)
            .await
            .unwrap();

        let cats = db.cache_categories().await.unwrap();
        assert_eq!(cats.len(), 2);
        assert_eq!(cats[0].category, "Puzzle");
        assert_eq!(cats[0].count, 2);
        assert_eq!(cats[1].category, "Racing");
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("plain"), "plain");
    }
}
