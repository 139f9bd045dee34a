// Database Interface - Low-level database operations for anonymous posting
// This layer converts the service operations directly into SQL statements

use crate::error::{AppError, AppResult};
use crate::models::{
    authors_contain, contains_like_pattern, ActiveForum, ActiveTopic, IndexSnapshot, Post,
    PostAnonymity, SearchResultEntry, VisibilityFilter,
};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};

/// Database interface trait for the anonymous-posting operations.
///
/// Every method is a parameterized statement (or a short transaction)
/// against the host forum schema: `posts`, `topics`, `forums`, `users`,
/// `search_results`. Implementations exist for Postgres (production) and
/// in-memory SQLite (tests, local development).
#[async_trait]
pub trait DatabaseInterface: Send + Sync {
    // Identity assignment
    /// Single consistent read behind index assignment: the poster's
    /// earliest existing index in the topic plus one past the topic
    /// maximum. Read-only; for a race-safe allocation use
    /// [`assign_post_index`](DatabaseInterface::assign_post_index).
    async fn poster_index_snapshot(
        &self,
        topic_id: i64,
        poster_id: i64,
    ) -> AppResult<IndexSnapshot>;

    /// Compute the poster's index and stamp it onto the given post inside
    /// one transaction serialized per topic. Returns the issued index, or
    /// `AppError::IndexConflict` when a concurrent assignment claimed the
    /// same slot for a different poster.
    async fn assign_post_index(
        &self,
        topic_id: i64,
        poster_id: i64,
        post_id: i64,
    ) -> AppResult<i32>;

    // Search-result invalidation
    /// Keys of wildcard-flagged cached searches whose keyword text contains
    /// any of the given words as a substring.
    async fn wildcard_search_keys(&self, words: &[String]) -> AppResult<Vec<String>>;

    /// Keys of cached searches whose author list contains any of the given
    /// ids, matched as whole tokens of the space-delimited column.
    async fn author_search_keys(&self, author_ids: &[i64]) -> AppResult<Vec<String>>;

    /// Delete search-result rows strictly older than the cutoff. Returns
    /// the number of rows removed.
    async fn prune_search_results(&self, cutoff: i64) -> AppResult<u64>;

    // Poster activity
    async fn active_forum(
        &self,
        poster_id: i64,
        visibility: &VisibilityFilter,
    ) -> AppResult<Option<ActiveForum>>;
    async fn active_topic(
        &self,
        poster_id: i64,
        visibility: &VisibilityFilter,
    ) -> AppResult<Option<ActiveTopic>>;

    // Anonymity resolution
    /// Anonymity columns for the given posts, ordered by ascending post id.
    /// Duplicate ids collapse; unknown ids are absent from the result.
    async fn post_anonymity(&self, post_ids: &[i64]) -> AppResult<Vec<PostAnonymity>>;
    async fn usernames(&self, user_ids: &[i64]) -> AppResult<HashMap<i64, String>>;
    async fn username(&self, user_id: i64) -> AppResult<Option<String>>;

    // Post-move reconciliation
    /// Overwrite each moved post's index with the index its poster already
    /// holds on a non-moved post in the topic, where the two differ. Runs
    /// as a single transaction; returns the number of corrected rows.
    async fn reconcile_moved_posts(&self, topic_id: i64, post_ids: &[i64]) -> AppResult<u64>;

    // Row maintenance, used by host glue and test setup
    async fn insert_post(&self, post: &Post) -> AppResult<()>;
    async fn insert_topic(&self, topic_id: i64, topic_title: &str) -> AppResult<()>;
    async fn insert_forum(&self, forum_id: i64, forum_name: &str) -> AppResult<()>;
    async fn insert_user(&self, user_id: i64, username: &str) -> AppResult<()>;
    async fn insert_search_result(&self, entry: &SearchResultEntry) -> AppResult<()>;
    async fn post(&self, post_id: i64) -> AppResult<Option<Post>>;
}

pub(crate) const POSTER_INDEX_SNAPSHOT_SQL: &str = "SELECT ( SELECT anonymous_index
                 FROM posts
                 WHERE poster_id = $2 AND topic_id = $1 AND anonymous_index > 0
                 ORDER BY post_time ASC LIMIT 1
             ) AS old_index,
             MAX(anonymous_index) + 1 AS new_index
      FROM posts
      WHERE topic_id = $1 AND anonymous_index > 0";

/// PostgreSQL implementation of the database interface.
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with pool limits tunable through environment variables.
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "20".to_string())
            .parse::<u32>()
            .unwrap_or(20);

        let acquire_timeout_secs = std::env::var("DB_ACQUIRE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "8".to_string())
            .parse::<u64>()
            .unwrap_or(8);

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(acquire_timeout_secs))
            .test_before_acquire(true)
            .connect(database_url)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to connect to database: {}", e))
            })?;

        Ok(Self::new(pool))
    }

    /// Health check to verify database connectivity
    pub async fn health_check(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Database health check failed: {}", e)))?;
        Ok(())
    }

    /// Create the forum tables and indexes this service touches, if absent.
    pub async fn initialize(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                post_id BIGINT PRIMARY KEY,
                topic_id BIGINT NOT NULL,
                forum_id BIGINT NOT NULL,
                poster_id BIGINT NOT NULL,
                post_time BIGINT NOT NULL,
                anonymous_index INTEGER NOT NULL DEFAULT 0,
                is_anonymous BOOLEAN NOT NULL DEFAULT FALSE,
                post_postcount BOOLEAN NOT NULL DEFAULT TRUE
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to create posts table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS topics (
                topic_id BIGINT PRIMARY KEY,
                topic_title TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to create topics table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS forums (
                forum_id BIGINT PRIMARY KEY,
                forum_name TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to create forums table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id BIGINT PRIMARY KEY,
                username TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to create users table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS search_results (
                search_key VARCHAR(32) PRIMARY KEY,
                search_keywords TEXT NOT NULL,
                search_authors TEXT NOT NULL DEFAULT '',
                search_time BIGINT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(format!("Failed to create search_results table: {}", e))
        })?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_posts_topic_anon ON posts(topic_id, anonymous_index)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to create topic index: {}", e)))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_poster ON posts(poster_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to create poster index: {}", e))
            })?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_search_results_time ON search_results(search_time)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(format!("Failed to create search time index: {}", e))
        })?;

        Ok(())
    }
}

#[async_trait]
impl DatabaseInterface for PostgresDatabase {
    async fn poster_index_snapshot(
        &self,
        topic_id: i64,
        poster_id: i64,
    ) -> AppResult<IndexSnapshot> {
        let row = sqlx::query(POSTER_INDEX_SNAPSHOT_SQL)
            .bind(topic_id)
            .bind(poster_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!(
                    "Failed to read index snapshot for topic {}: {}",
                    topic_id, e
                ))
            })?;

        Ok(IndexSnapshot {
            old_index: row.get("old_index"),
            next_index: row.get("new_index"),
        })
    }

    async fn assign_post_index(
        &self,
        topic_id: i64,
        poster_id: i64,
        post_id: i64,
    ) -> AppResult<i32> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(format!("Failed to begin assignment transaction: {}", e))
        })?;

        // Serialize assignment per topic for the read-compute-write span.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(topic_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to lock topic {}: {}", topic_id, e))
            })?;

        let row = sqlx::query(POSTER_INDEX_SNAPSHOT_SQL)
            .bind(topic_id)
            .bind(poster_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!(
                    "Failed to read index snapshot for topic {}: {}",
                    topic_id, e
                ))
            })?;

        let snapshot = IndexSnapshot {
            old_index: row.get("old_index"),
            next_index: row.get("new_index"),
        };
        let index = snapshot.resolve();

        let updated = sqlx::query(
            "UPDATE posts SET anonymous_index = $1, is_anonymous = TRUE WHERE post_id = $2",
        )
        .bind(index)
        .bind(post_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to stamp post {}: {}", post_id, e)))?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await.ok();
            return Err(AppError::NotFound(format!("Post {} not found", post_id)));
        }

        // The lock makes a collision impossible in a single-store setup;
        // this check catches writers that bypassed it.
        let holders: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT poster_id) FROM posts WHERE topic_id = $1 AND anonymous_index = $2",
        )
        .bind(topic_id)
        .bind(index)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(format!("Failed to verify index {}: {}", index, e))
        })?;

        if holders > 1 {
            tx.rollback().await.ok();
            return Err(AppError::IndexConflict(format!(
                "Index {} in topic {} is held by another poster",
                index, topic_id
            )));
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(format!("Failed to commit assignment: {}", e))
        })?;

        Ok(index)
    }

    async fn wildcard_search_keys(&self, words: &[String]) -> AppResult<Vec<String>> {
        if words.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT search_key FROM search_results WHERE search_keywords LIKE '%*%' AND (",
        );
        for i in 0..words.len() {
            if i > 0 {
                sql.push_str(" OR ");
            }
            sql.push_str(&format!("search_keywords LIKE ${} ESCAPE '\\'", i + 1));
        }
        sql.push(')');

        let mut query = sqlx::query(&sql);
        for word in words {
            query = query.bind(contains_like_pattern(word));
        }

        let rows = query.fetch_all(&self.pool).await.map_err(|e| {
            AppError::DatabaseError(format!("Failed to scan keyword searches: {}", e))
        })?;

        Ok(rows.into_iter().map(|row| row.get("search_key")).collect())
    }

    async fn author_search_keys(&self, author_ids: &[i64]) -> AppResult<Vec<String>> {
        if author_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query("SELECT search_key, search_authors FROM search_results")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to scan author searches: {}", e))
            })?;

        let wanted: HashSet<i64> = author_ids.iter().copied().collect();
        Ok(rows
            .into_iter()
            .filter(|row| authors_contain(row.get("search_authors"), &wanted))
            .map(|row| row.get("search_key"))
            .collect())
    }

    async fn prune_search_results(&self, cutoff: i64) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM search_results WHERE search_time < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to prune search results: {}", e))
            })?;

        Ok(result.rows_affected())
    }

    async fn active_forum(
        &self,
        poster_id: i64,
        visibility: &VisibilityFilter,
    ) -> AppResult<Option<ActiveForum>> {
        let sql = format!(
            "SELECT p.forum_id, f.forum_name, COUNT(p.post_id) AS num_posts
             FROM posts p
             JOIN forums f ON f.forum_id = p.forum_id
             WHERE p.poster_id = $1
               AND p.post_postcount = TRUE
               AND p.is_anonymous = FALSE
               AND ({})
             GROUP BY p.forum_id, f.forum_name
             ORDER BY num_posts DESC
             LIMIT 1",
            visibility.as_sql()
        );

        let row = sqlx::query(&sql)
            .bind(poster_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to query active forum: {}", e))
            })?;

        Ok(row.map(|row| ActiveForum {
            forum_id: row.get("forum_id"),
            forum_name: row.get("forum_name"),
            post_count: row.get("num_posts"),
        }))
    }

    async fn active_topic(
        &self,
        poster_id: i64,
        visibility: &VisibilityFilter,
    ) -> AppResult<Option<ActiveTopic>> {
        let sql = format!(
            "SELECT p.topic_id, t.topic_title, COUNT(p.post_id) AS num_posts
             FROM posts p
             JOIN topics t ON t.topic_id = p.topic_id
             WHERE p.poster_id = $1
               AND p.post_postcount = TRUE
               AND p.is_anonymous = FALSE
               AND ({})
             GROUP BY p.topic_id, t.topic_title
             ORDER BY num_posts DESC
             LIMIT 1",
            visibility.as_sql()
        );

        let row = sqlx::query(&sql)
            .bind(poster_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to query active topic: {}", e))
            })?;

        Ok(row.map(|row| ActiveTopic {
            topic_id: row.get("topic_id"),
            topic_title: row.get("topic_title"),
            post_count: row.get("num_posts"),
        }))
    }

    async fn post_anonymity(&self, post_ids: &[i64]) -> AppResult<Vec<PostAnonymity>> {
        if post_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT post_id, poster_id, anonymous_index, is_anonymous
             FROM posts
             WHERE post_id = ANY($1)
             ORDER BY post_id ASC",
        )
        .bind(post_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(format!("Failed to fetch post anonymity: {}", e))
        })?;

        Ok(rows
            .into_iter()
            .map(|row| PostAnonymity {
                post_id: row.get("post_id"),
                poster_id: row.get("poster_id"),
                anonymous_index: row.get("anonymous_index"),
                is_anonymous: row.get("is_anonymous"),
            })
            .collect())
    }

    async fn usernames(&self, user_ids: &[i64]) -> AppResult<HashMap<i64, String>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query("SELECT user_id, username FROM users WHERE user_id = ANY($1)")
            .bind(user_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to fetch usernames: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("user_id"), row.get("username")))
            .collect())
    }

    async fn username(&self, user_id: i64) -> AppResult<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to fetch username {}: {}", user_id, e))
            })?;

        Ok(row.map(|row| row.get("username")))
    }

    async fn reconcile_moved_posts(&self, topic_id: i64, post_ids: &[i64]) -> AppResult<u64> {
        if post_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(format!("Failed to begin reconcile transaction: {}", e))
        })?;

        // Establish each affected poster's index from posts that were not
        // moved, then overwrite the moved posts that disagree.
        let affected = sqlx::query(
            "UPDATE posts AS p
             SET anonymous_index = fixed.established_index
             FROM ( SELECT moved.poster_id,
                           MIN(settled.anonymous_index) AS established_index
                    FROM posts AS moved
                    JOIN posts AS settled ON settled.poster_id = moved.poster_id
                    WHERE moved.post_id = ANY($2)
                      AND moved.anonymous_index > 0
                      AND settled.topic_id = $1
                      AND settled.post_id <> ALL($2)
                      AND settled.anonymous_index > 0
                      AND settled.anonymous_index <> moved.anonymous_index
                    GROUP BY moved.poster_id
             ) AS fixed
             WHERE p.post_id = ANY($2)
               AND p.anonymous_index > 0
               AND p.poster_id = fixed.poster_id",
        )
        .bind(topic_id)
        .bind(post_ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(format!(
                "Failed to reconcile moved posts in topic {}: {}",
                topic_id, e
            ))
        })?
        .rows_affected();

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(format!("Failed to commit reconcile transaction: {}", e))
        })?;

        Ok(affected)
    }

    async fn insert_post(&self, post: &Post) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO posts (post_id, topic_id, forum_id, poster_id, post_time,
                                anonymous_index, is_anonymous, post_postcount)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(post.post_id)
        .bind(post.topic_id)
        .bind(post.forum_id)
        .bind(post.poster_id)
        .bind(post.post_time)
        .bind(post.anonymous_index)
        .bind(post.is_anonymous)
        .bind(post.post_postcount)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(format!("Failed to insert post {}: {}", post.post_id, e))
        })?;

        Ok(())
    }

    async fn insert_topic(&self, topic_id: i64, topic_title: &str) -> AppResult<()> {
        sqlx::query("INSERT INTO topics (topic_id, topic_title) VALUES ($1, $2)")
            .bind(topic_id)
            .bind(topic_title)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to insert topic {}: {}", topic_id, e))
            })?;

        Ok(())
    }

    async fn insert_forum(&self, forum_id: i64, forum_name: &str) -> AppResult<()> {
        sqlx::query("INSERT INTO forums (forum_id, forum_name) VALUES ($1, $2)")
            .bind(forum_id)
            .bind(forum_name)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to insert forum {}: {}", forum_id, e))
            })?;

        Ok(())
    }

    async fn insert_user(&self, user_id: i64, username: &str) -> AppResult<()> {
        sqlx::query("INSERT INTO users (user_id, username) VALUES ($1, $2)")
            .bind(user_id)
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to insert user {}: {}", user_id, e))
            })?;

        Ok(())
    }

    async fn insert_search_result(&self, entry: &SearchResultEntry) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO search_results (search_key, search_keywords, search_authors, search_time)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&entry.search_key)
        .bind(&entry.search_keywords)
        .bind(&entry.search_authors)
        .bind(entry.search_time)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(format!(
                "Failed to insert search result {}: {}",
                entry.search_key, e
            ))
        })?;

        Ok(())
    }

    async fn post(&self, post_id: i64) -> AppResult<Option<Post>> {
        let row = sqlx::query(
            "SELECT post_id, topic_id, forum_id, poster_id, post_time,
                    anonymous_index, is_anonymous, post_postcount
             FROM posts WHERE post_id = $1",
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(format!("Failed to fetch post {}: {}", post_id, e))
        })?;

        Ok(row.map(|row| Post {
            post_id: row.get("post_id"),
            topic_id: row.get("topic_id"),
            forum_id: row.get("forum_id"),
            poster_id: row.get("poster_id"),
            post_time: row.get("post_time"),
            anonymous_index: row.get("anonymous_index"),
            is_anonymous: row.get("is_anonymous"),
            post_postcount: row.get("post_postcount"),
        }))
    }
}
