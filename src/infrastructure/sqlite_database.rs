use async_trait::async_trait;
use sqlx::{sqlite::Sqlite, sqlite::SqlitePool, sqlite::SqlitePoolOptions, QueryBuilder, Row};
use std::collections::{HashMap, HashSet};

use crate::error::{AppError, AppResult};
use crate::infrastructure::database::DatabaseInterface;
use crate::models::{
    authors_contain, contains_like_pattern, ActiveForum, ActiveTopic, IndexSnapshot, Post,
    PostAnonymity, SearchResultEntry, VisibilityFilter,
};

const SNAPSHOT_SQL: &str = "SELECT ( SELECT anonymous_index
                 FROM posts
                 WHERE poster_id = ? AND topic_id = ? AND anonymous_index > 0
                 ORDER BY post_time ASC LIMIT 1
             ) AS old_index,
             MAX(anonymous_index) + 1 AS new_index
      FROM posts
      WHERE topic_id = ? AND anonymous_index > 0";

/// SQLite implementation of the database interface for in-memory testing
/// and local development.
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// The pool is capped at one connection: SQLite then serializes every
    /// transaction, which is the per-topic serialization the index
    /// allocator requires on this backend.
    pub async fn new_in_memory() -> AppResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to connect to in-memory SQLite: {}", e))
            })?;

        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    /// Create the forum tables and indexes this service touches, if absent.
    pub async fn initialize(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                post_id INTEGER PRIMARY KEY,
                topic_id INTEGER NOT NULL,
                forum_id INTEGER NOT NULL,
                poster_id INTEGER NOT NULL,
                post_time INTEGER NOT NULL,
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
                topic_id INTEGER PRIMARY KEY,
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
                forum_id INTEGER PRIMARY KEY,
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
                user_id INTEGER PRIMARY KEY,
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
                search_key TEXT PRIMARY KEY,
                search_keywords TEXT NOT NULL,
                search_authors TEXT NOT NULL DEFAULT '',
                search_time INTEGER NOT NULL
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
impl DatabaseInterface for SqliteDatabase {
    async fn poster_index_snapshot(
        &self,
        topic_id: i64,
        poster_id: i64,
    ) -> AppResult<IndexSnapshot> {
        let row = sqlx::query(SNAPSHOT_SQL)
            .bind(poster_id)
            .bind(topic_id)
            .bind(topic_id)
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
        // The single-connection pool serializes concurrent callers here.
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(format!("Failed to begin assignment transaction: {}", e))
        })?;

        let row = sqlx::query(SNAPSHOT_SQL)
            .bind(poster_id)
            .bind(topic_id)
            .bind(topic_id)
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

        let updated =
            sqlx::query("UPDATE posts SET anonymous_index = ?, is_anonymous = TRUE WHERE post_id = ?")
                .bind(index)
                .bind(post_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(format!("Failed to stamp post {}: {}", post_id, e))
                })?
                .rows_affected();

        if updated == 0 {
            tx.rollback().await.ok();
            return Err(AppError::NotFound(format!("Post {} not found", post_id)));
        }

        let holders: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT poster_id) FROM posts WHERE topic_id = ? AND anonymous_index = ?",
        )
        .bind(topic_id)
        .bind(index)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to verify index {}: {}", index, e)))?;

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

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT search_key FROM search_results WHERE search_keywords LIKE '%*%' AND (",
        );
        for (i, word) in words.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push("search_keywords LIKE ");
            qb.push_bind(contains_like_pattern(word));
            qb.push(" ESCAPE '\\'");
        }
        qb.push(")");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(|e| {
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
        let result = sqlx::query("DELETE FROM search_results WHERE search_time < ?")
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
             WHERE p.poster_id = ?
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
             WHERE p.poster_id = ?
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

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT post_id, poster_id, anonymous_index, is_anonymous FROM posts WHERE post_id IN (",
        );
        let mut separated = qb.separated(",");
        for id in post_ids {
            separated.push_bind(*id);
        }
        qb.push(") ORDER BY post_id ASC");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(|e| {
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

        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT user_id, username FROM users WHERE user_id IN (");
        let mut separated = qb.separated(",");
        for id in user_ids {
            separated.push_bind(*id);
        }
        qb.push(")");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to fetch usernames: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("user_id"), row.get("username")))
            .collect())
    }

    async fn username(&self, user_id: i64) -> AppResult<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE user_id = ?")
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

        // Correlated form of the reconcile update: the established index is
        // the poster's index on posts that were not part of the move.
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE posts SET anonymous_index = (
                 SELECT MIN(settled.anonymous_index) FROM posts AS settled
                 WHERE settled.topic_id = ",
        );
        qb.push_bind(topic_id);
        qb.push(
            "   AND settled.poster_id = posts.poster_id
                 AND settled.anonymous_index > 0
                 AND settled.post_id NOT IN (",
        );
        let mut separated = qb.separated(",");
        for id in post_ids {
            separated.push_bind(*id);
        }
        qb.push(") ) WHERE post_id IN (");
        let mut separated = qb.separated(",");
        for id in post_ids {
            separated.push_bind(*id);
        }
        qb.push(
            ") AND anonymous_index > 0
              AND EXISTS (
                 SELECT 1 FROM posts AS settled
                 WHERE settled.topic_id = ",
        );
        qb.push_bind(topic_id);
        qb.push(
            "   AND settled.poster_id = posts.poster_id
                 AND settled.anonymous_index > 0
                 AND settled.anonymous_index <> posts.anonymous_index
                 AND settled.post_id NOT IN (",
        );
        let mut separated = qb.separated(",");
        for id in post_ids {
            separated.push_bind(*id);
        }
        qb.push(") )");

        let affected = qb
            .build()
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
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
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
        sqlx::query("INSERT INTO topics (topic_id, topic_title) VALUES (?, ?)")
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
        sqlx::query("INSERT INTO forums (forum_id, forum_name) VALUES (?, ?)")
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
        sqlx::query("INSERT INTO users (user_id, username) VALUES (?, ?)")
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
             VALUES (?, ?, ?, ?)",
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
             FROM posts WHERE post_id = ?",
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
