// Anonymous posting service - the interface hosts consume
// Composes the store, the search-result cache, and configuration

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::config::SearchConfig;
use crate::error::{AppError, AppResult};
use crate::infrastructure::{CacheInterface, DatabaseInterface};
use crate::models::{
    search_results_cache_key, ActiveForum, ActiveTopic, AnonymityStatus, VisibilityFilter,
};

/// Facade over the anonymous-posting operations. Collaborators are injected
/// at construction so tests can substitute in-memory implementations.
pub struct AnonymousPostService {
    db: Arc<dyn DatabaseInterface>,
    cache: Arc<dyn CacheInterface>,
    config: SearchConfig,
}

impl AnonymousPostService {
    pub fn new(
        db: Arc<dyn DatabaseInterface>,
        cache: Arc<dyn CacheInterface>,
        config: SearchConfig,
    ) -> Self {
        Self { db, cache, config }
    }

    /// The stable anonymous index this poster has (or would next receive)
    /// in the topic. Read-only; a first-time poster racing another first
    /// post can observe the same candidate, so allocation goes through
    /// [`assign_post_index`](Self::assign_post_index).
    #[instrument(skip(self))]
    pub async fn poster_index(&self, topic_id: i64, poster_id: i64) -> AppResult<i32> {
        validate_id("topic_id", topic_id)?;
        validate_id("poster_id", poster_id)?;

        let snapshot = self.db.poster_index_snapshot(topic_id, poster_id).await?;
        Ok(snapshot.resolve())
    }

    /// Allocate the poster's index and stamp it onto a freshly created
    /// post. Serialized per topic by the store; an
    /// [`AppError::IndexConflict`] means the whole assignment should be
    /// retried.
    #[instrument(skip(self))]
    pub async fn assign_post_index(
        &self,
        topic_id: i64,
        poster_id: i64,
        post_id: i64,
    ) -> AppResult<i32> {
        validate_id("topic_id", topic_id)?;
        validate_id("poster_id", poster_id)?;
        validate_id("post_id", post_id)?;

        let index = self.db.assign_post_index(topic_id, poster_id, post_id).await?;
        debug!(topic_id, poster_id, post_id, index, "assigned anonymous index");
        Ok(index)
    }

    /// Evict cached search results that could reference the given words or
    /// authors, then delete search-result rows older than the retention
    /// window. Evictions run before the sweep so the keys of rows about to
    /// be deleted are still recoverable.
    #[instrument(skip(self))]
    pub async fn destroy_search_cache(
        &self,
        words: &[String],
        author_ids: &[i64],
    ) -> AppResult<u64> {
        for &author_id in author_ids {
            validate_id("author_id", author_id)?;
        }
        let authors: Vec<i64> = author_ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let words: Vec<String> = words
            .iter()
            .map(|word| word.trim().to_string())
            .filter(|word| !word.is_empty())
            .collect();

        if !words.is_empty() {
            let keys = self.db.wildcard_search_keys(&words).await?;
            debug!(evictions = keys.len(), "evicting keyword searches");
            for key in &keys {
                self.cache.evict(&search_results_cache_key(key)).await;
            }
        }

        if !authors.is_empty() {
            let keys = self.db.author_search_keys(&authors).await?;
            debug!(evictions = keys.len(), "evicting author searches");
            for key in &keys {
                self.cache.evict(&search_results_cache_key(key)).await;
            }
        }

        let cutoff = Utc::now().timestamp() - self.config.result_retention_seconds;
        let pruned = self.db.prune_search_results(cutoff).await?;
        if pruned > 0 {
            info!(pruned, cutoff, "pruned expired search results");
        }
        Ok(pruned)
    }

    /// The forum where the poster has the most visible, count-eligible,
    /// non-anonymous posts. `None` when the poster has no qualifying posts;
    /// ties resolve in store order.
    #[instrument(skip(self, visibility))]
    pub async fn active_forum(
        &self,
        poster_id: i64,
        visibility: &VisibilityFilter,
    ) -> AppResult<Option<ActiveForum>> {
        validate_id("poster_id", poster_id)?;
        self.db.active_forum(poster_id, visibility).await
    }

    /// Topic counterpart of [`active_forum`](Self::active_forum).
    #[instrument(skip(self, visibility))]
    pub async fn active_topic(
        &self,
        poster_id: i64,
        visibility: &VisibilityFilter,
    ) -> AppResult<Option<ActiveTopic>> {
        validate_id("poster_id", poster_id)?;
        self.db.active_topic(poster_id, visibility).await
    }

    /// Anonymity status for a batch of posts, ordered by ascending post id.
    /// Usernames are resolved in a second batched lookup only when at least
    /// one post in the batch is anonymous.
    #[instrument(skip(self))]
    pub async fn resolve_anonymity(&self, post_ids: &[i64]) -> AppResult<Vec<AnonymityStatus>> {
        if post_ids.is_empty() {
            return Ok(Vec::new());
        }
        for &post_id in post_ids {
            validate_id("post_id", post_id)?;
        }

        let rows = self.db.post_anonymity(post_ids).await?;
        let mut statuses: Vec<AnonymityStatus> = rows
            .iter()
            .map(|row| AnonymityStatus {
                post_id: row.post_id,
                poster_id: row.poster_id,
                is_anonymous: row.is_anonymous,
                username: None,
            })
            .collect();

        if rows.iter().any(|row| row.is_anonymous) {
            let poster_ids: Vec<i64> = rows
                .iter()
                .map(|row| row.poster_id)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let usernames = self.db.usernames(&poster_ids).await?;
            for status in &mut statuses {
                status.username = usernames.get(&status.poster_id).cloned();
            }
        }

        Ok(statuses)
    }

    /// Current username for a poster, used when de-anonymizing
    /// notifications. `None` when the user no longer exists.
    #[instrument(skip(self))]
    pub async fn username(&self, user_id: i64) -> AppResult<Option<String>> {
        validate_id("user_id", user_id)?;
        self.db.username(user_id).await
    }

    /// Repair the anonymous indices of posts just moved into a topic so
    /// they match the index their poster already holds there. Assumes the
    /// rest of the topic is internally consistent; does not renumber it.
    #[instrument(skip(self))]
    pub async fn reconcile_moved_posts(
        &self,
        topic_id: i64,
        post_ids: &[i64],
    ) -> AppResult<u64> {
        validate_id("topic_id", topic_id)?;
        if post_ids.is_empty() {
            return Ok(0);
        }
        for &post_id in post_ids {
            validate_id("post_id", post_id)?;
        }

        let corrected = self.db.reconcile_moved_posts(topic_id, post_ids).await?;
        if corrected > 0 {
            info!(topic_id, corrected, "reconciled moved post indices");
        }
        Ok(corrected)
    }
}

fn validate_id(name: &str, value: i64) -> AppResult<()> {
    if value <= 0 {
        return Err(AppError::Validation(format!(
            "{} must be a positive integer, got {}",
            name, value
        )));
    }
    Ok(())
}
