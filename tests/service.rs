use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use anon_posts::{
    AnonymousPostService, AppError, AppResult, CacheInterface, DatabaseInterface, MemoryCache, Post,
    SearchConfig, SearchResultEntry, SqliteDatabase, VisibilityFilter,
    models::{search_results_cache_key, ActiveForum, ActiveTopic, IndexSnapshot, PostAnonymity},
};

const RETENTION_SECONDS: i64 = 600;

async fn setup() -> (Arc<AnonymousPostService>, Arc<SqliteDatabase>, Arc<MemoryCache>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("anon_posts=debug")
        .try_init();

    let db = Arc::new(SqliteDatabase::new_in_memory().await.unwrap());
    let cache = Arc::new(MemoryCache::new(64));
    let service = Arc::new(AnonymousPostService::new(
        db.clone(),
        cache.clone(),
        SearchConfig {
            result_retention_seconds: RETENTION_SECONDS,
        },
    ));
    (service, db, cache)
}

fn post(post_id: i64, topic_id: i64, poster_id: i64, post_time: i64) -> Post {
    Post {
        post_id,
        topic_id,
        forum_id: 1,
        poster_id,
        post_time,
        anonymous_index: 0,
        is_anonymous: false,
        post_postcount: true,
    }
}

fn anon_post(post_id: i64, topic_id: i64, poster_id: i64, post_time: i64, index: i32) -> Post {
    Post {
        anonymous_index: index,
        is_anonymous: true,
        ..post(post_id, topic_id, poster_id, post_time)
    }
}

fn search_entry(key: &str, keywords: &str, authors: &str, age_seconds: i64) -> SearchResultEntry {
    SearchResultEntry {
        search_key: key.to_string(),
        search_keywords: keywords.to_string(),
        search_authors: authors.to_string(),
        search_time: Utc::now().timestamp() - age_seconds,
    }
}

// === Identity assignment ===

#[tokio::test]
async fn first_poster_in_topic_gets_index_one() {
    let (service, db, _) = setup().await;
    db.insert_post(&post(100, 1, 10, 1000)).await.unwrap();

    let index = service.assign_post_index(1, 10, 100).await.unwrap();
    assert_eq!(index, 1);

    let stamped = db.post(100).await.unwrap().unwrap();
    assert_eq!(stamped.anonymous_index, 1);
    assert!(stamped.is_anonymous);
}

#[tokio::test]
async fn repeated_assignment_reuses_the_poster_slot() {
    let (service, db, _) = setup().await;
    db.insert_post(&post(100, 1, 10, 1000)).await.unwrap();
    db.insert_post(&post(101, 1, 20, 1001)).await.unwrap();
    db.insert_post(&post(102, 1, 10, 1002)).await.unwrap();

    let first = service.assign_post_index(1, 10, 100).await.unwrap();
    let other = service.assign_post_index(1, 20, 101).await.unwrap();
    let again = service.assign_post_index(1, 10, 102).await.unwrap();

    assert_eq!(first, 1);
    assert_eq!(other, 2);
    assert_eq!(again, first);

    // The read-only computation agrees once the slot exists.
    assert_eq!(service.poster_index(1, 10).await.unwrap(), first);
    assert_eq!(service.poster_index(1, 20).await.unwrap(), other);
}

#[tokio::test]
async fn poster_index_is_never_zero() {
    let (service, _, _) = setup().await;
    // Empty topic: the aggregate yields NULLs, which must coerce to 1.
    assert_eq!(service.poster_index(7, 7).await.unwrap(), 1);
}

#[tokio::test]
async fn indices_are_scoped_per_topic() {
    let (service, db, _) = setup().await;
    db.insert_post(&anon_post(1, 1, 10, 1000, 4)).await.unwrap();
    db.insert_post(&post(2, 2, 10, 1001)).await.unwrap();

    // Existing slot in topic 1, fresh slot in topic 2.
    assert_eq!(service.poster_index(1, 10).await.unwrap(), 4);
    assert_eq!(service.assign_post_index(2, 10, 2).await.unwrap(), 1);
}

#[tokio::test]
async fn assignment_to_missing_post_is_not_found() {
    let (service, _, _) = setup().await;
    let err = service.assign_post_index(1, 10, 999).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_assignments_never_collide() {
    let (service, db, _) = setup().await;
    for poster in 1..=8i64 {
        db.insert_post(&post(100 + poster, 50, poster, 1000 + poster))
            .await
            .unwrap();
    }

    let handles: Vec<_> = (1..=8i64)
        .map(|poster| {
            let service = service.clone();
            tokio::spawn(async move { service.assign_post_index(50, poster, 100 + poster).await })
        })
        .collect();

    let mut indices = Vec::new();
    for joined in futures::future::join_all(handles).await {
        match joined.unwrap() {
            Ok(index) => indices.push(index),
            // A conflict is a legal outcome, but only if it is the
            // distinguishable retryable kind.
            Err(err) => assert!(err.is_retryable_conflict(), "unexpected error: {}", err),
        }
    }

    assert!(indices.iter().all(|&index| index > 0));
    let mut deduped = indices.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(deduped.len(), indices.len(), "duplicate index issued: {:?}", indices);
}

// === Search-cache invalidation ===

#[tokio::test]
async fn empty_invalidation_sweeps_without_evicting() {
    let (service, db, cache) = setup().await;
    db.insert_search_result(&search_entry("fresh", "spam*", "", 0))
        .await
        .unwrap();
    db.insert_search_result(&search_entry("stale", "eggs*", "", RETENTION_SECONDS + 60))
        .await
        .unwrap();
    cache.put(&search_results_cache_key("fresh"), b"r1".to_vec()).await;
    cache.put(&search_results_cache_key("stale"), b"r2".to_vec()).await;

    let pruned = service.destroy_search_cache(&[], &[]).await.unwrap();

    assert_eq!(pruned, 1);
    assert_eq!(cache.len().await, 2);
}

#[tokio::test]
async fn word_invalidation_evicts_matching_wildcard_searches_only() {
    let (service, db, cache) = setup().await;
    // Wildcard search containing the word: evicted.
    db.insert_search_result(&search_entry("k1", "spam* mail", "", 0))
        .await
        .unwrap();
    // Contains the word but is not a wildcard search: kept.
    db.insert_search_result(&search_entry("k2", "spamalot", "", 0))
        .await
        .unwrap();
    // Wildcard search without the word: kept.
    db.insert_search_result(&search_entry("k3", "ham*", "", 0))
        .await
        .unwrap();
    for key in ["k1", "k2", "k3"] {
        cache.put(&search_results_cache_key(key), b"cached".to_vec()).await;
    }

    service
        .destroy_search_cache(&["spam".to_string()], &[])
        .await
        .unwrap();

    assert_eq!(cache.get(&search_results_cache_key("k1")).await, None);
    assert!(cache.get(&search_results_cache_key("k2")).await.is_some());
    assert!(cache.get(&search_results_cache_key("k3")).await.is_some());
}

#[tokio::test]
async fn author_invalidation_matches_whole_tokens() {
    let (service, db, cache) = setup().await;
    db.insert_search_result(&search_entry("a1", "q", "5 1 12", 0))
        .await
        .unwrap();
    // Author 11 must not match a request for author 1.
    db.insert_search_result(&search_entry("a2", "q", "11 21", 0))
        .await
        .unwrap();
    cache.put(&search_results_cache_key("a1"), b"cached".to_vec()).await;
    cache.put(&search_results_cache_key("a2"), b"cached".to_vec()).await;

    // Duplicate ids are deduplicated before matching.
    service.destroy_search_cache(&[], &[1, 1]).await.unwrap();

    assert_eq!(cache.get(&search_results_cache_key("a1")).await, None);
    assert!(cache.get(&search_results_cache_key("a2")).await.is_some());
}

#[tokio::test]
async fn retention_boundary_is_a_strict_inequality() {
    let (_, db, _) = setup().await;
    let cutoff = 10_000;
    db.insert_search_result(&SearchResultEntry {
        search_key: "older".into(),
        search_keywords: "q".into(),
        search_authors: "".into(),
        search_time: cutoff - 1,
    })
    .await
    .unwrap();
    db.insert_search_result(&SearchResultEntry {
        search_key: "edge".into(),
        search_keywords: "q".into(),
        search_authors: "".into(),
        search_time: cutoff,
    })
    .await
    .unwrap();

    // Exactly the rows strictly older than the cutoff go.
    assert_eq!(db.prune_search_results(cutoff).await.unwrap(), 1);
    assert_eq!(db.prune_search_results(cutoff).await.unwrap(), 0);
}

#[tokio::test]
async fn invalid_author_id_fails_before_any_statement() {
    let (service, _, _) = setup().await;
    let err = service.destroy_search_cache(&[], &[0]).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

// === Poster activity ===

async fn seed_activity(db: &SqliteDatabase) {
    db.insert_forum(1, "General").await.unwrap();
    db.insert_forum(2, "Offtopic").await.unwrap();
    db.insert_topic(10, "Welcome").await.unwrap();
    db.insert_topic(11, "Rules").await.unwrap();

    let mut next_post = 100;
    let mut add = |topic_id: i64, forum_id: i64, anonymous: bool, counted: bool| {
        next_post += 1;
        Post {
            post_id: next_post,
            topic_id,
            forum_id,
            poster_id: 5,
            post_time: 1000 + next_post,
            anonymous_index: if anonymous { 1 } else { 0 },
            is_anonymous: anonymous,
            post_postcount: counted,
        }
    };

    let rows = vec![
        add(10, 1, false, true),
        add(10, 1, false, true),
        add(11, 2, false, true),
        // Anonymous and count-exempt posts must not influence the totals.
        add(11, 2, true, true),
        add(11, 2, false, false),
    ];
    for row in &rows {
        db.insert_post(row).await.unwrap();
    }
}

#[tokio::test]
async fn active_forum_counts_eligible_posts_only() {
    let (service, db, _) = setup().await;
    seed_activity(&db).await;

    let top = service
        .active_forum(5, &VisibilityFilter::all())
        .await
        .unwrap();
    assert_eq!(
        top,
        Some(ActiveForum {
            forum_id: 1,
            forum_name: "General".into(),
            post_count: 2,
        })
    );
}

#[tokio::test]
async fn active_topic_honors_the_visibility_filter() {
    let (service, db, _) = setup().await;
    seed_activity(&db).await;

    let top = service
        .active_topic(5, &VisibilityFilter::all())
        .await
        .unwrap();
    assert_eq!(
        top,
        Some(ActiveTopic {
            topic_id: 10,
            topic_title: "Welcome".into(),
            post_count: 2,
        })
    );

    let filtered = service
        .active_topic(5, &VisibilityFilter::new("p.forum_id <> 1"))
        .await
        .unwrap();
    assert_eq!(
        filtered,
        Some(ActiveTopic {
            topic_id: 11,
            topic_title: "Rules".into(),
            post_count: 1,
        })
    );
}

#[tokio::test]
async fn poster_without_posts_has_no_active_forum() {
    let (service, _, _) = setup().await;
    let top = service
        .active_forum(99, &VisibilityFilter::all())
        .await
        .unwrap();
    assert_eq!(top, None);
}

// === Anonymity resolution ===

/// Trait fake wrapping the SQLite store to count the revealer's store
/// round trips.
struct CountingDb {
    inner: Arc<SqliteDatabase>,
    anonymity_calls: AtomicUsize,
    username_calls: AtomicUsize,
}

impl CountingDb {
    fn new(inner: Arc<SqliteDatabase>) -> Self {
        Self {
            inner,
            anonymity_calls: AtomicUsize::new(0),
            username_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DatabaseInterface for CountingDb {
    async fn poster_index_snapshot(&self, topic_id: i64, poster_id: i64) -> AppResult<IndexSnapshot> {
        self.inner.poster_index_snapshot(topic_id, poster_id).await
    }

    async fn assign_post_index(&self, topic_id: i64, poster_id: i64, post_id: i64) -> AppResult<i32> {
        self.inner.assign_post_index(topic_id, poster_id, post_id).await
    }

    async fn wildcard_search_keys(&self, words: &[String]) -> AppResult<Vec<String>> {
        self.inner.wildcard_search_keys(words).await
    }

    async fn author_search_keys(&self, author_ids: &[i64]) -> AppResult<Vec<String>> {
        self.inner.author_search_keys(author_ids).await
    }

    async fn prune_search_results(&self, cutoff: i64) -> AppResult<u64> {
        self.inner.prune_search_results(cutoff).await
    }

    async fn active_forum(
        &self,
        poster_id: i64,
        visibility: &VisibilityFilter,
    ) -> AppResult<Option<ActiveForum>> {
        self.inner.active_forum(poster_id, visibility).await
    }

    async fn active_topic(
        &self,
        poster_id: i64,
        visibility: &VisibilityFilter,
    ) -> AppResult<Option<ActiveTopic>> {
        self.inner.active_topic(poster_id, visibility).await
    }

    async fn post_anonymity(&self, post_ids: &[i64]) -> AppResult<Vec<PostAnonymity>> {
        self.anonymity_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.post_anonymity(post_ids).await
    }

    async fn usernames(&self, user_ids: &[i64]) -> AppResult<HashMap<i64, String>> {
        self.username_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.usernames(user_ids).await
    }

    async fn username(&self, user_id: i64) -> AppResult<Option<String>> {
        self.inner.username(user_id).await
    }

    async fn reconcile_moved_posts(&self, topic_id: i64, post_ids: &[i64]) -> AppResult<u64> {
        self.inner.reconcile_moved_posts(topic_id, post_ids).await
    }

    async fn insert_post(&self, post: &Post) -> AppResult<()> {
        self.inner.insert_post(post).await
    }

    async fn insert_topic(&self, topic_id: i64, topic_title: &str) -> AppResult<()> {
        self.inner.insert_topic(topic_id, topic_title).await
    }

    async fn insert_forum(&self, forum_id: i64, forum_name: &str) -> AppResult<()> {
        self.inner.insert_forum(forum_id, forum_name).await
    }

    async fn insert_user(&self, user_id: i64, username: &str) -> AppResult<()> {
        self.inner.insert_user(user_id, username).await
    }

    async fn insert_search_result(&self, entry: &SearchResultEntry) -> AppResult<()> {
        self.inner.insert_search_result(entry).await
    }

    async fn post(&self, post_id: i64) -> AppResult<Option<Post>> {
        self.inner.post(post_id).await
    }
}

async fn counting_setup() -> (AnonymousPostService, Arc<CountingDb>) {
    let sqlite = Arc::new(SqliteDatabase::new_in_memory().await.unwrap());
    let db = Arc::new(CountingDb::new(sqlite));
    let service = AnonymousPostService::new(
        db.clone(),
        Arc::new(MemoryCache::new(16)),
        SearchConfig {
            result_retention_seconds: RETENTION_SECONDS,
        },
    );
    (service, db)
}

#[tokio::test]
async fn empty_reveal_batch_touches_nothing() {
    let (service, db) = counting_setup().await;

    let statuses = service.resolve_anonymity(&[]).await.unwrap();

    assert!(statuses.is_empty());
    assert_eq!(db.anonymity_calls.load(Ordering::SeqCst), 0);
    assert_eq!(db.username_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reveal_without_anonymous_posts_skips_username_lookup() {
    let (service, db) = counting_setup().await;
    db.insert_user(10, "alice").await.unwrap();
    db.insert_post(&post(1, 1, 10, 1000)).await.unwrap();
    db.insert_post(&post(2, 1, 10, 1001)).await.unwrap();

    let statuses = service.resolve_anonymity(&[1, 2]).await.unwrap();

    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|s| !s.is_anonymous && s.username.is_none()));
    assert_eq!(db.anonymity_calls.load(Ordering::SeqCst), 1);
    assert_eq!(db.username_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reveal_attaches_usernames_when_batch_has_anonymous_posts() {
    let (service, db) = counting_setup().await;
    db.insert_user(10, "alice").await.unwrap();
    db.insert_user(20, "bob").await.unwrap();
    db.insert_post(&anon_post(1, 1, 10, 1000, 1)).await.unwrap();
    db.insert_post(&post(2, 1, 20, 1001)).await.unwrap();

    // Results come back ordered by post id regardless of input order.
    let statuses = service.resolve_anonymity(&[2, 1]).await.unwrap();

    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].post_id, 1);
    assert!(statuses[0].is_anonymous);
    assert_eq!(statuses[0].username.as_deref(), Some("alice"));
    assert_eq!(statuses[1].username.as_deref(), Some("bob"));
    assert_eq!(db.username_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn username_lookup_handles_missing_users() {
    let (service, db, _) = setup().await;
    db.insert_user(10, "alice").await.unwrap();

    assert_eq!(service.username(10).await.unwrap().as_deref(), Some("alice"));
    assert_eq!(service.username(11).await.unwrap(), None);
}

// === Post-move reconciliation ===

#[tokio::test]
async fn moved_posts_are_corrected_to_the_established_index() {
    let (service, db, _) = setup().await;
    // Poster X settled in topic 1 with index 3.
    db.insert_post(&anon_post(1, 1, 10, 1000, 3)).await.unwrap();
    db.insert_post(&anon_post(2, 1, 10, 1001, 3)).await.unwrap();
    // Poster Y settled with index 2.
    db.insert_post(&anon_post(3, 1, 20, 1002, 2)).await.unwrap();
    // Moved in: X with a stale index, Y already matching, Z with no
    // settled posts in the topic.
    db.insert_post(&anon_post(10, 1, 10, 2000, 5)).await.unwrap();
    db.insert_post(&anon_post(11, 1, 20, 2001, 2)).await.unwrap();
    db.insert_post(&anon_post(12, 1, 30, 2002, 4)).await.unwrap();

    let corrected = service
        .reconcile_moved_posts(1, &[10, 11, 12])
        .await
        .unwrap();

    assert_eq!(corrected, 1);
    assert_eq!(db.post(10).await.unwrap().unwrap().anonymous_index, 3);
    assert_eq!(db.post(11).await.unwrap().unwrap().anonymous_index, 2);
    assert_eq!(db.post(12).await.unwrap().unwrap().anonymous_index, 4);
    // Settled posts are untouched.
    assert_eq!(db.post(1).await.unwrap().unwrap().anonymous_index, 3);
    assert_eq!(db.post(3).await.unwrap().unwrap().anonymous_index, 2);
}

#[tokio::test]
async fn reconcile_ignores_non_anonymous_moved_posts() {
    let (service, db, _) = setup().await;
    db.insert_post(&anon_post(1, 1, 10, 1000, 3)).await.unwrap();
    // Moved post by the same poster, but not anonymous.
    db.insert_post(&post(10, 1, 10, 2000)).await.unwrap();

    let corrected = service.reconcile_moved_posts(1, &[10]).await.unwrap();

    assert_eq!(corrected, 0);
    assert_eq!(db.post(10).await.unwrap().unwrap().anonymous_index, 0);
}

#[tokio::test]
async fn reconcile_with_no_moved_posts_is_a_no_op() {
    let (service, _, _) = setup().await;
    assert_eq!(service.reconcile_moved_posts(1, &[]).await.unwrap(), 0);
}
