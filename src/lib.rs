// Anonymous posting services - identity assignment, search-cache
// invalidation, and post-move reconciliation over a host forum schema

// Infrastructure - database and caching seams with their implementations
pub mod infrastructure;

// Row and result types shared across layers
pub mod models;

// Service facade consumed by hosts
pub mod service;

// Common utilities
pub mod config;
pub mod error;

// Re-exports for convenience
pub use config::{CacheConfig, Config, DatabaseConfig, SearchConfig};
pub use error::{AppError, AppResult};
pub use infrastructure::{
    CacheInterface, DatabaseInterface, MemoryCache, PostgresDatabase, SqliteDatabase,
};
pub use models::{
    search_results_cache_key, ActiveForum, ActiveTopic, AnonymityStatus, IndexSnapshot, Post,
    PostAnonymity, SearchResultEntry, VisibilityFilter,
};
pub use service::AnonymousPostService;
