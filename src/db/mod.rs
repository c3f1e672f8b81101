//! SQLite database module for rating storage
//!
//! ## Architecture
//!
//! - Individual ratings stored relationally, append-only
//! - Averages, rankings, and the origin report derived on read
//! - Writes serialized per post; reads never take application locks
//!
//! ## Tables
//!
//! - `users` - raters (unique login)
//! - `posts` - rated resources with an origin key (`ip`)
//! - `ratings` - one row per (post, user), UNIQUE-constrained
//!
//! SQLite offers no row-level `SELECT ... FOR UPDATE`, so the
//! resource-scoped lock is an in-process mutex per post id, with the
//! uniqueness constraint as the authoritative race backstop. Submissions
//! for different posts never contend on the same mutex.

pub mod diesel_schema;
pub mod models;
pub mod posts;
pub mod ratings;
pub mod schema;
pub mod users;

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::StoreError;
use crate::retry::retry_on_conflict;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type PooledConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Applies per-connection PRAGMAs on checkout.
///
/// WAL keeps readers from blocking the writer; busy_timeout bounds the
/// wait for SQLite's write lock and surfaces expiry as an error.
#[derive(Debug)]
struct ConnectionCustomizer {
    busy_timeout_ms: u32,
}

impl diesel::r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error>
    for ConnectionCustomizer
{
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; \
             PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON;",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Database row counts
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub user_count: i64,
    pub post_count: i64,
    pub rating_count: i64,
}

/// SQLite-backed rating store
pub struct RatingsDb {
    pool: DbPool,
    /// Per-post write locks; one submission per post at a time
    post_locks: DashMap<String, Arc<Mutex<()>>>,
    submit_retry_attempts: u32,
}

impl RatingsDb {
    /// Open or create the ratings database under the configured directory
    pub fn open(config: &Config) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.storage_dir)
            .map_err(|e| StoreError::Internal(format!("Failed to create storage dir: {}", e)))?;

        let db_path = config.db_path();
        info!("Opening SQLite database at {:?}", db_path);

        let manager = ConnectionManager::<SqliteConnection>::new(db_path.to_string_lossy());
        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .connection_customizer(Box::new(ConnectionCustomizer {
                busy_timeout_ms: config.busy_timeout_ms,
            }))
            .build(manager)
            .map_err(|e| StoreError::Internal(format!("Failed to build pool: {}", e)))?;

        let db = Self {
            pool,
            post_locks: DashMap::new(),
            submit_retry_attempts: config.submit_retry_attempts,
        };

        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    ///
    /// Every `:memory:` connection is its own database, so the pool is
    /// capped at a single connection.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("Opening in-memory SQLite database");

        let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
        let pool = Pool::builder()
            .max_size(1)
            .connection_customizer(Box::new(ConnectionCustomizer {
                busy_timeout_ms: 5_000,
            }))
            .build(manager)
            .map_err(|e| StoreError::Internal(format!("Failed to build pool: {}", e)))?;

        let db = Self {
            pool,
            post_locks: DashMap::new(),
            submit_retry_attempts: 3,
        };

        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        schema::init_schema(&mut conn)
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConn, StoreError> {
        self.pool
            .get()
            .map_err(|e| StoreError::Internal(format!("Failed to get connection: {}", e)))
    }

    /// Lock handle for a post; submissions for the same post serialize on
    /// it, submissions for different posts proceed independently.
    fn post_lock(&self, post_id: &str) -> Arc<Mutex<()>> {
        self.post_locks
            .entry(post_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// One locked submission attempt
    fn locked_submit(&self, post_id: &str, user_id: &str, value: i32) -> Result<f64, StoreError> {
        let lock = self.post_lock(post_id);
        let _guard = lock
            .lock()
            .map_err(|_| StoreError::Internal("post lock poisoned".to_string()))?;
        let mut conn = self.conn()?;
        ratings::submit_rating_on(&mut conn, post_id, user_id, value)
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Submit a rating and return the post's fresh average.
    ///
    /// Retries only uniqueness conflicts, re-acquiring the per-post lock
    /// fresh on each attempt so the loser of a race re-runs its duplicate
    /// pre-check against the winner's committed row.
    pub fn submit_rating(
        &self,
        post_id: &str,
        user_id: &str,
        value: i32,
    ) -> Result<f64, StoreError> {
        retry_on_conflict(self.submit_retry_attempts, || {
            self.locked_submit(post_id, user_id, value)
        })
    }

    /// Submit a rating without the conflict-retry wrapper, for callers
    /// that layer their own policy on top.
    pub fn submit_rating_once(
        &self,
        post_id: &str,
        user_id: &str,
        value: i32,
    ) -> Result<f64, StoreError> {
        self.locked_submit(post_id, user_id, value)
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Current average rating for a post; `None` when it has no ratings
    pub fn average_rating(&self, post_id: &str) -> Result<Option<f64>, StoreError> {
        let mut conn = self.conn()?;
        if posts::get_post(&mut conn, post_id)?.is_none() {
            return Err(StoreError::NotFound(format!("post {} not found", post_id)));
        }
        ratings::average_rating(&mut conn, post_id)
    }

    /// Ranked top-rated posts; unrated posts sort last
    pub fn top_rated(&self, limit: i64) -> Result<Vec<posts::TopRatedPost>, StoreError> {
        let mut conn = self.conn()?;
        posts::top_rated(&mut conn, limit)
    }

    /// Origin keys with the distinct logins of their post authors
    pub fn authors_by_origin(&self) -> Result<Vec<posts::OriginAuthors>, StoreError> {
        let mut conn = self.conn()?;
        posts::authors_by_origin(&mut conn)
    }

    // =========================================================================
    // Collaborator Rows
    // =========================================================================

    /// Create a post
    pub fn create_post(&self, input: posts::CreatePostInput) -> Result<models::Post, StoreError> {
        let mut conn = self.conn()?;
        posts::create_post(&mut conn, input)
    }

    /// Get a post by ID
    pub fn get_post(&self, id: &str) -> Result<Option<models::Post>, StoreError> {
        let mut conn = self.conn()?;
        posts::get_post(&mut conn, id)
    }

    /// Find a user by login, creating the row on first sight
    pub fn get_or_create_user(&self, login: &str) -> Result<models::User, StoreError> {
        let mut conn = self.conn()?;
        users::get_or_create_user(&mut conn, login)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, StoreError> {
        let mut conn = self.conn()?;

        let user_count: i64 = diesel_schema::users::table
            .count()
            .get_result(&mut conn)
            .map_err(StoreError::from)?;
        let post_count: i64 = diesel_schema::posts::table
            .count()
            .get_result(&mut conn)
            .map_err(StoreError::from)?;
        let rating_count: i64 = diesel_schema::ratings::table
            .count()
            .get_result(&mut conn)
            .map_err(StoreError::from)?;

        Ok(DbStats {
            user_count,
            post_count,
            rating_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::posts::CreatePostInput;
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn open_file_backed(dir: &tempfile::TempDir) -> RatingsDb {
        let config = Config {
            storage_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        RatingsDb::open(&config).unwrap()
    }

    fn seed_post(db: &RatingsDb, id: &str) {
        let author = db.get_or_create_user("author").unwrap();
        db.create_post(CreatePostInput {
            id: Some(id.to_string()),
            user_id: author.id,
            title: "title".to_string(),
            body: "body".to_string(),
            ip: "10.0.0.1".to_string(),
        })
        .unwrap();
    }

    #[test]
    fn open_in_memory_round_trips_a_submission() {
        let db = RatingsDb::open_in_memory().unwrap();
        seed_post(&db, "post-1");
        let rater = db.get_or_create_user("igor").unwrap();

        let average = db.submit_rating("post-1", &rater.id, 5).unwrap();
        assert_eq!(average, 5.0);
        assert_eq!(db.average_rating("post-1").unwrap(), Some(5.0));

        let stats = db.stats().unwrap();
        assert_eq!(stats.post_count, 1);
        assert_eq!(stats.rating_count, 1);
    }

    #[test]
    fn submit_once_skips_retry_but_preserves_taxonomy() {
        let db = RatingsDb::open_in_memory().unwrap();
        seed_post(&db, "post-1");
        let rater = db.get_or_create_user("igor").unwrap();

        db.submit_rating_once("post-1", &rater.id, 2).unwrap();
        let err = db.submit_rating_once("post-1", &rater.id, 2).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[test]
    fn average_of_unknown_post_is_not_found() {
        let db = RatingsDb::open_in_memory().unwrap();
        assert!(matches!(
            db.average_rating("ghost"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn average_of_unrated_post_is_none_not_zero() {
        let db = RatingsDb::open_in_memory().unwrap();
        seed_post(&db, "post-1");
        assert_eq!(db.average_rating("post-1").unwrap(), None);
    }

    #[test]
    fn reopen_preserves_committed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            storage_dir: dir.path().to_path_buf(),
            ..Config::default()
        };

        {
            let db = RatingsDb::open(&config).unwrap();
            seed_post(&db, "post-1");
            let rater = db.get_or_create_user("igor").unwrap();
            db.submit_rating("post-1", &rater.id, 3).unwrap();
        }

        let db = RatingsDb::open(&config).unwrap();
        assert_eq!(db.average_rating("post-1").unwrap(), Some(3.0));
        assert_eq!(db.stats().unwrap().rating_count, 1);
    }

    #[test]
    fn concurrent_distinct_raters_all_commit() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(open_file_backed(&dir));
        seed_post(&db, "post-1");

        let values = [5, 4, 3, 2, 1, 5, 4, 3];
        let raters: Vec<String> = (0..values.len())
            .map(|i| db.get_or_create_user(&format!("rater-{}", i)).unwrap().id)
            .collect();

        let barrier = Arc::new(Barrier::new(values.len()));
        let handles: Vec<_> = raters
            .iter()
            .zip(values.iter())
            .map(|(rater_id, &value)| {
                let db = Arc::clone(&db);
                let barrier = Arc::clone(&barrier);
                let rater_id = rater_id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    db.submit_rating("post-1", &rater_id, value)
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let expected = values.iter().sum::<i32>() as f64 / values.len() as f64;
        assert_eq!(db.average_rating("post-1").unwrap(), Some(expected));
        assert_eq!(db.stats().unwrap().rating_count, values.len() as i64);

        let mut conn = db.conn().unwrap();
        let rows = ratings::ratings_for_post(&mut conn, "post-1").unwrap();
        let mut rated_by: Vec<&str> = rows.iter().map(|r| r.user_id.as_str()).collect();
        rated_by.sort_unstable();
        let mut everyone: Vec<&str> = raters.iter().map(String::as_str).collect();
        everyone.sort_unstable();
        assert_eq!(rated_by, everyone);
    }

    #[test]
    fn concurrent_same_pair_commits_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(open_file_backed(&dir));
        seed_post(&db, "post-1");
        let rater = db.get_or_create_user("igor").unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let db = Arc::clone(&db);
                let barrier = Arc::clone(&barrier);
                let rater_id = rater.id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    db.submit_rating("post-1", &rater_id, 4)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);

        for result in &results {
            if let Err(err) = result {
                assert!(
                    matches!(err, StoreError::Duplicate(_) | StoreError::Conflict(_)),
                    "unexpected error: {:?}",
                    err
                );
            }
        }

        assert_eq!(db.stats().unwrap().rating_count, 1);
    }

    #[test]
    fn concurrent_submissions_to_different_posts_all_commit() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(open_file_backed(&dir));
        seed_post(&db, "post-a");
        seed_post(&db, "post-b");
        let rater = db.get_or_create_user("igor").unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = ["post-a", "post-b"]
            .into_iter()
            .map(|post_id| {
                let db = Arc::clone(&db);
                let barrier = Arc::clone(&barrier);
                let rater_id = rater.id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    db.submit_rating(post_id, &rater_id, 5)
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(db.stats().unwrap().rating_count, 2);
    }
}
