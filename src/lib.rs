//! Ratings Store - concurrency-safe rating ingestion for posts
//!
//! Users rate a post once each on a 1-5 scale; everything downstream is
//! derived on read: the running average, a ranked top-rated list, and a
//! report grouping post authors by origin address.
//!
//! ## Architecture
//!
//! - **Write coordinator** (`db::ratings`): one transaction per
//!   submission covering existence checks, the duplicate pre-check, the
//!   insert, and the fresh average.
//! - **Conflict retry** (`retry`): bounded re-runs when two first-time
//!   submissions race past the pre-check and one loses to the uniqueness
//!   constraint.
//! - **Aggregation queries** (`db::posts`, `db::ratings`): lock-free read
//!   paths recomputed from committed rows on every call.
//!
//! ## Why Two Duplicate Guards?
//!
//! | Guard | Property |
//! |-------|----------|
//! | Pre-check in the transaction | Fast, friendly `Duplicate` error |
//! | UNIQUE(post_id, user_id) | Authoritative under any interleaving |
//!
//! The pre-check alone is racy; the constraint alone turns every ordinary
//! duplicate into a late storage failure. Together a racing loser gets one
//! retry, re-checks, and reports `Duplicate` like any other second attempt.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/ratings-store/
//! ├── ratings.db            # SQLite database (WAL mode)
//! └── config.toml           # Configuration
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod retry;

// Re-exports
pub use config::Config;
pub use db::posts::{CreatePostInput, OriginAuthors, TopRatedPost};
pub use db::{DbStats, RatingsDb};
pub use error::StoreError;
pub use retry::retry_on_conflict;
