//! Post rows and the read-side aggregates
//!
//! Posts are created by the excluded CRUD layer; `create_post` persists
//! what it is given (field-presence validation lives with that layer).
//! The two aggregates here are pure read paths: they take no locks and
//! recompute from committed rows on every call.

use std::collections::{BTreeMap, BTreeSet};

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Double, Nullable, Text};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::diesel_schema::{posts, users};
use super::models::{current_timestamp, NewPost, Post};
use crate::error::StoreError;

// ============================================================================
// Query Types
// ============================================================================

/// Input for creating a post
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePostInput {
    #[serde(default)]
    pub id: Option<String>,
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub ip: String,
}

/// Post with its current average rating; `None` means no ratings yet.
#[derive(Debug, Clone, QueryableByName, Serialize)]
pub struct TopRatedPost {
    #[diesel(sql_type = Text)]
    pub id: String,
    #[diesel(sql_type = Text)]
    pub user_id: String,
    #[diesel(sql_type = Text)]
    pub title: String,
    #[diesel(sql_type = Text)]
    pub body: String,
    #[diesel(sql_type = Text)]
    pub ip: String,
    #[diesel(sql_type = Nullable<Double>)]
    pub average_rating: Option<f64>,
}

/// Origin key with the deduplicated logins of everyone who posted from it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OriginAuthors {
    pub ip: String,
    pub logins: Vec<String>,
}

// ============================================================================
// Read Operations
// ============================================================================

/// Get post by ID
pub fn get_post(conn: &mut SqliteConnection, id: &str) -> Result<Option<Post>, StoreError> {
    posts::table
        .filter(posts::id.eq(id))
        .first(conn)
        .optional()
        .map_err(StoreError::from)
}

/// All posts ranked by average rating, best first.
///
/// Unrated posts are included and sort after every rated post; ties on the
/// average break on post id so repeated calls over unchanged data return
/// the identical ordering.
pub fn top_rated(conn: &mut SqliteConnection, limit: i64) -> Result<Vec<TopRatedPost>, StoreError> {
    diesel::sql_query(
        r#"
        SELECT posts.id, posts.user_id, posts.title, posts.body, posts.ip,
               AVG(ratings.value) AS average_rating
        FROM posts
        LEFT JOIN ratings ON ratings.post_id = posts.id
        GROUP BY posts.id
        ORDER BY average_rating IS NULL, average_rating DESC, posts.id ASC
        LIMIT ?
        "#,
    )
    .bind::<BigInt, _>(limit)
    .load(conn)
    .map_err(StoreError::from)
}

/// Group posts by origin key, collecting the distinct logins of their
/// authors. Entry and login order is lexicographic, purely so the report
/// is stable across calls.
pub fn authors_by_origin(conn: &mut SqliteConnection) -> Result<Vec<OriginAuthors>, StoreError> {
    let rows: Vec<(String, String)> = posts::table
        .inner_join(users::table)
        .select((posts::ip, users::login))
        .load(conn)
        .map_err(StoreError::from)?;

    let mut grouped: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (ip, login) in rows {
        grouped.entry(ip).or_default().insert(login);
    }

    Ok(grouped
        .into_iter()
        .map(|(ip, logins)| OriginAuthors {
            ip,
            logins: logins.into_iter().collect(),
        })
        .collect())
}

// ============================================================================
// Write Operations
// ============================================================================

/// Create a post
pub fn create_post(conn: &mut SqliteConnection, input: CreatePostInput) -> Result<Post, StoreError> {
    let id = input
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = current_timestamp();

    let new_post = NewPost {
        id: &id,
        user_id: &input.user_id,
        title: &input.title,
        body: &input.body,
        ip: &input.ip,
        created_at: &now,
        updated_at: &now,
    };

    diesel::insert_into(posts::table)
        .values(&new_post)
        .execute(conn)
        .map_err(StoreError::from)?;

    get_post(conn, &id)?
        .ok_or_else(|| StoreError::Internal("post missing immediately after insert".into()))
}
