//! Rating submission and the average aggregate
//!
//! `submit_rating_on` is the write coordinator: one transaction covering
//! the existence checks, the duplicate pre-check, the insert, and the
//! fresh average the caller gets back. The pre-check is a latency
//! shortcut only; the UNIQUE(post_id, user_id) constraint is what
//! actually guarantees at-most-one-rating when two first-time submissions
//! race between check and insert. Callers wanting the retry behavior go
//! through `RatingsDb::submit_rating`, which serializes same-post
//! submissions on the per-post lock before reaching this module.

use diesel::prelude::*;
use diesel::sql_types::{Double, Nullable, Text};
use tracing::debug;
use uuid::Uuid;

use super::diesel_schema::{posts, ratings, users};
use super::models::{current_timestamp, NewRating, Rating};
use crate::error::StoreError;

/// Inclusive rating bounds, mirrored by the CHECK constraint in storage
pub const MIN_RATING: i32 = 1;
pub const MAX_RATING: i32 = 5;

#[derive(QueryableByName)]
struct AverageRow {
    #[diesel(sql_type = Nullable<Double>)]
    average: Option<f64>,
}

/// Reject out-of-range values before any lock or transaction is taken
pub fn validate_value(value: i32) -> Result<(), StoreError> {
    if !(MIN_RATING..=MAX_RATING).contains(&value) {
        return Err(StoreError::Validation(format!(
            "rating value must be an integer between {} and {}, got {}",
            MIN_RATING, MAX_RATING, value
        )));
    }
    Ok(())
}

/// Mean of all rating values for a post; `None` when no ratings exist.
///
/// Recomputed from committed rows on every call, so rating churn from the
/// excluded CRUD layer needs no cache invalidation here.
pub fn average_rating(
    conn: &mut SqliteConnection,
    post_id: &str,
) -> Result<Option<f64>, StoreError> {
    let row: AverageRow =
        diesel::sql_query("SELECT AVG(value) AS average FROM ratings WHERE post_id = ?")
            .bind::<Text, _>(post_id)
            .get_result(conn)
            .map_err(StoreError::from)?;
    Ok(row.average)
}

/// All ratings recorded for a post, oldest first
pub fn ratings_for_post(
    conn: &mut SqliteConnection,
    post_id: &str,
) -> Result<Vec<Rating>, StoreError> {
    ratings::table
        .filter(ratings::post_id.eq(post_id))
        .order(ratings::created_at.asc())
        .load(conn)
        .map_err(StoreError::from)
}

/// Submit one rating, single attempt.
///
/// Runs as an IMMEDIATE transaction so the write lock is held from BEGIN
/// and a concurrent writer cannot slip between the pre-check and the
/// insert on this connection. Exactly one row is inserted on success;
/// every failure path rolls back whole.
pub fn submit_rating_on(
    conn: &mut SqliteConnection,
    post_id: &str,
    user_id: &str,
    value: i32,
) -> Result<f64, StoreError> {
    validate_value(value)?;

    conn.immediate_transaction(|conn| {
        let post: Option<String> = posts::table
            .filter(posts::id.eq(post_id))
            .select(posts::id)
            .first(conn)
            .optional()?;
        if post.is_none() {
            return Err(StoreError::NotFound(format!("post {} not found", post_id)));
        }

        let user: Option<String> = users::table
            .filter(users::id.eq(user_id))
            .select(users::id)
            .first(conn)
            .optional()?;
        if user.is_none() {
            return Err(StoreError::NotFound(format!("user {} not found", user_id)));
        }

        let already_rated: Option<String> = ratings::table
            .filter(ratings::post_id.eq(post_id))
            .filter(ratings::user_id.eq(user_id))
            .select(ratings::id)
            .first(conn)
            .optional()?;
        if already_rated.is_some() {
            return Err(StoreError::Duplicate(format!(
                "user {} has already rated post {}",
                user_id, post_id
            )));
        }

        let id = Uuid::new_v4().to_string();
        let now = current_timestamp();
        let new_rating = NewRating {
            id: &id,
            post_id,
            user_id,
            value,
            created_at: &now,
        };

        // A concurrent insert that slipped past the pre-check surfaces
        // here as UniqueViolation -> StoreError::Conflict.
        diesel::insert_into(ratings::table)
            .values(&new_rating)
            .execute(conn)?;

        debug!(post_id, user_id, value, "rating accepted");

        average_rating(conn, post_id)?
            .ok_or_else(|| StoreError::Internal("average missing after insert".into()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::posts::{create_post, CreatePostInput};
    use crate::db::users::get_or_create_user;
    use diesel::connection::SimpleConnection;

    fn setup_test_db() -> SqliteConnection {
        let mut conn = SqliteConnection::establish(":memory:").expect("in-memory database");
        conn.batch_execute("PRAGMA foreign_keys = ON").unwrap();
        crate::db::schema::init_schema(&mut conn).expect("schema init");
        conn
    }

    fn seed_post(conn: &mut SqliteConnection, id: &str) {
        let author = get_or_create_user(conn, "author").unwrap();
        create_post(
            conn,
            CreatePostInput {
                id: Some(id.to_string()),
                user_id: author.id,
                title: "title".to_string(),
                body: "body".to_string(),
                ip: "10.0.0.1".to_string(),
            },
        )
        .unwrap();
    }

    fn rating_count(conn: &mut SqliteConnection) -> i64 {
        ratings::table.count().get_result(conn).unwrap()
    }

    #[test]
    fn first_submission_succeeds_and_returns_average() {
        let mut conn = setup_test_db();
        seed_post(&mut conn, "post-1");
        let rater = get_or_create_user(&mut conn, "igor").unwrap();

        let average = submit_rating_on(&mut conn, "post-1", &rater.id, 4).unwrap();
        assert_eq!(average, 4.0);
        assert_eq!(rating_count(&mut conn), 1);
    }

    #[test]
    fn second_identical_submission_is_a_duplicate() {
        let mut conn = setup_test_db();
        seed_post(&mut conn, "post-1");
        let rater = get_or_create_user(&mut conn, "igor").unwrap();

        submit_rating_on(&mut conn, "post-1", &rater.id, 4).unwrap();
        let err = submit_rating_on(&mut conn, "post-1", &rater.id, 4).unwrap_err();

        assert!(matches!(err, StoreError::Duplicate(_)));
        assert_eq!(rating_count(&mut conn), 1);
    }

    #[test]
    fn same_user_may_rate_different_posts() {
        let mut conn = setup_test_db();
        seed_post(&mut conn, "post-1");
        seed_post(&mut conn, "post-2");
        let rater = get_or_create_user(&mut conn, "igor").unwrap();

        submit_rating_on(&mut conn, "post-1", &rater.id, 4).unwrap();
        submit_rating_on(&mut conn, "post-2", &rater.id, 2).unwrap();
        assert_eq!(rating_count(&mut conn), 2);
    }

    #[test]
    fn out_of_range_values_fail_validation_without_writing() {
        let mut conn = setup_test_db();
        seed_post(&mut conn, "post-1");
        let rater = get_or_create_user(&mut conn, "igor").unwrap();

        for bad in [0, 6, -1, 100] {
            let err = submit_rating_on(&mut conn, "post-1", &rater.id, bad).unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)), "value {}", bad);
        }
        assert_eq!(rating_count(&mut conn), 0);
    }

    #[test]
    fn storage_check_constraint_backs_up_validation() {
        let mut conn = setup_test_db();
        seed_post(&mut conn, "post-1");
        let rater = get_or_create_user(&mut conn, "igor").unwrap();

        // Bypass the application check to prove the storage guard holds.
        let now = current_timestamp();
        let result = diesel::insert_into(ratings::table)
            .values(&NewRating {
                id: "raw",
                post_id: "post-1",
                user_id: &rater.id,
                value: 9,
                created_at: &now,
            })
            .execute(&mut conn)
            .map_err(StoreError::from);

        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert_eq!(rating_count(&mut conn), 0);
    }

    #[test]
    fn unknown_post_and_user_are_not_found() {
        let mut conn = setup_test_db();
        seed_post(&mut conn, "post-1");
        let rater = get_or_create_user(&mut conn, "igor").unwrap();

        let err = submit_rating_on(&mut conn, "ghost", &rater.id, 3).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let err = submit_rating_on(&mut conn, "post-1", "ghost", 3).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        assert_eq!(rating_count(&mut conn), 0);
    }

    #[test]
    fn average_is_none_with_no_ratings() {
        let mut conn = setup_test_db();
        seed_post(&mut conn, "post-1");
        assert_eq!(average_rating(&mut conn, "post-1").unwrap(), None);
    }

    #[test]
    fn average_reflects_all_committed_ratings() {
        let mut conn = setup_test_db();
        seed_post(&mut conn, "post-1");
        let first = get_or_create_user(&mut conn, "igor").unwrap();
        let second = get_or_create_user(&mut conn, "bruno").unwrap();

        submit_rating_on(&mut conn, "post-1", &first.id, 4).unwrap();
        let average = submit_rating_on(&mut conn, "post-1", &second.id, 2).unwrap();

        assert_eq!(average, 3.0);
        assert_eq!(average_rating(&mut conn, "post-1").unwrap(), Some(3.0));

        let rows = ratings_for_post(&mut conn, "post-1").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.user_id == first.id && r.value == 4));
        assert!(rows.iter().any(|r| r.user_id == second.id && r.value == 2));
    }
}
