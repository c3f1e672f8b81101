//! Rater rows
//!
//! Users are owned by the excluded CRUD layer; this module keeps just the
//! lookup surface the aggregates read and a find-or-create used when a
//! submission arrives for a login seen for the first time.

use diesel::prelude::*;
use uuid::Uuid;

use super::diesel_schema::users;
use super::models::{current_timestamp, NewUser, User};
use crate::error::StoreError;

/// Get user by ID
pub fn get_user(conn: &mut SqliteConnection, id: &str) -> Result<Option<User>, StoreError> {
    users::table
        .filter(users::id.eq(id))
        .first(conn)
        .optional()
        .map_err(StoreError::from)
}

/// Get user by login
pub fn get_user_by_login(
    conn: &mut SqliteConnection,
    login: &str,
) -> Result<Option<User>, StoreError> {
    users::table
        .filter(users::login.eq(login))
        .first(conn)
        .optional()
        .map_err(StoreError::from)
}

/// Find a user by login, creating the row if it does not exist yet.
///
/// Logins are unique at the storage layer, so a concurrent create for the
/// same login loses to the constraint; the loser re-reads the winner's row.
pub fn get_or_create_user(conn: &mut SqliteConnection, login: &str) -> Result<User, StoreError> {
    if let Some(user) = get_user_by_login(conn, login)? {
        return Ok(user);
    }

    let id = Uuid::new_v4().to_string();
    let now = current_timestamp();
    let new_user = NewUser {
        id: &id,
        login,
        created_at: &now,
    };

    match diesel::insert_into(users::table).values(&new_user).execute(conn) {
        Ok(_) => Ok(User {
            id,
            login: login.to_string(),
            created_at: now,
        }),
        Err(err) => match StoreError::from(err) {
            StoreError::Conflict(_) => get_user_by_login(conn, login)?
                .ok_or_else(|| StoreError::Internal("user vanished after login conflict".into())),
            other => Err(other),
        },
    }
}
