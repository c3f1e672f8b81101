//! Bounded retry for transient submission conflicts
//!
//! A conflict means two legitimate first-time submissions raced past the
//! duplicate pre-check and one of them lost to the uniqueness constraint.
//! Re-running the loser lets its pre-check observe the winner's row and
//! resolve to a proper `Duplicate` instead of an opaque failure. Every
//! other error kind is final and is returned untouched on the first try.

use tracing::{debug, warn};

use crate::error::StoreError;

/// Re-run `op` while it fails with a transient conflict, up to `attempts`
/// total tries. The last conflict is surfaced when the bound is exhausted.
pub fn retry_on_conflict<T, F>(attempts: u32, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let attempts = attempts.max(1);

    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                debug!(attempt, attempts, "submission conflict, retrying");
            }
            Err(err) => {
                if err.is_transient() {
                    warn!(attempts, "submission conflict retries exhausted");
                }
                return Err(err);
            }
        }
    }
}
