//! Helpers for lookups that must match exactly one remote object.

use crate::error::{Error, Result};

/// The only element of `items`.
///
/// No results is `NotFound` (an empty describe is how most list-style APIs
/// report absence); more than one is `TooManyResults`.
pub fn single_value<T>(items: impl IntoIterator<Item = T>, what: &str) -> Result<T> {
    let mut items = items.into_iter();
    let first = items
        .next()
        .ok_or_else(|| Error::not_found(format!("{what}: empty result")))?;

    let rest = items.count();
    if rest > 0 {
        return Err(Error::TooManyResults { count: rest + 1 });
    }
    Ok(first)
}

/// Like [`single_value`] but absence is `Ok(None)`.
pub fn at_most_one<T>(items: impl IntoIterator<Item = T>, what: &str) -> Result<Option<T>> {
    match single_value(items, what) {
        Ok(item) => Ok(Some(item)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}
