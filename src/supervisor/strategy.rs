//! Ordered fallback combinator.

use std::future::Future;

/// Try each option in order until one succeeds.
///
/// Attempts run strictly one after another; the next option is only tried
/// once the previous attempt has resolved. Returns the winning option with
/// its value, or every `(option, error)` pair in attempt order.
pub async fn first_success<S, T, E, F, Fut>(options: &[S], mut attempt: F) -> Result<(S, T), Vec<(S, E)>>
where
    S: Copy,
    F: FnMut(S) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut failures = Vec::with_capacity(options.len());
    for &option in options {
        match attempt(option).await {
            Ok(value) => return Ok((option, value)),
            Err(e) => failures.push((option, e)),
        }
    }
    Err(failures)
}
