//! Cached `Date` header value.
//!
//! The value only changes once per second, so it is formatted once per second
//! and shared by every response rendered within that second.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use http::HeaderValue;
use strand_net::lock;

#[derive(Debug, Default)]
pub(crate) struct DateCache {
    current: Mutex<Option<(u64, HeaderValue)>>,
}

impl DateCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The current time as an IMF-fixdate header value.
    pub(crate) fn value(&self) -> Option<HeaderValue> {
        let now = SystemTime::now();
        let second = now.duration_since(UNIX_EPOCH).ok()?.as_secs();

        let mut current = lock(&self.current);
        if let Some((_, value)) = current.as_ref().filter(|(cached_at, _)| *cached_at == second) {
            return Some(value.clone());
        }

        let value = HeaderValue::from_str(&httpdate::fmt_http_date(now)).ok()?;
        *current = Some((second, value.clone()));
        Some(value)
    }
}
