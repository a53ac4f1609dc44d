//! Page environment capability.
//!
//! Synchronous field sources read state already on the page: the current
//! URL, cookies, and web storage. The engine depends on this capability
//! trait rather than any concrete host; a browser host backs it with the
//! real document, tests and embedded hosts use [`MemoryPage`].

use std::collections::HashMap;
use std::sync::RwLock;

/// Read access to page-held state.
///
/// All lookups are infallible and absence-tolerant: a missing cookie or
/// storage key is `None`, never an error.
pub trait PageEnvironment: Send + Sync {
    /// The current page URL.
    fn page_url(&self) -> String;

    /// A cookie value by name.
    fn cookie(&self, name: &str) -> Option<String>;

    /// A localStorage value by key.
    fn local_item(&self, key: &str) -> Option<String>;

    /// A sessionStorage value by key.
    fn session_item(&self, key: &str) -> Option<String>;
}

/// In-memory page environment for tests and embedded hosts.
#[derive(Debug, Default)]
pub struct MemoryPage {
    url: RwLock<String>,
    cookies: RwLock<HashMap<String, String>>,
    local: RwLock<HashMap<String, String>>,
    session: RwLock<HashMap<String, String>>,
}

impl MemoryPage {
    /// Creates an empty page at an empty URL.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a page at the given URL.
    #[must_use]
    pub fn with_url(url: impl Into<String>) -> Self {
        let page = Self::default();
        page.set_url(url);
        page
    }

    /// Updates the page URL.
    pub fn set_url(&self, url: impl Into<String>) {
        if let Ok(mut guard) = self.url.write() {
            *guard = url.into();
        }
    }

    /// Sets a cookie.
    pub fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut guard) = self.cookies.write() {
            guard.insert(name.into(), value.into());
        }
    }

    /// Sets a localStorage entry.
    pub fn set_local_item(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut guard) = self.local.write() {
            guard.insert(key.into(), value.into());
        }
    }

    /// Sets a sessionStorage entry.
    pub fn set_session_item(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut guard) = self.session.write() {
            guard.insert(key.into(), value.into());
        }
    }
}

impl PageEnvironment for MemoryPage {
    fn page_url(&self) -> String {
        self.url.read().map(|g| g.clone()).unwrap_or_default()
    }

    fn cookie(&self, name: &str) -> Option<String> {
        self.cookies.read().ok().and_then(|g| g.get(name).cloned())
    }

    fn local_item(&self, key: &str) -> Option<String> {
        self.local.read().ok().and_then(|g| g.get(key).cloned())
    }

    fn session_item(&self, key: &str) -> Option<String> {
        self.session.read().ok().and_then(|g| g.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_page_lookups() {
        let page = MemoryPage::with_url("https://shop.example/p/1?ref=home");
        page.set_cookie("sid", "abc");
        page.set_local_item("cart", "3");
        page.set_session_item("ab_bucket", "B");

        assert_eq!(page.page_url(), "https://shop.example/p/1?ref=home");
        assert_eq!(page.cookie("sid").as_deref(), Some("abc"));
        assert_eq!(page.local_item("cart").as_deref(), Some("3"));
        assert_eq!(page.session_item("ab_bucket").as_deref(), Some("B"));
        assert_eq!(page.cookie("missing"), None);
    }
}
