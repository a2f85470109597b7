//! Route registry for guarded page-load sequences.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::guard::LoadSequence;

#[derive(Default)]
pub struct Pages {
    routes: RwLock<HashMap<String, LoadSequence>>,
}

impl Pages {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the load sequence for `route`.
    pub fn add_page(&self, route: impl Into<String>, sequence: LoadSequence) {
        let route = route.into();
        debug!(%route, steps = sequence.steps().len(), "pages: registered");
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(route, sequence);
    }

    #[must_use]
    pub fn get(&self, route: &str) -> Option<LoadSequence> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(route)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::{LoadGuard, LoadStep};
    use std::time::Duration;

    #[test]
    fn add_page_stores_guarded_sequence() {
        let pages = Pages::new();
        pages.add_page("/dashboard", LoadGuard::new(Duration::from_millis(10)).on_load(Vec::new()));

        let seq = pages.get("/dashboard").expect("registered");
        assert!(matches!(seq.steps(), [LoadStep::AwaitAuthCheck]));
        assert!(pages.get("/missing").is_none());
    }

    #[test]
    fn add_page_replaces_existing_route() {
        let pages = Pages::new();
        let guard = LoadGuard::new(Duration::from_millis(10));
        pages.add_page("/a", guard.on_load(Vec::new()));
        let noop = crate::guard::action_fn("noop", |_snap: crate::session::SessionSnapshot| async {
            Ok(crate::frame::Data::new())
        });
        pages.add_page("/a", guard.on_load(vec![noop]));
        assert_eq!(pages.get("/a").expect("registered").steps().len(), 2);
    }
}
