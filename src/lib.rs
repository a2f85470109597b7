//! Auth bridge — keeps a server-held mirror of the browser's sign-in state.
//!
//! The browser's identity SDK settles on signed-in or signed-out; the
//! synchronizer verifies that claim with the provider and moves the
//! connection's `SessionState`; registered handlers react; guarded page
//! loads read the settled result.

pub mod config;
pub mod frame;
pub mod guard;
pub mod identity;
pub mod notifier;
pub mod pages;
pub mod routes;
pub mod session;
pub mod state;
pub mod sync;
