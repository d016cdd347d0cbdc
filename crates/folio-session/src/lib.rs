//! Hardened, namespaced per-request sessions with CSRF tokens and id masking.
//! `SessionManager` bootstraps the shared key ring once per process and hands
//! every request a started `SessionStore`.

pub mod cookie_transport;
mod csrf;
pub mod manager;
pub mod options;
pub mod records;
pub mod store;

pub use cookie_transport::CookieTransport;
pub use manager::SessionManager;
pub use options::SessionOptions;
pub use records::SessionRecords;
pub use store::{Lifecycle, SessionError, SessionStore};
