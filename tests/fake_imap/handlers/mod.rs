//! IMAP command handlers for the fake server.
//!
//! Each handler lives in its own module and processes a single IMAP
//! command (CAPABILITY, AUTHENTICATE, NOOP, SELECT, UID SEARCH, UID
//! FETCH, LOGOUT).

mod authenticate;
mod capability;
mod logout;
mod noop;
mod select;
mod uid_fetch;
mod uid_search;

pub use authenticate::handle_authenticate;
pub use capability::handle_capability;
pub use logout::handle_logout;
pub use noop::handle_noop;
pub use select::handle_select;
pub use uid_fetch::handle_uid_fetch;
pub use uid_search::handle_uid_search;
