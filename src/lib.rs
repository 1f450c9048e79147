//! Record and replay SQL driver calls for deterministic database tests.
//!
//! Register a proxy for a backend driver, open a session per test and talk
//! to `sqlreplay_<driver>` instead of the backend. In recording mode every
//! call is forwarded and captured into a recording file; in playback mode
//! the captured results are served without a database.

pub mod config;
pub mod database;
pub mod driver;
pub mod logging;
pub mod mode;
pub mod proxy;
pub mod record;
pub mod session;
pub mod sqlite;
pub mod store;
pub mod value;

pub use mode::Mode;
pub use session::{
    SessionError, SessionHandle, SessionOptions, is_open, is_recording, open, open_named,
    open_source, open_with, register, set_session_init,
};
pub use store::{max_recording_size, set_max_recording_size};
