//! HTTP surface of the sender

pub mod handlers;
pub mod server;
pub mod stream;

pub use server::{router, AppState, WebServer};
pub use stream::{stream_ogg, OggStreamStats};
