pub mod api;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod hotlink;
pub mod housekeeping;
pub mod hub;
pub mod identity;
pub mod images;
pub mod messages;
pub mod room;
pub mod ws;

pub use error::{ChatError, Result};
