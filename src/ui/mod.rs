//! Web UI module

pub mod assets;
pub mod handlers;
pub mod server;

pub use assets::AssetStore;
pub use server::WebServer;
