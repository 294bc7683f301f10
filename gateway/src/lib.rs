pub mod artifacts;
pub mod chain;
pub mod constants;
pub mod eth;
pub mod events;
pub mod logging;
pub mod server;
pub mod services;
pub mod settings;
