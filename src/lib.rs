pub mod config;
pub mod error;
pub mod factory;
pub mod flow;
pub mod instance;
pub mod logger;
pub mod registry;
pub mod schema;
pub mod util;
