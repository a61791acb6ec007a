pub mod config;
pub mod error;
pub mod extract;
pub mod http;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod record;
pub mod resolve;
pub mod sources;
pub mod store;

pub mod util {
    pub mod db;
    pub mod env;
}
