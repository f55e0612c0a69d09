pub mod admin_service;
pub mod discovery;
pub mod elasticsearch_service;
pub mod fetcher;
pub mod index_writer;
pub mod monitor;
pub mod queue;
pub mod rate_limiter;
pub mod scheduler;
pub mod token_manager;
