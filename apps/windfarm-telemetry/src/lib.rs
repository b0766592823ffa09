pub mod bucket;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod forecast;
pub mod ingest;
pub mod mqtt;
pub mod pipeline;
pub mod routes;
pub mod state;
pub mod store;
pub mod telemetry;

#[cfg(test)]
pub mod test_support;
