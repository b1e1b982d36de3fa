pub mod catalogue;
pub mod config;
pub mod connection;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod prober;
pub mod selector;
pub mod storage;
pub mod store;
pub mod telemetry;
mod wsproto;

pub mod keeper;

#[cfg(test)]
mod testing;
