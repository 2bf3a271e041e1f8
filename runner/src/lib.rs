pub mod collate;
pub mod config;
pub mod executors;
pub mod fsops;
pub mod layout;
pub mod lifecycle;
pub mod manifest;
pub mod retention;
pub mod sync;

#[cfg(test)]
mod config_test;
#[cfg(test)]
mod lifecycle_test;
