// src/lib.rs — Library root for gentask

pub mod api;
pub mod cli;
pub mod core;
pub mod infra;
pub mod provider;
pub mod rules;
pub mod storage;
pub mod store;
