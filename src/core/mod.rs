// src/core/mod.rs — Orchestration and billing core

pub mod concurrency;
pub mod entitlement;
pub mod ledger;
pub mod lifecycle;
pub mod materializer;
pub mod pricing;
pub mod reaper;
pub mod types;
pub mod worker;
