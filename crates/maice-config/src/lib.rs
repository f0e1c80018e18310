// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod loader;
pub mod schema;

pub use loader::load;
pub use schema::{
    BusConfig, Config, EvalConfig, MetricsConfig, OrchestratorConfig, OrchestratorMode,
    PipelineConfig, RuntimeConfig, StoreConfig,
};
