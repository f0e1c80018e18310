// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub eval: EvalConfig,
}

/// Who owns routing decisions between agents.
///
/// Only `centralized` is implemented: the orchestrator consumes verdicts
/// and promotion signals from coordination topics and publishes the next
/// hop itself. `decentralized` is accepted for forward compatibility and
/// treated as centralized with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorMode {
    #[default]
    Centralized,
    Decentralized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub mode: OrchestratorMode,
    /// Per-request deadline; also the session-lease TTL.
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,
    /// How long to wait for a classifier verdict before defaulting to the
    /// answerer and logging a degraded event.
    #[serde(default = "default_classifier_timeout_sec")]
    pub classifier_timeout_sec: u64,
    /// How long to wait for the clarifier's first question.
    #[serde(default = "default_clarify_timeout_sec")]
    pub clarify_timeout_sec: u64,
    /// On clarifier timeout, promote the request to the answerer instead
    /// of surfacing an error.
    #[serde(default)]
    pub auto_promote_after_clarification: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_chunk_gap_timeout_ms")]
    pub chunk_gap_timeout_ms: u64,
    /// Per-session client buffer; beyond this, intermediate chunks are
    /// dropped (control events never are).
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
    /// Flush when the reorder buffer is holding a gap wider than this many
    /// indices.
    #[serde(default = "default_max_gap")]
    pub max_gap: u64,
    /// Answerer emits a single chunk with `is_final = true`.
    #[serde(default)]
    pub force_non_streaming: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Unacked deliveries reappear after this long.
    #[serde(default = "default_visibility_timeout_sec")]
    pub visibility_timeout_sec: u64,
    /// Deliveries beyond this count route the message to the dead-letter
    /// channel.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    /// Per-stream retention bound applied by `trim`.
    #[serde(default = "default_trim_max_entries")]
    pub trim_max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_drain_timeout_sec")]
    pub drain_timeout_sec: u64,
    #[serde(default = "default_heartbeat_interval_sec")]
    pub heartbeat_interval_sec: u64,
    /// Heartbeat hash TTL; absence past this marks the agent degraded.
    #[serde(default = "default_heartbeat_ttl_sec")]
    pub heartbeat_ttl_sec: u64,
    /// Cool-down after three consecutive behavior panics on one consumer.
    #[serde(default = "default_panic_cooldown_sec")]
    pub panic_cooldown_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How many trailing messages a session snapshot carries.
    #[serde(default = "default_snapshot_limit")]
    pub snapshot_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_flush_interval_sec")]
    pub flush_interval_sec: u64,
    /// Retention bound for per-session processing-log streams.
    #[serde(default = "default_log_trim_entries")]
    pub log_trim_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Worker-pool width for batch evaluation.
    #[serde(default = "default_eval_parallelism")]
    pub parallelism: usize,
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl OrchestratorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }
    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_secs(self.classifier_timeout_sec)
    }
    pub fn clarify_timeout(&self) -> Duration {
        Duration::from_secs(self.clarify_timeout_sec)
    }
}

impl PipelineConfig {
    pub fn chunk_gap_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_gap_timeout_ms)
    }
}

impl BusConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_sec)
    }
}

impl RuntimeConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_sec)
    }
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec)
    }
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_sec)
    }
    pub fn panic_cooldown(&self) -> Duration {
        Duration::from_secs(self.panic_cooldown_sec)
    }
}

impl MetricsConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_sec)
    }
}

// ── Serde defaults ────────────────────────────────────────────────────────────

fn default_request_timeout_sec() -> u64 {
    120
}
fn default_classifier_timeout_sec() -> u64 {
    15
}
fn default_clarify_timeout_sec() -> u64 {
    20
}
fn default_chunk_gap_timeout_ms() -> u64 {
    2000
}
fn default_max_buffer_bytes() -> usize {
    1_048_576
}
fn default_max_gap() -> u64 {
    20
}
fn default_visibility_timeout_sec() -> u64 {
    30
}
fn default_max_deliveries() -> u32 {
    5
}
fn default_trim_max_entries() -> usize {
    1000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_drain_timeout_sec() -> u64 {
    30
}
fn default_heartbeat_interval_sec() -> u64 {
    15
}
fn default_heartbeat_ttl_sec() -> u64 {
    60
}
fn default_panic_cooldown_sec() -> u64 {
    60
}
fn default_snapshot_limit() -> usize {
    20
}
fn default_flush_interval_sec() -> u64 {
    5
}
fn default_log_trim_entries() -> usize {
    500
}
fn default_eval_parallelism() -> usize {
    4
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: OrchestratorMode::default(),
            request_timeout_sec: default_request_timeout_sec(),
            classifier_timeout_sec: default_classifier_timeout_sec(),
            clarify_timeout_sec: default_clarify_timeout_sec(),
            auto_promote_after_clarification: false,
        }
    }
}
impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_gap_timeout_ms: default_chunk_gap_timeout_ms(),
            max_buffer_bytes: default_max_buffer_bytes(),
            max_gap: default_max_gap(),
            force_non_streaming: false,
        }
    }
}
impl Default for BusConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_sec: default_visibility_timeout_sec(),
            max_deliveries: default_max_deliveries(),
            trim_max_entries: default_trim_max_entries(),
        }
    }
}
impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            drain_timeout_sec: default_drain_timeout_sec(),
            heartbeat_interval_sec: default_heartbeat_interval_sec(),
            heartbeat_ttl_sec: default_heartbeat_ttl_sec(),
            panic_cooldown_sec: default_panic_cooldown_sec(),
        }
    }
}
impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_limit: default_snapshot_limit(),
        }
    }
}
impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            flush_interval_sec: default_flush_interval_sec(),
            log_trim_entries: default_log_trim_entries(),
        }
    }
}
impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            parallelism: default_eval_parallelism(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
