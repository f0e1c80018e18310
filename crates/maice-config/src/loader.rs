// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::{Config, OrchestratorMode};

/// Ordered list of config file locations searched from lowest to highest
/// priority. Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/maice/config.yaml"));
    paths.push(PathBuf::from("/etc/maice/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/maice/config.yaml"));
        paths.push(home.join(".config/maice/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".maice/config.yaml"));
    paths.push(PathBuf::from("maice.yaml"));
    paths.push(PathBuf::from("maice.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files, then applying
/// environment overrides. `extra` may provide an explicit path (the
/// `--config` CLI flag); it is the highest-priority file layer.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_yaml(&mut merged, read_layer(&path)?);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        merge_yaml(&mut merged, read_layer(p)?);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).context("deserializing merged config")?
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

fn read_layer(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Apply the environment-variable overrides for the documented option
/// table. Variable names are the option names uppercased; unparseable
/// values are logged and ignored.
pub fn apply_env_overrides<F>(config: &mut Config, get: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = get("ORCHESTRATOR_MODE") {
        match v.to_ascii_lowercase().as_str() {
            "centralized" => config.orchestrator.mode = OrchestratorMode::Centralized,
            "decentralized" => config.orchestrator.mode = OrchestratorMode::Decentralized,
            other => warn!(value = other, "ignoring unknown ORCHESTRATOR_MODE"),
        }
    }
    if let Some(v) = flag(&get, "FORCE_NON_STREAMING") {
        config.pipeline.force_non_streaming = v;
    }
    if let Some(v) = flag(&get, "AUTO_PROMOTE_AFTER_CLARIFICATION") {
        config.orchestrator.auto_promote_after_clarification = v;
    }
    if let Some(v) = number(&get, "CHUNK_GAP_TIMEOUT_MS") {
        config.pipeline.chunk_gap_timeout_ms = v;
    }
    if let Some(v) = number(&get, "MAX_BUFFER_BYTES") {
        config.pipeline.max_buffer_bytes = v as usize;
    }
    if let Some(v) = number(&get, "VISIBILITY_TIMEOUT_SEC") {
        config.bus.visibility_timeout_sec = v;
    }
    if let Some(v) = number(&get, "REQUEST_TIMEOUT_SEC") {
        config.orchestrator.request_timeout_sec = v;
    }
    if let Some(v) = number(&get, "DRAIN_TIMEOUT_SEC") {
        config.runtime.drain_timeout_sec = v;
    }
    if let Some(v) = number(&get, "MAX_ATTEMPTS") {
        config.runtime.max_attempts = v as u32;
    }
}

fn flag<F: Fn(&str) -> Option<String>>(get: &F, name: &str) -> Option<bool> {
    match get(name)?.trim() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        other => {
            warn!(option = name, value = other, "ignoring unparseable flag");
            None
        }
    }
}

fn number<F: Fn(&str) -> Option<String>>(get: &F, name: &str) -> Option<u64> {
    match get(name)?.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(option = name, "ignoring unparseable number");
            None
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
