//! Pass configuration, parsed from the same string option map the rest of
//! the compiler pipeline carries around.

use crate::VmapError;
use fv_core::{CompatibilityMode, Primitive, SideEffect};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const OPTION_MODE: &str = "vmap.mode";
pub const OPTION_IO_ALLOWLIST: &str = "vmap.io_allowlist";
pub const OPTION_MAX_SWEEPS: &str = "vmap.max_sweeps";

pub const DEFAULT_MAX_SWEEPS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassConfig {
    pub mode: CompatibilityMode,
    /// I/O primitives that may appear inside a vmap scope.
    pub io_side_effect_allowlist: Vec<Primitive>,
    pub max_sweeps: usize,
    /// Option keys hardened mode ignored.
    #[serde(default)]
    pub unknown_options: Vec<String>,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            mode: CompatibilityMode::Strict,
            io_side_effect_allowlist: vec![Primitive::Print],
            max_sweeps: DEFAULT_MAX_SWEEPS,
            unknown_options: Vec::new(),
        }
    }
}

impl PassConfig {
    /// Parse `vmap.*` keys. Keys outside that set are rejected in strict
    /// mode and recorded in hardened mode.
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self, VmapError> {
        let mut config = Self::default();

        if let Some(raw) = options.get(OPTION_MODE) {
            config.mode = match raw.trim().to_ascii_lowercase().as_str() {
                "strict" => CompatibilityMode::Strict,
                "hardened" => CompatibilityMode::Hardened,
                _ => return Err(invalid(OPTION_MODE, raw, "expected strict or hardened")),
            };
        }

        if let Some(raw) = options.get(OPTION_IO_ALLOWLIST) {
            config.io_side_effect_allowlist = parse_allowlist(raw)?;
        }

        if let Some(raw) = options.get(OPTION_MAX_SWEEPS) {
            config.max_sweeps = match raw.trim().parse::<usize>() {
                Ok(value) if value > 0 => value,
                _ => return Err(invalid(OPTION_MAX_SWEEPS, raw, "expected a positive integer")),
            };
        }

        let known = [OPTION_MODE, OPTION_IO_ALLOWLIST, OPTION_MAX_SWEEPS];
        let unknown: Vec<String> = options
            .keys()
            .filter(|key| !known.contains(&key.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            if config.mode == CompatibilityMode::Strict {
                return Err(VmapError::UnknownOptions { keys: unknown });
            }
            config.unknown_options = unknown;
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_mode(mut self, mode: CompatibilityMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn allows_io(&self, primitive: Primitive) -> bool {
        self.io_side_effect_allowlist.contains(&primitive)
    }
}

fn invalid(key: &str, value: &str, detail: &'static str) -> VmapError {
    VmapError::InvalidOption {
        key: key.to_owned(),
        value: value.to_owned(),
        detail,
    }
}

fn parse_allowlist(raw: &str) -> Result<Vec<Primitive>, VmapError> {
    let mut out = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let primitive = Primitive::from_name(name)
            .ok_or_else(|| invalid(OPTION_IO_ALLOWLIST, raw, "unknown primitive name"))?;
        if primitive.side_effect() != SideEffect::Io {
            return Err(invalid(
                OPTION_IO_ALLOWLIST,
                raw,
                "only I/O side-effecting primitives can be allowlisted",
            ));
        }
        if !out.contains(&primitive) {
            out.push(primitive);
        }
    }
    Ok(out)
}
