//! Process-wide debug settings.
//!
//! Values are read once from `NEO_*` environment variables. None of them are part of
//! the stable contract; they exist to force code paths during diagnostics.

use crate::command_stream::dispatch_flags::DispatchMode;
use std::env;
use std::sync::OnceLock;
use tracing::warn;

const ENV_PREFIX: &str = "NEO_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugSettings {
    /// Overrides the CSR dispatch mode chosen by the device.
    pub csr_dispatch_mode: Option<DispatchMode>,
    /// Forces the GEM close worker on or off.
    pub enable_gem_close_worker: Option<bool>,
    /// Forces direct submission on or off.
    pub enable_direct_submission: Option<bool>,
    /// Bitmask of `EngineType::bit()` values allowed to use direct submission.
    pub direct_submission_engines: Option<u32>,
    /// Restricts engine creation to a single node ordinal.
    pub node_ordinal: Option<u32>,
    /// Forces VM-bind based residency on or off.
    pub use_vm_bind: Option<bool>,
    /// Creates a private VM for every OS context instead of one per sub-device.
    pub per_context_vm: bool,
    /// Notifies the KM-DAF listener about locks of command/linear-stream allocations.
    pub use_kmd_daf: bool,
    pub make_resident_before_lock_attempts: u32,
    pub temporary_resource_make_resident_attempts: u32,
    pub command_buffer_size: usize,
    pub direct_submission_ring_size: usize,
    pub spin_wait_micros: u64,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            csr_dispatch_mode: None,
            enable_gem_close_worker: None,
            enable_direct_submission: None,
            direct_submission_engines: None,
            node_ordinal: None,
            use_vm_bind: None,
            per_context_vm: false,
            use_kmd_daf: false,
            make_resident_before_lock_attempts: 3,
            temporary_resource_make_resident_attempts: 2,
            command_buffer_size: 64 * 1024,
            direct_submission_ring_size: 128 * 1024,
            spin_wait_micros: 20,
        }
    }
}

impl DebugSettings {
    /// Reads settings from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// Builds settings from an arbitrary key lookup (keys without the `NEO_` prefix).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(v) = lookup("CSR_DISPATCH_MODE") {
            settings.csr_dispatch_mode = parse_or_warn("CSR_DISPATCH_MODE", &v, |s| {
                match s.to_ascii_lowercase().as_str() {
                    "immediate" | "1" => Some(DispatchMode::ImmediateDispatch),
                    "batched" | "2" => Some(DispatchMode::BatchedDispatch),
                    _ => None,
                }
            });
        }
        if let Some(v) = lookup("ENABLE_GEM_CLOSE_WORKER") {
            settings.enable_gem_close_worker = parse_or_warn("ENABLE_GEM_CLOSE_WORKER", &v, parse_bool);
        }
        if let Some(v) = lookup("ENABLE_DIRECT_SUBMISSION") {
            settings.enable_direct_submission =
                parse_or_warn("ENABLE_DIRECT_SUBMISSION", &v, parse_bool);
        }
        if let Some(v) = lookup("DIRECT_SUBMISSION_ENGINES") {
            settings.direct_submission_engines =
                parse_or_warn("DIRECT_SUBMISSION_ENGINES", &v, parse_u32);
        }
        if let Some(v) = lookup("NODE_ORDINAL") {
            settings.node_ordinal = parse_or_warn("NODE_ORDINAL", &v, parse_u32);
        }
        if let Some(v) = lookup("USE_VM_BIND") {
            settings.use_vm_bind = parse_or_warn("USE_VM_BIND", &v, parse_bool);
        }
        if let Some(v) = lookup("PER_CONTEXT_VM")
            && let Some(b) = parse_or_warn("PER_CONTEXT_VM", &v, parse_bool)
        {
            settings.per_context_vm = b;
        }
        if let Some(v) = lookup("USE_KMD_DAF")
            && let Some(b) = parse_or_warn("USE_KMD_DAF", &v, parse_bool)
        {
            settings.use_kmd_daf = b;
        }
        if let Some(v) = lookup("MAKE_RESIDENT_BEFORE_LOCK_ATTEMPTS")
            && let Some(n) = parse_or_warn("MAKE_RESIDENT_BEFORE_LOCK_ATTEMPTS", &v, parse_u32)
            && n > 0
        {
            settings.make_resident_before_lock_attempts = n;
        }
        if let Some(v) = lookup("TEMPORARY_RESOURCE_MAKE_RESIDENT_ATTEMPTS")
            && let Some(n) =
                parse_or_warn("TEMPORARY_RESOURCE_MAKE_RESIDENT_ATTEMPTS", &v, parse_u32)
            && n > 0
        {
            settings.temporary_resource_make_resident_attempts = n;
        }
        if let Some(v) = lookup("COMMAND_BUFFER_SIZE")
            && let Some(n) = parse_or_warn("COMMAND_BUFFER_SIZE", &v, |s| s.parse::<usize>().ok())
            && n >= 4096
        {
            settings.command_buffer_size = n;
        }
        if let Some(v) = lookup("DIRECT_SUBMISSION_RING_SIZE")
            && let Some(n) =
                parse_or_warn("DIRECT_SUBMISSION_RING_SIZE", &v, |s| s.parse::<usize>().ok())
            && n >= 4096
        {
            settings.direct_submission_ring_size = n;
        }
        if let Some(v) = lookup("SPIN_WAIT_MICROS")
            && let Some(n) = parse_or_warn("SPIN_WAIT_MICROS", &v, |s| s.parse::<u64>().ok())
        {
            settings.spin_wait_micros = n;
        }

        settings
    }
}

fn parse_or_warn<T>(name: &str, value: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let parsed = parse(value.trim());
    if parsed.is_none() {
        warn!(setting = name, value, "ignoring invalid debug setting");
    }
    parsed
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

fn parse_u32(s: &str) -> Option<u32> {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .map_or_else(|| s.parse().ok(), |hex| u32::from_str_radix(hex, 16).ok())
}

static DEBUG_SETTINGS: OnceLock<DebugSettings> = OnceLock::new();

/// Returns the process-wide settings, reading the environment on first use.
pub fn debug_settings() -> &'static DebugSettings {
    DEBUG_SETTINGS.get_or_init(DebugSettings::from_env)
}
