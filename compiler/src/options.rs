// options.rs - Lowering configuration
//
// Everything that used to be ambient (debug verbosity, tracing toggles,
// FPGA overlay knobs) is an explicit field here and is threaded through the
// orchestrator. Loadable from JSON so the CLI can take an options file.

use serde::{Deserialize, Serialize};

use crate::target::Target;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LowerOptions {
    pub target: Target,
    /// Name of the lowered entry point. Empty means "use the first output's
    /// name".
    pub pipeline_name: String,
    /// 0 is quiet; 1 logs pass timings; 2 and up also logs the IR after each
    /// pass.
    pub debug_level: u8,
    /// Emit pipeline begin/end trace events even when no function is traced.
    pub trace_pipeline: bool,
    /// Device kernels wait for an explicit launch instead of running as soon
    /// as their inputs arrive.
    pub disable_autorun: bool,
    /// Number of overlay instances requested for offloaded kernels.
    pub overlay_count: u32,
    /// Emit the `<name>_legacy` wrapper (never emitted for JIT targets).
    pub legacy_wrapper: bool,
}

impl Default for LowerOptions {
    fn default() -> Self {
        LowerOptions {
            target: Target::host(),
            pipeline_name: String::new(),
            debug_level: 0,
            trace_pipeline: false,
            disable_autorun: false,
            overlay_count: 0,
            legacy_wrapper: true,
        }
    }
}

impl LowerOptions {
    pub fn for_target(target: Target) -> Self {
        LowerOptions {
            target,
            ..Default::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
