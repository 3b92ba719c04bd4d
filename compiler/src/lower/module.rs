// module.rs - The result of lowering
//
// A `Module` is what the code generator consumes: the lowered entry point
// (plus the legacy-ABI wrapper unless the target is JIT), constant buffers
// embedded by value, device kernels split off by offloading, and the
// warnings collected along the way. `fingerprint()` hashes the printed IR
// so two lowerings of the same pipeline can be compared cheaply.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::diag::Diagnostic;
use crate::func::ConstBuffer;
use crate::ir::{Stmt, Type};
use crate::target::Target;

// ── Arguments ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ArgumentKind {
    InputScalar,
    InputBuffer,
    OutputBuffer,
}

/// One parameter of a lowered function, in calling-convention order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub kind: ArgumentKind,
    pub ty: Type,
    /// Zero for scalars.
    pub dimensions: usize,
}

impl Argument {
    pub fn scalar(name: impl Into<String>, ty: Type) -> Self {
        Argument {
            name: name.into(),
            kind: ArgumentKind::InputScalar,
            ty,
            dimensions: 0,
        }
    }

    pub fn input_buffer(name: impl Into<String>, ty: Type, dimensions: usize) -> Self {
        Argument {
            name: name.into(),
            kind: ArgumentKind::InputBuffer,
            ty,
            dimensions,
        }
    }

    pub fn output_buffer(name: impl Into<String>, ty: Type, dimensions: usize) -> Self {
        Argument {
            name: name.into(),
            kind: ArgumentKind::OutputBuffer,
            ty,
            dimensions,
        }
    }

    pub fn is_buffer(&self) -> bool {
        self.kind != ArgumentKind::InputScalar
    }
}

impl From<&crate::func::Param> for Argument {
    fn from(p: &crate::func::Param) -> Self {
        Argument::scalar(p.name.clone(), p.ty)
    }
}

impl From<&crate::func::ImageParam> for Argument {
    fn from(p: &crate::func::ImageParam) -> Self {
        Argument::input_buffer(p.name.clone(), p.ty, p.dims)
    }
}

// ── Functions and kernels ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Linkage {
    External,
    /// Calling convention kept for older runtimes: every argument is passed
    /// as a buffer or scalar pointer.
    ExternalLegacy,
    Internal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoweredFunc {
    pub name: String,
    pub args: Vec<Argument>,
    pub body: Stmt,
    pub linkage: Linkage,
}

/// A loop nest extracted for a device by an `OffloadCompiler`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceKernel {
    pub name: String,
    pub device: String,
    pub args: Vec<Argument>,
    pub body: Stmt,
    pub autorun: bool,
    pub overlay_count: u32,
}

// ── Module ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub name: String,
    pub target: Target,
    pub functions: Vec<LoweredFunc>,
    pub buffers: Vec<ConstBuffer>,
    pub kernels: Vec<DeviceKernel>,
    pub warnings: Vec<Diagnostic>,
}

impl Module {
    /// The entry point: the first function with external linkage.
    pub fn entry(&self) -> Option<&LoweredFunc> {
        self.functions
            .iter()
            .find(|f| f.linkage == Linkage::External)
    }

    pub fn function(&self, name: &str) -> Option<&LoweredFunc> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// SHA-256 over the printed IR of every function and kernel, in order.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for f in &self.functions {
            hasher.update(f.name.as_bytes());
            hasher.update(b"\n");
            hasher.update(f.body.to_string().as_bytes());
        }
        for k in &self.kernels {
            hasher.update(k.name.as_bytes());
            hasher.update(b"\n");
            hasher.update(k.body.to_string().as_bytes());
        }
        let digest = hasher.finalize();
        let mut s = String::with_capacity(64);
        for b in digest.iter() {
            let _ = write!(s, "{:02x}", b);
        }
        s
    }

    pub fn summary(&self) -> ModuleSummary {
        ModuleSummary {
            name: self.name.clone(),
            target: self.target.to_string(),
            functions: self
                .functions
                .iter()
                .map(|f| FunctionSummary {
                    name: f.name.clone(),
                    linkage: f.linkage,
                    args: f.args.clone(),
                })
                .collect(),
            buffers: self.buffers.iter().map(|b| b.name.clone()).collect(),
            kernels: self.kernels.iter().map(|k| k.name.clone()).collect(),
            warnings: self.warnings.iter().map(|w| w.to_string()).collect(),
            fingerprint: self.fingerprint(),
        }
    }
}

/// Serializable view of a module for `--emit json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSummary {
    pub name: String,
    pub target: String,
    pub functions: Vec<FunctionSummary>,
    pub buffers: Vec<String>,
    pub kernels: Vec<String>,
    pub warnings: Vec<String>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSummary {
    pub name: String,
    pub linkage: Linkage,
    pub args: Vec<Argument>,
}
