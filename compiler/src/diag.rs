// diag.rs - Unified diagnostics model
//
// Shared diagnostic types used by the scheduling layer and every lowering
// pass. Errors travel inside `crate::error::Error::User`; warnings are
// collected on the `Pipeline` and the lowered `Module`.
//
// A diagnostic names what it is about through `subject`, a stage or
// function rendered the way users write it (`f.update(0)`, `blur_x`).

use std::fmt;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0101`, `W0002`).
///
/// Codes are `&'static str` constants defined in the `codes` module. Once
/// assigned, a code keeps its meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    // E01xx: stage scheduling primitives
    pub const E0101_UNKNOWN_DIM: DiagCode = DiagCode("E0101");
    pub const E0102_DIM_EXISTS: DiagCode = DiagCode("E0102");
    pub const E0103_BAD_FACTOR: DiagCode = DiagCode("E0103");
    pub const E0104_BAD_TAIL: DiagCode = DiagCode("E0104");
    pub const E0105_NOT_ADJACENT: DiagCode = DiagCode("E0105");
    pub const E0106_DUPLICATE_DIM: DiagCode = DiagCode("E0106");
    pub const E0107_NOT_ASSOCIATIVE: DiagCode = DiagCode("E0107");
    pub const E0108_RACE: DiagCode = DiagCode("E0108");
    pub const E0109_DOUBLE_VECTORIZE: DiagCode = DiagCode("E0109");
    pub const E0110_RFACTOR: DiagCode = DiagCode("E0110");
    pub const E0111_SPECIALIZE: DiagCode = DiagCode("E0111");
    pub const E0112_COMPUTE_WITH: DiagCode = DiagCode("E0112");

    // E02xx: function model
    pub const E0201_UNDEFINED_FUNC: DiagCode = DiagCode("E0201");
    pub const E0202_REDEFINITION: DiagCode = DiagCode("E0202");
    pub const E0203_ARITY: DiagCode = DiagCode("E0203");
    pub const E0204_BAD_BOUND: DiagCode = DiagCode("E0204");
    pub const E0205_WRAPPER: DiagCode = DiagCode("E0205");
    pub const E0206_EXTERN: DiagCode = DiagCode("E0206");
    pub const E0207_BAD_UPDATE: DiagCode = DiagCode("E0207");

    // E03xx: lowering
    pub const E0301_BAD_LOOP_LEVEL: DiagCode = DiagCode("E0301");
    pub const E0302_INLINE_UPDATE: DiagCode = DiagCode("E0302");
    pub const E0303_UNBOUNDED: DiagCode = DiagCode("E0303");
    pub const E0304_MEMOIZE_LEVEL: DiagCode = DiagCode("E0304");
    pub const E0305_COMPUTE_WITH_GROUP: DiagCode = DiagCode("E0305");
    pub const E0306_NO_GPU: DiagCode = DiagCode("E0306");
    pub const E0307_UNROLL_EXTENT: DiagCode = DiagCode("E0307");
    pub const E0308_CYCLE: DiagCode = DiagCode("E0308");
    pub const E0309_OFFLOAD: DiagCode = DiagCode("E0309");
    pub const E0310_GPU_NESTING: DiagCode = DiagCode("E0310");

    // E04xx: vectorization
    pub const E0401_VECTOR_EXTENT: DiagCode = DiagCode("E0401");

    // E05xx: argument inference
    pub const E0501_UNDECLARED: DiagCode = DiagCode("E0501");
    pub const E0502_BAD_ARG: DiagCode = DiagCode("E0502");

    // E06xx: reference interpreter
    pub const E0601_ASSERTION: DiagCode = DiagCode("E0601");
    pub const E0602_OUT_OF_BOUNDS: DiagCode = DiagCode("E0602");
    pub const E0603_MISSING_INPUT: DiagCode = DiagCode("E0603");

    // W0xxx: warnings
    pub const W0001_UNPROVEN_REDUCTION: DiagCode = DiagCode("W0001");
    pub const W0002_NESTED_VECTORIZE: DiagCode = DiagCode("W0002");
    pub const W0003_COMPUTE_WITH_REPLACED: DiagCode = DiagCode("W0003");
    pub const W0004_NON_REDUCTION_RFACTOR: DiagCode = DiagCode("W0004");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Related context ──────────────────────────────────────────────────────

/// A secondary stage or function that explains a diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct Related {
    pub subject: String,
    pub label: String,
}

// ── Cause record ─────────────────────────────────────────────────────────

/// One link in a cause chain explaining a propagated failure.
#[derive(Debug, Clone, PartialEq)]
pub struct CauseRecord {
    pub message: String,
    pub subject: Option<String>,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub subject: Option<String>,
    pub message: String,
    pub hint: Option<String>,
    pub related: Vec<Related>,
    pub cause_chain: Vec<CauseRecord>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            subject: None,
            message: message.into(),
            hint: None,
            related: Vec::new(),
            cause_chain: Vec::new(),
        }
    }

    pub fn error(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, message).with_code(code)
    }

    pub fn warning(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, message).with_code(code)
    }

    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Name the stage or function this diagnostic is about.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_related(mut self, subject: impl Into<String>, label: impl Into<String>) -> Self {
        self.related.push(Related {
            subject: subject.into(),
            label: label.into(),
        });
        self
    }

    pub fn with_cause(mut self, message: impl Into<String>, subject: Option<String>) -> Self {
        self.cause_chain.push(CauseRecord {
            message: message.into(),
            subject,
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        for r in &self.related {
            write!(f, "\n  note: {}: {}", r.subject, r.label)?;
        }
        for c in &self.cause_chain {
            match &c.subject {
                Some(s) => write!(f, "\n  caused by: {} ({})", c.message, s)?,
                None => write!(f, "\n  caused by: {}", c.message)?,
            }
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_code() {
        let d = Diagnostic::new(DiagLevel::Error, "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code() {
        let d = Diagnostic::warning(codes::W0002_NESTED_VECTORIZE, "nested vectorized loop");
        assert_eq!(format!("{d}"), "warning[W0002]: nested vectorized loop");
    }

    #[test]
    fn builder_chain() {
        let d = Diagnostic::error(codes::E0101_UNKNOWN_DIM, "could not find dimension z")
            .with_subject("f.update(0)")
            .with_hint("dims are x, y, __outermost")
            .with_related("g", "called from here")
            .with_cause("split of z", None);

        assert_eq!(d.code, Some(codes::E0101_UNKNOWN_DIM));
        assert_eq!(d.hint.as_deref(), Some("dims are x, y, __outermost"));
        assert_eq!(d.related.len(), 1);
        assert_eq!(d.cause_chain.len(), 1);
        assert_eq!(
            d.to_string(),
            "error[E0101]: could not find dimension z\n  note: g: called from here\n  caused by: split of z\n  hint: dims are x, y, __outermost"
        );
    }
}
