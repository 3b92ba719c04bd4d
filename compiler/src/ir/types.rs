// types.rs - Scalar and vector value types carried by every IR expression
//
// A Type is (code, bits, lanes). Booleans are 1-bit unsigned integers.
// Vector types differ from their element type only in `lanes`.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeCode {
    Int,
    UInt,
    Float,
    Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Type {
    pub code: TypeCode,
    pub bits: u8,
    pub lanes: u16,
}

impl Type {
    pub const fn new(code: TypeCode, bits: u8, lanes: u16) -> Self {
        Type { code, bits, lanes }
    }

    pub const fn int(bits: u8) -> Self {
        Type::new(TypeCode::Int, bits, 1)
    }

    pub const fn uint(bits: u8) -> Self {
        Type::new(TypeCode::UInt, bits, 1)
    }

    pub const fn float(bits: u8) -> Self {
        Type::new(TypeCode::Float, bits, 1)
    }

    pub const fn bool() -> Self {
        Type::new(TypeCode::UInt, 1, 1)
    }

    pub const fn i32() -> Self {
        Type::int(32)
    }

    pub const fn f32() -> Self {
        Type::float(32)
    }

    pub const fn handle() -> Self {
        Type::new(TypeCode::Handle, 64, 1)
    }

    pub fn with_lanes(self, lanes: u16) -> Self {
        Type { lanes, ..self }
    }

    pub fn element_of(self) -> Self {
        self.with_lanes(1)
    }

    pub fn is_scalar(self) -> bool {
        self.lanes == 1
    }

    pub fn is_vector(self) -> bool {
        self.lanes > 1
    }

    pub fn is_bool(self) -> bool {
        self.code == TypeCode::UInt && self.bits == 1
    }

    pub fn is_float(self) -> bool {
        self.code == TypeCode::Float
    }

    pub fn is_int(self) -> bool {
        self.code == TypeCode::Int
    }

    pub fn is_uint(self) -> bool {
        self.code == TypeCode::UInt
    }

    pub fn is_int_or_uint(self) -> bool {
        self.is_int() || self.is_uint()
    }

    /// Largest representable value, as an f64 (exact for <= 53-bit integers).
    pub fn max_value(self) -> f64 {
        match self.code {
            TypeCode::Int => ((1u64 << (self.bits - 1)) - 1) as f64,
            TypeCode::UInt if self.bits >= 64 => u64::MAX as f64,
            TypeCode::UInt => ((1u64 << self.bits) - 1) as f64,
            TypeCode::Float | TypeCode::Handle => f64::INFINITY,
        }
    }

    pub fn min_value(self) -> f64 {
        match self.code {
            TypeCode::Int => -((1u64 << (self.bits - 1)) as f64),
            TypeCode::UInt | TypeCode::Handle => 0.0,
            TypeCode::Float => f64::NEG_INFINITY,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bool() {
            write!(f, "bool")?;
        } else {
            let prefix = match self.code {
                TypeCode::Int => "int",
                TypeCode::UInt => "uint",
                TypeCode::Float => "float",
                TypeCode::Handle => "handle",
            };
            write!(f, "{}{}", prefix, self.bits)?;
        }
        if self.lanes > 1 {
            write!(f, "x{}", self.lanes)?;
        }
        Ok(())
    }
}
