// printer.rs - Textual form of the IR
//
// Expressions print on one line, fully parenthesised. Statements print one
// per line with two-space indentation per nesting level. The output is the
// canonical form hashed by the module fingerprint, so it must stay
// deterministic.

use std::fmt::{self, Display, Formatter, Write};

use super::expr::{BinOp, Expr, ExprNode};
use super::stmt::{DeviceApi, MemoryType, Stmt, StmtNode};
use super::types::Type;

fn write_list(f: &mut Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, e) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", e)?;
    }
    Ok(())
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.node() {
            ExprNode::IntImm { ty, value } => {
                if *ty == Type::i32() {
                    write!(f, "{}", value)
                } else {
                    write!(f, "({}){}", ty, value)
                }
            }
            ExprNode::UIntImm { ty, value } => {
                if ty.is_bool() {
                    f.write_str(if *value != 0 { "true" } else { "false" })
                } else {
                    write!(f, "({}){}", ty, value)
                }
            }
            ExprNode::FloatImm { ty, value } => {
                if ty.bits == 32 {
                    write!(f, "{:?}f", value)
                } else {
                    write!(f, "({}){:?}", ty, value)
                }
            }
            ExprNode::StringImm(s) => write!(f, "{:?}", s),
            ExprNode::Cast { ty, value } => write!(f, "{}({})", ty, value),
            ExprNode::Variable { name, .. } => f.write_str(name),
            ExprNode::Binary { op, a, b } => match op {
                BinOp::Min | BinOp::Max => write!(f, "{}({}, {})", op.symbol(), a, b),
                _ => write!(f, "({} {} {})", a, op.symbol(), b),
            },
            ExprNode::Cmp { op, a, b } => write!(f, "({} {} {})", a, op.symbol(), b),
            ExprNode::And { a, b } => write!(f, "({} && {})", a, b),
            ExprNode::Or { a, b } => write!(f, "({} || {})", a, b),
            ExprNode::Not { a } => write!(f, "!{}", a),
            ExprNode::Select {
                condition,
                true_value,
                false_value,
            } => write!(f, "select({}, {}, {})", condition, true_value, false_value),
            ExprNode::Load {
                name,
                index,
                predicate,
                ..
            } => {
                if predicate.is_true() || predicate_all_true(predicate) {
                    write!(f, "{}[{}]", name, index)
                } else {
                    write!(f, "({}[{}] if {})", name, index, predicate)
                }
            }
            ExprNode::Ramp {
                base,
                stride,
                lanes,
            } => write!(f, "ramp({}, {}, {})", base, stride, lanes),
            ExprNode::Broadcast { value, lanes } => write!(f, "x{}({})", lanes, value),
            ExprNode::Let { name, value, body } => {
                write!(f, "(let {} = {} in {})", name, value, body)
            }
            ExprNode::Call {
                name,
                args,
                value_index,
                ..
            } => {
                write!(f, "{}(", name)?;
                write_list(f, args)?;
                f.write_str(")")?;
                if *value_index > 0 {
                    write!(f, "[{}]", value_index)?;
                }
                Ok(())
            }
            ExprNode::Shuffle { vectors, indices } => {
                if vectors.len() == 1 && indices.len() == 1 {
                    write!(f, "extract_element({}, {})", vectors[0], indices[0])
                } else {
                    f.write_str("shuffle([")?;
                    write_list(f, vectors)?;
                    f.write_str("], [")?;
                    for (i, idx) in indices.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{}", idx)?;
                    }
                    f.write_str("])")
                }
            }
        }
    }
}

fn predicate_all_true(p: &Expr) -> bool {
    matches!(p.node(), ExprNode::Broadcast { value, .. } if value.is_true())
}

fn memory_suffix(m: MemoryType) -> &'static str {
    match m {
        MemoryType::Auto => "",
        MemoryType::Heap => " in Heap",
        MemoryType::Stack => " in Stack",
        MemoryType::Register => " in Register",
        MemoryType::GpuShared => " in GPUShared",
    }
}

struct StmtPrinter<'a, 'b> {
    out: &'a mut Formatter<'b>,
    indent: usize,
}

impl StmtPrinter<'_, '_> {
    fn pad(&mut self) -> fmt::Result {
        for _ in 0..self.indent {
            self.out.write_str("  ")?;
        }
        Ok(())
    }

    fn nested(&mut self, s: &Stmt) -> fmt::Result {
        self.indent += 1;
        self.print(s)?;
        self.indent -= 1;
        Ok(())
    }

    fn print(&mut self, s: &Stmt) -> fmt::Result {
        match s.node() {
            StmtNode::LetStmt { name, value, body } => {
                self.pad()?;
                writeln!(self.out, "let {} = {}", name, value)?;
                self.print(body)
            }
            StmtNode::AssertStmt { condition, message } => {
                self.pad()?;
                writeln!(self.out, "assert({}, {})", condition, message)
            }
            StmtNode::ProducerConsumer {
                name,
                is_producer,
                body,
            } => {
                self.pad()?;
                let kw = if *is_producer { "produce" } else { "consume" };
                writeln!(self.out, "{} {} {{", kw, name)?;
                self.nested(body)?;
                self.pad()?;
                writeln!(self.out, "}}")
            }
            StmtNode::For {
                name,
                min,
                extent,
                for_type,
                device_api,
                body,
            } => {
                self.pad()?;
                self.out.write_str(for_type.keyword())?;
                if *device_api != DeviceApi::None {
                    write!(self.out, "<{:?}>", device_api)?;
                }
                writeln!(self.out, " ({}, {}, {}) {{", name, min, extent)?;
                self.nested(body)?;
                self.pad()?;
                writeln!(self.out, "}}")
            }
            StmtNode::Store {
                name,
                value,
                index,
                predicate,
            } => {
                self.pad()?;
                write!(self.out, "{}[{}] = {}", name, index, value)?;
                if !predicate.is_true() && !predicate_all_true(predicate) {
                    write!(self.out, " if {}", predicate)?;
                }
                writeln!(self.out)
            }
            StmtNode::Provide { name, values, args } => {
                self.pad()?;
                write!(self.out, "{}(", name)?;
                write_list(self.out, args)?;
                self.out.write_str(") = ")?;
                if values.len() == 1 {
                    write!(self.out, "{}", values[0])?;
                } else {
                    self.out.write_char('{')?;
                    write_list(self.out, values)?;
                    self.out.write_char('}')?;
                }
                writeln!(self.out)
            }
            StmtNode::Allocate {
                name,
                ty,
                memory_type,
                extents,
                condition,
                body,
            } => {
                self.pad()?;
                write!(self.out, "allocate {}[{}", name, ty)?;
                for e in extents {
                    write!(self.out, " * {}", e)?;
                }
                write!(self.out, "]{}", memory_suffix(*memory_type))?;
                if !condition.is_true() {
                    write!(self.out, " if {}", condition)?;
                }
                writeln!(self.out)?;
                self.print(body)
            }
            StmtNode::Free { name } => {
                self.pad()?;
                writeln!(self.out, "free {}", name)
            }
            StmtNode::Realize {
                name,
                memory_type,
                bounds,
                condition,
                body,
                ..
            } => {
                self.pad()?;
                write!(self.out, "realize {}(", name)?;
                for (i, r) in bounds.iter().enumerate() {
                    if i > 0 {
                        self.out.write_str(", ")?;
                    }
                    write!(self.out, "[{}, {}]", r.min, r.extent)?;
                }
                write!(self.out, "){}", memory_suffix(*memory_type))?;
                if !condition.is_true() {
                    write!(self.out, " if {}", condition)?;
                }
                writeln!(self.out, " {{")?;
                self.nested(body)?;
                self.pad()?;
                writeln!(self.out, "}}")
            }
            StmtNode::Block { first, rest } => {
                self.print(first)?;
                self.print(rest)
            }
            StmtNode::Fork { first, rest } => {
                self.pad()?;
                writeln!(self.out, "fork {{")?;
                self.nested(first)?;
                self.pad()?;
                writeln!(self.out, "}} {{")?;
                self.nested(rest)?;
                self.pad()?;
                writeln!(self.out, "}}")
            }
            StmtNode::IfThenElse {
                condition,
                then_case,
                else_case,
            } => {
                self.pad()?;
                writeln!(self.out, "if ({}) {{", condition)?;
                self.nested(then_case)?;
                if let Some(e) = else_case {
                    self.pad()?;
                    writeln!(self.out, "}} else {{")?;
                    self.nested(e)?;
                }
                self.pad()?;
                writeln!(self.out, "}}")
            }
            StmtNode::Evaluate { value } => {
                self.pad()?;
                writeln!(self.out, "{}", value)
            }
            StmtNode::Acquire {
                semaphore,
                count,
                body,
            } => {
                self.pad()?;
                writeln!(self.out, "acquire ({}, {}) {{", semaphore, count)?;
                self.nested(body)?;
                self.pad()?;
                writeln!(self.out, "}}")
            }
            StmtNode::Atomic {
                mutex_name, body, ..
            } => {
                self.pad()?;
                match mutex_name {
                    Some(m) => writeln!(self.out, "atomic ({}) {{", m)?,
                    None => writeln!(self.out, "atomic {{")?,
                }
                self.nested(body)?;
                self.pad()?;
                writeln!(self.out, "}}")
            }
            StmtNode::NoOp => Ok(()),
        }
    }
}

impl Display for Stmt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        StmtPrinter { out: f, indent: 0 }.print(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ForType;

    #[test]
    fn expressions() {
        let x = Expr::var("x");
        assert_eq!((x.clone() * 2 + 1).to_string(), "((x * 2) + 1)");
        assert_eq!(Expr::min(x.clone(), Expr::int(3)).to_string(), "min(x, 3)");
        assert_eq!(
            Expr::ramp(x.clone(), Expr::int(1), 4).to_string(),
            "ramp(x, 1, 4)"
        );
        assert_eq!(Expr::broadcast(Expr::float(0.5), 8).to_string(), "x8(0.5f)");
    }

    #[test]
    fn loop_nest() {
        let body = Stmt::store("f", Expr::var("x"), Expr::var("x"), Expr::bool(true));
        let s = Stmt::for_loop("x", Expr::int(0), Expr::int(4), ForType::Serial, DeviceApi::None, body);
        assert_eq!(s.to_string(), "for (x, 0, 4) {\n  f[x] = x\n}\n");
    }
}
