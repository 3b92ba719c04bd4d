// stmt.rs - Immutable statement nodes
//
// Same sharing discipline as `Expr`: `Stmt` wraps an `Rc<StmtNode>`.

use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::expr::{Expr, Range};
use super::types::Type;

/// How a loop executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForType {
    Serial,
    Parallel,
    Vectorized,
    Unrolled,
    Extern,
    GpuBlock,
    GpuThread,
    GpuLane,
}

impl ForType {
    pub fn is_parallel(self) -> bool {
        matches!(
            self,
            ForType::Parallel
                | ForType::Vectorized
                | ForType::GpuBlock
                | ForType::GpuThread
                | ForType::GpuLane
        )
    }

    pub fn is_gpu(self) -> bool {
        matches!(self, ForType::GpuBlock | ForType::GpuThread | ForType::GpuLane)
    }

    pub fn keyword(self) -> &'static str {
        match self {
            ForType::Serial => "for",
            ForType::Parallel => "parallel",
            ForType::Vectorized => "vectorized",
            ForType::Unrolled => "unrolled",
            ForType::Extern => "extern",
            ForType::GpuBlock => "gpu_block",
            ForType::GpuThread => "gpu_thread",
            ForType::GpuLane => "gpu_lane",
        }
    }
}

/// Which device a loop (and everything inside it) runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceApi {
    /// Inherit from the enclosing loop.
    None,
    Host,
    DefaultGpu,
    Cuda,
    OpenCl,
    Metal,
    Hexagon,
    IntelFpga,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemoryType {
    #[default]
    Auto,
    Heap,
    Stack,
    Register,
    GpuShared,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtNode {
    LetStmt {
        name: String,
        value: Expr,
        body: Stmt,
    },
    AssertStmt {
        condition: Expr,
        message: Expr,
    },
    ProducerConsumer {
        name: String,
        is_producer: bool,
        body: Stmt,
    },
    For {
        name: String,
        min: Expr,
        extent: Expr,
        for_type: ForType,
        device_api: DeviceApi,
        body: Stmt,
    },
    Store {
        name: String,
        value: Expr,
        index: Expr,
        predicate: Expr,
    },
    Provide {
        name: String,
        values: Vec<Expr>,
        args: Vec<Expr>,
    },
    Allocate {
        name: String,
        ty: Type,
        memory_type: MemoryType,
        extents: Vec<Expr>,
        condition: Expr,
        body: Stmt,
    },
    Free {
        name: String,
    },
    Realize {
        name: String,
        types: Vec<Type>,
        memory_type: MemoryType,
        bounds: Vec<Range>,
        condition: Expr,
        body: Stmt,
    },
    Block {
        first: Stmt,
        rest: Stmt,
    },
    Fork {
        first: Stmt,
        rest: Stmt,
    },
    IfThenElse {
        condition: Expr,
        then_case: Stmt,
        else_case: Option<Stmt>,
    },
    Evaluate {
        value: Expr,
    },
    Acquire {
        semaphore: Expr,
        count: Expr,
        body: Stmt,
    },
    /// Body executes atomically with respect to other iterations.
    Atomic {
        producer_name: String,
        mutex_name: Option<String>,
        body: Stmt,
    },
    NoOp,
}

#[derive(Clone)]
pub struct Stmt(Rc<StmtNode>);

impl Deref for Stmt {
    type Target = StmtNode;

    fn deref(&self) -> &StmtNode {
        &self.0
    }
}

impl PartialEq for Stmt {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl fmt::Debug for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<StmtNode> for Stmt {
    fn from(node: StmtNode) -> Self {
        Stmt(Rc::new(node))
    }
}

impl Default for Stmt {
    fn default() -> Self {
        Stmt::no_op()
    }
}

impl Stmt {
    pub fn node(&self) -> &StmtNode {
        &self.0
    }

    pub fn same_as(&self, other: &Stmt) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn no_op() -> Stmt {
        StmtNode::NoOp.into()
    }

    pub fn is_no_op(&self) -> bool {
        matches!(self.node(), StmtNode::NoOp)
    }

    pub fn let_stmt(name: impl Into<String>, value: Expr, body: Stmt) -> Stmt {
        StmtNode::LetStmt {
            name: name.into(),
            value,
            body,
        }
        .into()
    }

    pub fn assert(condition: Expr, message: Expr) -> Stmt {
        StmtNode::AssertStmt { condition, message }.into()
    }

    pub fn producer(name: impl Into<String>, body: Stmt) -> Stmt {
        StmtNode::ProducerConsumer {
            name: name.into(),
            is_producer: true,
            body,
        }
        .into()
    }

    pub fn consumer(name: impl Into<String>, body: Stmt) -> Stmt {
        StmtNode::ProducerConsumer {
            name: name.into(),
            is_producer: false,
            body,
        }
        .into()
    }

    pub fn for_loop(
        name: impl Into<String>,
        min: Expr,
        extent: Expr,
        for_type: ForType,
        device_api: DeviceApi,
        body: Stmt,
    ) -> Stmt {
        StmtNode::For {
            name: name.into(),
            min,
            extent,
            for_type,
            device_api,
            body,
        }
        .into()
    }

    pub fn store(name: impl Into<String>, value: Expr, index: Expr, predicate: Expr) -> Stmt {
        StmtNode::Store {
            name: name.into(),
            value,
            index,
            predicate,
        }
        .into()
    }

    pub fn provide(name: impl Into<String>, values: Vec<Expr>, args: Vec<Expr>) -> Stmt {
        StmtNode::Provide {
            name: name.into(),
            values,
            args,
        }
        .into()
    }

    pub fn allocate(
        name: impl Into<String>,
        ty: Type,
        memory_type: MemoryType,
        extents: Vec<Expr>,
        body: Stmt,
    ) -> Stmt {
        StmtNode::Allocate {
            name: name.into(),
            ty,
            memory_type,
            extents,
            condition: Expr::bool(true),
            body,
        }
        .into()
    }

    pub fn free(name: impl Into<String>) -> Stmt {
        StmtNode::Free { name: name.into() }.into()
    }

    pub fn realize(
        name: impl Into<String>,
        types: Vec<Type>,
        memory_type: MemoryType,
        bounds: Vec<Range>,
        body: Stmt,
    ) -> Stmt {
        StmtNode::Realize {
            name: name.into(),
            types,
            memory_type,
            bounds,
            condition: Expr::bool(true),
            body,
        }
        .into()
    }

    /// Sequence two statements, dropping no-ops.
    pub fn block(first: Stmt, rest: Stmt) -> Stmt {
        if first.is_no_op() {
            rest
        } else if rest.is_no_op() {
            first
        } else {
            StmtNode::Block { first, rest }.into()
        }
    }

    /// Right-nested block over a list of statements.
    pub fn block_of(stmts: impl IntoIterator<Item = Stmt>) -> Stmt {
        let stmts: Vec<Stmt> = stmts.into_iter().collect();
        stmts
            .into_iter()
            .rev()
            .fold(Stmt::no_op(), |acc, s| Stmt::block(s, acc))
    }

    pub fn fork(first: Stmt, rest: Stmt) -> Stmt {
        StmtNode::Fork { first, rest }.into()
    }

    pub fn if_then_else(condition: Expr, then_case: Stmt, else_case: Option<Stmt>) -> Stmt {
        StmtNode::IfThenElse {
            condition,
            then_case,
            else_case,
        }
        .into()
    }

    pub fn evaluate(value: Expr) -> Stmt {
        StmtNode::Evaluate { value }.into()
    }

    pub fn acquire(semaphore: Expr, count: Expr, body: Stmt) -> Stmt {
        StmtNode::Acquire {
            semaphore,
            count,
            body,
        }
        .into()
    }

    pub fn atomic(producer_name: impl Into<String>, mutex_name: Option<String>, body: Stmt) -> Stmt {
        StmtNode::Atomic {
            producer_name: producer_name.into(),
            mutex_name,
            body,
        }
        .into()
    }

    /// Flatten nested `Block`s into their sequence of statements.
    pub fn flatten_block(&self) -> Vec<Stmt> {
        let mut out = Vec::new();
        let mut pending = vec![self.clone()];
        while let Some(s) = pending.pop() {
            match s.node() {
                StmtNode::Block { first, rest } => {
                    pending.push(rest.clone());
                    pending.push(first.clone());
                }
                StmtNode::NoOp => {}
                _ => out.push(s),
            }
        }
        out
    }
}
