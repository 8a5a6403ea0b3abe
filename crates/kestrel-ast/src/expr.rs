use kestrel_value::Val;

use crate::{Ident, TypeRef};

/// A literal embedded in the reduced AST, carrying its script type.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstVal {
    pub val: Val,
    pub ty: TypeRef,
}

impl ConstVal {
    pub fn new(val: Val, ty: TypeRef) -> ConstVal {
        ConstVal { val, ty }
    }
}

/// A three-address operand: a named variable or a constant.
#[derive(Clone, Debug)]
pub enum Operand {
    Name(Ident),
    Const(ConstVal),
}

impl Operand {
    pub fn ty(&self) -> &TypeRef {
        match self {
            Operand::Name(id) => id.ty(),
            Operand::Const(c) => &c.ty,
        }
    }

    pub fn as_name(&self) -> Option<&Ident> {
        match self {
            Operand::Name(id) => Some(id),
            Operand::Const(_) => None,
        }
    }

    pub fn as_const(&self) -> Option<&ConstVal> {
        match self {
            Operand::Const(c) => Some(c),
            Operand::Name(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn is_relational(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    /// The relation with its operands exchanged; arithmetic ops are their
    /// own flip only when commutative.
    pub fn flipped(&self) -> BinOp {
        match self {
            BinOp::Lt => BinOp::Gt,
            BinOp::Le => BinOp::Ge,
            BinOp::Gt => BinOp::Lt,
            BinOp::Ge => BinOp::Le,
            other => *other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

/// The left-hand side of an `in` test.
#[derive(Clone, Debug)]
pub enum InIndex {
    One(Operand),
    Two(Operand, Operand),
    List(Vec<Operand>),
}

#[derive(Clone, Debug)]
pub struct CallExpr {
    /// A global identifier names a direct callee; a local one holds a
    /// function value and forces the indirect call path.
    pub callee: Ident,
    pub args: Vec<Operand>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstructKind {
    Table,
    Set,
    Record,
    Vector,
}

/// One element of a constructor literal.
#[derive(Clone, Debug)]
pub enum ConstructElem {
    /// Set members, record field values (in declaration order), vector
    /// elements.
    Positional(Operand),
    /// Table entries: index components plus the yield value.
    Keyed { indexes: Vec<Operand>, val: Operand },
}

/// A reduced expression. Every subexpression has already been flattened to
/// an [`Operand`] by the reducer.
#[derive(Clone, Debug)]
pub enum Expr {
    Name(Ident),
    Const(ConstVal),
    Binary {
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
    Unary {
        op: UnOp,
        operand: Operand,
    },
    Coerce {
        target: TypeRef,
        operand: Operand,
    },
    Index {
        aggr: Ident,
        indexes: Vec<Operand>,
    },
    Field {
        record: Ident,
        field: usize,
    },
    HasField {
        record: Ident,
        field: usize,
    },
    In {
        item: InIndex,
        aggr: Operand,
    },
    Size {
        aggr: Operand,
    },
    Call(CallExpr),
    Construct {
        kind: ConstructKind,
        ty: TypeRef,
        elems: Vec<ConstructElem>,
    },
}

/// The destination of an assignment statement.
#[derive(Clone, Debug)]
pub enum AssignLhs {
    Name(Ident),
    Index { aggr: Ident, indexes: Vec<Operand> },
    Field { record: Ident, field: usize },
}

fn operand_ids(op: &Operand, out: &mut Vec<Ident>) {
    if let Operand::Name(id) = op {
        out.push(id.clone());
    }
}

/// All identifiers an expression reads, in encounter order with duplicates.
/// Used when locals must be flushed to the interpreter frame before an
/// expression is handed to the host for deferred evaluation.
pub fn expr_ids(e: &Expr) -> Vec<Ident> {
    let mut out = Vec::new();
    match e {
        Expr::Name(id) => out.push(id.clone()),
        Expr::Const(_) => {}
        Expr::Binary { lhs, rhs, .. } => {
            operand_ids(lhs, &mut out);
            operand_ids(rhs, &mut out);
        }
        Expr::Unary { operand, .. } => operand_ids(operand, &mut out),
        Expr::Coerce { operand, .. } => operand_ids(operand, &mut out),
        Expr::Index { aggr, indexes } => {
            out.push(aggr.clone());
            for ix in indexes {
                operand_ids(ix, &mut out);
            }
        }
        Expr::Field { record, .. } | Expr::HasField { record, .. } => out.push(record.clone()),
        Expr::In { item, aggr } => {
            match item {
                InIndex::One(op) => operand_ids(op, &mut out),
                InIndex::Two(a, b) => {
                    operand_ids(a, &mut out);
                    operand_ids(b, &mut out);
                }
                InIndex::List(ops) => {
                    for op in ops {
                        operand_ids(op, &mut out);
                    }
                }
            }
            operand_ids(aggr, &mut out);
        }
        Expr::Size { aggr } => operand_ids(aggr, &mut out),
        Expr::Call(call) => {
            out.push(call.callee.clone());
            for a in &call.args {
                operand_ids(a, &mut out);
            }
        }
        Expr::Construct { elems, .. } => {
            for elem in elems {
                match elem {
                    ConstructElem::Positional(op) => operand_ids(op, &mut out),
                    ConstructElem::Keyed { indexes, val } => {
                        for ix in indexes {
                            operand_ids(ix, &mut out);
                        }
                        operand_ids(val, &mut out);
                    }
                }
            }
        }
    }
    out
}
