use std::rc::Rc;

use crate::{
    AssignLhs, ConstVal, EventHandlerRef, Expr, Ident, Operand, StmtId,
};

/// One arm of a value switch. Case literal values are carried directly; the
/// compiler inserts them into the type-specific jump table.
#[derive(Clone, Debug)]
pub struct SwitchCase {
    pub vals: Vec<ConstVal>,
    pub body: Stmt,
}

/// A `when` clause: a predicate deferred to the host trigger mechanism, a
/// body to run once it holds, and an optional timeout alternative.
#[derive(Clone, Debug)]
pub struct WhenClause {
    pub cond: Rc<Expr>,
    pub body: Rc<Stmt>,
    pub timeout: Option<(Operand, Rc<Stmt>)>,
    pub is_return: bool,
}

/// A reduced statement.
#[derive(Clone, Debug)]
pub enum Stmt {
    Null,
    List(Vec<Stmt>),
    /// An expression evaluated for its side effects (a call).
    Expr(Expr),
    Assign {
        lhs: AssignLhs,
        rhs: Expr,
    },
    /// Aggregate pre-initialization of a local, typed by the identifier.
    Init(Ident),
    If {
        cond: Expr,
        then_branch: Option<Box<Stmt>>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        /// A statement the reducer hoisted out of the condition, re-run on
        /// every trip.
        cond_prologue: Option<Box<Stmt>>,
        cond: Expr,
        body: Box<Stmt>,
    },
    Loop {
        body: Box<Stmt>,
    },
    For {
        loop_vars: Vec<Ident>,
        value_var: Option<Ident>,
        aggr: Ident,
        body: Box<Stmt>,
    },
    Switch {
        on: Operand,
        cases: Vec<SwitchCase>,
        default: Option<usize>,
    },
    Return(Option<Operand>),
    /// An inlined function body; returns inside it branch to its end,
    /// optionally assigning the returned value to `ret_var`.
    CatchReturn {
        block: Box<Stmt>,
        ret_var: Option<Ident>,
    },
    Break,
    Next,
    FallThrough,
    When(WhenClause),
    Event {
        handler: EventHandlerRef,
        args: Vec<Operand>,
    },
}

impl Stmt {
    /// Whether this statement (or the last statement of a list) is a return.
    pub fn ends_in_return(&self) -> bool {
        match self {
            Stmt::Return(_) => true,
            Stmt::List(stmts) => stmts.last().is_some_and(Stmt::ends_in_return),
            _ => false,
        }
    }
}

/// A function body as handed over by the front end: the reduced statement
/// tree plus the statement identity used to look up usage information.
#[derive(Clone, Debug)]
pub struct FuncBody {
    pub id: StmtId,
    pub stmt: Stmt,
}
