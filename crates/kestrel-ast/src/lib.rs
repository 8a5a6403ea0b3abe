#![forbid(unsafe_code)]

//! The reduced form of script function bodies that the kestrel compiler
//! consumes, together with the front-end analysis products it relies on.
//!
//! The front end (parser, type checker, reducer) is a collaborator; this
//! crate only defines the shapes it hands over: expressions in three-address
//! form whose operands are names or constants, statements with structured
//! control flow, and the per-function analysis summaries.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

mod analysis;
mod expr;
mod stmt;
mod types;

pub use analysis::{Analyses, ProfileFunc, Reducer, StmtId, UseDefs};
pub use expr::{
    expr_ids, AssignLhs, BinOp, CallExpr, ConstVal, ConstructElem, ConstructKind, Expr, InIndex,
    Operand, UnOp,
};
pub use stmt::{FuncBody, Stmt, SwitchCase, WhenClause};
pub use types::{base_type, normalized_tag, RecordField, Type, TypeRef, TypeTag};

/// Where an identifier lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdScope {
    Local,
    Param,
    Global,
}

#[derive(Debug)]
struct IdentData {
    name: String,
    ty: TypeRef,
    scope: IdScope,
    /// Offset in the host interpreter's variable frame. Rewritten in place
    /// when the compiler remaps that frame.
    offset: Cell<usize>,
}

/// A source variable. Identity is by allocation, not by name: two bodies can
/// each have their own `i`.
#[derive(Clone)]
pub struct Ident(Rc<IdentData>);

impl Ident {
    pub fn new(name: impl Into<String>, ty: TypeRef, scope: IdScope, offset: usize) -> Ident {
        Ident(Rc::new(IdentData {
            name: name.into(),
            ty,
            scope,
            offset: Cell::new(offset),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn ty(&self) -> &TypeRef {
        &self.0.ty
    }

    pub fn scope(&self) -> IdScope {
        self.0.scope
    }

    pub fn is_global(&self) -> bool {
        self.0.scope == IdScope::Global
    }

    pub fn offset(&self) -> usize {
        self.0.offset.get()
    }

    pub fn set_offset(&self, offset: usize) {
        self.0.offset.set(offset);
    }
}

impl PartialEq for Ident {
    fn eq(&self, other: &Ident) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Ident {}

impl std::hash::Hash for Ident {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Debug for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

/// The calling flavor of a script function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FuncFlavor {
    Function,
    Hook,
    EventHandler,
}

/// Per-function metadata shared between the compiler, the engine, and the
/// host. A function may have multiple bodies (event handlers and hooks), all
/// of which share one interpreter frame size.
#[derive(Debug)]
pub struct FuncInfo {
    pub name: String,
    pub flavor: FuncFlavor,
    pub params: Vec<Ident>,
    pub ret: Option<TypeRef>,
    frame_size: Cell<usize>,
}

impl FuncInfo {
    pub fn new(
        name: impl Into<String>,
        flavor: FuncFlavor,
        params: Vec<Ident>,
        ret: Option<TypeRef>,
    ) -> FuncInfo {
        let frame_size = Cell::new(params.len());
        FuncInfo {
            name: name.into(),
            flavor,
            params,
            ret,
            frame_size,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size.get()
    }

    pub fn set_frame_size(&self, size: usize) {
        self.frame_size.set(size);
    }
}

pub type FuncRef = Rc<FuncInfo>;

/// An event handler the engine raises through the host runtime.
#[derive(Debug)]
pub struct EventHandler {
    pub name: String,
}

pub type EventHandlerRef = Rc<EventHandler>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_identity_is_by_allocation() {
        let a = Ident::new("i", base_type(TypeTag::Count), IdScope::Local, 0);
        let b = Ident::new("i", base_type(TypeTag::Count), IdScope::Local, 0);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn offsets_are_rewritable_through_clones() {
        let a = Ident::new("x", base_type(TypeTag::Int), IdScope::Param, 3);
        let alias = a.clone();
        a.set_offset(1);
        assert_eq!(alias.offset(), 1);
    }
}
