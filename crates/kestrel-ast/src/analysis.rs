use rustc_hash::{FxHashMap, FxHashSet};

use crate::Ident;

/// Identity of a statement for usage lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StmtId(pub u32);

/// What the reducer knows that the compiler needs: which identifiers are
/// compiler-synthesized temporaries. Temporaries never carry values around a
/// loop back-edge, which narrows their live ranges.
#[derive(Debug, Default)]
pub struct Reducer {
    temporaries: FxHashSet<Ident>,
}

impl Reducer {
    pub fn new() -> Reducer {
        Reducer::default()
    }

    pub fn mark_temporary(&mut self, id: Ident) {
        self.temporaries.insert(id);
    }

    pub fn is_temporary(&self, id: &Ident) -> bool {
        self.temporaries.contains(id)
    }
}

/// Per-statement live-in sets from the use-def analysis.
#[derive(Debug, Default)]
pub struct UseDefs {
    usage: FxHashMap<StmtId, FxHashSet<Ident>>,
}

impl UseDefs {
    pub fn new() -> UseDefs {
        UseDefs::default()
    }

    pub fn set_usage(&mut self, stmt: StmtId, ids: impl IntoIterator<Item = Ident>) {
        self.usage.insert(stmt, ids.into_iter().collect());
    }

    pub fn has_usage(&self, stmt: StmtId) -> bool {
        self.usage.contains_key(&stmt)
    }

    pub fn usage(&self, stmt: StmtId) -> Option<&FxHashSet<Ident>> {
        self.usage.get(&stmt)
    }

    pub fn has_id(&self, stmt: StmtId, id: &Ident) -> bool {
        self.usage(stmt).is_some_and(|ids| ids.contains(id))
    }
}

/// The function profile: every global the body reads or writes, every local
/// (including reducer temporaries), and the aggregates with initializers.
/// Orderings are the front end's traversal order, which makes frame layout
/// deterministic.
#[derive(Debug, Default)]
pub struct ProfileFunc {
    pub globals: Vec<Ident>,
    pub locals: Vec<Ident>,
    pub inits: Vec<Ident>,
}

impl ProfileFunc {
    pub fn new() -> ProfileFunc {
        ProfileFunc::default()
    }
}

/// The bundle of analysis products `compile` consumes.
#[derive(Debug, Default)]
pub struct Analyses {
    pub reducer: Reducer,
    pub usedefs: UseDefs,
    pub profile: ProfileFunc,
}
