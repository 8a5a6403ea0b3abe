use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::rc::Rc;

use crate::{Subnet, Val};

/// One component of a table index, reduced to an orderable form. Doubles are
/// keyed by their exact bit pattern.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyAtom {
    Bool(bool),
    Int(i64),
    Count(u64),
    DoubleBits(u64),
    Str(String),
    Addr(IpAddr),
    Subnet(Subnet),
}

impl KeyAtom {
    pub fn from_val(v: &Val) -> Option<KeyAtom> {
        match v {
            Val::Bool(b) => Some(KeyAtom::Bool(*b)),
            Val::Int(n) => Some(KeyAtom::Int(*n)),
            Val::Count(n) => Some(KeyAtom::Count(*n)),
            Val::Double(x) => Some(KeyAtom::DoubleBits(x.to_bits())),
            Val::Str(s) => Some(KeyAtom::Str(s.as_ref().clone())),
            Val::Addr(a) => Some(KeyAtom::Addr(*a)),
            Val::Subnet(s) => Some(KeyAtom::Subnet(*s)),
            _ => None,
        }
    }

    pub fn to_val(&self) -> Val {
        match self {
            KeyAtom::Bool(b) => Val::Bool(*b),
            KeyAtom::Int(n) => Val::Int(*n),
            KeyAtom::Count(n) => Val::Count(*n),
            KeyAtom::DoubleBits(bits) => Val::Double(f64::from_bits(*bits)),
            KeyAtom::Str(s) => Val::Str(Rc::new(s.clone())),
            KeyAtom::Addr(a) => Val::Addr(*a),
            KeyAtom::Subnet(s) => Val::Subnet(*s),
        }
    }
}

/// A full table index: one atom per index component.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableKey(pub Vec<KeyAtom>);

impl TableKey {
    /// Builds a key from index values. `None` if any component is not a
    /// valid index type.
    pub fn from_vals(vals: &[Val]) -> Option<TableKey> {
        let mut atoms = Vec::with_capacity(vals.len());
        for v in vals {
            atoms.push(KeyAtom::from_val(v)?);
        }
        Some(TableKey(atoms))
    }

    pub fn to_vals(&self) -> Vec<Val> {
        self.0.iter().map(KeyAtom::to_val).collect()
    }
}

/// Table (and set) storage. Sets are tables whose entries carry [`Val::Nil`].
#[derive(Debug, Default, PartialEq)]
pub struct TableVal {
    pub entries: BTreeMap<TableKey, Val>,
}

impl TableVal {
    pub fn new() -> TableVal {
        TableVal::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &TableKey) -> Option<&Val> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: TableKey, val: Val) {
        self.entries.insert(key, val);
    }

    pub fn contains(&self, key: &TableKey) -> bool {
        self.entries.contains_key(key)
    }
}

impl fmt::Display for TableVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "[")?;
            for (j, atom) in k.0.iter().enumerate() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", atom.to_val())?;
            }
            write!(f, "]")?;
            if !v.is_nil() {
                write!(f, " = {v}")?;
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip() {
        let key = TableKey::from_vals(&[Val::Count(7), Val::Str(Rc::new("x".into()))]).unwrap();
        let back = key.to_vals();
        assert_eq!(back[0], Val::Count(7));
        assert_eq!(back[1], Val::Str(Rc::new("x".into())));
    }

    #[test]
    fn aggregate_indexes_are_rejected() {
        let vec_val = Val::Vector(Rc::new(std::cell::RefCell::new(vec![])));
        assert!(TableKey::from_vals(&[vec_val]).is_none());
    }

    #[test]
    fn iteration_order_is_deterministic() {
        let mut t = TableVal::new();
        for n in [3u64, 1, 2] {
            t.insert(TableKey::from_vals(&[Val::Count(n)]).unwrap(), Val::Nil);
        }
        let order: Vec<_> = t.entries.keys().cloned().collect();
        assert_eq!(
            order,
            vec![
                TableKey(vec![KeyAtom::Count(1)]),
                TableKey(vec![KeyAtom::Count(2)]),
                TableKey(vec![KeyAtom::Count(3)]),
            ]
        );
    }
}
