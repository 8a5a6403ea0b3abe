use std::rc::Rc;

/// The semantic tag of a script type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Void,
    Bool,
    Int,
    Count,
    Counter,
    Double,
    Time,
    Interval,
    Enum,
    Port,
    Str,
    Pattern,
    Addr,
    Subnet,
    Record,
    Table,
    Vector,
    File,
    Func,
    List,
    Iter,
}

/// Collapses tag aliases onto the representation the engine actually
/// computes with: booleans and enums are ints, counters and ports are
/// counts, times and intervals are doubles.
pub fn normalized_tag(tag: TypeTag) -> TypeTag {
    match tag {
        TypeTag::Bool | TypeTag::Enum => TypeTag::Int,
        TypeTag::Counter | TypeTag::Port => TypeTag::Count,
        TypeTag::Time | TypeTag::Interval => TypeTag::Double,
        other => other,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordField {
    pub name: String,
    pub ty: TypeRef,
}

/// A script type. Aggregates carry their structure; scalars are bare tags.
#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    Void,
    Bool,
    Int,
    Count,
    Counter,
    Double,
    Time,
    Interval,
    Enum(String),
    Port,
    Str,
    Pattern,
    Addr,
    Subnet,
    Record(Vec<RecordField>),
    Table {
        index: Vec<TypeRef>,
        /// `None` for sets.
        yield_ty: Option<TypeRef>,
    },
    Vector(TypeRef),
    File,
    Func {
        params: Vec<TypeRef>,
        ret: Option<TypeRef>,
    },
    List(Vec<TypeRef>),
    Iter,
}

pub type TypeRef = Rc<Type>;

impl Type {
    pub fn tag(&self) -> TypeTag {
        match self {
            Type::Void => TypeTag::Void,
            Type::Bool => TypeTag::Bool,
            Type::Int => TypeTag::Int,
            Type::Count => TypeTag::Count,
            Type::Counter => TypeTag::Counter,
            Type::Double => TypeTag::Double,
            Type::Time => TypeTag::Time,
            Type::Interval => TypeTag::Interval,
            Type::Enum(_) => TypeTag::Enum,
            Type::Port => TypeTag::Port,
            Type::Str => TypeTag::Str,
            Type::Pattern => TypeTag::Pattern,
            Type::Addr => TypeTag::Addr,
            Type::Subnet => TypeTag::Subnet,
            Type::Record(_) => TypeTag::Record,
            Type::Table { .. } => TypeTag::Table,
            Type::Vector(_) => TypeTag::Vector,
            Type::File => TypeTag::File,
            Type::Func { .. } => TypeTag::Func,
            Type::List(_) => TypeTag::List,
            Type::Iter => TypeTag::Iter,
        }
    }

    /// Whether values of this type own heap storage the engine must release
    /// on slot reassignment and frame teardown.
    pub fn is_managed(&self) -> bool {
        matches!(
            self.tag(),
            TypeTag::Str
                | TypeTag::Pattern
                | TypeTag::Record
                | TypeTag::Table
                | TypeTag::Vector
                | TypeTag::File
                | TypeTag::Func
                | TypeTag::List
        )
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Type::Table { yield_ty: None, .. })
    }

    /// The element type produced by indexing or iterating this aggregate.
    pub fn yield_type(&self) -> Option<&TypeRef> {
        match self {
            Type::Table { yield_ty, .. } => yield_ty.as_ref(),
            Type::Vector(elem) => Some(elem),
            _ => None,
        }
    }

    pub fn record_fields(&self) -> Option<&[RecordField]> {
        match self {
            Type::Record(fields) => Some(fields),
            _ => None,
        }
    }
}

/// Builds a structureless type for a scalar tag. Aggregate tags get their
/// degenerate shape; callers that care about structure construct `Type`
/// directly.
pub fn base_type(tag: TypeTag) -> TypeRef {
    Rc::new(match tag {
        TypeTag::Void => Type::Void,
        TypeTag::Bool => Type::Bool,
        TypeTag::Int => Type::Int,
        TypeTag::Count => Type::Count,
        TypeTag::Counter => Type::Counter,
        TypeTag::Double => Type::Double,
        TypeTag::Time => Type::Time,
        TypeTag::Interval => Type::Interval,
        TypeTag::Enum => Type::Enum(String::new()),
        TypeTag::Port => Type::Port,
        TypeTag::Str => Type::Str,
        TypeTag::Pattern => Type::Pattern,
        TypeTag::Addr => Type::Addr,
        TypeTag::Subnet => Type::Subnet,
        TypeTag::Record => Type::Record(Vec::new()),
        TypeTag::Table => Type::Table {
            index: Vec::new(),
            yield_ty: None,
        },
        TypeTag::Vector => Type::Vector(Rc::new(Type::Void)),
        TypeTag::File => Type::File,
        TypeTag::Func => Type::Func {
            params: Vec::new(),
            ret: None,
        },
        TypeTag::List => Type::List(Vec::new()),
        TypeTag::Iter => Type::Iter,
    })
}
