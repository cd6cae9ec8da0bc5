use std::rc::Rc;

use super::meta::ObjectDescription;

/// Canonical resolved type representation used throughout the lowering
/// pipeline. The set is closed; union and type-parameter wrappers are
/// resolved to concrete members before lowering whenever possible.
#[derive(Clone)]
pub enum ValueType {
    /// IEEE 754 binary64 number
    Number,
    /// Unsigned 32-bit integer
    Int,
    /// Truth value, represented as i32 0/1
    Boolean,
    /// Immutable string value, `{hash: i32, chars: array<i8>}`
    String,
    /// The `null` literal type
    Null,
    /// The `undefined` literal type
    Undefined,
    /// No-value type for statements and value-less returns
    Void,
    /// Dynamically-typed handle managed by the external runtime
    Any,
    /// Union of several member types
    Union(Vec<ValueType>),
    /// Homogeneous growable sequence with a single element type
    Array(Box<ValueType>),
    /// Function signature, including the synthetic environment parameters
    Function(Rc<FunctionType>),
    /// Class or interface instance described by its `meta`
    Object(Rc<ObjectDescription>),
    /// Record of captured free variables plus a parent pointer
    ClosureContext(Rc<ClosureContextType>),
    /// Unsubstituted generic parameter
    TypeParameter(Rc<TypeParameter>),
}

/// Fixed numeric ids for the primitive types. Object ids come from the
/// upstream resolver via the description; composites derive their id from
/// their parts. Ids feed generic name mangling and interface type tags.
const TYPE_ID_NUMBER: u32 = 1;
const TYPE_ID_INT: u32 = 2;
const TYPE_ID_BOOLEAN: u32 = 3;
const TYPE_ID_STRING: u32 = 4;
const TYPE_ID_NULL: u32 = 5;
const TYPE_ID_UNDEFINED: u32 = 6;
const TYPE_ID_VOID: u32 = 7;
const TYPE_ID_ANY: u32 = 8;

impl ValueType {
    /// Stable numeric id of this type, used for name mangling of generic
    /// specializations and for the type tags stored in interface boxes.
    pub fn type_id(&self) -> u32 {
        match self {
            ValueType::Number => TYPE_ID_NUMBER,
            ValueType::Int => TYPE_ID_INT,
            ValueType::Boolean => TYPE_ID_BOOLEAN,
            ValueType::String => TYPE_ID_STRING,
            ValueType::Null => TYPE_ID_NULL,
            ValueType::Undefined => TYPE_ID_UNDEFINED,
            ValueType::Void => TYPE_ID_VOID,
            ValueType::Any => TYPE_ID_ANY,
            ValueType::Union(members) => members
                .iter()
                .fold(23u32, |acc, m| acc.wrapping_mul(31).wrapping_add(m.type_id())),
            ValueType::Array(element) => element.type_id().wrapping_mul(31).wrapping_add(16),
            ValueType::Function(func) => {
                let mut id = 17u32;
                for param in &func.params {
                    id = id.wrapping_mul(31).wrapping_add(param.type_id());
                }
                id.wrapping_mul(31).wrapping_add(func.return_type.type_id())
            }
            ValueType::Object(meta) => meta.type_id,
            ValueType::ClosureContext(ctx) => ctx.id,
            ValueType::TypeParameter(param) => param.index as u32,
        }
    }

    /// Whether this type is an interface (an object whose description has
    /// no concrete storage).
    pub fn is_interface(&self) -> bool {
        matches!(self, ValueType::Object(meta) if meta.is_interface)
    }

    /// Whether this type is a concrete (non-interface) object.
    pub fn is_concrete_object(&self) -> bool {
        matches!(self, ValueType::Object(meta) if !meta.is_interface)
    }
}

impl PartialEq for ValueType {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Union(l), Self::Union(r)) => l == r,
            (Self::Array(l), Self::Array(r)) => l == r,
            (Self::Function(l), Self::Function(r)) => l == r,
            // Object identity is nominal: the resolver assigns one id per
            // declaration, so comparing ids is comparing declarations.
            (Self::Object(l), Self::Object(r)) => l.type_id == r.type_id,
            (Self::ClosureContext(l), Self::ClosureContext(r)) => l.id == r.id,
            (Self::TypeParameter(l), Self::TypeParameter(r)) => {
                l.name == r.name && l.index == r.index
            }
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl Eq for ValueType {}

impl std::hash::Hash for ValueType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            ValueType::Union(members) => members.hash(state),
            ValueType::Array(element) => element.hash(state),
            ValueType::Function(func) => func.hash(state),
            ValueType::Object(meta) => meta.type_id.hash(state),
            ValueType::ClosureContext(ctx) => ctx.id.hash(state),
            ValueType::TypeParameter(param) => {
                param.name.hash(state);
                param.index.hash(state);
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number => write!(f, "Number"),
            Self::Int => write!(f, "Int"),
            Self::Boolean => write!(f, "Boolean"),
            Self::String => write!(f, "String"),
            Self::Null => write!(f, "Null"),
            Self::Undefined => write!(f, "Undefined"),
            Self::Void => write!(f, "Void"),
            Self::Any => write!(f, "Any"),
            Self::Union(members) => f.debug_tuple("Union").field(members).finish(),
            Self::Array(element) => f.debug_tuple("Array").field(element).finish(),
            Self::Function(func) => f.write_fmt(format_args!(
                "({}) -> {:?}",
                func.params
                    .iter()
                    .map(|p| format!("{p:?}"))
                    .collect::<Vec<_>>()
                    .join(", "),
                func.return_type
            )),
            Self::Object(meta) => {
                if meta.is_interface {
                    f.write_fmt(format_args!("interface {}", meta.name))
                } else {
                    f.write_fmt(format_args!("class {}", meta.name))
                }
            }
            Self::ClosureContext(ctx) => f.write_fmt(format_args!("context#{}", ctx.id)),
            Self::TypeParameter(param) => f.write_fmt(format_args!("{}#{}", param.name, param.index)),
        }
    }
}

/// Resolved function signature. `params` holds the *user* parameters only;
/// the synthetic `@context` (and `@this` for methods) prefix is described
/// by `env_param_count`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    /// Ordered user parameter types
    pub params: Vec<ValueType>,
    /// One flag per user parameter: whether it may be omitted at the call
    /// site (omitted slots are pre-initialized with boxed `undefined`)
    pub optional_mask: Vec<bool>,
    /// Index of the rest parameter among `params`, if any
    pub rest_index: Option<usize>,
    /// Number of leading synthetic parameters: 1 for plain functions
    /// (`@context`), 2 for methods and constructors (`@context`, `@this`)
    pub env_param_count: usize,
    /// Result type; `Void` for value-less functions
    pub return_type: ValueType,
    /// Generic parameters of the declaration; empty for monomorphic types
    pub type_params: Vec<Rc<TypeParameter>>,
    /// Explicit type arguments attached by the resolver at a generic call
    /// site; empty everywhere else
    pub specialization_args: Vec<ValueType>,
}

impl FunctionType {
    pub fn new(params: Vec<ValueType>, return_type: ValueType) -> Self {
        let optional_mask = vec![false; params.len()];
        FunctionType {
            params,
            optional_mask,
            rest_index: None,
            env_param_count: 1,
            return_type,
            type_params: Vec::new(),
            specialization_args: Vec::new(),
        }
    }

    /// Same signature with the method environment (`@context`, `@this`).
    pub fn method(params: Vec<ValueType>, return_type: ValueType) -> Self {
        let mut ty = Self::new(params, return_type);
        ty.env_param_count = 2;
        ty
    }

    pub fn is_generic(&self) -> bool {
        !self.type_params.is_empty()
    }

    pub fn requests_specialization(&self) -> bool {
        !self.specialization_args.is_empty()
    }
}

impl std::fmt::Debug for FunctionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "fn({:?}) -> {:?}",
            self.params, self.return_type
        ))
    }
}

/// A generic parameter of a function declaration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeParameter {
    pub name: String,
    /// Upper bound, if the declaration constrains the parameter
    pub bound: Option<ValueType>,
    /// Position among the declaration's type parameters
    pub index: usize,
    /// Default argument used when the call site omits this parameter
    pub default: Option<ValueType>,
}

/// A closure environment record: the captured free variables of one scope
/// plus a pointer to the parent record. Records form a singly linked chain
/// by their first slot; the root of the chain is the null reference of the
/// empty-struct top type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosureContextType {
    /// Unique id assigned by the scope builder
    pub id: u32,
    pub parent: Option<Rc<ClosureContextType>>,
    /// Captured variables in declaration order; may be empty for
    /// pass-through scopes that allocate no record of their own
    pub vars: Vec<ContextVar>,
}

impl ClosureContextType {
    /// Whether this scope materializes a record at runtime. Scopes without
    /// captured variables reuse their parent's record instead.
    pub fn is_materialized(&self) -> bool {
        !self.vars.is_empty()
    }

    /// The nearest context in the parent chain (including `self`) that
    /// materializes a record, i.e. the static type of the context
    /// reference a function in this scope actually receives.
    pub fn effective(self: &Rc<Self>) -> Option<Rc<ClosureContextType>> {
        let mut cur = Some(Rc::clone(self));
        while let Some(ctx) = cur {
            if ctx.is_materialized() {
                return Some(ctx);
            }
            cur = ctx.parent.clone();
        }
        None
    }
}

/// One captured free variable inside a closure context record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextVar {
    pub name: String,
    pub value_type: ValueType,
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[test]
    fn test_primitive_type_ids_are_distinct() {
        let prims = [
            ValueType::Number,
            ValueType::Int,
            ValueType::Boolean,
            ValueType::String,
            ValueType::Null,
            ValueType::Undefined,
            ValueType::Void,
            ValueType::Any,
        ];
        let mut seen = std::collections::HashSet::new();
        for ty in &prims {
            assert!(seen.insert(ty.type_id()), "duplicate id for {ty:?}");
        }
    }

    #[test]
    fn test_array_id_depends_on_element() {
        let numbers = ValueType::Array(Box::new(ValueType::Number));
        let strings = ValueType::Array(Box::new(ValueType::String));
        assert_ne!(numbers.type_id(), strings.type_id());
        assert_eq!(
            numbers.type_id(),
            ValueType::Array(Box::new(ValueType::Number)).type_id()
        );
    }

    #[test]
    fn test_effective_context_skips_pass_through_links() {
        let root = Rc::new(ClosureContextType {
            id: 1,
            parent: None,
            vars: vec![ContextVar {
                name: "x".into(),
                value_type: ValueType::Number,
            }],
        });
        let pass_through = Rc::new(ClosureContextType {
            id: 2,
            parent: Some(Rc::clone(&root)),
            vars: vec![],
        });
        let effective = pass_through.effective().expect("root captures a var");
        assert_eq!(effective.id, root.id);
    }
}
