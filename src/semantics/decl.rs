use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::meta::ObjectDescription;
use super::types::{ClosureContextType, FunctionType, ValueType};
use super::value::Value;

/// Storage class of a declared variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarKind {
    /// Function-local slot
    Local,
    /// Module-level global slot
    Global,
    /// A name under the built-in type mangling prefix; reads redirect to
    /// an `anyref` global imported from the dynamic runtime
    BuiltinGlobal,
}

/// Placement of a captured variable inside its owning closure context.
#[derive(Clone, Debug)]
pub struct Capture {
    pub context: Rc<ClosureContextType>,
    /// Position in the context's free-variable list; the record slot is
    /// `1 + index` (slot 0 links to the parent record)
    pub index: usize,
}

/// A variable declaration attached to a function or to the module.
#[derive(Debug)]
pub struct VarDeclareNode {
    pub name: String,
    pub value_type: ValueType,
    pub kind: VarKind,
    /// Set when the variable is captured by an inner closure; reads and
    /// writes then go through the context chain instead of a local slot
    pub capture: Option<Capture>,
    /// Initializer for globals, run by `_start`
    pub init: Option<Value>,
}

impl VarDeclareNode {
    pub fn local(name: impl Into<String>, value_type: ValueType) -> Rc<Self> {
        Rc::new(VarDeclareNode {
            name: name.into(),
            value_type,
            kind: VarKind::Local,
            capture: None,
            init: None,
        })
    }

    pub fn global(name: impl Into<String>, value_type: ValueType, init: Option<Value>) -> Rc<Self> {
        Rc::new(VarDeclareNode {
            name: name.into(),
            value_type,
            kind: VarKind::Global,
            capture: None,
            init,
        })
    }
}

/// A user parameter of a function declaration.
#[derive(Clone, Debug)]
pub struct ParamDeclare {
    pub name: String,
    pub value_type: ValueType,
    /// Default initializer, evaluated at the call site when the argument
    /// is absent
    pub default: Option<Value>,
    pub capture: Option<Capture>,
}

impl ParamDeclare {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        ParamDeclare {
            name: name.into(),
            value_type,
            default: None,
            capture: None,
        }
    }
}

/// A function declaration in the semantics tree.
///
/// `name` and `func_type` sit behind `RefCell`s because generic
/// specialization mutates the declaration in place while emitting a
/// specialized instance and restores the original state afterwards.
#[derive(Debug)]
pub struct FunctionDeclareNode {
    pub name: RefCell<String>,
    pub func_type: RefCell<Rc<FunctionType>>,
    pub params: Vec<ParamDeclare>,
    pub vars: Vec<Rc<VarDeclareNode>>,
    pub body: Vec<Value>,
    pub exported: bool,
    /// The context record this function allocates for variables captured
    /// by its inner closures, if any
    pub owns_context: Option<Rc<ClosureContextType>>,
    /// The context chain this function receives through its `@context`
    /// parameter
    pub parent_context: Option<Rc<ClosureContextType>>,
    /// `Some` for methods and constructors: the concrete receiver type
    pub this_type: Option<ValueType>,
    /// Emitted specializations of a generic declaration, keyed by the
    /// tuple of argument type ids
    pub specializations: RefCell<HashMap<Vec<u32>, String>>,
}

impl FunctionDeclareNode {
    pub fn new(name: impl Into<String>, func_type: FunctionType) -> Self {
        FunctionDeclareNode {
            name: RefCell::new(name.into()),
            func_type: RefCell::new(Rc::new(func_type)),
            params: Vec::new(),
            vars: Vec::new(),
            body: Vec::new(),
            exported: false,
            owns_context: None,
            parent_context: None,
            this_type: None,
            specializations: RefCell::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    pub fn func_type(&self) -> Rc<FunctionType> {
        Rc::clone(&self.func_type.borrow())
    }
}

/// The root of the semantics tree handed to the back end: declared types,
/// functions, module globals and the top-level statements run by `_start`.
#[derive(Debug, Default)]
pub struct SemanticsModule {
    pub name: String,
    pub classes: Vec<Rc<ObjectDescription>>,
    pub functions: Vec<Rc<FunctionDeclareNode>>,
    pub globals: Vec<Rc<VarDeclareNode>>,
    pub top_level: Vec<Value>,
}

impl SemanticsModule {
    pub fn new(name: impl Into<String>) -> Self {
        SemanticsModule {
            name: name.into(),
            ..Default::default()
        }
    }
}
