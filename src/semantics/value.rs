use std::rc::Rc;

use super::decl::{FunctionDeclareNode, VarDeclareNode};
use super::meta::ObjectDescription;
use super::types::{FunctionType, ValueType};

/// One node of the semantics tree. The set of kinds is closed; every kind
/// has exactly one lowering (`codegen::expressions`), and an unhandled kind
/// is a hard compile-time failure, never a silent fallback.
#[derive(Clone, Debug)]
pub enum Value {
    Literal(LiteralValue),
    ArrayLiteral(ArrayLiteralValue),
    ObjectLiteral(ObjectLiteralValue),
    VarRead(VarReadValue),
    VarWrite(VarWriteValue),
    Binary(BinaryValue),
    Unary(UnaryValue),
    Conditional(ConditionalValue),
    Call(CallValue),
    New(NewValue),
    NewArray(NewArrayValue),
    FieldGet(FieldGetValue),
    FieldSet(FieldSetValue),
    StaticGet(StaticGetValue),
    StaticSet(StaticSetValue),
    ElementGet(ElementGetValue),
    ElementSet(ElementSetValue),
    Closure(ClosureValue),
    Cast(CastValue),
    TypeOf(TypeOfValue),
    ToString(ToStringValue),
    Block(BlockValue),
    Branch(BranchValue),
    BranchIf(BranchIfValue),
    Return(ReturnValue),
}

impl Value {
    /// Static type of the value this node produces; `Void` for nodes that
    /// leave nothing on the stack.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Literal(v) => v.value_type(),
            Value::ArrayLiteral(v) => v.ty.clone(),
            Value::ObjectLiteral(v) => ValueType::Object(Rc::clone(&v.meta)),
            Value::VarRead(v) => v.ty.clone(),
            Value::VarWrite(_) => ValueType::Void,
            Value::Binary(v) => v.ty.clone(),
            Value::Unary(v) => v.ty.clone(),
            Value::Conditional(v) => v.ty.clone(),
            Value::Call(v) => v.ty.clone(),
            Value::New(v) => ValueType::Object(Rc::clone(&v.meta)),
            Value::NewArray(v) => v.ty.clone(),
            Value::FieldGet(v) => v.ty.clone(),
            Value::FieldSet(_) => ValueType::Void,
            Value::StaticGet(v) => v.ty.clone(),
            Value::StaticSet(_) => ValueType::Void,
            Value::ElementGet(v) => v.ty.clone(),
            Value::ElementSet(_) => ValueType::Void,
            Value::Closure(v) => ValueType::Function(v.decl.func_type()),
            Value::Cast(v) => v.to.clone(),
            Value::TypeOf(_) => ValueType::Any,
            Value::ToString(_) => ValueType::Any,
            Value::Block(v) => v.result.clone().unwrap_or(ValueType::Void),
            Value::Branch(_) | Value::BranchIf(_) | Value::Return(_) => ValueType::Void,
        }
    }
}

/// A literal constant.
#[derive(Clone, Debug)]
pub enum LiteralValue {
    Number(f64),
    Int(u32),
    Boolean(bool),
    /// `raw` strings still carry their escape sequences and are
    /// pre-processed during lowering
    String { value: String, raw: bool },
    Null,
    Undefined,
}

impl LiteralValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            LiteralValue::Number(_) => ValueType::Number,
            LiteralValue::Int(_) => ValueType::Int,
            LiteralValue::Boolean(_) => ValueType::Boolean,
            LiteralValue::String { .. } => ValueType::String,
            LiteralValue::Null => ValueType::Null,
            LiteralValue::Undefined => ValueType::Undefined,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ArrayLiteralValue {
    pub element_type: ValueType,
    pub elements: Vec<Value>,
    pub ty: ValueType,
}

/// An object literal: positional initializers for the description's
/// non-static fields, in field order. `None` slots are filled with
/// `undefined` boxed to `Any`. Methods come from the description itself.
#[derive(Clone, Debug)]
pub struct ObjectLiteralValue {
    pub meta: Rc<ObjectDescription>,
    pub fields: Vec<Option<Value>>,
}

#[derive(Clone, Debug)]
pub struct VarReadValue {
    pub decl: Rc<VarDeclareNode>,
    pub ty: ValueType,
}

/// Assignment operator; compound forms lower as `left = left op right`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    pub fn binary(self) -> Option<BinaryOperator> {
        match self {
            AssignOp::Assign => None,
            AssignOp::Add => Some(BinaryOperator::Add),
            AssignOp::Sub => Some(BinaryOperator::Sub),
            AssignOp::Mul => Some(BinaryOperator::Mul),
            AssignOp::Div => Some(BinaryOperator::Div),
        }
    }
}

#[derive(Clone, Debug)]
pub struct VarWriteValue {
    pub decl: Rc<VarDeclareNode>,
    pub op: AssignOp,
    pub value: Box<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Shl,
    BitAnd,
    BitOr,
    LogicalAnd,
    LogicalOr,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOperator {
    pub fn is_comparison(self) -> bool {
        use BinaryOperator::*;
        matches!(self, Eq | Ne | StrictEq | StrictNe | Lt | Le | Gt | Ge)
    }
}

#[derive(Clone, Debug)]
pub struct BinaryValue {
    pub op: BinaryOperator,
    pub left: Box<Value>,
    pub right: Box<Value>,
    pub ty: ValueType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Neg,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

#[derive(Clone, Debug)]
pub struct UnaryValue {
    pub op: UnaryOperator,
    pub operand: Box<Value>,
    pub ty: ValueType,
}

#[derive(Clone, Debug)]
pub struct ConditionalValue {
    pub cond: Box<Value>,
    pub then_value: Box<Value>,
    pub else_value: Box<Value>,
    pub ty: ValueType,
}

/// How a call site resolves. The lowering further splits `Method` into
/// vtable, interface and dynamic dispatch based on the receiver's static
/// type.
#[derive(Clone, Debug)]
pub enum Callee {
    /// Statically resolved function, including `super(...)`
    Direct(Rc<FunctionDeclareNode>),
    /// A callable value whose runtime form is a closure struct
    Closure {
        value: Box<Value>,
        func_type: Rc<FunctionType>,
    },
    /// Member call on an object, interface or `any` receiver
    Method {
        receiver: Box<Value>,
        member: String,
    },
    /// Static method of a class, resolved by walking the base chain
    Static {
        class: Rc<ObjectDescription>,
        member: String,
    },
    /// Member of a well-known built-in holder (`Array`, `console`, `Math`)
    BuiltIn {
        holder: String,
        member: String,
        receiver: Option<Box<Value>>,
    },
    /// Call of an `any` value through the dynamic runtime
    Any(Box<Value>),
}

#[derive(Clone, Debug)]
pub struct CallValue {
    pub callee: Callee,
    pub args: Vec<Value>,
    /// Explicit type arguments attached by the resolver when the callee
    /// bears type parameters; they select the emitted specialization
    pub type_args: Vec<ValueType>,
    pub ty: ValueType,
}

#[derive(Clone, Debug)]
pub struct NewValue {
    pub meta: Rc<ObjectDescription>,
    pub args: Vec<Value>,
}

/// `new Array(length)`-style construction: the backing store is built with
/// the element type's default value and wrapped with the explicit length.
#[derive(Clone, Debug)]
pub struct NewArrayValue {
    pub element_type: ValueType,
    pub length: Box<Value>,
    pub ty: ValueType,
}

#[derive(Clone, Debug)]
pub struct FieldGetValue {
    pub receiver: Box<Value>,
    pub member: String,
    pub ty: ValueType,
}

#[derive(Clone, Debug)]
pub struct FieldSetValue {
    pub receiver: Box<Value>,
    pub member: String,
    pub value: Box<Value>,
}

#[derive(Clone, Debug)]
pub struct StaticGetValue {
    pub class: Rc<ObjectDescription>,
    pub member: String,
    pub ty: ValueType,
}

#[derive(Clone, Debug)]
pub struct StaticSetValue {
    pub class: Rc<ObjectDescription>,
    pub member: String,
    pub value: Box<Value>,
}

#[derive(Clone, Debug)]
pub struct ElementGetValue {
    pub receiver: Box<Value>,
    pub index: Box<Value>,
    pub ty: ValueType,
}

#[derive(Clone, Debug)]
pub struct ElementSetValue {
    pub receiver: Box<Value>,
    pub index: Box<Value>,
    pub value: Box<Value>,
}

/// Creation of a first-class function value: a closure struct pairing the
/// current context with a function reference. Module-level functions take
/// this path too when their address is taken.
#[derive(Clone, Debug)]
pub struct ClosureValue {
    pub decl: Rc<FunctionDeclareNode>,
}

#[derive(Clone, Debug)]
pub struct CastValue {
    pub value: Box<Value>,
    pub to: ValueType,
}

#[derive(Clone, Debug)]
pub struct TypeOfValue {
    pub value: Box<Value>,
}

#[derive(Clone, Debug)]
pub struct ToStringValue {
    pub value: Box<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Plain,
    /// A loop header: branches to the label re-enter the block
    Loop,
}

#[derive(Clone, Debug)]
pub struct BlockValue {
    pub label: Option<String>,
    pub kind: BlockKind,
    pub result: Option<ValueType>,
    pub body: Vec<Value>,
}

#[derive(Clone, Debug)]
pub struct BranchValue {
    pub label: String,
}

#[derive(Clone, Debug)]
pub struct BranchIfValue {
    pub cond: Box<Value>,
    pub label: String,
}

#[derive(Clone, Debug)]
pub struct ReturnValue {
    pub value: Option<Box<Value>>,
}

/// Convenience constructors used heavily by tests and by upstream tree
/// builders.
impl Value {
    pub fn number(value: f64) -> Self {
        Value::Literal(LiteralValue::Number(value))
    }

    pub fn int(value: u32) -> Self {
        Value::Literal(LiteralValue::Int(value))
    }

    pub fn boolean(value: bool) -> Self {
        Value::Literal(LiteralValue::Boolean(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Value::Literal(LiteralValue::String {
            value: value.into(),
            raw: false,
        })
    }

    pub fn undefined() -> Self {
        Value::Literal(LiteralValue::Undefined)
    }

    pub fn read(decl: &Rc<VarDeclareNode>) -> Self {
        Value::VarRead(VarReadValue {
            ty: decl.value_type.clone(),
            decl: Rc::clone(decl),
        })
    }

    pub fn write(decl: &Rc<VarDeclareNode>, value: Value) -> Self {
        Value::VarWrite(VarWriteValue {
            decl: Rc::clone(decl),
            op: AssignOp::Assign,
            value: Box::new(value),
        })
    }

    pub fn binary(op: BinaryOperator, left: Value, right: Value, ty: ValueType) -> Self {
        Value::Binary(BinaryValue {
            op,
            left: Box::new(left),
            right: Box::new(right),
            ty,
        })
    }

    pub fn ret(value: Option<Value>) -> Self {
        Value::Return(ReturnValue {
            value: value.map(Box::new),
        })
    }

    pub fn cast(value: Value, to: ValueType) -> Self {
        Value::Cast(CastValue {
            value: Box::new(value),
            to,
        })
    }
}
