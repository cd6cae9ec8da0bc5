//! # Semantics Tree
//!
//! The input contract of the back end: a rooted, cycle-free structure of
//! value-kind nodes with attached function and variable declarations. All
//! types are already resolved by the upstream type resolver; generic call
//! sites carry explicit specialization arguments.
//!
//! Nothing in this module performs inference or validation beyond what the
//! lowering needs; the tree is trusted except for member indices, which the
//! code generator recomputes from the object descriptions.

pub mod decl;
pub mod meta;
pub mod types;
pub mod value;

pub use decl::{Capture, FunctionDeclareNode, ParamDeclare, SemanticsModule, VarDeclareNode, VarKind};
pub use meta::{AccessKind, MemberKind, ObjectDescription, ObjectMember};
pub use types::{ClosureContextType, ContextVar, FunctionType, TypeParameter, ValueType};
pub use value::*;
