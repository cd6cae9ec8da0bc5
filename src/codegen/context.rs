//! Per-function state of the lowering: the local-variable table, the
//! active closure-context variable, the receiver variable and the label
//! stack for structured branches.
//!
//! The lowering contract is that the current function context at entry of
//! `lower(value)` equals the context at exit; the only sanctioned mutation
//! while a value is being lowered is [`FunctionContext::insert_tmp_var`].

use std::collections::HashMap;
use std::rc::Rc;

use wasm_encoder::ValType;

use crate::semantics::{ClosureContextType, ValueType, VarDeclareNode};

use super::error::{invariant, LowerResult};

pub struct FunctionContext {
    pub name: String,
    /// Number of wasm parameters (environment prefix plus user params)
    param_count: u32,
    /// Extra locals beyond the parameters, in declaration order
    locals: Vec<ValType>,
    /// Wasm local slot per variable declaration, keyed by node identity
    bindings: HashMap<usize, u32>,
    /// Local holding the current closure context, with its concrete type.
    /// `None` when the function neither captures nor provides variables.
    pub closure_context: Option<(u32, Rc<ClosureContextType>)>,
    /// Local holding the receiver, re-cast to its concrete type at entry
    pub this_var: Option<(u32, ValueType)>,
    /// Enclosing block labels, innermost last
    labels: Vec<String>,
    pub return_type: Option<ValType>,
}

impl FunctionContext {
    pub fn new(name: impl Into<String>, param_count: u32, return_type: Option<ValType>) -> Self {
        FunctionContext {
            name: name.into(),
            param_count,
            locals: Vec::new(),
            bindings: HashMap::new(),
            closure_context: None,
            this_var: None,
            labels: Vec::new(),
            return_type,
        }
    }

    /// Append a scratch local of the given type and return its slot.
    pub fn insert_tmp_var(&mut self, ty: ValType) -> u32 {
        let index = self.param_count + self.locals.len() as u32;
        self.locals.push(ty);
        index
    }

    /// Bind a declared variable to a fresh local slot.
    pub fn bind_var(&mut self, decl: &Rc<VarDeclareNode>, ty: ValType) -> u32 {
        let index = self.insert_tmp_var(ty);
        self.bindings.insert(Rc::as_ptr(decl) as usize, index);
        index
    }

    /// Bind a declared variable to an existing slot (a parameter).
    pub fn bind_var_to(&mut self, key: usize, index: u32) {
        self.bindings.insert(key, index);
    }

    pub fn local_for(&self, decl: &Rc<VarDeclareNode>) -> LowerResult<u32> {
        self.bindings
            .get(&(Rc::as_ptr(decl) as usize))
            .copied()
            .ok_or_else(|| {
                invariant(format!(
                    "variable '{}' has no local slot in '{}'",
                    decl.name, self.name
                ))
            })
    }

    pub fn into_locals(self) -> Vec<ValType> {
        self.locals
    }

    pub fn push_label(&mut self, label: String) {
        self.labels.push(label);
    }

    pub fn pop_label(&mut self) {
        self.labels.pop();
    }

    /// Relative branch depth of a label from the current position.
    pub fn branch_depth(&self, label: &str) -> LowerResult<u32> {
        self.labels
            .iter()
            .rev()
            .position(|l| l == label)
            .map(|depth| depth as u32)
            .ok_or_else(|| invariant(format!("branch to unknown label '{label}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantics::ValueType;

    #[test]
    fn test_tmp_vars_follow_parameters() {
        let mut ctx = FunctionContext::new("f", 3, None);
        assert_eq!(ctx.insert_tmp_var(ValType::F64), 3);
        assert_eq!(ctx.insert_tmp_var(ValType::I32), 4);
        assert_eq!(ctx.into_locals(), vec![ValType::F64, ValType::I32]);
    }

    #[test]
    fn test_bindings_resolve_by_declaration_identity() {
        let mut ctx = FunctionContext::new("f", 1, None);
        let a = VarDeclareNode::local("x", ValueType::Number);
        let shadow = VarDeclareNode::local("x", ValueType::Int);
        let a_slot = ctx.bind_var(&a, ValType::F64);
        let shadow_slot = ctx.bind_var(&shadow, ValType::I32);
        assert_ne!(a_slot, shadow_slot);
        assert_eq!(ctx.local_for(&a).unwrap(), a_slot);
        assert_eq!(ctx.local_for(&shadow).unwrap(), shadow_slot);
    }

    #[test]
    fn test_branch_depth_counts_from_innermost() {
        let mut ctx = FunctionContext::new("f", 0, None);
        ctx.push_label("outer".into());
        ctx.push_label("inner".into());
        assert_eq!(ctx.branch_depth("inner").unwrap(), 0);
        assert_eq!(ctx.branch_depth("outer").unwrap(), 1);
        assert!(ctx.branch_depth("missing").is_err());
    }
}
