//! Closure values and closure-context access.
//!
//! A function value is a two-slot struct `{context, funcref}`; module
//! level functions become closures too once their address is taken. The
//! context slot is the enclosing context record, or the null empty-struct
//! reference for functions that close over nothing.
//!
//! Captured variables are reached by walking slot 0 of the context chain
//! from the current record to the record that owns the variable.
//! Pass-through scopes (no captured variables of their own) never
//! materialize a record, so they cost no loads.

use std::rc::Rc;

use wasm_encoder::Instruction;

use crate::codegen::error::{invariant, LowerResult};
use crate::codegen::types::{ref_null, structref};
use crate::codegen::{statements, CodegenContext, Expr, Lower};
use crate::semantics::{ClosureContextType, ClosureValue, FunctionDeclareNode};

impl Lower for ClosureValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        make_closure(ctx, &self.decl)
    }
}

/// Build the closure struct for a function declaration.
pub(crate) fn make_closure(
    ctx: &mut CodegenContext,
    decl: &Rc<FunctionDeclareNode>,
) -> LowerResult<Expr> {
    let name = ctx.wasm_name_of(decl);
    if !ctx.module.has_function(&name) {
        statements::function::declare_function(ctx, decl, None, false)?;
    }
    let index = ctx
        .module
        .function_index(&name)
        .ok_or_else(|| invariant(format!("closure over undeclared function '{name}'")))?;
    ctx.module.declare_ref_func(index);

    let func_type = decl.func_type();
    let CodegenContext { module, types, .. } = ctx;
    let closure_heap = types.closure_heap(&mut module.types, &func_type)?;

    let mut expr = current_context_ref(ctx, decl.parent_context.as_ref())?;
    expr.instrs.push(Instruction::RefFunc(index));
    expr.instrs.push(Instruction::StructNew(closure_heap));
    Ok(Expr::typed(expr.instrs, ref_null(closure_heap)))
}

/// The context reference a callee expects: the enclosing context record
/// if it captures anything, otherwise the null of the empty-struct type.
pub(crate) fn current_context_ref(
    ctx: &mut CodegenContext,
    parent: Option<&Rc<ClosureContextType>>,
) -> LowerResult<Expr> {
    match parent.and_then(|p| p.effective()) {
        Some(target) => {
            let (instrs, heap) = context_chain_load(ctx, &target)?;
            Ok(Expr::typed(instrs, ref_null(heap)))
        }
        None => Ok(Expr::typed(
            vec![Instruction::RefNull(wasm_encoder::HeapType::Abstract {
                shared: false,
                ty: wasm_encoder::AbstractHeapType::Struct,
            })],
            structref(),
        )),
    }
}

/// Walk from the current context variable to the record `target`,
/// following slot 0 of each link. `target` must be materialized. The
/// returned sequence leaves the target record on the stack; the number of
/// loads equals the number of materialized scopes between here and there.
pub(crate) fn context_chain_load(
    ctx: &mut CodegenContext,
    target: &Rc<ClosureContextType>,
) -> LowerResult<(Vec<Instruction<'static>>, u32)> {
    let (local, mut cur) = ctx
        .cur()?
        .closure_context
        .clone()
        .ok_or_else(|| invariant("captured variable access without a context variable"))?;

    let mut instrs = vec![Instruction::LocalGet(local)];
    loop {
        let CodegenContext { module, types, .. } = ctx;
        let heap = types.context_heap(&mut module.types, &cur)?;
        if cur.id == target.id {
            return Ok((instrs, heap));
        }
        instrs.push(Instruction::StructGet {
            struct_type_index: heap,
            field_index: 0,
        });
        cur = cur
            .parent
            .as_ref()
            .and_then(|p| p.effective())
            .ok_or_else(|| {
                invariant(format!(
                    "context chain of '{}' does not reach record #{}",
                    ctx.func.as_ref().map(|f| f.name.as_str()).unwrap_or("?"),
                    target.id
                ))
            })?;
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use anyhow::Result;
    use wasm_encoder::Instruction;

    use crate::codegen::test_support::lowering_fixture;
    use crate::semantics::{ContextVar, ValueType};

    use super::*;

    fn record(id: u32, parent: Option<Rc<ClosureContextType>>, vars: usize) -> Rc<ClosureContextType> {
        let vars = (0..vars)
            .map(|i| ContextVar {
                name: format!("v{i}"),
                value_type: ValueType::Int,
            })
            .collect();
        Rc::new(ClosureContextType { id, parent, vars })
    }

    #[test]
    fn test_chain_walk_emits_one_load_per_materialized_hop() -> Result<()> {
        let mut fixture = lowering_fixture()?;

        let root = record(1, None, 1);
        let pass_through = record(2, Some(Rc::clone(&root)), 0);
        let inner = record(3, Some(pass_through), 2);

        // Current function sits at depth d+k with k = 1 materialized hop
        // between its record and the root record.
        let ctx = &mut fixture.ctx;
        let local = ctx.tmp(wasm_encoder::ValType::I32)?;
        ctx.cur()?.closure_context = Some((local, Rc::clone(&inner)));

        let (instrs, _) = context_chain_load(ctx, &root)?;
        let loads = instrs
            .iter()
            .filter(|i| matches!(i, Instruction::StructGet { field_index: 0, .. }))
            .count();
        assert_eq!(loads, 1);

        // Reading a variable of the current record costs no loads.
        let (instrs, _) = context_chain_load(ctx, &inner)?;
        let loads = instrs
            .iter()
            .filter(|i| matches!(i, Instruction::StructGet { .. }))
            .count();
        assert_eq!(loads, 0);
        Ok(())
    }
}
