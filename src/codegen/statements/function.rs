//! Function compilation in two passes: pass one registers a declaration
//! (assigning its index so forward references and recursion resolve),
//! pass two lowers the body into the registered slot.

use std::rc::Rc;

use wasm_encoder::{HeapType, Instruction};

use crate::codegen::context::FunctionContext;
use crate::codegen::error::LowerResult;
use crate::codegen::types::ref_null;
use crate::codegen::CodegenContext;
use crate::semantics::{FunctionDeclareNode, Value, ValueType};

/// Register a declaration without queueing a body pass; generic
/// specializations compile immediately instead.
pub(crate) fn declare_only(
    ctx: &mut CodegenContext,
    decl: &Rc<FunctionDeclareNode>,
    export: bool,
) -> LowerResult<u32> {
    let name = decl.name();
    declare_named_only(ctx, decl, &name, export)
}

fn declare_named_only(
    ctx: &mut CodegenContext,
    decl: &Rc<FunctionDeclareNode>,
    wasm_name: &str,
    export: bool,
) -> LowerResult<u32> {
    let func_type = decl.func_type();
    let CodegenContext { module, types, .. } = ctx;
    let signature = types.signature_index(&mut module.types, &func_type)?;
    let index = ctx.module.declare_function(wasm_name, signature, export)?;
    ctx.set_wasm_name(decl, wasm_name.into());
    Ok(index)
}

/// Declare a function under its own name and queue its body pass.
pub(crate) fn declare_function(
    ctx: &mut CodegenContext,
    decl: &Rc<FunctionDeclareNode>,
    this_type: Option<ValueType>,
    export: bool,
) -> LowerResult<u32> {
    let name = decl.name();
    declare_named(ctx, decl, &name, this_type, export)
}

/// Declare a function under an explicit wasm name (class members mangle
/// to `<class>|<member>`) and queue its body pass.
pub(crate) fn declare_named(
    ctx: &mut CodegenContext,
    decl: &Rc<FunctionDeclareNode>,
    wasm_name: &str,
    this_type: Option<ValueType>,
    export: bool,
) -> LowerResult<u32> {
    let index = declare_named_only(ctx, decl, wasm_name, export)?;
    let this_type = this_type.or_else(|| decl.this_type.clone());
    ctx.queue_function(decl, wasm_name.into(), this_type);
    Ok(index)
}

/// Pass two: lower the body of a declared function.
///
/// The prologue re-casts the erased environment prefix: the receiver into
/// a concretely-typed local, and the incoming context either into the
/// nearest materialized ancestor record or into a freshly allocated
/// record when this function captures variables for its inner closures.
pub(crate) fn compile_function(
    ctx: &mut CodegenContext,
    decl: &Rc<FunctionDeclareNode>,
    wasm_name: &str,
    this_type: Option<&ValueType>,
) -> LowerResult<()> {
    log::trace!("lowering body of '{wasm_name}'");
    let func_type = decl.func_type();
    let env = func_type.env_param_count;
    let param_count = (env + func_type.params.len()) as u32;
    let return_type = ctx.lowered(&func_type.return_type)?.val_type;

    let saved = ctx.func.take();
    ctx.func = Some(FunctionContext::new(wasm_name, param_count, return_type));

    let lowered = (|| -> LowerResult<Vec<Instruction<'static>>> {
        // Bind parameter-backed variables to their parameter slots and
        // the rest to fresh locals. Captured variables live in the
        // context record instead.
        for var in &decl.vars {
            if var.capture.is_some() {
                continue;
            }
            let position = decl.params.iter().position(|p| p.name == var.name);
            match position {
                Some(position) => {
                    let slot = (env + position) as u32;
                    ctx.cur()?.bind_var_to(Rc::as_ptr(var) as usize, slot);
                }
                None => {
                    let ty = ctx.wasm_type_of(&var.value_type)?;
                    ctx.cur()?.bind_var(var, ty);
                }
            }
        }

        let mut instrs = Vec::new();

        let this_type = this_type.cloned().or_else(|| decl.this_type.clone());
        if env >= 2 {
            if let Some(this_type) = this_type {
                let lowered = ctx.lowered(&this_type)?;
                if let Some(heap) = lowered.this_heap {
                    let local = ctx.tmp(ref_null(heap))?;
                    instrs.push(Instruction::LocalGet(1));
                    instrs.push(Instruction::RefCastNullable(HeapType::Concrete(heap)));
                    instrs.push(Instruction::LocalSet(local));
                    ctx.cur()?.this_var = Some((local, this_type));
                } else {
                    ctx.cur()?.this_var = Some((1, this_type));
                }
            }
        }

        match decl.owns_context.as_ref() {
            Some(own) if own.is_materialized() => {
                let own = Rc::clone(own);
                let heap = {
                    let CodegenContext { module, types, .. } = ctx;
                    types.context_heap(&mut module.types, &own)?
                };
                match decl.parent_context.as_ref().and_then(|p| p.effective()) {
                    Some(parent) => {
                        let parent_heap = {
                            let CodegenContext { module, types, .. } = ctx;
                            types.context_heap(&mut module.types, &parent)?
                        };
                        instrs.push(Instruction::LocalGet(0));
                        instrs.push(Instruction::RefCastNullable(HeapType::Concrete(
                            parent_heap,
                        )));
                    }
                    // Root record: the incoming context is the null of
                    // the empty-struct type, stored as-is.
                    None => instrs.push(Instruction::LocalGet(0)),
                }
                for var in &own.vars {
                    match decl.params.iter().position(|p| p.name == var.name) {
                        // Captured parameters are copied into the record.
                        Some(position) => {
                            instrs.push(Instruction::LocalGet((env + position) as u32));
                        }
                        None => {
                            let CodegenContext { module, types, .. } = ctx;
                            instrs.extend(
                                types.default_value(&mut module.types, &var.value_type)?,
                            );
                        }
                    }
                }
                instrs.push(Instruction::StructNew(heap));
                let local = ctx.tmp(ref_null(heap))?;
                instrs.push(Instruction::LocalSet(local));
                ctx.cur()?.closure_context = Some((local, own));
            }
            _ => {
                // Pass-through scope: reuse the incoming record, typed as
                // the nearest materialized ancestor.
                if let Some(effective) =
                    decl.parent_context.as_ref().and_then(|p| p.effective())
                {
                    let heap = {
                        let CodegenContext { module, types, .. } = ctx;
                        types.context_heap(&mut module.types, &effective)?
                    };
                    let local = ctx.tmp(ref_null(heap))?;
                    instrs.push(Instruction::LocalGet(0));
                    instrs.push(Instruction::RefCastNullable(HeapType::Concrete(heap)));
                    instrs.push(Instruction::LocalSet(local));
                    ctx.cur()?.closure_context = Some((local, effective));
                }
            }
        }

        for value in &decl.body {
            instrs.extend(ctx.lower_statement(value)?);
        }

        // A non-void function whose body falls off the end cannot reach
        // here under valid inputs.
        if return_type.is_some() && !matches!(decl.body.last(), Some(Value::Return(_))) {
            instrs.push(Instruction::Unreachable);
        }
        Ok(instrs)
    })();

    let finished = ctx.func.take().expect("function context still open");
    ctx.func = saved;
    let instrs = lowered?;
    ctx.module
        .define_function_body(wasm_name, finished.into_locals(), instrs)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use anyhow::Result;

    use crate::codegen::test_support::lowering_fixture;
    use crate::semantics::{
        Capture, ClosureContextType, ContextVar, FunctionDeclareNode, FunctionType, ParamDeclare,
        Value, ValueType, VarDeclareNode, VarKind,
    };

    use super::*;

    #[test]
    fn test_capturing_function_allocates_its_record() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let ctx = &mut fixture.ctx;

        // outer() { let x = 7; return () => x; }
        let record = Rc::new(ClosureContextType {
            id: 9,
            parent: None,
            vars: vec![ContextVar {
                name: "x".into(),
                value_type: ValueType::Int,
            }],
        });
        let x = Rc::new(VarDeclareNode {
            name: "x".into(),
            value_type: ValueType::Int,
            kind: VarKind::Local,
            capture: Some(Capture {
                context: Rc::clone(&record),
                index: 0,
            }),
            init: None,
        });

        let inner_type = FunctionType::new(vec![], ValueType::Int);
        let mut inner = FunctionDeclareNode::new("outer|lambda0", inner_type.clone());
        inner.parent_context = Some(Rc::clone(&record));
        inner.body = vec![Value::ret(Some(Value::read(&x)))];
        let inner = Rc::new(inner);

        let mut outer = FunctionDeclareNode::new(
            "outer",
            FunctionType::new(vec![], ValueType::Function(Rc::new(inner_type))),
        );
        outer.owns_context = Some(record);
        outer.vars = vec![Rc::clone(&x)];
        outer.body = vec![
            Value::write(&x, Value::int(7)),
            Value::ret(Some(Value::Closure(crate::semantics::ClosureValue {
                decl: Rc::clone(&inner),
            }))),
        ];
        let outer = Rc::new(outer);

        let saved = ctx.func.take();
        declare_function(ctx, &outer, None, false)?;
        declare_function(ctx, &inner, None, false)?;
        ctx.drain_pending()?;
        ctx.func = saved;

        assert!(ctx.module.has_function("outer"));
        assert!(ctx.module.has_function("outer|lambda0"));
        Ok(())
    }

    #[test]
    fn test_parameters_bind_to_their_slots() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let ctx = &mut fixture.ctx;

        let p = VarDeclareNode::local("p", ValueType::Number);
        let mut decl = FunctionDeclareNode::new(
            "f",
            FunctionType::new(vec![ValueType::Number], ValueType::Number),
        );
        decl.params = vec![ParamDeclare::new("p", ValueType::Number)];
        decl.vars = vec![Rc::clone(&p)];
        decl.body = vec![Value::ret(Some(Value::read(&p)))];
        let decl = Rc::new(decl);

        let saved = ctx.func.take();
        declare_function(ctx, &decl, None, false)?;
        ctx.drain_pending()?;
        ctx.func = saved;
        Ok(())
    }
}
