use wasm_encoder::Instruction;

use crate::codegen::error::{invariant, LowerResult};
use crate::codegen::types::anyref;
use crate::codegen::{CodegenContext, Expr, Lower};
use crate::semantics::{Value, VarKind, VarReadValue, VarWriteValue};

use super::binary::combine;
use super::closure::context_chain_load;

impl Lower for VarReadValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let decl = &self.decl;

        // Captured variables live in their context record, not in a local.
        if let Some(capture) = &decl.capture {
            let (mut instrs, heap) = context_chain_load(ctx, &capture.context)?;
            instrs.push(Instruction::StructGet {
                struct_type_index: heap,
                field_index: 1 + capture.index as u32,
            });
            let ty = ctx.wasm_type_of(&decl.value_type)?;
            return Ok(Expr::typed(instrs, ty));
        }

        match decl.kind {
            VarKind::Local => {
                let local = ctx.cur()?.local_for(decl)?;
                let ty = ctx.wasm_type_of(&decl.value_type)?;
                Ok(Expr::typed(vec![Instruction::LocalGet(local)], ty))
            }
            VarKind::Global => match decl.name.as_str() {
                "NaN" => Ok(Expr::typed(
                    vec![Instruction::F64Const(f64::NAN)],
                    wasm_encoder::ValType::F64,
                )),
                "Infinity" => Ok(Expr::typed(
                    vec![Instruction::F64Const(f64::INFINITY)],
                    wasm_encoder::ValType::F64,
                )),
                _ => {
                    let index = ctx.global_for(decl)?;
                    let ty = ctx.wasm_type_of(&decl.value_type)?;
                    Ok(Expr::typed(vec![Instruction::GlobalGet(index)], ty))
                }
            },
            VarKind::BuiltinGlobal => {
                let index = ctx.module.global_index(&decl.name).ok_or_else(|| {
                    invariant(format!("built-in global '{}' was not imported", decl.name))
                })?;
                Ok(Expr::typed(vec![Instruction::GlobalGet(index)], anyref()))
            }
        }
    }
}

impl Lower for VarWriteValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let decl = &self.decl;
        let rhs = ctx.lower_value(&self.value)?;

        // Compound assignment lowers as `left = left op right`.
        let rhs = match self.op.binary() {
            None => rhs,
            Some(op) => {
                let read = Value::read(decl);
                let left = ctx.lower_value(&read)?;
                combine(
                    ctx,
                    op,
                    left,
                    &decl.value_type,
                    rhs,
                    &self.value.value_type(),
                    &decl.value_type,
                )?
            }
        };

        if let Some(capture) = &decl.capture {
            let (mut instrs, heap) = context_chain_load(ctx, &capture.context)?;
            instrs.extend(rhs.instrs);
            instrs.push(Instruction::StructSet {
                struct_type_index: heap,
                field_index: 1 + capture.index as u32,
            });
            return Ok(Expr::void(instrs));
        }

        let mut instrs = rhs.instrs;
        match decl.kind {
            VarKind::Local => {
                let local = ctx.cur()?.local_for(decl)?;
                instrs.push(Instruction::LocalSet(local));
            }
            VarKind::Global => {
                let index = ctx.global_for(decl)?;
                instrs.push(Instruction::GlobalSet(index));
            }
            VarKind::BuiltinGlobal => {
                return Err(invariant(format!(
                    "built-in global '{}' is read-only",
                    decl.name
                )))
            }
        }
        Ok(Expr::void(instrs))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use wasm_encoder::{Instruction, ValType};

    use crate::codegen::test_support::{encode, lowering_fixture};
    use crate::semantics::{Value, ValueType, VarDeclareNode};

    #[test]
    fn test_uncaptured_local_reads_are_direct() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let decl = VarDeclareNode::local("x", ValueType::Number);
        let slot = fixture.ctx.cur()?.bind_var(&decl, ValType::F64);

        let expr = fixture.lower(&Value::read(&decl))?;
        assert_eq!(encode(&expr.instrs), encode(&[Instruction::LocalGet(slot)]));

        let expr = fixture.lower(&Value::write(&decl, Value::number(1.0)))?;
        assert_eq!(
            encode(&expr.instrs),
            encode(&[Instruction::F64Const(1.0), Instruction::LocalSet(slot)])
        );
        assert!(expr.ty.is_none());
        Ok(())
    }

    #[test]
    fn test_special_globals_are_f64_constants() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let nan = VarDeclareNode::global("NaN", ValueType::Number, None);
        let expr = fixture.lower(&Value::read(&nan))?;
        assert_eq!(expr.instrs.len(), 1);
        assert!(matches!(
            expr.instrs[0],
            Instruction::F64Const(v) if v.is_nan()
        ));
        Ok(())
    }
}
