use wasm_encoder::{Instruction, ValType};

use crate::codegen::error::{shape_mismatch, LowerResult};
use crate::codegen::{CodegenContext, Expr, Lower};
use crate::semantics::ConditionalValue;

use super::truthy;

impl Lower for ConditionalValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let then_value = ctx.lower_value(&self.then_value)?;
        let else_value = ctx.lower_value(&self.else_value)?;

        // The two branches' static types must already agree; a mismatch
        // here is a lowering bug, not a user error.
        let then_ty = then_value
            .ty
            .ok_or_else(|| shape_mismatch("a value", "void branch"))?;
        let else_ty = else_value
            .ty
            .ok_or_else(|| shape_mismatch("a value", "void branch"))?;
        if then_ty != else_ty {
            return Err(shape_mismatch(
                format!("{then_ty:?}"),
                format!("{else_ty:?}"),
            ));
        }

        let cond = truthy(ctx, &self.cond)?;
        let mut instrs = then_value.instrs;
        instrs.extend(else_value.instrs);
        instrs.extend(cond.instrs);
        match then_ty {
            ValType::Ref(_) => instrs.push(Instruction::TypedSelect(then_ty)),
            _ => instrs.push(Instruction::Select),
        }
        Ok(Expr::typed(instrs, then_ty))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use wasm_encoder::Instruction;

    use crate::codegen::test_support::{encode, lowering_fixture};
    use crate::semantics::{ConditionalValue, Value, ValueType};

    #[test]
    fn test_number_conditional_selects() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let cond = ConditionalValue {
            cond: Box::new(Value::boolean(true)),
            then_value: Box::new(Value::number(1.0)),
            else_value: Box::new(Value::number(2.0)),
            ty: ValueType::Number,
        };
        let expr = fixture.lower(&Value::Conditional(cond))?;
        assert_eq!(
            encode(&expr.instrs),
            encode(&[
                Instruction::F64Const(1.0),
                Instruction::F64Const(2.0),
                Instruction::I32Const(1),
                Instruction::Select,
            ])
        );
        Ok(())
    }

    #[test]
    fn test_branch_shape_mismatch_is_an_error() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let cond = ConditionalValue {
            cond: Box::new(Value::boolean(true)),
            then_value: Box::new(Value::number(1.0)),
            else_value: Box::new(Value::int(2)),
            ty: ValueType::Number,
        };
        assert!(matches!(
            fixture.lower(&Value::Conditional(cond)),
            Err(crate::codegen::CodegenError::TypeShapeMismatch(_))
        ));
        Ok(())
    }
}
