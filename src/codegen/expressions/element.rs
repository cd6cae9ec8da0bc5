use wasm_encoder::{Instruction, ValType};

use crate::codegen::builtins::ensure_string_char_at;
use crate::codegen::error::{unimplemented, LowerResult};
use crate::codegen::types::{anyref, ref_null};
use crate::codegen::{CodegenContext, Expr, Lower};
use crate::semantics::{ElementGetValue, ElementSetValue, NewArrayValue, Value, ValueType};

use super::any::box_expr_to_any;
use super::object::coerce;

/// Build an array value from already-lowered elements: the inner backing
/// array via `array.new_fixed`, wrapped in the `{array, length}` struct.
/// The length slot is explicit so the backing store may be over-allocated.
pub(crate) fn build_array(
    ctx: &mut CodegenContext,
    element_type: &ValueType,
    elements: Vec<Expr>,
) -> LowerResult<Expr> {
    let array_ty = ValueType::Array(Box::new(element_type.clone()));
    let lowered = ctx.lowered(&array_ty)?;
    let inner = lowered.inner_array.expect("arrays have a backing store");
    let wrapper = lowered.heap.expect("arrays have a wrapper struct");

    let count = elements.len() as u32;
    let mut instrs = Vec::new();
    for element in elements {
        instrs.extend(element.instrs);
    }
    instrs.push(Instruction::ArrayNewFixed {
        array_type_index: inner,
        array_size: count,
    });
    instrs.push(Instruction::I32Const(count as i32));
    instrs.push(Instruction::StructNew(wrapper));
    Ok(Expr::typed(instrs, ref_null(wrapper)))
}

/// Lower an index expression to the i32 the array instructions take.
fn index_to_i32(ctx: &mut CodegenContext, index: &Value) -> LowerResult<Vec<Instruction<'static>>> {
    let lowered = ctx.lower_value(index)?;
    let mut instrs = lowered.instrs;
    match ctx.types.resolve(&index.value_type()) {
        ValueType::Int => {}
        ValueType::Number => instrs.push(Instruction::I32TruncSatF64U),
        other => return Err(unimplemented(format!("index of type {other:?}"))),
    }
    Ok(instrs)
}

impl Lower for ElementGetValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let receiver_ty = ctx.types.resolve(&self.receiver.value_type());
        match &receiver_ty {
            ValueType::Array(element) => {
                let lowered = ctx.lowered(&receiver_ty)?;
                let wrapper = lowered.heap.expect("array wrapper");
                let inner = lowered.inner_array.expect("array store");
                let mut instrs = ctx.lower_value(&self.receiver)?.instrs;
                instrs.push(Instruction::StructGet {
                    struct_type_index: wrapper,
                    field_index: 0,
                });
                instrs.extend(index_to_i32(ctx, &self.index)?);
                instrs.push(Instruction::ArrayGet(inner));
                let ty = ctx.wasm_type_of(element)?;
                Ok(Expr::typed(instrs, ty))
            }
            ValueType::String => {
                let char_at = ensure_string_char_at(ctx)?;
                let mut instrs = ctx.lower_value(&self.receiver)?.instrs;
                instrs.extend(index_to_i32(ctx, &self.index)?);
                instrs.push(Instruction::Call(char_at));
                Ok(Expr::typed(instrs, ref_null(ctx.types.string_heap)))
            }
            ValueType::Any => {
                let mut instrs = vec![ctx.runtime.get_context()];
                instrs.extend(ctx.lower_value(&self.receiver)?.instrs);
                instrs.extend(index_to_i32(ctx, &self.index)?);
                instrs.push(ctx.runtime.call("dyntype_get_elem")?);
                Ok(Expr::typed(instrs, anyref()))
            }
            other => Err(unimplemented(format!("element read on {other:?}"))),
        }
    }
}

impl Lower for ElementSetValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let receiver_ty = ctx.types.resolve(&self.receiver.value_type());
        match &receiver_ty {
            ValueType::Array(element) => {
                let lowered = ctx.lowered(&receiver_ty)?;
                let wrapper = lowered.heap.expect("array wrapper");
                let inner = lowered.inner_array.expect("array store");
                let mut instrs = ctx.lower_value(&self.receiver)?.instrs;
                instrs.push(Instruction::StructGet {
                    struct_type_index: wrapper,
                    field_index: 0,
                });
                instrs.extend(index_to_i32(ctx, &self.index)?);
                let value = ctx.lower_value(&self.value)?;
                let value = coerce(ctx, value, &self.value.value_type(), element)?;
                instrs.extend(value.instrs);
                instrs.push(Instruction::ArraySet(inner));
                Ok(Expr::void(instrs))
            }
            ValueType::Any => {
                let mut instrs = vec![ctx.runtime.get_context()];
                instrs.extend(ctx.lower_value(&self.receiver)?.instrs);
                instrs.extend(index_to_i32(ctx, &self.index)?);
                let value = ctx.lower_value(&self.value)?;
                let value = box_expr_to_any(ctx, value, &self.value.value_type())?;
                instrs.extend(value.instrs);
                instrs.push(ctx.runtime.call("dyntype_set_elem")?);
                Ok(Expr::void(instrs))
            }
            other => Err(unimplemented(format!("element write on {other:?}"))),
        }
    }
}

impl Lower for NewArrayValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let array_ty = ValueType::Array(Box::new(self.element_type.clone()));
        let lowered = ctx.lowered(&array_ty)?;
        let inner = lowered.inner_array.expect("array store");
        let wrapper = lowered.heap.expect("array wrapper");

        let length = index_to_i32(ctx, &self.length)?;
        let len_tmp = ctx.tmp(ValType::I32)?;
        let CodegenContext { module, types, .. } = ctx;
        let default = types.default_value(&mut module.types, &self.element_type)?;

        let mut instrs = length;
        instrs.push(Instruction::LocalSet(len_tmp));
        instrs.extend(default);
        instrs.push(Instruction::LocalGet(len_tmp));
        instrs.push(Instruction::ArrayNew(inner));
        instrs.push(Instruction::LocalGet(len_tmp));
        instrs.push(Instruction::StructNew(wrapper));
        Ok(Expr::typed(instrs, ref_null(wrapper)))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use wasm_encoder::Instruction;

    use crate::codegen::test_support::lowering_fixture;
    use crate::semantics::{ArrayLiteralValue, ElementGetValue, Value, ValueType};

    #[test]
    fn test_array_literal_wraps_store_and_length() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let literal = Value::ArrayLiteral(ArrayLiteralValue {
            element_type: ValueType::Number,
            elements: vec![Value::number(1.0), Value::number(2.0), Value::number(3.0)],
            ty: ValueType::Array(Box::new(ValueType::Number)),
        });
        let expr = fixture.lower(&literal)?;
        assert!(matches!(
            expr.instrs.as_slice(),
            [
                Instruction::F64Const(_),
                Instruction::F64Const(_),
                Instruction::F64Const(_),
                Instruction::ArrayNewFixed { array_size: 3, .. },
                Instruction::I32Const(3),
                Instruction::StructNew(_),
            ]
        ));
        Ok(())
    }

    #[test]
    fn test_array_read_goes_through_backing_store() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let array_ty = ValueType::Array(Box::new(ValueType::Number));
        let decl = crate::semantics::VarDeclareNode::local("xs", array_ty.clone());
        let wasm_ty = fixture.ctx.wasm_type_of(&array_ty)?;
        fixture.ctx.cur()?.bind_var(&decl, wasm_ty);

        let get = Value::ElementGet(ElementGetValue {
            receiver: Box::new(Value::read(&decl)),
            index: Box::new(Value::number(0.0)),
            ty: ValueType::Number,
        });
        let expr = fixture.lower(&get)?;
        assert!(matches!(
            expr.instrs.as_slice(),
            [
                Instruction::LocalGet(_),
                Instruction::StructGet { field_index: 0, .. },
                Instruction::F64Const(_),
                Instruction::I32TruncSatF64U,
                Instruction::ArrayGet(_),
            ]
        ));
        Ok(())
    }
}
