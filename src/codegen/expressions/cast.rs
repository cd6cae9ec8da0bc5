//! The cast table: a finite mapping keyed by the (from, to) kind pair.
//! Everything outside the table is an `UnimplementedLowering` failure.

use std::rc::Rc;

use wasm_encoder::{HeapType, Instruction};

use crate::codegen::error::{unimplemented, LowerResult};
use crate::codegen::types::ref_null;
use crate::codegen::{CodegenContext, Expr, Lower};
use crate::semantics::{CastValue, ObjectDescription, Value, ValueType};

use super::any::{box_to_any, unbox_from_any};
use super::interface::{box_to_interface, unbox_to_object};
use super::{truthy, truthy_expr};

impl Lower for CastValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let from = ctx.types.resolve(&self.value.value_type());
        let to = ctx.types.resolve(&self.to);

        if from == to {
            return ctx.lower_value(&self.value);
        }

        match (&from, &to) {
            // Boxing; object and array literals become runtime-allocated
            // dynamic objects instead of ext-ref handles.
            (_, ValueType::Any) => box_to_any(ctx, &self.value),

            // `any` to boolean is the truthy predicate, not an unbox.
            (ValueType::Any, ValueType::Boolean) => truthy(ctx, &self.value),
            (ValueType::Any | ValueType::Undefined, _) => {
                let lowered = ctx.lower_value(&self.value)?;
                unbox_from_any(ctx, lowered, &to)
            }

            (ValueType::Int, ValueType::Number) | (ValueType::Boolean, ValueType::Number) => {
                let mut expr = ctx.lower_value(&self.value)?;
                expr.instrs.push(Instruction::F64ConvertI32U);
                Ok(Expr::typed(expr.instrs, wasm_encoder::ValType::F64))
            }
            (ValueType::Number, ValueType::Int) => {
                let mut expr = ctx.lower_value(&self.value)?;
                expr.instrs.push(Instruction::I32TruncSatF64U);
                Ok(Expr::typed(expr.instrs, wasm_encoder::ValType::I32))
            }
            (ValueType::Number, ValueType::Boolean) | (ValueType::Int, ValueType::Boolean) => {
                let lowered = ctx.lower_value(&self.value)?;
                truthy_expr(ctx, lowered, &from)
            }

            // A null source narrows freely to any reference target.
            (ValueType::Null, _) => {
                let mut expr = ctx.lower_value(&self.value)?;
                let lowered = ctx.lowered(&to)?;
                match lowered.heap {
                    Some(heap) => {
                        expr.instrs
                            .push(Instruction::RefCastNullable(HeapType::Concrete(heap)));
                        Ok(Expr::typed(expr.instrs, ref_null(heap)))
                    }
                    None => Ok(expr),
                }
            }

            (ValueType::Object(from_meta), ValueType::Object(to_meta)) => {
                lower_object_cast(ctx, self, from_meta, to_meta)
            }

            (ValueType::Array(_), ValueType::Array(_)) => {
                // Array covariance is resolved upstream; representations
                // with equal element lowerings share a heap type already.
                let mut expr = ctx.lower_value(&self.value)?;
                let heap = ctx.lowered(&to)?.heap.expect("array wrapper");
                expr.instrs
                    .push(Instruction::RefCastNullable(HeapType::Concrete(heap)));
                Ok(Expr::typed(expr.instrs, ref_null(heap)))
            }

            _ => Err(unimplemented(format!("cast from {from:?} to {to:?}"))),
        }
    }
}

fn lower_object_cast(
    ctx: &mut CodegenContext,
    cast: &CastValue,
    from_meta: &Rc<ObjectDescription>,
    to_meta: &Rc<ObjectDescription>,
) -> LowerResult<Expr> {
    match (from_meta.is_interface, to_meta.is_interface) {
        // object → interface: box
        (false, true) => {
            let object = ctx.lower_value(&cast.value)?;
            box_to_interface(ctx, object, from_meta, to_meta)
        }
        // interface → object: unbox
        (true, false) => {
            let boxed = ctx.lower_value(&cast.value)?;
            unbox_to_object(ctx, boxed, to_meta)
        }
        // interface → interface: keep itable, impl id and data, swap the
        // declared type id.
        (true, true) => {
            let interface_heap = ctx.types.interface_heap;
            let tmp = ctx.tmp(ref_null(interface_heap))?;
            let mut instrs = ctx.lower_value(&cast.value)?.instrs;
            instrs.push(Instruction::LocalSet(tmp));
            for (field_index, declared) in [(0u32, false), (1, true), (2, false), (3, false)] {
                if declared {
                    instrs.push(Instruction::I32Const(to_meta.type_id as i32));
                } else {
                    instrs.push(Instruction::LocalGet(tmp));
                    instrs.push(Instruction::StructGet {
                        struct_type_index: interface_heap,
                        field_index,
                    });
                }
            }
            instrs.push(Instruction::StructNew(interface_heap));
            Ok(Expr::typed(instrs, ref_null(interface_heap)))
        }
        // object → object: upcasts are the identity, downcasts are a
        // checked `ref.cast` to the target heap type.
        (false, false) => {
            let expr = ctx.lower_value(&cast.value)?;
            if is_base_of(to_meta, from_meta) {
                return Ok(expr);
            }
            let heap = ctx
                .lowered(&ValueType::Object(Rc::clone(to_meta)))?
                .heap
                .expect("object instance type");
            let mut instrs = expr.instrs;
            instrs.push(Instruction::RefCastNullable(HeapType::Concrete(heap)));
            Ok(Expr::typed(instrs, ref_null(heap)))
        }
    }
}

/// Whether `candidate` appears in `meta`'s base chain (including itself).
fn is_base_of(candidate: &Rc<ObjectDescription>, meta: &Rc<ObjectDescription>) -> bool {
    let mut cur = Some(Rc::clone(meta));
    while let Some(m) = cur {
        if m.type_id == candidate.type_id {
            return true;
        }
        cur = m.base.clone();
    }
    false
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use wasm_encoder::Instruction;

    use crate::codegen::test_support::lowering_fixture;
    use crate::semantics::Value;

    use super::*;

    #[test]
    fn test_int_to_number_converts() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let cast = Value::cast(Value::int(3), ValueType::Number);
        let expr = fixture.lower(&cast)?;
        assert!(matches!(
            expr.instrs.last(),
            Some(Instruction::F64ConvertI32U)
        ));
        Ok(())
    }

    #[test]
    fn test_any_round_trip_matches_plain_lowering_type() -> Result<()> {
        // lower(cast(cast(v, Any), T)) produces the same static wasm type
        // as lower(v); the handle round-trips through the boundary.
        let mut fixture = lowering_fixture()?;
        let v = Value::number(4.0);
        let direct = fixture.lower(&v)?;
        let round_trip = Value::cast(Value::cast(v, ValueType::Any), ValueType::Number);
        let lowered = fixture.lower(&round_trip)?;
        assert_eq!(direct.ty, lowered.ty);
        Ok(())
    }

    #[test]
    fn test_unknown_cast_pair_is_unimplemented() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let cast = Value::cast(Value::string("s"), ValueType::Int);
        assert!(matches!(
            fixture.lower(&cast),
            Err(crate::codegen::CodegenError::UnimplementedLowering(_))
        ));
        Ok(())
    }
}
