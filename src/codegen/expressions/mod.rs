//! Per-kind expression lowering. `lower` is a total function over the
//! closed value-kind set; each kind family lives in its own file, the way
//! the components split the work: calls and dispatch, closures, the
//! object model, the `any` boundary, casts, elements, control flow.

mod any;
mod binary;
mod block;
mod call;
mod cast;
mod closure;
mod conditional;
mod element;
mod interface;
mod literal;
mod object;
mod variable;

pub(crate) use object::coerce;

use wasm_encoder::Instruction;

use crate::semantics::{Value, ValueType};

use super::error::LowerResult;
use super::{CodegenContext, Expr, Lower};

impl Lower for Value {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        match self {
            Value::Literal(v) => v.lower(ctx),
            Value::ArrayLiteral(v) => v.lower(ctx),
            Value::ObjectLiteral(v) => v.lower(ctx),
            Value::VarRead(v) => v.lower(ctx),
            Value::VarWrite(v) => v.lower(ctx),
            Value::Binary(v) => v.lower(ctx),
            Value::Unary(v) => v.lower(ctx),
            Value::Conditional(v) => v.lower(ctx),
            Value::Call(v) => v.lower(ctx),
            Value::New(v) => v.lower(ctx),
            Value::NewArray(v) => v.lower(ctx),
            Value::FieldGet(v) => v.lower(ctx),
            Value::FieldSet(v) => v.lower(ctx),
            Value::StaticGet(v) => v.lower(ctx),
            Value::StaticSet(v) => v.lower(ctx),
            Value::ElementGet(v) => v.lower(ctx),
            Value::ElementSet(v) => v.lower(ctx),
            Value::Closure(v) => v.lower(ctx),
            Value::Cast(v) => v.lower(ctx),
            Value::TypeOf(v) => v.lower(ctx),
            Value::ToString(v) => v.lower(ctx),
            Value::Block(v) => v.lower(ctx),
            Value::Branch(v) => v.lower(ctx),
            Value::BranchIf(v) => v.lower(ctx),
            Value::Return(v) => v.lower(ctx),
        }
    }
}

/// Lower a value and normalize it to an i32 truth value.
pub(crate) fn truthy(ctx: &mut CodegenContext, value: &Value) -> LowerResult<Expr> {
    let lowered = ctx.lower_value(value)?;
    truthy_expr(ctx, lowered, &value.value_type())
}

/// Normalize an already-lowered value to an i32 truth value.
///
/// | Kind      | Predicate                          |
/// |-----------|------------------------------------|
/// | Boolean   | identity                           |
/// | Int       | `x != 0`                           |
/// | Number    | `x != 0.0 && x == x` (NaN is false)|
/// | String    | `chars.length != 0`                |
/// | Any/Union | runtime coercion                   |
/// | other ref | `!ref.is_null`                     |
pub(crate) fn truthy_expr(
    ctx: &mut CodegenContext,
    lowered: Expr,
    value_type: &ValueType,
) -> LowerResult<Expr> {
    let value_type = ctx.types.resolve(value_type);
    let produced = lowered.ty.is_some();
    let mut instrs = lowered.instrs;
    match value_type {
        ValueType::Boolean => {}
        ValueType::Int => {
            instrs.push(Instruction::I32Const(0));
            instrs.push(Instruction::I32Ne);
        }
        ValueType::Number => {
            let tmp = ctx.tmp(wasm_encoder::ValType::F64)?;
            instrs.push(Instruction::LocalTee(tmp));
            instrs.push(Instruction::F64Const(0.0));
            instrs.push(Instruction::F64Ne);
            instrs.push(Instruction::LocalGet(tmp));
            instrs.push(Instruction::LocalGet(tmp));
            instrs.push(Instruction::F64Eq);
            instrs.push(Instruction::I32And);
        }
        ValueType::String => {
            let string_heap = ctx.types.string_heap;
            instrs.push(Instruction::StructGet {
                struct_type_index: string_heap,
                field_index: 1,
            });
            instrs.push(Instruction::ArrayLen);
            instrs.push(Instruction::I32Const(0));
            instrs.push(Instruction::I32Ne);
        }
        ValueType::Any | ValueType::Undefined => {
            // The runtime owns dynamic truthiness.
            let mut coerced = vec![ctx.runtime.get_context()];
            coerced.extend(instrs);
            coerced.push(ctx.runtime.call("dyntype_to_bool")?);
            instrs = coerced;
        }
        ValueType::Null => {
            if produced {
                instrs.push(Instruction::Drop);
            }
            instrs.push(Instruction::I32Const(0));
        }
        _ => {
            instrs.push(Instruction::RefIsNull);
            instrs.push(Instruction::I32Eqz);
        }
    }
    Ok(Expr::typed(instrs, wasm_encoder::ValType::I32))
}
