//! Binary and unary operator lowering.
//!
//! The operand-kind cross product selects one of the lowering helpers:
//! f64/f64, f64/i32, i32/f64, i32/i32, string/string, reference equality,
//! any/any, any/static and the static null-or-undefined comparison.
//! Anything outside the table is an `UnimplementedLowering` failure.

use wasm_encoder::{BlockType, Instruction, ValType};

use crate::codegen::error::{shape_mismatch, unimplemented, LowerResult};
use crate::codegen::runtime::CmpOperator;
use crate::codegen::types::anyref;
use crate::codegen::{CodegenContext, Expr, Lower};
use crate::semantics::{
    BinaryOperator, BinaryValue, UnaryOperator, UnaryValue, Value, ValueType, VarWriteValue,
};

use crate::codegen::builtins::{ensure_string_concat, ensure_string_eq};

use super::any::box_expr_to_any;
use super::{truthy, truthy_expr};

impl Lower for BinaryValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        if matches!(
            self.op,
            BinaryOperator::LogicalAnd | BinaryOperator::LogicalOr
        ) {
            return lower_logical(ctx, self);
        }
        let left = ctx.lower_value(&self.left)?;
        let right = ctx.lower_value(&self.right)?;
        combine(
            ctx,
            self.op,
            left,
            &self.left.value_type(),
            right,
            &self.right.value_type(),
            &self.ty,
        )
    }
}

/// `&&` and `||` produce the value of one operand, not a boolean, through
/// an operand-typed `select`.
fn lower_logical(ctx: &mut CodegenContext, value: &BinaryValue) -> LowerResult<Expr> {
    let left = ctx.lower_value(&value.left)?;
    let right = ctx.lower_value(&value.right)?;
    let left_ty = left
        .ty
        .ok_or_else(|| shape_mismatch("a value", "void operand"))?;
    let right_ty = right
        .ty
        .ok_or_else(|| shape_mismatch("a value", "void operand"))?;
    if left_ty != right_ty {
        return Err(shape_mismatch(
            format!("{left_ty:?}"),
            format!("{right_ty:?}"),
        ));
    }

    let tmp = ctx.tmp(left_ty)?;
    let mut instrs = left.instrs;
    instrs.push(Instruction::LocalSet(tmp));

    // a && b  select(b, a, truthy(a));  a || b  select(a, b, truthy(a))
    let right_instrs = right.instrs;
    match value.op {
        BinaryOperator::LogicalAnd => {
            instrs.extend(right_instrs);
            instrs.push(Instruction::LocalGet(tmp));
        }
        BinaryOperator::LogicalOr => {
            instrs.push(Instruction::LocalGet(tmp));
            instrs.extend(right_instrs);
        }
        _ => unreachable!(),
    }
    let cond = truthy_expr(
        ctx,
        Expr::typed(vec![Instruction::LocalGet(tmp)], left_ty),
        &value.left.value_type(),
    )?;
    instrs.extend(cond.instrs);
    match left_ty {
        ValType::Ref(_) => instrs.push(Instruction::TypedSelect(left_ty)),
        _ => instrs.push(Instruction::Select),
    }
    Ok(Expr::typed(instrs, left_ty))
}

/// Combine two already-lowered operands. Exposed separately so compound
/// assignments can reuse the operator table.
pub(crate) fn combine(
    ctx: &mut CodegenContext,
    op: BinaryOperator,
    left: Expr,
    left_ty: &ValueType,
    right: Expr,
    right_ty: &ValueType,
    result_ty: &ValueType,
) -> LowerResult<Expr> {
    let lt = ctx.types.resolve(left_ty);
    let rt = ctx.types.resolve(right_ty);

    match (&lt, &rt) {
        (ValueType::Any, _) | (_, ValueType::Any) => {
            lower_any_op(ctx, op, left, &lt, right, &rt, result_ty)
        }
        (ValueType::Number, ValueType::Number) => lower_f64(op, left.instrs, right.instrs),
        (ValueType::Number, ValueType::Int) => {
            let mut right = right.instrs;
            right.push(Instruction::F64ConvertI32U);
            lower_f64(op, left.instrs, right)
        }
        (ValueType::Int, ValueType::Number) => {
            let mut left = left.instrs;
            left.push(Instruction::F64ConvertI32U);
            lower_f64(op, left, right.instrs)
        }
        (ValueType::Int, ValueType::Int) | (ValueType::Boolean, ValueType::Boolean) => {
            lower_i32(op, left.instrs, right.instrs)
        }
        (ValueType::String, ValueType::String) => lower_string(ctx, op, left, right),
        (ValueType::Null | ValueType::Undefined, ValueType::Null | ValueType::Undefined) => {
            lower_null_pair(op, left, right)
        }
        (ValueType::Null | ValueType::Undefined, _) => lower_null_compare(op, right, left, false),
        (_, ValueType::Null | ValueType::Undefined) => lower_null_compare(op, left, right, true),
        _ => lower_ref_eq(ctx, op, left, &lt, right, &rt),
    }
}

fn lower_f64(
    op: BinaryOperator,
    left: Vec<Instruction<'static>>,
    right: Vec<Instruction<'static>>,
) -> LowerResult<Expr> {
    use BinaryOperator::*;

    // `<<`, `&`, `|` operate on the i64 truncation and convert back.
    if matches!(op, Shl | BitAnd | BitOr) {
        let mut instrs = left;
        instrs.push(Instruction::I64TruncSatF64S);
        instrs.extend(right);
        instrs.push(Instruction::I64TruncSatF64S);
        instrs.push(match op {
            Shl => Instruction::I64Shl,
            BitAnd => Instruction::I64And,
            BitOr => Instruction::I64Or,
            _ => unreachable!(),
        });
        instrs.push(Instruction::F64ConvertI64S);
        return Ok(Expr::typed(instrs, ValType::F64));
    }

    let mut instrs = left;
    instrs.extend(right);
    let (instr, ty) = match op {
        Add => (Instruction::F64Add, ValType::F64),
        Sub => (Instruction::F64Sub, ValType::F64),
        Mul => (Instruction::F64Mul, ValType::F64),
        Div => (Instruction::F64Div, ValType::F64),
        Eq | StrictEq => (Instruction::F64Eq, ValType::I32),
        Ne | StrictNe => (Instruction::F64Ne, ValType::I32),
        Lt => (Instruction::F64Lt, ValType::I32),
        Le => (Instruction::F64Le, ValType::I32),
        Gt => (Instruction::F64Gt, ValType::I32),
        Ge => (Instruction::F64Ge, ValType::I32),
        other => return Err(unimplemented(format!("{other:?} on Number operands"))),
    };
    instrs.push(instr);
    Ok(Expr::typed(instrs, ty))
}

fn lower_i32(
    op: BinaryOperator,
    left: Vec<Instruction<'static>>,
    right: Vec<Instruction<'static>>,
) -> LowerResult<Expr> {
    use BinaryOperator::*;
    let mut instrs = left;
    instrs.extend(right);
    let (instr, ty) = match op {
        Add => (Instruction::I32Add, ValType::I32),
        Sub => (Instruction::I32Sub, ValType::I32),
        Mul => (Instruction::I32Mul, ValType::I32),
        Div => (Instruction::I32DivU, ValType::I32),
        Shl => (Instruction::I32Shl, ValType::I32),
        BitAnd => (Instruction::I32And, ValType::I32),
        BitOr => (Instruction::I32Or, ValType::I32),
        Eq | StrictEq => (Instruction::I32Eq, ValType::I32),
        Ne | StrictNe => (Instruction::I32Ne, ValType::I32),
        Lt => (Instruction::I32LtU, ValType::I32),
        Le => (Instruction::I32LeU, ValType::I32),
        Gt => (Instruction::I32GtU, ValType::I32),
        Ge => (Instruction::I32GeU, ValType::I32),
        other => return Err(unimplemented(format!("{other:?} on Int operands"))),
    };
    instrs.push(instr);
    Ok(Expr::typed(instrs, ty))
}

fn lower_string(
    ctx: &mut CodegenContext,
    op: BinaryOperator,
    left: Expr,
    right: Expr,
) -> LowerResult<Expr> {
    use BinaryOperator::*;
    match op {
        // The right side is packaged into a single-element array the way
        // variadic string built-ins expect their arguments.
        Add => {
            let concat = ensure_string_concat(ctx)?;
            let mut instrs = left.instrs;
            instrs.extend(right.instrs);
            instrs.push(Instruction::ArrayNewFixed {
                array_type_index: ctx.types.string_array_heap,
                array_size: 1,
            });
            instrs.push(Instruction::Call(concat));
            Ok(Expr::typed(
                instrs,
                crate::codegen::types::ref_null(ctx.types.string_heap),
            ))
        }
        Eq | StrictEq | Ne | StrictNe => {
            let eq = ensure_string_eq(ctx)?;
            let mut instrs = left.instrs;
            instrs.extend(right.instrs);
            instrs.push(Instruction::Call(eq));
            if matches!(op, Ne | StrictNe) {
                instrs.push(Instruction::I32Eqz);
            }
            Ok(Expr::typed(instrs, ValType::I32))
        }
        other => Err(unimplemented(format!("{other:?} on String operands"))),
    }
}

/// Both sides are `null`/`undefined`: the comparison is a constant, but
/// operand side effects still run.
fn lower_null_pair(op: BinaryOperator, left: Expr, right: Expr) -> LowerResult<Expr> {
    use BinaryOperator::*;
    let result = match op {
        Eq | StrictEq => 1,
        Ne | StrictNe => 0,
        other => return Err(unimplemented(format!("{other:?} on null operands"))),
    };
    let mut instrs = Vec::new();
    for side in [left, right] {
        let produced = side.ty.is_some();
        instrs.extend(side.instrs);
        if produced {
            instrs.push(Instruction::Drop);
        }
    }
    instrs.push(Instruction::I32Const(result));
    Ok(Expr::typed(instrs, ValType::I32))
}

/// One side is `null`/`undefined`, the other a reference: the comparison
/// reduces to `ref.is_null` (or its negation). `value_first` keeps the
/// source evaluation order of the two operands.
fn lower_null_compare(
    op: BinaryOperator,
    value: Expr,
    null_side: Expr,
    value_first: bool,
) -> LowerResult<Expr> {
    use BinaryOperator::*;

    // A non-reference operand can never be null; the result is constant
    // but operand side effects still run.
    if !matches!(value.ty, Some(ValType::Ref(_))) {
        let constant = match op {
            Eq | StrictEq => 0,
            Ne | StrictNe => 1,
            other => return Err(unimplemented(format!("{other:?} against null"))),
        };
        let mut instrs = Vec::new();
        for side in if value_first {
            [value, null_side]
        } else {
            [null_side, value]
        } {
            let produced = side.ty.is_some();
            instrs.extend(side.instrs);
            if produced {
                instrs.push(Instruction::Drop);
            }
        }
        instrs.push(Instruction::I32Const(constant));
        return Ok(Expr::typed(instrs, ValType::I32));
    }

    let mut instrs = Vec::new();
    let null_produced = null_side.ty.is_some();
    let mut null_instrs = null_side.instrs;
    if null_produced {
        null_instrs.push(Instruction::Drop);
    }
    if value_first {
        instrs.extend(value.instrs);
        instrs.push(Instruction::RefIsNull);
        instrs.extend(null_instrs);
    } else {
        instrs.extend(null_instrs);
        instrs.extend(value.instrs);
        instrs.push(Instruction::RefIsNull);
    }
    match op {
        Eq | StrictEq => {}
        Ne | StrictNe => instrs.push(Instruction::I32Eqz),
        other => return Err(unimplemented(format!("{other:?} against null"))),
    }
    Ok(Expr::typed(instrs, ValType::I32))
}

/// Reference equality between object-world values; interface boxes are
/// unwrapped to their erased data first so boxing never breaks identity.
fn lower_ref_eq(
    ctx: &mut CodegenContext,
    op: BinaryOperator,
    left: Expr,
    left_ty: &ValueType,
    right: Expr,
    right_ty: &ValueType,
) -> LowerResult<Expr> {
    use BinaryOperator::*;
    if !matches!(op, Eq | StrictEq | Ne | StrictNe) {
        return Err(unimplemented(format!(
            "{op:?} on operands {left_ty:?} and {right_ty:?}"
        )));
    }
    let mut instrs = Vec::new();
    for (side, ty) in [(left, left_ty), (right, right_ty)] {
        instrs.extend(side.instrs);
        if ty.is_interface() {
            instrs.push(Instruction::StructGet {
                struct_type_index: ctx.types.interface_heap,
                field_index: 3,
            });
        }
    }
    instrs.push(Instruction::RefEq);
    if matches!(op, Ne | StrictNe) {
        instrs.push(Instruction::I32Eqz);
    }
    Ok(Expr::typed(instrs, ValType::I32))
}

/// Operations involving `any` go through the dynamic runtime. Comparisons
/// call `dyntype_cmp`; arithmetic unboxes numbers under a guard whose
/// failing leg is unreachable (static checking upstream owns that proof)
/// and rewraps the numeric result.
fn lower_any_op(
    ctx: &mut CodegenContext,
    op: BinaryOperator,
    left: Expr,
    left_ty: &ValueType,
    right: Expr,
    right_ty: &ValueType,
    _result_ty: &ValueType,
) -> LowerResult<Expr> {
    use BinaryOperator::*;

    let left = box_expr_to_any(ctx, left, left_ty)?;
    let right = box_expr_to_any(ctx, right, right_ty)?;

    if op.is_comparison() {
        let opcode = match op {
            Lt => CmpOperator::Lt,
            Le => CmpOperator::Le,
            Gt => CmpOperator::Gt,
            Ge => CmpOperator::Ge,
            Eq => CmpOperator::EqEq,
            Ne => CmpOperator::NotEq,
            StrictEq => CmpOperator::EqEqEq,
            StrictNe => CmpOperator::NotEqEq,
            _ => unreachable!(),
        };
        let mut instrs = vec![ctx.runtime.get_context()];
        instrs.extend(left.instrs);
        instrs.extend(right.instrs);
        instrs.push(Instruction::I32Const(opcode as i32));
        instrs.push(ctx.runtime.call("dyntype_cmp")?);
        return Ok(Expr::typed(instrs, ValType::I32));
    }

    let f64_op = match op {
        Add => Instruction::F64Add,
        Sub => Instruction::F64Sub,
        Mul => Instruction::F64Mul,
        Div => Instruction::F64Div,
        other => return Err(unimplemented(format!("{other:?} on Any operands"))),
    };

    let ta = ctx.tmp(anyref())?;
    let tb = ctx.tmp(anyref())?;
    let mut instrs = left.instrs;
    instrs.push(Instruction::LocalSet(ta));
    instrs.extend(right.instrs);
    instrs.push(Instruction::LocalSet(tb));
    instrs.push(ctx.runtime.get_context());
    instrs.push(Instruction::LocalGet(ta));
    instrs.push(ctx.runtime.call("dyntype_is_number")?);
    instrs.push(ctx.runtime.get_context());
    instrs.push(Instruction::LocalGet(tb));
    instrs.push(ctx.runtime.call("dyntype_is_number")?);
    instrs.push(Instruction::I32And);
    instrs.push(Instruction::If(BlockType::Result(anyref())));
    instrs.push(ctx.runtime.get_context());
    instrs.push(ctx.runtime.get_context());
    instrs.push(Instruction::LocalGet(ta));
    instrs.push(ctx.runtime.call("dyntype_to_number")?);
    instrs.push(ctx.runtime.get_context());
    instrs.push(Instruction::LocalGet(tb));
    instrs.push(ctx.runtime.call("dyntype_to_number")?);
    instrs.push(f64_op);
    instrs.push(ctx.runtime.call("dyntype_new_number")?);
    instrs.push(Instruction::Else);
    instrs.push(Instruction::Unreachable);
    instrs.push(Instruction::End);
    Ok(Expr::typed(instrs, anyref()))
}

impl Lower for UnaryValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        match self.op {
            UnaryOperator::Not => {
                let mut cond = truthy(ctx, &self.operand)?;
                cond.instrs.push(Instruction::I32Eqz);
                Ok(Expr::typed(cond.instrs, ValType::I32))
            }
            UnaryOperator::Neg => {
                let operand = ctx.lower_value(&self.operand)?;
                match ctx.types.resolve(&self.operand.value_type()) {
                    // `-x` lowers as `0 - x`
                    ValueType::Number => {
                        let mut instrs = vec![Instruction::F64Const(0.0)];
                        instrs.extend(operand.instrs);
                        instrs.push(Instruction::F64Sub);
                        Ok(Expr::typed(instrs, ValType::F64))
                    }
                    ValueType::Int => {
                        let mut instrs = vec![Instruction::I32Const(0)];
                        instrs.extend(operand.instrs);
                        instrs.push(Instruction::I32Sub);
                        Ok(Expr::typed(instrs, ValType::I32))
                    }
                    other => Err(unimplemented(format!("unary '-' on {other:?}"))),
                }
            }
            UnaryOperator::PreInc
            | UnaryOperator::PreDec
            | UnaryOperator::PostInc
            | UnaryOperator::PostDec => lower_inc_dec(ctx, self),
        }
    }
}

/// `++`/`--` lower as `x op= 1` with a post-correction when the form is
/// postfix: the postfix forms read the old value before writing.
fn lower_inc_dec(ctx: &mut CodegenContext, value: &UnaryValue) -> LowerResult<Expr> {
    use UnaryOperator::*;

    let Value::VarRead(read) = value.operand.as_ref() else {
        return Err(unimplemented(format!(
            "{:?} on a non-variable target",
            value.op
        )));
    };
    let operand_ty = ctx.types.resolve(&read.ty);
    let one = match operand_ty {
        ValueType::Number => Value::number(1.0),
        ValueType::Int => Value::int(1),
        other => return Err(unimplemented(format!("{:?} on {other:?}", value.op))),
    };
    let assign_op = match value.op {
        PreInc | PostInc => crate::semantics::AssignOp::Add,
        PreDec | PostDec => crate::semantics::AssignOp::Sub,
        _ => unreachable!(),
    };
    let write = Value::VarWrite(VarWriteValue {
        decl: std::rc::Rc::clone(&read.decl),
        op: assign_op,
        value: Box::new(one),
    });

    let read_value = Value::VarRead(read.clone());
    let mut instrs = Vec::new();
    let ty = ctx.wasm_type_of(&read.ty)?;
    match value.op {
        PreInc | PreDec => {
            instrs.extend(ctx.lower_value(&write)?.instrs);
            instrs.extend(ctx.lower_value(&read_value)?.instrs);
        }
        PostInc | PostDec => {
            instrs.extend(ctx.lower_value(&read_value)?.instrs);
            instrs.extend(ctx.lower_value(&write)?.instrs);
        }
        _ => unreachable!(),
    }
    Ok(Expr::typed(instrs, ty))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use wasm_encoder::{Instruction, ValType};

    use crate::codegen::test_support::{encode, lowering_fixture};
    use crate::semantics::{BinaryOperator, Value, ValueType, VarDeclareNode};

    #[test]
    fn test_number_addition_is_a_single_f64_add() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let a = VarDeclareNode::local("a", ValueType::Number);
        let b = VarDeclareNode::local("b", ValueType::Number);
        let a_slot = fixture.ctx.cur()?.bind_var(&a, ValType::F64);
        let b_slot = fixture.ctx.cur()?.bind_var(&b, ValType::F64);

        let sum = Value::binary(
            BinaryOperator::Add,
            Value::read(&a),
            Value::read(&b),
            ValueType::Number,
        );
        let expr = fixture.lower(&sum)?;
        assert_eq!(
            encode(&expr.instrs),
            encode(&[
                Instruction::LocalGet(a_slot),
                Instruction::LocalGet(b_slot),
                Instruction::F64Add,
            ])
        );
        Ok(())
    }

    #[test]
    fn test_number_bitand_goes_through_i64() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let expr = fixture.lower(&Value::binary(
            BinaryOperator::BitAnd,
            Value::number(6.0),
            Value::number(3.0),
            ValueType::Number,
        ))?;
        assert_eq!(
            encode(&expr.instrs),
            encode(&[
                Instruction::F64Const(6.0),
                Instruction::I64TruncSatF64S,
                Instruction::F64Const(3.0),
                Instruction::I64TruncSatF64S,
                Instruction::I64And,
                Instruction::F64ConvertI64S,
            ])
        );
        Ok(())
    }

    #[test]
    fn test_any_equality_calls_runtime_cmp() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let a = VarDeclareNode::local("a", ValueType::Any);
        let b = VarDeclareNode::local("b", ValueType::Any);
        let any = crate::codegen::types::anyref();
        fixture.ctx.cur()?.bind_var(&a, any);
        fixture.ctx.cur()?.bind_var(&b, any);

        let cmp_index = fixture.ctx.runtime.func("dyntype_cmp")?;
        let expr = fixture.lower(&Value::binary(
            BinaryOperator::StrictEq,
            Value::read(&a),
            Value::read(&b),
            ValueType::Boolean,
        ))?;
        assert!(expr
            .instrs
            .iter()
            .any(|i| matches!(i, Instruction::Call(idx) if *idx == cmp_index)));
        // The strict-equality opcode rides along as an immediate.
        assert!(expr
            .instrs
            .iter()
            .any(|i| matches!(i, Instruction::I32Const(6))));
        Ok(())
    }

    #[test]
    fn test_null_comparison_reduces_to_ref_is_null() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let s = VarDeclareNode::local("s", ValueType::String);
        let string_ty = fixture.ctx.wasm_type_of(&ValueType::String)?;
        fixture.ctx.cur()?.bind_var(&s, string_ty);

        let expr = fixture.lower(&Value::binary(
            BinaryOperator::Ne,
            Value::read(&s),
            Value::Literal(crate::semantics::LiteralValue::Null),
            ValueType::Boolean,
        ))?;
        assert!(matches!(
            expr.instrs.last(),
            Some(Instruction::I32Eqz)
        ));
        assert!(expr
            .instrs
            .iter()
            .any(|i| matches!(i, Instruction::RefIsNull)));
        Ok(())
    }
}
