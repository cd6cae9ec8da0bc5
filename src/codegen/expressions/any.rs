//! The `any` boundary: boxing static values into runtime-managed handles
//! and unboxing handles back into static representations.
//!
//! Unboxing trusts the upstream type checker: the guard's failing leg is
//! `unreachable` in the produced module, not a recoverable branch.

use wasm_encoder::{BlockType, Instruction, ValType};

use crate::codegen::error::{unimplemented, LowerResult};
use crate::codegen::runtime::ExtRefTag;
use crate::codegen::types::{anyref, ref_null, structref};
use crate::codegen::{strings, CodegenContext, Expr, Lower};
use crate::semantics::{
    ArrayLiteralValue, MemberKind, ObjectLiteralValue, ToStringValue, TypeOfValue, Value, ValueType,
};

use super::closure::make_closure;

/// The `typeof1` code the runtime reports for handles wrapping an
/// interface box; part of the `libdyntype` ABI.
pub(crate) const TYPE_TAG_INTERFACE: i32 = 10;

/// Box a value into an `any` handle, substituting a runtime-allocated
/// dynamic object for object and array literals. The substitution is
/// recursive: nested literals become dynamic objects themselves, while
/// non-literal members are boxed as external references.
pub(crate) fn box_to_any(ctx: &mut CodegenContext, value: &Value) -> LowerResult<Expr> {
    match value {
        Value::ObjectLiteral(literal) => box_object_literal(ctx, literal),
        Value::ArrayLiteral(literal) => box_array_literal(ctx, literal),
        other => {
            let lowered = ctx.lower_value(other)?;
            box_expr_to_any(ctx, lowered, &other.value_type())
        }
    }
}

/// Box an already-lowered static value, dispatching on its source kind.
pub(crate) fn box_expr_to_any(
    ctx: &mut CodegenContext,
    expr: Expr,
    from: &ValueType,
) -> LowerResult<Expr> {
    let from = ctx.types.resolve(from);
    let call = |ctx: &mut CodegenContext, expr: Expr, import: &str| -> LowerResult<Expr> {
        let mut instrs = vec![ctx.runtime.get_context()];
        instrs.extend(expr.instrs);
        instrs.push(ctx.runtime.call(import)?);
        Ok(Expr::typed(instrs, anyref()))
    };

    match from {
        ValueType::Any | ValueType::Undefined => Ok(expr),
        ValueType::Number => call(ctx, expr, "dyntype_new_number"),
        ValueType::Int => {
            let mut expr = expr;
            expr.instrs.push(Instruction::F64ConvertI32U);
            call(ctx, expr, "dyntype_new_number")
        }
        ValueType::Boolean => call(ctx, expr, "dyntype_new_boolean"),
        ValueType::String => call(ctx, expr, "dyntype_new_string"),
        ValueType::Null => {
            let mut instrs = expr.instrs;
            if expr.ty.is_some() {
                instrs.push(Instruction::Drop);
            }
            instrs.push(ctx.runtime.get_context());
            instrs.push(ctx.runtime.call("dyntype_new_null")?);
            Ok(Expr::typed(instrs, anyref()))
        }
        ValueType::Object(meta) => {
            let tag = if meta.is_interface {
                ExtRefTag::Interface
            } else {
                ExtRefTag::Object
            };
            box_extref(ctx, expr, tag)
        }
        ValueType::Array(_) => box_extref(ctx, expr, ExtRefTag::Array),
        ValueType::Function(_) => box_extref(ctx, expr, ExtRefTag::Closure),
        other => Err(unimplemented(format!("boxing {other:?} into any"))),
    }
}

fn box_extref(ctx: &mut CodegenContext, expr: Expr, tag: ExtRefTag) -> LowerResult<Expr> {
    let mut instrs = vec![ctx.runtime.get_context()];
    instrs.extend(expr.instrs);
    instrs.push(Instruction::I32Const(tag as i32));
    instrs.push(ctx.runtime.call("dyntype_new_extref")?);
    Ok(Expr::typed(instrs, anyref()))
}

/// Allocate a runtime object and populate it member by member.
fn box_object_literal(ctx: &mut CodegenContext, literal: &ObjectLiteralValue) -> LowerResult<Expr> {
    let obj = ctx.tmp(anyref())?;
    let mut instrs = vec![
        ctx.runtime.get_context(),
        ctx.runtime.call("dyntype_new_object")?,
        Instruction::LocalSet(obj),
    ];

    let mut field_values = literal.fields.iter();
    for member in &literal.meta.members {
        if member.is_static {
            continue;
        }
        let boxed = match member.kind {
            MemberKind::Field => {
                let value = field_values.next().and_then(Option::as_ref);
                match value {
                    Some(value) => box_to_any(ctx, value)?,
                    None => box_to_any(ctx, &Value::undefined())?,
                }
            }
            MemberKind::Method => match &member.method {
                Some(decl) => {
                    let closure = make_closure(ctx, decl)?;
                    box_extref(ctx, closure, ExtRefTag::Closure)?
                }
                None => continue,
            },
            MemberKind::Accessor => continue,
        };
        let name = strings::intern_cstring(&member.name);
        instrs.push(ctx.runtime.get_context());
        instrs.push(Instruction::LocalGet(obj));
        instrs.push(Instruction::I32Const(name as i32));
        instrs.extend(boxed.instrs);
        instrs.push(ctx.runtime.call("dyntype_set_property")?);
        instrs.push(Instruction::Drop);
    }
    instrs.push(Instruction::LocalGet(obj));
    Ok(Expr::typed(instrs, anyref()))
}

/// Allocate a runtime array and populate it slot by slot.
fn box_array_literal(ctx: &mut CodegenContext, literal: &ArrayLiteralValue) -> LowerResult<Expr> {
    let arr = ctx.tmp(anyref())?;
    let mut instrs = vec![
        ctx.runtime.get_context(),
        ctx.runtime.call("dyntype_new_array")?,
        Instruction::LocalSet(arr),
    ];
    for (index, element) in literal.elements.iter().enumerate() {
        let boxed = box_to_any(ctx, element)?;
        instrs.push(ctx.runtime.get_context());
        instrs.push(Instruction::LocalGet(arr));
        instrs.push(Instruction::I32Const(index as i32));
        instrs.extend(boxed.instrs);
        instrs.push(ctx.runtime.call("dyntype_set_elem")?);
    }
    instrs.push(Instruction::LocalGet(arr));
    Ok(Expr::typed(instrs, anyref()))
}

/// Unbox an `any` handle back to a static representation. The kind test
/// comes from the runtime; on mismatch the module traps, since casts have
/// been type-checked upstream.
pub(crate) fn unbox_from_any(
    ctx: &mut CodegenContext,
    expr: Expr,
    to: &ValueType,
) -> LowerResult<Expr> {
    let to = ctx.types.resolve(to);
    match &to {
        ValueType::Any | ValueType::Undefined => Ok(expr),
        ValueType::Number => unbox_primitive(
            ctx,
            expr,
            "dyntype_is_number",
            "dyntype_to_number",
            ValType::F64,
            vec![],
        ),
        ValueType::Int => unbox_primitive(
            ctx,
            expr,
            "dyntype_is_number",
            "dyntype_to_number",
            ValType::I32,
            vec![Instruction::I32TruncSatF64U],
        ),
        ValueType::Boolean => unbox_primitive(
            ctx,
            expr,
            "dyntype_is_bool",
            "dyntype_to_bool",
            ValType::I32,
            vec![],
        ),
        ValueType::String => {
            let string = ref_null(ctx.types.string_heap);
            unbox_primitive(
                ctx,
                expr,
                "dyntype_is_string",
                "dyntype_to_string",
                string,
                vec![],
            )
        }
        ValueType::Null => {
            let tmp = ctx.tmp(anyref())?;
            let mut instrs = expr.instrs;
            instrs.push(Instruction::LocalSet(tmp));
            instrs.push(ctx.runtime.get_context());
            instrs.push(Instruction::LocalGet(tmp));
            instrs.push(ctx.runtime.call("dyntype_is_null")?);
            instrs.push(Instruction::If(BlockType::Result(structref())));
            instrs.push(Instruction::RefNull(wasm_encoder::HeapType::Abstract {
                shared: false,
                ty: wasm_encoder::AbstractHeapType::Struct,
            }));
            instrs.push(Instruction::Else);
            instrs.push(Instruction::Unreachable);
            instrs.push(Instruction::End);
            Ok(Expr::typed(instrs, structref()))
        }
        ValueType::Object(_) | ValueType::Array(_) | ValueType::Function(_) => {
            unbox_extref(ctx, expr, &to)
        }
        other => Err(unimplemented(format!("unboxing any into {other:?}"))),
    }
}

fn unbox_primitive(
    ctx: &mut CodegenContext,
    expr: Expr,
    guard: &str,
    convert: &str,
    result: ValType,
    fixup: Vec<Instruction<'static>>,
) -> LowerResult<Expr> {
    let tmp = ctx.tmp(anyref())?;
    let mut instrs = expr.instrs;
    instrs.push(Instruction::LocalSet(tmp));
    instrs.push(ctx.runtime.get_context());
    instrs.push(Instruction::LocalGet(tmp));
    instrs.push(ctx.runtime.call(guard)?);
    instrs.push(Instruction::If(BlockType::Result(result)));
    instrs.push(ctx.runtime.get_context());
    instrs.push(Instruction::LocalGet(tmp));
    instrs.push(ctx.runtime.call(convert)?);
    instrs.extend(fixup);
    instrs.push(Instruction::Else);
    instrs.push(Instruction::Unreachable);
    instrs.push(Instruction::End);
    Ok(Expr::typed(instrs, result))
}

/// Unbox a handle wrapping an external reference: resolve the table slot,
/// load the reference and cast it to the target heap type. A handle may
/// wrap an interface box instead of the concrete object; in that case the
/// box's data slot is loaded first.
fn unbox_extref(ctx: &mut CodegenContext, expr: Expr, to: &ValueType) -> LowerResult<Expr> {
    let target_heap = {
        let lowered = ctx.lowered(to)?;
        lowered
            .heap
            .ok_or_else(|| unimplemented(format!("extref unbox into {to:?}")))?
    };
    let target = ref_null(target_heap);
    let table = ctx.runtime.extref_table;
    let interface_heap = ctx.types.interface_heap;
    let tmp = ctx.tmp(anyref())?;

    let mut instrs = expr.instrs;
    instrs.push(Instruction::LocalSet(tmp));

    if to.is_interface() {
        // The target itself is an interface box; no data extraction.
        instrs.push(ctx.runtime.get_context());
        instrs.push(Instruction::LocalGet(tmp));
        instrs.push(ctx.runtime.call("dyntype_to_extref")?);
        instrs.push(Instruction::TableGet(table));
        instrs.push(Instruction::RefCastNullable(wasm_encoder::HeapType::Concrete(
            target_heap,
        )));
        return Ok(Expr::typed(instrs, target));
    }

    instrs.push(ctx.runtime.get_context());
    instrs.push(Instruction::LocalGet(tmp));
    instrs.push(ctx.runtime.call("dyntype_typeof1")?);
    instrs.push(Instruction::I32Const(TYPE_TAG_INTERFACE));
    instrs.push(Instruction::I32Eq);
    instrs.push(Instruction::If(BlockType::Result(target)));
    instrs.push(ctx.runtime.get_context());
    instrs.push(Instruction::LocalGet(tmp));
    instrs.push(ctx.runtime.call("dyntype_to_extref")?);
    instrs.push(Instruction::TableGet(table));
    instrs.push(Instruction::RefCastNullable(wasm_encoder::HeapType::Concrete(
        interface_heap,
    )));
    instrs.push(Instruction::StructGet {
        struct_type_index: interface_heap,
        field_index: 3,
    });
    instrs.push(Instruction::RefCastNullable(wasm_encoder::HeapType::Concrete(
        target_heap,
    )));
    instrs.push(Instruction::Else);
    instrs.push(ctx.runtime.get_context());
    instrs.push(Instruction::LocalGet(tmp));
    instrs.push(ctx.runtime.call("dyntype_to_extref")?);
    instrs.push(Instruction::TableGet(table));
    instrs.push(Instruction::RefCastNullable(wasm_encoder::HeapType::Concrete(
        target_heap,
    )));
    instrs.push(Instruction::End);
    Ok(Expr::typed(instrs, target))
}

impl Lower for TypeOfValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let boxed = box_to_any(ctx, &self.value)?;
        let mut instrs = vec![ctx.runtime.get_context()];
        instrs.extend(boxed.instrs);
        instrs.push(ctx.runtime.call("dyntype_typeof")?);
        Ok(Expr::typed(instrs, anyref()))
    }
}

impl Lower for ToStringValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let boxed = box_to_any(ctx, &self.value)?;
        let mut instrs = vec![ctx.runtime.get_context()];
        instrs.extend(boxed.instrs);
        instrs.push(ctx.runtime.call("dyntype_toString")?);
        Ok(Expr::typed(instrs, anyref()))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use wasm_encoder::Instruction;

    use crate::codegen::test_support::lowering_fixture;
    use crate::semantics::{Value, ValueType};

    use super::*;

    #[test]
    fn test_number_round_trip_boxes_then_guards() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let ctx = &mut fixture.ctx;

        let boxed = box_to_any(ctx, &Value::number(1.0))?;
        let new_number = ctx.runtime.func("dyntype_new_number")?;
        assert!(boxed
            .instrs
            .iter()
            .any(|i| matches!(i, Instruction::Call(idx) if *idx == new_number)));

        let unboxed = unbox_from_any(ctx, boxed, &ValueType::Number)?;
        let to_number = ctx.runtime.func("dyntype_to_number")?;
        assert!(unboxed
            .instrs
            .iter()
            .any(|i| matches!(i, Instruction::Call(idx) if *idx == to_number)));
        // The failing leg of the guard is a trap, not a recovery.
        assert!(unboxed
            .instrs
            .iter()
            .any(|i| matches!(i, Instruction::Unreachable)));
        assert_eq!(unboxed.ty, Some(wasm_encoder::ValType::F64));
        Ok(())
    }

    #[test]
    fn test_boxing_any_is_identity() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let ctx = &mut fixture.ctx;
        let expr = crate::codegen::Expr::typed(vec![Instruction::LocalGet(0)], anyref());
        let boxed = box_expr_to_any(ctx, expr, &ValueType::Any)?;
        assert_eq!(boxed.instrs.len(), 1);
        Ok(())
    }
}
