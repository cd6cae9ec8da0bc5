//! Call and dispatch: argument-list construction (environment prefix,
//! defaults, optionals, rest packaging) and the resolution of every call
//! form — direct, closure, vtable, interface, static, built-in holder,
//! dynamic and `any`-call.

use std::rc::Rc;

use wasm_encoder::{Instruction, ValType};

use crate::codegen::builtins::ensure_array_push;
use crate::codegen::error::{invariant, unimplemented, LowerResult};
use crate::codegen::types::{anyref, ref_null, structref};
use crate::codegen::{generics, statements, strings, CodegenContext, Expr, Lower};
use crate::semantics::{
    AccessKind, Callee, CallValue, FunctionDeclareNode, FunctionType, MemberKind, Value, ValueType,
};

use super::any::box_to_any;
use super::closure::current_context_ref;
use super::interface::interface_method_call;
use super::object::coerce;

/// Build the complete parameter list for a call: the environment prefix
/// followed by the user arguments, with optional slots pre-initialized to
/// boxed `undefined`, defaults taken from the callee declaration, and the
/// rest parameter packaged into a fresh array.
pub(crate) fn build_args(
    ctx: &mut CodegenContext,
    func_type: &FunctionType,
    env_prefix: Vec<Expr>,
    args: &[Value],
    callee_decl: Option<&FunctionDeclareNode>,
) -> LowerResult<Vec<Expr>> {
    if env_prefix.len() != func_type.env_param_count {
        return Err(invariant(format!(
            "call carries {} environment arguments but the signature expects {}",
            env_prefix.len(),
            func_type.env_param_count
        )));
    }
    let mut out = env_prefix;
    out.extend(user_args(ctx, func_type, args, callee_decl)?);
    Ok(out)
}

fn user_args(
    ctx: &mut CodegenContext,
    func_type: &FunctionType,
    args: &[Value],
    callee_decl: Option<&FunctionDeclareNode>,
) -> LowerResult<Vec<Expr>> {
    let mut out = Vec::with_capacity(func_type.params.len());
    for (index, param_ty) in func_type.params.iter().enumerate() {
        if Some(index) == func_type.rest_index {
            out.push(rest_argument(ctx, param_ty, &args[args.len().min(index)..])?);
            continue;
        }
        if index < args.len() {
            let arg = &args[index];
            let lowered = ctx.lower_value(arg)?;
            out.push(coerce(ctx, lowered, &arg.value_type(), param_ty)?);
            continue;
        }
        let default = callee_decl
            .and_then(|decl| decl.params.get(index))
            .and_then(|param| param.default.clone());
        if let Some(default) = default {
            let lowered = ctx.lower_value(&default)?;
            out.push(coerce(ctx, lowered, &default.value_type(), param_ty)?);
            continue;
        }
        if func_type.optional_mask.get(index).copied().unwrap_or(false) {
            out.push(ctx.lower_value(&Value::undefined())?);
            continue;
        }
        return Err(invariant(format!(
            "missing argument {index} and no default to fill it"
        )));
    }
    Ok(out)
}

/// Collect the provided tail into a fresh array for the rest slot; a
/// missing tail becomes an empty array.
fn rest_argument(
    ctx: &mut CodegenContext,
    param_ty: &ValueType,
    rest: &[Value],
) -> LowerResult<Expr> {
    let element = match ctx.types.resolve(param_ty) {
        ValueType::Array(element) => *element,
        other => {
            return Err(invariant(format!(
                "rest parameter has non-array type {other:?}"
            )))
        }
    };
    let mut elements = Vec::with_capacity(rest.len());
    for value in rest {
        let lowered = ctx.lower_value(value)?;
        elements.push(coerce(ctx, lowered, &value.value_type(), &element)?);
    }
    super::element::build_array(ctx, &element, elements)
}

impl Lower for CallValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        match &self.callee {
            Callee::Direct(decl) => lower_direct(ctx, self, decl),
            Callee::Closure { value, func_type } => lower_closure_call(ctx, self, value, func_type),
            Callee::Method { receiver, member } => lower_method(ctx, self, receiver, member),
            Callee::Static { class, member } => lower_static(ctx, self, class, member),
            Callee::BuiltIn {
                holder,
                member,
                receiver,
            } => lower_builtin(ctx, self, holder, member, receiver.as_deref()),
            Callee::Any(callee) => lower_any_call(ctx, self, callee),
        }
    }
}

/// Statically resolved call, including `super(...)`. A callee bearing
/// specialization arguments is routed through the monomorphizer first.
fn lower_direct(
    ctx: &mut CodegenContext,
    call: &CallValue,
    decl: &Rc<FunctionDeclareNode>,
) -> LowerResult<Expr> {
    let declared_type = decl.func_type();
    let (name, func_type) = if !call.type_args.is_empty() {
        generics::specialize(ctx, decl, &call.type_args)?
    } else if declared_type.requests_specialization() {
        let args = declared_type.specialization_args.clone();
        generics::specialize(ctx, decl, &args)?
    } else {
        (ctx.wasm_name_of(decl), declared_type)
    };

    if !ctx.module.has_function(&name) {
        statements::function::declare_function(ctx, decl, None, false)?;
    }
    let index = ctx
        .module
        .function_index(&name)
        .ok_or_else(|| invariant(format!("call to undeclared function '{name}'")))?;

    let mut env_prefix = vec![current_context_ref(ctx, decl.parent_context.as_ref())?];
    if decl.this_type.is_some() {
        let (this_local, _) = ctx
            .cur()?
            .this_var
            .clone()
            .ok_or_else(|| invariant(format!("'{name}' needs a receiver but none is bound")))?;
        env_prefix.push(Expr::typed(
            vec![Instruction::LocalGet(this_local)],
            structref(),
        ));
    }

    let args = build_args(ctx, &func_type, env_prefix, &call.args, Some(decl))?;
    let mut instrs = Vec::new();
    for arg in args {
        instrs.extend(arg.instrs);
    }
    instrs.push(Instruction::Call(index));
    result_expr(ctx, instrs, &func_type.return_type)
}

/// Call of a first-class function value: unpack `{context, funcref}` and
/// `call_ref` through the signature.
fn lower_closure_call(
    ctx: &mut CodegenContext,
    call: &CallValue,
    value: &Value,
    func_type: &Rc<FunctionType>,
) -> LowerResult<Expr> {
    let CodegenContext { module, types, .. } = ctx;
    let signature = types.signature_index(&mut module.types, func_type)?;
    let closure_heap = types.closure_heap(&mut module.types, func_type)?;

    let callee = ctx.lower_value(value)?;
    let tmp = ctx.tmp(ref_null(closure_heap))?;

    let mut prefix = callee.instrs;
    prefix.push(Instruction::LocalSet(tmp));
    prefix.push(Instruction::LocalGet(tmp));
    prefix.push(Instruction::StructGet {
        struct_type_index: closure_heap,
        field_index: 0,
    });
    let env_prefix = vec![Expr::typed(prefix, structref())];

    let args = build_args(ctx, func_type, env_prefix, &call.args, None)?;
    let mut instrs = Vec::new();
    for arg in args {
        instrs.extend(arg.instrs);
    }
    instrs.push(Instruction::LocalGet(tmp));
    instrs.push(Instruction::StructGet {
        struct_type_index: closure_heap,
        field_index: 1,
    });
    instrs.push(Instruction::CallRef(signature));
    result_expr(ctx, instrs, &func_type.return_type)
}

/// Member call on an object, interface or `any` receiver.
fn lower_method(
    ctx: &mut CodegenContext,
    call: &CallValue,
    receiver: &Value,
    member: &str,
) -> LowerResult<Expr> {
    let receiver_ty = ctx.types.resolve(&receiver.value_type());
    match &receiver_ty {
        ValueType::Object(meta) if meta.is_interface => {
            let func_type = method_type(meta, member)?;
            let receiver = ctx.lower_value(receiver)?;
            let args = user_args(ctx, &func_type, &call.args, None)?;
            interface_method_call(ctx, receiver, meta, member, &func_type, args)
        }
        ValueType::Object(meta) => {
            let func_type = method_type(meta, member)?;
            let lowered = ctx.lowered(&receiver_ty)?;
            let instance = lowered.heap.expect("instance type");
            let vtable = lowered.vtable.expect("vtable type");
            let slot = meta
                .vtable_index(member, AccessKind::Method)
                .ok_or_else(|| invariant(format!("'{member}' has no vtable slot")))?;
            let CodegenContext { module, types, .. } = ctx;
            let signature = types.signature_index(&mut module.types, &func_type)?;

            let receiver = ctx.lower_value(receiver)?;
            let tmp = ctx.tmp(receiver.ty.expect("receivers are values"))?;
            let mut prefix = receiver.instrs;
            prefix.push(Instruction::LocalSet(tmp));
            prefix.push(Instruction::RefNull(wasm_encoder::HeapType::Abstract {
                shared: false,
                ty: wasm_encoder::AbstractHeapType::Struct,
            }));
            let env_prefix = vec![
                Expr::typed(prefix, structref()),
                Expr::typed(vec![Instruction::LocalGet(tmp)], structref()),
            ];
            let args = build_args(ctx, &func_type, env_prefix, &call.args, None)?;

            let mut instrs = Vec::new();
            for arg in args {
                instrs.extend(arg.instrs);
            }
            instrs.push(Instruction::LocalGet(tmp));
            instrs.push(Instruction::StructGet {
                struct_type_index: instance,
                field_index: 0,
            });
            instrs.push(Instruction::StructGet {
                struct_type_index: vtable,
                field_index: slot as u32,
            });
            instrs.push(Instruction::CallRef(signature));
            result_expr(ctx, instrs, &func_type.return_type)
        }
        ValueType::Any => {
            let name = strings::intern_cstring(member);
            let mut instrs = vec![
                ctx.runtime.get_context(),
                Instruction::I32Const(name as i32),
            ];
            instrs.extend(ctx.lower_value(receiver)?.instrs);
            instrs.extend(dynamic_args(ctx, &call.args)?);
            instrs.push(ctx.runtime.call("dyntype_invoke_func")?);
            Ok(Expr::typed(instrs, anyref()))
        }
        other => Err(unimplemented(format!("method call on {other:?}"))),
    }
}

fn method_type(
    meta: &Rc<crate::semantics::ObjectDescription>,
    member: &str,
) -> LowerResult<Rc<FunctionType>> {
    let found = meta
        .member(member)
        .ok_or_else(|| invariant(format!("'{}' has no member '{member}'", meta.name)))?;
    if found.kind != MemberKind::Method {
        return Err(invariant(format!(
            "member '{member}' of '{}' is not a method",
            meta.name
        )));
    }
    match &found.value_type {
        ValueType::Function(func) => Ok(Rc::clone(func)),
        other => Err(invariant(format!(
            "method '{member}' has non-function type {other:?}"
        ))),
    }
}

/// Static method call: the emitted name walks the base chain to the
/// owning class when the member is inherited.
fn lower_static(
    ctx: &mut CodegenContext,
    call: &CallValue,
    class: &Rc<crate::semantics::ObjectDescription>,
    member: &str,
) -> LowerResult<Expr> {
    let owner = class
        .owner_of(member)
        .ok_or_else(|| invariant(format!("'{}' has no static member '{member}'", class.name)))?;
    let found = owner
        .member(member)
        .ok_or_else(|| invariant(format!("missing member '{member}'")))?;
    let func_type = match &found.value_type {
        ValueType::Function(func) => Rc::clone(func),
        other => {
            return Err(invariant(format!(
                "static '{member}' has non-function type {other:?}"
            )))
        }
    };

    let name = format!("{}|{member}", owner.name);
    let index = ctx
        .module
        .function_index(&name)
        .ok_or_else(|| invariant(format!("call to undeclared static '{name}'")))?;

    let null_env = Expr::typed(
        vec![Instruction::RefNull(wasm_encoder::HeapType::Abstract {
            shared: false,
            ty: wasm_encoder::AbstractHeapType::Struct,
        })],
        structref(),
    );
    let env_prefix = vec![null_env; func_type.env_param_count];
    let args = build_args(ctx, &func_type, env_prefix, &call.args, None)?;
    let mut instrs = Vec::new();
    for arg in args {
        instrs.extend(arg.instrs);
    }
    instrs.push(Instruction::Call(index));
    result_expr(ctx, instrs, &func_type.return_type)
}

/// Calls on the well-known built-in holders (`Array`, `console`, `Math`).
fn lower_builtin(
    ctx: &mut CodegenContext,
    call: &CallValue,
    holder: &str,
    member: &str,
    receiver: Option<&Value>,
) -> LowerResult<Expr> {
    match holder {
        "Math" => lower_math(ctx, call, member),
        "console" => match member {
            "log" | "error" | "warn" => {
                let mut instrs = dynamic_args(ctx, &call.args)?;
                instrs.push(ctx.runtime.call("console_log")?);
                Ok(Expr::void(instrs))
            }
            other => Err(unimplemented(format!("built-in console.{other}"))),
        },
        "Array" => {
            let receiver = receiver
                .ok_or_else(|| invariant(format!("Array.{member} needs a receiver")))?;
            let receiver_ty = ctx.types.resolve(&receiver.value_type());
            let ValueType::Array(element) = &receiver_ty else {
                return Err(invariant(format!(
                    "Array.{member} on non-array receiver {receiver_ty:?}"
                )));
            };
            match member {
                "push" => {
                    let push = ensure_array_push(ctx, element)?;
                    let mut instrs = ctx.lower_value(receiver)?.instrs;
                    let arg = call
                        .args
                        .first()
                        .ok_or_else(|| invariant("Array.push without an argument"))?;
                    let lowered = ctx.lower_value(arg)?;
                    let lowered = coerce(ctx, lowered, &arg.value_type(), element)?;
                    instrs.extend(lowered.instrs);
                    instrs.push(Instruction::Call(push));
                    Ok(Expr::typed(instrs, ValType::F64))
                }
                other => Err(unimplemented(format!("built-in Array.{other}"))),
            }
        }
        other => Err(unimplemented(format!("built-in holder '{other}'"))),
    }
}

/// `Math` members with a direct wasm counterpart lower inline.
fn lower_math(ctx: &mut CodegenContext, call: &CallValue, member: &str) -> LowerResult<Expr> {
    let unary = |ctx: &mut CodegenContext, op: Instruction<'static>| -> LowerResult<Expr> {
        let arg = call
            .args
            .first()
            .ok_or_else(|| invariant(format!("Math.{member} without an argument")))?;
        let mut instrs = ctx.lower_value(arg)?.instrs;
        instrs.push(op);
        Ok(Expr::typed(instrs, ValType::F64))
    };
    let binary = |ctx: &mut CodegenContext, op: Instruction<'static>| -> LowerResult<Expr> {
        let [a, b] = call.args.as_slice() else {
            return Err(invariant(format!("Math.{member} expects two arguments")));
        };
        let mut instrs = ctx.lower_value(a)?.instrs;
        instrs.extend(ctx.lower_value(b)?.instrs);
        instrs.push(op);
        Ok(Expr::typed(instrs, ValType::F64))
    };
    match member {
        "sqrt" => unary(ctx, Instruction::F64Sqrt),
        "abs" => unary(ctx, Instruction::F64Abs),
        "floor" => unary(ctx, Instruction::F64Floor),
        "ceil" => unary(ctx, Instruction::F64Ceil),
        "min" => binary(ctx, Instruction::F64Min),
        "max" => binary(ctx, Instruction::F64Max),
        other => Err(unimplemented(format!("built-in Math.{other}"))),
    }
}

/// Call of an `any` value: parameters ride in an `any`-typed array, the
/// runtime resolves and invokes the callee.
fn lower_any_call(
    ctx: &mut CodegenContext,
    call: &CallValue,
    callee: &Value,
) -> LowerResult<Expr> {
    let mut instrs = vec![ctx.runtime.get_context(), Instruction::I32Const(0)];
    instrs.extend(ctx.lower_value(callee)?.instrs);
    instrs.extend(dynamic_args(ctx, &call.args)?);
    instrs.push(ctx.runtime.call("dyntype_invoke_func")?);
    Ok(Expr::typed(instrs, anyref()))
}

/// Package arguments into a fresh `any`-typed array.
fn dynamic_args(ctx: &mut CodegenContext, args: &[Value]) -> LowerResult<Vec<Instruction<'static>>> {
    let mut boxed = Vec::with_capacity(args.len());
    for arg in args {
        boxed.push(box_to_any(ctx, arg)?);
    }
    let mut instrs = Vec::new();
    let count = boxed.len() as u32;
    for arg in boxed {
        instrs.extend(arg.instrs);
    }
    instrs.push(Instruction::ArrayNewFixed {
        array_type_index: ctx.types.any_array_heap,
        array_size: count,
    });
    Ok(instrs)
}

fn result_expr(
    ctx: &mut CodegenContext,
    instrs: Vec<Instruction<'static>>,
    return_type: &ValueType,
) -> LowerResult<Expr> {
    let lowered = ctx.lowered(return_type)?;
    Ok(match lowered.val_type {
        Some(ty) => Expr::typed(instrs, ty),
        None => Expr::void(instrs),
    })
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use wasm_encoder::Instruction;

    use crate::codegen::test_support::lowering_fixture;
    use crate::codegen::CodegenError;
    use crate::semantics::{
        Callee, CallValue, FunctionDeclareNode, FunctionType, ParamDeclare, Value, ValueType,
    };

    use super::*;

    #[test]
    fn test_env_prefix_count_is_enforced() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let func_type = FunctionType::method(vec![], ValueType::Void);
        // A method signature expects two environment arguments.
        let result = build_args(&mut fixture.ctx, &func_type, vec![], &[], None);
        assert!(matches!(result, Err(CodegenError::InvariantViolated(_))));
        Ok(())
    }

    #[test]
    fn test_rest_parameter_packs_remaining_arguments() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let mut func_type = FunctionType::new(
            vec![ValueType::Array(Box::new(ValueType::Number))],
            ValueType::Number,
        );
        func_type.rest_index = Some(0);

        let mut decl = FunctionDeclareNode::new("f", func_type.clone());
        decl.params = vec![ParamDeclare::new(
            "xs",
            ValueType::Array(Box::new(ValueType::Number)),
        )];

        let args = [Value::number(1.0), Value::number(2.0), Value::number(3.0)];
        let built = user_args(&mut fixture.ctx, &func_type, &args, Some(&decl))?;
        assert_eq!(built.len(), 1);
        // The single rest slot receives an array of length 3.
        assert!(built[0].instrs.iter().any(|i| matches!(
            i,
            Instruction::ArrayNewFixed { array_size: 3, .. }
        )));
        Ok(())
    }

    #[test]
    fn test_missing_optional_becomes_boxed_undefined() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let mut func_type = FunctionType::new(vec![ValueType::Any], ValueType::Void);
        func_type.optional_mask = vec![true];

        let built = user_args(&mut fixture.ctx, &func_type, &[], None)?;
        let new_undefined = fixture.ctx.runtime.func("dyntype_new_undefined")?;
        assert!(built[0]
            .instrs
            .iter()
            .any(|i| matches!(i, Instruction::Call(idx) if *idx == new_undefined)));
        Ok(())
    }

    #[test]
    fn test_any_call_packages_arguments() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let decl = crate::semantics::VarDeclareNode::local("f", ValueType::Any);
        let any = crate::codegen::types::anyref();
        fixture.ctx.cur()?.bind_var(&decl, any);

        let call = Value::Call(CallValue {
            callee: Callee::Any(Box::new(Value::read(&decl))),
            args: vec![Value::number(1.0)],
            type_args: vec![],
            ty: ValueType::Any,
        });
        let expr = fixture.lower(&call)?;
        let invoke = fixture.ctx.runtime.func("dyntype_invoke_func")?;
        assert!(expr
            .instrs
            .iter()
            .any(|i| matches!(i, Instruction::Call(idx) if *idx == invoke)));
        assert!(expr
            .instrs
            .iter()
            .any(|i| matches!(i, Instruction::ArrayNewFixed { array_size: 1, .. })));
        Ok(())
    }
}
