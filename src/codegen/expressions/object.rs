//! Concrete-object operations: allocation, literals, field access and
//! accessor dispatch. Interface receivers route to `interface`, `any`
//! receivers to the dynamic runtime.

use std::rc::Rc;

use wasm_encoder::{Instruction, ValType};

use crate::codegen::error::{invariant, unimplemented, LowerResult};
use crate::codegen::statements::globals::{ensure_class, static_fields_global, vtable_global};
use crate::codegen::types::{anyref, ref_null, structref};
use crate::codegen::{strings, CodegenContext, Expr, Lower};
use crate::semantics::{
    AccessKind, FieldGetValue, FieldSetValue, FunctionType, MemberKind, NewValue,
    ObjectDescription, ObjectLiteralValue, ObjectMember, StaticGetValue, StaticSetValue, Value,
    ValueType,
};

use super::any::{box_expr_to_any, box_to_any, unbox_from_any};
use super::call::build_args;
use super::interface::{interface_field_get, interface_field_set};

/// Box a static value when it flows into an `Any`-typed slot.
pub(crate) fn coerce(
    ctx: &mut CodegenContext,
    expr: Expr,
    from: &ValueType,
    to: &ValueType,
) -> LowerResult<Expr> {
    let from = ctx.types.resolve(from);
    let to = ctx.types.resolve(to);
    if to == ValueType::Any && from != ValueType::Any {
        return box_expr_to_any(ctx, expr, &from);
    }
    Ok(expr)
}

/// Allocate an instance with its vtable and default field values; the
/// constructor overwrites the fields afterwards.
pub(crate) fn allocate_instance(
    ctx: &mut CodegenContext,
    meta: &Rc<ObjectDescription>,
) -> LowerResult<Expr> {
    let lowered = ctx.lowered(&ValueType::Object(Rc::clone(meta)))?;
    let instance = lowered
        .heap
        .ok_or_else(|| invariant(format!("'{}' has no instance type", meta.name)))?;
    let vtable_index = ctx
        .module
        .global_index(&vtable_global(meta))
        .ok_or_else(|| invariant(format!("'{}' has no vtable global", meta.name)))?;

    let mut instrs = vec![Instruction::GlobalGet(vtable_index)];
    for member in &meta.members {
        if member.is_static || member.kind != MemberKind::Field {
            continue;
        }
        let CodegenContext { module, types, .. } = ctx;
        instrs.extend(types.default_value(&mut module.types, &member.value_type)?);
    }
    instrs.push(Instruction::StructNew(instance));
    Ok(Expr::typed(instrs, ref_null(instance)))
}

impl Lower for NewValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        ensure_class(ctx, &self.meta)?;

        let Some(ctor) = self.meta.ctor.clone() else {
            // No declared constructor: fall back to the runtime allocator
            // and unbox the handle it returns.
            let name = strings::intern_cstring(&self.meta.name);
            let mut instrs = vec![
                ctx.runtime.get_context(),
                Instruction::I32Const(name as i32),
            ];
            let mut boxed_args = Vec::new();
            for arg in &self.args {
                boxed_args.push(box_to_any(ctx, arg)?);
            }
            let count = boxed_args.len() as u32;
            for arg in boxed_args {
                instrs.extend(arg.instrs);
            }
            instrs.push(Instruction::ArrayNewFixed {
                array_type_index: ctx.types.any_array_heap,
                array_size: count,
            });
            instrs.push(ctx.runtime.call("dyntype_new_object_with_class")?);
            let handle = Expr::typed(instrs, anyref());
            return unbox_from_any(ctx, handle, &ValueType::Object(Rc::clone(&self.meta)));
        };

        let instance = allocate_instance(ctx, &self.meta)?;
        let this_tmp = ctx.tmp(instance.ty.expect("instances are values"))?;
        let ctor_name = format!("{}|constructor", self.meta.name);
        let ctor_index = ctx
            .module
            .function_index(&ctor_name)
            .ok_or_else(|| invariant(format!("undeclared constructor '{ctor_name}'")))?;

        let mut instrs = instance.instrs;
        instrs.push(Instruction::LocalSet(this_tmp));

        let env_prefix = vec![
            Expr::typed(
                vec![Instruction::RefNull(wasm_encoder::HeapType::Abstract {
                    shared: false,
                    ty: wasm_encoder::AbstractHeapType::Struct,
                })],
                structref(),
            ),
            Expr::typed(vec![Instruction::LocalGet(this_tmp)], structref()),
        ];
        let args = build_args(ctx, &ctor.func_type(), env_prefix, &self.args, Some(&ctor))?;
        for arg in args {
            instrs.extend(arg.instrs);
        }
        instrs.push(Instruction::Call(ctor_index));
        instrs.push(Instruction::LocalGet(this_tmp));
        Ok(Expr::typed(instrs, instance.ty.expect("instance type")))
    }
}

impl Lower for ObjectLiteralValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        ensure_class(ctx, &self.meta)?;
        let lowered = ctx.lowered(&ValueType::Object(Rc::clone(&self.meta)))?;
        let instance = lowered
            .heap
            .ok_or_else(|| invariant(format!("'{}' has no instance type", self.meta.name)))?;
        let vtable = lowered
            .vtable
            .ok_or_else(|| invariant(format!("'{}' has no vtable type", self.meta.name)))?;

        // Vtable and instance are built in a single pass: function refs
        // first, then the field values in declaration order.
        let mut instrs = Vec::new();
        for member in &self.meta.members {
            if member.is_static {
                continue;
            }
            for decl in member_functions(member) {
                let name = ctx.wasm_name_of(&decl);
                let index = ctx
                    .module
                    .function_index(&name)
                    .ok_or_else(|| invariant(format!("undeclared literal method '{name}'")))?;
                ctx.module.declare_ref_func(index);
                instrs.push(Instruction::RefFunc(index));
            }
        }
        instrs.push(Instruction::StructNew(vtable));

        let mut field_values = self.fields.iter();
        for member in &self.meta.members {
            if member.is_static || member.kind != MemberKind::Field {
                continue;
            }
            let provided = field_values.next().and_then(Option::as_ref);
            let expr = match provided {
                Some(value) => {
                    let lowered = ctx.lower_value(value)?;
                    coerce(ctx, lowered, &value.value_type(), &member.value_type)?
                }
                // Omitted positions hold `undefined` boxed into `Any`.
                None => ctx.lower_value(&Value::undefined())?,
            };
            instrs.extend(expr.instrs);
        }
        instrs.push(Instruction::StructNew(instance));
        Ok(Expr::typed(instrs, ref_null(instance)))
    }
}

/// The function declarations backing one member's vtable slots.
fn member_functions(member: &ObjectMember) -> Vec<Rc<crate::semantics::FunctionDeclareNode>> {
    let mut decls = Vec::new();
    match member.kind {
        MemberKind::Field => {}
        MemberKind::Method => {
            if let Some(decl) = &member.method {
                decls.push(Rc::clone(decl));
            }
        }
        MemberKind::Accessor => {
            if let Some(getter) = &member.getter {
                decls.push(Rc::clone(getter));
            }
            if let Some(setter) = &member.setter {
                decls.push(Rc::clone(setter));
            }
        }
    }
    decls
}

impl Lower for FieldGetValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let receiver_ty = ctx.types.resolve(&self.receiver.value_type());
        match &receiver_ty {
            ValueType::Object(meta) if meta.is_interface => {
                let receiver = ctx.lower_value(&self.receiver)?;
                interface_field_get(ctx, receiver, meta, &self.member)
            }
            ValueType::Object(meta) => concrete_field_get(ctx, self, meta),
            ValueType::Any => {
                let name = strings::intern_cstring(&self.member);
                let mut instrs = vec![ctx.runtime.get_context()];
                instrs.extend(ctx.lower_value(&self.receiver)?.instrs);
                instrs.push(Instruction::I32Const(name as i32));
                instrs.push(ctx.runtime.call("dyntype_get_property")?);
                Ok(Expr::typed(instrs, anyref()))
            }
            // `length` of an array is the explicit wrapper slot.
            ValueType::Array(_) if self.member == "length" => {
                let wrapper = ctx.lowered(&receiver_ty)?.heap.expect("array wrapper");
                let mut instrs = ctx.lower_value(&self.receiver)?.instrs;
                instrs.push(Instruction::StructGet {
                    struct_type_index: wrapper,
                    field_index: 1,
                });
                instrs.push(Instruction::F64ConvertI32U);
                Ok(Expr::typed(instrs, ValType::F64))
            }
            ValueType::String if self.member == "length" => {
                let mut instrs = ctx.lower_value(&self.receiver)?.instrs;
                instrs.push(Instruction::StructGet {
                    struct_type_index: ctx.types.string_heap,
                    field_index: 1,
                });
                instrs.push(Instruction::ArrayLen);
                instrs.push(Instruction::F64ConvertI32U);
                Ok(Expr::typed(instrs, ValType::F64))
            }
            other => Err(unimplemented(format!("field read on {other:?}"))),
        }
    }
}

fn concrete_field_get(
    ctx: &mut CodegenContext,
    value: &FieldGetValue,
    meta: &Rc<ObjectDescription>,
) -> LowerResult<Expr> {
    let member = meta
        .member(&value.member)
        .ok_or_else(|| invariant(format!("'{}' has no member '{}'", meta.name, value.member)))?
        .clone();
    let lowered = ctx.lowered(&ValueType::Object(Rc::clone(meta)))?;
    let instance = lowered.heap.expect("instance type");

    match member.kind {
        MemberKind::Field => {
            let index = meta
                .field_index(&member.name)
                .ok_or_else(|| invariant(format!("'{}' is not an instance field", member.name)))?;
            let mut instrs = ctx.lower_value(&value.receiver)?.instrs;
            instrs.push(Instruction::StructGet {
                struct_type_index: instance,
                field_index: 1 + index as u32,
            });
            let ty = ctx.wasm_type_of(&member.value_type)?;
            Ok(Expr::typed(instrs, ty))
        }
        MemberKind::Accessor if member.has_getter => {
            let getter = FunctionType::method(vec![], member.value_type.clone());
            vtable_dispatch(ctx, value, meta, &member.name, AccessKind::Getter, &getter, None)
        }
        other => Err(unimplemented(format!(
            "reading {other:?} member '{}'",
            member.name
        ))),
    }
}

/// Accessor dispatch through the vtable at slot 0 of the instance.
fn vtable_dispatch(
    ctx: &mut CodegenContext,
    value: &FieldGetValue,
    meta: &Rc<ObjectDescription>,
    member_name: &str,
    access: AccessKind,
    func_type: &FunctionType,
    argument: Option<Expr>,
) -> LowerResult<Expr> {
    let lowered = ctx.lowered(&ValueType::Object(Rc::clone(meta)))?;
    let instance = lowered.heap.expect("instance type");
    let vtable = lowered.vtable.expect("vtable type");
    let slot = meta
        .vtable_index(member_name, access)
        .ok_or_else(|| invariant(format!("'{member_name}' has no vtable slot")))?;

    let CodegenContext { module, types, .. } = ctx;
    let signature = types.signature_index(&mut module.types, func_type)?;
    let result_ty = types
        .lower(&mut module.types, &func_type.return_type)?
        .val_type;

    let receiver = ctx.lower_value(&value.receiver)?;
    let this_tmp = ctx.tmp(receiver.ty.expect("receivers are values"))?;

    let mut instrs = receiver.instrs;
    instrs.push(Instruction::LocalSet(this_tmp));
    instrs.push(Instruction::RefNull(wasm_encoder::HeapType::Abstract {
        shared: false,
        ty: wasm_encoder::AbstractHeapType::Struct,
    }));
    instrs.push(Instruction::LocalGet(this_tmp));
    if let Some(argument) = argument {
        instrs.extend(argument.instrs);
    }
    instrs.push(Instruction::LocalGet(this_tmp));
    instrs.push(Instruction::StructGet {
        struct_type_index: instance,
        field_index: 0,
    });
    instrs.push(Instruction::StructGet {
        struct_type_index: vtable,
        field_index: slot as u32,
    });
    instrs.push(Instruction::CallRef(signature));
    Ok(match result_ty {
        Some(ty) => Expr::typed(instrs, ty),
        None => Expr::void(instrs),
    })
}

impl Lower for FieldSetValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let receiver_ty = ctx.types.resolve(&self.receiver.value_type());
        match &receiver_ty {
            ValueType::Object(meta) if meta.is_interface => {
                let receiver = ctx.lower_value(&self.receiver)?;
                let member_ty = meta
                    .member(&self.member)
                    .map(|m| m.value_type.clone())
                    .ok_or_else(|| {
                        invariant(format!("'{}' has no member '{}'", meta.name, self.member))
                    })?;
                let value = ctx.lower_value(&self.value)?;
                let value = coerce(ctx, value, &self.value.value_type(), &member_ty)?;
                interface_field_set(ctx, receiver, meta, &self.member, value)
            }
            ValueType::Object(meta) => concrete_field_set(ctx, self, meta),
            ValueType::Any => {
                let name = strings::intern_cstring(&self.member);
                let mut instrs = vec![ctx.runtime.get_context()];
                instrs.extend(ctx.lower_value(&self.receiver)?.instrs);
                instrs.push(Instruction::I32Const(name as i32));
                let value = ctx.lower_value(&self.value)?;
                let value = box_expr_to_any(ctx, value, &self.value.value_type())?;
                instrs.extend(value.instrs);
                instrs.push(ctx.runtime.call("dyntype_set_property")?);
                instrs.push(Instruction::Drop);
                Ok(Expr::void(instrs))
            }
            other => Err(unimplemented(format!("field write on {other:?}"))),
        }
    }
}

fn concrete_field_set(
    ctx: &mut CodegenContext,
    value: &FieldSetValue,
    meta: &Rc<ObjectDescription>,
) -> LowerResult<Expr> {
    let member = meta
        .member(&value.member)
        .ok_or_else(|| invariant(format!("'{}' has no member '{}'", meta.name, value.member)))?
        .clone();
    let lowered = ctx.lowered(&ValueType::Object(Rc::clone(meta)))?;
    let instance = lowered.heap.expect("instance type");

    match member.kind {
        MemberKind::Field => {
            let index = meta
                .field_index(&member.name)
                .ok_or_else(|| invariant(format!("'{}' is not an instance field", member.name)))?;
            let mut instrs = ctx.lower_value(&value.receiver)?.instrs;
            let rhs = ctx.lower_value(&value.value)?;
            let rhs = coerce(ctx, rhs, &value.value.value_type(), &member.value_type)?;
            instrs.extend(rhs.instrs);
            instrs.push(Instruction::StructSet {
                struct_type_index: instance,
                field_index: 1 + index as u32,
            });
            Ok(Expr::void(instrs))
        }
        MemberKind::Accessor if member.has_setter => {
            let setter = FunctionType::method(vec![member.value_type.clone()], ValueType::Void);
            let rhs = ctx.lower_value(&value.value)?;
            let rhs = coerce(ctx, rhs, &value.value.value_type(), &member.value_type)?;
            let get_view = FieldGetValue {
                receiver: value.receiver.clone(),
                member: value.member.clone(),
                ty: member.value_type.clone(),
            };
            vtable_dispatch(
                ctx,
                &get_view,
                meta,
                &member.name,
                AccessKind::Setter,
                &setter,
                Some(rhs),
            )
        }
        other => Err(unimplemented(format!(
            "writing {other:?} member '{}'",
            member.name
        ))),
    }
}

impl Lower for StaticGetValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let (owner, index) = static_owner(&self.class, &self.member)?;
        let global = ctx
            .module
            .global_index(&static_fields_global(&owner))
            .ok_or_else(|| invariant(format!("'{}' has no static fields global", owner.name)))?;
        let heap = {
            let CodegenContext { module, types, .. } = ctx;
            types.static_fields_type(&mut module.types, &ValueType::Object(Rc::clone(&owner)))?
        };
        let instrs = vec![
            Instruction::GlobalGet(global),
            Instruction::StructGet {
                struct_type_index: heap,
                field_index: index as u32,
            },
        ];
        let ty = ctx.wasm_type_of(&self.ty)?;
        Ok(Expr::typed(instrs, ty))
    }
}

impl Lower for StaticSetValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let (owner, index) = static_owner(&self.class, &self.member)?;
        let global = ctx
            .module
            .global_index(&static_fields_global(&owner))
            .ok_or_else(|| invariant(format!("'{}' has no static fields global", owner.name)))?;
        let heap = {
            let CodegenContext { module, types, .. } = ctx;
            types.static_fields_type(&mut module.types, &ValueType::Object(Rc::clone(&owner)))?
        };
        let mut instrs = vec![Instruction::GlobalGet(global)];
        instrs.extend(ctx.lower_value(&self.value)?.instrs);
        instrs.push(Instruction::StructSet {
            struct_type_index: heap,
            field_index: index as u32,
        });
        Ok(Expr::void(instrs))
    }
}

/// Resolve the class in the base chain that declares a static member.
fn static_owner(
    class: &Rc<ObjectDescription>,
    member: &str,
) -> LowerResult<(Rc<ObjectDescription>, usize)> {
    let mut cur = Some(Rc::clone(class));
    while let Some(meta) = cur {
        if let Some(index) = meta.static_field_index(member) {
            return Ok((meta, index));
        }
        cur = meta.base.clone();
    }
    Err(invariant(format!(
        "'{}' has no static member '{member}' in its base chain",
        class.name
    )))
}
