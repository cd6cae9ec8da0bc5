//! Class emission and module initialization.
//!
//! Each concrete class contributes: its member functions (constructor,
//! methods, accessor legs, statics) under `|`-mangled names, a vtable
//! global, and — when it declares static fields — a
//! `<class>|static_fields` global. All reference-typed globals start null
//! and are filled by `_start`, which also caches the dynamic-runtime
//! context and runs the top-level statements.

use std::rc::Rc;

use wasm_encoder::{ConstExpr, GlobalType, HeapType, Instruction};

use crate::codegen::context::FunctionContext;
use crate::codegen::error::{invariant, LowerResult};
use crate::codegen::expressions::coerce;
use crate::codegen::types::ref_null;
use crate::codegen::CodegenContext;
use crate::semantics::{
    MemberKind, ObjectDescription, SemanticsModule, ValueType, VarKind,
};

use super::function::declare_named;

pub(crate) fn vtable_global(meta: &ObjectDescription) -> String {
    format!("{}|vtable", meta.name)
}

pub(crate) fn static_fields_global(meta: &ObjectDescription) -> String {
    format!("{}|static_fields", meta.name)
}

/// Declare a class the driver has not seen yet (object-literal metas
/// reach the code generator mid-body).
pub(crate) fn ensure_class(
    ctx: &mut CodegenContext,
    meta: &Rc<ObjectDescription>,
) -> LowerResult<()> {
    if ctx.classes.contains_key(&meta.type_id) {
        return Ok(());
    }
    declare_class(ctx, meta)
}

/// Emit the types, member functions and globals of one description.
pub(crate) fn declare_class(
    ctx: &mut CodegenContext,
    meta: &Rc<ObjectDescription>,
) -> LowerResult<()> {
    if let Some(base) = &meta.base {
        ensure_class(ctx, base)?;
    }
    if ctx.classes.contains_key(&meta.type_id) {
        return Ok(());
    }
    log::debug!("declaring class '{}'", meta.name);
    ctx.classes.insert(meta.type_id, Rc::clone(meta));
    ctx.class_order.push(Rc::clone(meta));

    let class_ty = ValueType::Object(Rc::clone(meta));
    let lowered = ctx.lowered(&class_ty)?;

    if meta.is_interface {
        // Interfaces contribute layouts only; bodies come from the
        // implementing classes.
        return Ok(());
    }

    let this_type = Some(class_ty.clone());
    if let Some(ctor) = &meta.ctor {
        let name = format!("{}|constructor", meta.name);
        declare_named(ctx, ctor, &name, this_type.clone(), false)?;
    }
    for member in &meta.members {
        if !member.is_own {
            continue;
        }
        match member.kind {
            MemberKind::Field => {}
            MemberKind::Method => {
                if let Some(decl) = &member.method {
                    let name = format!("{}|{}", meta.name, member.name);
                    let this = if member.is_static {
                        None
                    } else {
                        this_type.clone()
                    };
                    declare_named(ctx, decl, &name, this, false)?;
                }
            }
            MemberKind::Accessor => {
                if let Some(getter) = &member.getter {
                    let name = format!("{}|get_{}", meta.name, member.name);
                    declare_named(ctx, getter, &name, this_type.clone(), false)?;
                }
                if let Some(setter) = &member.setter {
                    let name = format!("{}|set_{}", meta.name, member.name);
                    declare_named(ctx, setter, &name, this_type.clone(), false)?;
                }
            }
        }
    }

    let vtable = lowered
        .vtable
        .ok_or_else(|| invariant(format!("'{}' has no vtable type", meta.name)))?;
    ctx.module.declare_global(
        &vtable_global(meta),
        GlobalType {
            val_type: ref_null(vtable),
            mutable: true,
            shared: false,
        },
        ConstExpr::ref_null(HeapType::Concrete(vtable)),
        false,
    )?;

    if let Some(static_fields) = lowered.static_fields {
        ctx.module.declare_global(
            &static_fields_global(meta),
            GlobalType {
                val_type: ref_null(static_fields),
                mutable: true,
                shared: false,
            },
            ConstExpr::ref_null(HeapType::Concrete(static_fields)),
            false,
        )?;
    }
    Ok(())
}

/// Function indices backing a class's vtable slots, in slot order.
fn vtable_function_indices(
    ctx: &mut CodegenContext,
    meta: &Rc<ObjectDescription>,
) -> LowerResult<Vec<u32>> {
    let mut indices = Vec::new();
    for member in &meta.members {
        if member.is_static {
            continue;
        }
        let decls = match member.kind {
            MemberKind::Field => vec![],
            MemberKind::Method => member.method.iter().cloned().collect(),
            MemberKind::Accessor => member
                .getter
                .iter()
                .chain(member.setter.iter())
                .cloned()
                .collect(),
        };
        for decl in decls {
            let name = ctx.wasm_name_of(&decl);
            let index = ctx.module.function_index(&name).ok_or_else(|| {
                invariant(format!(
                    "vtable slot of '{}' refers to undeclared '{name}'",
                    meta.name
                ))
            })?;
            ctx.module.declare_ref_func(index);
            indices.push(index);
        }
    }
    Ok(indices)
}

/// Build and register `_start`: cache the runtime context, allocate the
/// vtable and static-field structs, initialize module globals, then run
/// the top-level statements.
pub(crate) fn emit_start(
    ctx: &mut CodegenContext,
    module: &SemanticsModule,
) -> LowerResult<()> {
    let start_type = ctx.module.func_type_index(vec![], vec![]);
    ctx.module.declare_function("_start", start_type, true)?;

    let saved = ctx.func.take();
    ctx.func = Some(FunctionContext::new("_start", 0, None));

    let lowered = (|| -> LowerResult<Vec<Instruction<'static>>> {
        // Top-level statements first: lowering them may pull in more
        // classes and built-ins whose globals must be initialized below.
        let mut body = Vec::new();
        for value in &module.top_level {
            body.extend(ctx.lower_statement(value)?);
        }

        let mut instrs = vec![
            Instruction::GlobalGet(ctx.runtime.context_global),
            Instruction::GlobalSet(ctx.runtime.context_cache),
        ];

        let classes: Vec<Rc<ObjectDescription>> = ctx.class_order.clone();
        for meta in &classes {
            if meta.is_interface {
                continue;
            }
            let lowered = ctx.lowered(&ValueType::Object(Rc::clone(meta)))?;
            let vtable = lowered.vtable.expect("class vtable type");
            let vtable_index = ctx
                .module
                .global_index(&vtable_global(meta))
                .ok_or_else(|| invariant(format!("'{}' has no vtable global", meta.name)))?;
            for index in vtable_function_indices(ctx, meta)? {
                instrs.push(Instruction::RefFunc(index));
            }
            instrs.push(Instruction::StructNew(vtable));
            instrs.push(Instruction::GlobalSet(vtable_index));

            if let Some(static_fields) = lowered.static_fields {
                let global_index = ctx
                    .module
                    .global_index(&static_fields_global(meta))
                    .ok_or_else(|| {
                        invariant(format!("'{}' has no static fields global", meta.name))
                    })?;
                for member in &meta.members {
                    if !member.is_static || member.kind != MemberKind::Field {
                        continue;
                    }
                    match &member.static_init {
                        Some(init) => {
                            let expr = ctx.lower_value(init)?;
                            let expr =
                                coerce(ctx, expr, &init.value_type(), &member.value_type)?;
                            instrs.extend(expr.instrs);
                        }
                        None => {
                            let CodegenContext { module, types, .. } = ctx;
                            instrs.extend(
                                types.default_value(&mut module.types, &member.value_type)?,
                            );
                        }
                    }
                }
                instrs.push(Instruction::StructNew(static_fields));
                instrs.push(Instruction::GlobalSet(global_index));
            }
        }

        for global in &module.globals {
            if global.kind != VarKind::Global {
                continue;
            }
            let Some(init) = &global.init else { continue };
            let index = ctx.global_for(global)?;
            let expr = ctx.lower_value(init)?;
            let expr = coerce(ctx, expr, &init.value_type(), &global.value_type)?;
            instrs.extend(expr.instrs);
            instrs.push(Instruction::GlobalSet(index));
        }

        instrs.extend(body);
        Ok(instrs)
    })();

    let finished = ctx.func.take().expect("start context still open");
    ctx.func = saved;
    let instrs = lowered?;
    ctx.module
        .define_function_body("_start", finished.into_locals(), instrs)
}
