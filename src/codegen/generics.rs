//! On-demand monomorphization of generic functions.
//!
//! A call site bearing specialization arguments requests an instance. On
//! the first request the declaration's mutable state (name and function
//! type) is snapshotted, substituted in place, the body is compiled as a
//! fresh function under the mangled name, and the original state is
//! restored exactly. Later requests with the same argument tuple resolve
//! to the cached name and reuse the emitted function.

use std::collections::HashMap;
use std::rc::Rc;

use crate::semantics::{FunctionDeclareNode, FunctionType, ValueType};

use super::error::{invariant, LowerResult};
use super::{statements, CodegenContext};

/// Resolve (or emit) the specialization of `decl` for `type_args`.
/// Returns the mangled name and the substituted function type.
pub(crate) fn specialize(
    ctx: &mut CodegenContext,
    decl: &Rc<FunctionDeclareNode>,
    type_args: &[ValueType],
) -> LowerResult<(String, Rc<FunctionType>)> {
    let declared = decl.func_type();
    if declared.type_params.is_empty() {
        return Err(invariant(format!(
            "'{}' is not generic but a specialization was requested",
            decl.name()
        )));
    }

    // Resolve the arguments through any active substitution so nested
    // generic calls specialize on concrete types, then fill omitted
    // parameters from their declared defaults.
    let mut resolved: Vec<ValueType> = type_args.iter().map(|t| ctx.types.resolve(t)).collect();
    for param in declared.type_params.iter().skip(resolved.len()) {
        match &param.default {
            Some(default) => resolved.push(ctx.types.resolve(default)),
            None => {
                return Err(invariant(format!(
                    "specialization of '{}' is missing an argument for '{}'",
                    decl.name(),
                    param.name
                )))
            }
        }
    }
    if resolved.len() != declared.type_params.len() {
        return Err(invariant(format!(
            "'{}' takes {} type parameters but {} arguments were given",
            decl.name(),
            declared.type_params.len(),
            resolved.len()
        )));
    }

    let ids: Vec<u32> = resolved.iter().map(ValueType::type_id).collect();
    let substitution: HashMap<String, ValueType> = declared
        .type_params
        .iter()
        .map(|p| p.name.clone())
        .zip(resolved.iter().cloned())
        .collect();
    let specialized = Rc::new(substitute_function(&declared, &substitution));

    if let Some(name) = decl.specializations.borrow().get(&ids) {
        return Ok((name.clone(), specialized));
    }

    // The mangled name appends `_` plus each argument's numeric id.
    let base_name = decl.name();
    let mangled = ids.iter().fold(base_name.clone(), |name, id| {
        format!("{name}_{id}")
    });
    log::debug!("specializing '{base_name}' as '{mangled}'");

    // Snapshot, mutate in place, re-run the compilation pass, restore.
    // The cache entry goes in up front so a self-recursive body resolves
    // to the instance being emitted instead of specializing forever.
    decl.specializations
        .borrow_mut()
        .insert(ids, mangled.clone());
    let original_name = decl.name.replace(mangled.clone());
    let original_type = decl.func_type.replace(Rc::clone(&specialized));
    ctx.types.push_type_args(substitution);

    let result = (|| -> LowerResult<()> {
        statements::function::declare_only(ctx, decl, false)?;
        statements::function::compile_function(ctx, decl, &mangled, None)
    })();

    ctx.types.pop_type_args();
    decl.name.replace(original_name);
    decl.func_type.replace(original_type);
    result?;

    Ok((mangled, specialized))
}

/// Deep type substitution of the active type parameters.
fn substitute_function(func: &FunctionType, map: &HashMap<String, ValueType>) -> FunctionType {
    FunctionType {
        params: func.params.iter().map(|p| substitute(p, map)).collect(),
        optional_mask: func.optional_mask.clone(),
        rest_index: func.rest_index,
        env_param_count: func.env_param_count,
        return_type: substitute(&func.return_type, map),
        type_params: Vec::new(),
        specialization_args: Vec::new(),
    }
}

fn substitute(ty: &ValueType, map: &HashMap<String, ValueType>) -> ValueType {
    match ty {
        ValueType::TypeParameter(param) => map
            .get(&param.name)
            .cloned()
            .unwrap_or_else(|| ty.clone()),
        ValueType::Array(element) => ValueType::Array(Box::new(substitute(element, map))),
        ValueType::Union(members) => {
            ValueType::Union(members.iter().map(|m| substitute(m, map)).collect())
        }
        ValueType::Function(func) => {
            ValueType::Function(Rc::new(substitute_function(func, map)))
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use crate::codegen::test_support::lowering_fixture;
    use crate::semantics::{ParamDeclare, ReturnValue, TypeParameter, Value, VarReadValue};

    use super::*;

    fn generic_identity() -> Rc<FunctionDeclareNode> {
        let t = Rc::new(TypeParameter {
            name: "T".into(),
            bound: None,
            index: 0,
            default: None,
        });
        let mut func_type = FunctionType::new(
            vec![ValueType::TypeParameter(Rc::clone(&t))],
            ValueType::TypeParameter(Rc::clone(&t)),
        );
        func_type.type_params = vec![t];

        let param_decl = crate::semantics::VarDeclareNode::local(
            "x",
            ValueType::TypeParameter(Rc::new(TypeParameter {
                name: "T".into(),
                bound: None,
                index: 0,
                default: None,
            })),
        );
        let mut decl = FunctionDeclareNode::new("id", func_type);
        decl.params = vec![ParamDeclare::new(
            "x",
            param_decl.value_type.clone(),
        )];
        decl.vars = vec![Rc::clone(&param_decl)];
        decl.body = vec![Value::Return(ReturnValue {
            value: Some(Box::new(Value::VarRead(VarReadValue {
                ty: param_decl.value_type.clone(),
                decl: param_decl,
            }))),
        })];
        Rc::new(decl)
    }

    #[test]
    fn test_distinct_argument_tuples_emit_distinct_names() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let decl = generic_identity();

        let saved = fixture.ctx.func.take();
        let (for_number, number_ty) =
            specialize(&mut fixture.ctx, &decl, &[ValueType::Number])?;
        let (for_string, string_ty) =
            specialize(&mut fixture.ctx, &decl, &[ValueType::String])?;
        fixture.ctx.func = saved;

        assert_ne!(for_number, for_string);
        assert_eq!(for_number, format!("id_{}", ValueType::Number.type_id()));
        // The emitted signatures use the substituted types.
        assert_eq!(number_ty.return_type, ValueType::Number);
        assert_eq!(string_ty.return_type, ValueType::String);
        assert!(fixture.ctx.module.has_function(&for_number));
        assert!(fixture.ctx.module.has_function(&for_string));
        Ok(())
    }

    #[test]
    fn test_declaration_state_is_restored_after_specialization() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let decl = generic_identity();
        let original_name = decl.name();
        let original_type = decl.func_type();

        let saved = fixture.ctx.func.take();
        specialize(&mut fixture.ctx, &decl, &[ValueType::Number])?;
        fixture.ctx.func = saved;

        assert_eq!(decl.name(), original_name);
        assert!(Rc::ptr_eq(&decl.func_type(), &original_type));

        // A repeated request reuses the cached instance.
        let saved = fixture.ctx.func.take();
        let (again, _) = specialize(&mut fixture.ctx, &decl, &[ValueType::Number])?;
        fixture.ctx.func = saved;
        assert_eq!(again, format!("id_{}", ValueType::Number.type_id()));
        Ok(())
    }
}
