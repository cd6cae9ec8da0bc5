//! The dynamic-type runtime boundary.
//!
//! Everything dynamic — `any` handles, dynamic property access, cross-type
//! comparison, prototype lookups — is delegated to `libdyntype` through
//! the import set registered here. The set and its names are part of the
//! module ABI; the order is fixed so imported function indices are stable
//! before the first user function is declared.

use std::collections::HashMap;

use wasm_encoder::{
    AbstractHeapType, ConstExpr, GlobalType, HeapType, Instruction, RefType, TableType, ValType,
};

use super::error::{invariant, LowerResult};
use super::module::ModuleBuilder;
use super::types::{anyref, funcref, ref_null, TypeLowering};

const MODULE: &str = "libdyntype";
const BUILTIN_MODULE: &str = "builtin";

/// Comparison operator codes passed to `dyntype_cmp`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOperator {
    Lt = 0,
    Le = 1,
    Gt = 2,
    Ge = 3,
    EqEq = 4,
    NotEq = 5,
    EqEqEq = 6,
    NotEqEq = 7,
}

/// Kind tags passed to `dyntype_new_extref` when boxing a static
/// reference into the dynamic world.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtRefTag {
    Object = 0,
    Array = 1,
    Closure = 2,
    Interface = 3,
}

/// Member flags stored in itables and passed to `find_index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItableFlag {
    Field = 0,
    Method = 1,
    Getter = 2,
    Setter = 3,
}

pub struct RuntimeImports {
    funcs: HashMap<&'static str, u32>,
    /// Imported immutable `dyntype_context` global
    pub context_global: u32,
    /// Module-local mutable slot caching the context, filled by `_start`
    pub context_cache: u32,
    pub extref_table: u32,
}

impl RuntimeImports {
    /// Register the full import set. Must run before any function or
    /// global is declared so the imports occupy the low indices.
    pub fn install(builder: &mut ModuleBuilder, types: &TypeLowering) -> LowerResult<Self> {
        let any = anyref();
        let string = ref_null(types.string_heap);
        let any_array = ref_null(types.any_array_heap);

        let extref_table = builder.import_table(
            MODULE,
            "extref_table",
            TableType {
                element_type: RefType {
                    nullable: true,
                    heap_type: HeapType::Abstract {
                        shared: false,
                        ty: AbstractHeapType::Any,
                    },
                },
                table64: false,
                minimum: 0,
                maximum: None,
                shared: false,
            },
        );

        let context_global = builder.import_global(
            MODULE,
            "dyntype_context",
            GlobalType {
                val_type: any,
                mutable: false,
                shared: false,
            },
        )?;

        let imports: Vec<(&str, &'static str, Vec<ValType>, Vec<ValType>)> = vec![
            (MODULE, "dyntype_new_number", vec![any, ValType::F64], vec![any]),
            (MODULE, "dyntype_new_boolean", vec![any, ValType::I32], vec![any]),
            (MODULE, "dyntype_new_string", vec![any, string], vec![any]),
            (MODULE, "dyntype_new_null", vec![any], vec![any]),
            (MODULE, "dyntype_new_undefined", vec![any], vec![any]),
            (MODULE, "dyntype_new_array", vec![any], vec![any]),
            (MODULE, "dyntype_new_object", vec![any], vec![any]),
            (MODULE, "dyntype_to_number", vec![any, any], vec![ValType::F64]),
            (MODULE, "dyntype_to_bool", vec![any, any], vec![ValType::I32]),
            (MODULE, "dyntype_to_string", vec![any, any], vec![string]),
            (MODULE, "dyntype_to_extref", vec![any, any], vec![ValType::I32]),
            (MODULE, "dyntype_is_number", vec![any, any], vec![ValType::I32]),
            (MODULE, "dyntype_is_bool", vec![any, any], vec![ValType::I32]),
            (MODULE, "dyntype_is_string", vec![any, any], vec![ValType::I32]),
            (MODULE, "dyntype_is_undefined", vec![any, any], vec![ValType::I32]),
            (MODULE, "dyntype_is_null", vec![any, any], vec![ValType::I32]),
            (MODULE, "dyntype_is_extref", vec![any, any], vec![ValType::I32]),
            (
                MODULE,
                "dyntype_set_property",
                vec![any, any, ValType::I32, any],
                vec![ValType::I32],
            ),
            (
                MODULE,
                "dyntype_get_property",
                vec![any, any, ValType::I32],
                vec![any],
            ),
            (
                MODULE,
                "dyntype_has_property",
                vec![any, any, ValType::I32],
                vec![ValType::I32],
            ),
            (
                MODULE,
                "dyntype_delete_property",
                vec![any, any, ValType::I32],
                vec![ValType::I32],
            ),
            (MODULE, "dyntype_typeof", vec![any, any], vec![any]),
            (MODULE, "dyntype_typeof1", vec![any, any], vec![ValType::I32]),
            (
                MODULE,
                "dyntype_cmp",
                vec![any, any, any, ValType::I32],
                vec![ValType::I32],
            ),
            (MODULE, "dyntype_type_eq", vec![any, any, any], vec![ValType::I32]),
            (MODULE, "dyntype_toString", vec![any, any], vec![any]),
            (MODULE, "dyntype_instanceof", vec![any, any, any], vec![ValType::I32]),
            (
                MODULE,
                "dyntype_invoke_func",
                vec![any, ValType::I32, any, any_array],
                vec![any],
            ),
            (
                MODULE,
                "dyntype_new_object_with_class",
                vec![any, ValType::I32, any_array],
                vec![any],
            ),
            (MODULE, "dyntype_new_extref", vec![any, any, ValType::I32], vec![any]),
            (
                MODULE,
                "dyntype_set_elem",
                vec![any, any, ValType::I32, any],
                vec![],
            ),
            (
                MODULE,
                "dyntype_get_elem",
                vec![any, any, ValType::I32],
                vec![any],
            ),
            (
                MODULE,
                "find_index",
                vec![ValType::I32, ValType::I32, ValType::I32],
                vec![ValType::I32],
            ),
            (MODULE, "struct_get_dyn_i32", vec![any, ValType::I32], vec![ValType::I32]),
            (MODULE, "struct_get_dyn_i64", vec![any, ValType::I32], vec![ValType::I64]),
            (MODULE, "struct_get_dyn_f32", vec![any, ValType::I32], vec![ValType::F32]),
            (MODULE, "struct_get_dyn_f64", vec![any, ValType::I32], vec![ValType::F64]),
            (MODULE, "struct_get_dyn_funcref", vec![any, ValType::I32], vec![funcref()]),
            (MODULE, "struct_get_dyn_anyref", vec![any, ValType::I32], vec![any]),
            (
                MODULE,
                "struct_set_dyn_i32",
                vec![any, ValType::I32, ValType::I32],
                vec![],
            ),
            (
                MODULE,
                "struct_set_dyn_i64",
                vec![any, ValType::I32, ValType::I64],
                vec![],
            ),
            (
                MODULE,
                "struct_set_dyn_f32",
                vec![any, ValType::I32, ValType::F32],
                vec![],
            ),
            (
                MODULE,
                "struct_set_dyn_f64",
                vec![any, ValType::I32, ValType::F64],
                vec![],
            ),
            (
                MODULE,
                "struct_set_dyn_funcref",
                vec![any, ValType::I32, funcref()],
                vec![],
            ),
            (
                MODULE,
                "struct_set_dyn_anyref",
                vec![any, ValType::I32, any],
                vec![],
            ),
            (BUILTIN_MODULE, "console_log", vec![any_array], vec![]),
        ];

        let mut funcs = HashMap::new();
        for (module, name, params, results) in imports {
            let type_index = builder.func_type_index(params, results);
            let index = builder.import_function(module, name, type_index)?;
            funcs.insert(name, index);
        }

        let context_cache = builder.declare_global(
            "dyntype|ctx",
            GlobalType {
                val_type: any,
                mutable: true,
                shared: false,
            },
            ConstExpr::ref_null(HeapType::Abstract {
                shared: false,
                ty: AbstractHeapType::Any,
            }),
            false,
        )?;

        Ok(RuntimeImports {
            funcs,
            context_global,
            context_cache,
            extref_table,
        })
    }

    pub fn func(&self, name: &str) -> LowerResult<u32> {
        self.funcs
            .get(name)
            .copied()
            .ok_or_else(|| invariant(format!("unknown runtime import '{name}'")))
    }

    /// `call` instruction for a runtime import.
    pub fn call(&self, name: &str) -> LowerResult<Instruction<'static>> {
        Ok(Instruction::Call(self.func(name)?))
    }

    /// Read of the cached dynamic-runtime context.
    pub fn get_context(&self) -> Instruction<'static> {
        Instruction::GlobalGet(self.context_cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::module::ModuleBuilder;
    use crate::codegen::types::TypeLowering;

    #[test]
    fn test_imports_use_fixed_name_set() -> anyhow::Result<()> {
        let mut builder = ModuleBuilder::new();
        let types = TypeLowering::new(&mut builder.types);
        let runtime = RuntimeImports::install(&mut builder, &types)?;

        for name in [
            "dyntype_new_number",
            "dyntype_to_extref",
            "dyntype_invoke_func",
            "find_index",
            "struct_get_dyn_funcref",
            "struct_set_dyn_anyref",
        ] {
            assert!(runtime.func(name).is_ok(), "missing import {name}");
        }
        assert!(runtime.func("dyntype_bogus").is_err());

        // Imported indices precede every declared function.
        let sig = builder.func_type_index(vec![], vec![]);
        let declared = builder.declare_function("user", sig, false)?;
        assert!(declared > runtime.func("struct_set_dyn_anyref")?);
        Ok(())
    }
}
