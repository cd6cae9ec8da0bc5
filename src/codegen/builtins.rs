//! Lazily emitted bodies for the `built-in|holder|member` call targets.
//!
//! These are module-internal helpers with plain signatures (no synthetic
//! environment prefix): they close over nothing and are never taken as
//! first-class values. Array helpers are emitted once per element suffix;
//! the suffix mangling keeps the instances apart in the flat name space.

use wasm_encoder::{BlockType, Instruction, ValType};

use crate::semantics::ValueType;

use super::error::LowerResult;
use super::types::{ref_exact, ref_null};
use super::CodegenContext;

/// `built-in|String|concat`: allocate a chars array of the combined
/// length and copy both sides into it. The right side arrives packaged in
/// a single-element array.
pub(crate) fn ensure_string_concat(ctx: &mut CodegenContext) -> LowerResult<u32> {
    const NAME: &str = "built-in|String|concat";
    if let Some(index) = ctx.module.function_index(NAME) {
        return Ok(index);
    }
    let string = ref_null(ctx.types.string_heap);
    let string_heap = ctx.types.string_heap;
    let string_array = ctx.types.string_array_heap;
    let chars = ctx.types.chars_heap;

    let type_index = ctx
        .module
        .func_type_index(vec![string, ref_null(string_array)], vec![string]);
    let index = ctx.module.declare_function(NAME, type_index, false)?;

    // params: 0 = this, 1 = rest; locals: 2 = other, 3 = l1, 4 = l2,
    // 5 = combined chars
    let other = 2u32;
    let l1 = 3u32;
    let l2 = 4u32;
    let combined = 5u32;
    let body = vec![
        Instruction::LocalGet(1),
        Instruction::I32Const(0),
        Instruction::ArrayGet(string_array),
        Instruction::LocalSet(other),
        Instruction::LocalGet(0),
        Instruction::StructGet {
            struct_type_index: string_heap,
            field_index: 1,
        },
        Instruction::ArrayLen,
        Instruction::LocalSet(l1),
        Instruction::LocalGet(other),
        Instruction::StructGet {
            struct_type_index: string_heap,
            field_index: 1,
        },
        Instruction::ArrayLen,
        Instruction::LocalSet(l2),
        Instruction::I32Const(0),
        Instruction::LocalGet(l1),
        Instruction::LocalGet(l2),
        Instruction::I32Add,
        Instruction::ArrayNew(chars),
        Instruction::LocalSet(combined),
        Instruction::LocalGet(combined),
        Instruction::I32Const(0),
        Instruction::LocalGet(0),
        Instruction::StructGet {
            struct_type_index: string_heap,
            field_index: 1,
        },
        Instruction::I32Const(0),
        Instruction::LocalGet(l1),
        Instruction::ArrayCopy {
            array_type_index_dst: chars,
            array_type_index_src: chars,
        },
        Instruction::LocalGet(combined),
        Instruction::LocalGet(l1),
        Instruction::LocalGet(other),
        Instruction::StructGet {
            struct_type_index: string_heap,
            field_index: 1,
        },
        Instruction::I32Const(0),
        Instruction::LocalGet(l2),
        Instruction::ArrayCopy {
            array_type_index_dst: chars,
            array_type_index_src: chars,
        },
        Instruction::I32Const(0),
        Instruction::LocalGet(combined),
        Instruction::RefAsNonNull,
        Instruction::StructNew(string_heap),
    ];
    ctx.module.define_function_body(
        NAME,
        vec![string, ValType::I32, ValType::I32, ref_null(chars)],
        body,
    )?;
    Ok(index)
}

/// `built-in|String|eq`: length check, then a bytewise loop.
pub(crate) fn ensure_string_eq(ctx: &mut CodegenContext) -> LowerResult<u32> {
    const NAME: &str = "built-in|String|eq";
    if let Some(index) = ctx.module.function_index(NAME) {
        return Ok(index);
    }
    let string = ref_null(ctx.types.string_heap);
    let string_heap = ctx.types.string_heap;
    let chars = ctx.types.chars_heap;

    let type_index = ctx
        .module
        .func_type_index(vec![string, string], vec![ValType::I32]);
    let index = ctx.module.declare_function(NAME, type_index, false)?;

    // params: 0 = a, 1 = b; locals: 2 = la, 3 = lb, 4 = i
    let la = 2u32;
    let lb = 3u32;
    let i = 4u32;
    let char_of = |local: u32| {
        vec![
            Instruction::LocalGet(local),
            Instruction::StructGet {
                struct_type_index: string_heap,
                field_index: 1,
            },
            Instruction::LocalGet(i),
            Instruction::ArrayGetU(chars),
        ]
    };
    let mut body = vec![
        Instruction::LocalGet(0),
        Instruction::StructGet {
            struct_type_index: string_heap,
            field_index: 1,
        },
        Instruction::ArrayLen,
        Instruction::LocalSet(la),
        Instruction::LocalGet(1),
        Instruction::StructGet {
            struct_type_index: string_heap,
            field_index: 1,
        },
        Instruction::ArrayLen,
        Instruction::LocalSet(lb),
        Instruction::LocalGet(la),
        Instruction::LocalGet(lb),
        Instruction::I32Ne,
        Instruction::If(BlockType::Empty),
        Instruction::I32Const(0),
        Instruction::Return,
        Instruction::End,
        Instruction::Block(BlockType::Empty),
        Instruction::Loop(BlockType::Empty),
        Instruction::LocalGet(i),
        Instruction::LocalGet(la),
        Instruction::I32GeU,
        Instruction::BrIf(1),
    ];
    body.extend(char_of(0));
    body.extend(char_of(1));
    body.extend([
        Instruction::I32Ne,
        Instruction::If(BlockType::Empty),
        Instruction::I32Const(0),
        Instruction::Return,
        Instruction::End,
        Instruction::LocalGet(i),
        Instruction::I32Const(1),
        Instruction::I32Add,
        Instruction::LocalSet(i),
        Instruction::Br(0),
        Instruction::End,
        Instruction::End,
        Instruction::I32Const(1),
    ]);
    ctx.module.define_function_body(
        NAME,
        vec![ValType::I32, ValType::I32, ValType::I32],
        body,
    )?;
    Ok(index)
}

/// `built-in|String|charAt`: a fresh one-character string, or the empty
/// string out of range.
pub(crate) fn ensure_string_char_at(ctx: &mut CodegenContext) -> LowerResult<u32> {
    const NAME: &str = "built-in|String|charAt";
    if let Some(index) = ctx.module.function_index(NAME) {
        return Ok(index);
    }
    let string = ref_null(ctx.types.string_heap);
    let string_heap = ctx.types.string_heap;
    let chars = ctx.types.chars_heap;

    let type_index = ctx
        .module
        .func_type_index(vec![string, ValType::I32], vec![string]);
    let index = ctx.module.declare_function(NAME, type_index, false)?;

    let body = vec![
        Instruction::I32Const(0),
        Instruction::LocalGet(1),
        Instruction::LocalGet(0),
        Instruction::StructGet {
            struct_type_index: string_heap,
            field_index: 1,
        },
        Instruction::ArrayLen,
        Instruction::I32LtU,
        Instruction::If(BlockType::Result(ref_exact(chars))),
        Instruction::LocalGet(0),
        Instruction::StructGet {
            struct_type_index: string_heap,
            field_index: 1,
        },
        Instruction::LocalGet(1),
        Instruction::ArrayGetU(chars),
        Instruction::ArrayNewFixed {
            array_type_index: chars,
            array_size: 1,
        },
        Instruction::Else,
        Instruction::ArrayNewFixed {
            array_type_index: chars,
            array_size: 0,
        },
        Instruction::End,
        Instruction::StructNew(string_heap),
    ];
    ctx.module.define_function_body(NAME, vec![], body)?;
    Ok(index)
}

/// `built-in|Array|push_<suffix>`: append with geometric growth of the
/// backing store, maintaining the explicit length slot. Returns the new
/// length as a Number.
pub(crate) fn ensure_array_push(
    ctx: &mut CodegenContext,
    element: &ValueType,
) -> LowerResult<u32> {
    let suffix = {
        let CodegenContext { module, types, .. } = ctx;
        types.obj_special_suffix(&mut module.types, element)?
    };
    let name = format!("built-in|Array|push_{suffix}");
    if let Some(index) = ctx.module.function_index(&name) {
        return Ok(index);
    }

    let array_ty = ValueType::Array(Box::new(element.clone()));
    let lowered = ctx.lowered(&array_ty)?;
    let wrapper = lowered.heap.expect("array wrapper");
    let inner = lowered.inner_array.expect("array store");
    let element_val = ctx.wasm_type_of(element)?;
    let default = {
        let CodegenContext { module, types, .. } = ctx;
        types.default_value(&mut module.types, element)?
    };

    let type_index = ctx
        .module
        .func_type_index(vec![ref_null(wrapper), element_val], vec![ValType::F64]);
    let index = ctx.module.declare_function(&name, type_index, false)?;

    // params: 0 = array, 1 = value; locals: 2 = len, 3 = cap, 4 = grown
    let len = 2u32;
    let cap = 3u32;
    let grown = 4u32;
    let mut body = vec![
        Instruction::LocalGet(0),
        Instruction::StructGet {
            struct_type_index: wrapper,
            field_index: 1,
        },
        Instruction::LocalSet(len),
        Instruction::LocalGet(0),
        Instruction::StructGet {
            struct_type_index: wrapper,
            field_index: 0,
        },
        Instruction::ArrayLen,
        Instruction::LocalSet(cap),
        Instruction::LocalGet(len),
        Instruction::LocalGet(cap),
        Instruction::I32GeU,
        Instruction::If(BlockType::Empty),
    ];
    body.extend(default);
    body.extend([
        Instruction::LocalGet(cap),
        Instruction::I32Const(1),
        Instruction::I32Shl,
        Instruction::I32Const(8),
        Instruction::I32Add,
        Instruction::ArrayNew(inner),
        Instruction::LocalSet(grown),
        Instruction::LocalGet(grown),
        Instruction::I32Const(0),
        Instruction::LocalGet(0),
        Instruction::StructGet {
            struct_type_index: wrapper,
            field_index: 0,
        },
        Instruction::I32Const(0),
        Instruction::LocalGet(len),
        Instruction::ArrayCopy {
            array_type_index_dst: inner,
            array_type_index_src: inner,
        },
        Instruction::LocalGet(0),
        Instruction::LocalGet(grown),
        Instruction::StructSet {
            struct_type_index: wrapper,
            field_index: 0,
        },
        Instruction::End,
        Instruction::LocalGet(0),
        Instruction::StructGet {
            struct_type_index: wrapper,
            field_index: 0,
        },
        Instruction::LocalGet(len),
        Instruction::LocalGet(1),
        Instruction::ArraySet(inner),
        Instruction::LocalGet(0),
        Instruction::LocalGet(len),
        Instruction::I32Const(1),
        Instruction::I32Add,
        Instruction::StructSet {
            struct_type_index: wrapper,
            field_index: 1,
        },
        Instruction::LocalGet(len),
        Instruction::I32Const(1),
        Instruction::I32Add,
        Instruction::F64ConvertI32U,
    ]);
    ctx.module.define_function_body(
        &name,
        vec![ValType::I32, ValType::I32, ref_null(inner)],
        body,
    )?;
    Ok(index)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use crate::codegen::test_support::lowering_fixture;
    use crate::semantics::ValueType;

    use super::*;

    #[test]
    fn test_builtins_are_emitted_once() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let first = ensure_string_concat(&mut fixture.ctx)?;
        let again = ensure_string_concat(&mut fixture.ctx)?;
        assert_eq!(first, again);
        Ok(())
    }

    #[test]
    fn test_array_push_mangles_by_element_suffix() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let for_numbers = ensure_array_push(&mut fixture.ctx, &ValueType::Number)?;
        let for_strings = ensure_array_push(&mut fixture.ctx, &ValueType::String)?;
        assert_ne!(for_numbers, for_strings);
        assert!(fixture.ctx.module.has_function("built-in|Array|push_f64"));
        assert!(fixture
            .ctx
            .module
            .has_function("built-in|Array|push_anyref"));
        Ok(())
    }
}
