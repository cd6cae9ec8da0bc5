use wasm_encoder::{AbstractHeapType, HeapType, Instruction, ValType};

use crate::codegen::error::{invariant, LowerResult};
use crate::codegen::types::{anyref, ref_null, structref};
use crate::codegen::{CodegenContext, Expr, Lower};
use crate::semantics::{ArrayLiteralValue, LiteralValue};

use super::element::build_array;

impl Lower for LiteralValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        match self {
            LiteralValue::Number(value) => Ok(Expr::typed(
                vec![Instruction::F64Const(*value)],
                ValType::F64,
            )),
            LiteralValue::Int(value) => Ok(Expr::typed(
                vec![Instruction::I32Const(*value as i32)],
                ValType::I32,
            )),
            LiteralValue::Boolean(value) => Ok(Expr::typed(
                vec![Instruction::I32Const(*value as i32)],
                ValType::I32,
            )),
            LiteralValue::String { value, raw } => string_literal(ctx, value, *raw),
            // The null literal is a typed null of the struct top type;
            // assignment into narrower ref slots is free by subsumption.
            LiteralValue::Null => Ok(Expr::typed(
                vec![Instruction::RefNull(HeapType::Abstract {
                    shared: false,
                    ty: AbstractHeapType::Struct,
                })],
                structref(),
            )),
            LiteralValue::Undefined => {
                let instrs = vec![
                    ctx.runtime.get_context(),
                    ctx.runtime.call("dyntype_new_undefined")?,
                ];
                Ok(Expr::typed(instrs, anyref()))
            }
        }
    }
}

/// Build the canonical string struct for a literal: hash slot zero, a
/// fresh i8 array from the string's code units. Escape sequences are
/// pre-processed only for raw strings; surrogate pairs have already
/// collapsed to single code points in the source representation.
pub(crate) fn string_literal(ctx: &mut CodegenContext, value: &str, raw: bool) -> LowerResult<Expr> {
    let unescaped;
    let text = if raw {
        unescaped = unescape::unescape(value)
            .ok_or_else(|| invariant(format!("invalid escape sequence in string literal {value:?}")))?;
        unescaped.as_str()
    } else {
        value
    };

    let bytes = text.as_bytes();
    let mut instrs = Vec::with_capacity(bytes.len() + 3);
    instrs.push(Instruction::I32Const(0));
    for byte in bytes {
        instrs.push(Instruction::I32Const(*byte as i32));
    }
    instrs.push(Instruction::ArrayNewFixed {
        array_type_index: ctx.types.chars_heap,
        array_size: bytes.len() as u32,
    });
    instrs.push(Instruction::StructNew(ctx.types.string_heap));
    Ok(Expr::typed(instrs, ref_null(ctx.types.string_heap)))
}

impl Lower for ArrayLiteralValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let elements = self
            .elements
            .iter()
            .map(|element| ctx.lower_value(element))
            .collect::<LowerResult<Vec<_>>>()?;
        build_array(ctx, &self.element_type, elements)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use wasm_encoder::Instruction;

    use crate::codegen::test_support::{encode, lowering_fixture};
    use crate::semantics::Value;

    #[test]
    fn test_number_literal_is_a_single_constant() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let expr = fixture.lower(&Value::number(1.5))?;
        assert_eq!(encode(&expr.instrs), encode(&[Instruction::F64Const(1.5)]));
        Ok(())
    }

    #[test]
    fn test_string_literal_builds_hash_and_chars() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let expr = fixture.lower(&Value::string("hi"))?;
        // hash 0, 'h', 'i', array.new_fixed, struct.new
        assert_eq!(expr.instrs.len(), 5);
        Ok(())
    }

    #[test]
    fn test_raw_string_literal_processes_escapes() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let raw = Value::Literal(crate::semantics::LiteralValue::String {
            value: "a\\n".into(),
            raw: true,
        });
        let expr = fixture.lower(&raw)?;
        // hash 0, 'a', '\n', array.new_fixed, struct.new
        assert_eq!(expr.instrs.len(), 5);
        Ok(())
    }
}
