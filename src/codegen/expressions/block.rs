use wasm_encoder::{BlockType, Instruction};

use crate::codegen::error::{invariant, LowerResult};
use crate::codegen::{CodegenContext, Expr, Lower};
use crate::semantics::{BlockKind, BlockValue, BranchIfValue, BranchValue, ReturnValue};

use super::truthy;

impl Lower for BlockValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let result = match &self.result {
            Some(ty) => ctx.lowered(ty)?.val_type,
            None => None,
        };
        let block_type = match result {
            Some(ty) => BlockType::Result(ty),
            None => BlockType::Empty,
        };

        // Unlabeled blocks still occupy a label-stack slot so branch
        // depths stay aligned with the emitted nesting.
        let label = self.label.clone().unwrap_or_else(|| "@anon".into());
        ctx.cur()?.push_label(label);

        let mut instrs = vec![match self.kind {
            BlockKind::Plain => Instruction::Block(block_type),
            BlockKind::Loop => Instruction::Loop(block_type),
        }];
        let lowered = (|| -> LowerResult<Vec<Instruction<'static>>> {
            let mut body = Vec::new();
            for (index, value) in self.body.iter().enumerate() {
                let last = index + 1 == self.body.len();
                if last && result.is_some() {
                    // A result-carrying block yields its trailing value.
                    let expr = ctx.lower_value(value)?;
                    if expr.ty.is_none() {
                        return Err(invariant(
                            "block declares a result but its trailing value is void",
                        ));
                    }
                    body.extend(expr.instrs);
                } else {
                    body.extend(ctx.lower_statement(value)?);
                }
            }
            Ok(body)
        })();
        ctx.cur()?.pop_label();
        instrs.extend(lowered?);
        instrs.push(Instruction::End);

        Ok(Expr { instrs, ty: result })
    }
}

impl Lower for BranchValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let depth = ctx.cur()?.branch_depth(&self.label)?;
        Ok(Expr::void(vec![Instruction::Br(depth)]))
    }
}

impl Lower for BranchIfValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let cond = truthy(ctx, &self.cond)?;
        let depth = ctx.cur()?.branch_depth(&self.label)?;
        let mut instrs = cond.instrs;
        instrs.push(Instruction::BrIf(depth));
        Ok(Expr::void(instrs))
    }
}

impl Lower for ReturnValue {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr> {
        let mut instrs = Vec::new();
        if let Some(value) = &self.value {
            instrs.extend(ctx.lower_value(value)?.instrs);
        }
        instrs.push(Instruction::Return);
        Ok(Expr::void(instrs))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use wasm_encoder::Instruction;

    use crate::codegen::test_support::lowering_fixture;
    use crate::semantics::{
        BlockKind, BlockValue, BranchIfValue, BranchValue, Value, ValueType,
    };

    #[test]
    fn test_loop_branches_resolve_by_depth() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let tree = Value::Block(BlockValue {
            label: Some("out".into()),
            kind: BlockKind::Plain,
            result: None,
            body: vec![Value::Block(BlockValue {
                label: Some("again".into()),
                kind: BlockKind::Loop,
                result: None,
                body: vec![
                    Value::BranchIf(BranchIfValue {
                        cond: Box::new(Value::boolean(true)),
                        label: "out".into(),
                    }),
                    Value::Branch(BranchValue {
                        label: "again".into(),
                    }),
                ],
            })],
        });
        let expr = fixture.lower(&tree)?;
        // br_if to the outer block crosses the loop: depth 1; the back
        // edge to the loop header is depth 0.
        assert!(expr.instrs.iter().any(|i| matches!(i, Instruction::BrIf(1))));
        assert!(expr.instrs.iter().any(|i| matches!(i, Instruction::Br(0))));
        Ok(())
    }

    #[test]
    fn test_block_with_result_yields_trailing_value() -> Result<()> {
        let mut fixture = lowering_fixture()?;
        let tree = Value::Block(BlockValue {
            label: None,
            kind: BlockKind::Plain,
            result: Some(ValueType::Number),
            body: vec![Value::number(8.0)],
        });
        let expr = fixture.lower(&tree)?;
        assert_eq!(expr.ty, Some(wasm_encoder::ValType::F64));
        assert!(!expr
            .instrs
            .iter()
            .any(|i| matches!(i, Instruction::Drop)));
        Ok(())
    }
}
