//! # Code Generation Module
//!
//! Lowers the semantics tree into a WebAssembly module using the GC and
//! typed-function-reference proposals.
//!
//! The pipeline is a single synchronous pass per function: the driver
//! first declares every type and function (so forward references and
//! recursion resolve by name), then walks each function body once,
//! dispatching every value node into its lowering. Type lowering feeds the
//! expression lowerings; calls, object operations, closure accesses and
//! `any` conversions each have their own corner of `expressions/`.
//! Generic functions are monomorphized on demand when a call site carries
//! specialization arguments.
//!
//! The compiler is a pure function from tree to bytes: no I/O, no
//! persisted state. The only process-wide cache is the content-addressed
//! cstring pool, reset via [`reset`].

pub mod error;
pub mod expressions;
pub mod statements;

mod builtins;
mod context;
mod generics;
mod module;
mod runtime;
mod strings;
mod types;

use std::collections::HashMap;
use std::rc::Rc;

use wasm_encoder::{ConstExpr, GlobalType, Instruction, ValType};

use crate::semantics::{
    FunctionDeclareNode, ObjectDescription, SemanticsModule, Value, ValueType, VarDeclareNode,
    VarKind,
};

pub use error::{CodegenError, LowerResult};
pub use types::LoweredType;

use context::FunctionContext;
use error::invariant;
use module::ModuleBuilder;
use runtime::RuntimeImports;
use types::TypeLowering;

/// Knobs of one module compilation. No I/O happens here; the caller owns
/// reading sources and writing the produced bytes.
#[derive(Clone, Debug)]
pub struct CompileOptions {
    /// Name recorded in the emitted name section
    pub module_name: String,
    /// Whether to emit the name section at all
    pub emit_names: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            module_name: "module".into(),
            emit_names: true,
        }
    }
}

/// A lowered expression: the instruction sequence and the wasm type of the
/// value it leaves on the stack (`None` for statement-like values).
#[derive(Clone, Debug)]
pub struct Expr {
    pub instrs: Vec<Instruction<'static>>,
    pub ty: Option<ValType>,
}

impl Expr {
    pub fn typed(instrs: Vec<Instruction<'static>>, ty: ValType) -> Self {
        Expr {
            instrs,
            ty: Some(ty),
        }
    }

    pub fn void(instrs: Vec<Instruction<'static>>) -> Self {
        Expr { instrs, ty: None }
    }

    pub fn extend_into(self, out: &mut Vec<Instruction<'static>>) {
        out.extend(self.instrs);
    }
}

/// Core lowering trait, implemented by every value kind. The `lower`
/// operation is total over the closed kind set; anything unhandled
/// surfaces as an `UnimplementedLowering` error, never as a fallback.
pub trait Lower {
    fn lower(&self, ctx: &mut CodegenContext) -> LowerResult<Expr>;
}

/// A function whose body still has to be emitted. Declarations and bodies
/// are two separate passes so mutually recursive functions resolve.
pub(crate) struct PendingFunction {
    pub decl: Rc<FunctionDeclareNode>,
    pub wasm_name: String,
    pub this_type: Option<ValueType>,
}

/// Central state of one module compilation.
pub struct CodegenContext {
    pub(crate) module: ModuleBuilder,
    pub(crate) types: TypeLowering,
    pub(crate) runtime: RuntimeImports,
    /// The function currently being lowered; shared state in the sense of
    /// the resource model: equal at entry and exit of every `lower`
    pub(crate) func: Option<FunctionContext>,
    /// Known class descriptions by type id
    pub(crate) classes: HashMap<u32, Rc<ObjectDescription>>,
    /// Same descriptions in declaration order, for deterministic `_start`
    /// initialization
    pub(crate) class_order: Vec<Rc<ObjectDescription>>,
    /// Emitted wasm name per function declaration; class members mangle
    /// to `<class>|<member>`, so the declaration's own name is not enough
    decl_names: HashMap<usize, String>,
    global_bindings: HashMap<usize, u32>,
    pending: Vec<PendingFunction>,
}

impl CodegenContext {
    fn new(module: &SemanticsModule) -> LowerResult<Self> {
        let mut builder = ModuleBuilder::new();
        let types = TypeLowering::new(&mut builder.types);

        // Names under the built-in type mangling prefix resolve to anyref
        // globals provided by the runtime; they have to be imported before
        // anything is declared.
        for global in &module.globals {
            if global.kind == VarKind::BuiltinGlobal {
                builder.import_global(
                    "libdyntype",
                    &global.name,
                    GlobalType {
                        val_type: types::anyref(),
                        mutable: false,
                        shared: false,
                    },
                )?;
            }
        }

        let runtime = RuntimeImports::install(&mut builder, &types)?;
        Ok(CodegenContext {
            module: builder,
            types,
            runtime,
            func: None,
            classes: HashMap::new(),
            class_order: Vec::new(),
            decl_names: HashMap::new(),
            global_bindings: HashMap::new(),
            pending: Vec::new(),
        })
    }

    pub(crate) fn set_wasm_name(&mut self, decl: &Rc<FunctionDeclareNode>, name: String) {
        self.decl_names.insert(Rc::as_ptr(decl) as usize, name);
    }

    /// The emitted name of a declaration: the mangled member name when it
    /// backs a class member, the declaration's own name otherwise.
    pub(crate) fn wasm_name_of(&self, decl: &Rc<FunctionDeclareNode>) -> String {
        self.decl_names
            .get(&(Rc::as_ptr(decl) as usize))
            .cloned()
            .unwrap_or_else(|| decl.name())
    }

    pub(crate) fn cur(&mut self) -> LowerResult<&mut FunctionContext> {
        self.func
            .as_mut()
            .ok_or_else(|| invariant("lowering outside of a function context"))
    }

    /// Push a scratch local into the current function.
    pub(crate) fn tmp(&mut self, ty: ValType) -> LowerResult<u32> {
        Ok(self.cur()?.insert_tmp_var(ty))
    }

    pub(crate) fn lower_value(&mut self, value: &Value) -> LowerResult<Expr> {
        value.lower(self)
    }

    /// Lower a value in statement position, dropping a produced value.
    pub(crate) fn lower_statement(&mut self, value: &Value) -> LowerResult<Vec<Instruction<'static>>> {
        let expr = self.lower_value(value)?;
        let mut instrs = expr.instrs;
        if expr.ty.is_some() {
            instrs.push(Instruction::Drop);
        }
        Ok(instrs)
    }

    pub(crate) fn wasm_type_of(&mut self, ty: &ValueType) -> LowerResult<ValType> {
        let CodegenContext { module, types, .. } = self;
        types.wasm_type(&mut module.types, ty)
    }

    pub(crate) fn lowered(&mut self, ty: &ValueType) -> LowerResult<LoweredType> {
        let CodegenContext { module, types, .. } = self;
        types.lower(&mut module.types, ty)
    }

    pub(crate) fn queue_function(
        &mut self,
        decl: &Rc<FunctionDeclareNode>,
        wasm_name: String,
        this_type: Option<ValueType>,
    ) {
        self.pending.push(PendingFunction {
            decl: Rc::clone(decl),
            wasm_name,
            this_type,
        });
    }

    pub(crate) fn bind_global(&mut self, decl: &Rc<VarDeclareNode>, index: u32) {
        self.global_bindings
            .insert(Rc::as_ptr(decl) as usize, index);
    }

    pub(crate) fn global_for(&self, decl: &Rc<VarDeclareNode>) -> LowerResult<u32> {
        self.global_bindings
            .get(&(Rc::as_ptr(decl) as usize))
            .copied()
            .ok_or_else(|| invariant(format!("global '{}' has no slot", decl.name)))
    }

    pub(crate) fn drain_pending(&mut self) -> LowerResult<()> {
        while let Some(pending) = self.pending.pop() {
            statements::function::compile_function(
                self,
                &pending.decl,
                &pending.wasm_name,
                pending.this_type.as_ref(),
            )?;
        }
        Ok(())
    }
}

/// Compile one semantics module into the bytes of a WebAssembly module.
pub fn compile_module(
    module: &SemanticsModule,
    options: &CompileOptions,
) -> Result<Vec<u8>, CodegenError> {
    log::debug!("compiling module '{}'", module.name);
    let mut ctx = CodegenContext::new(module)?;

    // Module globals: declared with default values, initialized by
    // `_start` so initializers may run arbitrary code.
    for global in &module.globals {
        if global.kind != VarKind::Global {
            continue;
        }
        let val_type = ctx.wasm_type_of(&global.value_type)?;
        let index = ctx.module.declare_global(
            &global.name,
            GlobalType {
                val_type,
                mutable: true,
                shared: false,
            },
            const_default(val_type),
            false,
        )?;
        ctx.bind_global(global, index);
    }

    for class in &module.classes {
        statements::globals::declare_class(&mut ctx, class)?;
    }

    for function in &module.functions {
        let func_type = function.func_type();
        if func_type.is_generic() {
            // Generic declarations are only emitted through their
            // specializations, at the call sites that request them.
            continue;
        }
        statements::function::declare_function(&mut ctx, function, None, function.exported)?;
    }

    log::debug!(
        "declared {} functions, lowering bodies",
        ctx.module.defined_function_count()
    );
    ctx.drain_pending()?;

    statements::globals::emit_start(&mut ctx, module)?;
    // Top-level statements may have queued more work (object-literal
    // methods, lazily emitted built-ins, specializations).
    ctx.drain_pending()?;

    let data = strings::snapshot();
    ctx.module.finish(options, data)
}

/// Clear the process-wide caches (the cstring pool). Offsets restart from
/// the pool base afterwards, so only call between module compilations.
pub fn reset() {
    strings::reset();
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A compilation context with an open function, for exercising single
    /// lowerings without driving a whole module.
    pub(crate) struct LoweringFixture {
        pub ctx: CodegenContext,
    }

    impl LoweringFixture {
        pub(crate) fn lower(&mut self, value: &Value) -> LowerResult<Expr> {
            self.ctx.lower_value(value)
        }
    }

    pub(crate) fn lowering_fixture() -> LowerResult<LoweringFixture> {
        let module = SemanticsModule::new("test");
        let mut ctx = CodegenContext::new(&module)?;
        ctx.func = Some(FunctionContext::new("test", 1, None));
        Ok(LoweringFixture { ctx })
    }

    /// Encode an instruction sequence for comparison; `Instruction` has no
    /// equality of its own.
    pub(crate) fn encode(instrs: &[Instruction<'_>]) -> Vec<u8> {
        use wasm_encoder::Encode;
        let mut bytes = Vec::new();
        for instr in instrs {
            instr.encode(&mut bytes);
        }
        bytes
    }
}

fn const_default(ty: ValType) -> ConstExpr {
    match ty {
        ValType::F64 => ConstExpr::f64_const(0.0),
        ValType::F32 => ConstExpr::f32_const(0.0),
        ValType::I64 => ConstExpr::i64_const(0),
        ValType::V128 => ConstExpr::v128_const(0),
        ValType::I32 => ConstExpr::i32_const(0),
        ValType::Ref(ref_type) => ConstExpr::ref_null(ref_type.heap_type),
    }
}
