//! Thin module-assembly layer over `wasm-encoder`.
//!
//! All struct, array and function heap types live in a single recursion
//! group, so mutually recursive class layouts can be declared in two
//! phases: a reserved stub slot first, the real definition once fields and
//! signatures have been lowered through the cache. Within the group the
//! subtyping chain still has to be declared base-first, which the
//! recursive base-before-derived emission of the type lowering guarantees.

use std::collections::{BTreeSet, HashMap};

use wasm_encoder::{
    CodeSection, ConstExpr, DataSection, ElementSection, ElementSegment, Elements, EntityType,
    ExportKind, ExportSection, FuncType, Function, FunctionSection, GlobalSection, GlobalType,
    ImportSection, Instruction, MemorySection, MemoryType, Module, NameMap, NameSection, SubType,
    TableType, TypeSection, ValType,
};

use super::error::{invariant, LowerResult};
use super::CompileOptions;

/// Reserve/define registry for the module's one recursion group.
///
/// Interning is content-addressed: two structurally identical definitions
/// inside one rec group would be *distinct* iso-recursive types, so every
/// shared signature must resolve to the same slot.
#[derive(Default)]
pub struct TypeRegistry {
    entries: Vec<Option<SubType>>,
    interned: HashMap<String, u32>,
}

impl TypeRegistry {
    /// Reserve a slot for a type whose definition is still being lowered.
    pub fn reserve(&mut self) -> u32 {
        self.entries.push(None);
        (self.entries.len() - 1) as u32
    }

    /// Fill a previously reserved slot.
    pub fn define(&mut self, index: u32, ty: SubType) {
        let slot = &mut self.entries[index as usize];
        debug_assert!(slot.is_none(), "type slot {index} defined twice");
        *slot = Some(ty);
    }

    /// Add a definition, reusing an existing identical slot.
    pub fn intern(&mut self, ty: SubType) -> u32 {
        let key = format!("{ty:?}");
        if let Some(&index) = self.interned.get(&key) {
            return index;
        }
        self.entries.push(Some(ty));
        let index = (self.entries.len() - 1) as u32;
        self.interned.insert(key, index);
        index
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&SubType> {
        self.entries.get(index as usize).and_then(Option::as_ref)
    }

    fn emit(&self) -> LowerResult<TypeSection> {
        let mut section = TypeSection::new();
        let mut group = Vec::with_capacity(self.entries.len());
        for (index, entry) in self.entries.iter().enumerate() {
            match entry {
                Some(ty) => group.push(ty.clone()),
                None => return Err(invariant(format!("type slot {index} was never defined"))),
            }
        }
        section.ty().rec(group);
        Ok(section)
    }
}

struct DefinedFunction {
    name: String,
    type_index: u32,
    locals: Vec<ValType>,
    body: Option<Vec<Instruction<'static>>>,
    export: bool,
}

struct DefinedGlobal {
    name: String,
    ty: GlobalType,
    init: ConstExpr,
    export: bool,
}

/// Collects the module piecewise and serializes the sections in wasm
/// order. Imports occupy the low function and global indices, so every
/// import has to be registered before the first declaration; the builder
/// enforces this instead of re-sorting the index space afterwards.
pub struct ModuleBuilder {
    pub types: TypeRegistry,
    imported_funcs: Vec<(String, String, u32)>,
    imported_globals: Vec<(String, String, GlobalType)>,
    imported_tables: Vec<(String, String, TableType)>,
    funcs: Vec<DefinedFunction>,
    func_indices: HashMap<String, u32>,
    globals: Vec<DefinedGlobal>,
    global_indices: HashMap<String, u32>,
    declared_refs: BTreeSet<u32>,
    imports_frozen: bool,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        ModuleBuilder {
            types: TypeRegistry::default(),
            imported_funcs: Vec::new(),
            imported_globals: Vec::new(),
            imported_tables: Vec::new(),
            funcs: Vec::new(),
            func_indices: HashMap::new(),
            globals: Vec::new(),
            global_indices: HashMap::new(),
            declared_refs: BTreeSet::new(),
            imports_frozen: false,
        }
    }

    /// Intern a plain function signature.
    pub fn func_type_index(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> u32 {
        self.types.intern(SubType {
            is_final: true,
            supertype_idx: None,
            composite_type: wasm_encoder::CompositeType {
                inner: wasm_encoder::CompositeInnerType::Func(FuncType::new(params, results)),
                shared: false,
            },
        })
    }

    pub fn import_function(&mut self, module: &str, name: &str, type_index: u32) -> LowerResult<u32> {
        if self.imports_frozen {
            return Err(invariant(format!(
                "import '{module}.{name}' registered after the first declared function"
            )));
        }
        let index = self.imported_funcs.len() as u32;
        self.imported_funcs
            .push((module.into(), name.into(), type_index));
        self.func_indices.insert(name.into(), index);
        Ok(index)
    }

    pub fn import_global(&mut self, module: &str, name: &str, ty: GlobalType) -> LowerResult<u32> {
        if self.imports_frozen {
            return Err(invariant(format!(
                "global import '{module}.{name}' registered after the first declared global"
            )));
        }
        let index = self.imported_globals.len() as u32;
        self.imported_globals.push((module.into(), name.into(), ty));
        self.global_indices.insert(name.into(), index);
        Ok(index)
    }

    pub fn import_table(&mut self, module: &str, name: &str, ty: TableType) -> u32 {
        let index = self.imported_tables.len() as u32;
        self.imported_tables.push((module.into(), name.into(), ty));
        index
    }

    /// Assign an index to a function whose body is emitted later. The
    /// two-pass shape (declare everything, then fill bodies) is what makes
    /// forward references and recursion work.
    pub fn declare_function(&mut self, name: &str, type_index: u32, export: bool) -> LowerResult<u32> {
        self.imports_frozen = true;
        if self.func_indices.contains_key(name) {
            return Err(invariant(format!("function '{name}' declared twice")));
        }
        let index = (self.imported_funcs.len() + self.funcs.len()) as u32;
        self.funcs.push(DefinedFunction {
            name: name.into(),
            type_index,
            locals: Vec::new(),
            body: None,
            export,
        });
        self.func_indices.insert(name.into(), index);
        Ok(index)
    }

    pub fn define_function_body(
        &mut self,
        name: &str,
        locals: Vec<ValType>,
        mut body: Vec<Instruction<'static>>,
    ) -> LowerResult<()> {
        let func = self
            .funcs
            .iter_mut()
            .find(|f| f.name == name)
            .ok_or_else(|| invariant(format!("body for undeclared function '{name}'")))?;
        body.push(Instruction::End);
        func.locals = locals;
        func.body = Some(body);
        Ok(())
    }

    pub fn function_index(&self, name: &str) -> Option<u32> {
        self.func_indices.get(name).copied()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.func_indices.contains_key(name)
    }

    pub fn declare_global(
        &mut self,
        name: &str,
        ty: GlobalType,
        init: ConstExpr,
        export: bool,
    ) -> LowerResult<u32> {
        self.imports_frozen = true;
        if self.global_indices.contains_key(name) {
            return Err(invariant(format!("global '{name}' declared twice")));
        }
        let index = (self.imported_globals.len() + self.globals.len()) as u32;
        self.globals.push(DefinedGlobal {
            name: name.into(),
            ty,
            init,
            export,
        });
        self.global_indices.insert(name.into(), index);
        Ok(index)
    }

    pub fn global_index(&self, name: &str) -> Option<u32> {
        self.global_indices.get(name).copied()
    }

    /// Record that `ref.func` of this index appears in some body; the
    /// function must then be listed in a declarative element segment.
    pub fn declare_ref_func(&mut self, index: u32) {
        self.declared_refs.insert(index);
    }

    pub fn defined_function_count(&self) -> usize {
        self.funcs.len()
    }

    /// Serialize the module. `data` is the rendered cstring/itable pool:
    /// its base offset in linear memory and the raw bytes.
    pub fn finish(&self, options: &CompileOptions, data: (u32, Vec<u8>)) -> LowerResult<Vec<u8>> {
        let mut module = Module::new();

        module.section(&self.types.emit()?);

        let mut imports = ImportSection::new();
        for (mod_name, name, type_index) in &self.imported_funcs {
            imports.import(mod_name, name, EntityType::Function(*type_index));
        }
        for (mod_name, name, ty) in &self.imported_tables {
            imports.import(mod_name, name, EntityType::Table(*ty));
        }
        for (mod_name, name, ty) in &self.imported_globals {
            imports.import(mod_name, name, EntityType::Global(*ty));
        }
        module.section(&imports);

        let mut functions = FunctionSection::new();
        for func in &self.funcs {
            functions.function(func.type_index);
        }
        module.section(&functions);

        let (data_base, data_bytes) = data;
        let data_end = data_base as usize + data_bytes.len();
        let pages = (data_end as u64).div_ceil(0x10000).max(1);
        let mut memory = MemorySection::new();
        memory.memory(MemoryType {
            minimum: pages,
            maximum: None,
            memory64: false,
            shared: false,
            page_size_log2: None,
        });
        module.section(&memory);

        let mut globals = GlobalSection::new();
        for global in &self.globals {
            globals.global(global.ty, &global.init);
        }
        module.section(&globals);

        let mut exports = ExportSection::new();
        for func in &self.funcs {
            if func.export {
                let index = self.func_indices[&func.name];
                exports.export(&func.name, ExportKind::Func, index);
            }
        }
        for global in &self.globals {
            if global.export {
                let index = self.global_indices[&global.name];
                exports.export(&global.name, ExportKind::Global, index);
            }
        }
        exports.export("default", ExportKind::Memory, 0);
        module.section(&exports);

        if !self.declared_refs.is_empty() {
            let mut elements = ElementSection::new();
            let indices: Vec<u32> = self.declared_refs.iter().copied().collect();
            elements.segment(ElementSegment {
                mode: wasm_encoder::ElementMode::Declared,
                elements: Elements::Functions(std::borrow::Cow::Owned(indices)),
            });
            module.section(&elements);
        }

        let mut code = CodeSection::new();
        for func in &self.funcs {
            let body = func
                .body
                .as_ref()
                .ok_or_else(|| invariant(format!("function '{}' has no body", func.name)))?;
            let mut encoded = Function::new(compress_locals(&func.locals));
            for instruction in body {
                encoded.instruction(instruction);
            }
            code.function(&encoded);
        }
        module.section(&code);

        if !data_bytes.is_empty() {
            let mut section = DataSection::new();
            section.active(
                0,
                &ConstExpr::i32_const(data_base as i32),
                data_bytes.iter().copied(),
            );
            module.section(&section);
        }

        if options.emit_names {
            let mut names = NameSection::new();
            names.module(&options.module_name);
            let mut function_names = NameMap::new();
            for (index, (_, name, _)) in self.imported_funcs.iter().enumerate() {
                function_names.append(index as u32, name);
            }
            for func in &self.funcs {
                function_names.append(self.func_indices[&func.name], &func.name);
            }
            names.functions(&function_names);
            module.section(&names);
        }

        Ok(module.finish())
    }
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse a flat local list into the `(count, type)` runs the code
/// section encodes.
fn compress_locals(locals: &[ValType]) -> Vec<(u32, ValType)> {
    let mut runs: Vec<(u32, ValType)> = Vec::new();
    for &ty in locals {
        match runs.last_mut() {
            Some((count, last)) if *last == ty => *count += 1,
            _ => runs.push((1, ty)),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_reuses_identical_signatures() {
        let mut registry = TypeRegistry::default();
        let mut builder = ModuleBuilder::new();
        let a = builder.func_type_index(vec![ValType::F64], vec![ValType::F64]);
        let b = builder.func_type_index(vec![ValType::F64], vec![ValType::F64]);
        let c = builder.func_type_index(vec![ValType::I32], vec![ValType::F64]);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let stub = registry.reserve();
        assert!(registry.get(stub).is_none());
    }

    #[test]
    fn test_imports_precede_defined_functions() -> anyhow::Result<()> {
        let mut builder = ModuleBuilder::new();
        let sig = builder.func_type_index(vec![], vec![]);
        let imported = builder.import_function("libdyntype", "dyntype_new_undefined", sig)?;
        let defined = builder.declare_function("main", sig, true)?;
        assert_eq!(imported, 0);
        assert_eq!(defined, 1);
        assert!(builder.import_function("libdyntype", "late", sig).is_err());
        Ok(())
    }

    #[test]
    fn test_compress_locals_groups_runs() {
        let locals = vec![ValType::I32, ValType::I32, ValType::F64, ValType::I32];
        assert_eq!(
            compress_locals(&locals),
            vec![(2, ValType::I32), (1, ValType::F64), (1, ValType::I32)]
        );
    }
}
