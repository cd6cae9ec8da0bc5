//! Type lowering: maps every resolved semantic type onto a WebAssembly
//! type and caches the result for the lifetime of the compilation.
//!
//! Object layouts follow the contract of the object model: slot 0 of every
//! instance is the vtable reference, slots `1..n` are the non-static
//! fields in source order. The vtable is a struct of non-null function
//! references, one slot per method or accessor leg. Both the vtable and
//! the instance struct of a derived class are declared as wasm subtypes of
//! their base counterparts, which is what makes upcasts free and the
//! narrowed vtable slot sound (immutable struct fields are covariant).
//!
//! Repeated lookups are idempotent; lowering a type whose base is not yet
//! materialized triggers recursive emission of the base first.

use std::collections::HashMap;
use std::rc::Rc;

use wasm_encoder::{
    AbstractHeapType, ArrayType, CompositeInnerType, CompositeType, FieldType, HeapType,
    Instruction, RefType, StorageType, StructType, SubType, ValType,
};

use crate::semantics::{
    ClosureContextType, FunctionType, MemberKind, ObjectDescription, ValueType,
};

use super::error::{invariant, unimplemented, LowerResult};
use super::module::TypeRegistry;

pub(crate) fn abstract_ref(ty: AbstractHeapType, nullable: bool) -> ValType {
    ValType::Ref(RefType {
        nullable,
        heap_type: HeapType::Abstract { shared: false, ty },
    })
}

/// `(ref null struct)` — the empty-struct top type of the object world.
/// Root closure contexts and erased interface payloads live here.
pub(crate) fn structref() -> ValType {
    abstract_ref(AbstractHeapType::Struct, true)
}

pub(crate) fn anyref() -> ValType {
    abstract_ref(AbstractHeapType::Any, true)
}

pub(crate) fn funcref() -> ValType {
    abstract_ref(AbstractHeapType::Func, true)
}

pub(crate) fn ref_null(index: u32) -> ValType {
    ValType::Ref(RefType {
        nullable: true,
        heap_type: HeapType::Concrete(index),
    })
}

pub(crate) fn ref_exact(index: u32) -> ValType {
    ValType::Ref(RefType {
        nullable: false,
        heap_type: HeapType::Concrete(index),
    })
}

fn field(ty: ValType, mutable: bool) -> FieldType {
    FieldType {
        element_type: StorageType::Val(ty),
        mutable,
    }
}

fn struct_subtype(fields: Vec<FieldType>, supertype: Option<u32>, is_final: bool) -> SubType {
    SubType {
        is_final,
        supertype_idx: supertype,
        composite_type: CompositeType {
            inner: CompositeInnerType::Struct(StructType {
                fields: fields.into_boxed_slice(),
            }),
            shared: false,
        },
    }
}

fn array_subtype(element: StorageType) -> SubType {
    SubType {
        is_final: true,
        supertype_idx: None,
        composite_type: CompositeType {
            inner: CompositeInnerType::Array(ArrayType(FieldType {
                element_type: element,
                mutable: true,
            })),
            shared: false,
        },
    }
}

/// The cached wasm view of one semantic type.
#[derive(Clone, Debug, Default)]
pub struct LoweredType {
    /// Value representation; `None` for `Void`
    pub val_type: Option<ValType>,
    /// Concrete heap type of the value representation, when it has one
    pub heap: Option<u32>,
    /// Inner element array of an array type, without the length wrapper
    pub inner_array: Option<u32>,
    pub vtable: Option<u32>,
    pub static_fields: Option<u32>,
    /// Signature heap type of a function type
    pub signature: Option<u32>,
    /// Concrete receiver heap type of an object type
    pub this_heap: Option<u32>,
    /// Concrete layout an interface description induces, used by the
    /// interface fast path
    pub shape: Option<u32>,
}

pub struct TypeLowering {
    cache: HashMap<ValueType, LoweredType>,
    /// `array<i8>` backing store of strings
    pub chars_heap: u32,
    /// Canonical string struct `{mut hash: i32, chars: ref array<i8>}`
    pub string_heap: u32,
    /// `array<ref null string>`, the packaging for string built-ins
    pub string_array_heap: u32,
    /// Canonical interface box `{itable: i32, declared: i32, impl: i32,
    /// data: ref null struct}`
    pub interface_heap: u32,
    /// `array<anyref>`, the packaging for dynamic calls
    pub any_array_heap: u32,
    /// Active generic substitutions, innermost last
    type_args: Vec<HashMap<String, ValueType>>,
}

impl TypeLowering {
    pub fn new(registry: &mut TypeRegistry) -> Self {
        let chars_heap = registry.intern(array_subtype(StorageType::I8));
        let string_heap = registry.intern(struct_subtype(
            vec![
                field(ValType::I32, true),
                field(ref_exact(chars_heap), false),
            ],
            None,
            true,
        ));
        let string_array_heap =
            registry.intern(array_subtype(StorageType::Val(ref_null(string_heap))));
        let interface_heap = registry.intern(struct_subtype(
            vec![
                field(ValType::I32, false),
                field(ValType::I32, false),
                field(ValType::I32, false),
                field(structref(), false),
            ],
            None,
            true,
        ));
        let any_array_heap = registry.intern(array_subtype(StorageType::Val(anyref())));
        TypeLowering {
            cache: HashMap::new(),
            chars_heap,
            string_heap,
            string_array_heap,
            interface_heap,
            any_array_heap,
            type_args: Vec::new(),
        }
    }

    pub fn push_type_args(&mut self, args: HashMap<String, ValueType>) {
        self.type_args.push(args);
    }

    pub fn pop_type_args(&mut self) {
        self.type_args.pop();
    }

    /// Resolve unions and type parameters to concrete members where
    /// possible. Unions collapse to their single non-null member or fall
    /// back to `Any`; type parameters resolve through the innermost active
    /// substitution.
    pub fn resolve(&self, ty: &ValueType) -> ValueType {
        match ty {
            ValueType::TypeParameter(param) => {
                for frame in self.type_args.iter().rev() {
                    if let Some(concrete) = frame.get(&param.name) {
                        return concrete.clone();
                    }
                }
                ty.clone()
            }
            ValueType::Union(members) => {
                let concrete: Vec<ValueType> = members
                    .iter()
                    .map(|m| self.resolve(m))
                    .filter(|m| !matches!(m, ValueType::Null | ValueType::Undefined))
                    .collect();
                match concrete.as_slice() {
                    [] => ValueType::Any,
                    [single] => single.clone(),
                    [first, rest @ ..] if rest.iter().all(|m| m == first) => first.clone(),
                    _ => ValueType::Any,
                }
            }
            // Composites must resolve deeply while a substitution is
            // active, or `Array(T)` would be cached under its generic
            // spelling and leak across specializations.
            ValueType::Array(element) if !self.type_args.is_empty() => {
                ValueType::Array(Box::new(self.resolve(element)))
            }
            ValueType::Function(func) if !self.type_args.is_empty() => {
                let mut resolved = FunctionType::clone(func);
                resolved.params = resolved.params.iter().map(|p| self.resolve(p)).collect();
                resolved.return_type = self.resolve(&resolved.return_type);
                ValueType::Function(Rc::new(resolved))
            }
            other => other.clone(),
        }
    }

    /// Full cached lowering of one type.
    pub fn lower(&mut self, registry: &mut TypeRegistry, ty: &ValueType) -> LowerResult<LoweredType> {
        let ty = self.resolve(ty);
        if let Some(cached) = self.cache.get(&ty) {
            return Ok(cached.clone());
        }
        let lowered = match &ty {
            ValueType::Number => LoweredType {
                val_type: Some(ValType::F64),
                ..Default::default()
            },
            ValueType::Int | ValueType::Boolean => LoweredType {
                val_type: Some(ValType::I32),
                ..Default::default()
            },
            ValueType::String => LoweredType {
                val_type: Some(ref_null(self.string_heap)),
                heap: Some(self.string_heap),
                inner_array: Some(self.chars_heap),
                ..Default::default()
            },
            ValueType::Null => LoweredType {
                val_type: Some(structref()),
                ..Default::default()
            },
            ValueType::Undefined | ValueType::Any => LoweredType {
                val_type: Some(anyref()),
                ..Default::default()
            },
            ValueType::Void => LoweredType::default(),
            ValueType::Array(element) => {
                let element_val = self.wasm_type(registry, element)?;
                let inner = registry.intern(array_subtype(StorageType::Val(element_val)));
                let wrapper = registry.intern(struct_subtype(
                    vec![field(ref_null(inner), true), field(ValType::I32, true)],
                    None,
                    true,
                ));
                LoweredType {
                    val_type: Some(ref_null(wrapper)),
                    heap: Some(wrapper),
                    inner_array: Some(inner),
                    ..Default::default()
                }
            }
            ValueType::Function(func) => {
                let signature = self.signature_index(registry, func)?;
                let closure = self.closure_heap_for_signature(registry, signature);
                LoweredType {
                    val_type: Some(ref_null(closure)),
                    heap: Some(closure),
                    signature: Some(signature),
                    ..Default::default()
                }
            }
            ValueType::Object(meta) => return self.lower_object(registry, meta),
            ValueType::ClosureContext(ctx) => {
                let heap = self.context_heap(registry, ctx)?;
                LoweredType {
                    val_type: Some(ref_null(heap)),
                    heap: Some(heap),
                    ..Default::default()
                }
            }
            ValueType::Union(_) => unreachable!("unions are resolved before lowering"),
            ValueType::TypeParameter(param) => {
                return Err(invariant(format!(
                    "type parameter '{}' reached lowering unsubstituted",
                    param.name
                )))
            }
        };
        self.cache.insert(ty, lowered.clone());
        Ok(lowered)
    }

    /// The wasm value type of a semantic type. `Void` has none.
    pub fn wasm_type(&mut self, registry: &mut TypeRegistry, ty: &ValueType) -> LowerResult<ValType> {
        self.lower(registry, ty)?
            .val_type
            .ok_or_else(|| invariant("Void has no wasm value type"))
    }

    pub fn wasm_heap_type(&mut self, registry: &mut TypeRegistry, ty: &ValueType) -> LowerResult<u32> {
        self.lower(registry, ty)?
            .heap
            .ok_or_else(|| invariant(format!("{ty:?} has no heap type")))
    }

    pub fn has_heap_type(&mut self, registry: &mut TypeRegistry, ty: &ValueType) -> bool {
        self.lower(registry, ty)
            .map(|l| l.heap.is_some())
            .unwrap_or(false)
    }

    pub fn vtable_heap_type(&mut self, registry: &mut TypeRegistry, ty: &ValueType) -> LowerResult<u32> {
        self.lower(registry, ty)?
            .vtable
            .ok_or_else(|| invariant(format!("{ty:?} has no vtable type")))
    }

    pub fn static_fields_type(
        &mut self,
        registry: &mut TypeRegistry,
        ty: &ValueType,
    ) -> LowerResult<u32> {
        self.lower(registry, ty)?
            .static_fields
            .ok_or_else(|| invariant(format!("{ty:?} has no static fields type")))
    }

    /// Concrete receiver type of an object type: `(ref null $C)`.
    pub fn this_type(&mut self, registry: &mut TypeRegistry, ty: &ValueType) -> LowerResult<ValType> {
        let heap = self
            .lower(registry, ty)?
            .this_heap
            .ok_or_else(|| invariant(format!("{ty:?} has no receiver type")))?;
        Ok(ref_null(heap))
    }

    /// Inner element array of an array type, without the length wrapper.
    pub fn array_ori_heap_type(
        &mut self,
        registry: &mut TypeRegistry,
        ty: &ValueType,
    ) -> LowerResult<u32> {
        self.lower(registry, ty)?
            .inner_array
            .ok_or_else(|| invariant(format!("{ty:?} has no element array type")))
    }

    /// Name-mangling suffix for generic built-in array method instances,
    /// selected by the element's wasm representation.
    pub fn obj_special_suffix(
        &mut self,
        registry: &mut TypeRegistry,
        element: &ValueType,
    ) -> LowerResult<&'static str> {
        Ok(match self.wasm_type(registry, element)? {
            ValType::F64 => "f64",
            ValType::F32 => "f32",
            ValType::I64 => "i64",
            ValType::I32 => "i32",
            ValType::Ref(_) => "anyref",
            other => return Err(unimplemented(format!("array element type {other:?}"))),
        })
    }

    /// Signature heap type of a function type: the synthetic environment
    /// prefix (`@context`, and `@this` for methods) is erased to
    /// `(ref null struct)` so overriding methods keep identical wasm
    /// signatures; bodies re-cast the prefix once at entry.
    pub fn signature_index(
        &mut self,
        registry: &mut TypeRegistry,
        func: &FunctionType,
    ) -> LowerResult<u32> {
        let mut params = Vec::with_capacity(func.env_param_count + func.params.len());
        for _ in 0..func.env_param_count {
            params.push(structref());
        }
        for param in &func.params {
            params.push(self.wasm_type(registry, param)?);
        }
        let results = match self.lower(registry, &func.return_type)?.val_type {
            Some(ty) => vec![ty],
            None => vec![],
        };
        Ok(registry.intern(SubType {
            is_final: true,
            supertype_idx: None,
            composite_type: CompositeType {
                inner: CompositeInnerType::Func(wasm_encoder::FuncType::new(params, results)),
                shared: false,
            },
        }))
    }

    fn closure_heap_for_signature(&mut self, registry: &mut TypeRegistry, signature: u32) -> u32 {
        registry.intern(struct_subtype(
            vec![field(structref(), false), field(ref_exact(signature), false)],
            None,
            true,
        ))
    }

    /// Closure struct heap type of a function type: `{context, funcref}`.
    pub fn closure_heap(
        &mut self,
        registry: &mut TypeRegistry,
        func: &FunctionType,
    ) -> LowerResult<u32> {
        let signature = self.signature_index(registry, func)?;
        Ok(self.closure_heap_for_signature(registry, signature))
    }

    /// Heap type of a closure context record: slot 0 links to the parent
    /// record, slots `1..` hold the captured variables in declaration
    /// order.
    pub fn context_heap(
        &mut self,
        registry: &mut TypeRegistry,
        ctx: &Rc<ClosureContextType>,
    ) -> LowerResult<u32> {
        let key = ValueType::ClosureContext(Rc::clone(ctx));
        if let Some(cached) = self.cache.get(&key) {
            return cached.heap.ok_or_else(|| invariant("context cache stub"));
        }
        let parent_ty = match ctx.parent.as_ref().and_then(|p| p.effective()) {
            Some(parent) => {
                let parent_heap = self.context_heap(registry, &parent)?;
                ref_null(parent_heap)
            }
            None => structref(),
        };
        let mut fields = vec![field(parent_ty, false)];
        for var in &ctx.vars {
            fields.push(field(self.wasm_type(registry, &var.value_type)?, true));
        }
        let index = registry.reserve();
        registry.define(index, struct_subtype(fields, None, true));
        self.cache.insert(
            key,
            LoweredType {
                val_type: Some(ref_null(index)),
                heap: Some(index),
                ..Default::default()
            },
        );
        Ok(index)
    }

    fn lower_object(
        &mut self,
        registry: &mut TypeRegistry,
        meta: &Rc<ObjectDescription>,
    ) -> LowerResult<LoweredType> {
        let key = ValueType::Object(Rc::clone(meta));
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        // The base has to be materialized first so the subtype links can
        // point at it, and so its slots precede ours in the rec group.
        let base = match &meta.base {
            Some(base) => Some(self.lower_object(registry, base)?),
            None => None,
        };

        log::trace!("lowering object type '{}'", meta.name);

        if meta.is_interface {
            // The value representation of every interface is the canonical
            // four-slot box; the member layout only backs fast-path casts.
            let instance = registry.reserve();
            let stub = LoweredType {
                val_type: Some(ref_null(self.interface_heap)),
                heap: Some(self.interface_heap),
                shape: Some(instance),
                ..Default::default()
            };
            self.cache.insert(key.clone(), stub);
            let vtable = self.define_layout(registry, meta, instance, None, None)?;
            let mut lowered = self.cache.get(&key).cloned().unwrap_or_default();
            lowered.vtable = Some(vtable);
            self.cache.insert(key, lowered.clone());
            return Ok(lowered);
        }

        let instance = registry.reserve();
        let stub = LoweredType {
            val_type: Some(ref_null(instance)),
            heap: Some(instance),
            this_heap: Some(instance),
            ..Default::default()
        };
        self.cache.insert(key.clone(), stub);

        let vtable = self.define_layout(
            registry,
            meta,
            instance,
            base.as_ref().and_then(|b| b.vtable),
            base.as_ref().and_then(|b| b.heap),
        )?;

        let static_fields = if meta.has_static_fields() {
            let mut fields = Vec::new();
            for member in &meta.members {
                if member.is_static && member.kind == MemberKind::Field {
                    fields.push(field(self.wasm_type(registry, &member.value_type)?, true));
                }
            }
            let index = registry.reserve();
            registry.define(index, struct_subtype(fields, None, true));
            Some(index)
        } else {
            None
        };

        let lowered = LoweredType {
            val_type: Some(ref_null(instance)),
            heap: Some(instance),
            vtable: Some(vtable),
            static_fields,
            this_heap: Some(instance),
            ..Default::default()
        };
        self.cache.insert(key, lowered.clone());
        Ok(lowered)
    }

    /// Define the vtable struct and the instance struct for a description.
    /// Returns the vtable's index; the instance goes into the caller's
    /// reserved slot.
    fn define_layout(
        &mut self,
        registry: &mut TypeRegistry,
        meta: &Rc<ObjectDescription>,
        instance: u32,
        base_vtable: Option<u32>,
        base_instance: Option<u32>,
    ) -> LowerResult<u32> {
        let mut vtable_fields = Vec::new();
        for member in &meta.members {
            if member.is_static {
                continue;
            }
            match member.kind {
                MemberKind::Field => {}
                MemberKind::Method => {
                    let func = match self.resolve(&member.value_type) {
                        ValueType::Function(func) => func,
                        other => {
                            return Err(invariant(format!(
                                "method '{}.{}' has non-function type {other:?}",
                                meta.name, member.name
                            )))
                        }
                    };
                    let signature = self.signature_index(registry, &func)?;
                    vtable_fields.push(field(ref_exact(signature), false));
                }
                MemberKind::Accessor => {
                    if member.has_getter {
                        let getter =
                            FunctionType::method(vec![], member.value_type.clone());
                        let signature = self.signature_index(registry, &getter)?;
                        vtable_fields.push(field(ref_exact(signature), false));
                    }
                    if member.has_setter {
                        let setter = FunctionType::method(
                            vec![member.value_type.clone()],
                            ValueType::Void,
                        );
                        let signature = self.signature_index(registry, &setter)?;
                        vtable_fields.push(field(ref_exact(signature), false));
                    }
                }
            }
        }
        let vtable = registry.reserve();
        registry.define(vtable, struct_subtype(vtable_fields, base_vtable, false));

        let mut instance_fields = vec![field(ref_null(vtable), false)];
        for member in &meta.members {
            if member.is_static || member.kind != MemberKind::Field {
                continue;
            }
            instance_fields.push(field(self.wasm_type(registry, &member.value_type)?, true));
        }
        registry.define(
            instance,
            struct_subtype(instance_fields, base_instance, false),
        );
        Ok(vtable)
    }

    /// Instruction sequence producing the default value of a type: numeric
    /// zero or a typed null.
    pub fn default_value(
        &mut self,
        registry: &mut TypeRegistry,
        ty: &ValueType,
    ) -> LowerResult<Vec<Instruction<'static>>> {
        Ok(match self.wasm_type(registry, ty)? {
            ValType::F64 => vec![Instruction::F64Const(0.0)],
            ValType::F32 => vec![Instruction::F32Const(0.0)],
            ValType::I64 => vec![Instruction::I64Const(0)],
            ValType::I32 => vec![Instruction::I32Const(0)],
            ValType::Ref(ref_type) => vec![Instruction::RefNull(ref_type.heap_type)],
            other => return Err(unimplemented(format!("default value for {other:?}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use anyhow::Result;

    use crate::semantics::{ContextVar, ObjectMember};

    use super::*;

    fn class(name: &str, type_id: u32, base: Option<Rc<ObjectDescription>>) -> Rc<ObjectDescription> {
        let mut members = Vec::new();
        if let Some(base) = &base {
            members.extend(base.members.iter().cloned().map(|mut m| {
                m.is_own = false;
                m
            }));
        }
        members.push(ObjectMember::field(format!("{name}_field"), ValueType::Number));
        Rc::new(ObjectDescription {
            name: name.into(),
            type_id,
            is_interface: false,
            members,
            base,
            ctor: None,
        })
    }

    #[test]
    fn test_lowering_is_idempotent() -> Result<()> {
        let mut registry = TypeRegistry::default();
        let mut types = TypeLowering::new(&mut registry);
        let array = ValueType::Array(Box::new(ValueType::Number));

        let first = types.lower(&mut registry, &array)?;
        let count = registry.len();
        let second = types.lower(&mut registry, &array)?;
        assert_eq!(registry.len(), count);
        assert_eq!(first.heap, second.heap);
        assert_eq!(first.inner_array, second.inner_array);
        Ok(())
    }

    #[test]
    fn test_derived_struct_is_subtype_of_base() -> Result<()> {
        let mut registry = TypeRegistry::default();
        let mut types = TypeLowering::new(&mut registry);

        let base = class("Base", 100, None);
        let derived = class("Derived", 101, Some(Rc::clone(&base)));

        let base_lowered = types.lower(&mut registry, &ValueType::Object(Rc::clone(&base)))?;
        let derived_lowered =
            types.lower(&mut registry, &ValueType::Object(Rc::clone(&derived)))?;

        let derived_def = registry
            .get(derived_lowered.heap.unwrap())
            .expect("derived instance defined");
        assert_eq!(derived_def.supertype_idx, base_lowered.heap);

        let derived_vt = registry
            .get(derived_lowered.vtable.unwrap())
            .expect("derived vtable defined");
        assert_eq!(derived_vt.supertype_idx, base_lowered.vtable);
        Ok(())
    }

    #[test]
    fn test_signatures_share_one_slot() -> Result<()> {
        let mut registry = TypeRegistry::default();
        let mut types = TypeLowering::new(&mut registry);

        let a = FunctionType::new(vec![ValueType::Number], ValueType::Number);
        let b = FunctionType::new(vec![ValueType::Number], ValueType::Number);
        assert_eq!(
            types.signature_index(&mut registry, &a)?,
            types.signature_index(&mut registry, &b)?
        );
        Ok(())
    }

    #[test]
    fn test_context_heap_links_to_effective_parent() -> Result<()> {
        let mut registry = TypeRegistry::default();
        let mut types = TypeLowering::new(&mut registry);

        let root = Rc::new(ClosureContextType {
            id: 1,
            parent: None,
            vars: vec![ContextVar {
                name: "x".into(),
                value_type: ValueType::Int,
            }],
        });
        let pass_through = Rc::new(ClosureContextType {
            id: 2,
            parent: Some(Rc::clone(&root)),
            vars: vec![],
        });
        let leaf = Rc::new(ClosureContextType {
            id: 3,
            parent: Some(pass_through),
            vars: vec![ContextVar {
                name: "y".into(),
                value_type: ValueType::Number,
            }],
        });

        let root_heap = types.context_heap(&mut registry, &root)?;
        let leaf_heap = types.context_heap(&mut registry, &leaf)?;
        let leaf_def = registry.get(leaf_heap).expect("leaf context defined");
        let CompositeInnerType::Struct(ref st) = leaf_def.composite_type.inner else {
            panic!("context must be a struct");
        };
        // Slot 0 of the leaf record points at the root record, skipping
        // the pass-through scope that allocates nothing.
        assert_eq!(
            st.fields[0].element_type,
            StorageType::Val(ref_null(root_heap))
        );
        Ok(())
    }

    #[test]
    fn test_union_resolution() {
        let mut registry = TypeRegistry::default();
        let types = TypeLowering::new(&mut registry);
        let with_null = ValueType::Union(vec![ValueType::String, ValueType::Null]);
        assert_eq!(types.resolve(&with_null), ValueType::String);
        let mixed = ValueType::Union(vec![ValueType::String, ValueType::Number]);
        assert_eq!(types.resolve(&mixed), ValueType::Any);
    }
}
