//! End-to-end emission over hand-built semantics trees: every scenario
//! drives `compile_module` and checks the produced module structurally.

use std::rc::Rc;

use anyhow::Result;

use sema2wasm::codegen::{compile_module, CompileOptions};
use sema2wasm::semantics::*;

const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn number_fn(name: &str, params: Vec<ValueType>) -> FunctionDeclareNode {
    FunctionDeclareNode::new(name, FunctionType::new(params, ValueType::Number))
}

#[test]
fn test_arithmetic_function_round_trips_to_bytes() -> Result<()> {
    let a = VarDeclareNode::local("a", ValueType::Number);
    let b = VarDeclareNode::local("b", ValueType::Number);

    let mut add = number_fn("add", vec![ValueType::Number, ValueType::Number]);
    add.params = vec![
        ParamDeclare::new("a", ValueType::Number),
        ParamDeclare::new("b", ValueType::Number),
    ];
    add.vars = vec![Rc::clone(&a), Rc::clone(&b)];
    add.exported = true;
    add.body = vec![Value::ret(Some(Value::binary(
        BinaryOperator::Add,
        Value::read(&a),
        Value::read(&b),
        ValueType::Number,
    )))];
    let add = Rc::new(add);

    let mut module = SemanticsModule::new("arith");
    module.functions = vec![Rc::clone(&add)];
    module.top_level = vec![Value::Call(CallValue {
        callee: Callee::Direct(add),
        args: vec![Value::number(1.5), Value::number(2.5)],
        type_args: vec![],
        ty: ValueType::Number,
    })];

    let bytes = compile_module(&module, &CompileOptions::default())?;
    assert_eq!(&bytes[0..4], &WASM_MAGIC);
    // Exported names land verbatim in the export section.
    assert!(contains(&bytes, b"add"));
    assert!(contains(&bytes, b"_start"));
    assert!(contains(&bytes, b"dyntype_context"));
    Ok(())
}

fn method_member(name: &str, decl: &Rc<FunctionDeclareNode>) -> ObjectMember {
    ObjectMember::method(
        name,
        ValueType::Function(decl.func_type()),
        Rc::clone(decl),
    )
}

#[test]
fn test_interface_dispatch_emits_both_paths() -> Result<()> {
    // interface I { m(): number }
    // class A implements I { m(): number { return 3 } }
    // const i: I = new A(); i.m()
    let mut m_impl = FunctionDeclareNode::new(
        "A_m",
        FunctionType::method(vec![], ValueType::Number),
    );
    m_impl.body = vec![Value::ret(Some(Value::number(3.0)))];
    let m_impl = Rc::new(m_impl);

    let mut ctor = FunctionDeclareNode::new(
        "A_ctor",
        FunctionType::method(vec![], ValueType::Void),
    );
    ctor.body = vec![];
    let ctor = Rc::new(ctor);

    let class_a = Rc::new(ObjectDescription {
        name: "A".into(),
        type_id: 101,
        is_interface: false,
        members: vec![method_member("m", &m_impl)],
        base: None,
        ctor: Some(Rc::clone(&ctor)),
    });
    let iface_i = Rc::new(ObjectDescription {
        name: "I".into(),
        type_id: 102,
        is_interface: true,
        members: vec![ObjectMember::abstract_method(
            "m",
            ValueType::Function(Rc::new(FunctionType::method(vec![], ValueType::Number))),
        )],
        base: None,
        ctor: None,
    });

    let i_var = VarDeclareNode::global(
        "i",
        ValueType::Object(Rc::clone(&iface_i)),
        Some(Value::cast(
            Value::New(NewValue {
                meta: Rc::clone(&class_a),
                args: vec![],
            }),
            ValueType::Object(Rc::clone(&iface_i)),
        )),
    );

    let mut module = SemanticsModule::new("dispatch");
    module.classes = vec![Rc::clone(&class_a), Rc::clone(&iface_i)];
    module.globals = vec![Rc::clone(&i_var)];
    module.top_level = vec![Value::Call(CallValue {
        callee: Callee::Method {
            receiver: Box::new(Value::read(&i_var)),
            member: "m".into(),
        },
        args: vec![],
        type_args: vec![],
        ty: ValueType::Number,
    })];

    let bytes = compile_module(&module, &CompileOptions::default())?;
    assert_eq!(&bytes[0..4], &WASM_MAGIC);
    // The structural-lookup and structural-access imports are in play.
    assert!(contains(&bytes, b"find_index"));
    assert!(contains(&bytes, b"struct_get_dyn_funcref"));
    // The member name reached the data segment as a cstring.
    assert!(contains(&bytes, b"m\0"));
    Ok(())
}

#[test]
fn test_closure_capture_chains_through_a_record() -> Result<()> {
    // function outer() { let x = 7; return () => x; }
    let record = Rc::new(ClosureContextType {
        id: 1,
        parent: None,
        vars: vec![ContextVar {
            name: "x".into(),
            value_type: ValueType::Int,
        }],
    });
    let x = Rc::new(VarDeclareNode {
        name: "x".into(),
        value_type: ValueType::Int,
        kind: VarKind::Local,
        capture: Some(Capture {
            context: Rc::clone(&record),
            index: 0,
        }),
        init: None,
    });

    let inner_type = FunctionType::new(vec![], ValueType::Int);
    let mut lambda = FunctionDeclareNode::new("outer|lambda0", inner_type.clone());
    lambda.parent_context = Some(Rc::clone(&record));
    lambda.body = vec![Value::ret(Some(Value::read(&x)))];
    let lambda = Rc::new(lambda);

    let mut outer = FunctionDeclareNode::new(
        "outer",
        FunctionType::new(vec![], ValueType::Function(Rc::new(inner_type))),
    );
    outer.exported = true;
    outer.owns_context = Some(record);
    outer.vars = vec![Rc::clone(&x)];
    outer.body = vec![
        Value::write(&x, Value::int(7)),
        Value::ret(Some(Value::Closure(ClosureValue {
            decl: Rc::clone(&lambda),
        }))),
    ];

    let mut module = SemanticsModule::new("closures");
    module.functions = vec![Rc::new(outer), lambda];

    let bytes = compile_module(&module, &CompileOptions::default())?;
    assert_eq!(&bytes[0..4], &WASM_MAGIC);
    assert!(contains(&bytes, b"outer"));
    Ok(())
}

#[test]
fn test_generic_function_specializes_per_call_site() -> Result<()> {
    // function id<T>(x: T): T { return x } called with T=number, T=string
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

    let x = VarDeclareNode::local(
        "x",
        ValueType::TypeParameter(Rc::new(TypeParameter {
            name: "T".into(),
            bound: None,
            index: 0,
            default: None,
        })),
    );
    let mut id = FunctionDeclareNode::new("id", func_type);
    id.params = vec![ParamDeclare::new("x", x.value_type.clone())];
    id.vars = vec![Rc::clone(&x)];
    id.body = vec![Value::ret(Some(Value::read(&x)))];
    let id = Rc::new(id);

    let call_with = |type_arg: ValueType, arg: Value| {
        Value::Call(CallValue {
            callee: Callee::Direct(Rc::clone(&id)),
            args: vec![arg],
            type_args: vec![type_arg],
            ty: ValueType::Any,
        })
    };

    let mut module = SemanticsModule::new("generics");
    module.functions = vec![Rc::clone(&id)];
    module.top_level = vec![
        call_with(ValueType::Number, Value::number(1.0)),
        call_with(ValueType::String, Value::string("one")),
    ];

    let bytes = compile_module(&module, &CompileOptions::default())?;
    // Two specializations with id-mangled names, routed by name.
    let number_name = format!("id_{}", ValueType::Number.type_id());
    let string_name = format!("id_{}", ValueType::String.type_id());
    assert!(contains(&bytes, number_name.as_bytes()));
    assert!(contains(&bytes, string_name.as_bytes()));
    Ok(())
}

#[test]
fn test_rest_parameter_builds_the_packed_array() -> Result<()> {
    // function f(...xs: number[]) { return xs.length } called as f(1,2,3)
    let xs_ty = ValueType::Array(Box::new(ValueType::Number));
    let xs = VarDeclareNode::local("xs", xs_ty.clone());

    let mut func_type = FunctionType::new(vec![xs_ty.clone()], ValueType::Number);
    func_type.rest_index = Some(0);
    let mut f = FunctionDeclareNode::new("f", func_type);
    f.params = vec![ParamDeclare::new("xs", xs_ty)];
    f.vars = vec![Rc::clone(&xs)];
    f.body = vec![Value::ret(Some(Value::FieldGet(FieldGetValue {
        receiver: Box::new(Value::read(&xs)),
        member: "length".into(),
        ty: ValueType::Number,
    })))];
    let f = Rc::new(f);

    let mut module = SemanticsModule::new("rest");
    module.functions = vec![Rc::clone(&f)];
    module.top_level = vec![Value::Call(CallValue {
        callee: Callee::Direct(f),
        args: vec![Value::number(1.0), Value::number(2.0), Value::number(3.0)],
        type_args: vec![],
        ty: ValueType::Number,
    })];

    let bytes = compile_module(&module, &CompileOptions::default())?;
    assert_eq!(&bytes[0..4], &WASM_MAGIC);
    Ok(())
}

#[test]
fn test_any_equality_routes_through_the_runtime() -> Result<()> {
    // const a: any = 1; const b: any = 1; a === b
    let a = VarDeclareNode::global(
        "a",
        ValueType::Any,
        Some(Value::cast(Value::number(1.0), ValueType::Any)),
    );
    let b = VarDeclareNode::global(
        "b",
        ValueType::Any,
        Some(Value::cast(Value::number(1.0), ValueType::Any)),
    );

    let mut module = SemanticsModule::new("anyeq");
    module.globals = vec![Rc::clone(&a), Rc::clone(&b)];
    module.top_level = vec![Value::binary(
        BinaryOperator::StrictEq,
        Value::read(&a),
        Value::read(&b),
        ValueType::Boolean,
    )];

    let bytes = compile_module(&module, &CompileOptions::default())?;
    assert!(contains(&bytes, b"dyntype_cmp"));
    assert!(contains(&bytes, b"dyntype_new_number"));
    Ok(())
}
