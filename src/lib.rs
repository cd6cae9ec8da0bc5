//! Ahead-of-time back end lowering a statically-typed subset of a
//! dynamically-typed scripting language into WebAssembly modules that use
//! the GC and typed-function-reference proposals.
//!
//! The crate consumes a fully type-resolved *semantics tree*
//! ([`semantics`]) and produces module bytes ([`codegen::compile_module`]).
//! Dynamic semantics — `any` values, dynamic property access, cross-type
//! equality — are delegated to the external `libdyntype` runtime through a
//! fixed import set.

pub mod codegen;
pub mod semantics;
