use std::{error::Error, fmt::Display};

/// Failure surfaced by the lowering. The lowering never retries and never
/// recovers locally; every error propagates synchronously to the caller.
/// Presentation (colors, positions, hints) belongs to the enclosing
/// collaborator, not to this crate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodegenError {
    UnimplementedLowering(UnimplementedLowering),
    InvariantViolated(InvariantViolated),
    TypeShapeMismatch(TypeShapeMismatch),
}

impl Display for CodegenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodegenError::UnimplementedLowering(e) => e.fmt(f),
            CodegenError::InvariantViolated(e) => e.fmt(f),
            CodegenError::TypeShapeMismatch(e) => e.fmt(f),
        }
    }
}

impl Error for CodegenError {}

/// A value kind, operand pair or cast pair the lowering does not handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnimplementedLowering {
    pub construct: String,
}

impl Display for UnimplementedLowering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("no lowering for {}", self.construct))
    }
}

impl Error for UnimplementedLowering {}

impl From<UnimplementedLowering> for CodegenError {
    fn from(value: UnimplementedLowering) -> Self {
        CodegenError::UnimplementedLowering(value)
    }
}

/// An internal invariant broke: an environment-parameter mismatch, an
/// unknown member name, a missing declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvariantViolated {
    pub message: String,
}

impl Display for InvariantViolated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for InvariantViolated {}

impl From<InvariantViolated> for CodegenError {
    fn from(value: InvariantViolated) -> Self {
        CodegenError::InvariantViolated(value)
    }
}

/// Two positions that must agree on a wasm type do not, e.g. the branches
/// of a conditional.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeShapeMismatch {
    pub expected: String,
    pub actual: String,
}

impl Display for TypeShapeMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "expected shape '{}' but got '{}'",
            self.expected, self.actual
        ))
    }
}

impl Error for TypeShapeMismatch {}

impl From<TypeShapeMismatch> for CodegenError {
    fn from(value: TypeShapeMismatch) -> Self {
        CodegenError::TypeShapeMismatch(value)
    }
}

pub type LowerResult<T> = Result<T, CodegenError>;

pub(crate) fn unimplemented(construct: impl Into<String>) -> CodegenError {
    CodegenError::UnimplementedLowering(UnimplementedLowering {
        construct: construct.into(),
    })
}

pub(crate) fn invariant(message: impl Into<String>) -> CodegenError {
    CodegenError::InvariantViolated(InvariantViolated {
        message: message.into(),
    })
}

pub(crate) fn shape_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> CodegenError {
    CodegenError::TypeShapeMismatch(TypeShapeMismatch {
        expected: expected.into(),
        actual: actual.into(),
    })
}
