//! Native code generation backends.
//!
//! Only x64 is supported; the rewriter targets the System V AMD64 ABI.

pub mod x64;
