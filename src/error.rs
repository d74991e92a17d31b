// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Crate-wide error model.
//!
//! This mirrors the kernel's own approach to errors (see Hubris's
//! `kern::err`): a plain enum with hand-written `Display`/`Error` impls,
//! meant to be matched on by callers rather than just printed. The CLI
//! binary is the only place `anyhow` enters the picture.

use std::fmt;

/// Every way analysis of a binary can fail, keyed to the address or
/// function that triggered it so a caller can build a useful diagnostic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalysisError {
    /// The input file is not a little-endian 32-bit ARM ELF with a symbol
    /// table, or is missing a text/vector section.
    BinaryMalformed { detail: String },
    /// No valid Thumbv6-m encoding exists at this address.
    DecodeFailed { address: u32 },
    /// A function could not be swept into a CFG: a decode failure inside
    /// its extent, or a terminator the analyzer doesn't recognize.
    FunctionUnanalyzable { function: String, address: u32 },
    /// The function clobbers SP from a non-constant source, or violates
    /// the zero-delta loop back-edge invariant.
    StackIndeterminate { function: String, reason: String },
    /// An indirect call/branch has no resolving hint in the config.
    IndirectCallUnresolved { function: String, address: u32 },
    /// A direct call targets an address with no corresponding symbol.
    DanglingCall { caller: String, target: u32 },
    /// The call graph contains a cycle reachable from an entrypoint.
    RecursionDetected { cycle: Vec<String> },
    /// The JSON config violates the schema: unknown field, version
    /// mismatch, or a hint/entrypoint referencing an unknown symbol.
    ConfigInvalid { detail: String },
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::BinaryMalformed { detail } => {
                write!(f, "malformed binary: {detail}")
            }
            AnalysisError::DecodeFailed { address } => {
                write!(f, "no valid instruction encoding at {address:#010x}")
            }
            AnalysisError::FunctionUnanalyzable { function, address } => {
                write!(
                    f,
                    "function `{function}` is not analyzable at {address:#010x}"
                )
            }
            AnalysisError::StackIndeterminate { function, reason } => {
                write!(
                    f,
                    "function `{function}` has indeterminate stack usage: {reason}"
                )
            }
            AnalysisError::IndirectCallUnresolved { function, address } => {
                write!(
                    f,
                    "unresolved indirect call in `{function}` at {address:#010x}"
                )
            }
            AnalysisError::DanglingCall { caller, target } => {
                write!(
                    f,
                    "`{caller}` calls {target:#010x}, which is not a known function"
                )
            }
            AnalysisError::RecursionDetected { cycle } => {
                write!(f, "recursive call cycle: {}", cycle.join(" -> "))
            }
            AnalysisError::ConfigInvalid { detail } => {
                write!(f, "invalid config: {detail}")
            }
        }
    }
}

impl std::error::Error for AnalysisError {}

impl AnalysisError {
    /// The exit code this error should produce when it is the fatal reason
    /// the whole run failed, per the CLI's documented contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            AnalysisError::ConfigInvalid { .. } => 2,
            AnalysisError::BinaryMalformed { .. } => 4,
            AnalysisError::DecodeFailed { .. }
            | AnalysisError::FunctionUnanalyzable { .. }
            | AnalysisError::StackIndeterminate { .. }
            | AnalysisError::IndirectCallUnresolved { .. }
            | AnalysisError::DanglingCall { .. }
            | AnalysisError::RecursionDetected { .. } => 3,
        }
    }

    /// Short machine-stable tag, used by the report's `status` column and
    /// by the JSON report mode.
    pub fn tag(&self) -> &'static str {
        match self {
            AnalysisError::BinaryMalformed { .. } => "binary-malformed",
            AnalysisError::DecodeFailed { .. } => "decode-failed",
            AnalysisError::FunctionUnanalyzable { .. } => "unanalyzable",
            AnalysisError::StackIndeterminate { .. } => "indeterminate",
            AnalysisError::IndirectCallUnresolved { .. } => "unresolved-call",
            AnalysisError::DanglingCall { .. } => "dangling-call",
            AnalysisError::RecursionDetected { .. } => "recursion",
            AnalysisError::ConfigInvalid { .. } => "config-invalid",
        }
    }
}
