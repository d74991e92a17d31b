// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static whole-program worst-case stack-usage analysis for Thumbv6-m
//! (Cortex-M0) ELF executables.
//!
//! The pipeline runs in six stages: [`loader`] parses the ELF, [`decode`]
//! turns bytes into instructions, [`function`] sweeps each symbol into a
//! basic-block CFG and a worst-case local depth, [`callgraph`] resolves
//! calls between functions, [`entrypoint`] derives the set of asynchronous
//! entrypoints from the vector table, and [`compose`] walks the graph from
//! each entrypoint to the worst-case total including preemption.
//! [`AnalysisContext`] owns the per-run state and wires the stages
//! together; [`report`] renders the composer's output.

pub mod callgraph;
pub mod compose;
pub mod config;
pub mod decode;
pub mod entrypoint;
pub mod error;
pub mod function;
pub mod loader;
pub mod report;

use std::collections::BTreeMap;
use std::path::Path;

use callgraph::CallGraph;
use compose::AnalysisResult;
use entrypoint::Entrypoint;
use error::AnalysisError;
use function::Function;
use loader::Image;

/// Owns everything produced while analyzing one binary: the parsed image,
/// every function that could be analyzed, the resolved call graph, and the
/// fatal tags collected along the way (from function analysis or call-graph
/// resolution, whichever happened first for a given function).
pub struct AnalysisContext {
    pub image: Image,
    pub functions: BTreeMap<String, Function>,
    pub graph: CallGraph,
    pub fatal: BTreeMap<String, AnalysisError>,
    pub entrypoints: Vec<Entrypoint>,
}

impl AnalysisContext {
    /// Loads the binary, resolves the config against it, analyzes every
    /// function symbol, and derives the entrypoint set. Per-function
    /// failures are collected into `fatal` rather than aborting the whole
    /// build; only a malformed binary or an invalid config stop this early.
    pub fn build(
        binary_path: &Path,
        config_path: Option<&Path>,
    ) -> Result<AnalysisContext, AnalysisError> {
        let image = Image::load(binary_path)?;
        let config = config::load(config_path, &image)?;

        let mut functions = BTreeMap::new();
        let mut fatal: BTreeMap<String, AnalysisError> = BTreeMap::new();
        for (name, symbol) in image.functions_by_address() {
            match function::analyze_function(
                &image,
                name,
                symbol.address,
                symbol.size,
            ) {
                Ok(f) => {
                    functions.insert(name.to_string(), f);
                }
                Err(e) => {
                    fatal.insert(name.to_string(), e);
                }
            }
        }

        let (graph, graph_fatal) =
            callgraph::build(&functions, &image, &config.dynamic_calls);
        for (name, err) in graph_fatal {
            fatal.entry(name).or_insert(err);
        }

        let entrypoints = entrypoint::derive(&image, &config)?;

        Ok(AnalysisContext {
            image,
            functions,
            graph,
            fatal,
            entrypoints,
        })
    }

    /// Composes the worst-case total depth for every entrypoint, in
    /// ascending vector-index order.
    pub fn analyze(
        &self,
    ) -> Vec<(Entrypoint, Result<AnalysisResult, AnalysisError>)> {
        compose::run(&self.entrypoints, &self.functions, &self.fatal, &self.graph)
    }
}
