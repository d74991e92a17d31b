// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Call Graph Builder (component D).
//!
//! Turns each function's local `callee_set` into resolved edges between
//! function names: direct calls resolve by address against the symbol
//! table; indirect calls and computed tail branches resolve against the
//! config's dynamic-call hints, keyed by call-site address (hints
//! specified in the config as `function+offset` are turned into absolute
//! addresses once, at config-load time, so this module only ever deals
//! in addresses).
//!
//! A call site that can't be resolved, or a function caught in a
//! recursive cycle, does not abort the build: per spec.md §7, the error
//! attaches to that function and the rest of the graph is still built.
//! The Composer is the one that decides, per entrypoint, whether a fatal
//! tag on a reachable function sinks the whole result.

use std::collections::BTreeMap;

use crate::error::AnalysisError;
use crate::function::{CallTarget, Function};
use crate::loader::Image;

/// Call-site address -> resolved target function names. Built by
/// `crate::config` from the JSON `dynamic_calls` list.
pub type CallHints = BTreeMap<u32, Vec<String>>;

#[derive(Clone, Debug)]
pub struct CallEdge {
    pub caller: String,
    pub callee: String,
    pub call_site: u32,
    pub depth_at_call: u32,
    pub is_tail: bool,
}

#[derive(Clone, Debug, Default)]
pub struct CallGraph {
    pub edges: Vec<CallEdge>,
    /// Adjacency, caller name -> (callee name, depth at the calling
    /// instruction). Built alongside `edges` for the Composer's traversal.
    pub callees: BTreeMap<String, Vec<(String, u32)>>,
}

impl CallGraph {
    fn add_edge(&mut self, edge: CallEdge) {
        self.callees
            .entry(edge.caller.clone())
            .or_default()
            .push((edge.callee.clone(), edge.depth_at_call));
        self.edges.push(edge);
    }
}

/// Builds the whole-program call graph from every analyzed function, and
/// the set of functions that carry a call-graph-level fatal tag (dangling
/// call, unresolved indirect call, or membership in a recursive cycle).
/// Functions are walked in ascending entry-address order so tags are
/// assigned identically across runs.
pub fn build(
    functions: &BTreeMap<String, Function>,
    image: &Image,
    hints: &CallHints,
) -> (CallGraph, BTreeMap<String, AnalysisError>) {
    let mut ordered: Vec<&Function> = functions.values().collect();
    ordered.sort_by_key(|f| (f.entry, f.name.clone()));

    let mut graph = CallGraph::default();
    let mut fatal: BTreeMap<String, AnalysisError> = BTreeMap::new();

    for function in ordered {
        for site in &function.callee_set {
            match &site.target {
                CallTarget::Direct(addr) => {
                    match image.function_symbol_at(*addr) {
                        Some((callee, _)) => graph.add_edge(CallEdge {
                            caller: function.name.clone(),
                            callee: callee.to_string(),
                            call_site: site.address,
                            depth_at_call: site.depth_at_call,
                            is_tail: site.is_tail,
                        }),
                        None => {
                            fatal.entry(function.name.clone()).or_insert(
                                AnalysisError::DanglingCall {
                                    caller: function.name.clone(),
                                    target: *addr,
                                },
                            );
                        }
                    }
                }
                CallTarget::Indirect => match hints.get(&site.address) {
                    Some(targets) => {
                        for target in targets {
                            // Resolve against every known symbol, not just
                            // the successfully-analyzed subset: a hint
                            // naming a real function that itself failed
                            // analysis is not dangling, and the edge must
                            // still be linked so the Composer's fatal-tag
                            // check on the callee surfaces the real error.
                            if image.symbols.contains_key(target) {
                                graph.add_edge(CallEdge {
                                    caller: function.name.clone(),
                                    callee: target.clone(),
                                    call_site: site.address,
                                    depth_at_call: site.depth_at_call,
                                    is_tail: site.is_tail,
                                });
                            } else {
                                fatal.entry(function.name.clone()).or_insert(
                                    AnalysisError::DanglingCall {
                                        caller: function.name.clone(),
                                        target: site.address,
                                    },
                                );
                            }
                        }
                    }
                    None => {
                        fatal.entry(function.name.clone()).or_insert(
                            AnalysisError::IndirectCallUnresolved {
                                function: function.name.clone(),
                                address: site.address,
                            },
                        );
                    }
                },
            }
        }
    }

    tag_recursive_cycles(&graph, &mut fatal);
    (graph, fatal)
}

/// DFS cycle detection over the resolved graph. Every function on a
/// discovered cycle is tagged `RecursionDetected` (unless it already
/// carries an earlier fatal tag), naming the cycle starting from its
/// lowest-named member so the message is stable regardless of traversal
/// order.
fn tag_recursive_cycles(
    graph: &CallGraph,
    fatal: &mut BTreeMap<String, AnalysisError>,
) {
    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut stack: Vec<&str> = Vec::new();

    let mut roots: Vec<&str> =
        graph.callees.keys().map(|s| s.as_str()).collect();
    roots.sort_unstable();

    for root in roots {
        if marks.contains_key(root) {
            continue;
        }
        visit(graph, root, &mut marks, &mut stack, fatal);
    }
}

fn visit<'a>(
    graph: &'a CallGraph,
    node: &'a str,
    marks: &mut BTreeMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
    fatal: &mut BTreeMap<String, AnalysisError>,
) {
    marks.insert(node, Mark::Visiting);
    stack.push(node);

    if let Some(callees) = graph.callees.get(node) {
        let mut names: Vec<&str> =
            callees.iter().map(|(n, _)| n.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        for callee in names {
            match marks.get(callee) {
                Some(Mark::Done) => continue,
                Some(Mark::Visiting) => {
                    let start =
                        stack.iter().position(|n| *n == callee).unwrap();
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(callee.to_string());
                    for member in &cycle {
                        fatal.entry(member.clone()).or_insert_with(|| {
                            AnalysisError::RecursionDetected {
                                cycle: cycle.clone(),
                            }
                        });
                    }
                }
                None => visit(graph, callee, marks, stack, fatal),
            }
        }
    }

    stack.pop();
    marks.insert(node, Mark::Done);
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{CallSite, CallTarget as FnCallTarget};
    use std::collections::BTreeMap as Map;

    fn function_named(
        name: &str,
        entry: u32,
        calls: Vec<CallSite>,
    ) -> Function {
        Function {
            name: name.to_string(),
            entry,
            extent_end: entry + 2,
            blocks: Map::new(),
            prologue_cost: 0,
            callee_set: calls,
            returns: true,
        }
    }

    #[test]
    fn direct_recursion_is_tagged_without_aborting() {
        let mut functions = BTreeMap::new();
        functions.insert(
            "a".to_string(),
            function_named(
                "a",
                0x1000,
                vec![CallSite {
                    address: 0x1000,
                    target: FnCallTarget::Direct(0x1000),
                    depth_at_call: 0,
                    is_tail: false,
                }],
            ),
        );

        let mut symbols = Map::new();
        symbols.insert(
            "a".to_string(),
            crate::loader::Symbol {
                address: 0x1000,
                size: 2,
                kind: crate::loader::SymbolKind::Function,
                thumb: true,
            },
        );
        let image = crate::loader::test_support::image_with_symbols(symbols);

        let (graph, fatal) = build(&functions, &image, &CallHints::new());
        assert_eq!(graph.edges.len(), 1);
        assert!(matches!(
            fatal.get("a"),
            Some(AnalysisError::RecursionDetected { .. })
        ));
    }

    #[test]
    fn unresolved_indirect_call_without_hint_is_tagged() {
        let mut functions = BTreeMap::new();
        functions.insert(
            "a".to_string(),
            function_named(
                "a",
                0x1000,
                vec![CallSite {
                    address: 0x1000,
                    target: FnCallTarget::Indirect,
                    depth_at_call: 0,
                    is_tail: false,
                }],
            ),
        );
        let image =
            crate::loader::test_support::image_with_symbols(Map::new());
        let (graph, fatal) = build(&functions, &image, &CallHints::new());
        assert!(graph.edges.is_empty());
        assert!(matches!(
            fatal.get("a"),
            Some(AnalysisError::IndirectCallUnresolved { .. })
        ));
    }

    #[test]
    fn hint_resolves_indirect_call() {
        let mut functions = BTreeMap::new();
        functions.insert(
            "a".to_string(),
            function_named(
                "a",
                0x1000,
                vec![CallSite {
                    address: 0x1000,
                    target: FnCallTarget::Indirect,
                    depth_at_call: 4,
                    is_tail: false,
                }],
            ),
        );
        functions.insert("b".to_string(), function_named("b", 0x2000, vec![]));

        let mut symbols = Map::new();
        symbols.insert(
            "b".to_string(),
            crate::loader::Symbol {
                address: 0x2000,
                size: 2,
                kind: crate::loader::SymbolKind::Function,
                thumb: true,
            },
        );
        let image = crate::loader::test_support::image_with_symbols(symbols);

        let mut hints = CallHints::new();
        hints.insert(0x1000, vec!["b".to_string()]);

        let (graph, fatal) = build(&functions, &image, &hints);
        assert!(fatal.is_empty());
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].callee, "b");
    }

    #[test]
    fn hint_to_real_symbol_that_failed_analysis_links_edge_not_dangling() {
        // "b" is a real symbol but never made it into `functions` (its own
        // analysis failed); the hint must still link the edge so the
        // Composer's lookup on "b" surfaces its actual fatal tag, rather
        // than misreporting "a"'s call site as dangling.
        let mut functions = BTreeMap::new();
        functions.insert(
            "a".to_string(),
            function_named(
                "a",
                0x1000,
                vec![CallSite {
                    address: 0x1000,
                    target: FnCallTarget::Indirect,
                    depth_at_call: 4,
                    is_tail: false,
                }],
            ),
        );

        let mut symbols = Map::new();
        symbols.insert(
            "b".to_string(),
            crate::loader::Symbol {
                address: 0x2000,
                size: 2,
                kind: crate::loader::SymbolKind::Function,
                thumb: true,
            },
        );
        let image = crate::loader::test_support::image_with_symbols(symbols);

        let mut hints = CallHints::new();
        hints.insert(0x1000, vec!["b".to_string()]);

        let (graph, fatal) = build(&functions, &image, &hints);
        assert!(fatal.get("a").is_none());
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].callee, "b");
    }
}
