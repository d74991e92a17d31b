// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stack Composer (component F).
//!
//! Walks the call graph from each entrypoint's handler to compute the
//! worst-case local depth, then layers on the preemption surcharge from
//! every entrypoint with a strictly lower priority group.

use std::collections::BTreeMap;

use crate::callgraph::CallGraph;
use crate::entrypoint::{preempters, Entrypoint, EXCEPTION_FRAME_COST};
use crate::error::AnalysisError;
use crate::function::Function;

/// One step of a witness path: the function entered, and the depth the
/// caller had already consumed at the call site that reached it (0 for
/// the path's root).
#[derive(Clone, Debug)]
pub struct WitnessStep {
    pub function: String,
    pub depth_at_call: u32,
}

#[derive(Clone, Debug)]
pub struct AnalysisResult {
    pub local_depth: u32,
    pub preemption_surcharge: u32,
    pub total_depth: u32,
    pub witness: Vec<WitnessStep>,
}

type LocalResult = Result<(u32, Vec<WitnessStep>), AnalysisError>;

pub fn run(
    entrypoints: &[Entrypoint],
    functions: &BTreeMap<String, Function>,
    fatal: &BTreeMap<String, AnalysisError>,
    graph: &CallGraph,
) -> Vec<(Entrypoint, Result<AnalysisResult, AnalysisError>)> {
    let mut local: BTreeMap<String, LocalResult> = BTreeMap::new();
    for ep in entrypoints {
        local
            .entry(ep.handler.clone())
            .or_insert_with(|| local_depth(&ep.handler, functions, fatal, graph));
    }

    let mut results = Vec::with_capacity(entrypoints.len());
    for ep in entrypoints {
        let (local_depth, witness) = match local[&ep.handler].clone() {
            Ok(v) => v,
            Err(e) => {
                results.push((ep.clone(), Err(e)));
                continue;
            }
        };

        let mut by_group: BTreeMap<i32, u32> = BTreeMap::new();
        let mut failure: Option<AnalysisError> = None;
        for p in preempters(ep, entrypoints) {
            match &local[&p.handler] {
                Ok((depth, _)) => {
                    let contribution = EXCEPTION_FRAME_COST + *depth;
                    let slot = by_group.entry(p.priority_group).or_insert(0);
                    *slot = (*slot).max(contribution);
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e.clone());
                    }
                }
            }
        }

        if let Some(e) = failure {
            results.push((ep.clone(), Err(e)));
            continue;
        }

        let preemption_surcharge: u32 = by_group.values().sum();
        let total_depth = local_depth + preemption_surcharge;
        results.push((
            ep.clone(),
            Ok(AnalysisResult {
                local_depth,
                preemption_surcharge,
                total_depth,
                witness,
            }),
        ));
    }
    results
}

/// Computes `depth(handler)` per spec.md §4.F step 1 via an explicit
/// work-stack (no native recursion, so a pathological call-graph chain
/// can't blow the host stack), memoizing every function visited along the
/// way. Every reachable function already carrying a fatal tag (from
/// function analysis or call-graph resolution) short-circuits the whole
/// computation with that tag, per the fail-the-entrypoint policy.
fn local_depth(
    root: &str,
    functions: &BTreeMap<String, Function>,
    fatal: &BTreeMap<String, AnalysisError>,
    graph: &CallGraph,
) -> LocalResult {
    enum Frame {
        Enter(String),
        Exit(String),
    }

    let mut depth: BTreeMap<String, u32> = BTreeMap::new();
    // For each function, the call site that realized its maximum depth:
    // (callee name, depth already consumed at that call site). `None`
    // means the function's own prologue cost won outright.
    let mut choice: BTreeMap<String, Option<(String, u32)>> = BTreeMap::new();
    let mut stack = vec![Frame::Enter(root.to_string())];

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Enter(name) => {
                if depth.contains_key(&name) {
                    continue;
                }
                if let Some(err) = fatal.get(&name) {
                    return Err(err.clone());
                }
                if !functions.contains_key(&name) {
                    return Err(AnalysisError::FunctionUnanalyzable {
                        function: name.clone(),
                        address: 0,
                    });
                }
                let mut callees: Vec<String> = graph
                    .callees
                    .get(&name)
                    .map(|v| v.iter().map(|(n, _)| n.clone()).collect())
                    .unwrap_or_default();
                callees.sort_unstable();
                callees.dedup();

                stack.push(Frame::Exit(name.clone()));
                for callee in callees.into_iter().rev() {
                    if !depth.contains_key(&callee) {
                        stack.push(Frame::Enter(callee));
                    }
                }
            }
            Frame::Exit(name) => {
                let function = &functions[&name];
                let mut best = function.prologue_cost;
                let mut best_choice = None;

                // Tie-break per spec.md §5: lower-address callee first,
                // then lexicographically smaller name.
                let mut candidates: Vec<(u32, &str, u32, u32)> = graph
                    .edges
                    .iter()
                    .filter(|e| e.caller == name)
                    .map(|e| {
                        let callee_addr = functions
                            .get(&e.callee)
                            .map(|f| f.entry)
                            .unwrap_or(u32::MAX);
                        let callee_depth =
                            depth.get(&e.callee).copied().unwrap_or(0);
                        let value =
                            e.depth_at_call.saturating_add(callee_depth);
                        (callee_addr, e.callee.as_str(), e.depth_at_call, value)
                    })
                    .collect();
                candidates.sort_by(|a, b| {
                    a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1))
                });
                for (_, callee, depth_at_call, value) in candidates {
                    if value > best {
                        best = value;
                        best_choice =
                            Some((callee.to_string(), depth_at_call));
                    }
                }

                depth.insert(name.clone(), best);
                choice.insert(name, best_choice);
            }
        }
    }

    let local = depth[root];
    let mut witness = Vec::new();
    let mut current = root.to_string();
    let mut depth_at_call = 0;
    loop {
        witness.push(WitnessStep {
            function: current.clone(),
            depth_at_call,
        });
        match choice.get(&current).cloned().flatten() {
            Some((next, next_depth_at_call)) => {
                current = next;
                depth_at_call = next_depth_at_call;
            }
            None => break,
        }
    }

    Ok((local, witness))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph::CallEdge;
    use crate::function::{BasicBlock, CallSite, CallTarget};

    fn leaf(name: &str, entry: u32, prologue_cost: u32) -> Function {
        Function {
            name: name.to_string(),
            entry,
            extent_end: entry + 2,
            blocks: BTreeMap::<u32, BasicBlock>::new(),
            prologue_cost,
            callee_set: Vec::new(),
            returns: true,
        }
    }

    fn entrypoint(name: &str, handler: &str, priority_group: i32) -> Entrypoint {
        Entrypoint {
            name: name.to_string(),
            vector_index: 0,
            handler: handler.to_string(),
            priority_group,
            enabled: true,
        }
    }

    #[test]
    fn leaf_function_total_equals_prologue_cost() {
        let mut functions = BTreeMap::new();
        functions.insert("main".to_string(), leaf("main", 0x1000, 16));
        let entrypoints = vec![entrypoint("reset", "main", i32::MAX)];
        let graph = CallGraph::default();
        let fatal = BTreeMap::new();

        let results = run(&entrypoints, &functions, &fatal, &graph);
        let (_, result) = &results[0];
        let result = result.as_ref().unwrap();
        assert_eq!(result.local_depth, 16);
        assert_eq!(result.total_depth, 16);
    }

    #[test]
    fn two_level_call_sums_depths() {
        let mut foo = leaf("foo", 0x1000, 8);
        foo.callee_set.push(CallSite {
            address: 0x1004,
            target: CallTarget::Direct(0x2000),
            depth_at_call: 8,
            is_tail: false,
        });
        let bar = leaf("bar", 0x2000, 16);

        let mut functions = BTreeMap::new();
        functions.insert("foo".to_string(), foo);
        functions.insert("bar".to_string(), bar);

        let mut graph = CallGraph::default();
        graph.edges.push(CallEdge {
            caller: "foo".into(),
            callee: "bar".into(),
            call_site: 0x1004,
            depth_at_call: 8,
            is_tail: false,
        });
        graph
            .callees
            .insert("foo".into(), vec![("bar".into(), 8)]);

        let entrypoints = vec![entrypoint("reset", "foo", i32::MAX)];
        let fatal = BTreeMap::new();
        let results = run(&entrypoints, &functions, &fatal, &graph);
        let result = results[0].1.as_ref().unwrap();
        assert_eq!(result.total_depth, 24);
        assert_eq!(result.witness[0].function, "foo");
        assert_eq!(result.witness[1].function, "bar");
    }

    #[test]
    fn preempted_reset_adds_frame_cost_and_handler_depth() {
        let mut functions = BTreeMap::new();
        functions.insert("main".to_string(), leaf("main", 0x1000, 100));
        functions.insert("irq0".to_string(), leaf("irq0", 0x2000, 40));

        let entrypoints = vec![
            entrypoint("reset", "main", i32::MAX),
            entrypoint("irq0", "irq0", 0),
        ];
        let graph = CallGraph::default();
        let fatal = BTreeMap::new();

        let results = run(&entrypoints, &functions, &fatal, &graph);
        let reset = results
            .iter()
            .find(|(e, _)| e.name == "reset")
            .unwrap()
            .1
            .as_ref()
            .unwrap();
        assert_eq!(reset.total_depth, 100 + 32 + 40);

        let irq = results
            .iter()
            .find(|(e, _)| e.name == "irq0")
            .unwrap()
            .1
            .as_ref()
            .unwrap();
        assert_eq!(irq.total_depth, 40);
    }

    #[test]
    fn two_priority_groups_each_contribute_their_own_worst() {
        let mut functions = BTreeMap::new();
        functions.insert("main".to_string(), leaf("main", 0x1000, 100));
        functions.insert("irq_a".to_string(), leaf("irq_a", 0x2000, 30));
        functions.insert("irq_b".to_string(), leaf("irq_b", 0x3000, 50));

        let entrypoints = vec![
            entrypoint("reset", "main", i32::MAX),
            entrypoint("irq_a", "irq_a", 2),
            entrypoint("irq_b", "irq_b", 1),
        ];
        let graph = CallGraph::default();
        let fatal = BTreeMap::new();

        let results = run(&entrypoints, &functions, &fatal, &graph);
        let reset = results
            .iter()
            .find(|(e, _)| e.name == "reset")
            .unwrap()
            .1
            .as_ref()
            .unwrap();
        assert_eq!(reset.total_depth, 100 + (32 + 30) + (32 + 50));
    }

    #[test]
    fn fatal_tag_on_reachable_function_fails_the_entrypoint() {
        let functions = BTreeMap::new();
        let entrypoints = vec![entrypoint("reset", "main", i32::MAX)];
        let graph = CallGraph::default();
        let mut fatal = BTreeMap::new();
        fatal.insert(
            "main".to_string(),
            AnalysisError::IndirectCallUnresolved {
                function: "main".into(),
                address: 0x1000,
            },
        );

        let results = run(&entrypoints, &functions, &fatal, &graph);
        assert!(results[0].1.is_err());
    }
}
