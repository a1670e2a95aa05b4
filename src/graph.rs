//! Command graph construction and execution planning (4.F): builds the
//! dependency graph over gathered commands, checks acyclicity with Tarjan's
//! algorithm, and computes a deterministic level partitioning with Kahn's
//! algorithm. Enrichment source: the SCC/topological-leveling split mirrors
//! how ninja-style build graphs separate "is this a DAG" from "what order do
//! we run it in" rather than conflating the two into one pass.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::target::Command;

/// One node per gathered command, with its outgoing edges (commands that
/// must run after it).
pub struct CommandGraph {
    pub commands: Vec<Command>,
    pub keys: Vec<u64>,
    /// adjacency[u] = indices of commands depending on commands[u]
    adjacency: Vec<Vec<usize>>,
}

impl CommandGraph {
    /// Builds the graph: an edge `u -> v` exists iff `v` consumes an output
    /// of `u` as input, or `v` explicitly names `u`'s command key.
    pub fn build(commands: Vec<Command>) -> Self {
        let keys: Vec<u64> = commands.iter().map(|c| c.key()).collect();

        let mut producer_of: HashMap<PathBuf, usize> = HashMap::new();
        for (idx, cmd) in commands.iter().enumerate() {
            for output in &cmd.outputs {
                producer_of.insert(output.clone(), idx);
            }
        }

        let mut adjacency = vec![Vec::new(); commands.len()];
        for (v_idx, cmd) in commands.iter().enumerate() {
            let mut predecessors: Vec<usize> = cmd
                .inputs
                .iter()
                .filter_map(|input| producer_of.get(input))
                .copied()
                .collect();
            for dep_key in &cmd.depends_on {
                if let Ok(key) = dep_key.parse::<u64>() {
                    if let Some(u_idx) = keys.iter().position(|k| *k == key) {
                        predecessors.push(u_idx);
                    }
                } else if let Some(u_idx) = commands.iter().position(|c| &c.program == dep_key) {
                    predecessors.push(u_idx);
                }
            }
            predecessors.sort_unstable();
            predecessors.dedup();
            for u_idx in predecessors {
                if u_idx != v_idx {
                    adjacency[u_idx].push(v_idx);
                }
            }
        }

        CommandGraph { commands, keys, adjacency }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn successors(&self, idx: usize) -> &[usize] {
        &self.adjacency[idx]
    }

    /// The set of command indices that must complete before `idx` can run.
    /// Used by the scheduler to decide whether a not-yet-run command
    /// transitively depends on an already-failed one.
    pub fn predecessors(&self, idx: usize) -> Vec<usize> {
        self.adjacency
            .iter()
            .enumerate()
            .filter(|(_, succs)| succs.contains(&idx))
            .map(|(u, _)| u)
            .collect()
    }

    /// Tarjan's SCC algorithm. Returns every strongly connected component,
    /// including trivial (size-1, no self-loop) ones.
    pub fn tarjan_scc(&self) -> Vec<Vec<usize>> {
        let n = self.commands.len();
        let mut index_counter = 0usize;
        let mut indices: Vec<Option<usize>> = vec![None; n];
        let mut lowlink: Vec<usize> = vec![0; n];
        let mut on_stack: Vec<bool> = vec![false; n];
        let mut stack: Vec<usize> = Vec::new();
        let mut components: Vec<Vec<usize>> = Vec::new();

        struct Frame {
            node: usize,
            child_iter: usize,
        }

        for start in 0..n {
            if indices[start].is_some() {
                continue;
            }
            let mut call_stack = vec![Frame { node: start, child_iter: 0 }];
            indices[start] = Some(index_counter);
            lowlink[start] = index_counter;
            index_counter += 1;
            stack.push(start);
            on_stack[start] = true;

            while let Some(frame) = call_stack.last_mut() {
                let v = frame.node;
                let succ = self.successors(v);
                if frame.child_iter < succ.len() {
                    let w = succ[frame.child_iter];
                    frame.child_iter += 1;
                    if indices[w].is_none() {
                        indices[w] = Some(index_counter);
                        lowlink[w] = index_counter;
                        index_counter += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        call_stack.push(Frame { node: w, child_iter: 0 });
                    } else if on_stack[w] {
                        lowlink[v] = lowlink[v].min(indices[w].unwrap());
                    }
                } else {
                    call_stack.pop();
                    if let Some(parent_frame) = call_stack.last() {
                        let parent = parent_frame.node;
                        lowlink[parent] = lowlink[parent].min(lowlink[v]);
                    }
                    if lowlink[v] == indices[v].unwrap() {
                        let mut component = Vec::new();
                        loop {
                            let w = stack.pop().unwrap();
                            on_stack[w] = false;
                            component.push(w);
                            if w == v {
                                break;
                            }
                        }
                        components.push(component);
                    }
                }
            }
        }

        components
    }

    /// A component is non-trivial (a real cycle) if it has more than one
    /// node, or is a single node with a self-loop.
    fn is_cyclic_component(&self, component: &[usize]) -> bool {
        if component.len() > 1 {
            return true;
        }
        let node = component[0];
        self.successors(node).contains(&node)
    }

    /// Acyclicity check (4.F). On failure, writes one sub-graph dump per
    /// non-trivial component under `<build-dir>/cyclic/<n>` for offline
    /// inspection, then returns `CyclicDependencies(n)`.
    pub fn check_acyclic(&self, build_dir: &Path) -> Result<()> {
        let components = self.tarjan_scc();
        let cyclic: Vec<&Vec<usize>> = components.iter().filter(|c| self.is_cyclic_component(c)).collect();
        if cyclic.is_empty() {
            return Ok(());
        }

        let cyclic_dir = build_dir.join(".sw").join("cyclic");
        std::fs::create_dir_all(&cyclic_dir).map_err(|e| Error::filesystem(&cyclic_dir, e))?;
        for (n, component) in cyclic.iter().enumerate() {
            let dump_path = cyclic_dir.join(n.to_string());
            let mut text = String::new();
            for &idx in component.iter() {
                text.push_str(&format!(
                    "{} {}\n",
                    self.commands[idx].program,
                    self.commands[idx].args.join(" ")
                ));
            }
            std::fs::write(&dump_path, text).map_err(|e| Error::filesystem(&dump_path, e))?;
        }

        tracing::warn!(components = cyclic.len(), dir = %cyclic_dir.display(), "cyclic command dependency detected");
        Err(Error::CyclicDependencies(cyclic.len()))
    }

    /// Kahn's algorithm with a stable tiebreak on command-key, partitioning
    /// the DAG into levels: level 0 has no prerequisites, level k+1's
    /// prerequisites all lie in levels ≤ k.
    pub fn create_execution_plan(&self, build_dir: &Path) -> Result<Vec<Vec<usize>>> {
        self.check_acyclic(build_dir)?;

        let n = self.commands.len();
        let mut in_degree = vec![0usize; n];
        for edges in &self.adjacency {
            for &v in edges {
                in_degree[v] += 1;
            }
        }

        let mut levels: Vec<Vec<usize>> = Vec::new();
        let mut remaining_in_degree = in_degree.clone();
        let mut done = vec![false; n];
        let mut done_count = 0;

        let mut frontier: Vec<usize> = (0..n).filter(|&i| remaining_in_degree[i] == 0).collect();
        frontier.sort_by_key(|&i| self.keys[i]);

        while !frontier.is_empty() {
            for &idx in &frontier {
                done[idx] = true;
            }
            done_count += frontier.len();
            levels.push(frontier.clone());

            let mut next_frontier = Vec::new();
            for &u in &frontier {
                for &v in self.successors(u) {
                    remaining_in_degree[v] -= 1;
                    if remaining_in_degree[v] == 0 && !done[v] {
                        next_frontier.push(v);
                    }
                }
            }
            next_frontier.sort_by_key(|&i| self.keys[i]);
            next_frontier.dedup();
            frontier = next_frontier;
        }

        if done_count != n {
            // check_acyclic already passed, so this can only happen from an
            // internal inconsistency between the two passes.
            return Err(Error::UnexpectedBuildState {
                current: format!("{done_count} of {n} commands leveled"),
                expected: "all commands leveled after acyclicity check passed".into(),
            });
        }

        tracing::debug!(levels = levels.len(), commands = n, "execution plan leveled");
        Ok(levels)
    }
}
