//! 依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序（Kahn 算法），节点为下标，
//! 同一时刻可执行的节点按下标升序给出，保证结果确定。

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// 依赖图
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// 邻接表：节点 -> 依赖它的节点
    pub adjacency: Vec<Vec<usize>>,
    /// 入度表：节点 -> 未完成的依赖数
    pub in_degree: Vec<usize>,
}

/// 拓扑排序结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologicalOrder {
    /// 按层分组，同层节点之间没有依赖
    pub levels: Vec<Vec<usize>>,
    /// 处于环上（或依赖环）的节点，按下标升序
    pub cyclic: Vec<usize>,
}

impl TopologicalOrder {
    pub fn flatten(&self) -> Vec<usize> {
        self.levels.iter().flatten().copied().collect()
    }
}

impl DependencyGraph {
    /// `edges` 中的 `(from, to)` 表示 `to` 依赖 `from`；越界与自环忽略
    pub fn new(nodes: usize, edges: impl IntoIterator<Item = (usize, usize)>) -> Self {
        let mut adjacency = vec![Vec::new(); nodes];
        let mut in_degree = vec![0; nodes];

        for (from, to) in edges {
            if from >= nodes || to >= nodes || from == to || adjacency[from].contains(&to) {
                continue;
            }
            adjacency[from].push(to);
            in_degree[to] += 1;
        }

        Self { adjacency, in_degree }
    }

    pub fn len(&self) -> usize {
        self.in_degree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_degree.is_empty()
    }

    pub fn has_edges(&self) -> bool {
        self.adjacency.iter().any(|d| !d.is_empty())
    }

    /// 入度为 0 的节点
    pub fn ready(&self) -> Vec<usize> {
        (0..self.len()).filter(|&n| self.in_degree[n] == 0).collect()
    }

    /// 标记节点完成，返回新变为可执行的节点
    pub fn mark_completed(&mut self, node: usize) -> Vec<usize> {
        let mut newly_ready = Vec::new();
        let Some(dependents) = self.adjacency.get(node) else {
            return newly_ready;
        };
        for &dependent in dependents {
            let degree = &mut self.in_degree[dependent];
            if *degree > 0 {
                *degree -= 1;
                if *degree == 0 {
                    newly_ready.push(dependent);
                }
            }
        }
        newly_ready.sort_unstable();
        newly_ready
    }

    /// 分层拓扑排序，不修改自身
    pub fn topological_order(&self) -> TopologicalOrder {
        let mut graph = self.clone();
        let mut current: Vec<usize> = graph.ready();
        let mut visited = vec![false; self.len()];
        let mut levels = Vec::new();

        while !current.is_empty() {
            let mut next = BinaryHeap::new();
            for &node in &current {
                visited[node] = true;
                for ready in graph.mark_completed(node) {
                    next.push(Reverse(ready));
                }
            }
            levels.push(current);
            current = std::iter::from_fn(|| next.pop().map(|Reverse(n)| n)).collect();
        }

        let cyclic = (0..self.len()).filter(|&n| !visited[n]).collect();
        TopologicalOrder { levels, cyclic }
    }

    /// 真正构成环的节点组（节点数大于 1 的强连通分量，Tarjan），组内按下标升序。
    /// 只依赖环、自身不在环上的节点不包含在内。
    pub fn cycles(&self) -> Vec<Vec<usize>> {
        let mut tarjan = Tarjan {
            graph: self,
            index: vec![None; self.len()],
            low: vec![0; self.len()],
            on_stack: vec![false; self.len()],
            stack: Vec::new(),
            next: 0,
            cycles: Vec::new(),
        };
        for node in 0..self.len() {
            if tarjan.index[node].is_none() {
                tarjan.visit(node);
            }
        }
        tarjan.cycles.sort();
        tarjan.cycles
    }
}

struct Tarjan<'a> {
    graph: &'a DependencyGraph,
    index: Vec<Option<usize>>,
    low: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    next: usize,
    cycles: Vec<Vec<usize>>,
}

impl Tarjan<'_> {
    fn visit(&mut self, node: usize) {
        self.index[node] = Some(self.next);
        self.low[node] = self.next;
        self.next += 1;
        self.stack.push(node);
        self.on_stack[node] = true;

        let graph = self.graph;
        for &next in &graph.adjacency[node] {
            match self.index[next] {
                None => {
                    self.visit(next);
                    self.low[node] = self.low[node].min(self.low[next]);
                }
                Some(index) if self.on_stack[next] => self.low[node] = self.low[node].min(index),
                Some(_) => {}
            }
        }

        if self.index[node] == Some(self.low[node]) {
            let mut component = Vec::new();
            while let Some(member) = self.stack.pop() {
                self.on_stack[member] = false;
                component.push(member);
                if member == node {
                    break;
                }
            }
            if component.len() > 1 {
                component.sort_unstable();
                self.cycles.push(component);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_respect_dependencies() {
        // 0 -> 2, 1 -> 2, 2 -> 3
        let graph = DependencyGraph::new(4, [(0, 2), (1, 2), (2, 3)]);
        let order = graph.topological_order();
        assert_eq!(order.levels, vec![vec![0, 1], vec![2], vec![3]]);
        assert!(order.cyclic.is_empty());
        assert_eq!(order.flatten(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_independent_nodes_single_level() {
        let graph = DependencyGraph::new(3, []);
        assert!(!graph.has_edges());
        assert_eq!(graph.topological_order().levels, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_cycle_reported() {
        let graph = DependencyGraph::new(3, [(1, 2), (2, 1)]);
        let order = graph.topological_order();
        assert_eq!(order.levels, vec![vec![0]]);
        assert_eq!(order.cyclic, vec![1, 2]);
    }

    #[test]
    fn test_cycles_exclude_nodes_that_only_depend_on_a_cycle() {
        // 0 <-> 1 构成环，2 依赖 0；3 <-> 4 是另一个环
        let graph = DependencyGraph::new(5, [(0, 1), (1, 0), (0, 2), (3, 4), (4, 3)]);
        assert_eq!(graph.topological_order().cyclic, vec![0, 1, 2, 3, 4]);
        assert_eq!(graph.cycles(), vec![vec![0, 1], vec![3, 4]]);
        assert!(DependencyGraph::new(3, [(0, 1), (1, 2)]).cycles().is_empty());
    }

    #[test]
    fn test_mark_completed_releases_dependents() {
        let mut graph = DependencyGraph::new(3, [(0, 2), (1, 2), (0, 2)]);
        assert_eq!(graph.in_degree[2], 2);
        assert!(graph.mark_completed(0).is_empty());
        assert_eq!(graph.mark_completed(1), vec![2]);
    }
}
