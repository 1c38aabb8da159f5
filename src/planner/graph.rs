//! 任务依赖图
//!
//! 只存正向边（task -> 它等待的依赖），反向边按需构建。排序用 Kahn 算法，
//! 候选集合用 (priority, created_at, id) 作小顶堆键，保证相同输入产出相同序列。
//! 成环检测用 Tarjan 强连通分量：只有环上成员判失败，环下游留给阻塞传播处理。

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::store::task::{Task, TaskId, TaskPriority};

/// 排序键：优先级 → 创建时间 → 字典序 id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    priority: TaskPriority,
    created_at: i64,
    id: TaskId,
}

/// 依赖图（正向边）
pub struct DependencyGraph {
    /// task -> 它依赖的任务
    edges: HashMap<TaskId, Vec<TaskId>>,
    /// task -> 等待它的任务（从正向边推导）
    reverse: HashMap<TaskId, Vec<TaskId>>,
    keys: HashMap<TaskId, OrderKey>,
}

impl DependencyGraph {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut edges: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut reverse: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut keys = HashMap::new();

        for task in tasks {
            keys.insert(
                task.id.clone(),
                OrderKey {
                    priority: task.priority,
                    created_at: task.created_at,
                    id: task.id.clone(),
                },
            );
            edges.entry(task.id.clone()).or_default();
            reverse.entry(task.id.clone()).or_default();
        }
        Self {
            edges,
            reverse,
            keys,
        }
    }

    /// 登记一条依赖边：`task` 等待 `depends_on`
    pub fn add_dependency(&mut self, task: &TaskId, depends_on: &TaskId) {
        self.edges
            .entry(task.clone())
            .or_default()
            .push(depends_on.clone());
        self.reverse
            .entry(depends_on.clone())
            .or_default()
            .push(task.clone());
    }

    /// 从任务列表整体构建
    pub fn build(tasks: &[Task]) -> Self {
        let mut graph = Self::from_tasks(tasks.iter());
        for task in tasks {
            for dep in &task.dependencies {
                if graph.keys.contains_key(dep) {
                    graph.add_dependency(&task.id, dep);
                }
            }
        }
        graph
    }

    /// 直接等待 `id` 的任务
    pub fn dependents(&self, id: &str) -> Vec<TaskId> {
        self.reverse.get(id).cloned().unwrap_or_default()
    }

    /// `id` 的全部传递下游（阻塞传播用）
    pub fn transitive_dependents(&self, id: &str) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        let mut stack = self.dependents(id);
        let mut out = Vec::new();
        while let Some(node) = stack.pop() {
            if !seen.insert(node.clone()) {
                continue;
            }
            stack.extend(self.dependents(&node));
            out.push(node);
        }
        out.sort();
        out
    }

    pub fn dependencies(&self, id: &str) -> Vec<TaskId> {
        self.edges.get(id).cloned().unwrap_or_default()
    }

    /// 确定性全序：Kahn 算法，候选用 (priority, created_at, id) 小顶堆
    ///
    /// 返回 (拓扑序, 环上成员)。环上成员按 id 排序；环下游不在任何一侧，
    /// 由调用方按依赖失败传播处理。
    pub fn topo_order(&self) -> (Vec<TaskId>, Vec<TaskId>) {
        let mut in_degree: HashMap<&TaskId, usize> = HashMap::new();
        for id in self.keys.keys() {
            in_degree.insert(id, 0);
        }
        for (task, deps) in &self.edges {
            if let Some(d) = in_degree.get_mut(task) {
                *d = deps.len();
            }
        }

        let mut heap: BinaryHeap<Reverse<&OrderKey>> = self
            .keys
            .iter()
            .filter(|(id, _)| in_degree.get(id) == Some(&0))
            .map(|(_, key)| Reverse(key))
            .collect();

        let mut order = Vec::with_capacity(self.keys.len());
        while let Some(Reverse(key)) = heap.pop() {
            order.push(key.id.clone());
            for dependent in self.dependents(&key.id) {
                if let Some(d) = in_degree.get_mut(&dependent) {
                    *d -= 1;
                    if *d == 0 {
                        heap.push(Reverse(&self.keys[&dependent]));
                    }
                }
            }
        }

        if order.len() == self.keys.len() {
            return (order, Vec::new());
        }

        let ordered: HashSet<&TaskId> = order.iter().collect();
        let leftover: HashSet<TaskId> = self
            .keys
            .keys()
            .filter(|id| !ordered.contains(*id))
            .cloned()
            .collect();
        let mut cyclic = self.cycle_members(&leftover);
        cyclic.sort();
        (order, cyclic)
    }

    /// Tarjan 强连通分量，限定在 Kahn 剩余子图内；返回环上成员
    fn cycle_members(&self, scope: &HashSet<TaskId>) -> Vec<TaskId> {
        #[derive(Default)]
        struct TarjanState {
            index: u32,
            indices: HashMap<TaskId, u32>,
            lowlinks: HashMap<TaskId, u32>,
            on_stack: HashSet<TaskId>,
            stack: Vec<TaskId>,
            members: Vec<TaskId>,
        }

        // 迭代版 DFS，避免深图递归爆栈
        enum Frame {
            Enter(TaskId),
            Exit(TaskId, usize),
        }

        let mut st = TarjanState::default();
        for start in scope {
            if st.indices.contains_key(start) {
                continue;
            }
            let mut frames = vec![Frame::Enter(start.clone())];
            while let Some(frame) = frames.pop() {
                match frame {
                    Frame::Enter(node) => {
                        if st.indices.contains_key(&node) {
                            continue;
                        }
                        st.indices.insert(node.clone(), st.index);
                        st.lowlinks.insert(node.clone(), st.index);
                        st.index += 1;
                        st.stack.push(node.clone());
                        st.on_stack.insert(node.clone());
                        frames.push(Frame::Exit(node.clone(), 0));
                    }
                    Frame::Exit(node, next_child) => {
                        let deps: Vec<TaskId> = self
                            .dependencies(&node)
                            .into_iter()
                            .filter(|d| scope.contains(d))
                            .collect();
                        if next_child < deps.len() {
                            let child = deps[next_child].clone();
                            frames.push(Frame::Exit(node.clone(), next_child + 1));
                            if !st.indices.contains_key(&child) {
                                frames.push(Frame::Enter(child));
                            } else if st.on_stack.contains(&child) {
                                let low = st.lowlinks[&node].min(st.indices[&child]);
                                st.lowlinks.insert(node.clone(), low);
                            }
                            continue;
                        }
                        // 回传 lowlink 给父节点
                        for dep in &deps {
                            if st.lowlinks.contains_key(dep) && st.on_stack.contains(dep) {
                                let low = st.lowlinks[&node].min(st.lowlinks[dep]);
                                st.lowlinks.insert(node.clone(), low);
                            }
                        }
                        if st.lowlinks[&node] == st.indices[&node] {
                            let mut component = Vec::new();
                            while let Some(top) = st.stack.pop() {
                                st.on_stack.remove(&top);
                                let done = top == node;
                                component.push(top);
                                if done {
                                    break;
                                }
                            }
                            let self_loop = component.len() == 1
                                && self.dependencies(&component[0]).contains(&component[0]);
                            if component.len() > 1 || self_loop {
                                st.members.extend(component);
                            }
                        }
                    }
                }
            }
        }
        st.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::task::Task;

    fn task(id: &str, deps: &[&str], created_at: i64) -> Task {
        Task::new(id, id, "test task")
            .with_dependencies(deps.iter().map(|s| s.to_string()).collect())
            .with_created_at(created_at)
    }

    #[test]
    fn test_diamond_order() {
        // B→A, C→A, D→{B,C}，创建顺序 A,B,C,D
        let tasks = vec![
            task("A", &[], 1),
            task("B", &["A"], 2),
            task("C", &["A"], 3),
            task("D", &["B", "C"], 4),
        ];
        let graph = DependencyGraph::build(&tasks);
        let (order, cyclic) = graph.topo_order();
        assert!(cyclic.is_empty());
        assert_eq!(order, vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_order_is_deterministic() {
        let tasks = vec![
            task("z", &[], 5),
            task("m", &[], 5),
            task("a", &["m"], 1),
        ];
        let graph = DependencyGraph::build(&tasks);
        let (first, _) = graph.topo_order();
        for _ in 0..10 {
            let graph = DependencyGraph::build(&tasks);
            let (again, _) = graph.topo_order();
            assert_eq!(first, again);
        }
        // 同优先级同时刻按 id 字典序
        assert_eq!(first, vec!["m", "z", "a"]);
    }

    #[test]
    fn test_priority_breaks_ties() {
        use crate::store::task::TaskPriority;
        let tasks = vec![
            task("slow", &[], 1),
            Task::new("urgent", "urgent", "x")
                .with_priority(TaskPriority::High)
                .with_created_at(9),
            Task::new("later", "later", "x")
                .with_priority(TaskPriority::Low)
                .with_created_at(0),
        ];
        let graph = DependencyGraph::build(&tasks);
        let (order, _) = graph.topo_order();
        assert_eq!(order, vec!["urgent", "slow", "later"]);
    }

    #[test]
    fn test_simple_cycle_detected() {
        let tasks = vec![task("P", &["Q"], 1), task("Q", &["P"], 2)];
        let graph = DependencyGraph::build(&tasks);
        let (order, cyclic) = graph.topo_order();
        assert!(order.is_empty());
        assert_eq!(cyclic, vec!["P", "Q"]);
    }

    #[test]
    fn test_self_loop_detected() {
        let tasks = vec![task("A", &["A"], 1), task("B", &[], 2)];
        let graph = DependencyGraph::build(&tasks);
        let (order, cyclic) = graph.topo_order();
        assert_eq!(order, vec!["B"]);
        assert_eq!(cyclic, vec!["A"]);
    }

    #[test]
    fn test_cycle_downstream_not_marked_cyclic() {
        // X 依赖环 {P,Q}，X 本身不在环上
        let tasks = vec![
            task("P", &["Q"], 1),
            task("Q", &["P"], 2),
            task("X", &["P"], 3),
        ];
        let graph = DependencyGraph::build(&tasks);
        let (order, cyclic) = graph.topo_order();
        assert!(order.is_empty());
        assert_eq!(cyclic, vec!["P", "Q"]);
    }

    #[test]
    fn test_acyclic_remainder_still_ordered() {
        let tasks = vec![
            task("P", &["Q"], 1),
            task("Q", &["P"], 2),
            task("free", &[], 3),
        ];
        let graph = DependencyGraph::build(&tasks);
        let (order, cyclic) = graph.topo_order();
        assert_eq!(order, vec!["free"]);
        assert_eq!(cyclic, vec!["P", "Q"]);
    }

    #[test]
    fn test_transitive_dependents() {
        let tasks = vec![
            task("A", &[], 1),
            task("B", &["A"], 2),
            task("C", &["B"], 3),
            task("D", &["A"], 4),
        ];
        let graph = DependencyGraph::build(&tasks);
        let downstream = graph.transitive_dependents("A");
        assert_eq!(downstream, vec!["B", "C", "D"]);
        assert_eq!(graph.transitive_dependents("C"), Vec::<String>::new());
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let tasks = vec![
            task("A", &[], 1),
            task("B", &["A"], 2),
            task("C", &["A", "B"], 3),
        ];
        let graph = DependencyGraph::build(&tasks);
        let (_, cyclic) = graph.topo_order();
        assert!(cyclic.is_empty());
    }
}
