//! Arena-allocated search tree for LATS.
//!
//! Nodes live in one `Vec`; a node's parent is an index and its children
//! are an owned list of indices. The tree is discarded when the search
//! returns.

use serde::{Deserialize, Serialize};

/// A candidate next action proposed during expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Candidate {
    Tool {
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    Answer {
        text: String,
    },
}

impl Candidate {
    pub fn describe(&self) -> String {
        match self {
            Candidate::Tool { name, args } => format!("{name}({args})"),
            Candidate::Answer { text } => format!("answer: {text}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchNode {
    pub id: usize,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub depth: usize,
    /// Action taken to reach this node; `None` only at the root
    pub action: Option<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    /// Whether the action's tool call failed
    pub failed: bool,
    pub visits: u32,
    /// Sum of rewards credited to this node
    pub value: f64,
    /// This node's own reflection reward
    pub reward: f64,
    /// No further expansion below this node
    pub terminal: bool,
    /// The reflection judged the task solved here
    pub solved: bool,
}

impl SearchNode {
    pub fn mean_value(&self) -> f64 {
        if self.visits == 0 {
            0.0
        } else {
            self.value / self.visits as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchTree {
    nodes: Vec<SearchNode>,
    exploration_weight: f64,
}

impl SearchTree {
    pub fn new(exploration_weight: f64) -> Self {
        Self {
            nodes: vec![SearchNode {
                id: 0,
                parent: None,
                children: Vec::new(),
                depth: 0,
                action: None,
                observation: None,
                failed: false,
                visits: 0,
                value: 0.0,
                reward: 0.0,
                terminal: false,
                solved: false,
            }],
            exploration_weight,
        }
    }

    pub const ROOT: usize = 0;

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&SearchNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut SearchNode> {
        self.nodes.get_mut(id)
    }

    pub fn nodes(&self) -> &[SearchNode] {
        &self.nodes
    }

    /// Upper confidence bound of `id` relative to its parent. Unvisited
    /// nodes score infinity so they are tried first.
    pub fn ucb(&self, id: usize) -> f64 {
        let node = &self.nodes[id];
        if node.visits == 0 {
            return f64::INFINITY;
        }
        let parent_visits = node
            .parent
            .map(|p| self.nodes[p].visits)
            .unwrap_or(node.visits)
            .max(1) as f64;
        node.mean_value()
            + self.exploration_weight * (parent_visits.ln() / node.visits as f64).sqrt()
    }

    /// Whether nothing below `id` can be expanded any more.
    pub fn is_exhausted(&self, id: usize, max_depth: usize) -> bool {
        let node = &self.nodes[id];
        if node.terminal || node.depth >= max_depth {
            return true;
        }
        !node.children.is_empty()
            && node
                .children
                .iter()
                .all(|&c| self.is_exhausted(c, max_depth))
    }

    /// Descend from the root by highest UCB to an expandable leaf.
    /// Returns `None` once the whole tree is exhausted.
    pub fn select(&self, max_depth: usize) -> Option<usize> {
        let mut current = Self::ROOT;
        if self.is_exhausted(current, max_depth) {
            return None;
        }
        loop {
            let node = &self.nodes[current];
            if node.children.is_empty() {
                return Some(current);
            }
            current = node
                .children
                .iter()
                .copied()
                .filter(|&c| !self.is_exhausted(c, max_depth))
                .max_by(|&a, &b| self.ucb(a).total_cmp(&self.ucb(b)))?;
        }
    }

    /// Add a child for `action` under `parent` and return its index.
    pub fn add_child(&mut self, parent: usize, action: Candidate) -> usize {
        let id = self.nodes.len();
        let depth = self.nodes[parent].depth + 1;
        self.nodes.push(SearchNode {
            id,
            parent: Some(parent),
            children: Vec::new(),
            depth,
            action: Some(action),
            observation: None,
            failed: false,
            visits: 0,
            value: 0.0,
            reward: 0.0,
            terminal: false,
            solved: false,
        });
        self.nodes[parent].children.push(id);
        id
    }

    /// Credit one simulation to each of `children` with its own reward,
    /// then propagate the batch up the ancestor chain of `parent`: every
    /// ancestor gains one visit per simulation and the best reward per
    /// visit. After this an ancestor's visit count equals the number of
    /// simulations run anywhere in its subtree.
    pub fn backpropagate(&mut self, parent: usize, children: &[usize]) {
        let mut best = 0.0f64;
        for &c in children {
            let node = &mut self.nodes[c];
            node.visits += 1;
            node.value += node.reward;
            best = best.max(node.reward);
        }
        let simulations = children.len() as u32;
        let mut current = Some(parent);
        while let Some(id) = current {
            let node = &mut self.nodes[id];
            node.visits += simulations;
            node.value += best * simulations as f64;
            current = node.parent;
        }
    }

    /// Indices from the root to `id`, root first.
    pub fn path(&self, id: usize) -> Vec<usize> {
        let mut path = vec![id];
        let mut current = self.nodes[id].parent;
        while let Some(p) = current {
            path.push(p);
            current = self.nodes[p].parent;
        }
        path.reverse();
        path
    }

    /// The highest-reward non-root node, solved nodes first. Ties go to
    /// the node created first.
    pub fn best_leaf(&self) -> Option<usize> {
        self.nodes
            .iter()
            .skip(1)
            .max_by(|a, b| {
                a.solved
                    .cmp(&b.solved)
                    .then(a.reward.total_cmp(&b.reward))
                    .then(b.id.cmp(&a.id))
            })
            .map(|n| n.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> Candidate {
        Candidate::Tool {
            name: name.into(),
            args: json!({}),
        }
    }

    /// Simulations credited to `id`'s own subtree: one per non-root node.
    fn subtree_simulations(tree: &SearchTree, id: usize) -> u32 {
        let node = tree.get(id).unwrap();
        let own = u32::from(node.parent.is_some());
        own + node
            .children
            .iter()
            .map(|&c| subtree_simulations(tree, c))
            .sum::<u32>()
    }

    fn expand(tree: &mut SearchTree, parent: usize, rewards: &[f64]) -> Vec<usize> {
        let children: Vec<usize> = rewards
            .iter()
            .map(|&r| {
                let id = tree.add_child(parent, tool("t"));
                tree.get_mut(id).unwrap().reward = r;
                id
            })
            .collect();
        tree.backpropagate(parent, &children);
        children
    }

    #[test]
    fn visits_equal_subtree_simulations() {
        let mut tree = SearchTree::new(std::f64::consts::SQRT_2);
        let first = expand(&mut tree, SearchTree::ROOT, &[0.2, 0.6, 0.4]);
        let second = expand(&mut tree, first[1], &[0.5, 0.9]);
        expand(&mut tree, second[0], &[0.1, 0.3, 0.7, 0.2]);
        expand(&mut tree, first[0], &[0.8]);

        for node in tree.nodes() {
            assert_eq!(node.visits, subtree_simulations(&tree, node.id), "node {}", node.id);
        }
        assert_eq!(tree.get(SearchTree::ROOT).unwrap().visits, 10);
    }

    #[test]
    fn backpropagation_is_monotonic_along_path() {
        let mut tree = SearchTree::new(1.0);
        let first = expand(&mut tree, SearchTree::ROOT, &[0.5, 0.5]);
        let before: Vec<u32> = tree.path(first[0]).iter().map(|&i| tree.get(i).unwrap().visits).collect();
        let leaf = expand(&mut tree, first[0], &[0.9])[0];
        let after: Vec<u32> = tree.path(first[0]).iter().map(|&i| tree.get(i).unwrap().visits).collect();
        for (b, a) in before.iter().zip(&after) {
            assert!(a > b);
        }
        assert_eq!(tree.path(leaf), vec![0, first[0], leaf]);
        // Best reward of the batch is credited per simulation.
        assert!((tree.get(first[0]).unwrap().value - (0.5 + 0.9)).abs() < 1e-9);
    }

    #[test]
    fn select_prefers_unvisited_then_ucb() {
        let mut tree = SearchTree::new(0.0);
        assert_eq!(tree.select(5), Some(SearchTree::ROOT));
        let children = expand(&mut tree, SearchTree::ROOT, &[0.1, 0.9]);
        // Pure exploitation picks the higher mean.
        assert_eq!(tree.select(5), Some(children[1]));

        let fresh = tree.add_child(children[0], tool("new"));
        assert_eq!(tree.ucb(fresh), f64::INFINITY);
    }

    #[test]
    fn exhausted_tree_selects_nothing() {
        let mut tree = SearchTree::new(1.0);
        let children = expand(&mut tree, SearchTree::ROOT, &[0.3, 0.4]);
        for c in &children {
            tree.get_mut(*c).unwrap().terminal = true;
        }
        assert_eq!(tree.select(5), None);

        let mut shallow = SearchTree::new(1.0);
        expand(&mut shallow, SearchTree::ROOT, &[0.3]);
        assert_eq!(shallow.select(1), None);
    }

    #[test]
    fn best_leaf_prefers_solved() {
        let mut tree = SearchTree::new(1.0);
        let children = expand(&mut tree, SearchTree::ROOT, &[0.95, 0.7]);
        tree.get_mut(children[1]).unwrap().solved = true;
        assert_eq!(tree.best_leaf(), Some(children[1]));
        assert_eq!(SearchTree::new(1.0).best_leaf(), None);
    }
}
