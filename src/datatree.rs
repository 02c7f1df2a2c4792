//! Prefix tree over every draw sequence the runner has executed.
//!
//! Each node compresses a run of draws into parallel arrays; a node ends in a
//! [`Transition`] once we know what happens after that run of draws. The tree
//! answers three questions for the runner: which buffer prefixes are novel,
//! which prefixes are already known to overrun, and whether the whole search
//! space is exhausted.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::data::{bytes_to_int, int_to_bytes, DataObserver, Status};

/// What happens after the draws recorded in a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Several distinct values have been observed for the next draw.
    Branch {
        n_bits: u64,
        children: HashMap<u64, usize>,
    },
    /// The test concluded with this status.
    Conclusion(Status),
    /// A discarded span pruned this subtree; `next` records how the pruning
    /// run continued.
    Killed { next: usize },
}

#[derive(Debug, Default)]
struct TreeNode {
    bit_lengths: Vec<u64>,
    values: Vec<u64>,
    forced: HashSet<usize>,
    transition: Option<Transition>,
    exhausted: bool,
}

/// Radix tree of explored draw sequences.
#[derive(Debug)]
pub struct DataTree {
    nodes: Vec<TreeNode>,
    /// Set when an execution contradicts an earlier one structurally, e.g.
    /// the same prefix produced a different draw width. The runner surfaces
    /// this as a flaky test.
    inconsistent: bool,
}

const ROOT: usize = 0;

impl DataTree {
    pub fn new() -> Self {
        DataTree {
            nodes: vec![TreeNode::default()],
            inconsistent: false,
        }
    }

    /// True once an execution disagreed with the recorded structure.
    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }

    /// True when every buffer prefix leads to a known outcome.
    pub fn is_exhausted(&self) -> bool {
        self.nodes[ROOT].exhausted
    }

    /// A buffer prefix that no previous execution has followed. Must not be
    /// called on an exhausted tree.
    pub fn generate_novel_prefix(&self, rng: &mut ChaCha8Rng) -> Vec<u8> {
        assert!(!self.is_exhausted(), "tree is exhausted");
        let mut prefix = Vec::new();
        let mut current = ROOT;
        loop {
            let node = &self.nodes[current];
            debug_assert!(!node.exhausted);
            for i in 0..node.values.len() {
                let n_bits = node.bit_lengths[i];
                let value = node.values[i];
                if node.forced.contains(&i) {
                    append_draw(&mut prefix, n_bits, value);
                } else {
                    // Any value other than the recorded one leaves the tree.
                    let k = self.sample_other(rng, n_bits, value);
                    append_draw(&mut prefix, n_bits, k);
                    return prefix;
                }
            }
            match &node.transition {
                None => return prefix,
                Some(Transition::Conclusion(_)) => {
                    unreachable!("concluded node visited during novel prefix generation")
                }
                Some(Transition::Killed { next }) => {
                    current = *next;
                }
                Some(Transition::Branch { n_bits, children }) => {
                    let value = self.sample_branch(rng, *n_bits, children);
                    append_draw(&mut prefix, *n_bits, value);
                    match children.get(&value) {
                        None => return prefix,
                        Some(&child) => current = child,
                    }
                }
            }
        }
    }

    /// A random `n_bits` value different from `value`.
    fn sample_other(&self, rng: &mut ChaCha8Rng, n_bits: u64, value: u64) -> u64 {
        loop {
            let k = random_bits(rng, n_bits);
            if k != value {
                return k;
            }
        }
    }

    /// A random child value that is either unexplored or not yet exhausted.
    fn sample_branch(&self, rng: &mut ChaCha8Rng, n_bits: u64, children: &HashMap<u64, usize>) -> u64 {
        for _ in 0..10 {
            let k = random_bits(rng, n_bits);
            match children.get(&k) {
                None => return k,
                Some(&child) if !self.nodes[child].exhausted => return k,
                Some(_) => {}
            }
        }
        // Dense small branch: enumerate the viable values instead.
        if n_bits <= 20 {
            let viable: Vec<u64> = (0..(1u64 << n_bits))
                .filter(|k| match children.get(k) {
                    None => true,
                    Some(&child) => !self.nodes[child].exhausted,
                })
                .collect();
            assert!(!viable.is_empty(), "branch is exhausted");
            return viable[rng.gen_range(0..viable.len())];
        }
        loop {
            let k = random_bits(rng, n_bits);
            match children.get(&k) {
                None => return k,
                Some(&child) if !self.nodes[child].exhausted => return k,
                Some(_) => {}
            }
        }
    }

    /// Replay `buffer` against the tree without running the test. Returns the
    /// known outcome, or `None` when the buffer leaves explored territory.
    /// In particular a buffer too short for a known draw is a known overrun.
    pub fn simulate(&self, buffer: &[u8]) -> Option<Status> {
        let mut index = 0usize;
        let mut current = ROOT;
        loop {
            let node = &self.nodes[current];
            for i in 0..node.values.len() {
                let n_bits = node.bit_lengths[i];
                let n_bytes = ((n_bits + 7) / 8) as usize;
                if index + n_bytes > buffer.len() {
                    return Some(Status::Overrun);
                }
                if !node.forced.contains(&i) {
                    let drawn = masked_value(&buffer[index..index + n_bytes], n_bits);
                    if drawn != node.values[i] {
                        return None;
                    }
                }
                index += n_bytes;
            }
            match &node.transition {
                None => return None,
                Some(Transition::Conclusion(status)) => return Some(*status),
                Some(Transition::Killed { .. }) => return None,
                Some(Transition::Branch { n_bits, children }) => {
                    let n_bytes = ((n_bits + 7) / 8) as usize;
                    if index + n_bytes > buffer.len() {
                        return Some(Status::Overrun);
                    }
                    let drawn = masked_value(&buffer[index..index + n_bytes], *n_bits);
                    index += n_bytes;
                    match children.get(&drawn) {
                        None => return None,
                        Some(&child) => current = child,
                    }
                }
            }
        }
    }

    fn new_node(&mut self) -> usize {
        self.nodes.push(TreeNode::default());
        self.nodes.len() - 1
    }

    /// Split `node` so that everything after draw `i` moves to a fresh child
    /// reachable through a branch on draw `i`'s recorded value.
    fn split_at(&mut self, node: usize, i: usize) {
        let tail = self.new_node();
        let n = &mut self.nodes[node];
        let branch_bits = n.bit_lengths[i];
        let old_value = n.values[i];
        let tail_bits = n.bit_lengths.split_off(i + 1);
        let tail_values = n.values.split_off(i + 1);
        n.bit_lengths.pop();
        n.values.pop();
        let tail_forced: HashSet<usize> = n
            .forced
            .iter()
            .filter(|&&j| j > i)
            .map(|&j| j - (i + 1))
            .collect();
        n.forced.retain(|&j| j < i);
        let old_transition = n.transition.take();
        let mut children = HashMap::new();
        children.insert(old_value, tail);
        n.transition = Some(Transition::Branch {
            n_bits: branch_bits,
            children,
        });
        let t = &mut self.nodes[tail];
        t.bit_lengths = tail_bits;
        t.values = tail_values;
        t.forced = tail_forced;
        t.transition = old_transition;
        // The subtree moved wholesale, so the tail's flag can be computed
        // from its children's existing flags right away.
        self.check_exhausted(tail);
    }

    /// Recompute the cached exhaustion bit for one node.
    fn check_exhausted(&mut self, node: usize) -> bool {
        if self.nodes[node].exhausted {
            return true;
        }
        if self.nodes[node].forced.len() != self.nodes[node].values.len() {
            return false;
        }
        let exhausted = match &self.nodes[node].transition {
            None => false,
            Some(Transition::Conclusion(_)) => true,
            Some(Transition::Killed { next }) => self.nodes[*next].exhausted,
            Some(Transition::Branch { n_bits, children }) => {
                *n_bits < 64
                    && (children.len() as u128) == (1u128 << n_bits)
                    && children.values().all(|&c| self.nodes[c].exhausted)
            }
        };
        self.nodes[node].exhausted = exhausted;
        exhausted
    }

    /// Propagate exhaustion from the end of a trail towards the root.
    fn update_exhausted(&mut self, trail: &[usize]) {
        for &node in trail.iter().rev() {
            if !self.check_exhausted(node) {
                break;
            }
        }
    }
}

impl Default for DataTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Records one execution into a shared [`DataTree`].
pub struct TreeRecordingObserver {
    tree: Rc<RefCell<DataTree>>,
    current: usize,
    index_in_node: usize,
    trail: Vec<usize>,
    killed: bool,
    done: bool,
}

impl TreeRecordingObserver {
    pub fn new(tree: Rc<RefCell<DataTree>>) -> Self {
        TreeRecordingObserver {
            tree,
            current: ROOT,
            index_in_node: 0,
            trail: vec![ROOT],
            killed: false,
            done: false,
        }
    }
}

impl DataObserver for TreeRecordingObserver {
    fn draw_value(&mut self, n_bits: u64, value: u64, forced: bool) {
        if self.done {
            return;
        }
        let mut guard = self.tree.borrow_mut();
        let tree = &mut *guard;
        loop {
            let i = self.index_in_node;
            let node = &tree.nodes[self.current];
            if i < node.values.len() {
                if node.bit_lengths[i] != n_bits || (node.forced.contains(&i) != forced) {
                    tree.inconsistent = true;
                    self.done = true;
                    return;
                }
                if node.values[i] == value {
                    self.index_in_node += 1;
                    return;
                }
                if forced {
                    // A forced draw is determined by its prefix; two values
                    // for the same prefix means the test is erratic.
                    tree.inconsistent = true;
                    self.done = true;
                    return;
                }
                tree.split_at(self.current, i);
                let fresh = tree.new_node();
                if let Some(Transition::Branch { children, .. }) =
                    tree.nodes[self.current].transition.as_mut()
                {
                    children.insert(value, fresh);
                }
                self.current = fresh;
                self.index_in_node = 0;
                self.trail.push(fresh);
                return;
            }
            match tree.nodes[self.current].transition.take() {
                None => {
                    let node = &mut tree.nodes[self.current];
                    node.transition = None;
                    node.bit_lengths.push(n_bits);
                    node.values.push(value);
                    if forced {
                        node.forced.insert(i);
                    }
                    self.index_in_node += 1;
                    return;
                }
                Some(Transition::Conclusion(status)) => {
                    // An earlier run stopped here; this one keeps drawing.
                    tree.nodes[self.current].transition = Some(Transition::Conclusion(status));
                    tree.inconsistent = true;
                    self.done = true;
                    return;
                }
                Some(Transition::Killed { next }) => {
                    tree.nodes[self.current].transition = Some(Transition::Killed { next });
                    self.current = next;
                    self.index_in_node = 0;
                    self.trail.push(next);
                }
                Some(Transition::Branch { n_bits: bits, mut children }) => {
                    if bits != n_bits {
                        tree.nodes[self.current].transition = Some(Transition::Branch {
                            n_bits: bits,
                            children,
                        });
                        tree.inconsistent = true;
                        self.done = true;
                        return;
                    }
                    let child = match children.get(&value) {
                        Some(&c) => c,
                        None => {
                            let c = tree.new_node();
                            children.insert(value, c);
                            c
                        }
                    };
                    tree.nodes[self.current].transition = Some(Transition::Branch {
                        n_bits: bits,
                        children,
                    });
                    self.current = child;
                    self.index_in_node = 0;
                    self.trail.push(child);
                    return;
                }
            }
        }
    }

    fn kill_branch(&mut self) {
        if self.done || self.killed {
            return;
        }
        self.killed = true;
        let mut guard = self.tree.borrow_mut();
        let tree = &mut *guard;
        if self.index_in_node < tree.nodes[self.current].values.len() {
            // A previous run kept drawing past this point; killing here now
            // means the test is erratic.
            tree.inconsistent = true;
            self.done = true;
            return;
        }
        match tree.nodes[self.current].transition.clone() {
            None => {
                let next = tree.new_node();
                tree.nodes[self.current].transition = Some(Transition::Killed { next });
                self.current = next;
            }
            Some(Transition::Killed { next }) => {
                self.current = next;
            }
            Some(_) => {
                tree.inconsistent = true;
                self.done = true;
                return;
            }
        }
        self.index_in_node = 0;
        self.trail.push(self.current);
    }

    fn conclude(&mut self, status: Status) {
        if self.done {
            return;
        }
        self.done = true;
        // Overruns depend on the buffer size, not the draw sequence, so they
        // never conclude a tree path.
        if status == Status::Overrun {
            return;
        }
        let mut guard = self.tree.borrow_mut();
        let tree = &mut *guard;
        if self.index_in_node < tree.nodes[self.current].values.len() {
            tree.inconsistent = true;
            return;
        }
        match &tree.nodes[self.current].transition {
            None => {
                tree.nodes[self.current].transition = Some(Transition::Conclusion(status));
            }
            Some(Transition::Conclusion(existing)) => {
                if *existing != status {
                    tree.inconsistent = true;
                    return;
                }
            }
            Some(_) => {
                tree.inconsistent = true;
                return;
            }
        }
        let trail = std::mem::take(&mut self.trail);
        tree.update_exhausted(&trail);
    }
}

fn append_draw(prefix: &mut Vec<u8>, n_bits: u64, value: u64) {
    let n_bytes = ((n_bits + 7) / 8) as usize;
    prefix.extend_from_slice(&int_to_bytes(value, n_bytes));
}

fn masked_value(bytes: &[u8], n_bits: u64) -> u64 {
    let mask: u64 = if n_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << n_bits) - 1
    };
    bytes_to_int(bytes) & mask
}

fn random_bits(rng: &mut ChaCha8Rng, n_bits: u64) -> u64 {
    if n_bits == 64 {
        rng.gen::<u64>()
    } else {
        rng.gen::<u64>() & ((1u64 << n_bits) - 1)
    }
}
