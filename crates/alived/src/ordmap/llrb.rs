// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Left-leaning red-black tree used as the storage of [`super::OrderedMap`].
//!
//! Every value sits behind its own `parking_lot::Mutex` so that holders of a
//! shared lock on the tree shape can still mutate payloads one entry at a time.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::fmt::{self, Write as _};
use std::mem;

pub type Comparator<K> = fn(&K, &K) -> Ordering;

pub(crate) type Link<K, V> = Option<Box<Node<K, V>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Color {
    Red,
    Black,
}

impl Color {
    fn flipped(self) -> Self {
        match self {
            Color::Red => Color::Black,
            Color::Black => Color::Red,
        }
    }
}

pub(crate) struct Node<K, V> {
    pub(crate) key: K,
    pub(crate) value: Mutex<V>,
    color: Color,
    left: Link<K, V>,
    right: Link<K, V>,
}

impl<K, V> Node<K, V> {
    fn new(key: K, value: V) -> Box<Self> {
        Box::new(Self {
            key,
            value: Mutex::new(value),
            color: Color::Red,
            left: None,
            right: None,
        })
    }
}

/// Result of [`Tree::upsert`].
pub(crate) enum Upsert<R> {
    Inserted(R),
    Updated(R),
    Declined,
}

pub(crate) struct Tree<K, V> {
    root: Link<K, V>,
    cmp: Comparator<K>,
}

fn is_red<K, V>(link: &Link<K, V>) -> bool {
    matches!(link, Some(node) if node.color == Color::Red)
}

fn left_left_red<K, V>(h: &Node<K, V>) -> bool {
    h.left.as_ref().is_some_and(|l| is_red(&l.left))
}

fn right_left_red<K, V>(h: &Node<K, V>) -> bool {
    h.right.as_ref().is_some_and(|r| is_red(&r.left))
}

fn rotate_left<K, V>(mut h: Box<Node<K, V>>) -> Box<Node<K, V>> {
    let Some(mut x) = h.right.take() else {
        return h;
    };
    h.right = x.left.take();
    x.color = h.color;
    h.color = Color::Red;
    x.left = Some(h);
    x
}

fn rotate_right<K, V>(mut h: Box<Node<K, V>>) -> Box<Node<K, V>> {
    let Some(mut x) = h.left.take() else {
        return h;
    };
    h.left = x.right.take();
    x.color = h.color;
    h.color = Color::Red;
    x.right = Some(h);
    x
}

fn flip_colors<K, V>(h: &mut Node<K, V>) {
    h.color = h.color.flipped();
    if let Some(l) = h.left.as_mut() {
        l.color = l.color.flipped();
    }
    if let Some(r) = h.right.as_mut() {
        r.color = r.color.flipped();
    }
}

fn fix_up<K, V>(mut h: Box<Node<K, V>>) -> Box<Node<K, V>> {
    if is_red(&h.right) {
        h = rotate_left(h);
    }
    if is_red(&h.left) && left_left_red(&h) {
        h = rotate_right(h);
    }
    if is_red(&h.left) && is_red(&h.right) {
        flip_colors(&mut h);
    }
    h
}

fn move_red_left<K, V>(mut h: Box<Node<K, V>>) -> Box<Node<K, V>> {
    flip_colors(&mut h);
    if right_left_red(&h) {
        if let Some(r) = h.right.take() {
            h.right = Some(rotate_right(r));
        }
        h = rotate_left(h);
        flip_colors(&mut h);
    }
    h
}

fn move_red_right<K, V>(mut h: Box<Node<K, V>>) -> Box<Node<K, V>> {
    flip_colors(&mut h);
    if left_left_red(&h) {
        h = rotate_right(h);
        flip_colors(&mut h);
    }
    h
}

fn rebalance<K, V>(link: &mut Link<K, V>) {
    if let Some(node) = link.take() {
        *link = Some(fix_up(node));
    }
}

fn upsert_at<K: Clone, V, R>(
    link: &mut Link<K, V>,
    key: &K,
    cmp: Comparator<K>,
    new_fn: impl FnOnce() -> Option<(V, R)>,
    existing_fn: impl FnOnce(&mut V) -> R,
) -> Upsert<R> {
    let outcome = match link {
        None => {
            return match new_fn() {
                Some((value, r)) => {
                    *link = Some(Node::new(key.clone(), value));
                    Upsert::Inserted(r)
                }
                None => Upsert::Declined,
            };
        }
        Some(node) => match cmp(key, &node.key) {
            Ordering::Equal => return Upsert::Updated(existing_fn(node.value.get_mut())),
            Ordering::Less => upsert_at(&mut node.left, key, cmp, new_fn, existing_fn),
            Ordering::Greater => upsert_at(&mut node.right, key, cmp, new_fn, existing_fn),
        },
    };
    if matches!(outcome, Upsert::Inserted(_)) {
        rebalance(link);
    }
    outcome
}

/// Detach the minimum of the subtree; returns the remaining subtree and the node.
fn delete_min<K, V>(mut h: Box<Node<K, V>>) -> (Link<K, V>, Box<Node<K, V>>) {
    let Some(left) = h.left.as_ref() else {
        let rest = h.right.take();
        return (rest, h);
    };
    if left.color != Color::Red && !is_red(&left.left) {
        h = move_red_left(h);
    }
    match h.left.take() {
        Some(left) => {
            let (rest, min) = delete_min(left);
            h.left = rest;
            (Some(fix_up(h)), min)
        }
        None => {
            let rest = h.right.take();
            (rest, h)
        }
    }
}

fn remove_at<K, V>(
    mut h: Box<Node<K, V>>,
    key: &K,
    cmp: Comparator<K>,
) -> (Link<K, V>, Option<Box<Node<K, V>>>) {
    if cmp(key, &h.key) == Ordering::Less {
        let Some(left) = h.left.as_ref() else {
            return (Some(fix_up(h)), None);
        };
        if left.color != Color::Red && !is_red(&left.left) {
            h = move_red_left(h);
        }
        let removed = match h.left.take() {
            Some(left) => {
                let (rest, removed) = remove_at(left, key, cmp);
                h.left = rest;
                removed
            }
            None => None,
        };
        return (Some(fix_up(h)), removed);
    }

    if is_red(&h.left) {
        h = rotate_right(h);
    }
    if cmp(key, &h.key) == Ordering::Equal && h.right.is_none() {
        let rest = h.left.take();
        return (rest, Some(h));
    }
    if let Some(right) = h.right.as_ref() {
        if right.color != Color::Red && !is_red(&right.left) {
            h = move_red_right(h);
        }
    }

    if cmp(key, &h.key) == Ordering::Equal {
        match h.right.take() {
            Some(right) => {
                let (rest, mut min) = delete_min(right);
                h.right = rest;
                mem::swap(&mut h.key, &mut min.key);
                mem::swap(&mut h.value, &mut min.value);
                (Some(fix_up(h)), Some(min))
            }
            None => {
                let rest = h.left.take();
                (rest, Some(h))
            }
        }
    } else {
        let removed = match h.right.take() {
            Some(right) => {
                let (rest, removed) = remove_at(right, key, cmp);
                h.right = rest;
                removed
            }
            None => None,
        };
        (Some(fix_up(h)), removed)
    }
}

fn walk_node<K, V>(link: &Link<K, V>, f: &mut impl FnMut(&K, &Mutex<V>)) {
    if let Some(node) = link {
        walk_node(&node.left, f);
        f(&node.key, &node.value);
        walk_node(&node.right, f);
    }
}

fn batch_node<K, V>(
    link: &Link<K, V>,
    keys: &[&K],
    cmp: Comparator<K>,
    f: &mut impl FnMut(&K, &Mutex<V>),
) {
    let Some(node) = link else {
        return;
    };
    if keys.is_empty() {
        return;
    }

    // keys[..split] sort before this node; an equal key (and its duplicates)
    // is consumed here; the rest belong to the right subtree.
    let mut split = 0;
    let mut matched = false;
    while split < keys.len() {
        match cmp(keys[split], &node.key) {
            Ordering::Less => split += 1,
            Ordering::Equal => {
                matched = true;
                break;
            }
            Ordering::Greater => break,
        }
    }

    batch_node(&node.left, &keys[..split], cmp, f);

    let mut rest = split;
    if matched {
        f(&node.key, &node.value);
        while rest < keys.len() && cmp(keys[rest], &node.key) == Ordering::Equal {
            rest += 1;
        }
    }

    batch_node(&node.right, &keys[rest..], cmp, f);
}

fn dump_node<K: fmt::Display, V>(link: &Link<K, V>, out: &mut String) {
    if let Some(node) = link {
        let color = match node.color {
            Color::Red => 'R',
            Color::Black => 'B',
        };
        let _ = write!(out, "({} {})", node.key, color);
        out.push('[');
        dump_node(&node.left, out);
        out.push_str("][");
        dump_node(&node.right, out);
        out.push(']');
    }
}

impl<K, V> Tree<K, V> {
    pub(crate) fn new(cmp: Comparator<K>) -> Self {
        Self { root: None, cmp }
    }

    pub(crate) fn comparator(&self) -> Comparator<K> {
        self.cmp
    }

    pub(crate) fn get(&self, key: &K) -> Option<&Node<K, V>> {
        let mut cur = self.root.as_deref();
        while let Some(node) = cur {
            cur = match (self.cmp)(key, &node.key) {
                Ordering::Equal => return Some(node),
                Ordering::Less => node.left.as_deref(),
                Ordering::Greater => node.right.as_deref(),
            };
        }
        None
    }

    pub(crate) fn get_mut(&mut self, key: &K) -> Option<&mut Node<K, V>> {
        let cmp = self.cmp;
        let mut cur = self.root.as_deref_mut();
        while let Some(node) = cur {
            cur = match cmp(key, &node.key) {
                Ordering::Equal => return Some(node),
                Ordering::Less => node.left.as_deref_mut(),
                Ordering::Greater => node.right.as_deref_mut(),
            };
        }
        None
    }

    pub(crate) fn upsert<R>(
        &mut self,
        key: &K,
        new_fn: impl FnOnce() -> Option<(V, R)>,
        existing_fn: impl FnOnce(&mut V) -> R,
    ) -> Upsert<R>
    where
        K: Clone,
    {
        let outcome = upsert_at(&mut self.root, key, self.cmp, new_fn, existing_fn);
        if let Some(root) = self.root.as_mut() {
            root.color = Color::Black;
        }
        outcome
    }

    /// Unlink `key`. The caller checks presence first.
    pub(crate) fn remove(&mut self, key: &K) -> Option<(K, V)> {
        let mut root = self.root.take()?;
        if !is_red(&root.left) && !is_red(&root.right) {
            root.color = Color::Red;
        }
        let (rest, removed) = remove_at(root, key, self.cmp);
        self.root = rest;
        if let Some(root) = self.root.as_mut() {
            root.color = Color::Black;
        }
        removed.map(|node| {
            let node = *node;
            (node.key, node.value.into_inner())
        })
    }

    pub(crate) fn walk(&self, mut f: impl FnMut(&K, &Mutex<V>)) {
        walk_node(&self.root, &mut f);
    }

    /// Visit each stored key present in `sorted_keys` (ascending) once.
    pub(crate) fn batch(&self, sorted_keys: &[&K], mut f: impl FnMut(&K, &Mutex<V>)) {
        batch_node(&self.root, sorted_keys, self.cmp, &mut f);
    }

    pub(crate) fn dump(&self) -> String
    where
        K: fmt::Display,
    {
        let mut out = String::new();
        dump_node(&self.root, &mut out);
        out
    }

    /// Check ordering and red-black shape; returns the black height.
    #[cfg(test)]
    pub(crate) fn assert_balanced(&self) -> usize
    where
        K: fmt::Debug,
    {
        fn check<K: fmt::Debug, V>(link: &Link<K, V>, cmp: Comparator<K>) -> usize {
            let Some(node) = link else {
                return 1;
            };
            assert!(!is_red(&node.right), "right-leaning red at {:?}", node.key);
            if node.color == Color::Red {
                assert!(!is_red(&node.left), "red-red chain at {:?}", node.key);
            }
            if let Some(l) = &node.left {
                assert_eq!(cmp(&l.key, &node.key), Ordering::Less);
            }
            if let Some(r) = &node.right {
                assert_eq!(cmp(&r.key, &node.key), Ordering::Greater);
            }
            let lh = check(&node.left, cmp);
            let rh = check(&node.right, cmp);
            assert_eq!(lh, rh, "black height mismatch at {:?}", node.key);
            lh + usize::from(node.color == Color::Black)
        }
        assert!(!is_red(&self.root), "red root");
        check(&self.root, self.cmp)
    }
}
