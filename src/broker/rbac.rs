//! RBAC request prioritisation
//!
//! Roles never deny access here; they only decide queue order. The broker is
//! handed an ordered role list at construction (rank = index, 0 is served
//! first) and sorts each request into the queue of the role named in its
//! authorization token. Requests without a token, or with a role outside the
//! list, go to the default queue, which is served last.
//!
//! Token format: `RBAC=<ROLE>,<signature>`; only the role is interpreted.

use std::collections::VecDeque;

/// Prefix of an RBAC authorization token
pub const TOKEN_PREFIX: &[u8] = b"RBAC=";

/// Ordered set of roles; a role's rank is its position
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RbacRoleSet {
    roles: Vec<String>,
}

impl RbacRoleSet {
    /// Build a role set, highest priority first; duplicates keep their first rank
    pub fn new<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for role in roles {
            let role = role.into();
            if !unique.iter().any(|r| r.eq_ignore_ascii_case(&role)) {
                unique.push(role);
            }
        }
        Self { roles: unique }
    }

    /// Roles in rank order
    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Rank of a role name (case-insensitive)
    pub fn rank(&self, role: &str) -> Option<usize> {
        self.roles.iter().position(|r| r.eq_ignore_ascii_case(role))
    }

    /// Rank of the role carried by an authorization token
    pub fn rank_of_token(&self, token: Option<&[u8]>) -> Option<usize> {
        token.and_then(role_from_token).and_then(|role| self.rank(role))
    }
}

/// Extract the role from `RBAC=<ROLE>,<signature>`
pub fn role_from_token(token: &[u8]) -> Option<&str> {
    let rest = token.strip_prefix(TOKEN_PREFIX)?;
    let role = match rest.iter().position(|b| *b == b',') {
        Some(comma) => &rest[..comma],
        None => rest,
    };
    let role = std::str::from_utf8(role).ok()?.trim();
    if role.is_empty() {
        None
    } else {
        Some(role)
    }
}

/// One FIFO per rank plus a default FIFO
#[derive(Debug)]
pub struct PriorityQueues<T> {
    ranked: Vec<VecDeque<T>>,
    default: VecDeque<T>,
    len: usize,
}

impl<T> PriorityQueues<T> {
    /// Queues for `ranks` ranked roles
    pub fn new(ranks: usize) -> Self {
        Self {
            ranked: (0..ranks).map(|_| VecDeque::new()).collect(),
            default: VecDeque::new(),
            len: 0,
        }
    }

    /// Enqueue into the rank's queue; `None` or an out-of-range rank uses the default queue
    pub fn push(&mut self, rank: Option<usize>, item: T) {
        match rank.and_then(|r| self.ranked.get_mut(r)) {
            Some(queue) => queue.push_back(item),
            None => self.default.push_back(item),
        }
        self.len += 1;
    }

    /// Head of the highest ranked non-empty queue, falling back to the default queue
    pub fn pop_next(&mut self) -> Option<T> {
        let item = self
            .ranked
            .iter_mut()
            .find(|queue| !queue.is_empty())
            .and_then(VecDeque::pop_front)
            .or_else(|| self.default.pop_front());
        if item.is_some() {
            self.len -= 1;
        }
        item
    }

    /// Total queued items
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Items queued under one rank (`None` = default queue)
    pub fn len_of(&self, rank: Option<usize>) -> usize {
        match rank {
            Some(r) => self.ranked.get(r).map_or(0, VecDeque::len),
            None => self.default.len(),
        }
    }

    /// Remove everything, highest priority first
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.len);
        while let Some(item) = self.pop_next() {
            items.push(item);
        }
        items
    }
}
