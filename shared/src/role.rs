//! Service roles and launch-order resolution
//!
//! A node process hosts exactly one role. The launcher accepts a set of
//! roles, expands it to include every role they depend on, and spawns the
//! resulting processes dependency-first.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing or resolving a role set
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoleError {
    #[error("role set is empty")]
    Empty,
    #[error("unknown role '{0}'")]
    Unknown(String),
    #[error("role dependencies form a cycle among: {0}")]
    Cycle(String),
}

/// A named service responsibility a node process can host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    /// Publishes the cluster configuration everyone else merges
    ConfigBootstrapper,
    /// Hosts session and dedicated-server actors
    Backend,
    /// Terminates player connections and bridges them into the backend
    FrontEnd,
}

impl Role {
    /// Every role in declaration order. Resolution breaks ties with this order.
    pub const ALL: [Role; 3] = [Role::ConfigBootstrapper, Role::Backend, Role::FrontEnd];

    pub fn name(self) -> &'static str {
        match self {
            Role::ConfigBootstrapper => "ConfigBootstrapper",
            Role::Backend => "Backend",
            Role::FrontEnd => "FrontEnd",
        }
    }

    /// Roles that must be running before this one is spawned
    pub fn dependencies(self) -> &'static [Role] {
        match self {
            Role::ConfigBootstrapper => &[],
            Role::Backend => &[Role::ConfigBootstrapper],
            Role::FrontEnd => &[Role::ConfigBootstrapper],
        }
    }

    /// The coordinator role reads raw local configuration instead of the
    /// merged cluster document, since it is the one writing that document.
    pub fn is_coordinator(self) -> bool {
        matches!(self, Role::ConfigBootstrapper)
    }

    pub fn flag(self) -> RoleSet {
        match self {
            Role::ConfigBootstrapper => RoleSet::CONFIG_BOOTSTRAPPER,
            Role::Backend => RoleSet::BACKEND,
            Role::FrontEnd => RoleSet::FRONT_END,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Role {
    type Err = RoleError;

    /// Case-insensitive; `_` and `-` are ignored so `front_end` parses too.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        Role::ALL
            .into_iter()
            .find(|role| role.name().to_ascii_lowercase() == normalized)
            .ok_or_else(|| RoleError::Unknown(s.trim().to_string()))
    }
}

bitflags! {
    /// A set of roles with bitset semantics
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RoleSet: u32 {
        const CONFIG_BOOTSTRAPPER = 1 << 0;
        const BACKEND = 1 << 1;
        const FRONT_END = 1 << 2;
    }
}

impl RoleSet {
    /// Parses a comma-separated role list such as `"FrontEnd, Backend"`
    pub fn parse(spec: &str) -> Result<Self, RoleError> {
        let mut set = RoleSet::empty();
        for part in spec.split(',').filter(|p| !p.trim().is_empty()) {
            set |= part.parse::<Role>()?.flag();
        }

        if set.is_empty() {
            return Err(RoleError::Empty);
        }
        Ok(set)
    }

    pub fn has(&self, role: Role) -> bool {
        self.contains(role.flag())
    }

    /// Member roles in declaration order
    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        Role::ALL.into_iter().filter(move |role| self.has(*role))
    }
}

impl From<Role> for RoleSet {
    fn from(role: Role) -> Self {
        role.flag()
    }
}

/// Expands a role set with every transitive dependency
pub fn dependency_closure(requested: RoleSet) -> RoleSet {
    let mut closure = requested;
    loop {
        let mut next = closure;
        for role in closure.roles() {
            for dep in role.dependencies() {
                next |= dep.flag();
            }
        }
        if next == closure {
            return closure;
        }
        closure = next;
    }
}

/// Returns the dependency closure of `requested` in spawn order
///
/// Every role appears after all of its dependencies. Among roles whose
/// dependencies are already satisfied, declaration order wins, so the
/// result is deterministic.
pub fn resolve_launch_order(requested: RoleSet) -> Result<Vec<Role>, RoleError> {
    if requested.is_empty() {
        return Err(RoleError::Empty);
    }
    order_with(dependency_closure(requested), |role| role.dependencies())
}

fn order_with<F>(closure: RoleSet, deps: F) -> Result<Vec<Role>, RoleError>
where
    F: Fn(Role) -> &'static [Role],
{
    let mut order = Vec::new();
    let mut placed = RoleSet::empty();

    while placed != closure {
        let ready = closure.roles().find(|role| {
            !placed.has(*role) && deps(*role).iter().all(|dep| placed.has(*dep))
        });

        match ready {
            Some(role) => {
                placed |= role.flag();
                order.push(role);
            }
            None => {
                let stuck: Vec<&str> = closure
                    .roles()
                    .filter(|role| !placed.has(*role))
                    .map(Role::name)
                    .collect();
                return Err(RoleError::Cycle(stuck.join(", ")));
            }
        }
    }

    Ok(order)
}
