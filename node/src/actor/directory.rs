//! On-demand activation of actors by key, with idle collection

use super::{spawn_actor, Actor, ActorId, ActorRef};
use log::debug;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

type Factory<A> = Box<dyn Fn(u64) -> A + Send + Sync>;

/// Actors of one kind addressed by a stable key
///
/// `get` activates an actor the first time its key is used. Idle, unpinned
/// actors are deactivated by `collect_idle`; the next `get` for the same key
/// activates a fresh instance.
pub struct ActorDirectory<A: Actor> {
    actors: RwLock<HashMap<u64, ActorRef<A>>>,
    factory: Factory<A>,
}

impl<A: Actor> ActorDirectory<A> {
    pub fn new(factory: impl Fn(u64) -> A + Send + Sync + 'static) -> Self {
        Self {
            actors: RwLock::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    pub async fn get(&self, key: u64) -> ActorRef<A> {
        if let Some(existing) = self.lookup(key).await {
            return existing;
        }

        let mut actors = self.actors.write().await;
        match actors.get(&key) {
            Some(existing) if existing.is_active() => existing.clone(),
            _ => {
                let actor = spawn_actor(key, (self.factory)(key));
                debug!("Activated {}", actor.id());
                actors.insert(key, actor.clone());
                actor
            }
        }
    }

    /// Returns the actor only if it is currently active
    pub async fn lookup(&self, key: u64) -> Option<ActorRef<A>> {
        let actors = self.actors.read().await;
        actors.get(&key).filter(|a| a.is_active()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.actors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Deactivates every unpinned actor idle for at least `idle_timeout`
    pub async fn collect_idle(&self, idle_timeout: Duration) -> Vec<ActorId> {
        let mut actors = self.actors.write().await;
        let mut collected = Vec::new();

        actors.retain(|_, actor| {
            let cell = actor.cell();
            let idle = !cell.is_pinned() && !cell.is_busy() && cell.idle_for() >= idle_timeout;
            if idle || !actor.is_active() {
                cell.deactivate();
                collected.push(actor.id());
                false
            } else {
                true
            }
        });

        for id in &collected {
            debug!("Deactivated idle actor {}", id);
        }
        collected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::CallChain;
    use crate::error::ActorError;

    struct Slot {
        key: u64,
        hits: u32,
    }

    impl Actor for Slot {
        const KIND: &'static str = "Slot";
    }

    fn directory() -> ActorDirectory<Slot> {
        ActorDirectory::new(|key| Slot { key, hits: 0 })
    }

    async fn hit(actor: &ActorRef<Slot>) -> Result<(u64, u32), ActorError> {
        actor
            .call(&CallChain::root(), |turn| async move {
                let mut slot = turn.state().await;
                slot.hits += 1;
                Ok((slot.key, slot.hits))
            })
            .await
    }

    #[tokio::test]
    async fn test_get_activates_once_per_key() {
        let dir = directory();
        assert!(dir.lookup(9).await.is_none());

        let first = dir.get(9).await;
        let second = dir.get(9).await;
        assert_eq!(hit(&first).await.unwrap(), (9, 1));
        assert_eq!(hit(&second).await.unwrap(), (9, 2));
        assert_eq!(dir.len().await, 1);
    }

    #[tokio::test]
    async fn test_idle_actors_are_collected_unless_pinned() {
        let dir = directory();
        let idle = dir.get(1).await;
        let pinned = dir.get(2).await;
        pinned
            .call(&CallChain::root(), |turn| async move {
                turn.pin();
                Ok(())
            })
            .await
            .unwrap();

        let collected = dir.collect_idle(Duration::ZERO).await;
        assert_eq!(collected, vec![idle.id()]);
        assert!(matches!(hit(&idle).await, Err(ActorError::Stopped(_))));
        assert!(hit(&pinned).await.is_ok());

        // A fresh activation starts from a clean state
        let revived = dir.get(1).await;
        assert_eq!(hit(&revived).await.unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn test_recently_used_actors_survive_collection() {
        let dir = directory();
        let actor = dir.get(3).await;
        hit(&actor).await.unwrap();

        assert!(dir.collect_idle(Duration::from_secs(60)).await.is_empty());
        assert!(dir.lookup(3).await.is_some());
    }
}
