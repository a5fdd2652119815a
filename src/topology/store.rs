use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::transport::{ExchangeHandle, QueueHandle};

#[derive(Debug, Clone)]
enum Slot<H> {
    /// A declare is in flight; the receiver closes once it settles.
    Pending(watch::Receiver<()>),
    Declared(H),
}

#[derive(Debug)]
struct Ledger<K: Eq + Hash, H> {
    kind: &'static str,
    slots: DashMap<K, Slot<H>>,
}

impl<K, H> Ledger<K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Clone,
{
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            slots: DashMap::new(),
        }
    }

    fn reserve(&self, key: K) -> Reservation<'_, K, H> {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(slot) => match slot.get() {
                Slot::Declared(handle) => Reservation::Declared(handle.clone()),
                Slot::Pending(settled) => {
                    debug!(kind = self.kind, ?key, "waiting on in-flight declaration");
                    Reservation::InFlight(InFlight {
                        ledger: self,
                        key,
                        settled: settled.clone(),
                    })
                }
            },
            Entry::Vacant(slot) => {
                let (notify, settled) = watch::channel(());
                slot.insert(Slot::Pending(settled));
                Reservation::Claimed(Claim {
                    ledger: self,
                    key,
                    settled: false,
                    _notify: notify,
                })
            }
        }
    }

    fn get(&self, key: &K) -> Option<H> {
        self.slots.get(key).and_then(|slot| match &*slot {
            Slot::Declared(handle) => Some(handle.clone()),
            Slot::Pending(_) => None,
        })
    }

    fn declared(&self) -> Vec<K>
    where
        K: Ord,
    {
        let mut keys: Vec<K> = self
            .slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Declared(_)))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

/// Outcome of asking the store for one resource.
#[derive(Debug)]
pub enum Reservation<'a, K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Clone,
{
    /// This caller holds the claim and must declare the resource.
    Claimed(Claim<'a, K, H>),
    /// Already declared in this store.
    Declared(H),
    /// Another task is declaring it.
    InFlight(InFlight<'a, K, H>),
}

impl<K, H> Reservation<'_, K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Clone,
{
    /// Resolves to the recorded handle.
    ///
    /// `declare` runs only when this caller holds the claim. An in-flight
    /// declaration is awaited; if it fails, `abandoned` builds the error.
    pub async fn resolve<F, Fut, E>(
        self,
        declare: F,
        abandoned: impl FnOnce() -> E,
    ) -> Result<H, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<H, E>>,
    {
        match self {
            Reservation::Declared(handle) => Ok(handle),
            Reservation::InFlight(pending) => pending.settled().await.ok_or_else(abandoned),
            Reservation::Claimed(claim) => {
                let handle = declare().await?;
                claim.confirm(handle.clone());
                Ok(handle)
            }
        }
    }
}

/// Exclusive right to declare one resource.
///
/// Dropping a claim without [`confirm`](Claim::confirm) releases the name so a
/// later provisioning pass can try again. Either way, tasks waiting on the
/// claim are woken.
#[derive(Debug)]
pub struct Claim<'a, K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Clone,
{
    ledger: &'a Ledger<K, H>,
    key: K,
    settled: bool,
    // Dropped after the slot is updated, which closes the waiters' receivers.
    _notify: watch::Sender<()>,
}

impl<K, H> Claim<'_, K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Records the resource as declared.
    pub fn confirm(mut self, handle: H) {
        self.ledger
            .slots
            .insert(self.key.clone(), Slot::Declared(handle));
        self.settled = true;
    }
}

impl<K, H> Drop for Claim<'_, K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Clone,
{
    fn drop(&mut self) {
        if !self.settled {
            self.ledger
                .slots
                .remove_if(&self.key, |_, slot| matches!(slot, Slot::Pending(_)));
            debug!(kind = self.ledger.kind, key = ?self.key, "claim released");
        }
    }
}

/// A declaration held by another task.
#[derive(Debug)]
pub struct InFlight<'a, K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Clone,
{
    ledger: &'a Ledger<K, H>,
    key: K,
    settled: watch::Receiver<()>,
}

impl<K, H> InFlight<'_, K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Clone,
{
    /// Waits for the holder to settle. `None` if its declaration failed.
    pub async fn settled(mut self) -> Option<H> {
        // Nothing is ever sent; this returns once the holder's sender drops.
        let _ = self.settled.changed().await;
        self.ledger.get(&self.key)
    }
}

/// One queue bound to one exchange under one routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingKey {
    pub queue: String,
    pub exchange: String,
    pub key: String,
}

/// Session-scoped record of declared exchanges, queues and bindings.
#[derive(Debug)]
pub struct ProvisioningStore {
    exchanges: Ledger<String, ExchangeHandle>,
    queues: Ledger<String, QueueHandle>,
    bindings: Ledger<BindingKey, ()>,
}

impl Default for ProvisioningStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisioningStore {
    pub fn new() -> Self {
        Self {
            exchanges: Ledger::new("exchange"),
            queues: Ledger::new("queue"),
            bindings: Ledger::new("binding"),
        }
    }

    /// Atomically claims `name` unless it is declared or being declared.
    pub fn claim_exchange(&self, name: &str) -> Reservation<'_, String, ExchangeHandle> {
        self.exchanges.reserve(name.to_string())
    }

    pub fn claim_queue(&self, name: &str) -> Reservation<'_, String, QueueHandle> {
        self.queues.reserve(name.to_string())
    }

    pub fn claim_binding(&self, binding: BindingKey) -> Reservation<'_, BindingKey, ()> {
        self.bindings.reserve(binding)
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeHandle> {
        self.exchanges.get(&name.to_string())
    }

    pub fn queue(&self, name: &str) -> Option<QueueHandle> {
        self.queues.get(&name.to_string())
    }

    pub fn is_bound(&self, binding: &BindingKey) -> bool {
        self.bindings.get(binding).is_some()
    }

    /// Names of declared exchanges, sorted.
    pub fn declared_exchanges(&self) -> Vec<String> {
        self.exchanges.declared()
    }

    pub fn declared_queues(&self) -> Vec<String> {
        self.queues.declared()
    }

    pub fn declared_bindings(&self) -> Vec<BindingKey> {
        self.bindings.declared()
    }
}
