mod admission;
mod availability;
mod error;
mod mutations;
mod queries;
mod transaction;

pub use admission::{
    AdmissionSettings, BookingRequest, CustomerRef, CustomerResolver, GuestCustomerResolver,
    DEFAULT_BOOKING_NOTES, GUEST_CUSTOMER_NAME,
};
pub use availability::{active_demand, peak_demand, remaining_units};
pub use error::{AdmissionError, EngineError};
pub use transaction::{Transaction, TxError};

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedProductState = Arc<RwLock<ProductState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Maintenance(WalMaintenance),
}

/// Everything the writer does besides appending.
pub(super) enum WalMaintenance {
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Commit, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to every sender with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (commit, response) = match cmd {
            WalCommand::Append { commit, response } => (commit, response),
            WalCommand::Maintenance(task) => {
                handle_maintenance(&mut wal, task);
                continue;
            }
        };
        let mut batch = vec![(commit, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                Ok(WalCommand::Maintenance(task)) => {
                    // Flush what we have before compaction sees the file.
                    deferred = Some(task);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, &mut batch);
        if let Some(task) = deferred {
            handle_maintenance(&mut wal, task);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("wal {}: flush failed for {} commits: {e}", wal.path().display(), batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// All-or-nothing: on any error the whole batch is discarded, so a commit
/// whose caller saw a failure can never be written by a later flush.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(commit, _)| wal.append_buffered(commit))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.discard_unflushed()
    {
        tracing::error!("wal {}: could not discard failed batch: {e}", wal.path().display());
    }
    result
}

fn handle_maintenance(wal: &mut Wal, task: WalMaintenance) {
    match task {
        WalMaintenance::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalMaintenance::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, commit: Commit) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append { commit, response: tx })
        .await
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::WalError(e.to_string()))
}

// ── In-memory stores ─────────────────────────────────────

/// Inventory ledger and booking store for one business.
#[derive(Default)]
pub(super) struct Stores {
    pub(super) products: DashMap<Ulid, SharedProductState>,
    /// asset id → product id
    pub(super) asset_index: DashMap<Ulid, Ulid>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    pub(super) customers: DashMap<Ulid, Customer>,
}

impl Stores {
    fn product(&self, id: &Ulid) -> Option<SharedProductState> {
        self.products.get(id).map(|e| e.value().clone())
    }

    /// Products whose lock must be held to apply `event`.
    fn event_products(&self, event: &Event) -> Vec<Ulid> {
        match event {
            Event::AssetAdded { product_id, .. } | Event::AssetStatusChanged { product_id, .. } => {
                vec![*product_id]
            }
            Event::BookingCreated { booking } => booking.product_ids(),
            Event::BookingStatusChanged { id, .. } => self
                .bookings
                .get(id)
                .map(|b| b.product_ids())
                .unwrap_or_default(),
            Event::ProductCreated { .. } | Event::CustomerCreated { .. } => Vec::new(),
        }
    }

    /// Apply one event. The caller holds the write locks of every product it touches.
    fn apply(&self, event: &Event, locks: &mut LockSet) {
        match event {
            Event::ProductCreated {
                id,
                name,
                price_per_day,
            } => {
                let product = Product {
                    id: *id,
                    name: name.clone(),
                    price_per_day: *price_per_day,
                };
                self.products
                    .insert(*id, Arc::new(RwLock::new(ProductState::new(product))));
            }
            Event::AssetAdded {
                id,
                product_id,
                identifier,
                status,
            } => {
                let Some(ps) = locks.get_mut(product_id) else {
                    tracing::warn!("asset {id}: product {product_id} not locked, skipped");
                    return;
                };
                ps.add_asset(Asset {
                    id: *id,
                    product_id: *product_id,
                    identifier: identifier.clone(),
                    status: *status,
                });
                self.asset_index.insert(*id, *product_id);
            }
            Event::AssetStatusChanged {
                id,
                product_id,
                status,
            } => {
                if let Some(ps) = locks.get_mut(product_id) {
                    ps.set_asset_status(id, *status);
                }
            }
            Event::CustomerCreated { id, name, email } => {
                self.customers.insert(
                    *id,
                    Customer {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                    },
                );
            }
            Event::BookingCreated { booking } => {
                for product_id in booking.product_ids() {
                    let Some(ps) = locks.get_mut(&product_id) else {
                        tracing::warn!("booking {}: product {product_id} not locked, skipped", booking.id);
                        continue;
                    };
                    ps.insert_reservation(Reservation {
                        booking_id: booking.id,
                        span: booking.span,
                        units: booking.units_of(&product_id),
                        status: booking.status,
                        version: 0,
                    });
                }
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingStatusChanged { id, status } => {
                let Some(mut booking) = self.bookings.get_mut(id) else {
                    tracing::warn!("status change for unknown booking {id}, skipped");
                    return;
                };
                for product_id in booking.product_ids() {
                    if let Some(ps) = locks.get_mut(&product_id) {
                        ps.set_reservation_status(id, *status);
                    }
                }
                booking.status = *status;
            }
        }
    }
}

// ── Ordered product locks ────────────────────────────────

pub(super) enum LockError {
    Missing(Ulid),
    Deadline,
}

/// Write guards over a set of products, always acquired in ascending id order.
pub(super) struct LockSet {
    guards: BTreeMap<Ulid, OwnedRwLockWriteGuard<ProductState>>,
}

impl LockSet {
    pub(super) fn empty() -> Self {
        Self {
            guards: BTreeMap::new(),
        }
    }

    pub(super) async fn acquire(
        stores: &Stores,
        ids: BTreeSet<Ulid>,
        deadline: Option<Instant>,
    ) -> Result<Self, LockError> {
        let mut guards = BTreeMap::new();
        for id in ids {
            let state = stores.product(&id).ok_or(LockError::Missing(id))?;
            let guard = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, state.write_owned())
                    .await
                    .map_err(|_| LockError::Deadline)?,
                None => state.write_owned().await,
            };
            guards.insert(id, guard);
        }
        Ok(Self { guards })
    }

    /// Replay path: we're the sole owner of every lock, so try_write always succeeds.
    /// Never block here, this may run inside an async context (lazy tenant creation).
    fn uncontended(stores: &Stores, ids: Vec<Ulid>) -> io::Result<Self> {
        let mut guards = BTreeMap::new();
        for id in ids {
            let Some(state) = stores.product(&id) else {
                continue;
            };
            let guard = state
                .try_write_owned()
                .map_err(|_| io::Error::other(format!("replay: product {id} lock contended")))?;
            guards.insert(id, guard);
        }
        Ok(Self { guards })
    }

    pub(super) fn get(&self, id: &Ulid) -> Option<&ProductState> {
        self.guards.get(id).map(|g| &**g)
    }

    fn get_mut(&mut self, id: &Ulid) -> Option<&mut ProductState> {
        self.guards.get_mut(id).map(|g| &mut **g)
    }
}

// ── Engine ───────────────────────────────────────────────

/// State and commit pipeline of one business.
pub struct Engine {
    pub(super) stores: Arc<Stores>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold it shared; compaction holds it exclusively.
    pub(super) commit_gate: Arc<RwLock<()>>,
    /// Serializes id-keyed catalog inserts (products, assets, customers).
    pub(super) catalog_lock: Mutex<()>,
    pub(super) customer_resolver: Arc<dyn CustomerResolver>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let stores = Stores::default();
        for commit in &commits {
            // Events are applied one at a time: a compacted commit creates a
            // product and then adds its assets.
            for event in &commit.events {
                let mut locks = LockSet::uncontended(&stores, stores.event_products(event))?;
                stores.apply(event, &mut locks);
            }
        }
        tracing::debug!(
            "wal {}: replayed {} commits, {} products, {} bookings",
            wal_path.display(),
            commits.len(),
            stores.products.len(),
            stores.bookings.len()
        );

        Ok(Self {
            stores: Arc::new(stores),
            wal_tx,
            commit_gate: Arc::new(RwLock::new(())),
            catalog_lock: Mutex::new(()),
            customer_resolver: Arc::new(GuestCustomerResolver),
        })
    }

    /// Swap the customer-resolution policy used by admission.
    pub fn with_customer_resolver(mut self, resolver: Arc<dyn CustomerResolver>) -> Self {
        self.customer_resolver = resolver;
        self
    }

    pub fn get_product(&self, id: &Ulid) -> Option<SharedProductState> {
        self.stores.product(id)
    }

    pub(super) async fn enter_gate(
        &self,
        deadline: Option<Instant>,
    ) -> Result<OwnedRwLockReadGuard<()>, LockError> {
        let gate = self.commit_gate.clone().read_owned();
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, gate)
                .await
                .map_err(|_| LockError::Deadline),
            None => Ok(gate.await),
        }
    }

    /// WAL-append then apply, on a task of its own: once started, a commit
    /// finishes even if the caller is dropped, so memory and log never diverge.
    pub(super) async fn persist(
        &self,
        gate: OwnedRwLockReadGuard<()>,
        mut locks: LockSet,
        commit: Commit,
    ) -> Result<(), EngineError> {
        let stores = self.stores.clone();
        let wal_tx = self.wal_tx.clone();
        let durable = tokio::spawn(async move {
            wal_append(&wal_tx, commit.clone()).await?;
            for event in &commit.events {
                stores.apply(event, &mut locks);
            }
            drop(locks);
            drop(gate);
            Ok::<(), EngineError>(())
        });
        durable
            .await
            .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    /// Rewrite the log as the minimal set of commits recreating current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let commits = self.snapshot_commits().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Maintenance(WalMaintenance::Compact {
                commits,
                response: tx,
            }))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    async fn snapshot_commits(&self) -> Vec<Commit> {
        let products: Vec<SharedProductState> =
            self.stores.products.iter().map(|e| e.value().clone()).collect();
        let mut commits = Vec::with_capacity(products.len());
        for state in products {
            let ps = state.read().await;
            let mut events = vec![Event::ProductCreated {
                id: ps.product.id,
                name: ps.product.name.clone(),
                price_per_day: ps.product.price_per_day,
            }];
            events.extend(ps.assets.iter().map(|a| Event::AssetAdded {
                id: a.id,
                product_id: a.product_id,
                identifier: a.identifier.clone(),
                status: a.status,
            }));
            commits.push(Commit { events });
        }

        let mut customers: Vec<Customer> =
            self.stores.customers.iter().map(|e| e.value().clone()).collect();
        customers.sort_by_key(|c| c.id);
        commits.extend(customers.into_iter().map(|c| {
            Commit::single(Event::CustomerCreated {
                id: c.id,
                name: c.name,
                email: c.email,
            })
        }));

        let mut bookings: Vec<Booking> =
            self.stores.bookings.iter().map(|e| e.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        commits.extend(
            bookings
                .into_iter()
                .map(|booking| Commit::single(Event::BookingCreated { booking })),
        );
        commits
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::Maintenance(WalMaintenance::AppendsSinceCompact { response: tx }))
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
