use std::collections::BTreeSet;

use thiserror::Error;
use tokio::time::Instant;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::remaining_units;
use super::{Engine, EngineError, LockError, LockSet};

#[derive(Debug, Error)]
pub enum TxError {
    /// A read this transaction depends on was invalidated by a concurrent commit.
    #[error("serialization conflict on product {product_id}")]
    Conflict { product_id: Ulid },
    #[error("transaction deadline exceeded")]
    Timeout,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<LockError> for TxError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Missing(id) => TxError::Engine(EngineError::NotFound(id)),
            LockError::Deadline => TxError::Timeout,
        }
    }
}

/// What a transaction observed: the product's version when it read `window`.
#[derive(Debug, Clone, Copy)]
struct ReadPredicate {
    product_id: Ulid,
    window: Span,
    observed: u64,
}

/// Scoped unit of work against one engine.
///
/// Reads record predicates, writes are buffered. `commit` validates the
/// predicates under the product locks and makes every buffered write durable
/// as a single WAL frame. Dropping the handle without committing discards
/// the buffered writes.
pub struct Transaction<'e> {
    engine: &'e Engine,
    reads: Vec<ReadPredicate>,
    writes: Vec<Event>,
    touched: BTreeSet<Ulid>,
    deadline: Option<Instant>,
    finished: bool,
}

impl Engine {
    /// Open a transaction. `deadline` bounds every lock wait inside it.
    pub fn begin(&self, deadline: Option<Instant>) -> Transaction<'_> {
        Transaction {
            engine: self,
            reads: Vec::new(),
            writes: Vec::new(),
            touched: BTreeSet::new(),
            deadline,
            finished: false,
        }
    }
}

impl<'e> Transaction<'e> {
    pub fn engine(&self) -> &'e Engine {
        self.engine
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Availability of `product_id` over `window`, recorded as a read predicate.
    /// Unknown products read as `exists = false` and record nothing.
    pub async fn remaining(&mut self, product_id: Ulid, window: Span) -> Result<Availability, TxError> {
        let Some(state) = self.engine.get_product(&product_id) else {
            return Ok(Availability::missing());
        };
        let availability = {
            let guard = match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, state.read())
                    .await
                    .map_err(|_| TxError::Timeout)?,
                None => state.read().await,
            };
            self.reads.push(ReadPredicate {
                product_id,
                window,
                observed: guard.version,
            });
            remaining_units(&guard, &window)
        };
        Ok(availability)
    }

    /// The product record. Name and price never change, so no predicate is kept.
    pub async fn product(&self, product_id: &Ulid) -> Result<Option<Product>, TxError> {
        let Some(state) = self.engine.get_product(product_id) else {
            return Ok(None);
        };
        let guard = match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, state.read())
                .await
                .map_err(|_| TxError::Timeout)?,
            None => state.read().await,
        };
        Ok(Some(guard.product.clone()))
    }

    /// Customers are never deleted, so a hit stays valid until commit.
    pub fn customer(&self, id: &Ulid) -> Option<Customer> {
        if let Some(staged) = self.writes.iter().find_map(|e| match e {
            Event::CustomerCreated { id: cid, name, email } if cid == id => Some(Customer {
                id: *cid,
                name: name.clone(),
                email: email.clone(),
            }),
            _ => None,
        }) {
            return Some(staged);
        }
        self.engine.stores.customers.get(id).map(|c| c.value().clone())
    }

    /// Stage a new customer under a fresh id.
    pub fn create_customer(&mut self, name: String, email: Option<String>) -> Ulid {
        let id = Ulid::new();
        self.writes.push(Event::CustomerCreated { id, name, email });
        id
    }

    pub fn insert_booking(&mut self, booking: Booking) {
        self.touched.extend(booking.product_ids());
        self.writes.push(Event::BookingCreated { booking });
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    /// Validate every read predicate and make the buffered writes durable.
    pub async fn commit(mut self) -> Result<(), TxError> {
        if self.writes.is_empty() {
            self.finished = true;
            return Ok(());
        }

        let gate = self.engine.enter_gate(self.deadline).await?;
        let mut ids = self.touched.clone();
        ids.extend(self.reads.iter().map(|r| r.product_id));
        let locks = LockSet::acquire(&self.engine.stores, ids, self.deadline).await?;

        for read in &self.reads {
            let Some(ps) = locks.get(&read.product_id) else {
                continue;
            };
            if ps.changed_since(read.observed, &read.window) {
                return Err(TxError::Conflict {
                    product_id: read.product_id,
                });
            }
        }
        self.check_limits(&locks)?;

        let events = std::mem::take(&mut self.writes);
        self.engine.persist(gate, locks, Commit { events }).await?;
        self.finished = true;
        Ok(())
    }

    fn check_limits(&self, locks: &LockSet) -> Result<(), EngineError> {
        for product_id in &self.touched {
            if let Some(ps) = locks.get(product_id)
                && ps.reservations.len() >= MAX_RESERVATIONS_PER_PRODUCT
            {
                return Err(EngineError::LimitExceeded("too many reservations on product"));
            }
        }
        let new_customers = self
            .writes
            .iter()
            .filter(|e| matches!(e, Event::CustomerCreated { .. }))
            .count();
        if new_customers > 0 && self.engine.stores.customers.len() + new_customers > MAX_CUSTOMERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many customers"));
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.writes.is_empty() {
            tracing::debug!(
                "transaction rolled back: {} staged writes discarded",
                self.writes.len()
            );
        }
    }
}
