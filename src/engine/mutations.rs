use std::collections::BTreeSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, LockError, LockSet};

impl From<LockError> for EngineError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Missing(id) => EngineError::NotFound(id),
            // Maintenance paths wait without a deadline.
            LockError::Deadline => EngineError::WalError("lock deadline exceeded".into()),
        }
    }
}

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

impl Engine {
    // ── Inventory ledger ─────────────────────────────────

    pub async fn create_product(
        &self,
        id: Ulid,
        name: String,
        price_per_day: Cents,
    ) -> Result<Product, EngineError> {
        check_name(&name, "product name too long")?;
        let _catalog = self.catalog_lock.lock().await;
        if self.stores.products.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.stores.products.len() >= MAX_PRODUCTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many products"));
        }

        let gate = self.enter_gate(None).await?;
        let event = Event::ProductCreated {
            id,
            name: name.clone(),
            price_per_day,
        };
        self.persist(gate, LockSet::empty(), Commit::single(event)).await?;
        tracing::debug!("product {id} created: {name}");
        Ok(Product {
            id,
            name,
            price_per_day,
        })
    }

    pub async fn add_asset(
        &self,
        id: Ulid,
        product_id: Ulid,
        identifier: String,
        status: AssetStatus,
    ) -> Result<Asset, EngineError> {
        check_name(&identifier, "asset identifier too long")?;
        let _catalog = self.catalog_lock.lock().await;
        if self.stores.asset_index.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let gate = self.enter_gate(None).await?;
        let locks = LockSet::acquire(&self.stores, BTreeSet::from([product_id]), None).await?;
        if locks
            .get(&product_id)
            .is_some_and(|ps| ps.assets.len() >= MAX_ASSETS_PER_PRODUCT)
        {
            return Err(EngineError::LimitExceeded("too many assets on product"));
        }

        let asset = Asset {
            id,
            product_id,
            identifier,
            status,
        };
        let event = Event::AssetAdded {
            id,
            product_id,
            identifier: asset.identifier.clone(),
            status,
        };
        self.persist(gate, locks, Commit::single(event)).await?;
        Ok(asset)
    }

    /// Move an asset in or out of the bookable pool. Existing bookings are
    /// untouched; availability simply reflects the new total.
    pub async fn set_asset_status(&self, asset_id: Ulid, status: AssetStatus) -> Result<Asset, EngineError> {
        let product_id = self
            .stores
            .asset_index
            .get(&asset_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(asset_id))?;

        let gate = self.enter_gate(None).await?;
        let locks = LockSet::acquire(&self.stores, BTreeSet::from([product_id]), None).await?;
        let mut asset = locks
            .get(&product_id)
            .and_then(|ps| ps.assets.iter().find(|a| a.id == asset_id).cloned())
            .ok_or(EngineError::NotFound(asset_id))?;

        let event = Event::AssetStatusChanged {
            id: asset_id,
            product_id,
            status,
        };
        self.persist(gate, locks, Commit::single(event)).await?;
        asset.status = status;
        tracing::debug!("asset {asset_id} is now {}", status.as_str());
        Ok(asset)
    }

    // ── Customers ────────────────────────────────────────

    pub async fn create_customer(
        &self,
        id: Ulid,
        name: String,
        email: Option<String>,
    ) -> Result<Customer, EngineError> {
        check_name(&name, "customer name too long")?;
        if let Some(email) = &email {
            check_name(email, "customer email too long")?;
        }
        let _catalog = self.catalog_lock.lock().await;
        if self.stores.customers.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.stores.customers.len() >= MAX_CUSTOMERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many customers"));
        }

        let gate = self.enter_gate(None).await?;
        let event = Event::CustomerCreated {
            id,
            name: name.clone(),
            email: email.clone(),
        };
        self.persist(gate, LockSet::empty(), Commit::single(event)).await?;
        Ok(Customer { id, name, email })
    }

    // ── Booking lifecycle ────────────────────────────────

    /// Apply one step of the booking state machine.
    pub async fn transition_booking(&self, id: Ulid, to: BookingStatus) -> Result<Booking, EngineError> {
        // The product set of a booking never changes, so it can be read before locking.
        let product_ids: BTreeSet<Ulid> = self
            .stores
            .bookings
            .get(&id)
            .map(|b| b.product_ids().into_iter().collect())
            .ok_or(EngineError::NotFound(id))?;

        let gate = self.enter_gate(None).await?;
        let locks = LockSet::acquire(&self.stores, product_ids, None).await?;
        let from = self
            .stores
            .bookings
            .get(&id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(id))?;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }

        self.persist(gate, locks, Commit::single(Event::BookingStatusChanged { id, status: to }))
            .await?;
        tracing::debug!("booking {id}: {from} -> {to}");
        self.stores
            .bookings
            .get(&id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn confirm_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Confirmed).await
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Completed).await
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Cancelled).await
    }
}
