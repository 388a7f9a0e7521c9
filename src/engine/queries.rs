use ulid::Ulid;

use crate::model::*;

use super::availability::{peak_demand, remaining_units};
use super::{Engine, SharedProductState};

impl Engine {
    /// Unvalidated availability read. Unknown products report `exists = false`.
    pub async fn remaining(&self, product_id: &Ulid, window: &Span) -> Availability {
        let Some(state) = self.get_product(product_id) else {
            return Availability::missing();
        };
        let guard = state.read().await;
        remaining_units(&guard, window)
    }

    /// Highest number of units held at any instant of `window`.
    pub async fn peak_demand(&self, product_id: &Ulid, window: &Span) -> Option<u32> {
        let state = self.get_product(product_id)?;
        let guard = state.read().await;
        Some(peak_demand(&guard, window))
    }

    pub async fn get_product_info(&self, product_id: &Ulid) -> Option<ProductInfo> {
        let state = self.get_product(product_id)?;
        let guard = state.read().await;
        Some(product_info(&guard))
    }

    /// Every product of the business, ordered by name.
    pub async fn list_products(&self) -> Vec<ProductInfo> {
        let states: Vec<SharedProductState> =
            self.stores.products.iter().map(|e| e.value().clone()).collect();
        let mut products = Vec::with_capacity(states.len());
        for state in states {
            products.push(product_info(&*state.read().await));
        }
        products.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        products
    }

    pub async fn list_assets(&self, product_id: &Ulid) -> Option<Vec<Asset>> {
        let state = self.get_product(product_id)?;
        let guard = state.read().await;
        Some(guard.assets.clone())
    }

    pub fn get_customer(&self, id: &Ulid) -> Option<Customer> {
        self.stores.customers.get(id).map(|c| c.value().clone())
    }

    /// Every customer, ordered by name.
    pub fn list_customers(&self) -> Vec<Customer> {
        let mut customers: Vec<Customer> =
            self.stores.customers.iter().map(|e| e.value().clone()).collect();
        customers.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        customers
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.stores.bookings.get(id).map(|b| b.value().clone())
    }

    /// Dashboard listing: Pending, Confirmed and Completed bookings
    /// overlapping `window`, ordered by start.
    pub fn list_bookings(&self, window: &Span) -> Vec<Booking> {
        let mut bookings: Vec<Booking> = self
            .stores
            .bookings
            .iter()
            .filter(|b| b.status.is_active() && b.span.overlaps(window))
            .map(|b| b.value().clone())
            .collect();
        bookings.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        bookings
    }

    pub fn product_count(&self) -> usize {
        self.stores.products.len()
    }

    pub fn booking_count(&self) -> usize {
        self.stores.bookings.len()
    }
}

fn product_info(ps: &ProductState) -> ProductInfo {
    ProductInfo {
        id: ps.product.id,
        name: ps.product.name.clone(),
        price_per_day: ps.product.price_per_day,
        quantity: ps.total_capacity(),
    }
}
