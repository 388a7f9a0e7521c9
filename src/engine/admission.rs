use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::retry::RetryPolicy;

use super::{AdmissionError, Engine, Transaction, TxError};

pub const GUEST_CUSTOMER_NAME: &str = "Guest Customer";
pub const DEFAULT_BOOKING_NOTES: &str = "Online booking";

/// Who the booking is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomerRef {
    /// A customer already on file with this business.
    Existing(Ulid),
    /// A one-off customer created alongside the booking.
    Guest { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub product_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    /// Signed so that zero and negative requests reach validation.
    pub quantity: i64,
    pub customer: Option<CustomerRef>,
    pub notes: Option<String>,
}

impl BookingRequest {
    pub fn new(product_id: Ulid, start: Ms, end: Ms, quantity: i64) -> Self {
        Self {
            product_id,
            start,
            end,
            quantity,
            customer: None,
            notes: None,
        }
    }
}

/// Retry budget and time budget applied to every admission.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionSettings {
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: Duration::from_millis(2_000),
        }
    }
}

/// Decides which customer a new booking belongs to. Runs inside the
/// admission transaction, so any customer it stages commits or rolls back
/// together with the booking.
#[async_trait]
pub trait CustomerResolver: Send + Sync {
    async fn resolve(
        &self,
        customer: Option<&CustomerRef>,
        tx: &mut Transaction<'_>,
    ) -> Result<Ulid, AdmissionError>;
}

/// Reuse a customer on file, otherwise create a one-off guest record named
/// after the guest, or `GUEST_CUSTOMER_NAME` when no usable name was given.
pub struct GuestCustomerResolver;

#[async_trait]
impl CustomerResolver for GuestCustomerResolver {
    async fn resolve(
        &self,
        customer: Option<&CustomerRef>,
        tx: &mut Transaction<'_>,
    ) -> Result<Ulid, AdmissionError> {
        match customer {
            Some(CustomerRef::Existing(id)) => tx
                .customer(id)
                .map(|c| c.id)
                .ok_or(AdmissionError::CustomerNotFound(*id)),
            // A blank guest name counts as no name at all.
            Some(CustomerRef::Guest { name }) if !name.trim().is_empty() => {
                Ok(tx.create_customer(name.trim().to_string(), None))
            }
            Some(CustomerRef::Guest { .. }) | None => {
                Ok(tx.create_customer(GUEST_CUSTOMER_NAME.to_string(), None))
            }
        }
    }
}

// ── Validation ───────────────────────────────────────────

pub(super) fn validate_window(start: Ms, end: Ms, max_width: Ms) -> Result<Span, AdmissionError> {
    let Some(window) = Span::try_new(start, end) else {
        return Err(AdmissionError::InvalidRange(format!(
            "start ({start}) must be strictly before end ({end})"
        )));
    };
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(AdmissionError::InvalidRange("timestamp out of supported range".into()));
    }
    if window.duration_ms() > max_width {
        return Err(AdmissionError::LimitExceeded("window too wide"));
    }
    Ok(window)
}

pub(super) fn validate_quantity(quantity: i64) -> Result<u32, AdmissionError> {
    if quantity < 1 {
        return Err(AdmissionError::InvalidQuantity(format!(
            "quantity must be a positive integer, got {quantity}"
        )));
    }
    if quantity > i64::from(MAX_QUANTITY) {
        return Err(AdmissionError::InvalidQuantity(format!(
            "quantity must not exceed {MAX_QUANTITY}, got {quantity}"
        )));
    }
    Ok(quantity as u32)
}

enum AttemptError {
    Tx(TxError),
    Rejected(AdmissionError),
}

impl From<TxError> for AttemptError {
    fn from(e: TxError) -> Self {
        AttemptError::Tx(e)
    }
}

impl Engine {
    /// Read-only availability check with input validation.
    pub async fn availability(
        &self,
        product_id: Ulid,
        start: Ms,
        end: Ms,
        quantity: i64,
    ) -> Result<Availability, AdmissionError> {
        let window = validate_window(start, end, MAX_QUERY_WINDOW_MS)?;
        validate_quantity(quantity)?;
        Ok(self.remaining(&product_id, &window).await)
    }

    /// Admit a booking: validate, then check-and-commit inside one
    /// transaction, retrying serialization conflicts within `policy`.
    /// The whole call is bounded by `timeout`.
    pub async fn create_booking(
        &self,
        request: BookingRequest,
        policy: &RetryPolicy,
        timeout: Duration,
    ) -> Result<Booking, AdmissionError> {
        let started = std::time::Instant::now();
        let result = self.admit(&request, policy, timeout).await;
        metrics::histogram!(observability::ADMISSION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        match &result {
            Ok(_) => metrics::counter!(observability::BOOKINGS_ADMITTED_TOTAL).increment(1),
            Err(e) => metrics::counter!(observability::ADMISSIONS_REJECTED_TOTAL, "reason" => e.kind())
                .increment(1),
        }
        result
    }

    /// `create_booking` with the engine-wide settings.
    pub async fn create_booking_with(
        &self,
        request: BookingRequest,
        settings: &AdmissionSettings,
    ) -> Result<Booking, AdmissionError> {
        self.create_booking(request, &settings.retry, settings.timeout).await
    }

    async fn admit(
        &self,
        request: &BookingRequest,
        policy: &RetryPolicy,
        timeout: Duration,
    ) -> Result<Booking, AdmissionError> {
        let window = validate_window(request.start, request.end, MAX_SPAN_DURATION_MS)?;
        let quantity = validate_quantity(request.quantity)?;
        if request.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(AdmissionError::LimitExceeded("notes too long"));
        }
        if let Some(CustomerRef::Guest { name }) = &request.customer
            && name.len() > MAX_NAME_LEN
        {
            return Err(AdmissionError::LimitExceeded("customer name too long"));
        }

        let deadline = Instant::now() + timeout;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_admit(request, window, quantity, deadline).await {
                Ok(booking) => {
                    tracing::debug!(
                        "booking {} admitted: product {} x{quantity} after {attempts} attempt(s)",
                        booking.id,
                        request.product_id
                    );
                    return Ok(booking);
                }
                Err(AttemptError::Rejected(e)) => return Err(e),
                Err(AttemptError::Tx(TxError::Engine(e))) => return Err(e.into()),
                Err(AttemptError::Tx(TxError::Timeout)) => {
                    tracing::warn!("admission on product {} timed out after {timeout:?}", request.product_id);
                    return Err(AdmissionError::Timeout(timeout));
                }
                Err(AttemptError::Tx(TxError::Conflict { product_id })) => {
                    metrics::counter!(observability::SERIALIZATION_CONFLICTS_TOTAL).increment(1);
                    if attempts >= policy.max_attempts {
                        tracing::warn!(
                            "admission on product {product_id} gave up after {attempts} conflicting attempts"
                        );
                        return Err(AdmissionError::TransientConflict { attempts });
                    }
                    let delay = policy.delay_for(attempts - 1);
                    if Instant::now() + delay >= deadline {
                        tracing::warn!("admission on product {product_id}: no time left to retry");
                        return Err(AdmissionError::Timeout(timeout));
                    }
                    tracing::debug!("conflict on product {product_id}, retry {attempts} in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_admit(
        &self,
        request: &BookingRequest,
        window: Span,
        quantity: u32,
        deadline: Instant,
    ) -> Result<Booking, AttemptError> {
        let product_id = request.product_id;
        let mut tx = self.begin(Some(deadline));

        let availability = tx.remaining(product_id, window).await?;
        if !availability.exists {
            return Err(AttemptError::Rejected(AdmissionError::ProductNotFound(product_id)));
        }
        if availability.remaining < quantity {
            return Err(AttemptError::Rejected(AdmissionError::NotAvailable {
                requested: quantity,
                remaining: availability.remaining,
            }));
        }
        let product = tx
            .product(&product_id)
            .await?
            .ok_or(AttemptError::Rejected(AdmissionError::ProductNotFound(product_id)))?;

        let customer_id = self
            .customer_resolver
            .resolve(request.customer.as_ref(), &mut tx)
            .await
            .map_err(AttemptError::Rejected)?;

        let booking = Booking {
            id: Ulid::new(),
            customer_id,
            span: window,
            status: BookingStatus::Pending,
            notes: Some(
                request
                    .notes
                    .clone()
                    .unwrap_or_else(|| DEFAULT_BOOKING_NOTES.to_string()),
            ),
            items: (0..quantity)
                .map(|_| BookingItem {
                    id: Ulid::new(),
                    product_id,
                    price_per_day_snapshot: product.price_per_day,
                })
                .collect(),
        };
        tx.insert_booking(booking.clone());
        tx.commit().await?;
        Ok(booking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: Ms = 1_767_225_600_000;

    #[test]
    fn window_must_be_strictly_ordered() {
        assert!(matches!(
            validate_window(T0, T0, MAX_SPAN_DURATION_MS),
            Err(AdmissionError::InvalidRange(_))
        ));
        assert!(matches!(
            validate_window(T0 + 1, T0, MAX_SPAN_DURATION_MS),
            Err(AdmissionError::InvalidRange(_))
        ));
        assert_eq!(
            validate_window(T0, T0 + 1, MAX_SPAN_DURATION_MS).unwrap(),
            Span::new(T0, T0 + 1)
        );
    }

    #[test]
    fn window_outside_supported_timestamps() {
        assert!(matches!(
            validate_window(0, 1_000, MAX_SPAN_DURATION_MS),
            Err(AdmissionError::InvalidRange(_))
        ));
        assert!(matches!(
            validate_window(T0, MAX_VALID_TIMESTAMP_MS + 1, MAX_QUERY_WINDOW_MS),
            Err(AdmissionError::InvalidRange(_))
        ));
    }

    #[test]
    fn overly_wide_window_hits_limit() {
        assert_eq!(
            validate_window(T0, T0 + MAX_SPAN_DURATION_MS + 1, MAX_SPAN_DURATION_MS),
            Err(AdmissionError::LimitExceeded("window too wide"))
        );
    }

    #[test]
    fn quantity_bounds() {
        assert!(matches!(validate_quantity(0), Err(AdmissionError::InvalidQuantity(_))));
        assert!(matches!(validate_quantity(-1), Err(AdmissionError::InvalidQuantity(_))));
        assert!(matches!(
            validate_quantity(i64::from(MAX_QUANTITY) + 1),
            Err(AdmissionError::InvalidQuantity(_))
        ));
        assert_eq!(validate_quantity(1), Ok(1));
        assert_eq!(validate_quantity(i64::from(MAX_QUANTITY)), Ok(MAX_QUANTITY));
    }
}
