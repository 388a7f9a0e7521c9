use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Money in minor currency units.
pub type Cents = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Statuses ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetStatus {
    /// Member of the bookable pool; counts toward capacity.
    Available,
    /// Retired, in repair, lost. Never counts toward capacity.
    Unavailable,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Available => "available",
            AssetStatus::Unavailable => "unavailable",
        }
    }
}

impl FromStr for AssetStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "available" => Ok(AssetStatus::Available),
            "unavailable" => Ok(AssetStatus::Unavailable),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Booking lifecycle:
/// `Pending → Confirmed → Completed`, and `Pending | Confirmed → Cancelled`.
/// `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Whether a booking in this status holds units against capacity.
    /// Completed rentals have been returned, so they no longer block future windows.
    pub fn consumes_capacity(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    /// Statuses shown on the bookings dashboard.
    pub fn is_active(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Pending, BookingStatus::Confirmed)
                | (BookingStatus::Confirmed, BookingStatus::Completed)
                | (BookingStatus::Pending, BookingStatus::Cancelled)
                | (BookingStatus::Confirmed, BookingStatus::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

// ── Ledger and store records ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: Ulid,
    pub name: String,
    pub price_per_day: Cents,
}

/// One physical unit of a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: Ulid,
    pub product_id: Ulid,
    pub identifier: String,
    pub status: AssetStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Ulid,
    pub name: String,
    pub email: Option<String>,
}

/// Reservation of exactly one unit of `product_id` for the parent booking's window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingItem {
    pub id: Ulid,
    pub product_id: Ulid,
    pub price_per_day_snapshot: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub items: Vec<BookingItem>,
}

impl Booking {
    /// Number of units this booking holds of `product_id`.
    pub fn units_of(&self, product_id: &Ulid) -> u32 {
        self.items.iter().filter(|i| &i.product_id == product_id).count() as u32
    }

    /// Distinct products referenced by the items, sorted.
    pub fn product_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.items.iter().map(|i| i.product_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// A booking's claim on one product, as seen from that product's ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub booking_id: Ulid,
    pub span: Span,
    pub units: u32,
    pub status: BookingStatus,
    /// Product version at which this reservation was last written.
    pub version: u64,
}

/// Everything the engine knows about one product. Guarded by a single lock.
#[derive(Debug, Clone)]
pub struct ProductState {
    pub product: Product,
    pub assets: Vec<Asset>,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
    /// Bumped on every write to this product.
    pub version: u64,
    /// Version of the last change to the asset pool.
    pub assets_version: u64,
}

impl ProductState {
    pub fn new(product: Product) -> Self {
        Self {
            product,
            assets: Vec::new(),
            reservations: Vec::new(),
            version: 0,
            assets_version: 0,
        }
    }

    pub fn id(&self) -> Ulid {
        self.product.id
    }

    /// Count of assets currently in the bookable pool.
    pub fn total_capacity(&self) -> u32 {
        self.assets
            .iter()
            .filter(|a| a.status == AssetStatus::Available)
            .count() as u32
    }

    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    pub fn add_asset(&mut self, asset: Asset) {
        self.assets.push(asset);
        self.assets_version = self.bump();
    }

    pub fn set_asset_status(&mut self, asset_id: &Ulid, status: AssetStatus) -> bool {
        let Some(asset) = self.assets.iter_mut().find(|a| &a.id == asset_id) else {
            return false;
        };
        asset.status = status;
        self.assets_version = self.bump();
        true
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, mut reservation: Reservation) {
        reservation.version = self.bump();
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn set_reservation_status(&mut self, booking_id: &Ulid, status: BookingStatus) -> bool {
        let version = self.version + 1;
        let Some(r) = self
            .reservations
            .iter_mut()
            .find(|r| &r.booking_id == booking_id)
        else {
            return false;
        };
        r.status = status;
        r.version = version;
        self.version = version;
        true
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// True if anything that could change the answer for `window` was written
    /// after `observed`: the asset pool, or a reservation overlapping `window`.
    pub fn changed_since(&self, observed: u64, window: &Span) -> bool {
        if self.version <= observed {
            return false;
        }
        if self.assets_version > observed {
            return true;
        }
        self.overlapping(window).any(|r| r.version > observed)
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// WAL event types. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProductCreated {
        id: Ulid,
        name: String,
        price_per_day: Cents,
    },
    AssetAdded {
        id: Ulid,
        product_id: Ulid,
        identifier: String,
        status: AssetStatus,
    },
    AssetStatusChanged {
        id: Ulid,
        product_id: Ulid,
        status: AssetStatus,
    },
    CustomerCreated {
        id: Ulid,
        name: String,
        email: Option<String>,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
    },
}

/// One atomic unit of durability. Either every event of a commit is replayed or none is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub events: Vec<Event>,
}

impl Commit {
    pub fn single(event: Event) -> Self {
        Self { events: vec![event] }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    /// False when the product is unknown to this business.
    pub exists: bool,
    pub remaining: u32,
    pub total: u32,
}

impl Availability {
    pub fn missing() -> Self {
        Self {
            exists: false,
            remaining: 0,
            total: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductInfo {
    pub id: Ulid,
    pub name: String,
    pub price_per_day: Cents,
    /// Available-for-booking asset count.
    pub quantity: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(start: Ms, end: Ms, units: u32, status: BookingStatus) -> Reservation {
        Reservation {
            booking_id: Ulid::new(),
            span: Span::new(start, end),
            units,
            status,
            version: 0,
        }
    }

    fn product_state() -> ProductState {
        ProductState::new(Product {
            id: Ulid::new(),
            name: "Tripod".into(),
            price_per_day: 2_500,
        })
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
        assert!(a.contains_instant(100));
        assert!(!a.contains_instant(200));
    }

    #[test]
    fn span_overlap_matches_definition() {
        let points = [0, 1, 2, 3, 4, 5];
        for &a0 in &points {
            for &a1 in points.iter().filter(|&&x| x > a0) {
                for &b0 in &points {
                    for &b1 in points.iter().filter(|&&x| x > b0) {
                        let a = Span::new(a0, a1);
                        let b = Span::new(b0, b1);
                        assert_eq!(a.overlaps(&b), a0 < b1 && b0 < a1);
                    }
                }
            }
        }
    }

    #[test]
    fn try_new_rejects_empty_and_inverted() {
        assert!(Span::try_new(5, 5).is_none());
        assert!(Span::try_new(6, 5).is_none());
        assert_eq!(Span::try_new(5, 6), Some(Span::new(5, 6)));
    }

    #[test]
    fn booking_state_machine() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(Completed.is_terminal() && Cancelled.is_terminal());
    }

    #[test]
    fn completed_is_active_but_frees_capacity() {
        assert!(BookingStatus::Completed.is_active());
        assert!(!BookingStatus::Completed.consumes_capacity());
        assert!(BookingStatus::Pending.consumes_capacity());
        assert!(BookingStatus::Confirmed.consumes_capacity());
        assert!(!BookingStatus::Cancelled.is_active());
    }

    #[test]
    fn status_parsing() {
        assert_eq!("Confirmed".parse::<BookingStatus>(), Ok(BookingStatus::Confirmed));
        assert_eq!("canceled".parse::<BookingStatus>(), Ok(BookingStatus::Cancelled));
        assert!("lost".parse::<BookingStatus>().is_err());
        assert_eq!("UNAVAILABLE".parse::<AssetStatus>(), Ok(AssetStatus::Unavailable));
    }

    #[test]
    fn capacity_counts_only_available_assets() {
        let mut ps = product_state();
        let pid = ps.id();
        for (i, status) in [AssetStatus::Available, AssetStatus::Unavailable, AssetStatus::Available]
            .into_iter()
            .enumerate()
        {
            ps.add_asset(Asset {
                id: Ulid::new(),
                product_id: pid,
                identifier: format!("T-{i}"),
                status,
            });
        }
        assert_eq!(ps.total_capacity(), 2);
    }

    #[test]
    fn reservations_stay_sorted() {
        let mut ps = product_state();
        ps.insert_reservation(reservation(300, 400, 1, BookingStatus::Pending));
        ps.insert_reservation(reservation(100, 200, 1, BookingStatus::Pending));
        ps.insert_reservation(reservation(200, 300, 1, BookingStatus::Pending));
        let starts: Vec<Ms> = ps.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
        assert_eq!(ps.version, 3);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut ps = product_state();
        ps.insert_reservation(reservation(100, 200, 1, BookingStatus::Pending));
        ps.insert_reservation(reservation(450, 600, 1, BookingStatus::Pending));
        ps.insert_reservation(reservation(1000, 1100, 1, BookingStatus::Pending));

        let hits: Vec<_> = ps.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));

        // Ending exactly at query.start is not an overlap.
        assert_eq!(ps.overlapping(&Span::new(200, 300)).count(), 0);
        // One huge reservation spanning the query is found.
        ps.insert_reservation(reservation(0, 10_000, 1, BookingStatus::Pending));
        assert_eq!(ps.overlapping(&Span::new(700, 800)).count(), 1);
    }

    #[test]
    fn changed_since_is_range_aware() {
        let mut ps = product_state();
        ps.insert_reservation(reservation(100, 200, 1, BookingStatus::Pending));
        let observed = ps.version;

        ps.insert_reservation(reservation(500, 600, 1, BookingStatus::Pending));
        assert!(!ps.changed_since(observed, &Span::new(100, 200)));
        assert!(ps.changed_since(observed, &Span::new(550, 700)));
    }

    #[test]
    fn changed_since_sees_asset_changes_everywhere() {
        let mut ps = product_state();
        let observed = ps.version;
        ps.add_asset(Asset {
            id: Ulid::new(),
            product_id: ps.id(),
            identifier: "T-1".into(),
            status: AssetStatus::Available,
        });
        assert!(ps.changed_since(observed, &Span::new(0, 1)));
    }

    #[test]
    fn status_change_bumps_reservation_version() {
        let mut ps = product_state();
        let r = reservation(100, 200, 2, BookingStatus::Pending);
        let booking_id = r.booking_id;
        ps.insert_reservation(r);
        let observed = ps.version;
        assert!(ps.set_reservation_status(&booking_id, BookingStatus::Cancelled));
        assert!(ps.changed_since(observed, &Span::new(150, 160)));
        assert!(!ps.set_reservation_status(&Ulid::new(), BookingStatus::Cancelled));
    }

    #[test]
    fn booking_units_and_products() {
        let camera = Ulid::new();
        let tripod = Ulid::new();
        let item = |product_id| BookingItem {
            id: Ulid::new(),
            product_id,
            price_per_day_snapshot: 100,
        };
        let booking = Booking {
            id: Ulid::new(),
            customer_id: Ulid::new(),
            span: Span::new(0, 10),
            status: BookingStatus::Pending,
            notes: None,
            items: vec![item(camera), item(tripod), item(camera)],
        };
        assert_eq!(booking.units_of(&camera), 2);
        assert_eq!(booking.units_of(&tripod), 1);
        assert_eq!(booking.product_ids().len(), 2);
    }
}
