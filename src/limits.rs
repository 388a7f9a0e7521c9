use crate::model::Ms;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_PRODUCTS_PER_TENANT: usize = 10_000;
pub const MAX_ASSETS_PER_PRODUCT: usize = 10_000;
pub const MAX_RESERVATIONS_PER_PRODUCT: usize = 100_000;
pub const MAX_CUSTOMERS_PER_TENANT: usize = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2_048;

/// Largest number of units a single booking may reserve.
pub const MAX_QUANTITY: u32 = 1_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Rentals longer than two years are rejected.
pub const MAX_SPAN_DURATION_MS: Ms = 2 * 366 * 86_400_000;
pub const MAX_QUERY_WINDOW_MS: Ms = 5 * 366 * 86_400_000;
