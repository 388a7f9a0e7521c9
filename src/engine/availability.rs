use crate::model::*;

// ── Availability Calculator ───────────────────────────────────────

/// Units held against `query` by Pending and Confirmed reservations.
///
/// Demand is summed over every overlapping reservation, not taken at the peak
/// instant, so the answer is conservative for windows that cover several
/// disjoint bookings.
pub fn active_demand(product: &ProductState, query: &Span) -> u64 {
    product
        .overlapping(query)
        .filter(|r| r.status.consumes_capacity())
        .map(|r| u64::from(r.units))
        .sum()
}

/// `max(0, total - demand)` for the window.
pub fn remaining_units(product: &ProductState, query: &Span) -> Availability {
    let total = product.total_capacity();
    let demand = active_demand(product, query);
    let remaining = u64::from(total).saturating_sub(demand) as u32;
    Availability {
        exists: true,
        remaining,
        total,
    }
}

/// Sweep-line: the largest number of units held at any single instant inside
/// `query`. Ends sort before starts at the same instant, so adjacent windows
/// never stack.
pub fn peak_demand(product: &ProductState, query: &Span) -> u32 {
    let mut events: Vec<(Ms, i64)> = Vec::new();
    for r in product.overlapping(query).filter(|r| r.status.consumes_capacity()) {
        events.push((r.span.start.max(query.start), i64::from(r.units)));
        events.push((r.span.end.min(query.end), -i64::from(r.units)));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut current: i64 = 0;
    let mut peak: i64 = 0;
    for (_, delta) in events {
        current += delta;
        peak = peak.max(current);
    }
    peak as u32
}
