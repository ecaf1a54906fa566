//! Connection preference
//!
//! New outbound calls go to the usable connection with the lowest score
//! (smoothed RTT weighted by errors); the rest follow in order as fallbacks.

use ironfleet_core::connection::Connection;
use ironfleet_core::models::ConnectionHealth;
use std::cmp::Ordering;

/// Keep established entries and order them best first.
pub fn order_by_score<T>(candidates: Vec<(T, f64, ConnectionHealth)>) -> Vec<T> {
    let mut usable: Vec<_> = candidates
        .into_iter()
        .filter(|(_, _, health)| *health == ConnectionHealth::Established)
        .map(|(item, score, _)| (item, score))
        .collect();
    usable.sort_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    usable.into_iter().map(|(item, _)| item).collect()
}

pub fn rank(connections: impl IntoIterator<Item = Connection>) -> Vec<Connection> {
    order_by_score(
        connections
            .into_iter()
            .map(|c| {
                let score = c.score();
                let health = c.health();
                (c, score, health)
            })
            .collect(),
    )
}
