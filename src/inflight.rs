use std::collections::HashMap;

use rangemap::RangeMap;

use crate::{interval::ByteRange, queue::Completion, MediaId};

pub type FlightId = u64;

/// A byte range currently being fetched from upstream.
#[derive(Debug)]
struct Flight {
    media_id: MediaId,
    range: ByteRange,
    /// Requests waiting on this fetch, released when it completes.
    waiters: Vec<Completion>,
}

/// Ranges with an upstream fetch in progress.
///
/// Only ever touched by the scheduler loop. Flights of the same media never overlap.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    next_id: FlightId,
    // Flight IDs are unique, so adjacent flights are never coalesced.
    ranges: HashMap<MediaId, RangeMap<u64, FlightId>>,
    flights: HashMap<FlightId, Flight>,
}

impl InFlightTracker {
    pub fn register(&mut self, media_id: MediaId, range: ByteRange) -> FlightId {
        let id = self.next_id;
        self.next_id += 1;

        let ranges = self.ranges.entry(media_id.clone()).or_default();
        debug_assert!(!ranges.overlaps(&range), "overlapping flights");
        ranges.insert(range.clone(), id);

        self.flights.insert(
            id,
            Flight {
                media_id,
                range,
                waiters: Vec::new(),
            },
        );

        id
    }

    /// Flights of `media_id` overlapping `range`, ordered by start.
    pub fn colliding(&self, media_id: &str, range: &ByteRange) -> Vec<(FlightId, ByteRange)> {
        if range.is_empty() {
            return Vec::new();
        }

        self.ranges
            .get(media_id)
            .map(|ranges| {
                ranges
                    .overlapping(range)
                    .map(|(range, id)| (*id, range.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Holds `completion` back until `flight` completes.
    pub fn park(&mut self, flight: FlightId, completion: Completion) {
        if let Some(flight) = self.flights.get_mut(&flight) {
            flight.waiters.push(completion);
        }
    }

    /// Forgets a flight, releasing everything parked on it.
    pub fn complete(&mut self, flight: FlightId) -> Option<(MediaId, ByteRange)> {
        let Flight {
            media_id, range, ..
        } = self.flights.remove(&flight)?;

        if let Some(ranges) = self.ranges.get_mut(&media_id) {
            ranges.remove(range.clone());

            if ranges.is_empty() {
                self.ranges.remove(&media_id);
            }
        }

        Some((media_id, range))
    }

    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}
