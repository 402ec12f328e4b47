//! The per-`Connection` stream-id pool: a bounded stack of available ids
//! grouped into fixed-size bands of 128, popped on send and pushed back
//! on final response. Bands above the current high-water mark are
//! released after a configurable quiescent delay so a connection that
//! briefly needed many concurrent ids doesn't keep their
//! memory/bookkeeping forever.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const BAND_SIZE: u16 = 128;

#[derive(Debug)]
struct Band {
    free: Vec<i16>,
    /// Ids from this band currently checked out; a band can only be
    /// released once this reaches zero.
    in_use: usize,
    last_idle_at: Option<Instant>,
}

impl Band {
    fn new(start: i16, size: u16) -> Self {
        let free = (0..size).map(|i| start + i as i16).rev().collect();
        Self { free, in_use: 0, last_idle_at: None }
    }
}

/// Stream ids are allocated band-by-band as demand grows, and a band is
/// dropped (its capacity returned to "could be reopened later") once it
/// has been fully idle for `release_after`.
pub struct StreamIdPool {
    capacity: u16,
    release_after: Duration,
    bands: Mutex<Vec<Band>>,
}

impl StreamIdPool {
    pub fn new(capacity: u16, release_after: Duration) -> Self {
        Self { capacity, release_after, bands: Mutex::new(vec![Band::new(0, BAND_SIZE.min(capacity))]) }
    }

    /// Pop the lowest available stream id, opening a new band if demand
    /// has grown past every currently open band and capacity allows it.
    /// Returns `None` when the Connection is at capacity ("at capacity" in
    /// surfaced by the caller as `Error::BusyConnection`).
    pub fn borrow(&self) -> Option<i16> {
        let mut bands = self.bands.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for band in bands.iter_mut() {
            if let Some(id) = band.free.pop() {
                band.in_use += 1;
                band.last_idle_at = None;
                return Some(id);
            }
        }
        let opened = bands.len() as u16 * BAND_SIZE;
        if opened >= self.capacity {
            return None;
        }
        let size = BAND_SIZE.min(self.capacity - opened);
        let mut band = Band::new(opened as i16, size);
        let id = band.free.pop();
        if id.is_some() {
            band.in_use += 1;
        }
        bands.push(band);
        id
    }

    /// Return a stream id to the pool. Callers must only do this once
    /// the server's response for it has actually arrived (or the
    /// Connection has gone `Defunct`) - never eagerly on cancellation.
    pub fn release(&self, id: i16) {
        let mut bands = self.bands.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let band_index = (id / BAND_SIZE as i16) as usize;
        if let Some(band) = bands.get_mut(band_index) {
            band.free.push(id);
            band.in_use = band.in_use.saturating_sub(1);
            if band.in_use == 0 {
                band.last_idle_at = Some(Instant::now());
            }
        }
    }

    /// Drop fully-idle bands above the first whose quiescent period has
    /// elapsed, keeping at least one band open. Called periodically off
    /// the Connection's drive loop, not on every release, to bound the
    /// rate of band churn.
    pub fn release_stale_bands(&self) {
        let mut bands = self.bands.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while bands.len() > 1 {
            let last = bands.last().unwrap_or_else(|| unreachable!("len > 1 checked above"));
            let stale = last.in_use == 0
                && last.last_idle_at.is_some_and(|since| since.elapsed() >= self.release_after);
            if !stale {
                break;
            }
            bands.pop();
        }
    }

    pub fn in_use(&self) -> usize {
        let bands = self.bands.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        bands.iter().map(|b| b.in_use).sum()
    }

    pub fn free_count(&self) -> usize {
        let bands = self.bands.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        bands.iter().map(|b| b.free.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borrow_and_release_round_trips() {
        let pool = StreamIdPool::new(256, Duration::from_secs(60));
        let id = pool.borrow().unwrap();
        assert_eq!(pool.in_use(), 1);
        pool.release(id);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn exhausts_at_capacity() {
        let pool = StreamIdPool::new(4, Duration::from_secs(60));
        let ids: Vec<i16> = std::iter::from_fn(|| pool.borrow()).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(pool.borrow(), None);
    }

    #[test]
    fn invariant_in_use_plus_free_equals_capacity() {
        let pool = StreamIdPool::new(200, Duration::from_secs(60));
        let mut held = Vec::new();
        for _ in 0..150 {
            held.push(pool.borrow().unwrap());
        }
        assert_eq!(pool.in_use() + pool.free_count(), 200);
        for id in held.drain(..70) {
            pool.release(id);
        }
        assert_eq!(pool.in_use() + pool.free_count(), 200);
    }

    #[test]
    fn opens_a_new_band_once_the_first_is_exhausted() {
        let pool = StreamIdPool::new(256, Duration::from_secs(60));
        let first_band: Vec<i16> = std::iter::from_fn(|| pool.borrow()).take(128).collect();
        assert!(first_band.iter().all(|&id| (0..128).contains(&id)));
        let next = pool.borrow().unwrap();
        assert!((128..256).contains(&next));
    }

    #[test]
    fn stale_bands_above_high_water_mark_are_released() {
        let pool = StreamIdPool::new(256, Duration::from_millis(1));
        let band2_id = {
            let mut first = Vec::new();
            for _ in 0..128 {
                first.push(pool.borrow().unwrap());
            }
            let extra = pool.borrow().unwrap();
            for id in first {
                pool.release(id);
            }
            extra
        };
        pool.release(band2_id);
        std::thread::sleep(Duration::from_millis(5));
        pool.release_stale_bands();
        // second band fully idle and past its quiescent delay: dropped,
        // leaving only the always-kept first band.
        assert_eq!(pool.free_count(), 128);
    }
}
