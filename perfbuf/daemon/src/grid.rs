//! Dense counter grids
//!
//! All grids are flat arrays allocated once, sized by
//! (buffer count × CPU count × MAX_EVENT_TYPE), and never resized. Every
//! accessor checks its indices and returns `None` for out-of-range input.

use crate::{registry::BufferId, stats::StatCell};
use probe_common::{EventType, MAX_EVENT_TYPE};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// buffer → CPU → event type → `StatCell`
#[derive(Debug)]
pub struct CounterGrid {
    buffers: usize,
    cpus: usize,
    cells: Box<[StatCell]>,
}

impl CounterGrid {
    pub fn new(buffers: usize, cpus: usize) -> Self {
        let cells = (0..buffers * cpus * MAX_EVENT_TYPE)
            .map(|_| StatCell::default())
            .collect();
        Self {
            buffers,
            cpus,
            cells,
        }
    }

    #[inline]
    pub fn cell(&self, buffer: BufferId, cpu: usize, event_type: EventType) -> Option<&StatCell> {
        if buffer.index() >= self.buffers || cpu >= self.cpus {
            return None;
        }
        let index = (buffer.index() * self.cpus + cpu) * MAX_EVENT_TYPE + event_type.index();
        self.cells.get(index)
    }

    /// Cells of one buffer and event type, on one CPU or on all of them
    pub fn cells<'a>(
        &'a self,
        buffer: BufferId,
        cpu: Option<usize>,
        event_type: EventType,
    ) -> impl Iterator<Item = &'a StatCell> + 'a {
        let cpus = match cpu {
            Some(cpu) => cpu..cpu.saturating_add(1),
            None => 0..self.cpus,
        };
        cpus.filter_map(move |cpu| self.cell(buffer, cpu, event_type))
    }
}

/// buffer → CPU → lost event counter, filled from the perf buffer readers
#[derive(Debug)]
pub struct LostCounters {
    buffers: usize,
    cpus: usize,
    cells: Box<[AtomicU64]>,
}

impl LostCounters {
    pub fn new(buffers: usize, cpus: usize) -> Self {
        let cells = (0..buffers * cpus).map(|_| AtomicU64::new(0)).collect();
        Self {
            buffers,
            cpus,
            cells,
        }
    }

    #[inline]
    pub fn cell(&self, buffer: BufferId, cpu: usize) -> Option<&AtomicU64> {
        if buffer.index() >= self.buffers || cpu >= self.cpus {
            return None;
        }
        self.cells.get(buffer.index() * self.cpus + cpu)
    }

    /// Sum over one CPU, or over all CPUs when `cpu` is None
    pub fn sum(&self, buffer: BufferId, cpu: Option<usize>) -> u64 {
        self.fold(buffer, cpu, |cell| cell.load(Ordering::Relaxed))
    }

    /// Same as `sum`, resetting every visited counter
    pub fn take(&self, buffer: BufferId, cpu: Option<usize>) -> u64 {
        self.fold(buffer, cpu, |cell| cell.swap(0, Ordering::Relaxed))
    }

    fn fold(&self, buffer: BufferId, cpu: Option<usize>, read: impl Fn(&AtomicU64) -> u64) -> u64 {
        match cpu {
            Some(cpu) => self.cell(buffer, cpu).map(&read).unwrap_or(0),
            None => (0..self.cpus)
                .filter_map(|cpu| self.cell(buffer, cpu))
                .map(&read)
                .fold(0u64, u64::wrapping_add),
        }
    }
}

/// buffer → event type → out-of-order event counter
#[derive(Debug)]
pub struct SortingErrors {
    buffers: usize,
    cells: Box<[AtomicI64]>,
}

impl SortingErrors {
    pub fn new(buffers: usize) -> Self {
        let cells = (0..buffers * MAX_EVENT_TYPE)
            .map(|_| AtomicI64::new(0))
            .collect();
        Self { buffers, cells }
    }

    #[inline]
    pub fn cell(&self, buffer: BufferId, event_type: EventType) -> Option<&AtomicI64> {
        if buffer.index() >= self.buffers {
            return None;
        }
        self.cells
            .get(buffer.index() * MAX_EVENT_TYPE + event_type.index())
    }
}
