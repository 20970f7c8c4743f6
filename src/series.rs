//! Bounded rolling windows of ticks and candles.
//!
//! A [`SeriesBuffer`] holds the most recent points of one stream with
//! strictly ordered epochs. Ticks older than or equal to the last stored tick
//! are discarded. A candle with the same epoch as the last one replaces it
//! (the bucket is still forming), and an older candle is discarded. Once the
//! buffer is full, every append evicts the oldest point.

use std::collections::VecDeque;

use crate::models::StreamKey;
use crate::models::candle::Candle;
use crate::models::tick::Tick;

/// Window length used when none is configured.
pub const DEFAULT_CAPACITY: usize = 1000;

/// One streamed observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Point {
    Tick(Tick),
    Candle(Candle),
}

impl Point {
    pub fn epoch(&self) -> i64 {
        match self {
            Point::Tick(tick) => tick.epoch,
            Point::Candle(candle) => candle.epoch,
        }
    }
}

/// An immutable copy of a buffer's contents.
#[derive(Debug, Clone, PartialEq)]
pub enum Series {
    Ticks(Vec<Tick>),
    Candles(Vec<Candle>),
}

impl Series {
    /// An empty series of the shape matching `granularity`.
    pub fn empty(granularity: u32) -> Self {
        if granularity == 0 {
            Series::Ticks(Vec::new())
        } else {
            Series::Candles(Vec::new())
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Series::Ticks(ticks) => ticks.len(),
            Series::Candles(candles) => candles.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn epochs(&self) -> Vec<i64> {
        match self {
            Series::Ticks(ticks) => ticks.iter().map(|t| t.epoch).collect(),
            Series::Candles(candles) => candles.iter().map(|c| c.epoch).collect(),
        }
    }

    pub fn last_epoch(&self) -> Option<i64> {
        match self {
            Series::Ticks(ticks) => ticks.last().map(|t| t.epoch),
            Series::Candles(candles) => candles.last().map(|c| c.epoch),
        }
    }
}

/// Outcome of applying a point to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Appended,
    /// The last candle was overwritten by a newer version of the same bucket.
    Replaced,
    /// The point was stale, out of order, or of the wrong shape.
    Discarded,
}

impl Applied {
    pub fn changed(self) -> bool {
        self != Applied::Discarded
    }
}

#[derive(Debug, Clone)]
enum Points {
    Ticks(VecDeque<Tick>),
    Candles(VecDeque<Candle>),
}

/// Rolling window for one [`StreamKey`].
#[derive(Debug, Clone)]
pub struct SeriesBuffer {
    points: Points,
    capacity: usize,
}

impl SeriesBuffer {
    /// Creates an empty buffer shaped for `granularity`. A zero capacity is
    /// treated as one.
    pub fn new(granularity: u32, capacity: usize) -> Self {
        let points = if granularity == 0 {
            Points::Ticks(VecDeque::new())
        } else {
            Points::Candles(VecDeque::new())
        };
        Self {
            points,
            capacity: capacity.max(1),
        }
    }

    pub fn for_key(key: &StreamKey, capacity: usize) -> Self {
        Self::new(key.granularity, capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        match &self.points {
            Points::Ticks(ticks) => ticks.len(),
            Points::Candles(candles) => candles.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        match &mut self.points {
            Points::Ticks(ticks) => ticks.clear(),
            Points::Candles(candles) => candles.clear(),
        }
    }

    /// Replaces the contents with `series`, keeping only the newest
    /// `capacity` points that satisfy the ordering rules.
    pub fn seed(&mut self, series: Series) {
        self.clear();
        match series {
            Series::Ticks(ticks) => {
                for tick in ticks {
                    self.apply(Point::Tick(tick));
                }
            }
            Series::Candles(candles) => {
                for candle in candles {
                    self.apply(Point::Candle(candle));
                }
            }
        }
    }

    pub fn apply(&mut self, point: Point) -> Applied {
        let capacity = self.capacity;
        match (&mut self.points, point) {
            (Points::Ticks(ticks), Point::Tick(tick)) => push_tick(ticks, tick, capacity),
            (Points::Candles(candles), Point::Candle(candle)) => {
                push_candle(candles, candle, capacity)
            }
            _ => Applied::Discarded,
        }
    }

    pub fn snapshot(&self) -> Series {
        match &self.points {
            Points::Ticks(ticks) => Series::Ticks(ticks.iter().copied().collect()),
            Points::Candles(candles) => Series::Candles(candles.iter().copied().collect()),
        }
    }
}

fn push_tick(ticks: &mut VecDeque<Tick>, tick: Tick, capacity: usize) -> Applied {
    if let Some(last) = ticks.back()
        && tick.epoch <= last.epoch
    {
        return Applied::Discarded;
    }
    ticks.push_back(tick);
    if ticks.len() > capacity {
        ticks.pop_front();
    }
    Applied::Appended
}

fn push_candle(candles: &mut VecDeque<Candle>, candle: Candle, capacity: usize) -> Applied {
    match candles.back().map(|last| last.epoch) {
        Some(epoch) if candle.epoch == epoch => {
            if let Some(last) = candles.back_mut() {
                *last = candle;
            }
            Applied::Replaced
        }
        Some(epoch) if candle.epoch < epoch => Applied::Discarded,
        _ => {
            candles.push_back(candle);
            if candles.len() > capacity {
                candles.pop_front();
            }
            Applied::Appended
        }
    }
}
