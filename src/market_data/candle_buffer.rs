use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::MarketTick;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle. Immutable once `is_closed` is true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub is_closed: bool,
}

impl Candle {
    pub fn from_tick(tick: &MarketTick) -> Self {
        Self {
            open_time: tick.open_time_ms,
            close_time: tick.close_time_ms,
            open: tick.open,
            high: tick.high,
            low: tick.low,
            close: tick.close,
            volume: tick.volume,
            is_closed: tick.is_closed,
        }
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// ---------------------------------------------------------------------------
// CandleBuffer -- thread-safe ring buffer per (symbol, interval)
// ---------------------------------------------------------------------------

/// Thread-safe ring-buffer that stores the most recent candles per
/// `(symbol, interval)` pair.  The live (unclosed) candle is continuously
/// updated in-place; when a candle closes it becomes permanent and the ring is
/// trimmed to `max_candles`.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    max_candles: usize,
}

impl CandleBuffer {
    /// Create a new buffer that retains at most `max_candles` closed candles per
    /// key, plus one in-progress candle.
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Fold a market tick from the stream into the ring for its key.
    pub fn apply_tick(&self, tick: &MarketTick) {
        let key = CandleKey {
            symbol: tick.symbol.clone(),
            interval: tick.interval.clone(),
        };
        self.update(key, Candle::from_tick(tick));
    }

    /// Insert or replace the latest candle for the given key.
    ///
    /// * If the incoming candle is closed it is appended and the ring is
    ///   trimmed to `max_candles`.
    /// * If the incoming candle is still open it replaces the last element when
    ///   that element is also an open candle with the same `open_time`
    ///   (in-progress update), otherwise it is simply appended.
    pub fn update(&self, key: CandleKey, candle: Candle) {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_candles + 1));

        // Replace the in-progress version of this same candle, if present.
        if let Some(last) = ring.back() {
            if !last.is_closed && last.open_time == candle.open_time {
                ring.pop_back();
            }
        }
        ring.push_back(candle);

        while ring.iter().filter(|c| c.is_closed).count() > self.max_candles {
            ring.pop_front();
        }
    }

    /// Return the most recent `count` **closed** candles (oldest-first order).
    pub fn get_closed(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let closed: Vec<&Candle> = ring.iter().filter(|c| c.is_closed).collect();
                let start = closed.len().saturating_sub(count);
                closed[start..].iter().map(|c| (*c).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Return the close price of the most recent closed candle, if any.
    pub fn last_close(&self, key: &CandleKey) -> Option<Decimal> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.is_closed).map(|c| c.close))
    }

    /// Total number of candles (including any in-progress candle) stored for a
    /// key.
    pub fn count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_candle(open_time: i64, close: Decimal, is_closed: bool) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: dec!(100),
            is_closed,
        }
    }

    fn make_key(sym: &str, iv: &str) -> CandleKey {
        CandleKey {
            symbol: sym.into(),
            interval: iv.into(),
        }
    }

    #[test]
    fn ring_buffer_trimming() {
        let buf = CandleBuffer::new(3);
        let key = make_key("BTCUSDT", "1m");

        for i in 0..5i64 {
            buf.update(
                key.clone(),
                sample_candle(i * 60_000, Decimal::from(100 + i), true),
            );
        }

        assert_eq!(buf.count(&key), 3);
        let closes: Vec<Decimal> = buf.get_closed(&key, 10).iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![dec!(102), dec!(103), dec!(104)]);
    }

    #[test]
    fn in_progress_replacement() {
        let buf = CandleBuffer::new(10);
        let key = make_key("ETHUSDT", "5m");

        buf.update(key.clone(), sample_candle(0, dec!(50), false));
        assert_eq!(buf.count(&key), 1);

        // Same open_time, still open -- should replace.
        buf.update(key.clone(), sample_candle(0, dec!(51), false));
        assert_eq!(buf.count(&key), 1);

        // Close it.
        buf.update(key.clone(), sample_candle(0, dec!(52), true));
        assert_eq!(buf.count(&key), 1);
        assert_eq!(buf.last_close(&key), Some(dec!(52)));
    }

    #[test]
    fn get_closed_filters_out_in_progress() {
        let buf = CandleBuffer::new(10);
        let key = make_key("BTCUSDT", "1m");

        buf.update(key.clone(), sample_candle(0, dec!(100), true));
        buf.update(key.clone(), sample_candle(60_000, dec!(101), true));
        buf.update(key.clone(), sample_candle(120_000, dec!(102), false)); // in progress

        let closed = buf.get_closed(&key, 10);
        assert_eq!(closed.len(), 2);
    }

    #[test]
    fn last_close_empty_returns_none() {
        let buf = CandleBuffer::new(10);
        let key = make_key("XYZUSDT", "1h");
        assert_eq!(buf.last_close(&key), None);
    }

    #[test]
    fn apply_tick_routes_by_symbol_and_interval() {
        let buf = CandleBuffer::new(10);
        let tick = MarketTick {
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            open: dec!(100),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100.5),
            volume: dec!(12),
            event_time_ms: 100,
            open_time_ms: 0,
            close_time_ms: 59_999,
            is_closed: true,
        };
        buf.apply_tick(&tick);
        assert_eq!(
            buf.last_close(&make_key("BTCUSDT", "1m")),
            Some(dec!(100.5))
        );
        assert_eq!(buf.last_close(&make_key("BTCUSDT", "5m")), None);
    }
}
