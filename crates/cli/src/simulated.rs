//! Random-walk market used for paper sessions.
//!
//! Every `recent_bars` call closes one new bar for the instrument and marks
//! its price on the paper broker, so stops and targets fill as the walk moves.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use fx_engine_core::config::InstrumentSpec;
use fx_engine_core::events::Bar;
use fx_engine_core::traits::MarketDataProvider;
use fx_engine_execution::PaperBroker;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Starting price in pips: 1.1000 for 4-digit pairs, 110.00 for JPY pairs.
const START_PIPS: i64 = 11_000;
const HISTORY: usize = 500;

struct Series {
    spec: InstrumentSpec,
    bars: Vec<Bar>,
}

pub struct RandomWalkMarket {
    broker: PaperBroker,
    volatility_pips: i64,
    rng: Mutex<StdRng>,
    series: Mutex<HashMap<String, Series>>,
}

impl RandomWalkMarket {
    #[must_use]
    pub fn new(broker: PaperBroker, volatility_pips: i64, seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self {
            broker,
            volatility_pips: volatility_pips.max(1),
            rng: Mutex::new(rng),
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Adds an instrument and seeds `warmup` bars of history.
    pub fn register(&self, symbol: &str, spec: InstrumentSpec, warmup: usize) {
        let start = spec.pip_size * Decimal::from(START_PIPS);
        let mut series = Series {
            spec,
            bars: Vec::with_capacity(HISTORY),
        };
        let mut close = start;
        for _ in 0..warmup {
            close = self.step(&mut series, close);
        }
        self.broker.mark_price(symbol, close);
        self.series.lock().insert(symbol.to_string(), series);
    }

    /// Closes one bar starting at `open` and returns its close.
    fn step(&self, series: &mut Series, open: Decimal) -> Decimal {
        let mut rng = self.rng.lock();
        let move_pips = rng.gen_range(-self.volatility_pips..=self.volatility_pips);
        let wick_up = rng.gen_range(0..=self.volatility_pips / 2);
        let wick_down = rng.gen_range(0..=self.volatility_pips / 2);
        let volume = rng.gen_range(50..500);
        drop(rng);

        let pip = series.spec.pip_size;
        let close = (open + pip * Decimal::from(move_pips)).max(pip);
        let time = series
            .bars
            .last()
            .map_or_else(Utc::now, |b| b.time + Duration::minutes(15));
        series.bars.push(Bar {
            time,
            open,
            high: open.max(close) + pip * Decimal::from(wick_up),
            low: (open.min(close) - pip * Decimal::from(wick_down)).max(pip),
            close,
            volume: Decimal::from(volume),
        });
        if series.bars.len() > HISTORY {
            series.bars.remove(0);
        }
        close
    }
}

#[async_trait]
impl MarketDataProvider for RandomWalkMarket {
    async fn recent_bars(&self, instrument: &str, _timeframe: &str, count: usize) -> Result<Vec<Bar>> {
        let mut all = self.series.lock();
        let series = all
            .get_mut(instrument)
            .ok_or_else(|| anyhow::anyhow!("Unknown instrument {instrument}"))?;

        let open = series.bars.last().map_or(
            series.spec.pip_size * Decimal::from(START_PIPS),
            |b| b.close,
        );
        let close = self.step(series, open);
        self.broker.mark_price(instrument, close);

        let from = series.bars.len().saturating_sub(count);
        Ok(series.bars[from..].to_vec())
    }
}
