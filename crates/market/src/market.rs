use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::MarketConfig;
use crate::entity::Band;
use crate::entity::EntitySnapshot;
use crate::ledger::Ledger;
use crate::MarketError;
use crate::Result;

/// Slopes within `[-FLAT_SLOPE, FLAT_SLOPE]` are considered flat.
pub const FLAT_SLOPE: f64 = 0.1;

/// Fraction of the maximum a flat entity is granted above its usage.
const FLAT_STEP: f64 = 0.01;

/// Cycles per second granted to each entity for the upcoming tick.
pub type Allocation = BTreeMap<String, u64>;

/// Diagnostics record of the market, serialized for external observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MarketReport {
    pub accounts: BTreeMap<String, u64>,
    /// Bidding rounds of the last update
    pub iterations: u64,
    /// Cycles sold by base selling and bidding in the last update
    pub sold: u64,
    /// Cycles nobody received in the last update
    pub lost: u64,
    /// Updates run since the last reset
    pub ticks: u64,
    /// Cycles lost since the last reset
    pub total_lost: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Diagnostics {
    iterations: u64,
    sold: u64,
    lost: u64,
    ticks: u64,
    total_lost: u64,
}

/// An entity whose desired allocation exceeds its guarantee.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Buyer {
    id: String,
    need: u64,
}

/// Outcome of the bidding phase.
#[derive(Debug, Default)]
struct Auction {
    /// Buyers that could not buy anything, with their remaining need
    failed: Vec<Buyer>,
    /// Sum of the remaining needs of the failed buyers
    all_needed: u64,
    iterations: u64,
}

/// Auction-based allocator of a fixed pool of cycles.
///
/// # Algorithm Overview
///
/// Each [`Market::update`] runs three phases over the whole entity set:
///
/// 1. **Base selling**: every entity is classified into a [`Band`] and granted
///    up to its nominal share. Entities wanting less than nominal earn the
///    difference as currency, entities wanting more become buyers.
/// 2. **Bidding**: in rounds, each buyer spends at most `window_size` of its
///    own balance to buy cycles left in the pool.
/// 3. **Leftover redistribution**: cycles still unsold are split between the
///    buyers that ran out of money, proportionally to their remaining need.
#[derive(Debug)]
pub struct Market {
    cfg: MarketConfig,
    capacity: u64,
    ledger: Ledger,
    diagnostics: Diagnostics,
}

impl Market {
    /// Creates a market distributing `capacity` cycles per second.
    pub fn new(cfg: MarketConfig, capacity: u64) -> Result<Self, MarketError> {
        cfg.validate()?;
        if capacity == 0 {
            return Err(error_stack::report!(MarketError::invalid_config(
                "market capacity must be positive"
            )));
        }

        tracing::debug!(
            capacity = capacity,
            window_size = cfg.window_size,
            trigger_increment = %format!("{:.1}%", cfg.trigger_increment * 100.0),
            trigger_decrement = %format!("{:.1}%", cfg.trigger_decrement * 100.0),
            "Initialized market"
        );

        Ok(Self {
            cfg,
            capacity,
            ledger: Ledger::new(),
            diagnostics: Diagnostics::default(),
        })
    }

    pub fn config(&self) -> &MarketConfig {
        &self.cfg
    }

    /// Swaps the whole configuration; the ledger is kept.
    pub fn set_config(&mut self, cfg: MarketConfig) -> Result<(), MarketError> {
        cfg.validate()?;
        self.cfg = cfg;
        Ok(())
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn iterations(&self) -> u64 {
        self.diagnostics.iterations
    }

    pub fn sold(&self) -> u64 {
        self.diagnostics.sold
    }

    pub fn lost(&self) -> u64 {
        self.diagnostics.lost
    }

    /// Zeroes every balance and the diagnostic counters.
    pub fn reset(&mut self) {
        self.ledger.reset();
        self.diagnostics = Diagnostics::default();
        tracing::info!("Market accounts and counters reset");
    }

    pub fn report(&self) -> MarketReport {
        MarketReport {
            accounts: self.ledger.accounts().clone(),
            iterations: self.diagnostics.iterations,
            sold: self.diagnostics.sold,
            lost: self.diagnostics.lost,
            ticks: self.diagnostics.ticks,
            total_lost: self.diagnostics.total_lost,
        }
    }

    /// Demand class of `entity` for this tick.
    pub fn classify(&self, entity: &EntitySnapshot) -> Band {
        let nominal = self.nominal(entity);
        self.classify_with(entity, self.effective_capping(entity, nominal))
    }

    /// Guaranteed share of `entity` under the current configuration.
    pub fn nominal(&self, entity: &EntitySnapshot) -> u64 {
        self.cfg
            .nominal
            .nominal(entity.nominal_frequency_mhz, entity.max_capacity)
    }

    /// Runs one full auction and returns the cycles granted per entity.
    ///
    /// Values are per second; converting them to a quota for an enforcement
    /// period is left to the caller.
    pub fn update(&mut self, entities: &[EntitySnapshot]) -> Allocation {
        if entities.is_empty() {
            return Allocation::new();
        }

        let mut market = self.capacity;

        // Step 1: guarantee the base cycles, collect the buyers
        let (mut allocated, buyers) = self.sell_base_cycles(entities, &mut market);

        // Step 2: let buyers spend their own money on what is left
        let auction = self.buy_cycles(&mut allocated, buyers, &mut market);
        let sold = self.capacity - market;

        // Step 3: split the rest between the buyers that could not pay
        let lost = Self::redistribute(&mut allocated, &auction, market);

        self.diagnostics = Diagnostics {
            iterations: auction.iterations,
            sold,
            lost,
            ticks: self.diagnostics.ticks + 1,
            total_lost: self.diagnostics.total_lost.saturating_add(lost),
        };

        tracing::debug!(
            entities = entities.len(),
            sold = sold,
            lost = lost,
            iterations = auction.iterations,
            failed_buyers = auction.failed.len(),
            "Market update"
        );

        allocated
    }

    fn effective_capping(&self, entity: &EntitySnapshot, nominal: u64) -> u64 {
        entity.capping.limit().unwrap_or(nominal)
    }

    fn classify_with(&self, entity: &EntitySnapshot, capping: u64) -> Band {
        // No counter read yet: hold the guarantee
        if !entity.observed {
            return Band::Stable;
        }
        if entity.slope.abs() <= FLAT_SLOPE {
            return Band::Flat;
        }

        let relative = entity.relative_usage(capping);
        if relative < self.cfg.trigger_decrement {
            Band::Falling
        } else if relative > self.cfg.trigger_increment {
            Band::Rising
        } else {
            Band::Stable
        }
    }

    /// Cycles the entity would like for the next tick, before any guarantee.
    fn desired_cycles(&self, band: Band, entity: &EntitySnapshot, capping: u64) -> u64 {
        match band {
            Band::Flat => {
                let step = (entity.max_capacity as f64 * FLAT_STEP) as u64;
                entity
                    .max_capacity
                    .min(entity.consumption.saturating_add(step))
            }
            Band::Falling => {
                let shrunk = (capping as f64 * (1.0 - self.cfg.decreasing_speed)) as u64;
                entity.consumption.max(shrunk)
            }
            Band::Rising => (capping as f64 * (1.0 + self.cfg.increasing_speed)) as u64,
            Band::Stable => capping,
        }
    }

    fn sell_base_cycles(
        &mut self,
        entities: &[EntitySnapshot],
        market: &mut u64,
    ) -> (Allocation, Vec<Buyer>) {
        let mut allocated = Allocation::new();
        let mut buyers = Vec::new();

        for entity in entities {
            let max = entity.max_capacity;
            let nominal = self.nominal(entity);
            let capping = self.effective_capping(entity, nominal);
            let band = self.classify_with(entity, capping);
            let desired = self.desired_cycles(band, entity, capping);

            let granted = nominal.min(desired).min(*market);
            *market -= granted;
            allocated.insert(entity.id.clone(), granted);

            if desired > nominal {
                self.ledger.credit(&entity.id, 0);
                let need = (desired - nominal).min(max.saturating_sub(nominal));
                if need > 0 {
                    buyers.push(Buyer {
                        id: entity.id.clone(),
                        need,
                    });
                }
            } else {
                self.ledger.credit(&entity.id, nominal - desired);
            }

            tracing::trace!(
                entity = %entity.id,
                band = %band,
                usage = entity.consumption,
                nominal = nominal,
                capping = capping,
                desired = desired,
                granted = granted,
                "Base cycles sold"
            );
        }

        (allocated, buyers)
    }

    fn buy_cycles(
        &mut self,
        allocated: &mut Allocation,
        buyers: Vec<Buyer>,
        market: &mut u64,
    ) -> Auction {
        let mut auction = Auction::default();
        let mut active = buyers;

        // Every round removes a buyer or makes each remaining one buy at least
        // one cycle, so the loop is bounded by need, money and market.
        while *market > 0 && !active.is_empty() {
            auction.iterations += 1;
            active = self.bid_round(active, allocated, market, &mut auction);
        }

        auction
    }

    /// One bidding round; returns the buyers still in need afterwards.
    fn bid_round(
        &mut self,
        active: Vec<Buyer>,
        allocated: &mut Allocation,
        market: &mut u64,
        auction: &mut Auction,
    ) -> Vec<Buyer> {
        let mut still_buying = Vec::with_capacity(active.len());

        for mut buyer in active {
            if buyer.need == 0 {
                continue;
            }

            let affordable = self.cfg.window_size.min(self.ledger.balance(&buyer.id));
            let bought = affordable.min(buyer.need).min(*market);

            if bought > 0 {
                self.ledger.debit(&buyer.id, bought);
                *allocated.entry(buyer.id.clone()).or_default() += bought;
                *market -= bought;
                buyer.need -= bought;
                if buyer.need > 0 {
                    still_buying.push(buyer);
                }
            } else {
                // No money or empty market, the next round would fail too
                auction.all_needed = auction.all_needed.saturating_add(buyer.need);
                auction.failed.push(buyer);
            }
        }

        still_buying
    }

    /// Splits the unsold cycles between failed buyers by need fraction and
    /// returns what remains unsold.
    fn redistribute(allocated: &mut Allocation, auction: &Auction, market: u64) -> u64 {
        if market == 0 {
            return 0;
        }
        if auction.all_needed == 0 {
            return market;
        }

        let rest = auction.all_needed.min(market);
        let mut not_sold = market;
        for buyer in &auction.failed {
            let share = buyer.need as f64 / auction.all_needed as f64;
            let add = ((share * rest as f64) as u64).min(not_sold);
            *allocated.entry(buyer.id.clone()).or_default() += add;
            not_sold -= add;
        }

        not_sold
    }
}
