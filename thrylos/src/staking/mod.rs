//! Staking: stake lifecycle and time-weighted reward settlement.
//!
//! Each address has an ordered event log of `(timestamp, delta)` pairs;
//! the running sum is its active stake. At the end of a reward period
//! `[T0, T1]` every address is credited
//! `budget · I_a / I_total`, where `I_a = Σ stake_k · (t_{k+1} − t_k)` is
//! the integral of its piecewise-constant stake curve clamped to the
//! period. Rounding is banker's rounding; the residual is carried into
//! the next period's budget so that `Σ paid ≤ budget` holds exactly.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::storage::ChainStore;
use crate::types::Address;
use crate::{ChainConfig, ChainResult};

/// Staking errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StakingError {
    #[error("Insufficient stake: have {have}, need {need}")]
    InsufficientStake { have: i64, need: i64 },
    #[error("Invalid stake amount: {0}")]
    InvalidAmount(i64),
}

/// One stake-change event. Positive delta stakes, negative unstakes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeEvent {
    /// Unix seconds
    pub timestamp: i64,
    /// Base units added (or removed, when negative)
    pub delta: i64,
}

/// An address's aggregate stake position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeRecord {
    /// The staking address
    pub owner: Address,
    /// Currently active stake in base units
    pub amount: i64,
    /// When the first stake was created
    pub created_at: i64,
    /// False once the active amount has been unstaked to zero
    pub active: bool,
}

/// Reward-period state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StakingPool {
    /// Start of the current period (end of the last settled one)
    pub last_reward_time: i64,
    /// Budget distributed per period, in base units
    pub period_budget: i64,
    /// Minimum accepted stake, in base units
    pub min_stake: i64,
    /// Rounding residual carried into the next period
    pub remainder: i64,
}

struct StakingState {
    events: BTreeMap<Address, Vec<StakeEvent>>,
    records: BTreeMap<Address, StakeRecord>,
    pool: StakingPool,
}

/// The staking service. One mutex guards the event logs and the pool;
/// reward integration holds it for a duration bounded by the number of
/// events in the period.
pub struct StakingService {
    store: Arc<ChainStore>,
    state: Mutex<StakingState>,
}

impl StakingService {
    /// Open the service, replaying persisted stake events. The first
    /// reward period starts at `now`.
    pub fn open(store: Arc<ChainStore>, config: &ChainConfig, now: i64) -> ChainResult<Self> {
        let mut events: BTreeMap<Address, Vec<StakeEvent>> = BTreeMap::new();
        let mut records: BTreeMap<Address, StakeRecord> = BTreeMap::new();

        for address in store.stake_addresses()? {
            let log: Vec<StakeEvent> = store
                .load_stake_events(&address)?
                .into_iter()
                .map(|(timestamp, delta)| StakeEvent { timestamp, delta })
                .collect();
            if log.is_empty() {
                continue;
            }
            let amount: i64 = log.iter().map(|e| e.delta).sum();
            records.insert(
                address.clone(),
                StakeRecord {
                    owner: address.clone(),
                    amount,
                    created_at: log[0].timestamp,
                    active: amount > 0,
                },
            );
            events.insert(address, log);
        }

        Ok(Self {
            store,
            state: Mutex::new(StakingState {
                events,
                records,
                pool: StakingPool {
                    last_reward_time: now,
                    period_budget: config.period_budget,
                    min_stake: config.min_stake,
                    remainder: 0,
                },
            }),
        })
    }

    /// Lock tokens. The amount must meet the pool minimum.
    pub fn create_stake(&self, owner: &Address, amount: i64, timestamp: i64) -> ChainResult<()> {
        if amount <= 0 {
            return Err(StakingError::InvalidAmount(amount).into());
        }
        let mut state = self.state.lock();
        if amount < state.pool.min_stake {
            return Err(StakingError::InsufficientStake {
                have: amount,
                need: state.pool.min_stake,
            }
            .into());
        }

        self.store.put_stake_event(owner, timestamp, amount)?;
        push_event(&mut state.events, owner, timestamp, amount);

        let record = state
            .records
            .entry(owner.clone())
            .or_insert_with(|| StakeRecord {
                owner: owner.clone(),
                amount: 0,
                created_at: timestamp,
                active: true,
            });
        record.amount += amount;
        record.active = true;

        info!("Stake created: {} locked {} at {}", owner, amount, timestamp);
        Ok(())
    }

    /// Release tokens. Fails if more than the active stake is requested;
    /// releasing the full amount closes the record.
    pub fn unstake(&self, owner: &Address, amount: i64, timestamp: i64) -> ChainResult<()> {
        if amount <= 0 {
            return Err(StakingError::InvalidAmount(amount).into());
        }
        let mut state = self.state.lock();
        let active = state
            .records
            .get(owner)
            .filter(|r| r.active)
            .map(|r| r.amount)
            .unwrap_or(0);
        if amount > active {
            return Err(StakingError::InsufficientStake {
                have: active,
                need: amount,
            }
            .into());
        }

        self.store.put_stake_event(owner, timestamp, -amount)?;
        push_event(&mut state.events, owner, timestamp, -amount);

        let record = state.records.get_mut(owner).expect("record exists");
        record.amount -= amount;
        if record.amount == 0 {
            record.active = false;
        }

        info!("Unstaked: {} released {} at {}", owner, amount, timestamp);
        Ok(())
    }

    /// An address's currently active stake.
    pub fn active_stake(&self, owner: &Address) -> i64 {
        self.state
            .lock()
            .records
            .get(owner)
            .filter(|r| r.active)
            .map(|r| r.amount)
            .unwrap_or(0)
    }

    /// An address's stake record, if it ever staked.
    pub fn record(&self, owner: &Address) -> Option<StakeRecord> {
        self.state.lock().records.get(owner).cloned()
    }

    /// Snapshot of the pool state.
    pub fn pool(&self) -> StakingPool {
        self.state.lock().pool
    }

    /// Reset the period start. Used when bootstrapping a node against a
    /// known schedule.
    pub fn set_period_start(&self, t0: i64) {
        self.state.lock().pool.last_reward_time = t0;
    }

    /// Settle the period ending at `t1` and return the per-address
    /// rewards. Advances the period start to `t1`; the rounding residual
    /// is carried into the next period's budget.
    pub fn settle_period(&self, t1: i64) -> ChainResult<BTreeMap<Address, i64>> {
        let mut state = self.state.lock();
        let t0 = state.pool.last_reward_time;
        if t1 <= t0 {
            return Ok(BTreeMap::new());
        }

        let mut integrals: BTreeMap<Address, i128> = BTreeMap::new();
        for (address, events) in &state.events {
            let integral = integrate(events, t0, t1);
            if integral > 0 {
                integrals.insert(address.clone(), integral);
            }
        }

        state.pool.last_reward_time = t1;
        let total: i128 = integrals.values().sum();
        if total == 0 {
            debug!("Reward period [{t0}, {t1}]: no active stake");
            return Ok(BTreeMap::new());
        }

        let distributable = state.pool.period_budget as i128 + state.pool.remainder as i128;
        let mut rewards: BTreeMap<Address, i64> = integrals
            .iter()
            .map(|(address, integral)| {
                let reward = round_half_even(distributable * integral, total);
                (address.clone(), reward as i64)
            })
            .collect();

        // Independent banker's rounding can overshoot the budget by a few
        // base units; trim the largest rewards until the sum fits.
        let mut paid: i128 = rewards.values().map(|r| *r as i128).sum();
        while paid > distributable {
            let largest = rewards
                .iter()
                .max_by_key(|(address, reward)| (**reward, std::cmp::Reverse((*address).clone())))
                .map(|(address, _)| address.clone())
                .expect("rewards nonempty while sum positive");
            *rewards.get_mut(&largest).expect("key present") -= 1;
            paid -= 1;
        }
        rewards.retain(|_, r| *r > 0);

        state.pool.remainder = (distributable - paid) as i64;
        info!(
            "Reward period [{t0}, {t1}]: paid {} to {} addresses, remainder {}",
            paid,
            rewards.len(),
            state.pool.remainder
        );
        Ok(rewards)
    }
}

fn push_event(
    events: &mut BTreeMap<Address, Vec<StakeEvent>>,
    owner: &Address,
    timestamp: i64,
    delta: i64,
) {
    let log = events.entry(owner.clone()).or_default();
    log.push(StakeEvent { timestamp, delta });
    log.sort_by_key(|e| e.timestamp);
}

/// Integrate a piecewise-constant stake curve over `[t0, t1]`.
///
/// Events at or before `t0` contribute as a constant baseline from `t0`;
/// events at or after `t1` are truncated.
fn integrate(events: &[StakeEvent], t0: i64, t1: i64) -> i128 {
    let mut stake: i64 = events
        .iter()
        .filter(|e| e.timestamp <= t0)
        .map(|e| e.delta)
        .sum();

    let mut integral: i128 = 0;
    let mut last = t0;
    for event in events.iter().filter(|e| e.timestamp > t0) {
        if event.timestamp >= t1 {
            break;
        }
        integral += stake as i128 * (event.timestamp - last) as i128;
        stake += event.delta;
        last = event.timestamp;
    }
    integral += stake as i128 * (t1 - last) as i128;
    integral.max(0)
}

/// Round `num / den` half-to-even. Both arguments must be non-negative.
fn round_half_even(num: i128, den: i128) -> i128 {
    let quotient = num / den;
    let remainder = num % den;
    let twice = remainder * 2;
    if twice > den || (twice == den && quotient % 2 != 0) {
        quotient + 1
    } else {
        quotient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKV;
    use thrylos_crypto::{generate_key, AtRestCipher, KeyPair};

    const HOUR: i64 = 3_600;

    fn addr(seed: &[u8]) -> Address {
        Address::from_public_key(&KeyPair::from_seed(seed).public_key())
    }

    fn service(budget: i64, min_stake: i64, t0: i64) -> StakingService {
        let cipher = AtRestCipher::new(&generate_key()).unwrap();
        let store = Arc::new(ChainStore::new(Arc::new(MemoryKV::new()), cipher));
        let config = ChainConfig {
            period_budget: budget,
            min_stake,
            ..ChainConfig::default()
        };
        StakingService::open(store, &config, t0).unwrap()
    }

    #[test]
    fn test_round_half_even() {
        assert_eq!(round_half_even(10, 4), 2); // 2.5 → 2
        assert_eq!(round_half_even(14, 4), 4); // 3.5 → 4
        assert_eq!(round_half_even(13, 4), 3); // 3.25 → 3
        assert_eq!(round_half_even(15, 4), 4); // 3.75 → 4
        assert_eq!(round_half_even(12, 4), 3); // exact
    }

    #[test]
    fn test_stake_below_minimum_rejected() {
        let svc = service(1_000, 100, 0);
        let a = addr(b"a");
        let err = svc.create_stake(&a, 50, 10).unwrap_err();
        assert_eq!(
            err,
            StakingError::InsufficientStake { have: 50, need: 100 }.into()
        );
    }

    #[test]
    fn test_unstake_more_than_active_rejected() {
        let svc = service(1_000, 10, 0);
        let a = addr(b"a");
        svc.create_stake(&a, 100, 10).unwrap();
        let err = svc.unstake(&a, 150, 20).unwrap_err();
        assert_eq!(
            err,
            StakingError::InsufficientStake {
                have: 100,
                need: 150
            }
            .into()
        );
    }

    #[test]
    fn test_full_unstake_closes_record() {
        let svc = service(1_000, 10, 0);
        let a = addr(b"a");
        svc.create_stake(&a, 100, 10).unwrap();
        svc.unstake(&a, 100, 20).unwrap();

        let record = svc.record(&a).unwrap();
        assert_eq!(record.amount, 0);
        assert!(!record.active);
        assert_eq!(svc.active_stake(&a), 0);
    }

    #[test]
    fn test_constant_stakes_split_by_ratio() {
        // 100 and 300 staked for the whole period split the budget 1:3.
        let svc = service(4_000, 10, 0);
        let a = addr(b"a");
        let b = addr(b"b");
        svc.create_stake(&a, 100, 0).unwrap();
        svc.create_stake(&b, 300, 0).unwrap();

        let rewards = svc.settle_period(24 * HOUR).unwrap();
        let ra = *rewards.get(&a).unwrap();
        let rb = *rewards.get(&b).unwrap();

        assert!((rb - 3 * ra).abs() <= 1, "ratio not 1:3: {ra} vs {rb}");
        assert!(ra + rb <= 4_000);
    }

    #[test]
    fn test_half_period_double_amount_equivalence() {
        // Half the period at twice the amount equals the full period at
        // the baseline.
        let svc = service(10_000, 10, 0);
        let half = addr(b"half-double");
        let full = addr(b"full-single");

        svc.create_stake(&half, 200, 0).unwrap();
        svc.unstake(&half, 200, 12 * HOUR).unwrap();
        svc.create_stake(&full, 100, 0).unwrap();

        let rewards = svc.settle_period(24 * HOUR).unwrap();
        let rh = *rewards.get(&half).unwrap();
        let rf = *rewards.get(&full).unwrap();
        assert!((rh - rf).abs() <= 1, "expected equal rewards: {rh} vs {rf}");
    }

    #[test]
    fn test_overlapping_stakes_match_integrals() {
        // X stakes 100 at T0 and unstakes 50 at T0+12h;
        // Y stakes 200 at T0 and 150 more at T0+5h.
        // Integrals: X = 100·12 + 50·12 = 1800 unit·h;
        //            Y = 200·5 + 350·19 = 7650 unit·h.
        let budget = 9_450;
        let svc = service(budget, 10, 0);
        let x = addr(b"x");
        let y = addr(b"y");

        svc.create_stake(&x, 100, 0).unwrap();
        svc.unstake(&x, 50, 12 * HOUR).unwrap();
        svc.create_stake(&y, 200, 0).unwrap();
        svc.create_stake(&y, 150, 5 * HOUR).unwrap();

        let rewards = svc.settle_period(24 * HOUR).unwrap();
        let rx = *rewards.get(&x).unwrap() as i128;
        let ry = *rewards.get(&y).unwrap() as i128;

        // Proportional to 1800 : 7650 within one base unit.
        assert!((rx * 7_650 - ry * 1_800).abs() <= 7_650 + 1_800);
        assert!(rx + ry <= budget as i128);
    }

    #[test]
    fn test_identical_curves_identical_rewards() {
        let svc = service(99_999, 10, 0);
        let a = addr(b"twin-a");
        let b = addr(b"twin-b");

        for address in [&a, &b] {
            svc.create_stake(address, 500, HOUR).unwrap();
            svc.unstake(address, 200, 6 * HOUR).unwrap();
        }

        let rewards = svc.settle_period(24 * HOUR).unwrap();
        assert_eq!(rewards.get(&a), rewards.get(&b));
    }

    #[test]
    fn test_remainder_carries_forward() {
        // Budget 100 over three equal stakers: 33+33+33 paid, 1 carried.
        let svc = service(100, 1, 0);
        for seed in [b"s1".as_slice(), b"s2", b"s3"] {
            svc.create_stake(&addr(seed), 50, 0).unwrap();
        }

        let rewards = svc.settle_period(HOUR).unwrap();
        let paid: i64 = rewards.values().sum();
        assert!(paid <= 100);
        assert_eq!(svc.pool().remainder, 100 - paid);

        // Next period distributes budget + carried remainder.
        let rewards = svc.settle_period(2 * HOUR).unwrap();
        let paid_second: i64 = rewards.values().sum();
        assert!(paid_second <= 100 + (100 - paid));
    }

    #[test]
    fn test_events_outside_period_clamped() {
        let svc = service(1_000, 10, 100 * HOUR);
        let a = addr(b"early");

        // Staked long before the period: contributes as a constant.
        svc.create_stake(&a, 100, 0).unwrap();
        let rewards = svc.settle_period(101 * HOUR).unwrap();
        // Sole staker takes the whole budget.
        assert_eq!(*rewards.get(&a).unwrap(), 1_000);
    }

    #[test]
    fn test_no_stake_no_rewards() {
        let svc = service(1_000, 10, 0);
        let rewards = svc.settle_period(HOUR).unwrap();
        assert!(rewards.is_empty());
        assert_eq!(svc.pool().remainder, 0);
    }

    #[test]
    fn test_period_only_moves_forward() {
        let svc = service(1_000, 10, 1_000);
        assert!(svc.settle_period(500).unwrap().is_empty());
        assert_eq!(svc.pool().last_reward_time, 1_000);
    }

    #[test]
    fn test_reopen_replays_persisted_events() {
        let cipher = AtRestCipher::new(&generate_key()).unwrap();
        let store = Arc::new(ChainStore::new(Arc::new(MemoryKV::new()), cipher));
        let config = ChainConfig {
            period_budget: 1_000,
            min_stake: 10,
            ..ChainConfig::default()
        };

        let a = addr(b"durable");
        {
            let svc = StakingService::open(Arc::clone(&store), &config, 0).unwrap();
            svc.create_stake(&a, 300, 10).unwrap();
            svc.unstake(&a, 100, 20).unwrap();
        }

        let svc = StakingService::open(store, &config, 0).unwrap();
        assert_eq!(svc.active_stake(&a), 200);
        let record = svc.record(&a).unwrap();
        assert_eq!(record.created_at, 10);
        assert!(record.active);
    }
}
