//! In-memory reference implementation of the subscription contract's state
//! machine. The chain itself is out of scope for this crate; this reference
//! exists purely as a test double so the Fund Manager and Swap Router can be
//! exercised against deterministic, pure contract semantics instead of a
//! live chain.

use std::collections::HashMap;

use alloy_primitives::U256;

use crate::address::InternalAddress;

use super::{MAX_DAYS, SubscriptionError, require_safe_u64};

/// One of the six events the real contract emits; this reference collects
/// them in emission order so tests can assert on the event log directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PlanCreated { id: U256, name: String, price_per_day: U256 },
    PlanUpdated { id: U256, name: String, price_per_day: U256, active: bool },
    SubscriptionCreated { id: U256, plan_id: U256, subscriber: InternalAddress, expires_at: U256, paid: U256 },
    SubscriptionExtended { id: U256, plan_id: U256, extended_by: InternalAddress, new_expires_at: U256, paid: U256 },
    SubscriptionCancelled { id: U256, plan_id: U256, subscriber: InternalAddress },
    AcceptingSubscriptionsChanged { accepting: bool },
}

#[derive(Debug, Clone)]
struct PlanRow {
    name: String,
    price_per_day: U256,
    active: bool,
}

#[derive(Debug, Clone)]
struct SubRow {
    plan_id: U256,
    subscriber: InternalAddress,
    expires_at: u64,
    cancelled: bool,
    user_encrypted: String,
}

/// Deterministic, in-process reimplementation of the subscription contract.
/// `now` is supplied by the caller at every query/write instead of being
/// read from a wall clock, keeping the whole thing pure and trivially
/// testable for lapsed-extension and grace-period edge cases.
pub struct ReferenceContract {
    accepting: bool,
    grace_days: u64,
    payment_token: InternalAddress,
    next_plan_id: u64,
    next_sub_id: u64,
    plans: HashMap<u64, PlanRow>,
    subs: HashMap<u64, SubRow>,
    subscriber_index: HashMap<InternalAddress, Vec<u64>>,
    balance: U256,
    events: Vec<Event>,
}

impl Default for ReferenceContract {
    fn default() -> Self {
        Self {
            accepting: true,
            grace_days: 0,
            payment_token: InternalAddress::zero(),
            next_plan_id: 1,
            next_sub_id: 1,
            plans: HashMap::new(),
            subs: HashMap::new(),
            subscriber_index: HashMap::new(),
            balance: U256::ZERO,
            events: Vec::new(),
        }
    }
}

impl ReferenceContract {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn set_payment_token(&mut self, token: InternalAddress) {
        self.payment_token = token;
    }

    pub fn get_payment_token(&self) -> InternalAddress {
        self.payment_token
    }

    pub fn set_accepting(&mut self, accepting: bool) {
        self.accepting = accepting;
        self.events.push(Event::AcceptingSubscriptionsChanged { accepting });
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn set_grace(&mut self, days: u64) {
        self.grace_days = days;
    }

    pub fn get_grace(&self) -> u64 {
        self.grace_days
    }

    pub fn balance(&self) -> U256 {
        self.balance
    }

    pub fn create_plan(&mut self, name: &str, price_per_day: U256) -> Result<U256, SubscriptionError> {
        if price_per_day.is_zero() {
            return Err(SubscriptionError::ZeroPrice);
        }
        let id = self.next_plan_id;
        self.next_plan_id += 1;
        self.plans.insert(
            id,
            PlanRow {
                name: name.to_string(),
                price_per_day,
                active: true,
            },
        );
        let id = U256::from(id);
        self.events.push(Event::PlanCreated { id, name: name.to_string(), price_per_day });
        Ok(id)
    }

    pub fn update_plan(
        &mut self,
        id: U256,
        name: &str,
        price_per_day: U256,
        active: bool,
    ) -> Result<(), SubscriptionError> {
        if price_per_day.is_zero() {
            return Err(SubscriptionError::ZeroPrice);
        }
        let key = require_safe_u64(id)?;
        let plan = self.plans.get_mut(&key).ok_or(SubscriptionError::PlanNotFound(id))?;
        plan.name = name.to_string();
        plan.price_per_day = price_per_day;
        plan.active = active;
        self.events.push(Event::PlanUpdated { id, name: name.to_string(), price_per_day, active });
        Ok(())
    }

    pub fn get_plan(&self, id: U256) -> Result<super::Plan, SubscriptionError> {
        let key = require_safe_u64(id)?;
        let plan = self.plans.get(&key).ok_or(SubscriptionError::PlanNotFound(id))?;
        Ok(super::Plan {
            id,
            name: plan.name.clone(),
            price_per_day: plan.price_per_day,
            active: plan.active,
        })
    }

    pub fn get_total_plan_count(&self) -> u64 {
        self.plans.len() as u64
    }

    /// `buy_subscription` per spec §4.E: requires accepting, an active
    /// plan, `0 < days <= MAX_DAYS`, pulls `price*days`, then stores and
    /// indexes the new subscription.
    pub fn buy_subscription(
        &mut self,
        subscriber: InternalAddress,
        plan_id: U256,
        days: u64,
        user_encrypted: &str,
        now: u64,
    ) -> Result<U256, SubscriptionError> {
        if !self.accepting {
            return Err(SubscriptionError::NotAcceptingSubscriptions);
        }
        require_days(days)?;
        let plan_key = require_safe_u64(plan_id)?;
        let plan = self.plans.get(&plan_key).ok_or(SubscriptionError::PlanNotFound(plan_id))?;
        if !plan.active {
            return Err(SubscriptionError::PlanInactive(plan_id));
        }
        let price = plan.price_per_day;
        let paid = price * U256::from(days);

        let id = self.next_sub_id;
        self.next_sub_id += 1;
        let expires_at = now + days * super::DAY_UNIT;
        self.subs.insert(
            id,
            SubRow {
                plan_id,
                subscriber,
                expires_at,
                cancelled: false,
                user_encrypted: user_encrypted.to_string(),
            },
        );
        self.subscriber_index.entry(subscriber).or_default().push(id);
        self.balance += paid;

        let id = U256::from(id);
        self.events.push(Event::SubscriptionCreated {
            id,
            plan_id,
            subscriber,
            expires_at: U256::from(expires_at),
            paid,
        });
        Ok(id)
    }

    /// `extend_subscription` per spec §4.E: a lapsed subscription's new
    /// baseline is `now`, never back-credited against the old `expires_at`.
    pub fn extend_subscription(
        &mut self,
        extended_by: InternalAddress,
        sub_id: U256,
        days: u64,
        now: u64,
    ) -> Result<(), SubscriptionError> {
        require_days(days)?;
        let key = require_safe_u64(sub_id)?;
        let sub = self.subs.get(&key).ok_or(SubscriptionError::SubscriptionNotFound(sub_id))?;
        if sub.cancelled {
            return Err(SubscriptionError::AlreadyCancelled(sub_id));
        }
        let plan_key = require_safe_u64(sub.plan_id)?;
        let plan = self.plans.get(&plan_key).ok_or(SubscriptionError::PlanNotFound(sub.plan_id))?;
        if !plan.active {
            return Err(SubscriptionError::PlanInactive(sub.plan_id));
        }
        let price = plan.price_per_day;
        let plan_id = sub.plan_id;
        let paid = price * U256::from(days);

        let baseline = sub.expires_at.max(now);
        let new_expires_at = baseline + days * super::DAY_UNIT;

        let sub = self.subs.get_mut(&key).expect("checked above");
        sub.expires_at = new_expires_at;
        self.balance += paid;

        self.events.push(Event::SubscriptionExtended {
            id: sub_id,
            plan_id,
            extended_by,
            new_expires_at: U256::from(new_expires_at),
            paid,
        });
        Ok(())
    }

    pub fn cancel_subscription(&mut self, id: U256) -> Result<(), SubscriptionError> {
        let key = require_safe_u64(id)?;
        let sub = self.subs.get_mut(&key).ok_or(SubscriptionError::SubscriptionNotFound(id))?;
        if sub.cancelled {
            return Err(SubscriptionError::AlreadyCancelled(id));
        }
        sub.cancelled = true;
        let plan_id = sub.plan_id;
        let subscriber = sub.subscriber;
        self.events.push(Event::SubscriptionCancelled { id, plan_id, subscriber });
        Ok(())
    }

    pub fn get_subscription(&self, id: U256) -> Result<super::Subscription, SubscriptionError> {
        let key = require_safe_u64(id)?;
        let sub = self.subs.get(&key).ok_or(SubscriptionError::SubscriptionNotFound(id))?;
        Ok(super::Subscription {
            id,
            plan_id: sub.plan_id,
            subscriber: sub.subscriber,
            expires_at: U256::from(sub.expires_at),
            cancelled: sub.cancelled,
            user_encrypted: sub.user_encrypted.clone(),
        })
    }

    /// `active <=> (!cancelled && now < expires_at + grace*day_unit)`.
    pub fn is_subscription_active(&self, id: U256, now: u64) -> Result<bool, SubscriptionError> {
        let key = require_safe_u64(id)?;
        let sub = self.subs.get(&key).ok_or(SubscriptionError::SubscriptionNotFound(id))?;
        Ok(!sub.cancelled && now < sub.expires_at + self.grace_days * super::DAY_UNIT)
    }

    /// `floor((expires_at - now) / day_unit)` if positive, else 0. Always 0
    /// when the subscription is not active (cancelled or past grace).
    pub fn days_remaining(&self, id: U256, now: u64) -> Result<u64, SubscriptionError> {
        let key = require_safe_u64(id)?;
        let sub = self.subs.get(&key).ok_or(SubscriptionError::SubscriptionNotFound(id))?;
        if sub.cancelled || now >= sub.expires_at {
            return Ok(0);
        }
        Ok((sub.expires_at - now) / super::DAY_UNIT)
    }

    pub fn get_subscriptions_by_subscriber(
        &self,
        addr: &InternalAddress,
        offset: u64,
        limit: u32,
    ) -> Vec<U256> {
        let limit = limit.min(super::MAX_PAGE_LIMIT) as usize;
        self.subscriber_index
            .get(addr)
            .map(|ids| {
                ids.iter()
                    .skip(offset as usize)
                    .take(limit)
                    .map(|id| U256::from(*id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_subscription_count_by_subscriber(&self, addr: &InternalAddress) -> u64 {
        self.subscriber_index.get(addr).map(|v| v.len() as u64).unwrap_or(0)
    }

    pub fn get_total_subscription_count(&self) -> u64 {
        self.subs.len() as u64
    }

    pub fn get_user_encrypted(&self, id: U256) -> Result<String, SubscriptionError> {
        let key = require_safe_u64(id)?;
        Ok(self
            .subs
            .get(&key)
            .ok_or(SubscriptionError::SubscriptionNotFound(id))?
            .user_encrypted
            .clone())
    }

    /// Transfers the full payment-token balance to `to`, zeroing it.
    pub fn withdraw(&mut self, to: &InternalAddress) -> Result<U256, SubscriptionError> {
        if to.is_zero() {
            return Err(SubscriptionError::CallFailed("withdraw to zero address rejected".into()));
        }
        let amount = self.balance;
        self.balance = U256::ZERO;
        Ok(amount)
    }
}

fn require_days(days: u64) -> Result<(), SubscriptionError> {
    if days == 0 || days > MAX_DAYS {
        return Err(SubscriptionError::DaysOutOfRange(days));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> InternalAddress {
        let mut bytes = [0u8; 32];
        bytes[31] = byte;
        InternalAddress::from_bytes(bytes)
    }

    #[test]
    fn s1_buy_and_days_remaining() {
        let mut c = ReferenceContract::new();
        let plan_id = c.create_plan("Basic", U256::from(100u64)).unwrap();
        let subscriber = addr(1);
        let now = 1_000_000u64;
        let sub_id = c.buy_subscription(subscriber, plan_id, 7, "enc", now).unwrap();

        assert_eq!(c.days_remaining(sub_id, now).unwrap(), 7);
        assert!(c.is_subscription_active(sub_id, now).unwrap());
        assert_eq!(c.balance(), U256::from(700u64));
    }

    #[test]
    fn s2_extension_from_lapsed_does_not_back_credit() {
        let mut c = ReferenceContract::new();
        let plan_id = c.create_plan("Basic", U256::from(100u64)).unwrap();
        let subscriber = addr(1);
        let now = 1_000_000u64;
        let sub_id = c
            .buy_subscription(subscriber, plan_id, 1, "enc", now - 4 * super::super::DAY_UNIT)
            .unwrap();
        // manufacture a lapsed subscription: expires_at = now - 3 days.
        assert!(!c.is_subscription_active(sub_id, now).unwrap());

        c.extend_subscription(subscriber, sub_id, 2, now).unwrap();
        let sub = c.get_subscription(sub_id).unwrap();
        assert_eq!(sub.expires_at, U256::from(now + 2 * super::super::DAY_UNIT));
    }

    #[test]
    fn cancellation_is_idempotent_failing() {
        let mut c = ReferenceContract::new();
        let plan_id = c.create_plan("Basic", U256::from(100u64)).unwrap();
        let sub_id = c.buy_subscription(addr(1), plan_id, 1, "enc", 0).unwrap();
        c.cancel_subscription(sub_id).unwrap();
        assert!(matches!(
            c.cancel_subscription(sub_id),
            Err(SubscriptionError::AlreadyCancelled(_))
        ));
    }

    #[test]
    fn cancelled_is_never_active_regardless_of_expiry() {
        let mut c = ReferenceContract::new();
        let plan_id = c.create_plan("Basic", U256::from(100u64)).unwrap();
        let sub_id = c.buy_subscription(addr(1), plan_id, 100, "enc", 0).unwrap();
        c.cancel_subscription(sub_id).unwrap();
        assert!(!c.is_subscription_active(sub_id, 0).unwrap());
        assert_eq!(c.days_remaining(sub_id, 0).unwrap(), 0);
    }

    #[test]
    fn days_out_of_range_rejected() {
        let mut c = ReferenceContract::new();
        let plan_id = c.create_plan("Basic", U256::from(100u64)).unwrap();
        assert!(matches!(
            c.buy_subscription(addr(1), plan_id, 0, "enc", 0),
            Err(SubscriptionError::DaysOutOfRange(0))
        ));
        assert!(c.buy_subscription(addr(1), plan_id, MAX_DAYS, "enc", 0).is_ok());
        assert!(matches!(
            c.buy_subscription(addr(1), plan_id, MAX_DAYS + 1, "enc", 0),
            Err(SubscriptionError::DaysOutOfRange(_))
        ));
    }

    #[test]
    fn zero_price_rejected() {
        let mut c = ReferenceContract::new();
        assert!(matches!(
            c.create_plan("Free", U256::ZERO),
            Err(SubscriptionError::ZeroPrice)
        ));
    }

    #[test]
    fn withdraw_to_zero_rejected() {
        let mut c = ReferenceContract::new();
        assert!(c.withdraw(&InternalAddress::zero()).is_err());
    }

    #[test]
    fn grace_period_extends_active_window() {
        let mut c = ReferenceContract::new();
        c.set_grace(2);
        let plan_id = c.create_plan("Basic", U256::from(100u64)).unwrap();
        let now = 1_000_000u64;
        let sub_id = c.buy_subscription(addr(1), plan_id, 1, "enc", now).unwrap();
        let just_past_expiry = now + super::super::DAY_UNIT + 1;
        assert!(c.is_subscription_active(sub_id, just_past_expiry).unwrap());
    }
}
