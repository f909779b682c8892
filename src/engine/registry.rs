//! Market registry — resolves labelled outcome tokens into the authoritative
//! (YES, NO) pair per market.
//!
//! Validation is eager at startup; a market that fails validation is never
//! enabled. The mapping is immutable afterwards — the `markets on/off`
//! command only flips the enabled flag.

use std::collections::HashMap;

use anyhow::{bail, Result};
use tracing::info;

use crate::config::{LabelMode, MarketDescriptor};

use super::types::{MarketId, Outcome, Token, TokenId};

// ─────────────────────────────────────────────────────────
// Markets
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Market {
    pub market_id: MarketId,
    pub yes: Token,
    pub no: Token,
    pub enabled: bool,
}

impl Market {
    pub fn token(&self, outcome: Outcome) -> &Token {
        match outcome {
            Outcome::Yes => &self.yes,
            Outcome::No => &self.no,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Label resolution
// ─────────────────────────────────────────────────────────

/// Case-insensitive label → outcome. Strict mode accepts only yes/no.
fn resolve_label(label: &str, mode: LabelMode) -> Option<Outcome> {
    let l = label.trim().to_ascii_lowercase();
    match l.as_str() {
        "yes" => Some(Outcome::Yes),
        "no" => Some(Outcome::No),
        "true" | "y" | "1" if mode == LabelMode::Permissive => Some(Outcome::Yes),
        "false" | "n" | "0" if mode == LabelMode::Permissive => Some(Outcome::No),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────

pub struct MarketRegistry {
    markets: HashMap<MarketId, Market>,
    /// token id → (market id, outcome) reverse index for event routing.
    by_token: HashMap<TokenId, (MarketId, Outcome)>,
}

impl MarketRegistry {
    /// Validate every descriptor; any failure prevents startup of that
    /// market set entirely.
    pub fn from_descriptors(
        descriptors: &[MarketDescriptor],
        mode: LabelMode,
    ) -> Result<Self> {
        let mut markets = HashMap::new();
        let mut by_token = HashMap::new();

        for d in descriptors {
            let market = Self::validate_one(d, mode)?;
            if by_token.contains_key(&market.yes.id) || by_token.contains_key(&market.no.id) {
                bail!(
                    "market {}: token id reused across markets",
                    market.market_id
                );
            }
            by_token.insert(market.yes.id.clone(), (market.market_id.clone(), Outcome::Yes));
            by_token.insert(market.no.id.clone(), (market.market_id.clone(), Outcome::No));
            if markets.insert(market.market_id.clone(), market).is_some() {
                bail!("duplicate market id: {}", d.market_id);
            }
        }

        info!(markets = markets.len(), "market registry validated");
        Ok(Self { markets, by_token })
    }

    fn validate_one(d: &MarketDescriptor, mode: LabelMode) -> Result<Market> {
        if d.market_id.trim().is_empty() {
            bail!("market with empty id");
        }
        if d.outcomes.len() != 2 {
            bail!(
                "market {}: expected exactly 2 outcome tokens, got {}",
                d.market_id,
                d.outcomes.len()
            );
        }

        let mut yes: Option<Token> = None;
        let mut no: Option<Token> = None;
        for o in &d.outcomes {
            if o.token_id.trim().is_empty() {
                bail!("market {}: empty token id", d.market_id);
            }
            let outcome = match resolve_label(&o.label, mode) {
                Some(v) => v,
                None => bail!(
                    "market {}: unresolvable outcome label {:?}",
                    d.market_id,
                    o.label
                ),
            };
            let token = Token {
                id: o.token_id.clone(),
                tick_size: o.tick_size,
                lot_size: o.lot_size,
            };
            let slot = match outcome {
                Outcome::Yes => &mut yes,
                Outcome::No => &mut no,
            };
            if slot.is_some() {
                bail!(
                    "market {}: label collision, two tokens resolve to {}",
                    d.market_id,
                    outcome.as_str()
                );
            }
            *slot = Some(token);
        }

        let (yes, no) = match (yes, no) {
            (Some(y), Some(n)) => (y, n),
            _ => bail!("market {}: need one YES and one NO token", d.market_id),
        };
        if yes.id == no.id {
            bail!("market {}: YES and NO share a token id", d.market_id);
        }

        Ok(Market {
            market_id: d.market_id.clone(),
            yes,
            no,
            enabled: true,
        })
    }

    pub fn get(&self, market_id: &str) -> Option<&Market> {
        self.markets.get(market_id)
    }

    pub fn lookup_token(&self, token_id: &str) -> Option<(&MarketId, Outcome)> {
        self.by_token.get(token_id).map(|(m, o)| (m, *o))
    }

    pub fn markets(&self) -> impl Iterator<Item = &Market> {
        self.markets.values()
    }

    pub fn token_ids(&self) -> Vec<TokenId> {
        self.markets
            .values()
            .flat_map(|m| [m.yes.id.clone(), m.no.id.clone()])
            .collect()
    }

    pub fn is_enabled(&self, market_id: &str) -> bool {
        self.markets.get(market_id).map(|m| m.enabled).unwrap_or(false)
    }

    /// Flip enabled flags; unknown ids are reported back, known ids still
    /// toggle. The token mapping never changes here.
    pub fn set_enabled(&mut self, market_ids: &[String], enabled: bool) -> Vec<String> {
        let mut unknown = Vec::new();
        for id in market_ids {
            match self.markets.get_mut(id) {
                Some(m) => m.enabled = enabled,
                None => unknown.push(id.clone()),
            }
        }
        unknown
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutcomeDescriptor;

    fn descriptor(labels: [(&str, &str); 2]) -> MarketDescriptor {
        MarketDescriptor {
            market_id: "m1".into(),
            outcomes: labels
                .iter()
                .map(|(label, token)| OutcomeDescriptor {
                    label: label.to_string(),
                    token_id: token.to_string(),
                    tick_size: 0.001,
                    lot_size: 0.01,
                })
                .collect(),
        }
    }

    #[test]
    fn test_strict_accepts_yes_no_case_insensitive() {
        let reg = MarketRegistry::from_descriptors(
            &[descriptor([("YES", "t1"), ("No", "t2")])],
            LabelMode::Strict,
        )
        .unwrap();
        let m = reg.get("m1").unwrap();
        assert_eq!(m.yes.id, "t1");
        assert_eq!(m.no.id, "t2");
        assert!(m.enabled);
    }

    #[test]
    fn test_strict_rejects_true_false() {
        let err = MarketRegistry::from_descriptors(
            &[descriptor([("true", "t1"), ("false", "t2")])],
            LabelMode::Strict,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_permissive_accepts_alternate_labels() {
        for labels in [
            [("true", "t1"), ("false", "t2")],
            [("y", "t1"), ("n", "t2")],
            [("1", "t1"), ("0", "t2")],
        ] {
            let reg =
                MarketRegistry::from_descriptors(&[descriptor(labels)], LabelMode::Permissive)
                    .unwrap();
            assert_eq!(reg.get("m1").unwrap().yes.id, "t1");
        }
    }

    #[test]
    fn test_permissive_rejects_arbitrary_labels() {
        assert!(MarketRegistry::from_descriptors(
            &[descriptor([("up", "t1"), ("down", "t2")])],
            LabelMode::Permissive,
        )
        .is_err());
    }

    #[test]
    fn test_rejects_label_collision() {
        assert!(MarketRegistry::from_descriptors(
            &[descriptor([("yes", "t1"), ("YES", "t2")])],
            LabelMode::Strict,
        )
        .is_err());
    }

    #[test]
    fn test_rejects_shared_token_id() {
        assert!(MarketRegistry::from_descriptors(
            &[descriptor([("yes", "t1"), ("no", "t1")])],
            LabelMode::Strict,
        )
        .is_err());
    }

    #[test]
    fn test_toggle_enabled_only() {
        let mut reg = MarketRegistry::from_descriptors(
            &[descriptor([("yes", "t1"), ("no", "t2")])],
            LabelMode::Strict,
        )
        .unwrap();
        let unknown = reg.set_enabled(&["m1".into(), "ghost".into()], false);
        assert_eq!(unknown, vec!["ghost".to_string()]);
        assert!(!reg.is_enabled("m1"));
        // Mapping is untouched.
        assert_eq!(reg.get("m1").unwrap().yes.id, "t1");
        reg.set_enabled(&["m1".into()], true);
        assert!(reg.is_enabled("m1"));
    }
}
