//! The IP firewall.
//!
//! First-match-wins over the active rules in `(sort_order, id)` order. A
//! rule's `ip_range` is a CIDR block or a single address (treated as `/32`,
//! or `/128` for IPv6). An invalid or empty client IP is always denied;
//! when no rule matches, the configured default applies.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

use crate::database::{FirewallRule, RuleKind, Store};
use crate::runtime;

/// Admission check against the firewall rule set.
#[derive(Clone)]
pub struct Firewall
{
	store: Store,
	default_allow: bool,
}

impl Firewall
{
	/// Creates a firewall over the configuration store.
	pub fn new(store: Store, default_allow: bool) -> Self
	{
		Self { store, default_allow }
	}

	/// Whether the client IP is admitted.
	#[tracing::instrument(level = "debug", skip(self), err(level = "warn"))]
	pub async fn check(&self, client_ip: &str) -> runtime::Result<bool>
	{
		let rules = self.store.firewall_rules().await?;

		Ok(evaluate(client_ip, &rules, self.default_allow))
	}
}

impl std::fmt::Debug for Firewall
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_struct("Firewall").field("default_allow", &self.default_allow).finish()
	}
}

/// Evaluates the rule set for one client IP.
pub fn evaluate(client_ip: &str, rules: &[FirewallRule], default_allow: bool) -> bool
{
	let Ok(ip) = IpAddr::from_str(client_ip.trim()) else {
		return false;
	};

	for rule in rules.iter().filter(|rule| rule.is_active) {
		let Some(network) = parse_ip_range(&rule.ip_range) else {
			tracing::debug!(
				rule.id = %rule.id,
				rule.ip_range = %rule.ip_range,
				"unparsable firewall rule; skipping",
			);
			continue;
		};

		if network.contains(&ip) {
			return rule.rule_type == RuleKind::Allow;
		}
	}

	default_allow
}

/// Parses a CIDR block or a bare address (as a host network).
fn parse_ip_range(raw: &str) -> Option<IpNet>
{
	let trimmed = raw.trim();

	if let Ok(network) = IpNet::from_str(trimmed) {
		return Some(network);
	}

	IpAddr::from_str(trimmed).map(IpNet::from).ok()
}

#[cfg(test)]
mod tests
{
	use uuid::Uuid;

	use super::*;

	fn rule(kind: RuleKind, ip_range: &str, sort_order: i32) -> FirewallRule
	{
		FirewallRule {
			id: Uuid::new_v4(),
			rule_type: kind,
			ip_range: ip_range.to_owned(),
			is_active: true,
			sort_order,
		}
	}

	#[test]
	fn invalid_ip_is_denied()
	{
		assert!(!evaluate("", &[], true));
		assert!(!evaluate("not-an-ip", &[], true));
	}

	#[test]
	fn first_match_wins()
	{
		let rules = [
			rule(RuleKind::Deny, "10.0.0.0/8", 0),
			rule(RuleKind::Allow, "10.1.0.0/16", 1),
		];

		// The /8 deny comes first, so the /16 allow never fires.
		assert!(!evaluate("10.1.2.3", &rules, true));
	}

	#[test]
	fn allow_rule_admits()
	{
		let rules = [
			rule(RuleKind::Allow, "192.168.1.0/24", 0),
			rule(RuleKind::Deny, "0.0.0.0/0", 1),
		];

		assert!(evaluate("192.168.1.77", &rules, false));
		assert!(!evaluate("192.168.2.77", &rules, false));
	}

	#[test]
	fn single_ip_is_host_network()
	{
		let rules = [rule(RuleKind::Deny, "203.0.113.7", 0)];

		assert!(!evaluate("203.0.113.7", &rules, true));
		assert!(evaluate("203.0.113.8", &rules, true));
	}

	#[test]
	fn ipv6_single_address()
	{
		let rules = [rule(RuleKind::Deny, "2001:db8::1", 0)];

		assert!(!evaluate("2001:db8::1", &rules, true));
		assert!(evaluate("2001:db8::2", &rules, true));
	}

	#[test]
	fn no_match_uses_default()
	{
		let rules = [rule(RuleKind::Deny, "10.0.0.0/8", 0)];

		assert!(evaluate("192.0.2.1", &rules, true));
		assert!(!evaluate("192.0.2.1", &rules, false));
	}

	#[test]
	fn inactive_rules_are_skipped()
	{
		let mut denied = rule(RuleKind::Deny, "0.0.0.0/0", 0);

		denied.is_active = false;

		assert!(evaluate("192.0.2.1", &[denied], true));
	}

	#[test]
	fn unparsable_rules_are_skipped()
	{
		let rules = [
			rule(RuleKind::Deny, "not-a-cidr", 0),
			rule(RuleKind::Allow, "0.0.0.0/0", 1),
		];

		assert!(evaluate("192.0.2.1", &rules, false));
	}
}
