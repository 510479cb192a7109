//! Proxy manager
//!
//! Coordinates routing decisions: owns the enabled flag, the upstream
//! configuration, the rule engine and the per-action counters.

use std::net::IpAddr;

use crate::config::EngineConfig;
use crate::rule::{GeoIpResolver, RouteAction, RuleEngine, RuleLoadReport};

/// Routing decision with match metadata, cached on the NAT entry
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub action: RouteAction,
    /// Type name of the matched rule, e.g. "DOMAIN-SUFFIX"
    pub matched_rule: Option<String>,
    /// Value of the matched rule, e.g. "example.com"
    pub matched_pattern: Option<String>,
}

impl RoutingDecision {
    pub fn new(action: RouteAction) -> Self {
        Self {
            action,
            matched_rule: None,
            matched_pattern: None,
        }
    }

    pub fn with_match(
        action: RouteAction,
        rule: impl Into<String>,
        pattern: Option<String>,
    ) -> Self {
        Self {
            action,
            matched_rule: Some(rule.into()),
            matched_pattern: pattern,
        }
    }
}

/// Per-action classification counters
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteCounters {
    pub direct: u64,
    pub proxied: u64,
    pub rejected: u64,
}

/// Manages routing configuration and decisions
pub struct ProxyManager {
    config: EngineConfig,
    rule_engine: RuleEngine,
    counters: RouteCounters,
    enabled: bool,
}

impl ProxyManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            rule_engine: RuleEngine::new(),
            counters: RouteCounters::default(),
            enabled: true,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Replace the rule table. Returns the accepted count and warnings.
    pub fn load_rules(&mut self, text: &str) -> RuleLoadReport {
        let report = self.rule_engine.load_from_text(text);
        log::info!(
            "loaded {} rules ({} warnings)",
            report.accepted,
            report.warnings.len()
        );
        report
    }

    pub fn clear_rules(&mut self) {
        self.rule_engine.clear();
    }

    pub fn rule_count(&self) -> usize {
        self.rule_engine.len()
    }

    pub fn set_geoip_resolver(&mut self, resolver: Box<dyn GeoIpResolver>) {
        self.rule_engine.set_geoip_resolver(resolver);
    }

    /// Evaluate routing for a connection. When disabled every flow goes
    /// Direct regardless of the rule table.
    pub fn evaluate_route(
        &mut self,
        domain: Option<&str>,
        dst_ip: Option<IpAddr>,
        dst_port: u16,
    ) -> RoutingDecision {
        let decision = if self.enabled {
            let (action, matched) = self.rule_engine.evaluate_matched(domain, dst_ip, dst_port);
            match matched {
                Some(rule) => RoutingDecision::with_match(
                    action,
                    rule.matcher.type_name(),
                    rule.matcher.pattern(),
                ),
                None => RoutingDecision::new(action),
            }
        } else {
            RoutingDecision::new(RouteAction::Direct)
        };

        match decision.action {
            RouteAction::Direct => self.counters.direct += 1,
            RouteAction::Proxy => self.counters.proxied += 1,
            RouteAction::Reject => self.counters.rejected += 1,
        }

        decision
    }

    pub fn counters(&self) -> RouteCounters {
        self.counters
    }

    pub fn reset_counters(&mut self) {
        self.counters = RouteCounters::default();
    }

    /// True when the rule table contains any DOMAIN-* matcher, meaning a
    /// sniffed host could change the outcome of classification.
    pub fn has_domain_rules(&self) -> bool {
        use crate::rule::RuleMatcher;
        self.rule_engine.rules().iter().any(|r| {
            matches!(
                r.matcher,
                RuleMatcher::Domain(_) | RuleMatcher::DomainSuffix(_) | RuleMatcher::DomainKeyword(_)
            )
        })
    }
}
