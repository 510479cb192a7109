//! Rule engine
//!
//! Surge-style routing rules, evaluated first-match over
//! (domain?, ip?, dst_port). A table always ends with exactly one FINAL
//! rule; the loader synthesizes `FINAL,DIRECT` when the text lacks one.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;

/// Rule files longer than this are truncated; the overflow is warned.
pub const MAX_RULE_LINES: usize = 10_000;

/// Routing action for a matched rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Direct connection without proxy
    Direct,
    /// Route through the SOCKS5 upstream
    Proxy,
    /// Reject the connection
    Reject,
}

impl RouteAction {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DIRECT" => Some(RouteAction::Direct),
            "PROXY" => Some(RouteAction::Proxy),
            "REJECT" => Some(RouteAction::Reject),
            _ => None,
        }
    }
}

impl fmt::Display for RouteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouteAction::Direct => "DIRECT",
            RouteAction::Proxy => "PROXY",
            RouteAction::Reject => "REJECT",
        };
        f.write_str(s)
    }
}

/// Predicate half of a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatcher {
    /// Case-insensitive exact domain equality
    Domain(String),
    /// Host ends with the suffix, boundary at '.' or full equality
    DomainSuffix(String),
    /// Host contains the keyword
    DomainKeyword(String),
    /// IP within the network (v4 or v6)
    IpCidr(IpNet),
    /// Country code, matched only when a resolver is injected
    GeoIp(String),
    /// Destination port equality
    DstPort(u16),
    /// Always matches; terminates the table
    Final,
}

impl RuleMatcher {
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleMatcher::Domain(_) => "DOMAIN",
            RuleMatcher::DomainSuffix(_) => "DOMAIN-SUFFIX",
            RuleMatcher::DomainKeyword(_) => "DOMAIN-KEYWORD",
            RuleMatcher::IpCidr(_) => "IP-CIDR",
            RuleMatcher::GeoIp(_) => "GEOIP",
            RuleMatcher::DstPort(_) => "DST-PORT",
            RuleMatcher::Final => "FINAL",
        }
    }

    pub fn pattern(&self) -> Option<String> {
        match self {
            RuleMatcher::Domain(d)
            | RuleMatcher::DomainSuffix(d)
            | RuleMatcher::DomainKeyword(d)
            | RuleMatcher::GeoIp(d) => Some(d.clone()),
            RuleMatcher::IpCidr(net) => Some(net.to_string()),
            RuleMatcher::DstPort(p) => Some(p.to_string()),
            RuleMatcher::Final => None,
        }
    }
}

/// Resolver injected for GEOIP rules. Without one the matcher never matches.
pub trait GeoIpResolver: Send {
    fn country_code(&self, ip: IpAddr) -> Option<String>;
}

/// A single routing rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub matcher: RuleMatcher,
    pub action: RouteAction,
}

impl Rule {
    pub fn new(matcher: RuleMatcher, action: RouteAction) -> Self {
        Self { matcher, action }
    }

    /// Serialize back to the text grammar. `parse` of the result yields a
    /// semantically equal rule.
    pub fn to_line(&self) -> String {
        match self.matcher.pattern() {
            Some(pattern) => format!("{},{},{}", self.matcher.type_name(), pattern, self.action),
            None => format!("FINAL,{}", self.action),
        }
    }

    pub fn matches(
        &self,
        domain: Option<&str>,
        ip: Option<IpAddr>,
        dst_port: u16,
        geoip: Option<&dyn GeoIpResolver>,
    ) -> bool {
        match &self.matcher {
            RuleMatcher::Domain(d) => domain
                .map(|h| h.eq_ignore_ascii_case(d))
                .unwrap_or(false),

            RuleMatcher::DomainSuffix(suffix) => domain
                .map(|h| {
                    let host = h.to_ascii_lowercase();
                    let suffix = suffix.to_ascii_lowercase();
                    let bare = suffix.trim_start_matches('.');
                    host == bare || host.ends_with(&format!(".{}", bare))
                })
                .unwrap_or(false),

            RuleMatcher::DomainKeyword(keyword) => domain
                .map(|h| {
                    h.to_ascii_lowercase()
                        .contains(&keyword.to_ascii_lowercase())
                })
                .unwrap_or(false),

            RuleMatcher::IpCidr(net) => ip.map(|addr| net.contains(&addr)).unwrap_or(false),

            RuleMatcher::GeoIp(cc) => match (ip, geoip) {
                (Some(addr), Some(resolver)) => resolver
                    .country_code(addr)
                    .map(|found| found.eq_ignore_ascii_case(cc))
                    .unwrap_or(false),
                _ => false,
            },

            RuleMatcher::DstPort(port) => dst_port == *port,

            RuleMatcher::Final => true,
        }
    }
}

/// One skipped or truncated line from a load
#[derive(Debug, Clone)]
pub struct RuleWarning {
    pub line: usize,
    pub detail: String,
}

/// Outcome of loading a rule file
#[derive(Debug, Default)]
pub struct RuleLoadReport {
    /// Rules accepted from the text (the synthetic FINAL is not counted)
    pub accepted: usize,
    pub warnings: Vec<RuleWarning>,
}

/// Ordered rule table with first-match evaluation
pub struct RuleEngine {
    rules: Vec<Rule>,
    geoip: Option<Box<dyn GeoIpResolver>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            geoip: None,
        }
    }

    /// Inject a GEOIP database. GEOIP rules are no-match without one.
    pub fn set_geoip_resolver(&mut self, resolver: Box<dyn GeoIpResolver>) {
        self.geoip = Some(resolver);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    /// Replace the table from rule text.
    ///
    /// Blank lines and `#` comments are skipped. Unknown TYPEs and malformed
    /// lines are collected as warnings; the load never fails outright. A
    /// missing FINAL is repaired with `FINAL,DIRECT`, and anything after the
    /// first FINAL is unreachable and therefore warned and dropped.
    pub fn load_from_text(&mut self, text: &str) -> RuleLoadReport {
        let mut rules = Vec::new();
        let mut report = RuleLoadReport::default();
        let mut saw_final = false;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            if line_no > MAX_RULE_LINES {
                report.warnings.push(RuleWarning {
                    line: line_no,
                    detail: format!("rule file truncated at {} lines", MAX_RULE_LINES),
                });
                break;
            }

            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if saw_final {
                report.warnings.push(RuleWarning {
                    line: line_no,
                    detail: "rule after FINAL is unreachable".into(),
                });
                continue;
            }

            match Self::parse_line(line) {
                Ok(Some(rule)) => {
                    if rule.matcher == RuleMatcher::Final {
                        saw_final = true;
                    }
                    rules.push(rule);
                    report.accepted += 1;
                }
                Ok(None) => report.warnings.push(RuleWarning {
                    line: line_no,
                    detail: format!("unknown rule type: {}", line),
                }),
                Err(detail) => report.warnings.push(RuleWarning {
                    line: line_no,
                    detail,
                }),
            }
        }

        if !saw_final {
            rules.push(Rule::new(RuleMatcher::Final, RouteAction::Direct));
        }

        self.rules = rules;
        report
    }

    /// Parse one non-comment line. Ok(None) means an unrecognized TYPE the
    /// grammar is permissive about.
    fn parse_line(line: &str) -> Result<Option<Rule>, String> {
        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if parts.len() < 2 {
            return Err(format!("malformed rule: {}", line));
        }

        let type_str = parts[0].to_ascii_uppercase();

        if type_str == "FINAL" {
            let action = RouteAction::parse(parts[1])
                .ok_or_else(|| format!("unknown action: {}", parts[1]))?;
            return Ok(Some(Rule::new(RuleMatcher::Final, action)));
        }

        if parts.len() < 3 {
            return Err(format!("{} rule requires a value and action", type_str));
        }

        let value = parts[1];
        let action =
            RouteAction::parse(parts[2]).ok_or_else(|| format!("unknown action: {}", parts[2]))?;

        let matcher = match type_str.as_str() {
            "DOMAIN" => RuleMatcher::Domain(value.to_string()),
            "DOMAIN-SUFFIX" => RuleMatcher::DomainSuffix(value.to_string()),
            "DOMAIN-KEYWORD" => RuleMatcher::DomainKeyword(value.to_string()),
            "IP-CIDR" | "IP-CIDR6" => {
                let net: IpNet = value
                    .parse()
                    .map_err(|e| format!("invalid CIDR {}: {}", value, e))?;
                RuleMatcher::IpCidr(net)
            }
            "GEOIP" => RuleMatcher::GeoIp(value.to_string()),
            "DST-PORT" => {
                let port: u16 = value
                    .parse()
                    .map_err(|e| format!("invalid port {}: {}", value, e))?;
                RuleMatcher::DstPort(port)
            }
            _ => return Ok(None),
        };

        Ok(Some(Rule::new(matcher, action)))
    }

    /// First-match evaluation. An empty table (never loaded) yields Direct.
    pub fn evaluate(&self, domain: Option<&str>, ip: Option<IpAddr>, dst_port: u16) -> RouteAction {
        self.evaluate_matched(domain, ip, dst_port).0
    }

    /// First-match evaluation returning the matched rule as well.
    pub fn evaluate_matched(
        &self,
        domain: Option<&str>,
        ip: Option<IpAddr>,
        dst_port: u16,
    ) -> (RouteAction, Option<&Rule>) {
        let geoip = self.geoip.as_deref();
        for rule in &self.rules {
            if rule.matches(domain, ip, dst_port, geoip) {
                return (rule.action, Some(rule));
            }
        }
        (RouteAction::Direct, None)
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}
