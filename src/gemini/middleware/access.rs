//! IP-based access control. Deny entries always win, then a non-empty
//! allow list acts as a whitelist, then the default policy applies.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::config::AccessControlConfig;
use crate::error::ConfigError;
use crate::gemini::middleware::{Middleware, Verdict};
use crate::gemini::response::Response;
use crate::gemini::status::Status;
use crate::gemini::Request;

pub struct AccessControl {
    enabled: bool,
    allow: Vec<IpNet>,
    deny: Vec<IpNet>,
    default_allow: bool,
}

impl AccessControl {
    pub fn from_config(config: &AccessControlConfig) -> Result<AccessControl, ConfigError> {
        Ok(AccessControl {
            enabled: config.enabled,
            allow: parse_nets(&config.allow_list)?,
            deny: parse_nets(&config.deny_list)?,
            default_allow: config.default_allow,
        })
    }

    fn decide(&self, ip: IpAddr) -> bool {
        if !self.enabled {
            return true;
        }
        if self.deny.iter().any(|net| net.contains(&ip)) {
            return false;
        }
        if !self.allow.is_empty() {
            return self.allow.iter().any(|net| net.contains(&ip));
        }
        self.default_allow
    }
}

impl Middleware for AccessControl {
    fn name(&self) -> &'static str {
        "access_control"
    }

    fn process(&self, request: &Request) -> Verdict {
        if self.decide(request.peer_ip) {
            Verdict::Allow
        } else {
            Verdict::Reject(Response::new(Status::ProxyRequestRefused, "Access denied"))
        }
    }
}

/// Accepts CIDR blocks and bare addresses (treated as /32 or /128).
fn parse_nets(entries: &[String]) -> Result<Vec<IpNet>, ConfigError> {
    entries
        .iter()
        .map(|entry| {
            entry
                .parse::<IpNet>()
                .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
                .map_err(|_| ConfigError::Invalid(format!("bad CIDR entry {:?}", entry)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::GeminiUrl;

    fn request(ip: &str) -> Request {
        Request::new(
            GeminiUrl::parse("gemini://example.org/").unwrap(),
            ip.parse().unwrap(),
            None,
        )
    }

    fn control(
        enabled: bool,
        allow: &[&str],
        deny: &[&str],
        default_allow: bool,
    ) -> AccessControl {
        AccessControl::from_config(&AccessControlConfig {
            enabled,
            allow_list: allow.iter().map(|s| s.to_string()).collect(),
            deny_list: deny.iter().map(|s| s.to_string()).collect(),
            default_allow,
        })
        .unwrap()
    }

    #[test]
    fn disabled_control_accepts_everything() {
        let ac = control(false, &[], &["0.0.0.0/0"], false);
        assert!(matches!(ac.process(&request("10.0.0.1")), Verdict::Allow));
    }

    #[test]
    fn deny_wins_over_allow() {
        let ac = control(true, &["10.0.0.0/8"], &["10.0.0.5/32"], true);
        assert!(matches!(ac.process(&request("10.0.0.1")), Verdict::Allow));
        match ac.process(&request("10.0.0.5")) {
            Verdict::Reject(resp) => {
                assert_eq!(resp.status(), 53);
                assert_eq!(resp.meta(), "Access denied");
            }
            Verdict::Allow => panic!("denied address was allowed"),
        }
    }

    #[test]
    fn nonempty_allow_list_is_a_whitelist() {
        let ac = control(true, &["192.168.1.0/24"], &[], true);
        assert!(matches!(
            ac.process(&request("192.168.1.77")),
            Verdict::Allow
        ));
        // default_allow does not apply while the allow list is non-empty
        assert!(matches!(
            ac.process(&request("192.168.2.1")),
            Verdict::Reject(_)
        ));
    }

    #[test]
    fn default_policy_applies_when_no_list_matches() {
        let deny_only = control(true, &[], &["10.0.0.0/8"], true);
        assert!(matches!(
            deny_only.process(&request("172.16.0.1")),
            Verdict::Allow
        ));

        let strict = control(true, &[], &[], false);
        assert!(matches!(
            strict.process(&request("172.16.0.1")),
            Verdict::Reject(_)
        ));
    }

    #[test]
    fn bare_addresses_and_ipv6_entries_parse() {
        let ac = control(true, &[], &["10.0.0.9", "fd00::/8"], true);
        assert!(matches!(ac.process(&request("10.0.0.9")), Verdict::Reject(_)));
        assert!(matches!(ac.process(&request("fd00::1")), Verdict::Reject(_)));
        assert!(matches!(ac.process(&request("10.0.0.8")), Verdict::Allow));
    }

    #[test]
    fn bad_cidr_entries_fail_construction() {
        let result = AccessControl::from_config(&AccessControlConfig {
            enabled: true,
            allow_list: vec!["not-a-network".into()],
            deny_list: vec![],
            default_allow: true,
        });
        assert!(result.is_err());
    }
}
