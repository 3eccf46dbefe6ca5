//! Session admission
//!
//! Token verification lives in the external socket layer; what arrives here
//! are the verified claims. Admission then enforces two local checks: the
//! client address must satisfy the IP allow/deny rules, and the token's
//! user must appear enabled in the configured user list (an empty list
//! leaves the daemon open).

use cncd_core::{AuthError, Result};
use cncd_settings::AccessSettings;
use std::net::IpAddr;

/// Verified bearer-token claims
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClaims {
    /// Stable user id.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// Match an address against one rule pattern
///
/// Patterns are exact addresses or prefix globs (`192.168.1.*`); a lone `*`
/// matches everything.
fn ip_matches(pattern: &str, addr: &IpAddr) -> bool {
    let pattern = pattern.trim();
    if pattern == "*" {
        return true;
    }
    let addr = addr.to_string();
    match pattern.strip_suffix('*') {
        Some(prefix) => addr.starts_with(prefix),
        None => addr == pattern,
    }
}

/// Check a session against the configured access rules
pub fn check_access(access: &AccessSettings, claims: &SessionClaims, addr: IpAddr) -> Result<()> {
    if access.denied_ips.iter().any(|p| ip_matches(p, &addr)) {
        return Err(AuthError::IpBlocked {
            addr: addr.to_string(),
        }
        .into());
    }

    if !access.allowed_ips.is_empty() && !access.allowed_ips.iter().any(|p| ip_matches(p, &addr)) {
        return Err(AuthError::IpBlocked {
            addr: addr.to_string(),
        }
        .into());
    }

    if !access.users.is_empty() {
        let known = access
            .users
            .iter()
            .find(|u| u.id == claims.id && u.name == claims.name);
        match known {
            Some(user) if user.enabled => {}
            _ => {
                return Err(AuthError::UserDisabled {
                    name: claims.name.clone(),
                }
                .into())
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cncd_settings::UserRecord;

    fn claims() -> SessionClaims {
        SessionClaims {
            id: "u1".into(),
            name: "operator".into(),
        }
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn open_config_admits_anyone() {
        let access = AccessSettings::default();
        assert!(check_access(&access, &claims(), addr("10.0.0.7")).is_ok());
    }

    #[test]
    fn deny_rules_win() {
        let access = AccessSettings {
            denied_ips: vec!["10.0.0.*".into()],
            allowed_ips: vec!["*".into()],
            users: Vec::new(),
        };
        assert!(check_access(&access, &claims(), addr("10.0.0.7")).is_err());
        assert!(check_access(&access, &claims(), addr("192.168.1.2")).is_ok());
    }

    #[test]
    fn allow_list_restricts() {
        let access = AccessSettings {
            denied_ips: Vec::new(),
            allowed_ips: vec!["192.168.1.*".into()],
            users: Vec::new(),
        };
        assert!(check_access(&access, &claims(), addr("192.168.1.50")).is_ok());
        assert!(check_access(&access, &claims(), addr("10.0.0.7")).is_err());
    }

    #[test]
    fn user_list_enforced_when_nonempty() {
        let mut access = AccessSettings::default();
        access.users.push(UserRecord {
            id: "u1".into(),
            name: "operator".into(),
            enabled: true,
        });
        assert!(check_access(&access, &claims(), addr("10.0.0.7")).is_ok());

        access.users[0].enabled = false;
        assert!(check_access(&access, &claims(), addr("10.0.0.7")).is_err());

        let stranger = SessionClaims {
            id: "u2".into(),
            name: "guest".into(),
        };
        access.users[0].enabled = true;
        assert!(check_access(&access, &stranger, addr("10.0.0.7")).is_err());
    }
}
