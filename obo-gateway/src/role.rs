//! Mapping of raw IdP role claims onto the internal role taxonomy.

use std::collections::BTreeSet;

use core::fmt;

/// Primary role taxonomy.
///
/// `Unassigned` is the fail-safe sentinel: a session holding it cannot pass
/// any authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
    Guest,
    Unassigned,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::Guest => "guest",
            Role::Unassigned => "unassigned",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-IdP mapping of raw role strings onto the taxonomy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleMappings {
    pub admin: BTreeSet<String>,
    pub user: BTreeSet<String>,
    pub guest: BTreeSet<String>,
    pub default_role: Option<Role>,
    pub reject_unmapped_roles: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleDecision {
    pub primary: Role,
    pub custom_roles: BTreeSet<String>,
    pub rejected: bool,
}

impl RoleDecision {
    fn rejected() -> Self {
        Self {
            primary: Role::Unassigned,
            custom_roles: BTreeSet::new(),
            rejected: true,
        }
    }
}

/// Decides the primary role for a set of raw IdP roles.
///
/// This function is total: it cannot fail, and a configuration that maps
/// nothing degrades to the `Unassigned`/rejected outcome rather than an
/// error. Tier priority is admin > user > guest; the first tier with a
/// matching raw role wins. Raw roles outside every mapped tier are carried
/// as custom roles.
pub fn map_roles(raw_roles: &[String], mappings: &RoleMappings) -> RoleDecision {
    let tiers: [(&BTreeSet<String>, Role); 3] = [
        (&mappings.admin, Role::Admin),
        (&mappings.user, Role::User),
        (&mappings.guest, Role::Guest),
    ];

    let primary = tiers
        .iter()
        .find(|(set, _)| raw_roles.iter().any(|role| set.contains(role)))
        .map(|(_, role)| *role);

    let custom_roles: BTreeSet<String> = raw_roles
        .iter()
        .filter(|role| tiers.iter().all(|(set, _)| !set.contains(*role)))
        .cloned()
        .collect();

    match primary {
        Some(primary) => RoleDecision {
            primary,
            custom_roles,
            rejected: false,
        },
        None if mappings.reject_unmapped_roles => RoleDecision::rejected(),
        None => match mappings.default_role.unwrap_or(Role::Unassigned) {
            // An Unassigned default must not smuggle privileges through
            // custom roles.
            Role::Unassigned => RoleDecision {
                primary: Role::Unassigned,
                custom_roles: BTreeSet::new(),
                rejected: false,
            },
            default_role => RoleDecision {
                primary: default_role,
                custom_roles,
                rejected: false,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    fn mappings() -> RoleMappings {
        RoleMappings {
            admin: set(&["idp-admins"]),
            user: set(&["idp-users", "idp-operators"]),
            guest: set(&["idp-guests"]),
            default_role: Some(Role::Guest),
            reject_unmapped_roles: false,
        }
    }

    #[test]
    fn admin_tier_wins_over_lower_tiers() {
        let decision = map_roles(&roles(&["idp-users", "idp-admins"]), &mappings());
        assert_eq!(decision.primary, Role::Admin);
        assert!(!decision.rejected);
        assert!(decision.custom_roles.is_empty());
    }

    #[test]
    fn unmapped_roles_become_custom_roles() {
        let decision = map_roles(&roles(&["idp-users", "developer", "auditor"]), &mappings());
        assert_eq!(decision.primary, Role::User);
        assert_eq!(decision.custom_roles, set(&["developer", "auditor"]));
    }

    #[test]
    fn strict_policy_rejects_unmapped_subjects() {
        let strict = RoleMappings {
            reject_unmapped_roles: true,
            ..mappings()
        };

        let decision = map_roles(&roles(&["developer"]), &strict);
        assert_eq!(decision.primary, Role::Unassigned);
        assert!(decision.custom_roles.is_empty());
        assert!(decision.rejected);
    }

    #[test]
    fn lenient_policy_falls_back_to_default_role() {
        let decision = map_roles(&roles(&["developer"]), &mappings());
        assert_eq!(decision.primary, Role::Guest);
        assert_eq!(decision.custom_roles, set(&["developer"]));
        assert!(!decision.rejected);
    }

    #[test]
    fn missing_default_degrades_to_unassigned_without_custom_roles() {
        let lenient = RoleMappings {
            default_role: None,
            ..mappings()
        };

        let decision = map_roles(&roles(&["developer"]), &lenient);
        assert_eq!(decision.primary, Role::Unassigned);
        assert!(decision.custom_roles.is_empty());
        assert!(!decision.rejected);
    }

    #[test]
    fn empty_raw_roles_follow_the_unmapped_policy() {
        let decision = map_roles(&[], &mappings());
        assert_eq!(decision.primary, Role::Guest);

        let strict = RoleMappings {
            reject_unmapped_roles: true,
            ..mappings()
        };
        assert!(map_roles(&[], &strict).rejected);
    }

    mod properties {
        use proptest::collection::{btree_set, vec};
        use proptest::prelude::*;

        use super::*;

        fn role_name() -> impl Strategy<Value = String> {
            "[a-z]{1,8}"
        }

        proptest! {
            #[test]
            fn unassigned_never_carries_custom_roles(
                raw in vec(role_name(), 0..8),
                admin in btree_set(role_name(), 0..4),
                user in btree_set(role_name(), 0..4),
                guest in btree_set(role_name(), 0..4),
                reject in any::<bool>(),
            ) {
                let mappings = RoleMappings {
                    admin,
                    user,
                    guest,
                    default_role: None,
                    reject_unmapped_roles: reject,
                };

                let decision = map_roles(&raw, &mappings);

                if decision.primary == Role::Unassigned {
                    prop_assert!(decision.custom_roles.is_empty());
                }

                if decision.rejected {
                    prop_assert_eq!(decision.primary, Role::Unassigned);
                }
            }
        }
    }
}
