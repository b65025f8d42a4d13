//! Role and session policy. Every handler goes through [`authorize`] and
//! every redirect decision through [`resolve_landing_route`]; no screen
//! re-implements its own gate.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Teacher,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "teacher" => Some(Self::Teacher),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Teacher => "teacher",
        }
    }
}

/// The authenticated caller, installed by auth.login and held explicitly
/// in AppState rather than read from ambient global state.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub role: Role,
}

pub const LOGIN_ROUTE: &str = "/auth/login";
pub const ADMIN_HOME: &str = "/dashboard";
pub const TEACHER_HOME: &str = "/teacher/dashboard";

/// Where a user lands after authentication. Deactivated accounts always
/// land back on the login surface.
pub fn resolve_landing_route(role: Role, is_active: bool) -> &'static str {
    if !is_active {
        return LOGIN_ROUTE;
    }
    match role {
        Role::Admin => ADMIN_HOME,
        Role::Teacher => TEACHER_HOME,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    Unauthenticated,
    Forbidden { required: Role, actual: Role },
}

/// The single role gate. `required` of None admits any authenticated
/// session.
pub fn authorize(session: Option<&Session>, required: Option<Role>) -> Result<&Session, AuthError> {
    let session = session.ok_or(AuthError::Unauthenticated)?;
    if let Some(required) = required {
        if session.role != required {
            return Err(AuthError::Forbidden {
                required,
                actual: session.role,
            });
        }
    }
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(role: Role) -> Session {
        Session {
            user_id: "u1".to_string(),
            role,
        }
    }

    #[test]
    fn landing_routes_follow_role_and_active_flag() {
        assert_eq!(resolve_landing_route(Role::Admin, true), ADMIN_HOME);
        assert_eq!(resolve_landing_route(Role::Teacher, true), TEACHER_HOME);
        assert_eq!(resolve_landing_route(Role::Admin, false), LOGIN_ROUTE);
        assert_eq!(resolve_landing_route(Role::Teacher, false), LOGIN_ROUTE);
    }

    #[test]
    fn authorize_rejects_missing_session() {
        assert_eq!(
            authorize(None, Some(Role::Admin)).unwrap_err(),
            AuthError::Unauthenticated
        );
        assert_eq!(authorize(None, None).unwrap_err(), AuthError::Unauthenticated);
    }

    #[test]
    fn authorize_enforces_required_role_both_ways() {
        let teacher = session(Role::Teacher);
        assert_eq!(
            authorize(Some(&teacher), Some(Role::Admin)).unwrap_err(),
            AuthError::Forbidden {
                required: Role::Admin,
                actual: Role::Teacher
            }
        );

        let admin = session(Role::Admin);
        assert_eq!(
            authorize(Some(&admin), Some(Role::Teacher)).unwrap_err(),
            AuthError::Forbidden {
                required: Role::Teacher,
                actual: Role::Admin
            }
        );

        assert!(authorize(Some(&admin), Some(Role::Admin)).is_ok());
        assert!(authorize(Some(&teacher), None).is_ok());
    }

    #[test]
    fn role_parse_round_trips() {
        assert_eq!(Role::parse("admin"), Some(Role::Admin));
        assert_eq!(Role::parse("teacher"), Some(Role::Teacher));
        assert_eq!(Role::parse("principal"), None);
        for role in [Role::Admin, Role::Teacher] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
    }
}
