use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use ulid::Ulid;

use crate::engine::Directory;
use crate::model::Caller;

/// Shared connection password. Identity comes from the login name, see `resolve_session`.
#[derive(Debug)]
pub struct SlotbookAuthSource {
    password: String,
}

impl SlotbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Who is issuing statements on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    /// Maintains the directory; may also read public listings.
    Operator,
    Caller(Caller),
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    MissingUser,
    MalformedUser(String),
    UnknownUser(Ulid),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingUser => write!(f, "no user name given at startup"),
            AuthError::MalformedUser(u) => write!(f, "user name {u:?} is not a user id"),
            AuthError::UnknownUser(id) => write!(f, "unknown user {id}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Map a login name to a session: the operator name, or a registered user's id.
pub fn resolve_session(
    login: Option<&str>,
    operator: &str,
    directory: &impl Directory,
) -> Result<Session, AuthError> {
    let login = login.map(str::trim).filter(|l| !l.is_empty()).ok_or(AuthError::MissingUser)?;
    if login == operator {
        return Ok(Session::Operator);
    }
    let user_id =
        Ulid::from_string(login).map_err(|_| AuthError::MalformedUser(login.to_string()))?;
    directory
        .resolve_caller(user_id)
        .map(Session::Caller)
        .map_err(|_| AuthError::UnknownUser(user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct StaticDirectory {
        users: HashMap<Ulid, UserRecord>,
        professionals: HashMap<Ulid, ProfessionalRecord>,
    }

    impl Directory for StaticDirectory {
        fn find_user_by_id(&self, id: Ulid) -> Option<UserRecord> {
            self.users.get(&id).cloned()
        }

        fn find_professional_by_user_id(&self, user_id: Ulid) -> Option<ProfessionalRecord> {
            self.professionals.values().find(|p| p.user_id == user_id).cloned()
        }

        fn find_professional_by_id(&self, id: Ulid) -> Option<ProfessionalRecord> {
            self.professionals.get(&id).cloned()
        }
    }

    fn directory() -> (StaticDirectory, Ulid, Ulid, Ulid) {
        let mut dir = StaticDirectory::default();
        let client = Ulid::new();
        let pro_user = Ulid::new();
        let pid = Ulid::new();
        dir.users.insert(client, UserRecord { id: client, role: UserRole::User });
        dir.users.insert(pro_user, UserRecord { id: pro_user, role: UserRole::Professional });
        dir.professionals
            .insert(pid, ProfessionalRecord { id: pid, user_id: pro_user, name: None });
        (dir, client, pro_user, pid)
    }

    #[test]
    fn operator_login() {
        let (dir, ..) = directory();
        assert_eq!(resolve_session(Some("slotbook"), "slotbook", &dir), Ok(Session::Operator));
    }

    #[test]
    fn user_logins_resolve_roles() {
        let (dir, client, pro_user, pid) = directory();
        assert_eq!(
            resolve_session(Some(&client.to_string()), "slotbook", &dir),
            Ok(Session::Caller(Caller::client(client)))
        );
        assert_eq!(
            resolve_session(Some(&pro_user.to_string()), "slotbook", &dir),
            Ok(Session::Caller(Caller { user_id: pro_user, role: Role::Professional(pid) }))
        );
    }

    #[test]
    fn bad_logins() {
        let (dir, ..) = directory();
        assert_eq!(resolve_session(None, "slotbook", &dir), Err(AuthError::MissingUser));
        assert_eq!(resolve_session(Some("  "), "slotbook", &dir), Err(AuthError::MissingUser));
        assert!(matches!(
            resolve_session(Some("postgres"), "slotbook", &dir),
            Err(AuthError::MalformedUser(_))
        ));
        let stranger = Ulid::new();
        assert_eq!(
            resolve_session(Some(&stranger.to_string()), "slotbook", &dir),
            Err(AuthError::UnknownUser(stranger))
        );
    }
}
