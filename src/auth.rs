use crate::error::{AppError, AppResult};
use uuid::Uuid;

/// Caller identity as established by the storefront's session layer
pub trait Identity: Send + Sync {
    /// `None` when the caller is not signed in
    fn current_user_id(&self) -> Option<Uuid>;
}

/// Identity carried by a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Session {
    user_id: Option<Uuid>,
}

impl Session {
    pub fn authenticated(user_id: Uuid) -> Self {
        Self { user_id: Some(user_id) }
    }

    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    /// Parse the user id forwarded by the session layer (e.g. a header value)
    pub fn from_header(value: Option<&str>) -> AppResult<Self> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::anonymous()),
            Some(raw) => Uuid::parse_str(raw)
                .map(Self::authenticated)
                .map_err(|e| AppError::Validation(format!("Invalid user id: {}", e))),
        }
    }
}

impl Identity for Session {
    fn current_user_id(&self) -> Option<Uuid> {
        self.user_id
    }
}

/// Resolve the caller or fail with `Unauthenticated`
pub fn authenticate(identity: &dyn Identity) -> AppResult<Uuid> {
    identity.current_user_id().ok_or(AppError::Unauthenticated)
}

/// Only the group leader may perform leader actions
pub fn require_leader(user_id: Uuid, leader_user_id: Uuid, action: &str) -> AppResult<()> {
    if user_id == leader_user_id {
        Ok(())
    } else {
        Err(AppError::Unauthorized(format!("only the group leader can {}", action)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_is_rejected() {
        let result = authenticate(&Session::anonymous());
        assert!(matches!(result, Err(AppError::Unauthenticated)));
    }

    #[test]
    fn test_authenticated_session() {
        let user = Uuid::new_v4();
        assert_eq!(authenticate(&Session::authenticated(user)).unwrap(), user);
    }

    #[test]
    fn test_session_from_header() {
        let user = Uuid::new_v4();
        let session = Session::from_header(Some(&user.to_string())).unwrap();
        assert_eq!(session.current_user_id(), Some(user));

        assert_eq!(Session::from_header(None).unwrap(), Session::anonymous());
        assert_eq!(Session::from_header(Some("  ")).unwrap(), Session::anonymous());
        assert!(Session::from_header(Some("not-a-uuid")).is_err());
    }

    #[test]
    fn test_require_leader() {
        let leader = Uuid::new_v4();
        assert!(require_leader(leader, leader, "cancel").is_ok());
        assert!(matches!(
            require_leader(Uuid::new_v4(), leader, "cancel"),
            Err(AppError::Unauthorized(_))
        ));
    }
}
