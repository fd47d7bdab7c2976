/// Who a generation runs for. Passed explicitly into every run; the core
/// keeps no ambient "current user".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Persisted account id. `None` for guest sessions, whose credits only
    /// live in `cached_credits`.
    pub user_id: Option<String>,
    pub cached_credits: i64,
}

impl Session {
    pub fn registered(user_id: impl Into<String>, cached_credits: i64) -> Self {
        Self {
            user_id: Some(user_id.into()),
            cached_credits,
        }
    }

    pub fn guest(credits: i64) -> Self {
        Self {
            user_id: None,
            cached_credits: credits,
        }
    }

    pub fn is_guest(&self) -> bool {
        self.user_id.is_none()
    }
}
