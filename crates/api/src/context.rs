use storefront_core::UserId;

/// Authenticated caller for a request.
///
/// Inserted as a request extension by the authentication layer in front of
/// this service. Requests without it are treated as anonymous.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UserContext {
    user_id: UserId,
}

impl UserContext {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}
