use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

/// One shared password for every login. The user name is kept: it becomes
/// the actor that owns cabins and bookings created on the connection.
#[derive(Debug)]
pub struct CabinAuthSource {
    password: String,
}

impl CabinAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for CabinAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if login.user().is_none_or(|u| u.is_empty()) {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "a user name is required".into(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
