use std::io;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// One shared connection password. Who is booking is carried by the
/// `user_id` of each request, not by the login.
#[derive(Debug)]
pub struct FleetslotAuthSource {
    password: String,
}

impl FleetslotAuthSource {
    /// An empty password would let any client in, so it is refused.
    pub fn new(password: String) -> io::Result<Self> {
        if password.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "FLEETSLOT_PASSWORD must not be empty",
            ));
        }
        Ok(Self { password })
    }
}

#[async_trait]
impl AuthSource for FleetslotAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
