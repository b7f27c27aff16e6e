use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::AuthResult;

/// Outbound mail boundary, swappable by test doubles.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_verification(&self, email: &str, token: &str) -> AuthResult<()>;
    async fn send_password_reset(&self, email: &str, token: &str) -> AuthResult<()>;
}

/// Logs instead of sending. The real transport lives outside this core.
pub struct LoggingMailer;

#[async_trait]
impl Mailer for LoggingMailer {
    async fn send_verification(&self, email: &str, token: &str) -> AuthResult<()> {
        info!(email, "verification email queued");
        debug!(token, "verification token");
        Ok(())
    }

    async fn send_password_reset(&self, email: &str, token: &str) -> AuthResult<()> {
        info!(email, "password reset email queued");
        debug!(token, "password reset token");
        Ok(())
    }
}
