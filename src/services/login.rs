use anyhow::{Result, bail};
use async_trait::async_trait;
use std::time::Duration;

use super::{LoginService, UserIdentity};

/// Logs in as the configured user.
///
/// The user comes from `login.user` (already overridden by `STAGEHAND_USER`
/// at config load). Failed attempts back off exponentially.
pub struct ConfigLoginService {
    user: Option<String>,
    max_attempts: u32,
    backoff: Duration,
}

impl ConfigLoginService {
    pub fn new(user: Option<String>, max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            user,
            max_attempts: max_attempts.max(1),
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    fn attempt(&self) -> Result<UserIdentity> {
        let user = self
            .user
            .clone()
            .or_else(|| std::env::var("STAGEHAND_USER").ok())
            .filter(|u| !u.trim().is_empty());
        match user {
            Some(id) => Ok(UserIdentity {
                display_name: id.clone(),
                id,
            }),
            None => bail!("No user configured: set login.user or STAGEHAND_USER"),
        }
    }
}

#[async_trait]
impl LoginService for ConfigLoginService {
    async fn login(&self) -> Result<UserIdentity> {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match self.attempt() {
                Ok(identity) => {
                    tracing::info!(user = %identity.id, attempt, "logged in");
                    return Ok(identity);
                }
                Err(e) if attempt < self.max_attempts => {
                    tracing::warn!(attempt, error = %e, "login failed, backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!("Login failed after {} attempts", attempt)));
                }
            }
        }
    }
}
