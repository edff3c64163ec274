//! One-time code delivery (SMS / email).
//!
//! Delivery failures surface as `ExternalProvider` errors; the login flow
//! turns them into a failed factor rather than an aborted request.

use async_trait::async_trait;
use tracing::info;

use crate::Result;

/// Where a one-time code goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Sms(String),
    Email(String),
}

#[async_trait]
pub trait NotificationProvider: Send + Sync {
    async fn send_otp(&self, destination: &Destination, code: &str) -> Result<()>;
}

/// Local dev provider that logs instead of delivering.
#[derive(Clone, Debug)]
pub struct LogNotificationProvider;

#[async_trait]
impl NotificationProvider for LogNotificationProvider {
    async fn send_otp(&self, destination: &Destination, code: &str) -> Result<()> {
        match destination {
            Destination::Sms(phone) => info!(phone = %phone, code = %code, "sms otp send stub"),
            Destination::Email(email) => {
                info!(email = %email, code = %code, "email otp send stub");
            }
        }
        Ok(())
    }
}
