//! Chat notifications: formatting, topic provisioning, and rate-limited
//! delivery.

pub mod queue;
pub mod telegram;

pub use queue::{NotificationQueue, NotifierQueueStats, QueuedNotification};
pub use telegram::TelegramNotifier;
