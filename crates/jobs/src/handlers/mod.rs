//! Built-in job handlers.

mod notification;
mod unsnooze;

pub use notification::NotificationJobHandler;
pub use unsnooze::UnsnoozeJobHandler;
