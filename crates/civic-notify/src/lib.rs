//! Durable notification inbox and live delivery.
//!
//! A notification is persisted first and pushed second. The stored row is the
//! source of truth: a client that was offline, or whose live connection
//! dropped the push, still finds the notification in its inbox.
//!
//! Every notification has exactly one recipient. Fan-out to several people
//! is the caller's job and produces one row per person.

mod dispatcher;
mod error;
mod model;
mod store;

pub use dispatcher::{NotificationDispatcher, NOTIFICATION_EVENT};
pub use error::NotifyError;
pub use model::{NewNotification, Notification, RelatedEntity};
pub use store::{create, delete, get, list, mark_all_read, mark_read};

#[cfg(test)]
mod tests;
