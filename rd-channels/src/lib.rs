//! Channel adapters for ResDesk.
//!
//! Adapters are pure I/O: they turn platform webhooks into `InboundMessage`
//! values and deliver `OutboundMessage` values back to the customer. Staff
//! alerts leave through the `StaffAlerter` seam.

mod alert;
mod log_adapter;
mod traits;
mod types;
mod whatsapp;

pub use alert::{StaffAlert, StaffAlerter, WebhookAlerter};
pub use log_adapter::LogAdapter;
pub use traits::ChannelAdapter;
pub use types::{Attachment, ChannelId, InboundMessage, MessageId, OutboundMessage, SenderId};
pub use whatsapp::{WhatsAppCloudAdapter, parse_webhook_payload};
