//! Delivery transports for the notification router.
//!
//! Thin HTTP clients behind the `Transport` trait: mail via a Resend-style
//! JSON API, push via a Pushover-style form API. Each `deliver` call maps to
//! exactly one provider request and one audit entry; retries and queueing
//! stay on the provider side.

pub mod mail;
pub mod push;

pub use mail::MailTransport;
pub use push::PushTransport;
