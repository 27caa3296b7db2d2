//! Upstream drivers: the two ways a request actually reaches Anthropic.
//!
//! `OAuthDriver` speaks the public `/v1/messages` API with a Bearer token.
//! `WebDriver` emulates the claude.ai web UI through a create/send/delete
//! conversation dance. Both sit behind the `Driver` trait so the
//! orchestrator never branches on which path it's using.

pub mod closer;
pub mod driver;
pub mod error;
pub mod oauth_driver;
pub mod web_driver;

pub use closer::WebConversationCloser;
pub use driver::{Driver, DriverRequest, DriverResponse, SessionContext};
pub use error::{Error, Result};
pub use oauth_driver::OAuthDriver;
pub use web_driver::WebDriver;
