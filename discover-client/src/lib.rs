//! Client for the discoverd agent.
//!
//! ```no_run
//! # async fn demo() -> Result<(), discover_client::ClientError> {
//! use std::collections::HashMap;
//! use discover_client::Client;
//!
//! let client = Client::connect("127.0.0.1:1112").await?;
//! client
//!     .register("web", "10.0.0.1:8080", HashMap::from([("zone".into(), "a".into())]))
//!     .await?;
//!
//! let set = client.query_services("web").await?;
//! set.wait_synced().await?;
//! for service in set.services() {
//!     println!("{} {:?}", service.addr, service.attrs);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod service_set;
pub mod sse;

pub use client::{Client, Registration, Subscription, DEFAULT_HEARTBEAT_INTERVAL};
pub use error::{ClientError, Result};
pub use service_set::ServiceSet;
pub use shared::types::{Attrs, Service, ServiceUpdate};
