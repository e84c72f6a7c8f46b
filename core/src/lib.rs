//! Client-side access layer for a CRM REST backend.
//!
//! # Overview
//! Builds canonical request urls, attaches authentication headers, and
//! recovers from expired access tokens by parking in-flight requests,
//! refreshing credentials once, and replaying the parked requests in their
//! original order.
//!
//! # Design
//! - The core never touches the network (host-does-IO). `Dispatcher` emits
//!   `Action`s; the host executes them and reports `TransportOutcome`s back.
//! - One `Dispatcher` per session, passed to whoever needs it. All mutable
//!   state (credentials, refresh queue, bulk batches, contextual state) lives
//!   on that instance.
//! - Token persistence and cross-instance refresh coordination are traits
//!   injected at build time.

pub mod api;
mod bulk;
pub mod callbacks;
pub mod config;
pub mod coordination;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod request;
pub mod store;
pub mod url;

pub use api::{FileUrlOptions, LoginCredentials, RelationshipData};
pub use callbacks::{ApiResponse, Callbacks, Completion};
pub use config::{DispatcherConfig, StoreKeys};
pub use coordination::{CoordinationChannel, CoordinationEvent, RefreshSignal};
pub use dispatcher::{Action, Credentials, Dispatcher, DispatcherBuilder};
pub use error::{ApiError, ConfigError, HttpError, INVALID_GRANT};
pub use http::{Body, HttpMethod, HttpRequest, HttpResponse, Method, TransportOutcome};
pub use request::{CallOptions, Payload, PendingRequest, RequestId};
pub use store::{MemoryTokenStore, StoreInit, StoreOp, TokenStore};
pub use url::{Link, UrlAttributes, UrlBuilder};
