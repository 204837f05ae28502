pub mod access;
pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod exception;
pub mod files;
pub mod guard;
pub mod json;
pub mod listener;
pub mod param;
pub mod payload;
pub mod request;
pub mod resolver;
pub mod response;
pub mod router;
pub mod session;
pub mod util;

pub use cache::FileCache;
pub use client::{OutboundHandle, OutboundManager, OutboundRequest, OutboundResponse};
pub use config::Config;
pub use connection::Observer;
pub use context::Context;
pub use exception::Exception;
pub use files::static_handler;
pub use guard::{AddressPolicy, MimeLookup, MimeTable, OpenPolicy, PathSandbox, RootSandbox};
pub use listener::Server;
pub use param::HttpRequestMethod;
pub use payload::{Bitmap, Payload};
pub use request::Request;
pub use response::Response;
pub use router::{Handler, RouteRegistry};
pub use util::HtmlBuilder;
