//! # cronet
//!
//! A callback-driven HTTP request engine for Rust.
//!
//! An [`Engine`] owns a network thread. Applications create URL requests and
//! bidirectional streams from it, drive them step by step, and receive every
//! state change through a callback run on an executor of their choosing.
//!
//! ## Features
//!
//! - **URL requests**: redirects held until followed, caller-paced reads
//!   into reusable [`ByteBuffer`]s, exactly one terminal callback
//! - **Uploads**: pull-based [`UploadDataProvider`](upload::UploadDataProvider)
//!   with fixed-length or chunked bodies, rewound on redirects
//! - **Bidirectional streams**: explicit write/flush with ordered
//!   write acknowledgements, response trailers
//! - **Status queries**: the current [`LoadState`] of any request
//! - **Pluggable transport**: hyper-based HTTP/1.1 by default, a scripted
//!   in-memory transport for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cronet::executor::ThreadExecutor;
//! use cronet::urlrequest::RequestTracker;
//! use cronet::Engine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new()?;
//!     let executor = ThreadExecutor::new("callbacks")?;
//!     let tracker = RequestTracker::new();
//!     let request = engine
//!         .new_url_request_builder("http://example.com/", tracker.clone(), executor)
//!         .build();
//!     request.start()?;
//!     tracker.done().await;
//!     println!("{}", tracker.response_as_string());
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Errors, load states and byte buffers
//! - [`executor`] - Executors and the per-request task queue
//! - [`urlrequest`] - URL requests and their callbacks
//! - [`upload`] - Request bodies
//! - [`bidi`] - Bidirectional streams
//! - [`transport`] - The network side: HTTP and scripted transports
//! - [`config`] - Engine configuration

pub mod base;
pub mod bidi;
pub mod config;
pub mod engine;
pub mod executor;
pub mod transport;
pub mod upload;
pub mod urlrequest;

pub use base::{ByteBuffer, LoadState, NetError, RequestStatus};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
