//! URL requests.
//!
//! A [`UrlRequest`] walks `NotStarted → {Redirect}* → ResponseStarted →
//! {ReadCompleted}* → Succeeded | Failed | Canceled`. The application drives
//! it with [`start`](UrlRequest::start), [`follow_redirect`](UrlRequest::follow_redirect),
//! [`read`](UrlRequest::read) and [`cancel`](UrlRequest::cancel); the engine
//! answers through a [`UrlRequestCallback`] run on the request's executor.
//!
//! Exactly one terminal event is delivered per request. The terminal slot
//! is claimed with a compare-and-set, so a `cancel()` racing a completion
//! either wins outright or is a no-op.

mod builder;
mod callback;
mod driver;
mod info;
mod request;
pub(crate) mod terminal;
mod tracker;

pub use builder::UrlRequestBuilder;
pub use callback::{RequestEvent, UrlRequestCallback};
pub use info::UrlResponseInfo;
pub use request::UrlRequest;
pub use terminal::Outcome;
pub use tracker::{FailureType, RequestTracker, ResponseStep};

pub(crate) use builder::{validate_parts, ValidatedRequest};
pub(crate) use callback::panic_to_error;
