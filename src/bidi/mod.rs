//! Bidirectional streams.
//!
//! A [`BidirectionalStream`] is a request whose body is written
//! incrementally while the response is read. After
//! [`StreamEvent::StreamReady`] the application queues buffers with
//! [`write`](BidirectionalStream::write) and sends them with
//! [`flush`](BidirectionalStream::flush); each buffer comes back, in
//! submission order, with [`StreamEvent::WriteCompleted`]. The read side
//! works like a URL request except that the end of the body is reported as a
//! final read with `end_of_stream` set.
//!
//! A stream succeeds once the read side reached its end and every written
//! buffer, including the end-of-stream one, was acknowledged.

mod builder;
mod callback;
mod driver;
mod stream;
mod tracker;

pub use builder::BidirectionalStreamBuilder;
pub use callback::{BidirectionalStreamCallback, StreamEvent};
pub use stream::BidirectionalStream;
pub use tracker::{StreamStep, StreamTracker};
