//! Outbound throughput throttling for Tokio listeners.
//!
//! Wrap a listener once and every accepted connection is paced on write by two independent
//! caps, both expressed in **bytes per second**:
//!
//! - a **global** cap shared by every connection accepted from the same listener;
//! - a **per-connection** cap, seeded from the listener's default at accept time and
//!   adjustable per connection afterwards.
//!
//! Both caps can be changed at runtime. A cap that was never configured is unlimited and
//! never blocks.
//!
//! ```no_run
//! use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
//! use tokio_throttle::ThrottledListener;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let listener = ThrottledListener::bind("127.0.0.1:7777").await?;
//! listener.set_limits(3 * 1024 * 1024, 1024 * 1024);
//!
//! loop {
//!     let (conn, _) = listener.accept().await?;
//!     tokio::spawn(async move {
//!         let mut conn = BufReader::new(conn);
//!         let mut line = String::new();
//!         while conn.read_line(&mut line).await.unwrap_or(0) > 0 {
//!             let _ = conn.write_all(line.as_bytes()).await; // echo, paced
//!             line.clear();
//!         }
//!     });
//! }
//! # }
//! ```
//!
//! ## Modules
//! - [`bucket`]: the token bucket both caps are built on.
//! - [`listener`]: [`ThrottledListener`], owner of the global cap.
//! - [`connection`]: [`ThrottledConnection`], the write-pacing stream wrapper.
//! - [`scope`]: [`CancelScope`], bounding how long a write may wait.
//! - [`io`]: the [`Accept`](io::Accept) abstraction, abortive close and extension traits.
//! - [`utils`]: byte accounting helpers.
pub mod bucket;
pub mod connection;
pub mod error;
pub mod io;
pub mod listener;
pub mod scope;
pub mod utils;

pub use bucket::{Limit, TokenBucket, DEFAULT_BURST};
pub use connection::{LimitHandle, ThrottledConnection};
pub use error::{Canceled, ConnectionClosed, LimitError, ThrottleCanceled};
pub use listener::ThrottledListener;
pub use scope::CancelScope;
