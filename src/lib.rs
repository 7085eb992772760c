//! A bidirectional message-passing IPC core over local seqpacket sockets.
//!
//! Two peers exchange requests (expecting a response), notifications (no
//! response), and responses over a single duplex socket that also carries
//! OS file descriptors as ancillary data. See `SPEC_FULL.md` for the full
//! design; this crate is organized bottom-up:
//!
//! - [`fd`] — an owned/borrowed file descriptor handle.
//! - [`error`] — the error taxonomy every fallible entry point returns.
//! - [`util`] — the wrapped request-number counter and the oneshot result
//!   cell used to correlate requests with responses.
//! - [`codec`] — the self-describing value domain and its wire encoding.
//! - [`transport`] — seqpacket framing with FD ancillary data.
//! - [`connection`] — the duplex, multiplexing connection state machine.
//! - [`listener`] — the accept loop that runs each connection on its own
//!   thread.

pub mod codec;
pub mod connection;
pub mod error;
pub mod fd;
pub mod listener;
pub mod transport;
pub mod util;

pub use codec::{decode, encode, OrderedMap, Value};
pub use connection::{Connection, Flags, NotificationHandler, RequestHandler};
pub use error::{CodecError, DecoderError, EncoderError, IpcError, TransportError};
pub use fd::Fd;
pub use listener::{ErrorHandler, Listener};
pub use transport::Address;
