//! The on-disk record format shared by the proxy and the mock server.
//!
//! The proxy writes records and never reads them; the mock server reads
//! records and never writes them. A record written by [`writer::RecordWriter`]
//! round-trips through [`codec::parse_record`] to a [`MockResponse`] that is
//! identical in every field the replay engine consumes.

mod codec;
mod not_found;
mod types;
mod writer;

pub use codec::{load_from_file, normalize_content_type, parse_record, SSE_CONTENT_TYPE};
pub use not_found::NotFoundLogger;
pub use types::{MockResponse, RecordError, SseEvent, StoredHeader};
pub use writer::{
    generate_request_id, sanitize_content_type, CapturedEvent, CapturedRequest, CapturedResponse,
    RecordWriter,
};
