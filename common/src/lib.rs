pub mod segment;

pub use segment::{
    BufferDescriptor, DEFAULT_NAMESPACE, DocumentError, Protocol, Segment, segment_key,
    server_name_from_key,
};
