//! Block-exchange reference implementation: wire framing, chunking, metadata and peer state.
//! Host-driven: no network I/O; the node passes events in and acts on the returned decisions.

pub mod chunk;
pub mod core;
pub mod integrity;
pub mod metadata;
pub mod protocol;
pub mod wire;

pub use crate::core::{AssemblyJob, BlockRequestError, MetadataUpdate, PeerCore, Role};
pub use chunk::{
    create_file_metadata, ChunkError, MetadataCreation, DEFAULT_BLOCK_SIZE, MAX_BLOCK_COUNT,
};
pub use integrity::compute_file_checksum;
pub use metadata::{
    load_metadata_file, parse_metadata_string, serialize_metadata, FileInfo, MetadataContent,
    MetadataError,
};
pub use protocol::{Message, MessageError, MessageType};
pub use wire::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError};
