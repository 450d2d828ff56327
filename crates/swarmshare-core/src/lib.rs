pub mod config;
pub mod content;
pub mod download;
pub mod ids;
pub mod latch;
pub mod library;
pub mod link;
pub mod node;
pub mod peer;
pub mod search;
pub mod server;
pub mod transport;
pub mod wire;

pub use config::{DownloadConfig, NodeConfig};
pub use content::{
    BLOCK_SIZE, BlockRange, FileDescriptor, block_count, block_range, block_ranges,
    describe_bytes, describe_file, read_range,
};
pub use download::{
    DownloadEngine, DownloadJob, DownloadProgress, FetchPolicy, JobState, PeerStats,
    ProgressListener,
};
pub use ids::{ContentHash, JobId, LinkId};
pub use latch::RoundLatch;
pub use library::{PARTIAL_SUFFIX, ShareLibrary, ShareSource};
pub use link::{
    AsyncIo, BoxedStream, EnvelopeSink, Inbound, PeerConnector, PeerLink, TcpConnector,
};
pub use node::{Node, NodeHandle};
pub use peer::PeerAddr;
pub use search::{HitGroup, SearchCoordinator, SearchListener, SearchResults, SearchRound};
pub use server::{RequestDispatcher, bind_with_retry};
pub use transport::{
    HANDSHAKE_TIMEOUT, handshake_initiator, handshake_responder, read_envelope, write_envelope,
};
pub use wire::{
    Command, ConnectionAck, ConnectionRequest, DownloadMessage, DownloadResult, Echo, Envelope,
    FileSearchResult, MAX_ENVELOPE_BYTES, MAX_ENVELOPE_PAYLOAD_BYTES, SearchHit, Terminate,
    WirePayload, WordSearchMessage,
};
