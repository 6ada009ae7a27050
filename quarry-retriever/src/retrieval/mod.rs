pub mod build_status;
pub mod embedder;
pub mod engine;
pub mod lexical;
pub mod vector_index;

pub use build_status::{BuildOutcome, BuildPhase, BuildReport, BuildStatus, EngineState};
pub use engine::{RetrievalEngine, RetrievalMethod, RetrievalOptions, RetrievalResponse, RetrievedChunk};
pub use vector_index::{FlatIndex, SearchHit};
