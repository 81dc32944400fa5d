//! Engine core: output thread, stream arena, sink lifecycle
//!
//! - `Engine`: public handle; starts and stops the output thread
//! - `StreamHandle`: producer-side access to one stream
//! - Output thread: pulls one frame per stream per cycle, mixes, feeds the sink
//! - Stream arena: generation-checked slots in creation order
//! - `gc`: deferred deallocation for streams and clips dropped on the output thread

mod arena;
mod engine;
pub(crate) mod gc;
mod handle;
mod mix;
mod output;
mod state;

pub use engine::Engine;
pub use handle::StreamHandle;
pub use state::OutputMode;
