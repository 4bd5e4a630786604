//! Command dispatch: the action router, built-in device handlers, the
//! tool-result correlation registry and the LLM loop engine.

mod engine;
pub mod handlers;
mod registry;
mod router;

pub use engine::{CommandDispatcher, clean_reply, extract_command_blocks};
pub use handlers::{CaptureSwitch, HandlerRegistry, InboundRouter, VisionSlot};
pub use registry::PendingTools;
pub use router::{ActionRouter, ArgTemplate};
