mod mode;
mod registry;
mod selection;

pub use mode::Mode;
pub use registry::{ModeRegistry, PromptSpec, SchemaKind};
pub use selection::ModeSelection;
