mod anchor;
mod key_source;
mod multi_reconciler;
mod plan;
mod reconciler;
mod registry;
mod resilient_registry;
#[cfg(test)]
mod test_utils;

pub use anchor::*;
pub use key_source::*;
pub use multi_reconciler::*;
pub use plan::*;
pub use reconciler::*;
pub use registry::*;
pub use resilient_registry::*;
