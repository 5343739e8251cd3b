mod detector;
mod error;
mod index;
mod mm;
mod node;
mod platform;
mod report;
mod scanner;
mod settings;
mod system;
mod walker;

pub mod sim;

pub use detector::*;
pub use error::CheckError;
pub use index::{HashIndex, NIL, TrackingRecord};
pub use mm::*;
pub use node::*;
pub use platform::*;
pub use report::{LeakEntry, LeakReport};
pub use scanner::{MemRange, ReferenceScanner, probe_word_as_pointer};
pub use settings::*;
pub use walker::*;
