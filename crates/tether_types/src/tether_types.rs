//! Tether Types - values that cross the host/worker boundary
//!
//! - [`Value`]: the value model, with shared mutable objects
//! - [`codec`]: the graph codec producing a flat, id-referenced [`Wire`] form
//! - [`StoredValue`]: kind-tagged records for key-value persistence

pub mod codec;
mod error;
mod stored;
mod value;

pub use codec::{decode, encode, Slot, Wire, WireObject};
pub use error::CodecError;
pub use stored::StoredValue;
pub use value::{HandleId, NativeFunction, Object, ObjectRef, Value};
