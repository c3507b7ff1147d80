//! Transport layer module.

pub mod buffered;
pub mod mock;
pub mod observable;
pub mod serial;
pub mod traits;

pub use buffered::BufferedChannel;
pub use mock::MockChannel;
pub use observable::ObservableChannel;
pub use serial::SerialChannel;
pub use traits::{Channel, TransportError};
