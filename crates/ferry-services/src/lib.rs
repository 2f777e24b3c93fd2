//! ferry-services — registry store, mediator, flow control, and the
//! session coordinator that ties them together.

pub mod coordinator;
pub mod feed;
pub mod flow;
pub mod handler;
pub mod ledger;
pub mod mediator;
pub mod store;
pub mod sweeper;

pub use coordinator::{CoordinatorConfig, SessionCoordinator, SweepReport};
pub use feed::{PeerEvent, PeerFeed};
pub use flow::{Credit, CreditWindow};
pub use handler::ConnectionHandler;
pub use ledger::{Delivery, DeliveryLedger};
pub use mediator::{Mediator, MediatorError, MemoryMediator, Subscription};
pub use store::{MemoryStore, SessionStore, StoreError};
pub use sweeper::Sweeper;
