pub mod backpressure;
pub mod balancer;
pub mod encoding;
pub mod flow;
pub mod frame;
pub mod head;
pub mod origin;
pub mod router;

pub use backpressure::{Directive, Governor};
pub use balancer::{Balancer, Lease, StrategyKind};
pub use flow::{ConnectionFlow, FlushMode, StreamState};
pub use frame::{Frame, FrameDecoder, FrameKind};
pub use router::{RouteOutcome, RouteTable, Router};
