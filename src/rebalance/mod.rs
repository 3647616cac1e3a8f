pub mod executor;
pub mod finder;
pub mod request;
pub mod result;

pub use executor::Executor;
pub use request::{Mode, RebalanceRequest, Target};
pub use result::{RebalanceAttempt, RebalanceSummary, SummaryStatus};
