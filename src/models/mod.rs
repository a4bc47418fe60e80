pub mod rate_limit;
pub mod security;

pub use rate_limit::{
    BlockRecord, Decision, IpStatus, OperationFlags, RateWindowCounter, TierStatus,
    ViolationRecord,
};
pub use security::{SecurityEvent, ViolationType};
