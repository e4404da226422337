//! Collaborator contracts the engine is written against.

pub mod clock;
pub mod provider;
pub mod repository;

pub use clock::{Clock, ManualClock, SystemClock};
pub use provider::{EmailProvider, PushProvider, SendResult, SmsProvider};
pub use repository::{
    DeliveryLogRepository, NotificationRepository, QueueRepository, ScheduleRepository,
};
