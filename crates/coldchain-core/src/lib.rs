pub mod alert;
pub mod notification;
pub mod protocol;
pub mod telemetry;

pub use alert::{evaluate, nearest_limit, AlertLevel, AlertThresholds, DEFAULT_WARNING_BAND};
pub use notification::{
    AlertNotification, AlertTransition, AlertType, EmailMessage, NotificationSettings,
    DEFAULT_EMAIL_TEMPLATE,
};
pub use protocol::{
    AgentMessage, AuthErrorPayload, AuthPayload, Envelope, FrameError, InstrumentCreatePayload,
    InstrumentCreatedPayload, ServerMessage, TemperatureReadingPayload, DEFAULT_MAX_FRAME_BYTES,
};
pub use telemetry::{
    slugify, Instrument, InstrumentType, InstrumentUpdate, InstrumentViewModel, NewInstrument,
    ReadingEvent, ReadingInput,
};
